//! elims-mqtt command line client
//!
//! Publishes one message through a publisher pool, or prints messages
//! matching a pattern until Ctrl-C.

use clap::{Parser, Subcommand};
use elims_mqtt::config::{MqttConfig, MqttSettings};
use elims_mqtt::observability::init_default_logging;
use elims_mqtt::pool::{PoolSettings, PublisherPool};
use elims_mqtt::protocol::{qos_from_u8, Payload};
use elims_mqtt::transport::mqtt::{Subscriber, DEFAULT_CONNECT_TIMEOUT};
use elims_mqtt::{MqttError, QoS, ValidationError};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "elims-mqtt")]
#[command(about = "MQTT publish/subscribe client for ELIMS devices")]
#[command(version)]
struct Cli {
    /// Configuration file with an [mqtt] table
    #[arg(short, long, value_name = "FILE", env = "ELIMS_MQTT_CONFIG")]
    config: Option<PathBuf>,

    /// Broker URL used when no configuration file is given
    #[arg(long, value_name = "URL", default_value = "mqtt://localhost:1883")]
    broker_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message
    Publish {
        topic: String,
        payload: String,
        /// Parse the payload as JSON and send it canonically serialized
        #[arg(long)]
        json: bool,
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: Option<u8>,
        #[arg(long)]
        retain: bool,
    },
    /// Print messages matching a pattern until interrupted
    Subscribe {
        pattern: String,
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: Option<u8>,
    },
    /// Validate the configuration
    Config {
        /// Print the effective settings (secrets masked)
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish {
            topic,
            payload,
            json,
            qos,
            retain,
        } => publish(config, &topic, payload, json, qos, retain).await,
        Commands::Subscribe { pattern, qos } => subscribe(config, &pattern, qos).await,
        Commands::Config { show } => show_config(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<MqttConfig, Box<dyn std::error::Error>> {
    match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(MqttConfig::load_from_file(path)?)
        }
        None => {
            let mut settings = MqttSettings::from_broker_url(&cli.broker_url)?;
            settings.resolve_env_vars()?;
            Ok(MqttConfig::new(settings)?)
        }
    }
}

fn parse_qos(level: Option<u8>) -> Result<Option<QoS>, ValidationError> {
    level
        .map(|level| qos_from_u8(level).ok_or(ValidationError::InvalidQos(level)))
        .transpose()
}

async fn publish(
    config: Arc<MqttConfig>,
    topic: &str,
    payload: String,
    json: bool,
    qos: Option<u8>,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = parse_qos(qos)?;
    let payload = if json {
        Payload::Json(serde_json::from_str(&payload)?)
    } else {
        Payload::Text(payload)
    };

    let pool = PublisherPool::new(
        config,
        PoolSettings {
            max_size: 1,
            ..PoolSettings::default()
        },
    )?;

    let result = pool
        .with_connection(|publisher| async move {
            let receipt = publisher
                .publish(topic, payload, qos, retain)
                .await?
                .wait()
                .await?;
            Ok::<_, MqttError>(receipt)
        })
        .await;
    pool.close_all().await;

    let receipt = result?;
    info!(
        topic = %receipt.topic,
        packet_id = receipt.packet_id,
        "Message published"
    );
    Ok(())
}

async fn subscribe(
    config: Arc<MqttConfig>,
    pattern: &str,
    qos: Option<u8>,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = parse_qos(qos)?;
    let subscriber = Subscriber::new(config)?;

    subscriber
        .subscribe(
            pattern,
            |topic: &str, payload: &str| {
                println!("{topic} {payload}");
                Ok(())
            },
            qos,
        )
        .await?;
    subscriber.connect(DEFAULT_CONNECT_TIMEOUT).await?;
    info!(pattern, "Listening, press Ctrl-C to stop");

    signal::ctrl_c().await?;
    info!("Received shutdown signal");
    subscriber.disconnect().await;
    Ok(())
}

fn show_config(config: &MqttConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!(broker = %config.broker_address(), "Configuration is valid");
    if show {
        println!("{}", serde_json::to_string_pretty(config.settings())?);
    }
    Ok(())
}
