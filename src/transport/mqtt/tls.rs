//! TLS client configuration for broker connections
//!
//! Builds a rustls `ClientConfig` (the rustls generation re-exported by
//! rumqttc) from the file paths in [`MqttConfig`]: CA bundle or system trust
//! roots, optional client certificate, minimum protocol version and the
//! opt-in insecure verifier.

use crate::config::{ConfigError, MqttConfig, TlsVersion};
use rumqttc::tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::WebPkiSupportedAlgorithms,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use rumqttc::TlsConfiguration;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Build the rumqttc TLS configuration, or None when TLS is disabled
pub fn build_tls_configuration(
    config: &MqttConfig,
) -> Result<Option<TlsConfiguration>, ConfigError> {
    if !config.use_tls() {
        return Ok(None);
    }

    let client_config = build_client_config(config)?;
    Ok(Some(TlsConfiguration::Rustls(Arc::new(client_config))))
}

fn build_client_config(config: &MqttConfig) -> Result<ClientConfig, ConfigError> {
    let builder = ClientConfig::builder_with_protocol_versions(protocol_versions(
        config.tls_version(),
    ));

    let builder = if config.tls_insecure() {
        warn!(
            broker = %config.broker_address(),
            "TLS certificate verification disabled"
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
    } else {
        builder.with_root_certificates(load_root_store(config.ca_file())?)
    };

    match (config.cert_file(), config.key_file()) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certificates(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ConfigError::Tls(format!("invalid client certificate/key: {e}")))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn protocol_versions(
    minimum: TlsVersion,
) -> &'static [&'static rustls::SupportedProtocolVersion] {
    static TLS12_AND_UP: &[&rustls::SupportedProtocolVersion] =
        &[&rustls::version::TLS13, &rustls::version::TLS12];
    static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

    match minimum {
        TlsVersion::V1_2 => TLS12_AND_UP,
        TlsVersion::V1_3 => TLS13_ONLY,
    }
}

fn load_root_store(ca_file: Option<&Path>) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();

    match ca_file {
        Some(path) => {
            for cert in load_certificates(path)? {
                roots.add(cert).map_err(|e| {
                    ConfigError::Tls(format!("invalid CA certificate in {}: {e}", path.display()))
                })?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs()
                .map_err(|e| ConfigError::Tls(format!("failed to load system trust roots: {e}")))?;
            let (added, ignored) = roots.add_parsable_certificates(native);
            debug!(added, ignored, "Loaded system trust roots");
            if added == 0 {
                warn!("No usable system trust roots found; server verification will fail");
            }
        }
    }

    Ok(roots)
}

fn open_pem(path: &Path) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ConfigError::Tls(format!("cannot read {}: {e}", path.display())))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("malformed PEM in {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConfigError::Tls(format!("malformed PEM in {}: {e}", path.display())))?
        .ok_or_else(|| ConfigError::Tls(format!("no private key found in {}", path.display())))
}

/// Accepts any server certificate while still checking handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttSettings;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_tls_disabled_yields_none() {
        let config = MqttConfig::new(MqttSettings::default()).unwrap();
        assert!(build_tls_configuration(&config).unwrap().is_none());
    }

    #[test]
    fn test_insecure_tls_builds_without_roots() {
        let mut settings = MqttSettings::default();
        settings.use_tls = true;
        settings.tls_insecure = true;
        settings.allow_insecure_tls = true;
        let config = MqttConfig::new(settings).unwrap();

        let tls = build_tls_configuration(&config).unwrap();
        assert!(matches!(tls, Some(TlsConfiguration::Rustls(_))));
    }

    #[test]
    fn test_ca_file_without_certificates_is_rejected() {
        let ca = pem_file("this is not a certificate\n");
        let mut settings = MqttSettings::default();
        settings.use_tls = true;
        settings.ca_file = Some(ca.path().to_path_buf());
        let config = MqttConfig::new(settings).unwrap();

        let err = build_tls_configuration(&config).unwrap_err();
        assert!(matches!(err, ConfigError::Tls(ref msg) if msg.contains("no certificates")));
    }

    #[test]
    fn test_client_cert_without_key_material_is_rejected() {
        let cert = pem_file("garbage\n");
        let key = pem_file("garbage\n");
        let mut settings = MqttSettings::default();
        settings.use_tls = true;
        settings.tls_insecure = true;
        settings.cert_file = Some(cert.path().to_path_buf());
        settings.key_file = Some(key.path().to_path_buf());
        let config = MqttConfig::new(settings).unwrap();

        assert!(matches!(
            build_tls_configuration(&config),
            Err(ConfigError::Tls(_))
        ));
    }

    #[test]
    fn test_protocol_versions() {
        assert_eq!(protocol_versions(TlsVersion::V1_2).len(), 2);
        assert_eq!(protocol_versions(TlsVersion::V1_3).len(), 1);
    }
}
