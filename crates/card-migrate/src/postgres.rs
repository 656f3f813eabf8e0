//! PostgreSQL connection plumbing shared by the source reader, the document
//! store and the run marker backend.

use std::sync::Arc;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use rustls::ClientConfig;
use tokio_postgres::Config as PgConfig;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{info, warn};

use crate::config::redact_url;
use crate::error::{MigrateError, Result};

/// SSL verification modes for PostgreSQL connections.
///
/// These modes match PostgreSQL's standard `sslmode` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// No SSL/TLS (plain TCP connection).
    Disable,
    /// Use SSL but don't verify server certificate.
    /// **Security Warning**: Vulnerable to man-in-the-middle attacks.
    #[default]
    Require,
    /// Verify server certificate against CA.
    VerifyCa,
    /// Full certificate and hostname verification.
    VerifyFull,
}

impl SslMode {
    /// Parse an SSL mode from a string.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "require" | "" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(MigrateError::Config(format!(
                "Invalid ssl_mode '{}'. Valid values: disable, require, verify-ca, verify-full",
                other
            ))),
        }
    }

    pub fn requires_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }
}

/// Builder for PostgreSQL TLS connectors.
pub struct TlsBuilder {
    ssl_mode: SslMode,
}

impl TlsBuilder {
    pub fn new(ssl_mode: SslMode) -> Self {
        Self { ssl_mode }
    }

    /// Build a connector for deadpool-postgres. Returns None if TLS is disabled.
    pub fn build(&self) -> Result<Option<MakeRustlsConnect>> {
        if !self.ssl_mode.requires_tls() {
            return Ok(None);
        }
        Ok(Some(MakeRustlsConnect::new(self.build_client_config()?)))
    }

    fn build_client_config(&self) -> Result<ClientConfig> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = match self.ssl_mode {
            SslMode::Disable => {
                return Err(MigrateError::Config(
                    "Cannot build TLS config for ssl_mode=disable".into(),
                ));
            }
            SslMode::Require => {
                warn!(
                    "ssl_mode=require enables TLS but does NOT verify the server certificate. \
                     Use ssl_mode=verify-full outside trusted networks."
                );
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth()
            }
            SslMode::VerifyCa | SslMode::VerifyFull => {
                info!("certificate verification enabled");
                ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
        };

        Ok(config)
    }
}

/// Create a connection pool and check that it can hand out a working connection.
///
/// `store` names the store in errors and logs ("source", "target").
pub async fn connect_pool(store: &str, url: &str, ssl_mode: &str, max_size: usize) -> Result<Pool> {
    let pg_config: PgConfig = url
        .parse()
        .map_err(|e| MigrateError::Config(format!("{} connection url is invalid: {}", store, e)))?;
    let ssl_mode = SslMode::parse(ssl_mode)?;

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let context = format!("creating {} pool", store);
    let pool = match TlsBuilder::new(ssl_mode).build()? {
        None => {
            warn!("{} TLS is disabled. Credentials will be transmitted in plaintext.", store);
            let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
            Pool::builder(mgr)
                .max_size(max_size)
                .build()
                .map_err(|e| MigrateError::pool(e, context.clone()))?
        }
        Some(tls) => {
            let mgr = Manager::from_config(pg_config, tls, mgr_config);
            Pool::builder(mgr)
                .max_size(max_size)
                .build()
                .map_err(|e| MigrateError::pool(e, context.clone()))?
        }
    };

    let client = pool
        .get()
        .await
        .map_err(|e| MigrateError::pool(e, format!("testing {} connection", store)))?;
    client
        .simple_query("SELECT 1")
        .await
        .map_err(|e| MigrateError::connector(store, e))?;

    info!("Connected to {} store: {}", store, redact_url(url));
    Ok(pool)
}

/// Quote an identifier that has already been validated as plain.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Accepts any server certificate. Only used for `ssl_mode=require`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!(SslMode::parse("disable").unwrap(), SslMode::Disable);
        assert_eq!(SslMode::parse("REQUIRE").unwrap(), SslMode::Require);
        assert_eq!(SslMode::parse("verify-ca").unwrap(), SslMode::VerifyCa);
        assert_eq!(SslMode::parse("verify-full").unwrap(), SslMode::VerifyFull);
        assert_eq!(SslMode::parse("").unwrap(), SslMode::Require);
        assert!(SslMode::parse("prefer-ish").is_err());
    }

    #[test]
    fn test_tls_builder_disable_returns_none() {
        assert!(TlsBuilder::new(SslMode::Disable).build().unwrap().is_none());
    }

    #[test]
    fn test_tls_builder_verify_full_returns_some() {
        assert!(TlsBuilder::new(SslMode::VerifyFull).build().unwrap().is_some());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("card_documents"), "\"card_documents\"");
    }
}
