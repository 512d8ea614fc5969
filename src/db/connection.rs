use anyhow::{Context, Result};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Ignored in verify modes.
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    /// If not set, the system CA store is used.
    pub ca_cert_path: Option<String>,
    /// Seconds to wait for the connection handshake.
    pub connect_timeout: u64,
}

/// SSL/TLS connection modes for PostgreSQL.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

impl ConnectionConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout={}",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            self.ssl_mode.as_str(),
            self.connect_timeout
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            connect_timeout: 10,
        }
    }
}

/// Create a PostgreSQL client and spawn its connection task.
pub async fn create_client(config: &ConnectionConfig) -> Result<Client> {
    let conn_string = config.connection_string();
    let timeout = Duration::from_secs(config.connect_timeout.max(1));
    debug!(server = %config.display_string(), sslmode = config.ssl_mode.as_str(), "connecting");

    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after {:?}", timeout))?
                    .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
        SslMode::Prefer | SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            let strict = matches!(config.ssl_mode, SslMode::VerifyCa | SslMode::VerifyFull);
            let tls = build_tls_connector(config, strict)?;
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, tls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after {:?}", timeout))?
                    .with_context(|| {
                        if strict {
                            "Failed to connect to PostgreSQL with certificate verification"
                        } else {
                            "Failed to connect to PostgreSQL"
                        }
                    })?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
    };

    Ok(client)
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// `strict_verify` is set for verify-ca/verify-full, where invalid
/// certificates are never accepted.
fn build_tls_connector(config: &ConnectionConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let ca_data = std::fs::read(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        let cert = native_tls::Certificate::from_pem(&ca_data)
            .with_context(|| format!("Failed to parse CA certificate: {}", ca_path))?;
        builder.add_root_certificate(cert);
    }

    let connector = builder.build().context("Failed to build TLS connector")?;

    Ok(MakeTlsConnector::new(connector))
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_quotes_values() {
        let config = ConnectionConfig {
            password: "it's".into(),
            ssl_mode: SslMode::VerifyFull,
            ..Default::default()
        };
        assert_eq!(
            config.connection_string(),
            "host='localhost' port=5432 dbname='postgres' user='postgres' password='it\\'s' sslmode=verify-full connect_timeout=10"
        );
    }

    #[test]
    fn test_ssl_mode_from_toml() {
        let config: ConnectionConfig =
            toml::from_str("host = \"db\"\nssl_mode = \"verify-ca\"").unwrap();
        assert_eq!(config.ssl_mode, SslMode::VerifyCa);
        assert_eq!(config.host, "db");
        assert_eq!(config.port, 5432);
        assert_eq!(config.display_string(), "postgres@db:5432/postgres");
    }
}
