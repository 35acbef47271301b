use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default cap on one inbound BER frame (10 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;
/// Default cap on one peer-declared SASL buffer (1 MiB).
pub const DEFAULT_MAX_SASL_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server URL: ldap://host:port or ldaps://host:port.
    pub url: String,
    /// TCP connect timeout in seconds (default 10).
    pub connect_timeout_sec: Option<u64>,
    /// Upper bound on one inbound frame in bytes (default 10 MiB).
    pub max_frame_bytes: Option<usize>,
    /// Upper bound on one peer SASL buffer in bytes (default 1 MiB).
    pub max_sasl_buffer_bytes: Option<usize>,
    /// TLS settings; required for ldaps:// and for StartTLS.
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM file with the CA certificate(s) used to verify the server.
    pub ca_file: String,
    /// Name presented for certificate verification; defaults to the URL host.
    pub server_name: Option<String>,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout_sec: None,
            max_frame_bytes: None,
            max_sasl_buffer_bytes: None,
            tls: None,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Read config file {:?}", path.as_ref()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: ConnectionConfig =
            serde_yaml::from_str(content).context("Parse YAML connection config")?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec.unwrap_or(10))
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn max_sasl_buffer_bytes(&self) -> usize {
        self.max_sasl_buffer_bytes
            .unwrap_or(DEFAULT_MAX_SASL_BUFFER_BYTES)
    }

    /// Whether the URL asks for TLS from the first byte (ldaps://).
    pub fn is_ldaps(&self) -> bool {
        self.url.starts_with("ldaps://")
    }

    /// `(host, port)` from the configured URL.
    pub fn host_port(&self) -> Result<(String, u16)> {
        parse_server_url(&self.url)
    }
}

/// Parse ldap://host[:port] or ldaps://host[:port]; default ports 389/636.
pub fn parse_server_url(url: &str) -> Result<(String, u16)> {
    let (rest, default_port) = if let Some(rest) = url.strip_prefix("ldap://") {
        (rest, 389)
    } else if let Some(rest) = url.strip_prefix("ldaps://") {
        (rest, 636)
    } else {
        anyhow::bail!("Invalid URL scheme, expected ldap:// or ldaps://");
    };
    let rest = rest.trim_start_matches('/').trim_end_matches('/');
    if rest.is_empty() {
        anyhow::bail!("URL has no host: {}", url);
    }
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("Invalid port in {}", url))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((rest.to_string(), default_port)),
    }
}
