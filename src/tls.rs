//! Client TLS configuration: load CA certificates from PEM, build the
//! connector used for ldaps:// and for the StartTLS upgrade.

use crate::config::{ConnectionConfig, TlsConfig};
use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::RootCertStore;
use rustls_pemfile::certs;
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Build a rustls ClientConfig trusting the CAs in a PEM file.
pub fn load_client_config_from_file(ca_file: &str) -> Result<Arc<rustls::ClientConfig>> {
    let file = fs::File::open(ca_file).with_context(|| format!("Open CA file: {}", ca_file))?;
    let mut reader = BufReader::new(file);
    let cas: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Parse PEM CA certificates")?;
    if cas.is_empty() {
        anyhow::bail!("No CA certificates found in {}", ca_file);
    }
    let mut roots = RootCertStore::empty();
    for ca in cas {
        roots
            .add(ca)
            .context("Add CA certificate to root store")?;
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Connector plus the server name to verify against, from the connection
/// config. Errors if the config has no `tls` section.
pub fn build_connector(config: &ConnectionConfig) -> Result<(TlsConnector, ServerName<'static>)> {
    let tls_cfg: &TlsConfig = config
        .tls
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("TLS requested but config has no tls section"))?;
    let client_config = load_client_config_from_file(&tls_cfg.ca_file)?;
    let (host, _) = config.host_port()?;
    let name = tls_cfg.server_name.clone().unwrap_or(host);
    let server_name = ServerName::try_from(name.clone())
        .with_context(|| format!("Invalid TLS server name: {}", name))?;
    Ok((TlsConnector::from(client_config), server_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tls_section_is_an_error() {
        let config = ConnectionConfig::new("ldaps://ldap.example.com");
        assert!(build_connector(&config).is_err());
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        assert!(load_client_config_from_file("/nonexistent/ca.pem").is_err());
    }
}
