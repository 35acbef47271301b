use anyhow::{Context, Result};
use clap::Parser;
use ldap_conn::config::ConnectionConfig;
use ldap_conn::filter::Filter;
use ldap_conn::pending::SearchItem;
use ldap_conn::protocol::{DerefAliases, SearchRequest, SearchScope};
use ldap_conn::LdapConnection;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "ldap-conn")]
#[command(about = "LDAP v3 client - search a directory server over the native protocol engine")]
struct Args {
    /// Server URL (ldap://host:port or ldaps://host:port)
    #[arg(short, long, value_name = "URL")]
    url: Option<String>,

    /// Connection config file (YAML); --url overrides its url field
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind DN (anonymous when omitted)
    #[arg(short = 'D', long, value_name = "DN")]
    bind_dn: Option<String>,

    /// Bind password
    #[arg(short = 'w', long, value_name = "PASSWORD")]
    password: Option<String>,

    /// Issue StartTLS before binding (requires tls in config)
    #[arg(long)]
    start_tls: bool,

    /// Search base DN
    #[arg(short, long, value_name = "DN", default_value = "")]
    base: String,

    /// Attribute that must be present, e.g. objectClass, or attr=value equality
    #[arg(short, long, value_name = "FILTER", default_value = "objectClass")]
    filter: String,

    /// Attributes to request (all when empty)
    #[arg(value_name = "ATTR")]
    attributes: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Minimal filter argument: `attr` (presence) or `attr=value` (equality).
/// Full filter-string parsing belongs to a grammar layer this tool skips.
fn build_filter(arg: &str) -> Filter {
    match arg.split_once('=') {
        Some((attr, value)) => Filter::equality(attr.trim(), value.trim().as_bytes()),
        None => Filter::present(arg.trim()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_conn={},info", log_level))
        .init();

    let mut config = match &args.config {
        Some(path) => ConnectionConfig::from_file(path)?,
        None => {
            let url = args
                .url
                .clone()
                .context("Set --url <URL> or --config <FILE>")?;
            ConnectionConfig::new(url)
        }
    };
    if let Some(url) = args.url {
        config.url = url;
    }

    info!("Connecting to {}", config.url);
    let conn = LdapConnection::connect(config).await?;

    if args.start_tls {
        conn.start_tls().await.context("StartTLS failed")?;
        info!("StartTLS negotiated");
    }

    if let Some(bind_dn) = &args.bind_dn {
        let password = args.password.as_deref().unwrap_or("");
        let result = conn
            .simple_bind(bind_dn, password)
            .await
            .context("Bind failed")?;
        info!("Bound as {} ({})", bind_dn, result.result_code);
    }

    let request = SearchRequest {
        base_object: args.base.clone(),
        scope: SearchScope::WholeSubtree,
        deref_aliases: DerefAliases::Never,
        size_limit: 0,
        time_limit: 0,
        types_only: false,
        filter: build_filter(&args.filter),
        attributes: args.attributes.clone(),
    };
    let mut search = conn.search(request).await;
    while let Some(item) = search.next_item().await {
        match item {
            SearchItem::Entry(entry) => {
                println!("dn: {}", entry.object_name);
                for attr in &entry.attributes {
                    for value in &attr.attr_values {
                        println!("{}: {}", attr.attr_type, String::from_utf8_lossy(value));
                    }
                }
                println!();
            }
            SearchItem::Reference(reference) => {
                for uri in &reference.uris {
                    println!("ref: {uri}");
                }
                println!();
            }
        }
    }
    let outcome = search.finish().await.context("Search failed")?;
    info!(
        "Search done: {} entries, {} references ({})",
        outcome.entry_count, outcome.reference_count, outcome.result.result_code
    );

    conn.close().await;
    Ok(())
}
