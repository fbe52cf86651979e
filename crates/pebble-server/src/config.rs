//! Server configuration.
//!
//! Settings come from three layers, highest precedence first: command line
//! flags (or their `PEBBLE_*` environment variables), an optional TOML file
//! given with `--config`, and the library defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pebble_xmpp::XmppServerConfig;
use serde::Deserialize;

/// Command line interface.
#[derive(Debug, Parser)]
#[command(name = "pebble-server")]
#[command(author, version, about = "Minimal anonymous XMPP server", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "PEBBLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to accept client connections on
    #[arg(short, long, env = "PEBBLE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Domain announced in stream headers and bound identifiers
    #[arg(short, long, env = "PEBBLE_DOMAIN")]
    pub domain: Option<String>,

    /// PEM certificate chain used for STARTTLS
    #[arg(long, env = "PEBBLE_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key used for STARTTLS
    #[arg(long, env = "PEBBLE_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Routing actor inbox depth
    #[arg(long, env = "PEBBLE_ROUTER_CAPACITY")]
    pub router_capacity: Option<usize>,

    /// Per-connection outbound queue depth
    #[arg(long, env = "PEBBLE_OUTBOUND_CAPACITY")]
    pub outbound_capacity: Option<usize>,

    /// Seconds allowed for stream negotiation; 0 disables the deadline
    #[arg(long, env = "PEBBLE_NEGOTIATION_TIMEOUT_SECS")]
    pub negotiation_timeout_secs: Option<u64>,

    /// Largest accepted top-level element, in bytes
    #[arg(long, env = "PEBBLE_MAX_STANZA_SIZE")]
    pub max_stanza_size: Option<usize>,

    /// Mirror encrypted server output to stdout
    #[arg(long, env = "PEBBLE_WIRE_LOG")]
    pub wire_log: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "PEBBLE_LOG_JSON")]
    pub log_json: bool,
}

/// Contents of the `--config` file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<SocketAddr>,
    pub domain: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub router_capacity: Option<usize>,
    pub outbound_capacity: Option<usize>,
    pub negotiation_timeout_secs: Option<u64>,
    pub max_stanza_size: Option<usize>,
    pub wire_log: Option<bool>,
    pub log_json: Option<bool>,
}

impl FileConfig {
    /// Read and parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

/// Fully resolved settings for the process.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Library configuration
    pub server: XmppServerConfig,
    /// Emit JSON logs
    pub log_json: bool,
}

impl Cli {
    /// Merge command line, config file and defaults.
    pub fn resolve(&self) -> Result<Settings> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        self.merge(file)
    }

    fn merge(&self, file: FileConfig) -> Result<Settings> {
        let mut server = XmppServerConfig::default();

        if let Some(addr) = self.listen.or(file.listen) {
            server.c2s_addr = addr;
        }
        if let Some(domain) = self.domain.clone().or(file.domain) {
            server.domain = domain;
        }
        if let Some(cert) = self.tls_cert.clone().or(file.tls_cert) {
            server.tls_cert_path = cert;
        }
        if let Some(key) = self.tls_key.clone().or(file.tls_key) {
            server.tls_key_path = key;
        }
        if let Some(capacity) = self.router_capacity.or(file.router_capacity) {
            server.router_capacity = capacity;
        }
        if let Some(capacity) = self.outbound_capacity.or(file.outbound_capacity) {
            server.outbound_capacity = capacity;
        }
        if let Some(secs) = self.negotiation_timeout_secs.or(file.negotiation_timeout_secs) {
            server.negotiation_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(size) = self.max_stanza_size.or(file.max_stanza_size) {
            server.max_stanza_size = size;
        }
        // Flags can only switch these on.
        server.wire_log = self.wire_log || file.wire_log.unwrap_or(false);
        let log_json = self.log_json || file.log_json.unwrap_or(false);

        validate(&server)?;

        Ok(Settings { server, log_json })
    }
}

fn validate(config: &XmppServerConfig) -> Result<()> {
    if config.domain.is_empty() {
        bail!("domain must not be empty");
    }
    if config.router_capacity == 0 {
        bail!("router_capacity must be at least 1");
    }
    if config.outbound_capacity == 0 {
        bail!("outbound_capacity must be at least 1");
    }
    if config.max_stanza_size == 0 {
        bail!("max_stanza_size must be at least 1");
    }
    Ok(())
}
