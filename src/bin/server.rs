//! Mole Tunnel Server
//!
//! An authoritative UDP DNS responder that:
//! - Accepts encrypted chat turns smuggled in subdomain labels
//! - Streams LLM replies back through TXT records
//! - Keeps every session in memory only

use anyhow::{Context, Result};
use clap::Parser;
use mole_tunnel::codec::SecretKey;
use mole_tunnel::config::{self, ServerConfig};
use tracing::{info, warn};

/// Mole Tunnel Server - LLM chat over covert DNS tunneling
#[derive(Parser, Debug)]
#[command(name = "mole-server")]
#[command(about = "Mole Tunnel Server - LLM chat over covert DNS tunneling")]
#[command(version)]
struct Args {
    /// UDP bind host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// UDP bind port
    #[arg(short, long, default_value_t = mole_tunnel::DEFAULT_PORT)]
    port: u16,

    /// Query-name suffix to answer for (overrides LLM_DNS_SUFFIX)
    #[arg(long)]
    suffix: Option<String>,

    /// Upstream base URL (overrides OPENAI_BASE_URL)
    #[arg(long)]
    openai_base_url: Option<String>,

    /// Upstream model (overrides OPENAI_MODEL)
    #[arg(long)]
    openai_model: Option<String>,

    /// Generate a fresh pre-shared key and exit
    #[arg(long)]
    generate_key: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    // Generate key if requested
    if args.generate_key {
        return generate_key();
    }

    // Resolve the pre-shared key; generate and print one when absent
    let key = match std::env::var(config::KEY_ENV) {
        Ok(text) => SecretKey::from_base64(&text)
            .context("Invalid key in LLM_PROXY_KEY (expected base64 of 32 bytes)")?,
        Err(_) => {
            let key = SecretKey::generate();
            warn!("No {} configured - generated a fresh key", config::KEY_ENV);
            println!("Generated encryption key: {}", key.to_base64());
            println!("Clients need it too: export {}=<key>", config::KEY_ENV);
            key
        }
    };

    let mut config = ServerConfig::from_env(key).context("Failed to load configuration")?;
    config.host = args.host;
    config.port = args.port;
    if let Some(suffix) = args.suffix {
        config.suffix = config::normalize_suffix(&suffix);
    }
    if let Some(base_url) = args.openai_base_url {
        config.upstream.base_url = base_url;
    }
    if let Some(model) = args.openai_model {
        config.upstream.model = model;
    }

    info!("Upstream model: {}", config.upstream.model);
    if config.search_api_key.is_some() {
        info!("web_search tool enabled");
    }
    info!("Listening on {}:{} (udp)", config.host, config.port);

    mole_tunnel::server::run(config).await.context("Server failed")
}

/// Generate and print a new pre-shared key
fn generate_key() -> Result<()> {
    let key = SecretKey::generate();

    println!("Generated encryption key: {}", key.to_base64());
    println!();
    println!("Export it on both ends:");
    println!("  export {}=\"{}\"", config::KEY_ENV, key.to_base64());

    Ok(())
}
