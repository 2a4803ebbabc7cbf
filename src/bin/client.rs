//! Mole Tunnel Client
//!
//! Chat with an LLM through nothing but DNS queries:
//! - Encrypts and chunks each turn into `msg` subdomain labels
//! - Polls TXT records and renders the reply as it streams in
//! - `test-connection` probes the server with a `tst` query

use clap::{Parser, Subcommand};
use mole_tunnel::client::{ClientError, TunnelClient};
use mole_tunnel::codec::SecretKey;
use mole_tunnel::config::{self, ClientConfig};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

const EXIT_CONFIG: i32 = 1;
const EXIT_TRANSPORT: i32 = 2;
const EXIT_DECRYPT: i32 = 3;

/// Mole Tunnel Client - LLM chat over covert DNS tunneling
#[derive(Parser, Debug)]
#[command(name = "mole-client")]
#[command(about = "Mole Tunnel Client - LLM chat over covert DNS tunneling")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a chat session (interactive unless -m is given)
    Chat {
        /// Send a single message and exit
        #[arg(short, long)]
        message: Option<String>,

        /// Tunnel server address
        #[arg(long, default_value = "127.0.0.1")]
        server: String,

        /// Tunnel server port
        #[arg(long, default_value_t = mole_tunnel::DEFAULT_PORT)]
        port: u16,

        /// Query-name suffix (overrides LLM_DNS_SUFFIX)
        #[arg(long)]
        suffix: Option<String>,
    },
    /// Probe the tunnel server
    TestConnection {
        /// Tunnel server address
        #[arg(long, default_value = "127.0.0.1")]
        server: String,

        /// Tunnel server port
        #[arg(long, default_value_t = mole_tunnel::DEFAULT_PORT)]
        port: u16,

        /// Query-name suffix (overrides LLM_DNS_SUFFIX)
        #[arg(long)]
        suffix: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    let code = match run(args.command).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", e.message);
            e.code
        }
    };
    std::process::exit(code);
}

/// Error carrying its process exit code
struct CliError {
    code: i32,
    message: String,
}

impl CliError {
    fn config(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_CONFIG,
            message: message.into(),
        }
    }
}

impl From<ClientError> for CliError {
    fn from(e: ClientError) -> Self {
        let code = match e {
            ClientError::Decrypt => EXIT_DECRYPT,
            _ => EXIT_TRANSPORT,
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

async fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::Chat {
            message,
            server,
            port,
            suffix,
        } => {
            let mut client = connect(server, port, suffix).await?;
            match message {
                Some(text) => one_shot(&mut client, &text).await,
                None => interactive(&mut client).await,
            }
        }
        Command::TestConnection {
            server,
            port,
            suffix,
        } => {
            let mut client = connect(server, port, suffix).await?;
            match client.test().await {
                Ok(()) => {
                    println!("Connection OK (pong)");
                    Ok(())
                }
                Err(e) => Err(CliError {
                    code: EXIT_TRANSPORT,
                    message: format!("Connection test failed: {}", e),
                }),
            }
        }
    }
}

async fn connect(
    server: String,
    port: u16,
    suffix: Option<String>,
) -> Result<TunnelClient, CliError> {
    let key_text = std::env::var(config::KEY_ENV).map_err(|_| {
        CliError::config(format!(
            "{} is not set; generate one with: mole-server --generate-key",
            config::KEY_ENV
        ))
    })?;
    let key = SecretKey::from_base64(&key_text)
        .map_err(|e| CliError::config(format!("Invalid {}: {}", config::KEY_ENV, e)))?;

    let mut config = ClientConfig::from_env(key);
    config.server = server;
    config.port = port;
    if let Some(suffix) = suffix {
        config.suffix = config::normalize_suffix(&suffix);
    }

    let client = TunnelClient::connect(config).await?;
    debug!("Using session id {}", client.session_id());
    Ok(client)
}

async fn one_shot(client: &mut TunnelClient, text: &str) -> Result<(), CliError> {
    println!("You: {}", text);
    print!("Assistant: ");
    let _ = std::io::stdout().flush();

    client.chat_turn(text, render_token).await?;
    println!();
    Ok(())
}

async fn interactive(client: &mut TunnelClient) -> Result<(), CliError> {
    println!("Chatting over DNS (session {}).", client.session_id());
    println!("Type 'quit' to exit, '/clear' to reset the conversation.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("You: ");
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break, // EOF
            Err(e) => {
                return Err(CliError {
                    code: EXIT_TRANSPORT,
                    message: format!("stdin error: {}", e),
                })
            }
        };

        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if matches!(text, "quit" | "exit") {
            break;
        }

        print!("Assistant: ");
        let _ = std::io::stdout().flush();

        match client.chat_turn(text, render_token).await {
            Ok(_) => println!(),
            // Keep the session alive on per-turn failures
            Err(e) => {
                println!();
                eprintln!("Error: {}", e);
            }
        }
    }

    println!("Session ended.");
    Ok(())
}

fn render_token(token: &str) {
    print!("{}", token);
    let _ = std::io::stdout().flush();
}
