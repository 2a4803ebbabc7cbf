//! # Mole Tunnel
//!
//! Bidirectional LLM chat tunneled through the DNS query/response channel,
//! for networks where arbitrary TCP/UDP egress is blocked but recursive
//! DNS resolution still flows.
//!
//! ## Features
//!
//! - **Authenticated encryption** of every message with a pre-shared key
//! - **DNS-label-safe chunking** (base32, case-insensitive) of requests
//! - **Streaming responses** served incrementally as TXT records
//! - **Per-session conversation history** kept entirely in memory
//! - **Optional web search tool** exposed to the upstream model
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Client Stub                        │
//! │        (prompt loop, chunked send, TXT polling)      │
//! ├─────────────────────────────────────────────────────┤
//! │                   DNS Wire Layer                     │
//! │       (UDP responder, qname command dispatch)        │
//! ├─────────────────────────────────────────────────────┤
//! │                   Session Store                      │
//! │   (reassembly, history, outbound chunks, eviction)   │
//! ├─────────────────────────────────────────────────────┤
//! │                  LLM Orchestrator                    │
//! │     (upstream streaming, tool calls, chunk flush)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod llm;
pub mod server;
pub mod session;
pub mod wire;

pub use config::{ClientConfig, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default UDP port for the tunnel server
pub const DEFAULT_PORT: u16 = 5353;

/// Default query-name suffix the server is authoritative for
pub const DEFAULT_SUFFIX: &str = "_sonos._tcp.local";

/// Plaintext marker carried by the final outbound chunk of a turn
pub const EOF_SENTINEL: &str = "\u{4}";

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("Wire error: {0}")]
    Wire(#[from] wire::WireError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Upstream error: {0}")]
    Llm(#[from] llm::LlmError),

    #[error("Client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout")]
    Timeout,
}
