//! DNS tunnel server
//!
//! A single-socket UDP responder. Each datagram is parsed into a tunnel
//! command and handled on its own task so a slow session never blocks the
//! listener; completed inbound messages hand off to a per-session
//! orchestrator task driving the upstream LLM stream.

mod orchestrator;

use crate::codec::Cipher;
use crate::config::ServerConfig;
use crate::llm::{search::WebSearch, LlmClient};
use crate::session::{InboundOutcome, ReadOutcome, SessionStore};
use crate::wire::{
    self, Command, Query, RecordType, WireError, RCODE_NXDOMAIN, RCODE_REFUSED, RCODE_SERVFAIL,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

/// Largest datagram the listener accepts
const MAX_DATAGRAM: usize = 1024;

/// State shared by the wire handlers and orchestrators
pub struct ServerState {
    pub config: ServerConfig,
    pub store: Arc<SessionStore>,
    pub cipher: Cipher,
    pub llm: LlmClient,
    pub search: Option<WebSearch>,
}

impl ServerState {
    fn new(config: ServerConfig) -> crate::Result<Self> {
        let cipher = Cipher::new(&config.key)?;
        let llm = LlmClient::new(&config.upstream);
        let search = config.search_api_key.clone().map(WebSearch::new);

        Ok(Self {
            config,
            store: Arc::new(SessionStore::new()),
            cipher,
            llm,
            search,
        })
    }
}

/// A bound tunnel server
pub struct Server {
    socket: Arc<UdpSocket>,
    state: Arc<ServerState>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl Server {
    /// Bind the UDP socket and start the eviction sweeper
    pub async fn bind(config: ServerConfig) -> crate::Result<Self> {
        let socket =
            Arc::new(UdpSocket::bind((config.host.as_str(), config.port)).await?);
        let idle_timeout = config.idle_timeout;
        let sweep_interval = config.sweep_interval;
        let state = Arc::new(ServerState::new(config)?);

        let sweeper =
            SessionStore::spawn_sweeper(state.store.clone(), idle_timeout, sweep_interval);

        Ok(Self {
            socket,
            state,
            sweeper,
        })
    }

    /// The bound address, useful when the configured port was 0
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Accept and dispatch datagrams until the task is dropped
    pub async fn serve(&self) -> crate::Result<()> {
        if let Ok(addr) = self.local_addr() {
            info!(
                "Serving suffix .{} on {} (udp)",
                self.state.config.suffix, addr
            );
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!("Receive error: {}", e);
                    continue;
                }
            };

            let packet = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Some(response) = handle_datagram(&state, &packet).await {
                    if let Err(e) = socket.send_to(&response, peer).await {
                        debug!("Send error to {}: {}", peer, e);
                    }
                }
            });
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Bind and serve until ctrl-c
pub async fn run(config: ServerConfig) -> crate::Result<()> {
    let server = Server::bind(config).await?;
    info!("Mole Tunnel Server v{}", crate::VERSION);

    tokio::select! {
        result = server.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
    }
}

/// Parse and answer one datagram. `None` means the packet was too mangled
/// to answer at all.
async fn handle_datagram(state: &Arc<ServerState>, packet: &[u8]) -> Option<Vec<u8>> {
    let query = match wire::parse_query(packet) {
        Ok(query) => query,
        Err(e) => {
            if packet.len() >= 2 {
                let id = u16::from_be_bytes([packet[0], packet[1]]);
                debug!("Unparseable query from wire: {}", e);
                return Some(wire::build_rcode_response(id, RCODE_NXDOMAIN));
            }
            return None;
        }
    };

    let command = match wire::parse_command(&query.qname, &state.config.suffix) {
        Ok(command) => command,
        Err(WireError::SuffixMismatch) => {
            debug!("Refusing query outside suffix: {}", query.qname);
            return Some(wire::build_rcode_response(query.id, RCODE_REFUSED));
        }
        Err(e) => {
            debug!("Malformed query {}: {}", query.qname, e);
            return Some(wire::build_rcode_response(query.id, RCODE_NXDOMAIN));
        }
    };

    Some(dispatch(state, &query, command).await)
}

/// The single match site for tunnel commands
async fn dispatch(state: &Arc<ServerState>, query: &Query, command: Command) -> Vec<u8> {
    match command {
        Command::Msg {
            sid,
            idx,
            total,
            payload,
        } => {
            if !matches!(query.qtype, RecordType::A | RecordType::Txt) {
                return wire::build_rcode_response(query.id, RCODE_NXDOMAIN);
            }

            match state.store.record_inbound(&sid, idx, total, &payload).await {
                InboundOutcome::Pending => {}
                InboundOutcome::Error => {
                    warn!("Session {} poisoned by inbound chunk {}", sid, idx);
                }
                InboundOutcome::Complete(envelope) => {
                    debug!(
                        "Session {}: request assembled ({} chunks, {} bytes)",
                        sid,
                        total,
                        envelope.len()
                    );
                    match state.store.begin_generation(&sid).await {
                        Some(cancel) => {
                            let state = Arc::clone(state);
                            let sid = sid.clone();
                            tokio::spawn(async move {
                                orchestrator::generate(state, sid, envelope, cancel).await;
                            });
                        }
                        None => {
                            warn!("Session {}: generation already active, dropping turn", sid)
                        }
                    }
                }
            }

            ack(query)
        }

        Command::Get { sid, idx } => {
            if query.qtype != RecordType::Txt {
                return wire::build_rcode_response(query.id, RCODE_NXDOMAIN);
            }
            let text = match state.store.read_outbound(&sid, idx).await {
                ReadOutcome::Chunk(chunk) => chunk,
                ReadOutcome::NotYet => String::new(),
                ReadOutcome::End => "END".to_string(),
            };
            txt_or_servfail(query, &text)
        }

        Command::Cnt { sid } => {
            if query.qtype != RecordType::Txt {
                return wire::build_rcode_response(query.id, RCODE_NXDOMAIN);
            }
            let (count, status) = state.store.status(&sid).await;
            txt_or_servfail(query, &format!("{},{}", count, status))
        }

        Command::Clr { sid } => {
            if !matches!(query.qtype, RecordType::A | RecordType::Txt) {
                return wire::build_rcode_response(query.id, RCODE_NXDOMAIN);
            }
            state.store.clear(&sid).await;
            ack(query)
        }

        Command::Tst => {
            if query.qtype != RecordType::Txt {
                return wire::build_rcode_response(query.id, RCODE_NXDOMAIN);
            }
            txt_or_servfail(query, "pong")
        }
    }
}

/// Synthetic receipt for `msg` and `clr`
fn ack(query: &Query) -> Vec<u8> {
    match query.qtype {
        RecordType::A => wire::build_a_response(query, [0, 0, 0, 0]),
        _ => txt_or_servfail(query, "ok"),
    }
}

fn txt_or_servfail(query: &Query, text: &str) -> Vec<u8> {
    wire::build_txt_response(query, text)
        .unwrap_or_else(|_| wire::build_rcode_response(query.id, RCODE_SERVFAIL))
}
