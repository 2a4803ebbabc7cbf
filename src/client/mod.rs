//! Tunnel client stub
//!
//! Constructs the DNS queries that carry a turn to the server and polls
//! TXT records for the streamed reply. One instance covers one
//! conversation: the random session id is generated at connect time and
//! reused for every turn until the prompt loop ends.

use crate::codec::{self, Cipher, CodecError, MAX_LABEL_LEN};
use crate::config::ClientConfig;
use crate::wire::{self, RecordType, RCODE_NOERROR, RCODE_REFUSED};
use std::time::Instant;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Client-side errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("key mismatch or corrupt channel")]
    Decrypt,

    #[error("server reported: {0}")]
    Server(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn map_codec(e: CodecError) -> ClientError {
    match e {
        CodecError::Decrypt => ClientError::Decrypt,
        other => ClientError::Protocol(other.to_string()),
    }
}

/// A connected tunnel conversation
pub struct TunnelClient {
    socket: UdpSocket,
    cipher: Cipher,
    config: ClientConfig,
    sid: String,
    tx_id: u16,
}

impl TunnelClient {
    /// Bind a local socket and pick a fresh session id
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let cipher = Cipher::new(&config.key).map_err(map_codec)?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect((config.server.as_str(), config.port))
            .await?;

        let mut sid_bytes = [0u8; 4];
        codec::random_bytes(&mut sid_bytes);
        let sid = hex::encode(sid_bytes);

        debug!("Session {} -> {}:{}", sid, config.server, config.port);

        Ok(Self {
            socket,
            cipher,
            config,
            sid,
            tx_id: rand::random(),
        })
    }

    /// This conversation's session id
    pub fn session_id(&self) -> &str {
        &self.sid
    }

    /// Health probe: `tst` must answer `pong`
    pub async fn test(&mut self) -> Result<(), ClientError> {
        let qname = format!("tst.{}", self.config.suffix);
        let strings = self.query_txt(&qname).await?;
        match strings.first().map(String::as_str) {
            Some("pong") => Ok(()),
            other => Err(ClientError::Transport(format!(
                "unexpected probe reply: {:?}",
                other
            ))),
        }
    }

    /// Encrypt, chunk, and deliver one outbound turn.
    ///
    /// Every `msg` query must come back acknowledged; chunks are retried
    /// individually on timeout. Returns the number of chunks sent.
    pub async fn send_message(&mut self, text: &str) -> Result<usize, ClientError> {
        let envelope = self
            .cipher
            .seal(&codec::pack(text.as_bytes()))
            .map_err(map_codec)?;

        let groups = codec::split(&envelope, MAX_LABEL_LEN, 1);
        let total = groups.len();
        debug!("Sending {} chunks for session {}", total, self.sid);

        for (idx, group) in groups.iter().enumerate() {
            let qname = format!(
                "msg.{}.{}.{}.{}.{}",
                self.sid,
                idx,
                total,
                group.join("."),
                self.config.suffix
            );
            let strings = self.query_txt(&qname).await?;
            if strings.first().map(String::as_str) != Some("ok") {
                return Err(ClientError::Transport(format!(
                    "chunk {} was not acknowledged",
                    idx
                )));
            }
            trace!("Chunk {}/{} acknowledged", idx + 1, total);
        }

        Ok(total)
    }

    /// Poll for the server's reply, invoking `on_text` as each decrypted
    /// chunk arrives, and return the fully assembled turn.
    pub async fn recv_response(
        &mut self,
        mut on_text: impl FnMut(&str),
    ) -> Result<String, ClientError> {
        let deadline = Instant::now() + self.config.turn_timeout;
        let mut next = 0u32;
        let mut full = String::new();

        loop {
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }

            let (count, state) = self.poll_count().await?;

            while next < count {
                let qname = format!("get.{}.{}.{}", self.sid, next, self.config.suffix);
                let strings = self.query_txt(&qname).await?;
                let chunk = strings.into_iter().next().unwrap_or_default();

                if chunk.is_empty() {
                    // Raced ahead of the producer; poll again
                    break;
                }
                if chunk == "END" {
                    return Ok(full);
                }

                let text = self.decode_chunk(&chunk)?;
                next += 1;

                if text == crate::EOF_SENTINEL {
                    return Ok(full);
                }
                on_text(&text);
                full.push_str(&text);
            }

            match state {
                'c' if next >= count => return Ok(full),
                'e' if next >= count => {
                    warn!("Session {} ended in server-side error", self.sid);
                    return Err(ClientError::Server(full));
                }
                _ => {}
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One full turn: send, then stream the reply
    pub async fn chat_turn(
        &mut self,
        text: &str,
        on_text: impl FnMut(&str),
    ) -> Result<String, ClientError> {
        self.send_message(text).await?;
        self.recv_response(on_text).await
    }

    /// Wire-level session reset
    pub async fn clear(&mut self) -> Result<(), ClientError> {
        let qname = format!("clr.{}.{}", self.sid, self.config.suffix);
        let strings = self.query_txt(&qname).await?;
        match strings.first().map(String::as_str) {
            Some("ok") => Ok(()),
            other => Err(ClientError::Transport(format!(
                "clear was not acknowledged: {:?}",
                other
            ))),
        }
    }

    async fn poll_count(&mut self) -> Result<(u32, char), ClientError> {
        let qname = format!("cnt.{}.{}", self.sid, self.config.suffix);
        let strings = self.query_txt(&qname).await?;
        let reply = strings
            .first()
            .ok_or_else(|| ClientError::Protocol("empty cnt reply".to_string()))?;

        let (count, state) = reply
            .split_once(',')
            .ok_or_else(|| ClientError::Protocol(format!("bad cnt reply: {:?}", reply)))?;
        let count: u32 = count
            .parse()
            .map_err(|_| ClientError::Protocol(format!("bad cnt count: {:?}", reply)))?;
        let state = state
            .chars()
            .next()
            .filter(|c| matches!(c, 'g' | 'c' | 'e'))
            .ok_or_else(|| ClientError::Protocol(format!("bad cnt state: {:?}", reply)))?;

        Ok((count, state))
    }

    fn decode_chunk(&self, chunk: &str) -> Result<String, ClientError> {
        let envelope = codec::decode_txt(chunk).map_err(map_codec)?;
        let packed = self.cipher.open(&envelope).map_err(map_codec)?;
        let plain = codec::unpack(&packed).map_err(map_codec)?;
        String::from_utf8(plain).map_err(|_| ClientError::Protocol("chunk is not UTF-8".to_string()))
    }

    /// Send one TXT query with per-attempt timeout and bounded retries
    async fn query_txt(&mut self, qname: &str) -> Result<Vec<String>, ClientError> {
        self.tx_id = self.tx_id.wrapping_add(1);
        let packet = wire::build_query(self.tx_id, qname, RecordType::Txt)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        let mut buf = [0u8; 2048];
        for attempt in 0..self.config.max_retries {
            self.socket.send(&packet).await?;

            match timeout(self.config.query_timeout, self.socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    let answer = match wire::parse_txt_response(&buf[..len]) {
                        Ok(answer) => answer,
                        Err(e) => {
                            trace!("Unparseable response (attempt {}): {}", attempt + 1, e);
                            continue;
                        }
                    };
                    if answer.id != self.tx_id {
                        trace!("Stale transaction id, retrying");
                        continue;
                    }
                    return match answer.rcode {
                        RCODE_NOERROR => Ok(answer.strings),
                        RCODE_REFUSED => Err(ClientError::Transport(
                            "server refused the query; suffix mismatch?".to_string(),
                        )),
                        rcode => Err(ClientError::Protocol(format!(
                            "server answered rcode {}",
                            rcode
                        ))),
                    };
                }
                Ok(Err(e)) => {
                    if attempt + 1 >= self.config.max_retries {
                        return Err(e.into());
                    }
                }
                Err(_) => {
                    trace!("Query timeout (attempt {})", attempt + 1);
                }
            }
        }

        Err(ClientError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SecretKey;

    fn test_config() -> ClientConfig {
        let mut config = ClientConfig::from_env(SecretKey::generate());
        config.suffix = "llm.test".to_string();
        config
    }

    #[tokio::test]
    async fn test_connect_generates_valid_sid() {
        let client = TunnelClient::connect(test_config()).await.unwrap();
        let sid = client.session_id();
        assert_eq!(sid.len(), 8);
        assert!(sid.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_sids_are_unique_per_conversation() {
        let a = TunnelClient::connect(test_config()).await.unwrap();
        let b = TunnelClient::connect(test_config()).await.unwrap();
        assert_ne!(a.session_id(), b.session_id());
    }
}
