//! Integration tests for the DNS tunnel
//!
//! Each test stands up the real UDP server against a mock OpenAI-style
//! upstream that serves canned SSE streams, then drives it with the real
//! client stub (or raw DNS queries where the scenario needs them).

use mole_tunnel::client::{ClientError, TunnelClient};
use mole_tunnel::codec::{self, SecretKey};
use mole_tunnel::config::{ClientConfig, ServerConfig, UpstreamConfig};
use mole_tunnel::server::Server;
use mole_tunnel::wire::{self, RecordType, RCODE_NOERROR, RCODE_NXDOMAIN, RCODE_REFUSED};
use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;

const SUFFIX: &str = "llm.test";

/// Canned OpenAI-compatible upstream speaking SSE over raw TCP
struct MockUpstream {
    base_url: String,
    requests: Arc<Mutex<Vec<serde_json::Value>>>,
    scripts: Arc<Mutex<VecDeque<Vec<String>>>>,
}

impl MockUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/v1", listener.local_addr().unwrap());
        let requests: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let scripts: Arc<Mutex<VecDeque<Vec<String>>>> = Arc::new(Mutex::new(VecDeque::new()));

        let req_log = requests.clone();
        let script_queue = scripts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let req_log = req_log.clone();
                let script_queue = script_queue.clone();
                tokio::spawn(async move {
                    if let Some(body) = read_request(&mut stream).await {
                        req_log.lock().await.push(body);
                    }
                    let tokens = script_queue
                        .lock()
                        .await
                        .pop_front()
                        .unwrap_or_else(|| vec!["pong".to_string()]);
                    write_sse(&mut stream, &tokens).await;
                });
            }
        });

        Self {
            base_url,
            requests,
            scripts,
        }
    }

    async fn push_script(&self, tokens: &[&str]) {
        self.scripts
            .lock()
            .await
            .push_back(tokens.iter().map(|t| t.to_string()).collect());
    }

    async fn requests(&self) -> Vec<serde_json::Value> {
        self.requests.lock().await.clone()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<serde_json::Value> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    let header_end = loop {
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 1 << 20 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
    }

    serde_json::from_slice(&buf[header_end..header_end + content_length]).ok()
}

async fn write_sse(stream: &mut tokio::net::TcpStream, tokens: &[String]) {
    let mut body = String::new();
    for token in tokens {
        let event = json!({"choices": [{"delta": {"content": token}, "finish_reason": null}]});
        body.push_str(&format!("data: {}\n\n", event));
    }
    let done = json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
    body.push_str(&format!("data: {}\n\n", done));
    body.push_str("data: [DONE]\n\n");

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn server_config(key: &SecretKey, upstream_base: &str) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        suffix: SUFFIX.to_string(),
        key: key.clone(),
        upstream: UpstreamConfig {
            base_url: upstream_base.to_string(),
            api_key: "test-key".to_string(),
            model: "mock-model".to_string(),
            request_timeout: Duration::from_secs(5),
        },
        search_api_key: None,
        idle_timeout: Duration::from_secs(600),
        sweep_interval: Duration::from_secs(60),
    }
}

async fn start_server(config: ServerConfig) -> SocketAddr {
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
    addr
}

fn client_config(key: &SecretKey, addr: SocketAddr) -> ClientConfig {
    let mut config = ClientConfig::from_env(key.clone());
    config.server = "127.0.0.1".to_string();
    config.port = addr.port();
    config.suffix = SUFFIX.to_string();
    config.query_timeout = Duration::from_secs(2);
    config.poll_interval = Duration::from_millis(50);
    config.turn_timeout = Duration::from_secs(20);
    config
}

/// One raw TXT query straight at the server, outside the client stub
async fn raw_query(addr: SocketAddr, qname: &str) -> (u8, Vec<String>) {
    let socket = UdpSocket::bind("0.0.0.0:0").await.unwrap();
    socket.connect(addr).await.unwrap();

    let packet = wire::build_query(0x4242, qname, RecordType::Txt).unwrap();
    socket.send(&packet).await.unwrap();

    let mut buf = [0u8; 2048];
    let len = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .expect("query timed out")
        .unwrap();
    let answer = wire::parse_txt_response(&buf[..len]).unwrap();
    (answer.rcode, answer.strings)
}

async fn wait_for_requests(mock: &MockUpstream, count: usize) -> Vec<serde_json::Value> {
    for _ in 0..100 {
        let requests = mock.requests().await;
        if requests.len() >= count {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("upstream never saw {} request(s)", count);
}

#[tokio::test]
async fn test_ping_round_trip() {
    let key = SecretKey::generate();
    let mock = MockUpstream::start().await;
    mock.push_script(&["pong"]).await;
    let addr = start_server(server_config(&key, &mock.base_url)).await;

    let mut client = TunnelClient::connect(client_config(&key, addr)).await.unwrap();
    let reply = client.chat_turn("ping", |_| {}).await.unwrap();
    assert_eq!(reply, "pong");

    let requests = wait_for_requests(&mock, 1).await;
    assert_eq!(requests[0]["model"], "mock-model");
    assert_eq!(requests[0]["stream"], true);
    let messages = requests[0]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "ping");
}

#[tokio::test]
async fn test_health_probe_and_rcodes() {
    let key = SecretKey::generate();
    let mock = MockUpstream::start().await;
    let addr = start_server(server_config(&key, &mock.base_url)).await;

    let (rcode, strings) = raw_query(addr, &format!("tst.{}", SUFFIX)).await;
    assert_eq!(rcode, RCODE_NOERROR);
    assert_eq!(strings, vec!["pong".to_string()]);

    // Wrong suffix is refused, never answered
    let (rcode, _) = raw_query(addr, "tst.other.zone").await;
    assert_eq!(rcode, RCODE_REFUSED);

    // Unknown commands and malformed fields are NXDOMAIN
    let (rcode, _) = raw_query(addr, &format!("zap.abc.{}", SUFFIX)).await;
    assert_eq!(rcode, RCODE_NXDOMAIN);
    let (rcode, _) = raw_query(addr, &format!("msg.abc.5.2.aaaa.{}", SUFFIX)).await;
    assert_eq!(rcode, RCODE_NXDOMAIN);
    let (rcode, _) = raw_query(addr, &format!("msg.abc.0.0.aaaa.{}", SUFFIX)).await;
    assert_eq!(rcode, RCODE_NXDOMAIN);
}

#[tokio::test]
async fn test_multi_chunk_request_reverse_order() {
    let key = SecretKey::generate();
    let mock = MockUpstream::start().await;
    mock.push_script(&["got it"]).await;
    let addr = start_server(server_config(&key, &mock.base_url)).await;

    // A turn large enough to need many msg queries even after compression
    let text = "The quick brown fox jumps over the lazy dog. ".repeat(90);
    let cipher = codec::Cipher::new(&key).unwrap();
    let envelope = cipher.seal(&codec::pack(text.as_bytes())).unwrap();
    let groups = codec::split(&envelope, codec::MAX_LABEL_LEN, 1);
    let total = groups.len();
    assert!(total > 1, "expected a multi-chunk turn, got {}", total);

    // Deliver in reverse index order; every chunk must still be ACKed
    for (idx, group) in groups.iter().enumerate().rev() {
        let qname = format!("msg.revsid.{}.{}.{}.{}", idx, total, group.join("."), SUFFIX);
        let (rcode, strings) = raw_query(addr, &qname).await;
        assert_eq!(rcode, RCODE_NOERROR);
        assert_eq!(strings, vec!["ok".to_string()]);
    }

    // The upstream prompt must equal the original plaintext
    let requests = wait_for_requests(&mock, 1).await;
    let messages = requests[0]["messages"].as_array().unwrap();
    assert_eq!(messages[0]["content"].as_str().unwrap(), text);
}

#[tokio::test]
async fn test_streaming_response_renders_progressively() {
    let key = SecretKey::generate();
    let mock = MockUpstream::start().await;
    // Four ~100-char tokens force several outbound chunks
    let t1 = "alpha ".repeat(17);
    let t2 = "bravo ".repeat(17);
    let t3 = "charlie ".repeat(13);
    let t4 = "delta ".repeat(17);
    mock.push_script(&[t1.as_str(), t2.as_str(), t3.as_str(), t4.as_str()])
        .await;
    let addr = start_server(server_config(&key, &mock.base_url)).await;

    let mut client = TunnelClient::connect(client_config(&key, addr)).await.unwrap();
    let mut pieces = Vec::new();
    let reply = client
        .chat_turn("stream please", |chunk| pieces.push(chunk.to_string()))
        .await
        .unwrap();

    let expected = format!("{}{}{}{}", t1, t2, t3, t4);
    assert_eq!(reply, expected);
    assert_eq!(pieces.concat(), expected);
    assert!(
        pieces.len() >= 2,
        "expected progressive chunks, got {}",
        pieces.len()
    );

    // The session ended complete, with every produced chunk on record
    let sid = client.session_id().to_string();
    let (rcode, strings) = raw_query(addr, &format!("cnt.{}.{}", sid, SUFFIX)).await;
    assert_eq!(rcode, RCODE_NOERROR);
    let (count, state) = strings[0].split_once(',').unwrap();
    assert_eq!(state, "c");
    assert!(count.parse::<u32>().unwrap() >= 2);

    // Reads past the end answer the END sentinel
    let (_, strings) = raw_query(addr, &format!("get.{}.999.{}", sid, SUFFIX)).await;
    assert_eq!(strings, vec!["END".to_string()]);
}

#[tokio::test]
async fn test_wrong_key_reports_key_mismatch() {
    let server_key = SecretKey::generate();
    let client_key = SecretKey::generate();
    let mock = MockUpstream::start().await;
    let addr = start_server(server_config(&server_key, &mock.base_url)).await;

    let mut client = TunnelClient::connect(client_config(&client_key, addr)).await.unwrap();

    // The probe carries no ciphertext, so it still succeeds
    client.test().await.unwrap();

    let err = client.chat_turn("hello?", |_| {}).await.unwrap_err();
    assert!(matches!(err, ClientError::Decrypt));
    assert_eq!(err.to_string(), "key mismatch or corrupt channel");

    // Server side, the session settles into the error state
    let sid = client.session_id().to_string();
    let mut state = String::new();
    for _ in 0..40 {
        let (_, strings) = raw_query(addr, &format!("cnt.{}.{}", sid, SUFFIX)).await;
        state = strings[0].clone();
        if state.ends_with(",e") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(state.ends_with(",e"), "session never errored: {}", state);
}

#[tokio::test]
async fn test_clear_resets_history() {
    let key = SecretKey::generate();
    let mock = MockUpstream::start().await;
    mock.push_script(&["hi there"]).await;
    mock.push_script(&["fresh start"]).await;
    let addr = start_server(server_config(&key, &mock.base_url)).await;

    let mut client = TunnelClient::connect(client_config(&key, addr)).await.unwrap();

    let reply = client.chat_turn("hello", |_| {}).await.unwrap();
    assert_eq!(reply, "hi there");

    // In-band control message answers OK and never reaches the upstream
    let reply = client.chat_turn("/clear", |_| {}).await.unwrap();
    assert_eq!(reply, "OK");

    let reply = client.chat_turn("are you new?", |_| {}).await.unwrap();
    assert_eq!(reply, "fresh start");

    let requests = wait_for_requests(&mock, 2).await;
    assert_eq!(requests.len(), 2, "the /clear turn must not call upstream");
    // After /clear the next turn carries no prior history
    let messages = requests[1]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "are you new?");
}

#[tokio::test]
async fn test_history_accumulates_without_clear() {
    let key = SecretKey::generate();
    let mock = MockUpstream::start().await;
    mock.push_script(&["first reply"]).await;
    mock.push_script(&["second reply"]).await;
    let addr = start_server(server_config(&key, &mock.base_url)).await;

    let mut client = TunnelClient::connect(client_config(&key, addr)).await.unwrap();
    client.chat_turn("one", |_| {}).await.unwrap();
    client.chat_turn("two", |_| {}).await.unwrap();

    let requests = wait_for_requests(&mock, 2).await;
    let messages = requests[1]["messages"].as_array().unwrap();
    // user, assistant, user
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["content"], "one");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "first reply");
    assert_eq!(messages[2]["content"], "two");
}

#[tokio::test]
async fn test_idle_session_is_evicted() {
    let key = SecretKey::generate();
    let mock = MockUpstream::start().await;
    mock.push_script(&["reply one"]).await;
    mock.push_script(&["reply two"]).await;

    let mut config = server_config(&key, &mock.base_url);
    config.idle_timeout = Duration::from_secs(1);
    config.sweep_interval = Duration::from_millis(200);
    let addr = start_server(config).await;

    let mut client = TunnelClient::connect(client_config(&key, addr)).await.unwrap();
    client.chat_turn("remember me", |_| {}).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    // Same sid, but the server treats it as brand new
    client.chat_turn("still there?", |_| {}).await.unwrap();

    let requests = wait_for_requests(&mock, 2).await;
    let messages = requests[1]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "still there?");
}

#[tokio::test]
async fn test_duplicate_msg_chunks_are_idempotent() {
    let key = SecretKey::generate();
    let mock = MockUpstream::start().await;
    mock.push_script(&["only once"]).await;
    let addr = start_server(server_config(&key, &mock.base_url)).await;

    let cipher = codec::Cipher::new(&key).unwrap();
    let envelope = cipher.seal(&codec::pack(b"dup test")).unwrap();
    let groups = codec::split(&envelope, codec::MAX_LABEL_LEN, 1);
    let total = groups.len();

    // Send the first chunk twice before the rest
    for idx in std::iter::once(0).chain(0..total) {
        let qname = format!(
            "msg.dupsid.{}.{}.{}.{}",
            idx,
            total,
            groups[idx].join("."),
            SUFFIX
        );
        let (rcode, strings) = raw_query(addr, &qname).await;
        assert_eq!(rcode, RCODE_NOERROR);
        assert_eq!(strings, vec!["ok".to_string()]);
    }

    let requests = wait_for_requests(&mock, 1).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["messages"][0]["content"], "dup test");
}

#[tokio::test]
async fn test_conflicting_chunk_poisons_session() {
    let key = SecretKey::generate();
    let mock = MockUpstream::start().await;
    let addr = start_server(server_config(&key, &mock.base_url)).await;

    let qname = format!("msg.badsid.0.2.aaaaaaaa.{}", SUFFIX);
    raw_query(addr, &qname).await;
    let qname = format!("msg.badsid.0.2.bbbbbbbb.{}", SUFFIX);
    raw_query(addr, &qname).await;

    let (_, strings) = raw_query(addr, &format!("cnt.badsid.{}", SUFFIX)).await;
    assert!(strings[0].ends_with(",e"));
}
