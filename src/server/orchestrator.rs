//! Per-session generation worker
//!
//! Spawned once per assembled inbound message. Drives the upstream stream,
//! flushing the growing response into the session's outbound array one
//! encrypted unit at a time so the client can render progressively, and
//! finishes the turn with the EOF sentinel chunk.

use super::ServerState;
use crate::codec::{self, CodecError, MAX_UNIT_LEN};
use crate::llm::{ChatMessage, StreamEvent, ToolCallRecord};
use crate::session::GenerationState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Base delay before the single upstream retry
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Events per stream the channel may buffer before backpressure
const STREAM_BUFFER: usize = 64;

/// Run one generation turn for `sid`.
pub(super) async fn generate(
    state: Arc<ServerState>,
    sid: String,
    envelope: Vec<u8>,
    mut cancel: watch::Receiver<bool>,
) {
    let text = match state
        .cipher
        .open(&envelope)
        .and_then(|packed| codec::unpack(&packed))
        .map_err(|_| ())
        .and_then(|bytes| String::from_utf8(bytes).map_err(|_| ()))
    {
        Ok(text) => text,
        Err(()) => {
            warn!("Session {}: inbound message failed to decrypt", sid);
            fail_turn(&state, &sid, "decrypt failed: key mismatch or corrupt payload").await;
            return;
        }
    };

    // In-band control payload
    if text.trim() == "/clear" {
        info!("Session {}: /clear", sid);
        state.store.clear(&sid).await;
        let _ = append_chunk(&state, &sid, "OK").await;
        state
            .store
            .finish_generation(&sid, GenerationState::Complete)
            .await;
        return;
    }

    debug!("Session {}: user turn of {} chars", sid, text.chars().count());

    if state
        .store
        .push_history(&sid, ChatMessage::user(&text))
        .await
        .is_err()
    {
        return;
    }

    let tools: Vec<serde_json::Value> = match &state.search {
        Some(_) => vec![crate::llm::search::WebSearch::schema()],
        None => Vec::new(),
    };

    let mut working = state.store.history(&sid).await;
    // Tool exchange entries, persisted to history after the streaming loop
    let mut turn_messages: Vec<ChatMessage> = Vec::new();
    let mut full_text = String::new();
    let mut buf = String::new();
    let mut flushed = 0u32;
    let mut retried = false;

    'turn: loop {
        let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
        let messages = working.clone();
        let tools_for_call = tools.clone();
        let stream_state = Arc::clone(&state);
        let stream_task = tokio::spawn(async move {
            stream_state
                .llm
                .chat_stream(&messages, &tools_for_call, tx)
                .await
        });

        let mut tool_requests: Option<Vec<ToolCallRecord>> = None;

        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!("Session {}: generation cancelled", sid);
                        stream_task.abort();
                        return;
                    }
                }
                event = rx.recv() => match event {
                    Some(StreamEvent::Token(token)) => {
                        full_text.push_str(&token);
                        buf.push_str(&token);
                        while buf.len() >= MAX_UNIT_LEN {
                            let unit = drain_unit(&mut buf, MAX_UNIT_LEN);
                            if append_chunk(&state, &sid, &unit).await.is_err() {
                                stream_task.abort();
                                return;
                            }
                            flushed += 1;
                        }
                    }
                    Some(StreamEvent::ToolCalls(calls)) => tool_requests = Some(calls),
                    Some(StreamEvent::Done) => {}
                    None => break,
                },
            }
        }

        match stream_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_transient() && !retried && flushed == 0 => {
                warn!("Session {}: transient upstream error, retrying: {}", sid, e);
                retried = true;
                full_text.clear();
                buf.clear();
                tokio::time::sleep(RETRY_BACKOFF).await;
                continue 'turn;
            }
            Ok(Err(e)) => {
                warn!("Session {}: upstream failed: {}", sid, e);
                fail_turn(&state, &sid, &format!("upstream error: {}", e)).await;
                return;
            }
            Err(e) => {
                warn!("Session {}: stream task died: {}", sid, e);
                fail_turn(&state, &sid, "upstream error: stream aborted").await;
                return;
            }
        }

        if let Some(calls) = tool_requests.take() {
            let announce = ChatMessage::assistant_tool_calls(calls.clone());
            working.push(announce.clone());
            turn_messages.push(announce);

            for call in calls {
                let result = run_tool(&state, &call).await;
                let message = ChatMessage::tool(&call.id, &result);
                working.push(message.clone());
                turn_messages.push(message);
            }
            continue 'turn;
        }

        break 'turn;
    }

    if !buf.is_empty() {
        if append_chunk(&state, &sid, &buf).await.is_err() {
            return;
        }
        flushed += 1;
    }
    if append_chunk(&state, &sid, crate::EOF_SENTINEL).await.is_err() {
        return;
    }

    debug!(
        "Session {}: generation complete, {} content chunks",
        sid, flushed
    );

    turn_messages.push(ChatMessage::assistant(&full_text));
    if let Err(e) = state.store.extend_history(&sid, turn_messages).await {
        debug!("Session {}: history not persisted: {}", sid, e);
    }
    state
        .store
        .finish_generation(&sid, GenerationState::Complete)
        .await;
}

/// Execute one requested tool call; failures become tool output rather
/// than aborting the turn.
async fn run_tool(state: &ServerState, call: &ToolCallRecord) -> String {
    match (&state.search, call.function.name.as_str()) {
        (Some(search), "web_search") => match search.run(&call.function.arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!("web_search failed: {}", e);
                format!("tool error: {}", e)
            }
        },
        (None, "web_search") => "tool error: web search is not configured".to_string(),
        (_, other) => format!("tool error: unknown tool {}", other),
    }
}

/// Compress, encrypt, encode, and append one plaintext unit.
async fn append_chunk(state: &ServerState, sid: &str, text: &str) -> Result<u32, ()> {
    let chunk = encode_chunk(state, text).map_err(|e| {
        warn!("Session {}: chunk encode failed: {}", sid, e);
    })?;
    state.store.append_outbound(sid, chunk).await.map_err(|e| {
        debug!("Session {}: outbound append failed: {}", sid, e);
    })
}

fn encode_chunk(state: &ServerState, text: &str) -> Result<String, CodecError> {
    let sealed = state.cipher.seal(&codec::pack(text.as_bytes()))?;
    Ok(codec::encode_txt(&sealed))
}

/// Report a failed turn as a single encrypted error chunk
async fn fail_turn(state: &ServerState, sid: &str, message: &str) {
    let _ = append_chunk(state, sid, message).await;
    state
        .store
        .finish_generation(sid, GenerationState::Error)
        .await;
}

/// Cut the largest whole-character prefix of at most `max` bytes
fn drain_unit(buf: &mut String, max: usize) -> String {
    let mut cut = max.min(buf.len());
    while !buf.is_char_boundary(cut) {
        cut -= 1;
    }
    buf.drain(..cut).collect()
}
