//! Query-name command parsing
//!
//! The leftmost labels of a query name carry the tunnel command:
//!
//! ```text
//! msg.<sid>.<idx>.<total>.<payload>.<suffix>
//! get.<sid>.<idx>.<suffix>
//! cnt.<sid>.<suffix>
//! clr.<sid>.<suffix>
//! tst.<suffix>
//! ```
//!
//! Parsing yields a tagged variant matched at a single site in the server
//! dispatch. Names under a different suffix are not ours to answer.

use super::WireError;

/// Maximum session-id length in characters
pub const MAX_SID_LEN: usize = 8;

/// A parsed tunnel command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Record one inbound request chunk
    Msg {
        sid: String,
        idx: u32,
        total: u32,
        payload: String,
    },
    /// Fetch one outbound response chunk
    Get { sid: String, idx: u32 },
    /// Report produced-count and generation state
    Cnt { sid: String },
    /// Reset session history and buffers
    Clr { sid: String },
    /// Health probe
    Tst,
}

fn validate_sid(sid: &str) -> Result<String, WireError> {
    if sid.is_empty() || sid.len() > MAX_SID_LEN || !sid.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(WireError::MalformedQuery(format!(
            "invalid session id: {:?}",
            sid
        )));
    }
    Ok(sid.to_string())
}

fn parse_index(label: &str, what: &str) -> Result<u32, WireError> {
    label
        .parse::<u32>()
        .map_err(|_| WireError::MalformedQuery(format!("invalid {}: {:?}", what, label)))
}

/// Parse a lowercased query name into a command.
///
/// `suffix` must be normalized (lowercase, no surrounding dots).
pub fn parse_command(qname: &str, suffix: &str) -> Result<Command, WireError> {
    let labels: Vec<&str> = qname.split('.').collect();
    let suffix_labels: Vec<&str> = suffix.split('.').collect();

    if labels.len() <= suffix_labels.len()
        || labels[labels.len() - suffix_labels.len()..] != suffix_labels[..]
    {
        return Err(WireError::SuffixMismatch);
    }

    let prefix = &labels[..labels.len() - suffix_labels.len()];

    match prefix[0] {
        "msg" => {
            if prefix.len() < 5 {
                return Err(WireError::MalformedQuery("msg needs 4 fields".to_string()));
            }
            let sid = validate_sid(prefix[1])?;
            let idx = parse_index(prefix[2], "index")?;
            let total = parse_index(prefix[3], "total")?;
            if total == 0 {
                return Err(WireError::MalformedQuery("total must be > 0".to_string()));
            }
            if idx >= total {
                return Err(WireError::MalformedQuery(format!(
                    "index {} out of range for total {}",
                    idx, total
                )));
            }
            // Payload may span several labels; concatenate them
            let payload = prefix[4..].concat();
            if payload.is_empty() {
                return Err(WireError::MalformedQuery("empty payload".to_string()));
            }
            Ok(Command::Msg {
                sid,
                idx,
                total,
                payload,
            })
        }
        "get" => {
            if prefix.len() != 3 {
                return Err(WireError::MalformedQuery("get needs 2 fields".to_string()));
            }
            Ok(Command::Get {
                sid: validate_sid(prefix[1])?,
                idx: parse_index(prefix[2], "index")?,
            })
        }
        "cnt" => {
            if prefix.len() != 2 {
                return Err(WireError::MalformedQuery("cnt needs 1 field".to_string()));
            }
            Ok(Command::Cnt {
                sid: validate_sid(prefix[1])?,
            })
        }
        "clr" => {
            if prefix.len() != 2 {
                return Err(WireError::MalformedQuery("clr needs 1 field".to_string()));
            }
            Ok(Command::Clr {
                sid: validate_sid(prefix[1])?,
            })
        }
        "tst" => {
            if prefix.len() != 1 {
                return Err(WireError::MalformedQuery(
                    "tst takes no fields".to_string(),
                ));
            }
            Ok(Command::Tst)
        }
        other => Err(WireError::UnknownCommand(other.to_string())),
    }
}
