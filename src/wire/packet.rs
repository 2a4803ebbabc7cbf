//! DNS message encoding and decoding
//!
//! Hand-rolled parse/build for the small subset of DNS this tunnel needs:
//! single-question queries, A and TXT answers, and bare rcode replies.
//! Responses are authoritative with TTL 0 so nothing caches tunnel state.

use super::WireError;

/// Maximum octets in a wire-form query name
pub const MAX_NAME_LEN: usize = 255;

/// Maximum octets in one label
const MAX_LABEL_LEN: usize = 63;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

/// Record types the tunnel answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Txt,
    Other(u16),
}

impl RecordType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            16 => RecordType::Txt,
            other => RecordType::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Txt => 16,
            RecordType::Other(other) => other,
        }
    }
}

/// A parsed DNS question
#[derive(Debug, Clone)]
pub struct Query {
    pub id: u16,
    /// Lowercased name without the trailing dot
    pub qname: String,
    pub qtype: RecordType,
}

/// A parsed DNS response, as seen by the client stub
#[derive(Debug, Clone)]
pub struct TxtAnswer {
    pub id: u16,
    pub rcode: u8,
    /// Character-strings of the TXT answers, in record order
    pub strings: Vec<String>,
}

/// Parse the question section of an incoming query
pub fn parse_query(packet: &[u8]) -> Result<Query, WireError> {
    if packet.len() < 12 {
        return Err(WireError::MalformedQuery("packet too short".to_string()));
    }

    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return Err(WireError::MalformedQuery("no question".to_string()));
    }

    let mut labels = Vec::new();
    let mut name_len = 1; // root byte
    let mut pos = 12;
    loop {
        let len = *packet
            .get(pos)
            .ok_or_else(|| WireError::MalformedQuery("truncated name".to_string()))?
            as usize;
        pos += 1;

        if len == 0 {
            break;
        }
        if len > MAX_LABEL_LEN {
            // Also rejects compression pointers, which queries never need
            return Err(WireError::MalformedQuery("bad label length".to_string()));
        }
        if pos + len > packet.len() {
            return Err(WireError::MalformedQuery("truncated label".to_string()));
        }

        name_len += len + 1;
        if name_len > MAX_NAME_LEN {
            return Err(WireError::MalformedQuery("name too long".to_string()));
        }

        let label = std::str::from_utf8(&packet[pos..pos + len])
            .map_err(|_| WireError::MalformedQuery("label is not UTF-8".to_string()))?;
        labels.push(label.to_ascii_lowercase());
        pos += len;
    }

    if pos + 4 > packet.len() {
        return Err(WireError::MalformedQuery("truncated question".to_string()));
    }
    let qtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);

    Ok(Query {
        id,
        qname: labels.join("."),
        qtype: RecordType::from_u16(qtype),
    })
}

/// Encode a dotted name to wire form
pub fn encode_qname(qname: &str) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(qname.len() + 2);
    for label in qname.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(WireError::MalformedQuery(format!(
                "bad label length: {}",
                label.len()
            )));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);

    if out.len() > MAX_NAME_LEN {
        return Err(WireError::MalformedQuery("name too long".to_string()));
    }
    Ok(out)
}

/// Build a standard query packet (client side)
pub fn build_query(id: u16, qname: &str, qtype: RecordType) -> Result<Vec<u8>, WireError> {
    let mut packet = Vec::with_capacity(512);

    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // Standard query, recursion desired
    packet.extend_from_slice(&[0x00, 0x01]); // Questions: 1
    packet.extend_from_slice(&[0x00, 0x00]); // Answers: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Authority: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Additional: 0

    packet.extend_from_slice(&encode_qname(qname)?);
    packet.extend_from_slice(&qtype.to_u16().to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01]); // Class IN

    Ok(packet)
}

/// Response header + echoed question; answers are appended by the callers
fn response_prelude(query: &Query, rcode: u8, ancount: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);

    packet.extend_from_slice(&query.id.to_be_bytes());
    packet.extend_from_slice(&[0x84, rcode]); // Response, authoritative, no recursion
    packet.extend_from_slice(&[0x00, 0x01]); // Questions: 1
    packet.extend_from_slice(&ancount.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]); // Authority: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Additional: 0

    // Question section; qname came from parse_query so it re-encodes cleanly
    packet.extend_from_slice(&encode_qname(&query.qname).unwrap_or_else(|_| vec![0]));
    packet.extend_from_slice(&query.qtype.to_u16().to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01]); // Class IN

    packet
}

/// Start an answer record pointing back at the question name, TTL 0
fn answer_prelude(packet: &mut Vec<u8>, rtype: RecordType) {
    packet.extend_from_slice(&[0xC0, 0x0C]); // Name pointer to question
    packet.extend_from_slice(&rtype.to_u16().to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01]); // Class IN
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // TTL 0
}

/// Build a synthetic A answer (the `msg`/`clr` ACK)
pub fn build_a_response(query: &Query, addr: [u8; 4]) -> Vec<u8> {
    let mut packet = response_prelude(query, RCODE_NOERROR, 1);
    answer_prelude(&mut packet, RecordType::A);
    packet.extend_from_slice(&4u16.to_be_bytes());
    packet.extend_from_slice(&addr);
    packet
}

/// Build a single-record TXT answer carrying one character-string
pub fn build_txt_response(query: &Query, text: &str) -> Result<Vec<u8>, WireError> {
    if text.len() > 255 {
        return Err(WireError::MalformedQuery(format!(
            "TXT string too long: {}",
            text.len()
        )));
    }

    let mut packet = response_prelude(query, RCODE_NOERROR, 1);
    answer_prelude(&mut packet, RecordType::Txt);
    let rdlength = text.len() + 1;
    packet.extend_from_slice(&(rdlength as u16).to_be_bytes());
    packet.push(text.len() as u8);
    packet.extend_from_slice(text.as_bytes());
    Ok(packet)
}

/// Build an answerless reply carrying only an rcode
pub fn build_rcode_response(id: u16, rcode: u8) -> Vec<u8> {
    let mut packet = Vec::with_capacity(12);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x84, rcode]);
    packet.extend_from_slice(&[0x00, 0x00]); // Questions: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Answers: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Authority: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Additional: 0
    packet
}

/// Skip a (possibly compressed) name inside a response
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize, WireError> {
    loop {
        let b = *packet
            .get(pos)
            .ok_or_else(|| WireError::MalformedQuery("truncated name".to_string()))?;
        if b == 0 {
            return Ok(pos + 1);
        }
        if b >= 0xC0 {
            return Ok(pos + 2);
        }
        pos += b as usize + 1;
    }
}

/// Parse a response packet, collecting TXT character-strings (client side)
pub fn parse_txt_response(packet: &[u8]) -> Result<TxtAnswer, WireError> {
    if packet.len() < 12 {
        return Err(WireError::MalformedQuery("response too short".to_string()));
    }

    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let rcode = packet[3] & 0x0F;
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    let ancount = u16::from_be_bytes([packet[6], packet[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)?;
        pos += 4; // QTYPE + QCLASS
    }

    let mut strings = Vec::new();
    for _ in 0..ancount {
        if pos >= packet.len() {
            break;
        }
        pos = skip_name(packet, pos)?;
        if pos + 10 > packet.len() {
            break;
        }

        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > packet.len() {
            break;
        }

        if rtype == RecordType::Txt.to_u16() {
            let mut txt_pos = pos;
            while txt_pos < pos + rdlength {
                let txt_len = packet[txt_pos] as usize;
                txt_pos += 1;
                if txt_pos + txt_len <= pos + rdlength {
                    strings.push(
                        String::from_utf8_lossy(&packet[txt_pos..txt_pos + txt_len]).into_owned(),
                    );
                }
                txt_pos += txt_len;
            }
        }

        pos += rdlength;
    }

    Ok(TxtAnswer { id, rcode, strings })
}
