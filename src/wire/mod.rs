//! DNS wire layer
//!
//! A minimal authoritative responder vocabulary: just enough of the DNS
//! message format to parse incoming A/TXT questions and synthesize
//! answers, plus the mapping from query names to tunnel commands. Nothing
//! here forwards to upstream resolvers.

mod command;
mod packet;

pub use command::{parse_command, Command, MAX_SID_LEN};
pub use packet::{
    build_a_response, build_query, build_rcode_response, build_txt_response, encode_qname,
    parse_query, parse_txt_response, Query, RecordType, TxtAnswer, MAX_NAME_LEN, RCODE_NOERROR,
    RCODE_NXDOMAIN, RCODE_REFUSED, RCODE_SERVFAIL,
};

use thiserror::Error;

/// Wire layer errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("query name does not match configured suffix")]
    SuffixMismatch,
}
