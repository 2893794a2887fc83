//! ONC RPC over TCP.
//!
//! The stress client hand-encodes its calls and decodes replies itself so it
//! can control how bytes hit the socket:
//! - `record`: 4-byte record marker framing
//! - `message`: call header, sum arguments, reply status and results

pub mod message;
pub mod record;

pub use message::{
    decode_reply, decode_u32, encode_call, DecodeError, Procedure, ReplyStatus, SUCCESS,
};
pub use record::{RecordMarker, MARKER_LEN, MAX_RECORD_LEN, MIN_RECORD_LEN};
