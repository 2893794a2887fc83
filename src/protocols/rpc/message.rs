//! ONC RPC call and reply messages.
//!
//! Only the subset needed to drive a sum procedure is implemented:
//! calls carry AUTH_NONE credentials and an XDR array of unsigned
//! integers, replies carry a single unsigned integer.
//!
//! ## Call layout (after the record marker)
//!
//! ```text
//! xid | CALL | rpcvers=2 | prog | vers | proc | cred(0,0) | verf(0,0) | count | values...
//! ```
//!
//! ## Accepted reply layout
//!
//! ```text
//! xid | REPLY | MSG_ACCEPTED | verf(flavor, opaque) | accept_stat | results...
//! ```

use super::record::{RecordMarker, MARKER_LEN};
use bytes::{Buf, BufMut, BytesMut};

pub const CALL: u32 = 0;
pub const REPLY: u32 = 1;
pub const RPC_VERSION: u32 = 2;

pub const MSG_ACCEPTED: u32 = 0;
pub const MSG_DENIED: u32 = 1;

/// Accept status of a successfully executed call.
pub const SUCCESS: u32 = 0;

pub const AUTH_NONE: u32 = 0;

/// Header fields of an outgoing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

/// Address of a remote procedure: program, version and procedure number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Procedure {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

impl Procedure {
    /// Call header for this procedure with the given transaction id.
    pub fn header(&self, xid: u32) -> CallHeader {
        CallHeader {
            xid,
            program: self.program,
            version: self.version,
            procedure: self.procedure,
        }
    }
}

/// Status part of a decoded reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// MSG_ACCEPTED with the given accept status.
    Accepted(u32),
    /// MSG_DENIED with the given reject status.
    Denied(u32),
}

/// A decoded reply message borrowing its results from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<'a> {
    pub xid: u32,
    pub status: ReplyStatus,
    /// Procedure results, only meaningful for `Accepted(SUCCESS)`.
    pub results: &'a [u8],
}

/// Reply decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message truncated")]
    Truncated,
    #[error("message has invalid direction {0}")]
    NotReply(u32),
    #[error("reply has invalid reply status {0}")]
    BadReplyStatus(u32),
}

/// Encode a complete call record into `buf`, marker included.
///
/// The marker is written as a placeholder first and patched once the
/// final length is known.
pub fn encode_call(header: &CallHeader, args: &[u32], buf: &mut BytesMut) {
    let start = buf.len();
    buf.reserve(MARKER_LEN + 44 + 4 * args.len());
    buf.put_u32(0);

    buf.put_u32(header.xid);
    buf.put_u32(CALL);
    buf.put_u32(RPC_VERSION);
    buf.put_u32(header.program);
    buf.put_u32(header.version);
    buf.put_u32(header.procedure);

    // credentials, then verifier
    buf.put_u32(AUTH_NONE);
    buf.put_u32(0);
    buf.put_u32(AUTH_NONE);
    buf.put_u32(0);

    buf.put_u32(args.len() as u32);
    for value in args {
        buf.put_u32(*value);
    }

    let len = (buf.len() - start - MARKER_LEN) as u32;
    buf[start..start + MARKER_LEN].copy_from_slice(&RecordMarker::last(len).encode());
}

/// Decode a reply record body (marker already stripped).
pub fn decode_reply(input: &[u8]) -> Result<Reply<'_>, DecodeError> {
    let mut buf = input;

    let xid = take_u32(&mut buf)?;
    let direction = take_u32(&mut buf)?;
    if direction != REPLY {
        return Err(DecodeError::NotReply(direction));
    }

    let status = match take_u32(&mut buf)? {
        MSG_ACCEPTED => {
            let _flavor = take_u32(&mut buf)?;
            skip_opaque(&mut buf)?;
            ReplyStatus::Accepted(take_u32(&mut buf)?)
        }
        MSG_DENIED => ReplyStatus::Denied(take_u32(&mut buf)?),
        other => return Err(DecodeError::BadReplyStatus(other)),
    };

    Ok(Reply {
        xid,
        status,
        results: buf,
    })
}

/// Decode a single XDR unsigned integer result.
pub fn decode_u32(input: &[u8]) -> Result<u32, DecodeError> {
    let mut buf = input;
    take_u32(&mut buf)
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.get_u32())
}

/// Skip a variable-length opaque, including its padding to 4 bytes.
fn skip_opaque(buf: &mut &[u8]) -> Result<(), DecodeError> {
    let len = take_u32(buf)? as usize;
    let padded = len.checked_add(3).ok_or(DecodeError::Truncated)? & !3;
    if buf.remaining() < padded {
        return Err(DecodeError::Truncated);
    }
    buf.advance(padded);
    Ok(())
}

/// Encode an accepted reply record, marker included.
#[cfg(test)]
pub fn encode_reply(xid: u32, accept_stat: u32, results: &[u32], buf: &mut BytesMut) {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_u32(xid);
    buf.put_u32(REPLY);
    buf.put_u32(MSG_ACCEPTED);
    buf.put_u32(AUTH_NONE);
    buf.put_u32(0);
    buf.put_u32(accept_stat);
    for value in results {
        buf.put_u32(*value);
    }
    let len = (buf.len() - start - MARKER_LEN) as u32;
    buf[start..start + MARKER_LEN].copy_from_slice(&RecordMarker::last(len).encode());
}

/// Encode a denied reply record, marker included.
#[cfg(test)]
pub fn encode_denied(xid: u32, reject_stat: u32, buf: &mut BytesMut) {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_u32(xid);
    buf.put_u32(REPLY);
    buf.put_u32(MSG_DENIED);
    buf.put_u32(reject_stat);
    // RPC_MISMATCH carries the supported version range
    buf.put_u32(RPC_VERSION);
    buf.put_u32(RPC_VERSION);
    let len = (buf.len() - start - MARKER_LEN) as u32;
    buf[start..start + MARKER_LEN].copy_from_slice(&RecordMarker::last(len).encode());
}

/// Decode a call record body (marker already stripped) into its header
/// and argument array.
#[cfg(test)]
pub fn decode_call(input: &[u8]) -> Result<(CallHeader, Vec<u32>), DecodeError> {
    let mut buf = input;

    let xid = take_u32(&mut buf)?;
    let direction = take_u32(&mut buf)?;
    if direction != CALL {
        return Err(DecodeError::NotReply(direction));
    }
    let _rpcvers = take_u32(&mut buf)?;
    let header = CallHeader {
        xid,
        program: take_u32(&mut buf)?,
        version: take_u32(&mut buf)?,
        procedure: take_u32(&mut buf)?,
    };

    for _ in 0..2 {
        let _flavor = take_u32(&mut buf)?;
        skip_opaque(&mut buf)?;
    }

    let count = take_u32(&mut buf)? as usize;
    if buf.remaining() < count * 4 {
        return Err(DecodeError::Truncated);
    }
    let args = (0..count).map(|_| buf.get_u32()).collect();
    Ok((header, args))
}
