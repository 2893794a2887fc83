//! Record marking for RPC over stream transports.
//!
//! Every message on a TCP connection is sent as a record. Each record
//! fragment is preceded by a 4-byte big-endian marker:
//!
//! ```text
//! +---+-------------------------------+
//! | L |        fragment length        |
//! +---+-------------------------------+
//!   1               31 bits
//! ```
//!
//! `L` is set on the last fragment of a record. The client only ever
//! produces single-fragment records and refuses to reassemble anything else.

/// Size of the record marker on the wire.
pub const MARKER_LEN: usize = 4;

/// High bit of the marker, set on the final fragment.
pub const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Shortest record accepted from a server.
pub const MIN_RECORD_LEN: u32 = 16;

/// Longest record accepted from a server.
pub const MAX_RECORD_LEN: u32 = 1024 * 1024;

/// Decoded record marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMarker {
    /// Fragment length in bytes, excluding the marker itself.
    pub len: u32,
    /// Whether this is the last fragment of the record.
    pub last: bool,
}

impl RecordMarker {
    /// Marker for a complete, single-fragment record.
    pub fn last(len: u32) -> Self {
        Self { len, last: true }
    }

    /// Decode a marker from the first four bytes of `input`.
    ///
    /// Returns `None` if fewer than four bytes are available.
    pub fn decode(input: &[u8]) -> Option<Self> {
        let raw: [u8; MARKER_LEN] = input.get(..MARKER_LEN)?.try_into().ok()?;
        let value = u32::from_be_bytes(raw);
        Some(Self {
            len: value & !LAST_FRAGMENT,
            last: value & LAST_FRAGMENT != 0,
        })
    }

    /// Encode the marker in network byte order.
    pub fn encode(self) -> [u8; MARKER_LEN] {
        let mut value = self.len & !LAST_FRAGMENT;
        if self.last {
            value |= LAST_FRAGMENT;
        }
        value.to_be_bytes()
    }
}
