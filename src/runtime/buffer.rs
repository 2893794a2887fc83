//! Per-job send and receive buffers.
//!
//! Both buffers track how far a transfer has progressed so partial reads and
//! writes can resume on the next readiness event. Positions never move past
//! the declared length.
//!
//! ## Receive framing
//!
//! A `RecvBuffer` starts out expecting only the 4-byte record marker. Once
//! the marker is decoded the buffer is retargeted to the record length and
//! filling restarts from zero.

use crate::protocols::rpc::MARKER_LEN;
use bytes::Bytes;
use std::time::Instant;

/// An encoded request and how much of it has been written.
#[derive(Debug)]
pub struct SendBuffer {
    data: Bytes,
    pos: usize,
    /// When the request was built; send latency is measured from here.
    begin: Instant,
}

impl SendBuffer {
    pub fn new(data: Bytes, begin: Instant) -> Self {
        Self {
            data,
            pos: 0,
            begin,
        }
    }

    /// Total bytes to send.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Bytes already sent.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes not yet sent.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Mark `n` more bytes as sent.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.data.len(), "send past end of buffer");
        self.pos = (self.pos + n).min(self.data.len());
    }

    pub fn is_complete(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn begin(&self) -> Instant {
        self.begin
    }
}

/// Receive buffer with a movable target length.
#[derive(Debug)]
pub struct RecvBuffer {
    buf: Vec<u8>,
    /// Bytes expected in the current phase.
    len: usize,
    /// Bytes received in the current phase.
    pos: usize,
    /// When the request finished sending; receive latency is measured from here.
    begin: Instant,
}

impl RecvBuffer {
    /// Create a buffer waiting for a record marker.
    pub fn new(begin: Instant) -> Self {
        Self {
            buf: vec![0u8; MARKER_LEN],
            len: MARKER_LEN,
            pos: 0,
            begin,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Space still to be filled in the current phase.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.pos..self.len]
    }

    /// Bytes received so far in the current phase.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    /// Mark `n` more bytes as received.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.len, "receive past end of buffer");
        self.pos = (self.pos + n).min(self.len);
    }

    pub fn is_complete(&self) -> bool {
        self.pos >= self.len
    }

    /// Restart filling with a new target length.
    pub fn expect(&mut self, len: usize) {
        self.buf.clear();
        self.buf.resize(len, 0);
        self.len = len;
        self.pos = 0;
    }

    pub fn begin(&self) -> Instant {
        self.begin
    }
}
