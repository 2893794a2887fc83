//! Job state machine for one outbound connection.
//!
//! A job connects without blocking, then loops through request/reply cycles
//! until its call budget is used up:
//!
//! ```text
//! Unconnected -> Connecting -> Sending -> ReceivingMarker -> ReceivingBody
//!                                 ^                               |
//!                                 +------- budget left -----------+
//!                                          budget spent -> Closed
//! ```
//!
//! Any failure is returned to the pool, which closes the job. A job never
//! performs more than one socket operation per `advance` call.
//!
//! ## Readiness
//!
//! mio reports readiness edge-triggered, so the job keeps what it was told
//! in `Readiness` and only clears a flag when the matching operation hits
//! `WouldBlock`.

use super::buffer::{RecvBuffer, SendBuffer};
use super::error::{JobError, ProtocolError};
use crate::protocols::rpc::{
    self, Procedure, RecordMarker, ReplyStatus, MAX_RECORD_LEN, MIN_RECORD_LEN, SUCCESS,
};
use bytes::BytesMut;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rand::Rng;
use socket2::{Domain, Socket, Type};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Current state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// No socket yet.
    Unconnected,
    /// Non-blocking connect issued, waiting for writability.
    Connecting,
    /// Request built, writing it out.
    Sending,
    /// Waiting for the 4-byte record marker.
    ReceivingMarker,
    /// Waiting for the rest of the record.
    ReceivingBody,
    /// Socket closed; the slot is ready to be reaped.
    Closed,
}

/// Readiness observed on the socket and not yet consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Result of a single `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do; the socket would block.
    Idle,
    /// Bytes moved or the connection finished opening.
    Progress,
    /// The whole request went out; carries the send latency.
    Sent(Duration),
    /// A reply was validated and the next request is built.
    Completed(Duration),
    /// A reply was validated and the call budget is spent; the socket is closed.
    Finished(Duration),
}

/// Parameters fixed when a job is created.
#[derive(Debug, Clone, Copy)]
pub struct JobParams {
    /// Transaction id of the first call; later calls count up from here.
    pub xid: u32,
    /// Calls to make before the connection is recycled.
    pub max_calls: u32,
    /// Number of integers in each request payload.
    pub num_ints: usize,
    /// Time allowed for each request cycle.
    pub timeout: Duration,
    pub target: Procedure,
}

#[derive(Debug)]
pub struct Job {
    id: usize,
    name: String,
    stream: Option<TcpStream>,
    state: JobState,
    readiness: Readiness,

    base_xid: u32,
    xid: u32,
    target: Procedure,
    max_calls: u32,
    ncalls: u32,
    num_ints: usize,
    /// Expected checksum of the request in flight.
    sum: u32,

    send: Option<SendBuffer>,
    recv: Option<RecvBuffer>,

    timeout: Duration,
    deadline: Instant,
    last_activity: char,
}

impl Job {
    /// Create an unconnected job for slot `id`.
    pub fn new(id: usize, params: JobParams) -> Self {
        Self {
            id,
            name: format!("job{id}"),
            stream: None,
            state: JobState::Unconnected,
            readiness: Readiness::default(),
            base_xid: params.xid,
            xid: params.xid,
            target: params.target,
            max_calls: params.max_calls,
            ncalls: 0,
            num_ints: params.num_ints,
            sum: 0,
            send: None,
            recv: None,
            timeout: params.timeout,
            deadline: Instant::now() + params.timeout,
            last_activity: ' ',
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Calls completed on this connection.
    pub fn calls(&self) -> u32 {
        self.ncalls
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    /// Transaction id of the request in flight.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Checksum the server must echo for the request in flight.
    #[cfg(test)]
    pub fn expected_sum(&self) -> u32 {
        self.sum
    }

    /// `(sent, total)` of the current request.
    pub fn send_progress(&self) -> Option<(usize, usize)> {
        self.send.as_ref().map(|s| (s.pos(), s.len()))
    }

    /// `(received, expected)` of the current receive phase.
    pub fn recv_progress(&self) -> Option<(usize, usize)> {
        self.recv.as_ref().map(|r| (r.pos(), r.len()))
    }

    /// Whether the job still holds a socket.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Raw descriptor of the socket, or -1 when closed.
    pub fn fd(&self) -> i32 {
        self.stream.as_ref().map_or(-1, |s| s.as_raw_fd())
    }

    /// Interest to register for the current state.
    pub fn interest(&self) -> Interest {
        match self.state {
            JobState::ReceivingMarker | JobState::ReceivingBody => Interest::READABLE,
            _ => Interest::WRITABLE,
        }
    }

    fn wants_write(&self) -> bool {
        matches!(self.state, JobState::Connecting | JobState::Sending)
    }

    fn wants_read(&self) -> bool {
        matches!(
            self.state,
            JobState::ReceivingMarker | JobState::ReceivingBody
        )
    }

    /// Whether `advance` has something to act on.
    pub fn is_ready(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        let r = self.readiness;
        r.error
            || r.hangup
            || (self.wants_write() && r.writable)
            || (self.wants_read() && r.readable)
    }

    /// Fold a poll event into the retained readiness.
    pub fn absorb(&mut self, event: &Event) {
        self.readiness.readable |= event.is_readable();
        self.readiness.writable |= event.is_writable();
        self.readiness.error |= event.is_error();
        self.readiness.hangup |= event.is_write_closed();
    }

    /// Return the liveness character for the status line and reset it.
    pub fn take_activity(&mut self) -> char {
        std::mem::replace(&mut self.last_activity, ' ')
    }

    /// Record a liveness character for the status line.
    pub fn mark(&mut self, activity: char) {
        self.last_activity = activity;
    }

    /// Show `.` for a job waiting to write, unless something else happened.
    pub fn mark_waiting(&mut self) {
        if self.wants_write() && self.last_activity == ' ' {
            self.last_activity = '.';
        }
    }

    /// Open a non-blocking connection to `addr` and register it under the
    /// job's slot token.
    ///
    /// Both immediate success and `EINPROGRESS` are accepted; anything
    /// else fails the job.
    pub fn connect(&mut self, addr: SocketAddr, registry: &Registry) -> Result<(), JobError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
            .map_err(JobError::Connect)?;
        socket.set_nonblocking(true).map_err(JobError::Connect)?;

        match socket.connect(&addr.into()) {
            Ok(()) => self.last_activity = 'C',
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                self.last_activity = 'c'
            }
            Err(e) => return Err(JobError::Connect(e)),
        }

        let mut stream = TcpStream::from_std(socket.into());
        registry
            .register(&mut stream, Token(self.id), Interest::WRITABLE)
            .map_err(JobError::Connect)?;

        trace!(job = %self.name, fd = stream.as_raw_fd(), "Connecting");
        self.stream = Some(stream);
        self.state = JobState::Connecting;
        self.arm_deadline(Instant::now());
        Ok(())
    }

    /// Perform at most one socket operation for the current state.
    ///
    /// An error condition on the socket takes precedence over any data
    /// readiness.
    pub fn advance<R: Rng>(
        &mut self,
        registry: &Registry,
        rng: &mut R,
    ) -> Result<Outcome, JobError> {
        if self.readiness.error {
            return Err(self.socket_failure());
        }

        match self.state {
            JobState::Connecting => self.finish_connect(rng),
            JobState::Sending => self.send(registry, rng),
            JobState::ReceivingMarker | JobState::ReceivingBody => self.recv(registry, rng),
            JobState::Unconnected | JobState::Closed => Ok(Outcome::Idle),
        }
    }

    fn socket_failure(&self) -> JobError {
        let pending = self
            .stream
            .as_ref()
            .and_then(|s| s.take_error().ok().flatten());
        match (pending, self.state) {
            (Some(e), JobState::Connecting) => JobError::Connect(e),
            (Some(e), _) => JobError::Io(e),
            (None, _) => JobError::Socket,
        }
    }

    fn finish_connect<R: Rng>(&mut self, rng: &mut R) -> Result<Outcome, JobError> {
        if !self.readiness.writable {
            return self.idle_or_hangup();
        }
        let Some(stream) = self.stream.as_ref() else {
            return Ok(Outcome::Idle);
        };

        if let Some(e) = stream.take_error().map_err(JobError::Connect)? {
            return Err(JobError::Connect(e));
        }
        match stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                self.readiness.writable = false;
                return Ok(Outcome::Idle);
            }
            Err(e) => return Err(JobError::Connect(e)),
        }

        trace!(job = %self.name, "Connected");
        self.build_request(rng);
        self.state = JobState::Sending;
        Ok(Outcome::Progress)
    }

    /// Build a fresh request with a random payload and restart the deadline.
    fn build_request<R: Rng>(&mut self, rng: &mut R) {
        let values: Vec<u32> = (0..self.num_ints).map(|_| rng.gen()).collect();
        self.sum = values.iter().fold(0u32, |acc, v| acc.wrapping_add(*v));
        self.xid = self.base_xid.wrapping_add(self.ncalls);

        let mut buf = BytesMut::new();
        rpc::encode_call(&self.target.header(self.xid), &values, &mut buf);

        let now = Instant::now();
        self.send = Some(SendBuffer::new(buf.freeze(), now));
        self.recv = None;
        self.arm_deadline(now);
    }

    fn arm_deadline(&mut self, now: Instant) {
        self.deadline = now + self.timeout;
    }

    /// Write a random-sized slice of the remaining request.
    fn send<R: Rng>(&mut self, registry: &Registry, rng: &mut R) -> Result<Outcome, JobError> {
        if !self.readiness.writable {
            return self.idle_or_hangup();
        }
        let (Some(stream), Some(send)) = (self.stream.as_mut(), self.send.as_mut()) else {
            return Ok(Outcome::Idle);
        };

        let avail = send.remaining().len();
        let nbytes = rng.gen_range(0..send.len().max(1)).clamp(1, avail.max(1));

        let n = match stream.write(&send.remaining()[..nbytes.min(avail)]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into());
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.readiness.writable = false;
                return Ok(Outcome::Idle);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Outcome::Idle),
            Err(e) => return Err(e.into()),
        };

        send.advance(n);
        self.last_activity = 'x';
        if !send.is_complete() {
            return Ok(Outcome::Progress);
        }

        let now = Instant::now();
        let latency = now.duration_since(send.begin());
        self.last_activity = 'X';
        self.recv = Some(RecvBuffer::new(now));
        self.state = JobState::ReceivingMarker;
        self.reregister(registry)?;
        Ok(Outcome::Sent(latency))
    }

    /// Read toward the current receive target.
    fn recv<R: Rng>(&mut self, registry: &Registry, rng: &mut R) -> Result<Outcome, JobError> {
        if !self.readiness.readable && !self.readiness.hangup {
            return Ok(Outcome::Idle);
        }
        let (Some(stream), Some(recv)) = (self.stream.as_mut(), self.recv.as_mut()) else {
            return Ok(Outcome::Idle);
        };

        let n = match stream.read(recv.unfilled_mut()) {
            Ok(0) => return Err(JobError::Eof),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.readiness.readable = false;
                return self.idle_or_hangup();
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Outcome::Idle),
            Err(e) => return Err(e.into()),
        };

        recv.advance(n);
        self.last_activity = 'r';
        if !recv.is_complete() {
            return Ok(Outcome::Progress);
        }

        if self.state == JobState::ReceivingMarker {
            accept_marker(recv)?;
            self.state = JobState::ReceivingBody;
            return Ok(Outcome::Progress);
        }

        self.complete_call(registry, rng)
    }

    /// Validate the received reply and either start the next cycle or close.
    fn complete_call<R: Rng>(
        &mut self,
        registry: &Registry,
        rng: &mut R,
    ) -> Result<Outcome, JobError> {
        let Some(recv) = self.recv.as_ref() else {
            return Ok(Outcome::Idle);
        };
        self.check_reply(recv.filled())?;
        let latency = recv.begin().elapsed();

        self.ncalls += 1;
        self.last_activity = 'R';

        if self.ncalls < self.max_calls {
            self.build_request(rng);
            self.state = JobState::Sending;
            self.reregister(registry)?;
            Ok(Outcome::Completed(latency))
        } else {
            trace!(job = %self.name, calls = self.ncalls, "Call budget spent");
            self.last_activity = '@';
            self.close(registry);
            Ok(Outcome::Finished(latency))
        }
    }

    /// Check a reply body against the request in flight.
    fn check_reply(&self, body: &[u8]) -> Result<(), ProtocolError> {
        let reply = rpc::decode_reply(body)?;

        if reply.xid != self.xid {
            return Err(ProtocolError::XidMismatch {
                expected: self.xid,
                got: reply.xid,
            });
        }

        match reply.status {
            ReplyStatus::Denied(stat) => return Err(ProtocolError::Denied(stat)),
            ReplyStatus::Accepted(stat) if stat != SUCCESS => {
                return Err(ProtocolError::Rejected(stat))
            }
            ReplyStatus::Accepted(_) => {}
        }

        let sum = rpc::decode_u32(reply.results)?;
        if sum != self.sum {
            return Err(ProtocolError::ChecksumMismatch {
                expected: self.sum,
                got: sum,
            });
        }
        Ok(())
    }

    fn idle_or_hangup(&self) -> Result<Outcome, JobError> {
        if self.readiness.hangup {
            Err(JobError::Hangup)
        } else {
            Ok(Outcome::Idle)
        }
    }

    fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.interest();
        if let Some(stream) = self.stream.as_mut() {
            registry.reregister(stream, Token(self.id), interest)?;
        }
        Ok(())
    }

    /// Deregister and close the socket, dropping both buffers.
    pub fn close(&mut self, registry: &Registry) {
        if let Some(mut stream) = self.stream.take() {
            let _ = registry.deregister(&mut stream);
        }
        self.send = None;
        self.recv = None;
        self.readiness = Readiness::default();
        self.state = JobState::Closed;
    }

    /// Log the job's buffers and readiness for diagnosing a failure.
    pub fn dump(&self) {
        let (send_pos, send_len) = self.send_progress().unwrap_or_default();
        let (recv_pos, recv_len) = self.recv_progress().unwrap_or_default();
        warn!(
            job = %self.name,
            fd = self.fd(),
            state = ?self.state,
            xid = format_args!("{:#010x}", self.xid),
            calls = self.ncalls,
            send_len,
            send_pos,
            recv_len,
            recv_pos,
            readiness = ?self.readiness,
            "Job state"
        );
    }
}

/// Check a freshly received record marker and retarget the buffer.
fn accept_marker(recv: &mut RecvBuffer) -> Result<(), ProtocolError> {
    let marker = RecordMarker::decode(recv.filled()).ok_or(ProtocolError::ShortRecord(0))?;
    if !marker.last {
        return Err(ProtocolError::Fragmented);
    }
    if marker.len < MIN_RECORD_LEN {
        return Err(ProtocolError::ShortRecord(marker.len));
    }
    if marker.len > MAX_RECORD_LEN {
        return Err(ProtocolError::LongRecord(marker.len));
    }
    recv.expect(marker.len as usize);
    Ok(())
}
