//! Client runtime for driving many RPC connections from one thread.
//!
//! Readiness-based model on mio (epoll on Linux, kqueue on macOS):
//! - `ClientPool`: job slots, the poller and run statistics
//! - `Job`: per-connection state machine
//! - `Timeout`: poll wait bound from job deadlines
//! - `SendBuffer` / `RecvBuffer`: partial transfer tracking

mod buffer;
mod error;
mod job;
mod pool;
mod timeout;

pub use pool::{ClientPool, PoolConfig, PoolStats};
