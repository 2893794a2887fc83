//! Protocol implementations.
//!
//! Wire codecs used by the runtime. Encoding and decoding work on plain
//! byte slices; the runtime owns all socket I/O.
//!
//! - `rpc`: ONC RPC call/reply messages with TCP record marking

pub mod rpc;
