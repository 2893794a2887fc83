//! In-process sum service for driving the pool in tests.
//!
//! Runs on its own tokio runtime so the pool under test can keep its
//! single-threaded mio loop on the test thread.

use crate::protocols::rpc::message::{decode_call, encode_denied, encode_reply};
use crate::protocols::rpc::{RecordMarker, MARKER_LEN, SUCCESS};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;

/// How the service answers each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Correct sum with the request's xid.
    Sum,
    /// Correct sum under a different xid.
    WrongXid,
    /// Sum with one bit flipped.
    CorruptSum,
    /// A record shorter than any valid reply.
    ShortRecord,
    /// A correct reply without the last-fragment bit.
    Fragmented,
    /// MSG_DENIED.
    Denied,
    /// Read this many bytes of the first request, then close.
    CloseAfter(usize),
    /// Read requests and never answer.
    Silent,
}

pub struct MockServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    answered: Arc<AtomicUsize>,
    _runtime: Runtime,
}

impl MockServer {
    pub fn start(behavior: Behavior) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let accepted = Arc::new(AtomicUsize::new(0));
        let answered = Arc::new(AtomicUsize::new(0));

        let (acc, ans) = (accepted.clone(), answered.clone());
        runtime.spawn(async move {
            let listener = TcpListener::from_std(listener).unwrap();
            while let Ok((stream, _)) = listener.accept().await {
                acc.fetch_add(1, Ordering::Relaxed);
                let ans = ans.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, behavior, ans).await;
                });
            }
        });

        Self {
            addr,
            accepted,
            answered,
            _runtime: runtime,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Replies written so far.
    pub fn answered(&self) -> usize {
        self.answered.load(Ordering::Relaxed)
    }
}

async fn serve(
    mut stream: TcpStream,
    behavior: Behavior,
    answered: Arc<AtomicUsize>,
) -> std::io::Result<()> {
    if let Behavior::CloseAfter(n) = behavior {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).await?;
        return Ok(());
    }

    loop {
        let mut marker = [0u8; MARKER_LEN];
        stream.read_exact(&mut marker).await?;
        let len = RecordMarker::decode(&marker).map_or(0, |m| m.len as usize);
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;

        let Ok((header, args)) = decode_call(&body) else {
            return Ok(());
        };
        let sum = args.iter().fold(0u32, |acc, v| acc.wrapping_add(*v));

        let mut reply = BytesMut::new();
        match behavior {
            Behavior::Sum => encode_reply(header.xid, SUCCESS, &[sum], &mut reply),
            Behavior::WrongXid => {
                encode_reply(header.xid.wrapping_add(1), SUCCESS, &[sum], &mut reply)
            }
            Behavior::CorruptSum => encode_reply(header.xid, SUCCESS, &[sum ^ 0x100], &mut reply),
            Behavior::ShortRecord => {
                reply.extend_from_slice(&RecordMarker::last(8).encode());
                reply.extend_from_slice(&header.xid.to_be_bytes());
                reply.extend_from_slice(&1u32.to_be_bytes());
            }
            Behavior::Fragmented => {
                encode_reply(header.xid, SUCCESS, &[sum], &mut reply);
                reply[0] &= 0x7f;
            }
            Behavior::Denied => encode_denied(header.xid, 1, &mut reply),
            Behavior::Silent => continue,
            Behavior::CloseAfter(_) => unreachable!(),
        }

        stream.write_all(&reply).await?;
        answered.fetch_add(1, Ordering::Relaxed);
    }
}
