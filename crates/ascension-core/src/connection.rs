//! Connection enum and internal backend trait.
//!
//! The public API is the [`Connection`] enum. Each backend lives in its own
//! module under `connection/` and implements the internal
//! [`ConnectionBackend`] trait.

use crate::{RpcFrame, TransportError};

pub(crate) trait ConnectionBackend: Send + Sync + Clone + 'static {
    async fn send(&self, frame: RpcFrame) -> Result<(), TransportError>;
    async fn receive(&self) -> Result<RpcFrame, TransportError>;
    fn close(&self);
    fn is_active(&self) -> bool;
}

/// An established, ordered, reliable frame channel to one peer.
///
/// `send` may be called concurrently from many tasks; `receive` is intended
/// for a single reader (the protocol dispatcher's read loop).
#[derive(Clone, Debug)]
pub enum Connection {
    Mem(mem::MemConnection),
    Stream(stream::StreamConnection),
}

impl Connection {
    pub async fn send(&self, frame: RpcFrame) -> Result<(), TransportError> {
        match self {
            Connection::Mem(c) => c.send(frame).await,
            Connection::Stream(c) => c.send(frame).await,
        }
    }

    /// Receive the next inbound frame, suspending until one is available or
    /// the connection closes.
    pub async fn receive(&self) -> Result<RpcFrame, TransportError> {
        match self {
            Connection::Mem(c) => c.receive().await,
            Connection::Stream(c) => c.receive().await,
        }
    }

    pub fn close(&self) {
        match self {
            Connection::Mem(c) => c.close(),
            Connection::Stream(c) => c.close(),
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Connection::Mem(c) => c.is_active(),
            Connection::Stream(c) => c.is_active(),
        }
    }

    /// A connected in-process pair, for tests and loopback wiring.
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemConnection::pair();
        (Connection::Mem(a), Connection::Mem(b))
    }

    /// Wrap an ordered byte stream (a TCP socket, a duplex pipe, ...).
    pub fn stream<S>(io: S) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Connection::Stream(stream::StreamConnection::new(io))
    }

    /// A connected pair over an in-memory duplex byte stream.
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamConnection::pair();
        (Connection::Stream(a), Connection::Stream(b))
    }
}

pub mod mem;
pub mod stream;
