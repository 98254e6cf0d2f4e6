//! Connection backend over an ordered byte stream.
//!
//! Frames are sent as a little-endian `u32` length prefix followed by the
//! JSON-serialized [`RpcFrame`], so the wire carries the event catalogue names
//! verbatim.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::{RpcFrame, TransportError};

use super::ConnectionBackend;

/// Frames larger than this are rejected before allocation.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection").finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
}

impl StreamConnection {
    pub fn new<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl ConnectionBackend for StreamConnection {
    async fn send(&self, frame: RpcFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let body = serde_json::to_vec(&frame).map_err(TransportError::Frame)?;

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<RpcFrame, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut reader = self.inner.reader.lock().await;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(e)
            }
        })?;
        let body_len = u32::from_le_bytes(len_buf) as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {body_len} bytes exceeds limit {MAX_FRAME_LEN}"),
            )));
        }

        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;

        serde_json::from_slice(&body).map_err(TransportError::Frame)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        !self.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DownstreamEvent, SerializedPayload, ServiceCallIdentifier, UpstreamEvent};

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (a, b) = StreamConnection::pair();

        let open = RpcFrame::upstream(
            3,
            UpstreamEvent::Open {
                service_call: ServiceCallIdentifier::new("Hello", "hello"),
                payload: SerializedPayload::from(b"\"name\"".to_vec()),
            },
        );
        a.send(open.clone()).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), open);

        let response = RpcFrame::downstream(
            3,
            DownstreamEvent::Response(SerializedPayload::from(b"\"hi\"".to_vec())),
        );
        b.send(response.clone()).await.unwrap();
        assert_eq!(a.receive().await.unwrap(), response);
    }

    #[tokio::test]
    async fn peer_hangup_reads_as_closed() {
        let (a, b) = StreamConnection::pair();
        drop(b);
        assert!(matches!(a.receive().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn frames_queue_in_order() {
        let (a, b) = StreamConnection::pair();
        for reference in 0..10u32 {
            a.send(RpcFrame::upstream(reference, UpstreamEvent::Cancel))
                .await
                .unwrap();
        }
        for reference in 0..10u32 {
            assert_eq!(b.receive().await.unwrap().call_reference, reference);
        }
    }
}
