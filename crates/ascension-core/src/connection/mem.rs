use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::{RpcFrame, TransportError};

use super::ConnectionBackend;

const CHANNEL_CAPACITY: usize = 64;

/// In-process connection half. Frames sent on one half arrive on the other.
#[derive(Clone, Debug)]
pub struct MemConnection {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    tx: mpsc::Sender<RpcFrame>,
    rx: tokio::sync::Mutex<mpsc::Receiver<RpcFrame>>,
    closed: AtomicBool,
}

impl MemConnection {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let inner_a = Arc::new(MemInner {
            tx: tx_b,
            rx: tokio::sync::Mutex::new(rx_a),
            closed: AtomicBool::new(false),
        });

        let inner_b = Arc::new(MemInner {
            tx: tx_a,
            rx: tokio::sync::Mutex::new(rx_b),
            closed: AtomicBool::new(false),
        });

        (Self { inner: inner_a }, Self { inner: inner_b })
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl ConnectionBackend for MemConnection {
    async fn send(&self, frame: RpcFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        self.inner
            .tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<RpcFrame, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut rx = self.inner.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
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
    use crate::{SerializedPayload, UpstreamEvent};

    #[tokio::test]
    async fn frames_cross_the_pair() {
        let (a, b) = MemConnection::pair();
        let frame = RpcFrame::upstream(1, UpstreamEvent::Data(SerializedPayload::empty()));
        a.send(frame.clone()).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn close_stops_both_directions() {
        let (a, b) = MemConnection::pair();
        a.close();
        assert!(!a.is_active());
        let frame = RpcFrame::upstream(1, UpstreamEvent::Cancel);
        assert!(matches!(
            a.send(frame).await,
            Err(TransportError::Closed)
        ));
        drop(a);
        assert!(matches!(b.receive().await, Err(TransportError::Closed)));
    }
}
