//! Transport abstraction for the sync protocol.
//!
//! A [`Connection`] carries framed messages between two endpoints with
//! ordered, reliable delivery. Implementations may use WebSockets, TCP, or
//! anything else; [`memory`] provides an in-process pair for tests.

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;

use crate::codec;
use crate::error::Result;
use crate::messages::Msg;

/// One open, bidirectional connection.
///
/// Implementations must be thread-safe: a stream sender and the
/// connection's reader may use it concurrently.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one frame.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Receive the next frame. `None` means the peer closed the connection.
    ///
    /// Must be cancel-safe: stream loops race it against other events and
    /// drop the future when they lose.
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Close the sending half. The peer's `recv` then returns `None`.
    async fn close(&self);
}

/// Typed message helpers over any [`Connection`].
pub trait ConnectionExt: Connection {
    /// Encode and send a message.
    fn send_msg(&self, msg: impl Into<Msg> + Send) -> impl Future<Output = Result<()>> + Send;

    /// Receive and decode the next message.
    fn recv_msg(&self) -> impl Future<Output = Result<Option<Msg>>> + Send;
}

impl<C: Connection + ?Sized> ConnectionExt for C {
    async fn send_msg(&self, msg: impl Into<Msg> + Send) -> Result<()> {
        let frame = codec::encode(&msg.into())?;
        self.send(frame).await
    }

    async fn recv_msg(&self) -> Result<Option<Msg>> {
        match self.recv().await? {
            Some(frame) => codec::decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<C: Connection + ?Sized> Connection for std::sync::Arc<C> {
    async fn send(&self, frame: Bytes) -> Result<()> {
        (**self).send(frame).await
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        (**self).recv().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// A simple in-memory transport for testing.
///
/// Uses channels to simulate a duplex connection.
pub mod memory {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    use crate::error::SyncError;

    /// Frames buffered per direction before `send` waits.
    const CHANNEL_CAPACITY: usize = 1024;

    /// One end of an in-memory connection.
    pub struct MemoryConnection {
        tx: Mutex<Option<mpsc::Sender<Bytes>>>,
        rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    }

    /// Create two connected ends.
    pub fn pair() -> (MemoryConnection, MemoryConnection) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);

        (
            MemoryConnection {
                tx: Mutex::new(Some(a_tx)),
                rx: AsyncMutex::new(b_rx),
            },
            MemoryConnection {
                tx: Mutex::new(Some(b_tx)),
                rx: AsyncMutex::new(a_rx),
            },
        )
    }

    impl MemoryConnection {
        fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
            self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        async fn send(&self, frame: Bytes) -> Result<()> {
            let sender = self
                .sender()
                .ok_or_else(|| SyncError::Transport("connection closed".into()))?;
            sender
                .send(frame)
                .await
                .map_err(|_| SyncError::Transport("peer disconnected".into()))
        }

        async fn recv(&self) -> Result<Option<Bytes>> {
            let mut rx = self.rx.lock().await;
            Ok(rx.recv().await)
        }

        async fn close(&self) {
            self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
    }
}
