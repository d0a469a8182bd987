//! Transport abstraction.
//!
//! The core needs exactly one thing from a transport: a reliable,
//! ordered, bidirectional message channel per peer. WebSocket framing,
//! QUIC streams, stdio — all out of tree; they implement [`PeerChannel`]
//! and hand it to the orchestrator.

use crate::error::{SyncError, SyncResult};
use crate::protocol::Message;
use async_trait::async_trait;

/// A reliable ordered message channel to one peer.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Sends a message. Errors are transport failures, not protocol
    /// rejections.
    async fn send(&self, message: Message) -> SyncResult<()>;

    /// Receives the next message. Returns `None` once the channel is
    /// closed.
    async fn recv(&self) -> Option<Message>;

    /// Closes the channel; subsequent sends fail, pending `recv`s
    /// resolve `None`.
    async fn close(&self);
}

/// In-memory channel pair for tests.
pub mod mock {
    use super::*;
    use tokio::sync::{mpsc, Mutex};

    /// One end of an in-memory duplex channel.
    pub struct MockChannel {
        tx: mpsc::Sender<Message>,
        rx: Mutex<mpsc::Receiver<Message>>,
    }

    /// Creates a connected pair of channel ends.
    #[must_use]
    pub fn channel_pair() -> (MockChannel, MockChannel) {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        (
            MockChannel {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            MockChannel {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }

    #[async_trait]
    impl PeerChannel for MockChannel {
        async fn send(&self, message: Message) -> SyncResult<()> {
            self.tx
                .send(message)
                .await
                .map_err(|_| SyncError::ChannelClosed)
        }

        async fn recv(&self) -> Option<Message> {
            self.rx.lock().await.recv().await
        }

        async fn close(&self) {
            self.rx.lock().await.close();
        }
    }
}
