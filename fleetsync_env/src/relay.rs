//! Relay transport abstraction for cross-context location events.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::EnvError;
use crate::types::RelayFrame;

/// Abstraction for the inbound side of the cross-context relay.
///
/// The mobile tracking client lives in a separate context and posts messages
/// at its own cadence. The engine only ever reads from the relay; no response
/// is sent back to the origin.
///
/// # Implementations
///
/// - **Production**: [`ChannelRelay`], fed by a [`RelaySender`] held by the
///   host bridge (websocket handler, message-port glue, ...)
/// - **Simulation**: channel-based with injectable reordering, loss and
///   corruption
///
/// # Frame Flow
///
/// ```text
/// Tracking client            Relay                     Engine
///   |                           |                          |
///   |-- post(payload) --------->|                          |
///   |                           |-- [delay/reorder] ------>|
///   |                           |                          |-- recv() -> frame
/// ```
#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    /// Receives the next frame.
    ///
    /// # Returns
    /// * `Some(frame)` - A frame was received
    /// * `None` - The relay was closed; no further frames will arrive
    async fn recv(&self) -> Option<RelayFrame>;

    /// Short label for logs.
    fn label(&self) -> &str;
}

/// Posting half of a [`ChannelRelay`].
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<RelayFrame>,
}

impl RelaySender {
    /// Posts a raw payload into the relay.
    pub fn post(&self, payload: impl Into<String>) -> Result<(), EnvError> {
        self.send(RelayFrame::new(payload))
    }

    /// Posts a prepared frame into the relay.
    pub fn send(&self, frame: RelayFrame) -> Result<(), EnvError> {
        self.tx
            .send(frame)
            .map_err(|_| EnvError::closed("channel-relay"))
    }
}

/// Production relay backed by an unbounded tokio channel.
pub struct ChannelRelay {
    /// Receiver behind a tokio mutex so `recv` can take `&self`
    rx: Mutex<mpsc::UnboundedReceiver<RelayFrame>>,
}

/// Creates a connected sender/relay pair.
pub fn channel_relay() -> (RelaySender, ChannelRelay) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RelaySender { tx },
        ChannelRelay { rx: Mutex::new(rx) },
    )
}

#[async_trait]
impl RelayTransport for ChannelRelay {
    async fn recv(&self) -> Option<RelayFrame> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn label(&self) -> &str {
        "channel-relay"
    }
}
