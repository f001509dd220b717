//! Relay-side handle to a client control channel
//!
//! The transport owns the socket; relays only see a [`ControlChannel`] for
//! sending and receive inbound traffic as typed [`ChannelEvent`]s.

use portway_proto::TunnelMessage;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::error::RelayError;

/// Inbound transport events, dispatched one at a time per channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(TunnelMessage),
    /// A frame arrived that is not a valid message
    Malformed(String),
    /// The peer closed the channel
    Closed,
    /// The transport failed
    Error(String),
}

impl ChannelEvent {
    /// Whether the channel is finished after this event
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelEvent::Closed | ChannelEvent::Error(_))
    }
}

/// Cloneable sender half of a control channel
#[derive(Debug, Clone)]
pub struct ControlChannel {
    id: String,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::Sender<TunnelMessage>,
    shutdown: CancellationToken,
}

impl ControlChannel {
    /// Create a channel with a bounded outbound queue
    ///
    /// The receiver is drained by the transport's writer.
    pub fn new(
        peer_addr: Option<SocketAddr>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<TunnelMessage>) {
        let (outbound, rx) = mpsc::channel(buffer.max(1));
        let channel = Self {
            id: Uuid::new_v4().to_string(),
            peer_addr,
            outbound,
            shutdown: CancellationToken::new(),
        };
        (channel, rx)
    }

    /// Connection id, also used as the tunnel id
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue a message, waiting for buffer space
    pub async fn send(&self, msg: TunnelMessage) -> Result<(), RelayError> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::Channel(format!("channel {} is closed", self.id)));
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                Err(RelayError::Channel(format!("channel {} is closed", self.id)))
            }
            sent = self.outbound.send(msg) => sent.map_err(|_| {
                RelayError::Channel(format!("channel {} writer has stopped", self.id))
            }),
        }
    }

    /// Ask the transport to stop. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbound.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }
}
