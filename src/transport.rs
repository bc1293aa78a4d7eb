//! The transport capability boundary.
//!
//! ICE negotiation and data-channel transport are an external collaborator;
//! this module fixes the interface the link state machine drives. A
//! transport hands out [`Session`]s, a session exchanges descriptions and
//! candidates and carries [`DataChannel`]s. Only first-candidate gathering
//! is required of implementations — the handshake never aggregates a
//! trickle of candidates.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// A transport-level rejection (bad description, bad candidate, closed
/// session). The link layer maps these into its own error taxonomy.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SessionError(String);

impl SessionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Which half of the description exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// A local or remote network description, as exchanged in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

/// A network-reachability descriptor used to locate a direct path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

/// Connectivity of a session, observed through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    #[default]
    New,
    Connected,
    Disconnected,
}

/// Hands out peer sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn Session>, SessionError>;
}

/// One peer session: description/candidate exchange plus data channels.
///
/// Implementations must release their resources when dropped; `close` is
/// the explicit form and must be safe to call more than once.
#[async_trait]
pub trait Session: Send {
    /// Create a locally offered data channel (offering side).
    async fn create_channel(&mut self, label: &str) -> Result<DataChannel, SessionError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, SessionError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, SessionError>;

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), SessionError>;

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), SessionError>;

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), SessionError>;

    /// The first locally gathered candidate. First-candidate-wins is all
    /// the handshake needs.
    async fn local_candidate(&mut self) -> Result<IceCandidate, SessionError>;

    /// The next channel the remote peer opened on this session, or `None`
    /// once the session can no longer produce one.
    async fn next_incoming_channel(&mut self) -> Option<DataChannel>;

    fn connectivity(&self) -> watch::Receiver<Connectivity>;

    async fn close(&mut self);
}

/// Application side of a data channel: a byte pipe plus an open signal.
#[derive(Debug)]
pub struct DataChannel {
    label: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    opened: watch::Receiver<bool>,
}

/// Transport side of a data channel, produced by [`DataChannel::pipe`].
/// Implementations push received frames into `inbound`, drain `outbound`
/// onto the wire, and flip `opened` once the channel is usable.
#[derive(Debug)]
pub struct ChannelEndpoint {
    pub label: String,
    pub inbound: mpsc::UnboundedSender<Vec<u8>>,
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pub opened: watch::Sender<bool>,
}

impl DataChannel {
    /// Build a connected (application, transport) pair for one channel.
    pub fn pipe(label: &str) -> (DataChannel, ChannelEndpoint) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = watch::channel(false);

        let channel = DataChannel {
            label: label.to_string(),
            outbound: outbound_tx,
            inbound: inbound_rx,
            opened: opened_rx,
        };
        let endpoint = ChannelEndpoint {
            label: label.to_string(),
            inbound: inbound_tx,
            outbound: outbound_rx,
            opened: opened_tx,
        };
        (channel, endpoint)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// A handle for writing frames; clones stay valid as long as the
    /// transport keeps the channel alive.
    pub fn sender(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.outbound.clone()
    }

    /// The next inbound frame, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    pub fn is_open(&self) -> bool {
        *self.opened.borrow()
    }

    /// Wait until the channel opens. Returns `false` if the transport
    /// abandoned the channel before it ever opened.
    pub async fn wait_open(&mut self) -> bool {
        self.opened.wait_for(|open| *open).await.is_ok()
    }
}
