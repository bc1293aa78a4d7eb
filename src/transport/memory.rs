//! In-process transport.
//!
//! Sessions opened from clones of one [`MemoryTransport`] share a hub and
//! can reach each other; descriptions and candidates carry the hub tokens
//! that a real transport would express as SDP. Channels open only once the
//! offering side has applied the answer description and its candidate,
//! matching the observable order of a real negotiation. Used by the test
//! suites and for same-process links.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{
    ChannelEndpoint, Connectivity, DataChannel, DescriptionKind, IceCandidate, Session,
    SessionDescription, SessionError, Transport,
};

const DESCRIPTION_PREFIX: &str = "memory-session ";
const CANDIDATE_PREFIX: &str = "memory-candidate ";

/// An in-process [`Transport`]. Clones share the same hub.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_session(&self) -> Result<Box<dyn Session>, SessionError> {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (connectivity_tx, connectivity_rx) = watch::channel(Connectivity::New);

        self.hub.lock().insert(
            id,
            HubEntry {
                incoming: incoming_tx,
                connectivity: Arc::new(connectivity_tx),
                pending: Vec::new(),
                pipes: Vec::new(),
                peer: None,
            },
        );

        Ok(Box::new(MemorySession {
            id,
            hub: self.hub.clone(),
            incoming: incoming_rx,
            connectivity: connectivity_rx,
            remote: None,
        }))
    }
}

#[derive(Default)]
struct Hub {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, HubEntry>>,
}

struct HubEntry {
    incoming: mpsc::UnboundedSender<DataChannel>,
    connectivity: Arc<watch::Sender<Connectivity>>,
    /// Locally created channels waiting for the handshake to complete
    pending: Vec<ChannelEndpoint>,
    pipes: Vec<JoinHandle<()>>,
    peer: Option<u64>,
}

impl Hub {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, HubEntry>> {
        self.sessions.lock().expect("memory hub poisoned")
    }

    /// Wire `local`'s pending channels through to `remote`. Runs when the
    /// offering side applies the remote candidate; on the answering side
    /// (no pending channels) it only records the pairing.
    fn connect(&self, local: u64, remote: u64) {
        let mut sessions = self.lock();

        let (pending, local_connectivity) = match sessions.get_mut(&local) {
            Some(entry) => {
                entry.peer = Some(remote);
                (
                    std::mem::take(&mut entry.pending),
                    entry.connectivity.clone(),
                )
            }
            None => return,
        };
        let (remote_incoming, remote_connectivity) = match sessions.get_mut(&remote) {
            Some(entry) => {
                entry.peer = Some(local);
                (entry.incoming.clone(), entry.connectivity.clone())
            }
            // the peer vanished; dropping the pending endpoints closes
            // the local channels
            None => return,
        };

        if pending.is_empty() {
            return;
        }

        let mut pipes = Vec::with_capacity(pending.len() * 2);
        for endpoint in pending {
            let (remote_channel, remote_endpoint) = DataChannel::pipe(&endpoint.label);
            let ChannelEndpoint {
                inbound: local_in,
                outbound: local_out,
                opened: local_opened,
                ..
            } = endpoint;
            let ChannelEndpoint {
                inbound: remote_in,
                outbound: remote_out,
                opened: remote_opened,
                ..
            } = remote_endpoint;

            let _ = local_opened.send(true);
            let _ = remote_opened.send(true);
            pipes.push(tokio::spawn(forward(local_out, remote_in, local_opened)));
            pipes.push(tokio::spawn(forward(remote_out, local_in, remote_opened)));
            let _ = remote_incoming.send(remote_channel);
        }

        let _ = local_connectivity.send(Connectivity::Connected);
        let _ = remote_connectivity.send(Connectivity::Connected);

        if let Some(entry) = sessions.get_mut(&local) {
            entry.pipes.extend(pipes);
        }
    }

    fn close(&self, id: u64) {
        let mut sessions = self.lock();
        let Some(entry) = sessions.remove(&id) else {
            return;
        };
        for pipe in &entry.pipes {
            pipe.abort();
        }
        let _ = entry.connectivity.send(Connectivity::Disconnected);
        if let Some(peer) = entry.peer
            && let Some(peer_entry) = sessions.get(&peer)
        {
            let _ = peer_entry.connectivity.send(Connectivity::Disconnected);
        }
    }
}

/// One direction of a wired channel. Holding the opened sender keeps the
/// app-side watch alive for as long as frames can still flow.
async fn forward(
    mut from: mpsc::UnboundedReceiver<Vec<u8>>,
    to: mpsc::UnboundedSender<Vec<u8>>,
    _opened: watch::Sender<bool>,
) {
    while let Some(frame) = from.recv().await {
        if to.send(frame).is_err() {
            break;
        }
    }
}

struct MemorySession {
    id: u64,
    hub: Arc<Hub>,
    incoming: mpsc::UnboundedReceiver<DataChannel>,
    connectivity: watch::Receiver<Connectivity>,
    remote: Option<u64>,
}

fn token(text: &str, prefix: &str) -> Option<u64> {
    text.strip_prefix(prefix)?.parse().ok()
}

#[async_trait]
impl Session for MemorySession {
    async fn create_channel(&mut self, label: &str) -> Result<DataChannel, SessionError> {
        let (channel, endpoint) = DataChannel::pipe(label);
        let mut sessions = self.hub.lock();
        match sessions.get_mut(&self.id) {
            Some(entry) => {
                entry.pending.push(endpoint);
                Ok(channel)
            }
            None => Err(SessionError::new("the session is closed")),
        }
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, SessionError> {
        Ok(SessionDescription {
            kind: DescriptionKind::Offer,
            sdp: format!("{DESCRIPTION_PREFIX}{}", self.id),
        })
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, SessionError> {
        if self.remote.is_none() {
            return Err(SessionError::new("no remote description has been applied"));
        }
        Ok(SessionDescription {
            kind: DescriptionKind::Answer,
            sdp: format!("{DESCRIPTION_PREFIX}{}", self.id),
        })
    }

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), SessionError> {
        match token(&description.sdp, DESCRIPTION_PREFIX) {
            Some(id) if id == self.id => Ok(()),
            _ => Err(SessionError::new(
                "the description does not belong to this session",
            )),
        }
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), SessionError> {
        let Some(id) = token(&description.sdp, DESCRIPTION_PREFIX) else {
            return Err(SessionError::new(format!(
                "unrecognized session description '{}'",
                description.sdp
            )));
        };
        if !self.hub.lock().contains_key(&id) {
            return Err(SessionError::new("the described peer session is gone"));
        }
        self.remote = Some(id);
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), SessionError> {
        let id = token(&candidate.candidate, CANDIDATE_PREFIX);
        match (id, self.remote) {
            (Some(id), Some(remote)) if id == remote => {
                self.hub.connect(self.id, remote);
                Ok(())
            }
            (_, None) => Err(SessionError::new("no remote description has been applied")),
            _ => Err(SessionError::new(
                "the candidate does not match the remote description",
            )),
        }
    }

    async fn local_candidate(&mut self) -> Result<IceCandidate, SessionError> {
        Ok(IceCandidate {
            candidate: format!("{CANDIDATE_PREFIX}{}", self.id),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        })
    }

    async fn next_incoming_channel(&mut self) -> Option<DataChannel> {
        self.incoming.recv().await
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.clone()
    }

    async fn close(&mut self) {
        self.hub.close(self.id);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.hub.close(self.id);
    }
}
