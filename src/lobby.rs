//! Lobby orchestration: the public entry points, and the host-side
//! bookkeeping that turns relayed join requests into registered clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::Error;
use crate::link::{LinkRequest, LinkResponse, PeerLink};
use crate::signaling::{
    HostConnection, JoinRequest, LobbyDetails, LobbyDetailsUpdate, connect_host, list_lobbies,
    request_join,
};
use crate::transport::Transport;

pub type ClientId = u32;

/// Deadline granted to each joining client's handshake on the host side.
const ANSWER_WAIT: Duration = Duration::from_secs(5);

/// What to register with the service when creating a lobby.
#[derive(Debug, Clone)]
pub struct LobbyOptions {
    /// Leave empty to let the service pick a name
    pub lobby_name: Option<String>,
    pub public_lobby: bool,
    /// Clamped into `(0, 500]` before the request is sent
    pub max_clients: Option<u16>,
}

impl Default for LobbyOptions {
    fn default() -> Self {
        Self {
            lobby_name: None,
            public_lobby: true,
            max_clients: None,
        }
    }
}

/// Filters for the public lobby listing.
#[derive(Debug, Clone, Copy)]
pub struct LobbyQuery {
    pub maximum_lobbies: u16,
    /// Minimum free seats a lobby must have to be listed
    pub minimum_capacity: u16,
}

/// A client the host accepted: its link plus the identity the host
/// assigned to it.
#[derive(Clone)]
pub struct ClientConnection {
    pub id: ClientId,
    pub link: PeerLink,
}

/// What happens to a lobby over its lifetime.
pub enum LobbyEvent {
    ClientConnected(ClientConnection),
    ClientDisconnected(ClientId),
    /// The control channel is gone: no new clients can join. Established
    /// links keep working.
    Closed,
}

/// A lobby as seen by its host.
pub struct LobbyHost {
    connection: Arc<HostConnection>,
    clients: Arc<Mutex<HashMap<ClientId, PeerLink>>>,
    events: mpsc::UnboundedReceiver<LobbyEvent>,
}

impl std::fmt::Debug for LobbyHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LobbyHost").finish_non_exhaustive()
    }
}

/// Register a lobby with the rendezvous service and start serving joins.
pub async fn create_lobby(
    transport: Arc<dyn Transport>,
    service_url: &str,
    options: LobbyOptions,
    wait: Duration,
) -> Result<LobbyHost, Error> {
    let (connection, join_requests) = connect_host(
        service_url,
        options.lobby_name,
        options.public_lobby,
        options.max_clients,
        wait,
    )
    .await?;
    let connection = Arc::new(connection);
    let clients: Arc<Mutex<HashMap<ClientId, PeerLink>>> = Arc::default();
    let (events, event_queue) = mpsc::unbounded_channel();

    tokio::spawn(serve_joins(
        transport,
        connection.clone(),
        clients.clone(),
        events,
        join_requests,
    ));

    Ok(LobbyHost {
        connection,
        clients,
        events: event_queue,
    })
}

/// Join a lobby and come back with a direct link to its host. One deadline
/// budget spans the offer build, the service exchange, and the wait for
/// the channel to open.
pub async fn join_lobby(
    transport: Arc<dyn Transport>,
    service_url: &str,
    lobby_name: Option<&str>,
    wait: Duration,
) -> Result<PeerLink, Error> {
    let started = Instant::now();

    let request = LinkRequest::create(transport.as_ref()).await?;

    let remaining = wait.saturating_sub(started.elapsed());
    let answer = match request_join(service_url, request.offer(), lobby_name, remaining).await {
        Ok(answer) => answer,
        Err(error) => {
            // the lobby lookup failed; the pending offer session goes too
            request.close().await;
            return Err(error);
        }
    };

    let remaining = wait.saturating_sub(started.elapsed());
    request.open_link(&answer, remaining).await
}

/// Fetch public lobbies with at least `minimum_capacity` free seats, at
/// most `maximum_lobbies` of them.
pub async fn list_public_lobbies(
    service_url: &str,
    query: LobbyQuery,
    wait: Duration,
) -> Result<Vec<LobbyDetails>, Error> {
    list_lobbies(
        service_url,
        query.maximum_lobbies,
        query.minimum_capacity,
        wait,
    )
    .await
}

/// Services relayed join requests for the lifetime of the control channel,
/// then reports the closure.
async fn serve_joins(
    transport: Arc<dyn Transport>,
    connection: Arc<HostConnection>,
    clients: Arc<Mutex<HashMap<ClientId, PeerLink>>>,
    events: mpsc::UnboundedSender<LobbyEvent>,
    mut join_requests: mpsc::UnboundedReceiver<JoinRequest>,
) {
    // per-host identity counter, shared by the concurrent admissions
    let next_id = Arc::new(AtomicU32::new(0));

    while let Some(request) = join_requests.recv().await {
        tokio::spawn(admit_client(
            transport.clone(),
            connection.clone(),
            clients.clone(),
            events.clone(),
            next_id.clone(),
            request,
        ));
    }

    let _ = events.send(LobbyEvent::Closed);
}

/// One join request, end to end: produce the answer, relay it, and if the
/// peer's channel arrives, register the client until its link closes. A
/// request that fails along the way is dropped — the joiner's own deadline
/// covers it.
async fn admit_client(
    transport: Arc<dyn Transport>,
    connection: Arc<HostConnection>,
    clients: Arc<Mutex<HashMap<ClientId, PeerLink>>>,
    events: mpsc::UnboundedSender<LobbyEvent>,
    next_id: Arc<AtomicU32>,
    request: JoinRequest,
) {
    let Ok(offer) = hex::decode(&request.offer) else {
        debug!("ignoring a join request with an unreadable offer");
        return;
    };

    let response = match LinkResponse::create(transport.as_ref(), &offer, ANSWER_WAIT).await {
        Ok(response) => response,
        Err(error) => {
            debug!("could not answer a join request: {error}");
            return;
        }
    };

    if connection
        .send_invitation(hex::encode(response.answer()), request.request_id)
        .is_err()
    {
        // nothing to relay through; the pending session times itself out
        return;
    }

    let link = match response.link().await {
        Ok(link) => link,
        Err(error) => {
            debug!("a joining peer never connected: {error}");
            return;
        }
    };

    let id = next_id.fetch_add(1, Ordering::Relaxed);
    clients
        .lock()
        .expect("client registry poisoned")
        .insert(id, link.clone());
    info!(client = id, "client connected");
    let _ = events.send(LobbyEvent::ClientConnected(ClientConnection {
        id,
        link: link.clone(),
    }));

    // registered iff not disconnected: the same task that inserted the
    // entry removes it when the link goes down
    link.closed().await;
    clients
        .lock()
        .expect("client registry poisoned")
        .remove(&id);
    info!(client = id, "client disconnected");
    let _ = events.send(LobbyEvent::ClientDisconnected(id));
}

impl LobbyHost {
    /// The cached lobby details, as of the service's last push.
    pub fn details(&self) -> LobbyDetails {
        self.connection.details()
    }

    /// Ask the service to adopt new details and wait for its push. The
    /// update may still land later if the deadline fires first.
    pub async fn update_details(
        &self,
        update: LobbyDetailsUpdate,
        wait: Duration,
    ) -> Result<LobbyDetails, Error> {
        self.connection.update_details(update, wait).await
    }

    /// The link for one connected client, if it is still connected.
    pub fn client(&self, id: ClientId) -> Option<PeerLink> {
        self.clients
            .lock()
            .expect("client registry poisoned")
            .get(&id)
            .cloned()
    }

    /// How many clients currently hold an open link.
    pub fn connected_clients(&self) -> usize {
        self.clients.lock().expect("client registry poisoned").len()
    }

    /// The next lifecycle event. `None` after [`LobbyEvent::Closed`] has
    /// been consumed and the lobby is fully wound down.
    pub async fn next_event(&mut self) -> Option<LobbyEvent> {
        self.events.recv().await
    }

    /// Close the lobby: no more clients can join, established links
    /// remain. Also what happens if the signaling service goes away.
    pub fn close(&self) {
        self.connection.close();
    }
}
