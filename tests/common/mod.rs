//! A mock rendezvous service for the integration suite.
//!
//! Implements the service boundary the crate talks to: a WebSocket host
//! endpoint and a one-shot POST endpoint for joiners, a lobby table, and
//! the join relay with request-id correlation. Behavior only — the real
//! service lives elsewhere.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{any, post};
use tokio::sync::{mpsc, oneshot};

use tether::signaling::{LobbyDetails, SignalErrorKind, SignalMessage};

/// How long the service holds a join request open for the host's answer.
const RELAY_WAIT: Duration = Duration::from_secs(10);

pub struct RendezvousService {
    addr: SocketAddr,
}

impl RendezvousService {
    pub async fn spawn() -> RendezvousService {
        let _ = tracing_subscriber::fmt::try_init();

        let state = Arc::new(ServiceState::default());
        let app = Router::new()
            .route("/api/client", post(client_endpoint))
            .route("/api/host", any(host_endpoint))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        RendezvousService { addr }
    }

    pub fn host_url(&self) -> String {
        format!("ws://{}/api/host", self.addr)
    }

    pub fn client_url(&self) -> String {
        format!("http://{}/api/client", self.addr)
    }
}

#[derive(Default)]
struct ServiceState {
    lobbies: Mutex<HashMap<String, LobbyEntry>>,
    next_lobby: AtomicU32,
    next_request: AtomicU32,
}

struct LobbyEntry {
    details: LobbyDetails,
    to_host: mpsc::UnboundedSender<SignalMessage>,
    pending: HashMap<String, oneshot::Sender<SignalMessage>>,
}

fn error_frame(error_type: SignalErrorKind, error: impl Into<String>) -> SignalMessage {
    SignalMessage::Error {
        error_type,
        error: error.into(),
    }
}

async fn send(socket: &mut WebSocket, message: &SignalMessage) -> Result<(), axum::Error> {
    let body = serde_json::to_string(message).unwrap();
    socket.send(Message::Text(body.into())).await
}

async fn host_endpoint(
    State(state): State<Arc<ServiceState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| host_session(state, socket))
}

async fn host_session(state: Arc<ServiceState>, mut socket: WebSocket) {
    let Some(Ok(Message::Text(text))) = socket.recv().await else {
        return;
    };
    let Ok(SignalMessage::CreateLobby {
        lobby_name,
        public_lobby,
        max_clients,
    }) = serde_json::from_str(text.as_str())
    else {
        let _ = send(
            &mut socket,
            &error_frame(SignalErrorKind::InvalidMessage, "expected create-lobby"),
        )
        .await;
        return;
    };

    let mut name = lobby_name.unwrap_or_else(|| {
        format!("lobby-{}", state.next_lobby.fetch_add(1, Ordering::Relaxed))
    });
    let details = LobbyDetails {
        lobby_name: name.clone(),
        public_lobby,
        max_clients,
        client_count: 0,
    };

    let (to_host, mut outbound) = mpsc::unbounded_channel();
    let collision = {
        let mut lobbies = state.lobbies.lock().unwrap();
        if lobbies.contains_key(&name) {
            true
        } else {
            lobbies.insert(
                name.clone(),
                LobbyEntry {
                    details: details.clone(),
                    to_host,
                    pending: HashMap::new(),
                },
            );
            false
        }
    };
    if collision {
        let _ = send(
            &mut socket,
            &error_frame(
                SignalErrorKind::LobbyAlreadyExists,
                format!("the lobby '{name}' already exists"),
            ),
        )
        .await;
        return;
    }
    let _ = send(&mut socket, &SignalMessage::LobbyDetails { details }).await;

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(message) => {
                    if send(&mut socket, &message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = socket.recv() => {
                let Some(Ok(frame)) = frame else { break };
                let Message::Text(text) = frame else { continue };
                let Ok(message) = serde_json::from_str::<SignalMessage>(text.as_str()) else {
                    continue;
                };
                match message {
                    SignalMessage::JoinInvitation { answer, request_id } => {
                        let relayed = {
                            let mut lobbies = state.lobbies.lock().unwrap();
                            let Some(entry) = lobbies.get_mut(&name) else { break };
                            let waiter =
                                request_id.as_ref().and_then(|id| entry.pending.remove(id));
                            if waiter.is_some() {
                                entry.details.client_count += 1;
                            }
                            waiter.map(|waiter| (waiter, entry.details.clone()))
                        };
                        if let Some((waiter, details)) = relayed {
                            let _ = waiter.send(SignalMessage::JoinInvitation { answer, request_id });
                            let _ = send(&mut socket, &SignalMessage::LobbyDetails { details }).await;
                        }
                    }
                    SignalMessage::LobbyDetails { details: requested } => {
                        let adopted = adopt_details(&state, &mut name, requested);
                        if let Some(details) = adopted {
                            let _ = send(&mut socket, &SignalMessage::LobbyDetails { details }).await;
                        }
                    }
                    _ => {
                        let _ = send(
                            &mut socket,
                            &error_frame(SignalErrorKind::InvalidMessage, "unexpected message"),
                        )
                        .await;
                    }
                }
            }
        }
    }

    state.lobbies.lock().unwrap().remove(&name);
}

/// Apply a host's requested details. Renames are honored when the new name
/// is free and silently ignored otherwise; the client count stays
/// service-owned.
fn adopt_details(
    state: &ServiceState,
    name: &mut String,
    requested: LobbyDetails,
) -> Option<LobbyDetails> {
    let mut lobbies = state.lobbies.lock().unwrap();
    if requested.lobby_name != *name && !lobbies.contains_key(&requested.lobby_name) {
        let mut entry = lobbies.remove(name)?;
        *name = requested.lobby_name.clone();
        entry.details = LobbyDetails {
            client_count: entry.details.client_count,
            ..requested
        };
        let adopted = entry.details.clone();
        lobbies.insert(name.clone(), entry);
        Some(adopted)
    } else {
        let entry = lobbies.get_mut(name)?;
        entry.details = LobbyDetails {
            lobby_name: name.clone(),
            client_count: entry.details.client_count,
            ..requested
        };
        Some(entry.details.clone())
    }
}

async fn client_endpoint(State(state): State<Arc<ServiceState>>, body: String) -> String {
    let reply = handle_client(state, body).await;
    serde_json::to_string(&reply).unwrap()
}

async fn handle_client(state: Arc<ServiceState>, body: String) -> SignalMessage {
    let Ok(message) = serde_json::from_str::<SignalMessage>(&body) else {
        return error_frame(SignalErrorKind::InvalidMessage, "unreadable request");
    };

    match message {
        SignalMessage::JoinRequest {
            lobby_name,
            offer,
            request_id,
        } => {
            let waiter = {
                let mut lobbies = state.lobbies.lock().unwrap();
                let target = match &lobby_name {
                    Some(name) => lobbies.contains_key(name).then(|| name.clone()),
                    None => lobbies
                        .iter()
                        .find(|(_, entry)| {
                            entry.details.public_lobby
                                && entry.details.client_count < entry.details.max_clients
                        })
                        .map(|(name, _)| name.clone()),
                };
                let Some(target) = target else {
                    return match lobby_name {
                        Some(name) => error_frame(
                            SignalErrorKind::LobbyNotFound,
                            format!("the lobby '{name}' does not exist"),
                        ),
                        None => error_frame(
                            SignalErrorKind::LobbyNotFound,
                            "no public lobby is available",
                        ),
                    };
                };

                let service_id = format!(
                    "req-{}",
                    state.next_request.fetch_add(1, Ordering::Relaxed)
                );
                let (waiter_tx, waiter_rx) = oneshot::channel();
                let entry = lobbies.get_mut(&target).unwrap();
                entry.pending.insert(service_id.clone(), waiter_tx);
                let _ = entry.to_host.send(SignalMessage::JoinRequest {
                    lobby_name: Some(target),
                    offer,
                    request_id: Some(service_id),
                });
                waiter_rx
            };

            match tokio::time::timeout(RELAY_WAIT, waiter).await {
                Ok(Ok(SignalMessage::JoinInvitation { answer, .. })) => {
                    // hand the requester back its own correlation token
                    SignalMessage::JoinInvitation {
                        answer,
                        request_id,
                    }
                }
                _ => error_frame(SignalErrorKind::LobbyNotFound, "the lobby did not answer"),
            }
        }

        SignalMessage::ListLobbies {
            maximum_lobbies,
            minimum_capacity,
        } => {
            let lobbies = state.lobbies.lock().unwrap();
            let listing = lobbies
                .values()
                .filter(|entry| entry.details.public_lobby)
                .filter(|entry| {
                    entry.details.max_clients.saturating_sub(entry.details.client_count)
                        >= minimum_capacity
                })
                .take(maximum_lobbies as usize)
                .map(|entry| entry.details.clone())
                .collect();
            SignalMessage::LobbyList { lobbies: listing }
        }

        _ => error_frame(SignalErrorKind::InvalidMessage, "unexpected message type"),
    }
}
