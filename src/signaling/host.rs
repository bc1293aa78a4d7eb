//! Host side of the signaling protocol: a persistent control channel that
//! registers the lobby, relays join requests to the orchestrator, and keeps
//! the cached lobby details in sync with the service's pushes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::messages::{LobbyDetails, LobbyDetailsUpdate, SignalMessage};
use crate::codec::{parse, stringify};
use crate::error::Error;
use crate::timeout::{TimeoutHandle, create_timeout, expire};

/// Hard ceiling the service enforces on lobby capacity; clamped here so a
/// create request never carries a value the service would reject.
pub(crate) const MAX_CLIENTS_CEILING: u16 = 500;

type ControlStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type ControlSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// A join request the service relayed from some joining client.
#[derive(Debug)]
pub(crate) struct JoinRequest {
    /// Hex-encoded offer payload
    pub offer: String,
    /// Token to echo in the invitation, for the service's correlation
    pub request_id: Option<String>,
}

/// Clamp a requested capacity into `(0, MAX_CLIENTS_CEILING]`.
pub(crate) fn clamp_max_clients(requested: Option<u16>) -> u16 {
    match requested {
        Some(value) if value > 0 && value <= MAX_CLIENTS_CEILING => value,
        _ => MAX_CLIENTS_CEILING,
    }
}

/// The host's live control connection to the rendezvous service.
pub(crate) struct HostConnection {
    outbound: Mutex<Option<mpsc::UnboundedSender<SignalMessage>>>,
    details: Arc<Mutex<LobbyDetails>>,
    waiters: Arc<Mutex<Vec<TimeoutHandle<LobbyDetails>>>>,
}

/// Open the control channel, register the lobby, and wait for the
/// service's confirmation. The whole sequence is bounded by `wait`; on the
/// deadline path the half-open socket is simply dropped.
pub(crate) async fn connect_host(
    url: &str,
    lobby_name: Option<String>,
    public_lobby: bool,
    max_clients: Option<u16>,
    wait: Duration,
) -> Result<(HostConnection, mpsc::UnboundedReceiver<JoinRequest>), Error> {
    let connected = expire(
        wait,
        "could not connect to the signaling service",
        connect_async(url),
    )
    .await?;
    let (socket, _response) = connected.map_err(|error| {
        Error::connection(format!(
            "could not reach the signaling service at '{url}': {error}"
        ))
    })?;
    let (sink, mut stream) = socket.split();

    let outbound = spawn_writer(sink);

    let max_clients = clamp_max_clients(max_clients);
    outbound
        .send(SignalMessage::CreateLobby {
            lobby_name,
            public_lobby,
            max_clients,
        })
        .map_err(|_| Error::connection("the signaling channel closed"))?;

    let confirmed = expire(
        wait,
        "the signaling service has not confirmed the lobby",
        await_confirmation(&mut stream),
    )
    .await??;
    info!(lobby = %confirmed.lobby_name, "lobby registered");

    let details = Arc::new(Mutex::new(confirmed));
    let waiters: Arc<Mutex<Vec<TimeoutHandle<LobbyDetails>>>> = Arc::default();
    let (join_tx, join_rx) = mpsc::unbounded_channel();

    tokio::spawn(dispatch(stream, details.clone(), waiters.clone(), join_tx));

    let connection = HostConnection {
        outbound: Mutex::new(Some(outbound)),
        details,
        waiters,
    };
    Ok((connection, join_rx))
}

/// One task owns the sink; everything outbound funnels through it. The
/// sink is closed when the connection handle drops its sender.
fn spawn_writer(mut sink: ControlSink) -> mpsc::UnboundedSender<SignalMessage> {
    let (outbound, mut queued) = mpsc::unbounded_channel::<SignalMessage>();
    tokio::spawn(async move {
        while let Some(message) = queued.recv().await {
            let body = match stringify(&message) {
                Ok(body) => body,
                Err(error) => {
                    warn!("dropping an unencodable signaling message: {error}");
                    continue;
                }
            };
            if sink.send(Message::text(body)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    outbound
}

/// First frame decides: a `lobby-details` push confirms, any error frame
/// or deserialize failure in this window fails the same await.
async fn await_confirmation(stream: &mut ControlStream) -> Result<LobbyDetails, Error> {
    loop {
        let Some(frame) = stream.next().await else {
            return Err(Error::connection("the signaling service closed the connection"));
        };
        let frame = frame.map_err(|error| {
            Error::connection(format!("the signaling connection failed: {error}"))
        })?;
        match frame {
            Message::Text(text) => {
                return match parse::<SignalMessage>(text.as_str()) {
                    Ok(SignalMessage::LobbyDetails { details }) => Ok(details),
                    Ok(SignalMessage::Error { error_type, error }) => {
                        Err(error_type.into_error(error))
                    }
                    Ok(other) => Err(Error::invalid_data(format!(
                        "the signaling service sent unexpected data ({other:?})"
                    ))),
                    Err(_) => Err(Error::deserialize(
                        "the signaling service response can't be deserialized",
                    )),
                };
            }
            Message::Close(_) => {
                return Err(Error::connection("the signaling service closed the connection"));
            }
            _ => continue,
        }
    }
}

/// Inbound frames are handled in arrival order. After confirmation, a
/// frame that fails to decode is dropped, never surfaced. Dropping the
/// join-request sender on the way out is how closure reaches the host,
/// whatever took the connection down.
async fn dispatch(
    mut stream: ControlStream,
    details: Arc<Mutex<LobbyDetails>>,
    waiters: Arc<Mutex<Vec<TimeoutHandle<LobbyDetails>>>>,
    join_requests: mpsc::UnboundedSender<JoinRequest>,
) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                debug!("the signaling connection failed: {error}");
                break;
            }
        };
        match frame {
            Message::Text(text) => match parse::<SignalMessage>(text.as_str()) {
                Ok(SignalMessage::JoinRequest {
                    offer, request_id, ..
                }) => {
                    if join_requests
                        .send(JoinRequest { offer, request_id })
                        .is_err()
                    {
                        debug!("dropping a join request: the lobby host is gone");
                    }
                }
                Ok(SignalMessage::LobbyDetails { details: update }) => {
                    *details.lock().expect("details lock poisoned") = update.clone();
                    // FIFO drain; waiters registered after this point wait
                    // for the next push
                    let pending =
                        std::mem::take(&mut *waiters.lock().expect("waiters lock poisoned"));
                    for waiter in pending {
                        waiter.resolve(update.clone());
                    }
                }
                Ok(other) => debug!("ignoring an unexpected signaling message: {other:?}"),
                Err(error) => debug!("ignoring an undecodable signaling frame: {error}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
}

impl HostConnection {
    /// The cached lobby view, as of the last `lobby-details` push.
    pub fn details(&self) -> LobbyDetails {
        self.details.lock().expect("details lock poisoned").clone()
    }

    fn send(&self, message: SignalMessage) -> Result<(), Error> {
        let outbound = self.outbound.lock().expect("outbound lock poisoned");
        match outbound.as_ref() {
            Some(sender) => sender
                .send(message)
                .map_err(|_| Error::connection("the signaling channel closed")),
            None => Err(Error::connection("the signaling channel closed")),
        }
    }

    /// Relay the answer for one join request back to the service.
    pub fn send_invitation(&self, answer: String, request_id: Option<String>) -> Result<(), Error> {
        self.send(SignalMessage::JoinInvitation { answer, request_id })
    }

    /// Ask the service to adopt new lobby details and wait for the next
    /// push. If the deadline fires first the update may still be applied
    /// later; the stale waiter stays registered but inert.
    pub async fn update_details(
        &self,
        update: LobbyDetailsUpdate,
        wait: Duration,
    ) -> Result<LobbyDetails, Error> {
        let merged = update.merge_into(&self.details());

        // register before sending so the service's push can't slip past
        // the waiter
        let (handle, outcome) = create_timeout(wait, "the signaling service has not answered");
        self.waiters
            .lock()
            .expect("waiters lock poisoned")
            .push(handle);
        self.send(SignalMessage::LobbyDetails { details: merged })?;
        outcome.await
    }

    /// Stop accepting joins by closing the control channel. Established
    /// links are untouched.
    pub fn close(&self) {
        self.outbound.lock().expect("outbound lock poisoned").take();
    }
}
