//! Peer link establishment.
//!
//! [`LinkRequest`] drives the offering side of the handshake and
//! [`LinkResponse`] the answering side; both end in a [`PeerLink`], the
//! established bidirectional message channel. An offer carries a random
//! correlation id that the answer must echo, binding each answer to the
//! offer that produced it even when several offers are outstanding.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::debug;

use crate::codec::{self, WireOptions};
use crate::error::Error;
use crate::timeout::expire;
use crate::transport::{Connectivity, DataChannel, IceCandidate, Session, SessionDescription, Transport};

const CHANNEL_LABEL: &str = "tether-data";

// Preset deflate dictionaries, one per handshake payload shape. A sample
// shaped like a real payload shares long literal runs with the payloads it
// compresses; both ends of each shape must use the same sample.
const OFFER_DICTIONARY: &[u8] = br#"{"description":{"type":"offer","sdp":"v=0\r\no=- 0 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\nc=IN IP4 0.0.0.0\r\na=setup:actpass\r\na=mid:0\r\na=sctp-port:5000\r\n"},"candidate":{"candidate":"candidate:1 1 udp 2113937151 192.168.0.1 50000 typ host","sdpMid":"0","sdpMLineIndex":0},"correlationId":"0123456789abcdef"}"#;
const ANSWER_DICTIONARY: &[u8] = br#"{"description":{"type":"answer","sdp":"v=0\r\no=- 0 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\nc=IN IP4 0.0.0.0\r\na=setup:active\r\na=mid:0\r\na=sctp-port:5000\r\n"},"candidate":{"candidate":"candidate:1 1 udp 2113937151 192.168.0.1 50000 typ host","sdpMid":"0","sdpMLineIndex":0},"correlationId":"0123456789abcdef"}"#;

const OFFER_WIRE: WireOptions<'static> = WireOptions {
    level: 1,
    dictionary: Some(OFFER_DICTIONARY),
};
const ANSWER_WIRE: WireOptions<'static> = WireOptions {
    level: 1,
    dictionary: Some(ANSWER_DICTIONARY),
};

const HEX_CHARS: &[u8] = b"0123456789abcdef";

fn correlation_id() -> String {
    let mut rng = rand::rng();
    (0..16)
        .map(|_| char::from(HEX_CHARS[rng.random_range(0..HEX_CHARS.len())]))
        .collect()
}

/// The payload exchanged as an offer or an answer.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkDescription {
    description: SessionDescription,
    candidate: IceCandidate,
    correlation_id: String,
}

/// Offering side of the handshake: holds the session and the serialized
/// offer until an answer arrives (or the caller abandons it).
pub struct LinkRequest {
    offer: Vec<u8>,
    correlation_id: String,
    session: Box<dyn Session>,
    channel: DataChannel,
}

impl LinkRequest {
    pub async fn create(transport: &dyn Transport) -> Result<LinkRequest, Error> {
        let mut session = transport
            .open_session()
            .await
            .map_err(|error| Error::connection(format!("could not open a transport session: {error}")))?;

        match Self::describe(session.as_mut()).await {
            Ok((channel, offer, correlation_id)) => Ok(LinkRequest {
                offer,
                correlation_id,
                session,
                channel,
            }),
            Err(error) => {
                session.close().await;
                Err(error)
            }
        }
    }

    async fn describe(session: &mut dyn Session) -> Result<(DataChannel, Vec<u8>, String), Error> {
        let channel = session
            .create_channel(CHANNEL_LABEL)
            .await
            .map_err(|error| Error::connection(format!("could not create a data channel: {error}")))?;
        let description = session
            .create_offer()
            .await
            .map_err(|error| Error::connection(format!("could not create an offer: {error}")))?;
        session
            .set_local_description(&description)
            .await
            .map_err(|error| Error::connection(format!("could not apply the local offer: {error}")))?;
        let candidate = session
            .local_candidate()
            .await
            .map_err(|error| Error::connection(format!("could not gather a candidate: {error}")))?;

        let correlation_id = correlation_id();
        let offer = codec::serialize(
            Some(&LinkDescription {
                description,
                candidate,
                correlation_id: correlation_id.clone(),
            }),
            Some(&OFFER_WIRE),
        )
        .map_err(|_| Error::serialize("could not serialize the link offer"))?;

        Ok((channel, offer, correlation_id))
    }

    /// The serialized offer to hand to the answering peer.
    pub fn offer(&self) -> &[u8] {
        &self.offer
    }

    /// Abandon the handshake before an answer was supplied, tearing the
    /// session down (used when the lobby lookup fails).
    pub async fn close(mut self) {
        self.session.close().await;
    }

    /// Consume the peer's answer and wait for the channel to open.
    pub async fn open_link(mut self, answer: &[u8], wait: Duration) -> Result<PeerLink, Error> {
        let description = match codec::deserialize::<LinkDescription>(answer, Some(&ANSWER_WIRE)) {
            Ok(Some(description)) => description,
            Ok(None) => {
                self.session.close().await;
                return Err(Error::invalid_data("the link answer is empty"));
            }
            Err(_) => {
                self.session.close().await;
                return Err(Error::invalid_data("the link answer can't be decoded"));
            }
        };

        if description.correlation_id != self.correlation_id {
            self.session.close().await;
            return Err(Error::invalid_data(format!(
                "the link answer does not match the offer (expected correlation id {}, received {})",
                self.correlation_id, description.correlation_id
            )));
        }

        if let Err(error) = Self::apply_answer(self.session.as_mut(), &description).await {
            self.session.close().await;
            return Err(error);
        }

        match expire(wait, "the peer has not connected", self.channel.wait_open()).await {
            Ok(true) => Ok(PeerLink::spawn(self.session, self.channel)),
            Ok(false) => {
                self.session.close().await;
                Err(Error::connection(
                    "the transport abandoned the channel before it opened",
                ))
            }
            Err(timeout) => {
                // dropping self closes the channel; the session goes with it
                self.session.close().await;
                Err(timeout)
            }
        }
    }

    async fn apply_answer(
        session: &mut dyn Session,
        description: &LinkDescription,
    ) -> Result<(), Error> {
        session
            .set_remote_description(&description.description)
            .await
            .map_err(|error| Error::invalid_data(format!("the link answer was rejected: {error}")))?;
        session
            .add_remote_candidate(&description.candidate)
            .await
            .map_err(|error| {
                Error::invalid_data(format!("the link answer candidate was rejected: {error}"))
            })?;
        Ok(())
    }
}

/// Answering side of the handshake: the serialized answer plus the link
/// that materializes later, once the peer opens its channel. The two are
/// observable independently.
pub struct LinkResponse {
    answer: Vec<u8>,
    link: oneshot::Receiver<Result<PeerLink, Error>>,
}

impl std::fmt::Debug for LinkResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkResponse").finish_non_exhaustive()
    }
}

impl LinkResponse {
    pub async fn create(
        transport: &dyn Transport,
        offer: &[u8],
        wait: Duration,
    ) -> Result<LinkResponse, Error> {
        let received = match codec::deserialize::<LinkDescription>(offer, Some(&OFFER_WIRE)) {
            Ok(Some(description)) => description,
            _ => return Err(Error::invalid_data("the link offer can't be decoded")),
        };

        let mut session = transport
            .open_session()
            .await
            .map_err(|error| Error::connection(format!("could not open a transport session: {error}")))?;

        let answer = match Self::negotiate(session.as_mut(), &received).await {
            Ok(answer) => answer,
            Err(error) => {
                session.close().await;
                return Err(error);
            }
        };

        let (resolved, link) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = expire(wait, "the peer has not connected", session.next_incoming_channel()).await;
            let outcome = match outcome {
                Ok(Some(channel)) => Ok(PeerLink::spawn(session, channel)),
                Ok(None) => {
                    session.close().await;
                    Err(Error::connection(
                        "the transport session closed before the peer connected",
                    ))
                }
                Err(timeout) => {
                    session.close().await;
                    Err(timeout)
                }
            };
            let _ = resolved.send(outcome);
        });

        Ok(LinkResponse { answer, link })
    }

    async fn negotiate(
        session: &mut dyn Session,
        received: &LinkDescription,
    ) -> Result<Vec<u8>, Error> {
        session
            .set_remote_description(&received.description)
            .await
            .map_err(|error| Error::invalid_data(format!("the link offer was rejected: {error}")))?;
        let description = session
            .create_answer()
            .await
            .map_err(|error| Error::invalid_data(format!("could not answer the offer: {error}")))?;
        session
            .set_local_description(&description)
            .await
            .map_err(|error| Error::invalid_data(format!("could not apply the local answer: {error}")))?;
        session
            .add_remote_candidate(&received.candidate)
            .await
            .map_err(|error| {
                Error::invalid_data(format!("the link offer candidate was rejected: {error}"))
            })?;
        let candidate = session
            .local_candidate()
            .await
            .map_err(|error| Error::connection(format!("could not gather a candidate: {error}")))?;

        codec::serialize(
            Some(&LinkDescription {
                description,
                candidate,
                // echo the offer's id so the offering side can match this
                // answer to its outstanding offer
                correlation_id: received.correlation_id.clone(),
            }),
            Some(&ANSWER_WIRE),
        )
        .map_err(|_| Error::serialize("could not serialize the link answer"))
    }

    /// The serialized answer to relay back to the offering peer.
    pub fn answer(&self) -> &[u8] {
        &self.answer
    }

    /// The link, once the peer's channel arrives (or the deadline fires).
    pub async fn link(self) -> Result<PeerLink, Error> {
        match self.link.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::connection("the link watcher went away")),
        }
    }
}

/// An established bidirectional message channel.
///
/// Handles are cheap clones of one underlying link; the host registry and
/// the application can hold the same link. Messages are arbitrary JSON
/// values; inbound frames that fail to decode are dropped silently — a
/// corrupt stray frame must never take the link down.
#[derive(Clone)]
pub struct PeerLink {
    shared: Arc<LinkShared>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink").finish_non_exhaustive()
    }
}

struct LinkShared {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    closed: watch::Receiver<bool>,
    shutdown: Notify,
}

impl PeerLink {
    fn spawn(session: Box<dyn Session>, channel: DataChannel) -> PeerLink {
        let (messages, inbound) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(LinkShared {
            outbound: channel.sender(),
            inbound: tokio::sync::Mutex::new(inbound),
            closed: closed_rx,
            shutdown: Notify::new(),
        });
        tokio::spawn(pump(session, channel, messages, closed_tx, shared.clone()));
        PeerLink { shared }
    }

    /// Encode and send one message. Encoding failures are returned without
    /// affecting the channel.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), Error> {
        let frame = codec::serialize(Some(message), None)?;
        if self.is_closed() {
            return Err(Error::connection("the link is closed"));
        }
        self.shared
            .outbound
            .send(frame)
            .map_err(|_| Error::connection("the link is closed"))
    }

    /// The next inbound message, or `None` once the link is closed.
    pub async fn recv(&self) -> Option<Value> {
        self.shared.inbound.lock().await.recv().await
    }

    /// Tear the link down. Safe to call any number of times.
    pub fn close(&self) {
        self.shared.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the link has disconnected, whichever side caused it.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Owns the session for the lifetime of the link. The loop breaks on the
/// first of {channel closed, transport disconnected, local close} and runs
/// the teardown once.
async fn pump(
    mut session: Box<dyn Session>,
    mut channel: DataChannel,
    messages: mpsc::UnboundedSender<Value>,
    closed: watch::Sender<bool>,
    shared: Arc<LinkShared>,
) {
    let mut connectivity = session.connectivity();
    loop {
        tokio::select! {
            frame = channel.recv() => match frame {
                Some(frame) => match codec::deserialize::<Value>(&frame, None) {
                    Ok(Some(message)) => {
                        let _ = messages.send(message);
                    }
                    Ok(None) => {}
                    Err(error) => debug!("dropping an undecodable frame: {error}"),
                },
                None => break,
            },
            _ = connectivity.wait_for(|state| *state == Connectivity::Disconnected) => break,
            _ = shared.shutdown.notified() => break,
        }
    }
    let _ = closed.send(true);
    drop(channel);
    session.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::memory::MemoryTransport;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(5);

    async fn established() -> (PeerLink, PeerLink) {
        let transport = MemoryTransport::new();
        let request = LinkRequest::create(&transport).await.unwrap();
        let response = LinkResponse::create(&transport, request.offer(), WAIT)
            .await
            .unwrap();
        let answer = response.answer().to_vec();
        let requested = request.open_link(&answer, WAIT).await.unwrap();
        let responded = response.link().await.unwrap();
        (requested, responded)
    }

    #[tokio::test]
    async fn a_handshake_yields_a_link_on_both_sides() {
        let (requested, responded) = established().await;

        requested.send(&json!({ "n": 1 })).unwrap();
        assert_eq!(responded.recv().await, Some(json!({ "n": 1 })));

        responded.send(&json!(":)" )).unwrap();
        assert_eq!(requested.recv().await, Some(json!(":)")));
    }

    #[tokio::test]
    async fn an_answer_for_a_different_offer_is_rejected() {
        let transport = MemoryTransport::new();
        let request_a = LinkRequest::create(&transport).await.unwrap();
        let request_b = LinkRequest::create(&transport).await.unwrap();

        // answer produced for b, consumed by a: well-formed, wrong offer
        let response = LinkResponse::create(&transport, request_b.offer(), WAIT)
            .await
            .unwrap();
        let answer = response.answer().to_vec();

        let error = request_a.open_link(&answer, WAIT).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidData);
        assert!(error.message.contains("correlation id"));
        request_b.close().await;
    }

    #[tokio::test]
    async fn a_garbage_answer_is_rejected() {
        let transport = MemoryTransport::new();
        let request = LinkRequest::create(&transport).await.unwrap();
        let error = request
            .open_link(b"not an answer", WAIT)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn a_garbage_offer_is_rejected() {
        let transport = MemoryTransport::new();
        let error = LinkResponse::create(&transport, b"not an offer", WAIT)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn an_empty_answer_is_rejected() {
        let transport = MemoryTransport::new();
        let request = LinkRequest::create(&transport).await.unwrap();
        let error = request
            .open_link(b"", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidData);
    }

    /// A transport whose sessions accept every handshake step but never
    /// open a channel, for exercising the channel-open deadline.
    struct StallingTransport;

    struct StallingSession {
        endpoints: Vec<crate::transport::ChannelEndpoint>,
        connectivity: watch::Receiver<Connectivity>,
        _connectivity: watch::Sender<Connectivity>,
        _incoming: mpsc::UnboundedSender<DataChannel>,
        incoming: mpsc::UnboundedReceiver<DataChannel>,
    }

    #[async_trait::async_trait]
    impl Transport for StallingTransport {
        async fn open_session(
            &self,
        ) -> Result<Box<dyn Session>, crate::transport::SessionError> {
            let (connectivity_tx, connectivity_rx) = watch::channel(Connectivity::New);
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
            Ok(Box::new(StallingSession {
                endpoints: Vec::new(),
                connectivity: connectivity_rx,
                _connectivity: connectivity_tx,
                _incoming: incoming_tx,
                incoming: incoming_rx,
            }))
        }
    }

    #[async_trait::async_trait]
    impl Session for StallingSession {
        async fn create_channel(
            &mut self,
            label: &str,
        ) -> Result<DataChannel, crate::transport::SessionError> {
            let (channel, endpoint) = DataChannel::pipe(label);
            self.endpoints.push(endpoint);
            Ok(channel)
        }

        async fn create_offer(
            &mut self,
        ) -> Result<SessionDescription, crate::transport::SessionError> {
            Ok(SessionDescription {
                kind: crate::transport::DescriptionKind::Offer,
                sdp: "stall".to_string(),
            })
        }

        async fn create_answer(
            &mut self,
        ) -> Result<SessionDescription, crate::transport::SessionError> {
            Ok(SessionDescription {
                kind: crate::transport::DescriptionKind::Answer,
                sdp: "stall".to_string(),
            })
        }

        async fn set_local_description(
            &mut self,
            _description: &SessionDescription,
        ) -> Result<(), crate::transport::SessionError> {
            Ok(())
        }

        async fn set_remote_description(
            &mut self,
            _description: &SessionDescription,
        ) -> Result<(), crate::transport::SessionError> {
            Ok(())
        }

        async fn add_remote_candidate(
            &mut self,
            _candidate: &IceCandidate,
        ) -> Result<(), crate::transport::SessionError> {
            Ok(())
        }

        async fn local_candidate(
            &mut self,
        ) -> Result<IceCandidate, crate::transport::SessionError> {
            Ok(IceCandidate {
                candidate: "stall".to_string(),
                sdp_mid: None,
                sdp_m_line_index: None,
            })
        }

        async fn next_incoming_channel(&mut self) -> Option<DataChannel> {
            self.incoming.recv().await
        }

        fn connectivity(&self) -> watch::Receiver<Connectivity> {
            self.connectivity.clone()
        }

        async fn close(&mut self) {
            self.endpoints.clear();
        }
    }

    #[tokio::test]
    async fn an_answer_that_never_connects_times_out_the_request() {
        let transport = StallingTransport;
        let request = LinkRequest::create(&transport).await.unwrap();

        // a well-formed answer with the right correlation id, on a session
        // that will never open the channel
        let answer = codec::serialize(
            Some(&LinkDescription {
                description: SessionDescription {
                    kind: crate::transport::DescriptionKind::Answer,
                    sdp: "stall".to_string(),
                },
                candidate: IceCandidate {
                    candidate: "stall".to_string(),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                },
                correlation_id: request.correlation_id.clone(),
            }),
            Some(&ANSWER_WIRE),
        )
        .unwrap();

        let error = request
            .open_link(&answer, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn a_never_connecting_peer_times_out_the_response() {
        let transport = MemoryTransport::new();
        let request = LinkRequest::create(&transport).await.unwrap();
        let response = LinkResponse::create(&transport, request.offer(), Duration::from_millis(50))
            .await
            .unwrap();

        // the offering side never applies the answer
        let error = response.link().await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Timeout);
        request.close().await;
    }

    #[tokio::test]
    async fn closing_one_side_closes_the_other_exactly_once() {
        let (requested, responded) = established().await;

        requested.close();
        responded.closed().await;
        assert!(responded.is_closed());
        assert_eq!(responded.recv().await, None);

        // idempotent on an already-closed link
        requested.close();
        assert!(requested.is_closed());
    }

    #[tokio::test]
    async fn sending_on_a_closed_link_fails_without_panicking() {
        let (requested, responded) = established().await;
        requested.close();
        requested.closed().await;
        let error = requested.send(&json!(1)).unwrap_err();
        assert_eq!(error.kind, ErrorKind::Connection);
        drop(responded);
    }

    #[tokio::test]
    async fn undecodable_inbound_frames_are_dropped_silently() {
        let transport = MemoryTransport::new();
        let request = LinkRequest::create(&transport).await.unwrap();
        let response = LinkResponse::create(&transport, request.offer(), WAIT)
            .await
            .unwrap();
        let answer = response.answer().to_vec();
        let requested = request.open_link(&answer, WAIT).await.unwrap();
        let responded = response.link().await.unwrap();

        // a corrupt frame straight onto the wire, then a good message
        requested.shared.outbound.send(vec![0xff, 0x00, 0x13]).unwrap();
        requested.send(&json!("still alive")).unwrap();
        assert_eq!(responded.recv().await, Some(json!("still alive")));
        assert!(!responded.is_closed());
    }
}
