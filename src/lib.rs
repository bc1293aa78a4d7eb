//! Peer-to-peer lobbies and data links brokered by a rendezvous service.
//!
//! A host registers a named, discoverable lobby with the signaling
//! service; clients find the lobby and exchange a connection handshake
//! through the service; both sides end up with a direct bidirectional
//! [`PeerLink`] while the service drops out of the path.
//!
//! The ICE/data-channel machinery itself is behind the [`Transport`]
//! capability — callers pick the implementation (the in-process
//! [`transport::memory::MemoryTransport`] works for tests and
//! same-process links).
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tether::transport::memory::MemoryTransport;
//! use tether::{LobbyEvent, LobbyOptions, Transport, create_lobby, join_lobby};
//!
//! # async fn demo() -> Result<(), tether::Error> {
//! let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
//! let wait = Duration::from_secs(5);
//!
//! let mut lobby = create_lobby(
//!     transport.clone(),
//!     "ws://signal.example/api/host",
//!     LobbyOptions {
//!         lobby_name: Some("Potatoes".to_string()),
//!         ..Default::default()
//!     },
//!     wait,
//! )
//! .await?;
//!
//! let client = join_lobby(
//!     transport,
//!     "http://signal.example/api/client",
//!     Some("Potatoes"),
//!     wait,
//! )
//! .await?;
//!
//! client.send(&serde_json::json!({ "n": 1 }))?;
//! if let Some(LobbyEvent::ClientConnected(connection)) = lobby.next_event().await {
//!     let message = connection.link.recv().await;
//!     println!("{message:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod link;
pub mod lobby;
pub mod signaling;
pub mod timeout;
pub mod transport;

pub use error::{Error, ErrorKind};
pub use link::{LinkRequest, LinkResponse, PeerLink};
pub use lobby::{
    ClientConnection, ClientId, LobbyEvent, LobbyHost, LobbyOptions, LobbyQuery, create_lobby,
    join_lobby, list_public_lobbies,
};
pub use signaling::{LobbyDetails, LobbyDetailsUpdate};
pub use transport::Transport;
