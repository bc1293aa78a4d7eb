//! Signaling protocol client for the rendezvous service.
//!
//! Two flows share one wire vocabulary: hosts keep a persistent WebSocket
//! control channel, joining clients make one-shot HTTP exchanges.

mod client;
mod host;
mod messages;

pub use messages::{LobbyDetails, LobbyDetailsUpdate, SignalErrorKind, SignalMessage};

pub(crate) use client::{list_lobbies, request_join};
pub(crate) use host::{HostConnection, JoinRequest, connect_host};
