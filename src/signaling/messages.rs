use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The wire vocabulary exchanged with the rendezvous service.
///
/// Frames are the text encoding of this enum; offers and answers travel
/// hex-encoded inside them, since the handshake payloads are binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Host registers a lobby (no name lets the service pick one)
    #[serde(rename_all = "camelCase")]
    CreateLobby {
        #[serde(skip_serializing_if = "Option::is_none")]
        lobby_name: Option<String>,
        public_lobby: bool,
        max_clients: u16,
    },

    /// Client asks to join a lobby (no name means "any public lobby")
    #[serde(rename_all = "camelCase")]
    JoinRequest {
        #[serde(skip_serializing_if = "Option::is_none")]
        lobby_name: Option<String>,
        offer: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Host's answer for one join request, relayed back to the requester
    #[serde(rename_all = "camelCase")]
    JoinInvitation {
        answer: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Authoritative lobby state, pushed by the service
    LobbyDetails { details: LobbyDetails },

    /// Client asks for the public lobby listing
    #[serde(rename_all = "camelCase")]
    ListLobbies {
        maximum_lobbies: u16,
        minimum_capacity: u16,
    },

    /// The public lobby listing
    LobbyList { lobbies: Vec<LobbyDetails> },

    /// Error frame
    #[serde(rename_all = "camelCase")]
    Error {
        error_type: SignalErrorKind,
        error: String,
    },
}

/// Error sub-kinds the service reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalErrorKind {
    LobbyNotFound,
    LobbyAlreadyExists,
    InvalidMessage,
}

impl SignalErrorKind {
    /// Lift a service error frame into the local error taxonomy.
    pub(crate) fn into_error(self, message: String) -> Error {
        match self {
            SignalErrorKind::LobbyNotFound => Error::lobby_not_found(message),
            SignalErrorKind::LobbyAlreadyExists => Error::lobby_already_exists(message),
            SignalErrorKind::InvalidMessage => Error::invalid_data(message),
        }
    }
}

/// Lobby state as the service sees it. `client_count` is authoritative on
/// the service side; the host only caches what the service pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyDetails {
    pub lobby_name: String,
    pub public_lobby: bool,
    pub max_clients: u16,
    pub client_count: u16,
}

/// A partial update a host wants applied to its lobby. The service pushes
/// back the details it actually adopted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LobbyDetailsUpdate {
    pub lobby_name: Option<String>,
    pub public_lobby: Option<bool>,
    pub max_clients: Option<u16>,
}

impl LobbyDetailsUpdate {
    pub(crate) fn merge_into(self, details: &LobbyDetails) -> LobbyDetails {
        LobbyDetails {
            lobby_name: self.lobby_name.unwrap_or_else(|| details.lobby_name.clone()),
            public_lobby: self.public_lobby.unwrap_or(details.public_lobby),
            max_clients: self.max_clients.unwrap_or(details.max_clients),
            client_count: details.client_count,
        }
    }
}

const TOKEN_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A request-scoped token, echoed by the host so the service can match
/// invitations to concurrent joiners.
pub(crate) fn request_token() -> String {
    let mut rng = rand::rng();
    (0..12)
        .map(|_| char::from(TOKEN_CHARS[rng.random_range(0..TOKEN_CHARS.len())]))
        .collect()
}
