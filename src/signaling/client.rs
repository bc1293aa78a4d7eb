//! Joining side of the signaling protocol: one-shot HTTP exchanges, not
//! the persistent control channel.

use std::time::Duration;

use super::messages::{LobbyDetails, SignalErrorKind, SignalMessage, request_token};
use crate::codec::{parse, stringify};
use crate::error::{Error, display_value};

/// Send the local offer to the service and map its response to either an
/// answer payload or a tagged failure. `wait` bounds the whole exchange;
/// expiry aborts the in-flight request.
pub(crate) async fn request_join(
    url: &str,
    offer: &[u8],
    lobby_name: Option<&str>,
    wait: Duration,
) -> Result<Vec<u8>, Error> {
    let request = SignalMessage::JoinRequest {
        lobby_name: lobby_name.map(str::to_string),
        offer: hex::encode(offer),
        request_id: Some(request_token()),
    };
    let body = stringify(&request)?;
    let response = exchange(url, body, wait).await?;

    match parse::<SignalMessage>(&response) {
        Ok(SignalMessage::JoinInvitation { answer, .. }) => hex::decode(&answer)
            .map_err(|_| Error::invalid_data("the join invitation carries an unreadable answer")),
        Ok(SignalMessage::Error {
            error_type: SignalErrorKind::LobbyNotFound,
            ..
        }) => Err(match lobby_name {
            Some(name) => Error::lobby_not_found(format!("the lobby '{name}' does not exist")),
            None => Error::lobby_not_found("no public lobby is available"),
        }),
        Ok(SignalMessage::Error { error_type, error }) => Err(error_type.into_error(error)),
        Ok(other) => Err(unexpected(&other)),
        Err(_) => Err(Error::deserialize(
            "the signaling service returned data that can't be deserialized",
        )),
    }
}

/// Fetch the public lobby listing.
pub(crate) async fn list_lobbies(
    url: &str,
    maximum_lobbies: u16,
    minimum_capacity: u16,
    wait: Duration,
) -> Result<Vec<LobbyDetails>, Error> {
    let body = stringify(&SignalMessage::ListLobbies {
        maximum_lobbies,
        minimum_capacity,
    })?;
    let response = exchange(url, body, wait).await?;

    match parse::<SignalMessage>(&response) {
        Ok(SignalMessage::LobbyList { lobbies }) => Ok(lobbies),
        Ok(SignalMessage::Error { error_type, error }) => Err(error_type.into_error(error)),
        Ok(other) => Err(unexpected(&other)),
        Err(_) => Err(Error::deserialize(
            "the signaling service returned data that can't be deserialized",
        )),
    }
}

fn unexpected(message: &SignalMessage) -> Error {
    Error::invalid_data(format!(
        "the signaling service returned unexpected data ({})",
        display_value(&format!("{message:?}"))
    ))
}

async fn exchange(url: &str, body: String, wait: Duration) -> Result<String, Error> {
    let response = reqwest::Client::new()
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .timeout(wait)
        .body(body)
        .send()
        .await
        .map_err(|error| transport_error(url, error, wait))?;

    response
        .text()
        .await
        .map_err(|error| transport_error(url, error, wait))
}

fn transport_error(url: &str, error: reqwest::Error, wait: Duration) -> Error {
    if error.is_timeout() {
        Error::timeout(
            format!("the signaling service at '{url}' has not responded"),
            wait,
        )
    } else {
        Error::connection(format!(
            "could not reach the signaling service at '{url}': {error}"
        ))
    }
}
