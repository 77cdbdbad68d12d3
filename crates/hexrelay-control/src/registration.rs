//! Registration request checks, run inside the WebSocket handshake

use hexrelay_auth::{AuthError, CredentialValidator};
use hexrelay_proto::{HOST_HEADER, HOST_QUERY_PARAM, TOKEN_HEADER, TOKEN_QUERY_PARAM};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Reasons a registration is refused
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("not found")]
    NotFound,

    #[error("token required")]
    TokenRequired,

    #[error("invalid token provided")]
    InvalidToken,

    #[error("invalid token provided")]
    StoreUnavailable(#[source] AuthError),

    #[error("host required")]
    MissingIdentifier,
}

impl RegistrationError {
    pub fn status(&self) -> StatusCode {
        match self {
            RegistrationError::NotFound => StatusCode::NOT_FOUND,
            RegistrationError::TokenRequired
            | RegistrationError::InvalidToken
            | RegistrationError::StoreUnavailable(_) => StatusCode::UNAUTHORIZED,
            RegistrationError::MissingIdentifier => StatusCode::BAD_REQUEST,
        }
    }

    /// Handshake rejection carrying the status and a plain-text reason
    pub fn to_response(&self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(format!("{}\n", self)));
        *response.status_mut() = self.status();
        response
    }
}

/// Check a registration request and derive the routing identifier
///
/// Credential: `X-Hexrelay-Token` header, else `token` query parameter.
/// Identifier: `host` query parameter, else `X-Hexrelay-Host` header, else the
/// credential itself.
pub fn authorize_registration(
    request: &Request,
    path: &str,
    validator: &dyn CredentialValidator,
) -> Result<String, RegistrationError> {
    let request_path = request.uri().path();
    if request_path != path && request_path.strip_suffix('/') != Some(path) {
        return Err(RegistrationError::NotFound);
    }

    let query_param = |name: &str| -> Option<String> {
        let query = request.uri().query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    };
    let header = |name: &str| -> Option<String> {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
    };

    let token = header(TOKEN_HEADER)
        .filter(|t| !t.is_empty())
        .or_else(|| query_param(TOKEN_QUERY_PARAM))
        .filter(|t| !t.is_empty())
        .ok_or(RegistrationError::TokenRequired)?;

    match validate_off_runtime(validator, &token) {
        Ok(true) => {}
        Ok(false) => return Err(RegistrationError::InvalidToken),
        Err(e) => return Err(RegistrationError::StoreUnavailable(e)),
    }

    // Present-but-empty is a client error, absent falls through to the next source
    let identifier = match query_param(HOST_QUERY_PARAM) {
        Some(host) => host,
        None => header(HOST_HEADER).unwrap_or_else(|| token.clone()),
    };
    if identifier.is_empty() {
        return Err(RegistrationError::MissingIdentifier);
    }

    Ok(identifier)
}

/// Run a validator that may block (the token store reads a file)
///
/// The handshake callback is synchronous, so on a multi-threaded runtime the
/// worker hands its other tasks off for the duration of the call.
fn validate_off_runtime(
    validator: &dyn CredentialValidator,
    token: &str,
) -> Result<bool, AuthError> {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| validator.validate(token))
        }
        _ => validator.validate(token),
    }
}
