//! The response envelope every endpoint wraps its payload in.
//!
//! # Design
//! The server answers `{ "data": ..., "errmsg": "...", "errno": 0 }`. `unpack`
//! turns a raw `HttpResponse` into either an `Envelope<T>` whose `errno` is
//! zero, or a typed `ApiError`. Whether `data` must be present depends on the
//! operation, so that check is left to [`Envelope::into_data`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::http::HttpResponse;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errmsg: String,
    pub errno: i64,
}

impl<T> Envelope<T> {
    /// Take `data`, failing with `ApiError::Protocol` when the server left
    /// it out. `what` names the operation in the error message.
    pub fn into_data(self, what: &str) -> Result<T, ApiError> {
        self.data
            .ok_or_else(|| ApiError::Protocol(format!("{what}: response has no data")))
    }
}

/// Interpret `response` as an `Envelope<T>`.
///
/// - body not an envelope: `Http` for a non-2xx status, `Protocol` otherwise;
/// - `errno != 0`: `Domain` with the server's code and message;
/// - non-2xx with `errno == 0`: `Domain` with the HTTP status as code.
pub fn unpack<T: DeserializeOwned>(response: &HttpResponse) -> Result<Envelope<T>, ApiError> {
    let envelope: Envelope<T> = match serde_json::from_str(&response.body) {
        Ok(envelope) => envelope,
        Err(_) if !response.is_success() => {
            return Err(ApiError::Http {
                status: response.status,
                body: response.body.clone(),
            });
        }
        Err(e) => return Err(ApiError::Protocol(format!("invalid envelope: {e}"))),
    };

    if envelope.errno != 0 {
        return Err(ApiError::Domain {
            errno: envelope.errno,
            errmsg: envelope.errmsg,
        });
    }
    if !response.is_success() {
        let errmsg = if envelope.errmsg.is_empty() {
            response.body.clone()
        } else {
            envelope.errmsg
        };
        return Err(ApiError::Domain {
            errno: i64::from(response.status),
            errmsg,
        });
    }

    Ok(envelope)
}
