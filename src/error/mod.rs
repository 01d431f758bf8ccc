//! What a handler can fail with, and how each failure becomes a response.
//!
//! | Returned error               | Outcome at the request scope boundary        |
//! |------------------------------|----------------------------------------------|
//! | [`HandlerError::Status`]     | converted to a response with that status     |
//! | [`HandlerError::Response`]   | returned verbatim                            |
//! | [`HandlerError::Other`]      | passed through to the host adapter untouched |
//!
//! Turning an unexpected failure into a `500` is left to the host adapter.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::http::{Response, StatusCode};

/// Body carried by a [`StatusError`].
#[derive(Debug, Clone, PartialEq)]
pub enum StatusBody {
    /// Sent as a `text/plain` body.
    Text(String),
    /// Serialized and sent as `application/json`.
    Json(Value),
}

impl From<&str> for StatusBody {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for StatusBody {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Value> for StatusBody {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// An application-intended HTTP failure with an explicit status and body.
///
/// # Examples
///
/// ```
/// use reqscope::error::StatusError;
/// use reqscope::http::StatusCode;
///
/// let response = StatusError::new(StatusCode::IM_A_TEAPOT, "I might be a teapot").into_response();
/// assert_eq!(response.status().as_u16(), 418);
/// assert_eq!(response.text().unwrap(), "I might be a teapot");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StatusError {
    status: StatusCode,
    body: Option<StatusBody>,
}

impl StatusError {
    /// Creates a status error with a text or JSON body.
    pub fn new(status: StatusCode, body: impl Into<StatusBody>) -> Self {
        Self {
            status,
            body: Some(body.into()),
        }
    }

    /// Creates a status error with no body.
    pub fn empty(status: StatusCode) -> Self {
        Self { status, body: None }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> Option<&StatusBody> {
        self.body.as_ref()
    }

    /// Converts the error into the response sent to the client.
    pub fn into_response(self) -> Response {
        match self.body {
            Some(StatusBody::Text(text)) => Response::text_body(self.status, text),
            Some(StatusBody::Json(value)) => Response::json(self.status, &value),
            None => Response::new(self.status),
        }
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Some(StatusBody::Text(text)) => write!(f, "{}: {}", self.status, text),
            Some(StatusBody::Json(value)) => write!(f, "{}: {}", self.status, value),
            None => write!(f, "{}", self.status),
        }
    }
}

impl std::error::Error for StatusError {}

/// Everything a handler may return in place of a successful [`Response`].
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Converted into a response with the carried status and body.
    #[error(transparent)]
    Status(#[from] StatusError),

    /// Full-control short-circuit: sent exactly as constructed.
    #[error("handler returned an early response ({})", .0.status())]
    Response(Response),

    /// Unclassified failure; never translated by the request scope.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Wraps any error as an unclassified failure.
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(anyhow::Error::new(error))
    }

    /// Translates the failure into a response, or hands back the unclassified error.
    ///
    /// # Errors
    ///
    /// Returns the inner [`anyhow::Error`] for [`HandlerError::Other`].
    pub fn into_response(self) -> Result<Response, anyhow::Error> {
        match self {
            Self::Status(error) => Ok(error.into_response()),
            Self::Response(response) => Ok(response),
            Self::Other(error) => Err(error),
        }
    }
}

impl From<Response> for HandlerError {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}
