use http::StatusCode;
use std::sync::Arc;

use crate::model::response::DataServiceResponse;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Errors raised by the tracker, the save pipeline and the wire layer.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    InvalidOperation(String),

    #[error("{0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    Argument(String),

    /// Payload could not be parsed by the message reader.
    #[error("malformed payload: {0}")]
    Format(String),

    #[error(transparent)]
    Client(#[from] DataServiceClientError),

    #[error(transparent)]
    Request(#[from] Box<DataServiceRequestError>),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid header: {0}")]
    Header(#[from] http::Error),

    #[error("the request was aborted")]
    Aborted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }

    pub fn unexpected_content(detail: impl std::fmt::Display) -> Self {
        Self::InvalidOperation(format!(
            "the batch response contained unexpected content: {}",
            detail
        ))
    }

    pub fn incomplete_response_count() -> Self {
        Self::InvalidOperation(
            "not all requests in the batch had a response".to_string(),
        )
    }

    /// Fatal errors are never captured onto a descriptor or an operation
    /// response; they abort the whole save.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Aborted | ClientError::Internal(_))
    }

    /// Errors a query materialization may attach to its response instead of
    /// propagating.
    pub fn is_materialization_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Argument(_)
                | ClientError::Format(_)
                | ClientError::InvalidOperation(_)
                | ClientError::Json(_)
                | ClientError::Header(_)
                | ClientError::Client(_)
        )
    }
}

impl From<http::header::InvalidHeaderName> for ClientError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        ClientError::Header(err.into())
    }
}

impl From<http::header::InvalidHeaderValue> for ClientError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        ClientError::Header(err.into())
    }
}

/// A non-success status returned by the service for one operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("service returned status {status_code}: {message}")]
pub struct DataServiceClientError {
    pub status_code: StatusCode,
    pub code: Option<String>,
    pub message: String,
}

impl DataServiceClientError {
    pub fn new(status_code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status_code,
            code: None,
            message: message.into(),
        }
    }
}

/// Aggregate failure of a save or batch, carrying every operation response
/// that was produced before or after the failing one.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DataServiceRequestError {
    pub message: String,
    #[source]
    pub source: Arc<ClientError>,
    pub response: DataServiceResponse,
}

impl DataServiceRequestError {
    pub fn new(
        message: impl Into<String>,
        source: Arc<ClientError>,
        response: DataServiceResponse,
    ) -> Self {
        Self {
            message: message.into(),
            source,
            response,
        }
    }

    pub fn into_error(self) -> ClientError {
        ClientError::Request(Box::new(self))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("transport failure: {0}")]
    Other(String),
}
