use crate::error::TransportError;
use crate::model::{HttpRequest, HttpResponse};

/// Executes one HTTP exchange. The response body is fully buffered.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}
