pub mod http;
pub mod traits;

pub use self::http::HttpTransport;
pub use traits::Transport;

use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};
use crate::model::{HttpRequest, HttpResponse};

/// Race one exchange against `cancel`; a cancelled exchange is dropped.
pub async fn send_or_cancel(
    transport: &dyn Transport,
    request: HttpRequest,
    cancel: &CancellationToken,
) -> Result<HttpResponse> {
    if cancel.is_cancelled() {
        return Err(ClientError::Aborted);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(ClientError::Aborted),
        response = transport.send(request) => Ok(response?),
    }
}
