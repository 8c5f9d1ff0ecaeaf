use log::debug;
use std::time::Duration;

use crate::config::HttpConfig;
use crate::error::TransportError;
use crate::model::{HttpRequest, HttpResponse};
use crate::transport::traits::Transport;

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        debug!("{} {}", request.method, request.uri);
        let mut builder = self
            .client
            .request(request.method, request.uri)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status_code = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        debug!("-> {} ({} bytes)", status_code, body.len());

        Ok(HttpResponse {
            status_code,
            headers,
            body,
        })
    }
}
