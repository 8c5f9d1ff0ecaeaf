#![allow(dead_code)]

use bytes::Bytes;
use odata_client::wire::BatchWriter;
use odata_client::{
    ClientEntity, ClientModel, DataServiceContext, EntityTypeInfo, HeaderMap, HeaderName,
    HeaderValue, HttpRequest, HttpResponse, StatusCode, Transport, TransportError,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use url::Url;

pub const ROOT: &str = "http://svc/odata/";

pub fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

pub fn model() -> ClientModel {
    ClientModel::new()
        .with_type(
            EntityTypeInfo::new("Customer")
                .entity_set("Customers")
                .key("Id")
                .property("Name")
                .collection("Orders", "Order")
                .reference("BestFriend", "Customer"),
        )
        .with_type(EntityTypeInfo::new("Order").entity_set("Orders").key("Id"))
        .with_type(
            EntityTypeInfo::new("Photo")
                .entity_set("Photos")
                .key("Id")
                .media_entry(),
        )
}

pub fn customer(id: i64) -> ClientEntity {
    ClientEntity::new("Customer")
        .with("Id", id)
        .with("Name", format!("customer {}", id))
}

/// Transport answering from a queue of canned responses and recording every
/// request it was given.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, response: HttpResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn request_body(&self, index: usize) -> String {
        let requests = self.requests.lock();
        let body = requests[index].body.clone().unwrap_or_default();
        String::from_utf8(body.to_vec()).unwrap()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Other("no scripted response left".to_string()))
    }
}

/// Transport whose exchanges never complete.
pub struct HangingTransport;

#[async_trait::async_trait]
impl Transport for HangingTransport {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        std::future::pending().await
    }
}

pub fn context(transport: Arc<dyn Transport>) -> DataServiceContext {
    DataServiceContext::new(url(ROOT), model(), transport)
}

pub fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap()
}

pub fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    map
}

pub fn response(status_code: u16, pairs: &[(&str, &str)], body: &str) -> HttpResponse {
    HttpResponse {
        status_code: status(status_code),
        headers: headers(pairs),
        body: Bytes::from(body.to_string()),
    }
}

/// One operation of a scripted batch response.
pub struct Part {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub content_id: Option<String>,
    pub body: Option<Bytes>,
}

impl Part {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HeaderMap::new(),
            content_id: None,
            body: None,
        }
    }

    pub fn id(mut self, content_id: u32) -> Self {
        self.content_id = Some(content_id.to_string());
        self
    }

    /// Content-ID taken verbatim, for ids no request was written with.
    pub fn raw_id(mut self, content_id: &str) -> Self {
        self.content_id = Some(content_id.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        self
    }

    pub fn created(content_id: u32, location: &str) -> Self {
        Self::new(201)
            .id(content_id)
            .header("Location", location)
            .header("OData-EntityId", location)
    }

    pub fn json(mut self, body: &str) -> Self {
        self = self.header("Content-Type", "application/json");
        self.body = Some(Bytes::from(body.to_string()));
        self
    }

    pub fn error(status_code: u16, message: &str) -> Self {
        Self::new(status_code).json(&format!(
            r#"{{"error":{{"code":"E{}","message":"{}"}}}}"#,
            status_code, message
        ))
    }
}

/// Builds a multipart batch response body.
pub struct BatchResponse {
    writer: BatchWriter,
}

impl BatchResponse {
    pub fn new() -> Self {
        Self {
            writer: BatchWriter::with_boundary("batchresponse_test"),
        }
    }

    pub fn part(mut self, part: Part) -> Self {
        self.writer
            .write_response(
                status(part.status_code),
                &part.headers,
                part.content_id.as_deref(),
                part.body.as_ref(),
            )
            .unwrap();
        self
    }

    pub fn changeset(mut self, parts: Vec<Part>) -> Self {
        self.writer.start_changeset().unwrap();
        for part in parts {
            self = self.part(part);
        }
        self.writer.end_changeset().unwrap();
        self
    }

    pub fn build(self) -> HttpResponse {
        let content_type = self.writer.content_type();
        let body = self.writer.finish().unwrap();
        HttpResponse {
            status_code: StatusCode::OK,
            headers: headers(&[("Content-Type", content_type.as_str())]),
            body,
        }
    }
}

/// Content-IDs of a batch request body, in write order.
pub fn content_ids(body: &str) -> Vec<u32> {
    body.lines()
        .filter_map(|line| line.strip_prefix("Content-ID: "))
        .map(|id| id.trim().parse().unwrap())
        .collect()
}

/// Request lines (`METHOD uri`) of a batch request body, in write order.
pub fn request_lines(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim_end)
        .filter(|line| line.ends_with(" HTTP/1.1"))
        .map(|line| line.trim_end_matches(" HTTP/1.1").to_string())
        .collect()
}
