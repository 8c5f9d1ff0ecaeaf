use bytes::Bytes;
use http::header::AsHeaderName;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

/// Header names used by the protocol. Standard names come from `http`.
pub mod headers {
    use http::HeaderName;

    pub use http::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MATCH, LOCATION};

    pub const ODATA_VERSION: HeaderName = HeaderName::from_static("odata-version");
    pub const ODATA_MAX_VERSION: HeaderName = HeaderName::from_static("odata-maxversion");
    pub const CONTENT_ID: HeaderName = HeaderName::from_static("content-id");
    pub const PREFER: HeaderName = HeaderName::from_static("prefer");
    pub const ODATA_ENTITY_ID: HeaderName = HeaderName::from_static("odata-entityid");
    pub const SLUG: HeaderName = HeaderName::from_static("slug");
}

pub const ODATA_VERSION_4: &str = "4.0";
pub const JSON_CONTENT_TYPE: &str = "application/json;odata.metadata=minimal";

/// Value of `name` when it is present and visible ASCII.
pub fn header_str<K: AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// One HTTP exchange as seen by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, uri: Url) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status_code: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status_code: StatusCode) -> Self {
        Self {
            status_code,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code.is_success()
    }
}

/// A query to execute, either alone or as part of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DataServiceRequest {
    /// Absolute, or relative to the service root.
    pub uri: String,
    /// Type used to materialize untyped entries.
    pub element_type: Option<String>,
}

impl DataServiceRequest {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            element_type: None,
        }
    }

    pub fn of_type(mut self, element_type: impl Into<String>) -> Self {
        self.element_type = Some(element_type.into());
        self
    }
}
