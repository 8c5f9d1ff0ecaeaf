use http::{HeaderMap, StatusCode};
use serde_json::{Map, Value};
use std::sync::Arc;
use url::Url;

use crate::error::ClientError;
use crate::model::common::EntityHandle;
use crate::model::descriptor::Descriptor;
use crate::model::request::DataServiceRequest;

/// One resource record produced by the message reader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializedEntry {
    pub type_name: Option<String>,
    pub identity: Option<Url>,
    pub edit_link: Option<Url>,
    pub read_link: Option<Url>,
    pub etag: Option<String>,
    pub properties: Map<String, Value>,
    pub media_read_link: Option<Url>,
    pub media_edit_link: Option<Url>,
    pub media_etag: Option<String>,
    pub media_content_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializedFeed {
    pub entries: Vec<MaterializedEntry>,
    pub count: Option<i64>,
    pub next_link: Option<Url>,
}

/// Result of one insert, update, delete or link operation.
#[derive(Debug, Clone)]
pub struct ChangeOperationResponse {
    pub status_code: StatusCode,
    pub headers: HeaderMap,
    pub descriptor: Option<Descriptor>,
    pub error: Option<Arc<ClientError>>,
}

/// Result of one query.
#[derive(Debug, Clone)]
pub struct QueryOperationResponse {
    pub status_code: StatusCode,
    pub headers: HeaderMap,
    pub query: DataServiceRequest,
    pub entries: Vec<MaterializedEntry>,
    /// Tracked entities the entries were merged into; empty under NoTracking.
    pub handles: Vec<EntityHandle>,
    pub count: Option<i64>,
    pub next_link: Option<Url>,
    pub error: Option<Arc<ClientError>>,
}

impl QueryOperationResponse {
    pub fn empty(status_code: StatusCode, headers: HeaderMap, query: DataServiceRequest) -> Self {
        Self {
            status_code,
            headers,
            query,
            entries: Vec::new(),
            handles: Vec::new(),
            count: None,
            next_link: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum OperationResponse {
    Change(ChangeOperationResponse),
    Query(QueryOperationResponse),
}

impl OperationResponse {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OperationResponse::Change(r) => r.status_code,
            OperationResponse::Query(r) => r.status_code,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        match self {
            OperationResponse::Change(r) => &r.headers,
            OperationResponse::Query(r) => &r.headers,
        }
    }

    pub fn error(&self) -> Option<&Arc<ClientError>> {
        match self {
            OperationResponse::Change(r) => r.error.as_ref(),
            OperationResponse::Query(r) => r.error.as_ref(),
        }
    }

    pub fn as_change(&self) -> Option<&ChangeOperationResponse> {
        match self {
            OperationResponse::Change(r) => Some(r),
            OperationResponse::Query(_) => None,
        }
    }

    pub fn as_query(&self) -> Option<&QueryOperationResponse> {
        match self {
            OperationResponse::Query(r) => Some(r),
            OperationResponse::Change(_) => None,
        }
    }
}

/// Aggregate result of a save or a batch.
#[derive(Debug, Clone, Default)]
pub struct DataServiceResponse {
    pub is_batch: bool,
    pub batch_status_code: Option<StatusCode>,
    pub batch_headers: HeaderMap,
    pub responses: Vec<OperationResponse>,
}

impl DataServiceResponse {
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OperationResponse> {
        self.responses.iter()
    }

    pub fn first_error(&self) -> Option<&Arc<ClientError>> {
        self.responses.iter().find_map(|r| r.error())
    }
}

impl IntoIterator for DataServiceResponse {
    type Item = OperationResponse;
    type IntoIter = std::vec::IntoIter<OperationResponse>;

    fn into_iter(self) -> Self::IntoIter {
        self.responses.into_iter()
    }
}
