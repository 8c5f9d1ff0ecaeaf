use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::model::request::headers;

const CRLF: &str = "\r\n";

// MIME headers of the multipart framing itself.
const PART_CONTENT_TYPE: &str = "Content-Type";
const PART_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";
const PART_CONTENT_ID: &str = "Content-ID";

/// One HTTP request inside a batch body.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOperation {
    pub method: Method,
    /// Absolute URI, or `$<content-id>` for an entity created earlier in the
    /// same changeset.
    pub uri: String,
    pub headers: HeaderMap,
    pub content_id: Option<String>,
    pub body: Option<Bytes>,
}

impl BatchOperation {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            content_id: None,
            body: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Batch,
    Changeset,
}

/// Writes a `multipart/mixed` batch message.
///
/// Requests and responses share the same framing, so the writer also
/// produces response bodies; the test transports rely on that.
#[derive(Debug)]
pub struct BatchWriter {
    batch_boundary: String,
    changeset_boundary: Option<String>,
    state: WriterState,
    buf: BytesMut,
    operations: usize,
}

impl Default for BatchWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchWriter {
    pub fn new() -> Self {
        Self::with_boundary(format!("batch_{}", Uuid::new_v4()))
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            batch_boundary: boundary.into(),
            changeset_boundary: None,
            state: WriterState::Batch,
            buf: BytesMut::new(),
            operations: 0,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.batch_boundary
    }

    /// Value of the `Content-Type` header of the batch message.
    pub fn content_type(&self) -> String {
        format!("multipart/mixed; boundary={}", self.batch_boundary)
    }

    pub fn operation_count(&self) -> usize {
        self.operations
    }

    pub fn start_changeset(&mut self) -> Result<()> {
        if self.state == WriterState::Changeset {
            return Err(ClientError::invalid_operation(
                "a changeset cannot be started inside another changeset",
            ));
        }
        let boundary = format!("changeset_{}", Uuid::new_v4());
        self.put_line(&format!("--{}", self.batch_boundary));
        self.put_line(&format!(
            "{}: multipart/mixed; boundary={}",
            PART_CONTENT_TYPE, boundary
        ));
        self.put_line("");
        self.changeset_boundary = Some(boundary);
        self.state = WriterState::Changeset;
        Ok(())
    }

    pub fn end_changeset(&mut self) -> Result<()> {
        let Some(boundary) = self.changeset_boundary.take() else {
            return Err(ClientError::invalid_operation(
                "no changeset is open",
            ));
        };
        self.put_line(&format!("--{}--", boundary));
        self.state = WriterState::Batch;
        Ok(())
    }

    pub fn write_request(&mut self, operation: &BatchOperation) -> Result<()> {
        if self.state == WriterState::Changeset && operation.method == Method::GET {
            return Err(ClientError::invalid_operation(
                "a query cannot be part of a changeset",
            ));
        }
        self.start_part(operation.content_id.as_deref());
        self.put_line(&format!("{} {} HTTP/1.1", operation.method, operation.uri));
        self.finish_part(&operation.headers, operation.body.as_ref());
        Ok(())
    }

    pub fn write_response(
        &mut self,
        status_code: StatusCode,
        headers: &HeaderMap,
        content_id: Option<&str>,
        body: Option<&Bytes>,
    ) -> Result<()> {
        self.start_part(content_id);
        self.put_line(&format!(
            "HTTP/1.1 {} {}",
            status_code.as_str(),
            status_code.canonical_reason().unwrap_or("Status")
        ));
        self.finish_part(headers, body);
        Ok(())
    }

    /// Close the batch and hand back the encoded message.
    pub fn finish(mut self) -> Result<Bytes> {
        if self.state == WriterState::Changeset {
            return Err(ClientError::invalid_operation(
                "the batch cannot be closed while a changeset is open",
            ));
        }
        self.put_line(&format!("--{}--", self.batch_boundary));
        Ok(self.buf.freeze())
    }

    fn start_part(&mut self, content_id: Option<&str>) {
        let boundary = match &self.changeset_boundary {
            Some(changeset) => changeset.clone(),
            None => self.batch_boundary.clone(),
        };
        self.put_line(&format!("--{}", boundary));
        self.put_line(&format!("{}: application/http", PART_CONTENT_TYPE));
        self.put_line(&format!("{}: binary", PART_TRANSFER_ENCODING));
        if let Some(id) = content_id {
            self.put_line(&format!("{}: {}", PART_CONTENT_ID, id));
        }
        self.put_line("");
        self.operations += 1;
    }

    fn finish_part(&mut self, part_headers: &HeaderMap, body: Option<&Bytes>) {
        for (name, value) in part_headers {
            self.buf.put_slice(name.as_str().as_bytes());
            self.buf.put_slice(b": ");
            self.buf.put_slice(value.as_bytes());
            self.buf.put_slice(CRLF.as_bytes());
        }
        if let Some(body) = body {
            if !part_headers.contains_key(headers::CONTENT_LENGTH) {
                self.put_line(&format!("{}: {}", headers::CONTENT_LENGTH, body.len()));
            }
        }
        self.put_line("");
        if let Some(body) = body {
            self.buf.put_slice(body);
            self.buf.put_slice(CRLF.as_bytes());
        }
    }

    fn put_line(&mut self, line: &str) {
        self.buf.put_slice(line.as_bytes());
        self.buf.put_slice(CRLF.as_bytes());
    }
}
