use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::error::{ClientError, Result};
use crate::model::request::{header_str, headers};

/// Where the reader stands after the last item it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchReaderState {
    Initial,
    Operation,
    ChangesetStart,
    ChangesetEnd,
    Completed,
    Exception,
}

/// One operation response read from a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOperationResponse {
    pub status_code: StatusCode,
    pub headers: HeaderMap,
    /// Taken from the MIME part headers, or from the HTTP headers if the
    /// service placed it there.
    pub content_id: Option<String>,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchItem {
    ChangesetStart,
    ChangesetEnd,
    Operation(BatchOperationResponse),
}

/// Extract the `boundary` parameter of a multipart content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    let media_type = parts.next()?.trim();
    if !media_type.eq_ignore_ascii_case("multipart/mixed") {
        return None;
    }
    parts.find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("boundary") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// Splits one multipart body into its parts.
#[derive(Debug)]
struct PartCursor {
    body: Bytes,
    delimiter: String,
    pos: usize,
    started: bool,
    finished: bool,
}

impl PartCursor {
    fn new(body: Bytes, boundary: &str) -> Self {
        Self {
            body,
            delimiter: format!("--{}", boundary),
            pos: 0,
            started: false,
            finished: false,
        }
    }

    fn next_part(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
            self.pos = if self.body.starts_with(self.delimiter.as_bytes()) {
                0
            } else {
                let marker = format!("\r\n{}", self.delimiter);
                find(&self.body, marker.as_bytes())
                    .map(|i| i + 2)
                    .ok_or_else(|| ClientError::Format("missing batch boundary".to_string()))?
            };
            if self.consume_delimiter()? {
                self.finished = true;
                return Ok(None);
            }
        }

        let marker = format!("\r\n{}", self.delimiter);
        let end = find(&self.body[self.pos..], marker.as_bytes())
            .map(|i| self.pos + i)
            .ok_or_else(|| ClientError::Format("unterminated multipart body".to_string()))?;
        let part = self.body.slice(self.pos..end);
        self.pos = end + 2;
        if self.consume_delimiter()? {
            self.finished = true;
        }
        Ok(Some(part))
    }

    /// Step over the delimiter at `pos`. Returns true for a close delimiter.
    fn consume_delimiter(&mut self) -> Result<bool> {
        self.pos += self.delimiter.len();
        let rest = &self.body[self.pos..];
        if rest.starts_with(b"--") {
            self.pos += 2;
            return Ok(true);
        }
        let padding = rest
            .iter()
            .take_while(|b| **b == b' ' || **b == b'\t')
            .count();
        if rest[padding..].starts_with(b"\r\n") {
            self.pos += padding + 2;
            Ok(false)
        } else {
            Err(ClientError::Format(
                "malformed multipart delimiter line".to_string(),
            ))
        }
    }
}

/// Pull reader over a buffered batch response body.
#[derive(Debug)]
pub struct BatchReader {
    outer: PartCursor,
    changeset: Option<PartCursor>,
    state: BatchReaderState,
}

impl BatchReader {
    pub fn new(body: Bytes, content_type: &str) -> Result<Self> {
        let boundary = boundary_from_content_type(content_type).ok_or_else(|| {
            ClientError::Format(format!(
                "expected a multipart/mixed batch response, got '{}'",
                content_type
            ))
        })?;
        Ok(Self {
            outer: PartCursor::new(body, &boundary),
            changeset: None,
            state: BatchReaderState::Initial,
        })
    }

    pub fn state(&self) -> BatchReaderState {
        self.state
    }

    pub fn in_changeset(&self) -> bool {
        self.changeset.is_some()
    }

    pub fn next_item(&mut self) -> Result<Option<BatchItem>> {
        match self.read_item() {
            Ok(item) => Ok(item),
            Err(err) => {
                self.state = BatchReaderState::Exception;
                Err(err)
            }
        }
    }

    fn read_item(&mut self) -> Result<Option<BatchItem>> {
        match self.state {
            BatchReaderState::Completed => return Ok(None),
            BatchReaderState::Exception => {
                return Err(ClientError::invalid_operation(
                    "the batch reader cannot continue after an error",
                ))
            }
            _ => {}
        }

        if let Some(changeset) = self.changeset.as_mut() {
            return match changeset.next_part()? {
                Some(part) => {
                    self.state = BatchReaderState::Operation;
                    Ok(Some(BatchItem::Operation(parse_operation(part)?)))
                }
                None => {
                    self.changeset = None;
                    self.state = BatchReaderState::ChangesetEnd;
                    Ok(Some(BatchItem::ChangesetEnd))
                }
            };
        }

        let Some(part) = self.outer.next_part()? else {
            self.state = BatchReaderState::Completed;
            return Ok(None);
        };
        let (part_headers, content) = split_head(part)?;
        let content_type = header_str(&part_headers, headers::CONTENT_TYPE).unwrap_or_default();
        if let Some(boundary) = boundary_from_content_type(content_type) {
            self.changeset = Some(PartCursor::new(content, &boundary));
            self.state = BatchReaderState::ChangesetStart;
            return Ok(Some(BatchItem::ChangesetStart));
        }

        self.state = BatchReaderState::Operation;
        Ok(Some(BatchItem::Operation(read_http_message(
            &part_headers,
            content,
        )?)))
    }
}

fn parse_operation(part: Bytes) -> Result<BatchOperationResponse> {
    let (part_headers, content) = split_head(part)?;
    read_http_message(&part_headers, content)
}

fn read_http_message(part_headers: &HeaderMap, content: Bytes) -> Result<BatchOperationResponse> {
    let (status_line, rest) = split_line(content)?;
    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or_else(|| ClientError::Format(format!("invalid status line '{}'", status_line)))?;
    let (http_headers, body) = split_head(rest)?;
    let content_id = header_str(part_headers, headers::CONTENT_ID)
        .or_else(|| header_str(&http_headers, headers::CONTENT_ID))
        .map(|id| id.trim().to_string());
    Ok(BatchOperationResponse {
        status_code,
        headers: http_headers,
        content_id,
        body,
    })
}

fn split_line(content: Bytes) -> Result<(String, Bytes)> {
    let end = find(&content, b"\r\n")
        .ok_or_else(|| ClientError::Format("truncated batch operation".to_string()))?;
    let line = std::str::from_utf8(&content[..end])
        .map_err(|e| ClientError::Format(e.to_string()))?
        .to_string();
    Ok((line, content.slice(end + 2..)))
}

/// Split a header block from the content that follows the blank line.
fn split_head(content: Bytes) -> Result<(HeaderMap, Bytes)> {
    let (head_len, body_start) = if content.starts_with(b"\r\n") {
        (0, 2)
    } else {
        match find(&content, b"\r\n\r\n") {
            Some(i) => (i, i + 4),
            None => (content.len(), content.len()),
        }
    };
    let head = std::str::from_utf8(&content[..head_len])
        .map_err(|e| ClientError::Format(e.to_string()))?;
    let mut parsed = HeaderMap::new();
    for line in head.split("\r\n").filter(|l| !l.is_empty()) {
        let invalid = || ClientError::Format(format!("invalid header line '{}'", line));
        let (name, value) = line.split_once(':').ok_or_else(invalid)?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;
        parsed.append(name, value);
    }
    Ok((parsed, content.slice(body_start..)))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::batch_writer::BatchWriter;
    use pretty_assertions::assert_eq;

    fn response_body() -> (Bytes, String) {
        let mut writer = BatchWriter::with_boundary("batchresponse_1");
        let mut json = HeaderMap::new();
        json.insert(headers::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        writer
            .write_response(StatusCode::OK, &json, None, Some(&Bytes::from_static(b"{\"value\":[]}")))
            .unwrap();
        writer.start_changeset().unwrap();
        writer
            .write_response(StatusCode::NO_CONTENT, &HeaderMap::new(), Some("2"), None)
            .unwrap();
        writer
            .write_response(StatusCode::CREATED, &json, Some("1"), Some(&Bytes::from_static(b"{\"Id\":1}")))
            .unwrap();
        writer.end_changeset().unwrap();
        let content_type = writer.content_type();
        (writer.finish().unwrap(), content_type)
    }

    #[test]
    fn reads_queries_and_changesets_in_order() {
        let (body, content_type) = response_body();
        let mut reader = BatchReader::new(body, &content_type).unwrap();

        let Some(BatchItem::Operation(query)) = reader.next_item().unwrap() else {
            panic!("expected a query response");
        };
        assert_eq!(query.status_code, StatusCode::OK);
        assert_eq!(query.body, Bytes::from_static(b"{\"value\":[]}"));
        assert_eq!(reader.state(), BatchReaderState::Operation);

        assert_eq!(reader.next_item().unwrap(), Some(BatchItem::ChangesetStart));
        assert!(reader.in_changeset());

        let Some(BatchItem::Operation(first)) = reader.next_item().unwrap() else {
            panic!("expected an operation");
        };
        assert_eq!(first.status_code, StatusCode::NO_CONTENT);
        assert_eq!(first.content_id.as_deref(), Some("2"));
        assert!(first.body.is_empty());

        let Some(BatchItem::Operation(second)) = reader.next_item().unwrap() else {
            panic!("expected an operation");
        };
        assert_eq!(second.content_id.as_deref(), Some("1"));
        assert_eq!(header_str(&second.headers, "Content-Type"), Some("application/json"));
        assert_eq!(second.body, Bytes::from_static(b"{\"Id\":1}"));

        assert_eq!(reader.next_item().unwrap(), Some(BatchItem::ChangesetEnd));
        assert_eq!(reader.next_item().unwrap(), None);
        assert_eq!(reader.state(), BatchReaderState::Completed);
        assert_eq!(reader.next_item().unwrap(), None);
    }

    #[test]
    fn content_id_in_http_headers_is_accepted() {
        let body = "--b\r\nContent-Type: application/http\r\n\r\nHTTP/1.1 204 No Content\r\nContent-ID: 7\r\n\r\n\r\n--b--\r\n";
        let mut reader = BatchReader::new(Bytes::from(body), "multipart/mixed; boundary=b").unwrap();
        let Some(BatchItem::Operation(op)) = reader.next_item().unwrap() else {
            panic!("expected an operation");
        };
        assert_eq!(op.content_id.as_deref(), Some("7"));
    }

    #[test]
    fn malformed_bodies_fail() {
        assert!(BatchReader::new(Bytes::new(), "application/json").is_err());

        let mut reader =
            BatchReader::new(Bytes::from_static(b"no boundary here"), "multipart/mixed; boundary=b").unwrap();
        assert!(reader.next_item().is_err());
        assert_eq!(reader.state(), BatchReaderState::Exception);

        let truncated = "--b\r\nContent-Type: application/http\r\n\r\nHTTP/1.1 200 OK\r\n\r\n";
        let mut reader = BatchReader::new(Bytes::from(truncated), "multipart/mixed; boundary=\"b\"").unwrap();
        assert!(reader.next_item().is_err());

        let bad_status = "--b\r\nContent-Type: application/http\r\n\r\nHTTP/1.1 20 Short\r\n\r\n\r\n--b--\r\n";
        let mut reader = BatchReader::new(Bytes::from(bad_status), "multipart/mixed; boundary=b").unwrap();
        assert!(matches!(reader.next_item(), Err(ClientError::Format(_))));

        let bad_name = "--b\r\nContent-Type: application/http\r\n\r\nHTTP/1.1 204 No Content\r\nBad Name: x\r\n\r\n\r\n--b--\r\n";
        let mut reader = BatchReader::new(Bytes::from(bad_name), "multipart/mixed; boundary=b").unwrap();
        assert!(matches!(reader.next_item(), Err(ClientError::Format(ref m)) if m.contains("Bad Name")));
    }

    #[test]
    fn boundary_parsing() {
        assert_eq!(
            boundary_from_content_type("multipart/mixed; boundary=batch_1").as_deref(),
            Some("batch_1")
        );
        assert_eq!(
            boundary_from_content_type("Multipart/Mixed;charset=utf-8; boundary=\"x y\"").as_deref(),
            Some("x y")
        );
        assert_eq!(boundary_from_content_type("application/json"), None);
    }
}
