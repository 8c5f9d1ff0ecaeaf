use bytes::Bytes;
use http::StatusCode;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use url::Url;

use crate::error::{ClientError, DataServiceClientError, Result};
use crate::model::{ClientEntity, MaterializedEntry, MaterializedFeed};

const ODATA_ID: &str = "@odata.id";
const ODATA_EDIT_LINK: &str = "@odata.editLink";
const ODATA_READ_LINK: &str = "@odata.readLink";
const ODATA_ETAG: &str = "@odata.etag";
const ODATA_TYPE: &str = "@odata.type";
const ODATA_COUNT: &str = "@odata.count";
const ODATA_NEXT_LINK: &str = "@odata.nextLink";
const MEDIA_READ_LINK: &str = "@odata.mediaReadLink";
const MEDIA_EDIT_LINK: &str = "@odata.mediaEditLink";
const MEDIA_ETAG: &str = "@odata.mediaEtag";
const MEDIA_CONTENT_TYPE: &str = "@odata.mediaContentType";

/// Turns response payloads into entries the tracker can merge.
pub trait ResponseMaterializer: Send + Sync {
    /// Read a single resource. Relative links resolve against `base`.
    fn read_entry(&self, body: &[u8], base: &Url) -> Result<MaterializedEntry>;

    /// Read a collection, or a single resource as a one-entry feed.
    fn read_feed(&self, body: &[u8], base: &Url) -> Result<MaterializedFeed>;

    /// Build the error for a non-success response.
    fn read_error(&self, status_code: StatusCode, body: &[u8]) -> DataServiceClientError;
}

/// OData JSON (`odata.metadata=minimal`) reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMaterializer;

impl ResponseMaterializer for JsonMaterializer {
    fn read_entry(&self, body: &[u8], base: &Url) -> Result<MaterializedEntry> {
        match serde_json::from_slice::<Value>(body)? {
            Value::Object(object) => read_object(object, base),
            other => Err(ClientError::Format(format!(
                "expected a JSON object, found {}",
                value_kind(&other)
            ))),
        }
    }

    fn read_feed(&self, body: &[u8], base: &Url) -> Result<MaterializedFeed> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(MaterializedFeed::default());
        }
        let Value::Object(mut object) = serde_json::from_slice::<Value>(body)? else {
            return Err(ClientError::Format("expected a JSON object".to_string()));
        };

        let Some(value) = object.remove("value") else {
            return Ok(MaterializedFeed {
                entries: vec![read_object(object, base)?],
                count: None,
                next_link: None,
            });
        };
        let Value::Array(items) = value else {
            return Err(ClientError::Format("'value' is not an array".to_string()));
        };

        let entries = items
            .into_iter()
            .map(|item| match item {
                Value::Object(o) => read_object(o, base),
                other => Err(ClientError::Format(format!(
                    "expected an entity in 'value', found {}",
                    value_kind(&other)
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(MaterializedFeed {
            entries,
            count: object.get(ODATA_COUNT).and_then(Value::as_i64),
            next_link: link(&object, ODATA_NEXT_LINK, base)?,
        })
    }

    fn read_error(&self, status_code: StatusCode, body: &[u8]) -> DataServiceClientError {
        let parsed = serde_json::from_slice::<Value>(body).ok();
        let error = parsed.as_ref().and_then(|v| v.get("error"));
        match error {
            Some(error) => DataServiceClientError {
                status_code,
                code: error
                    .get("code")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("the service returned an error")
                    .to_string(),
            },
            None => {
                let text = String::from_utf8_lossy(body).trim().to_string();
                let message = if text.is_empty() {
                    format!("the service returned status {}", status_code.as_u16())
                } else {
                    text
                };
                DataServiceClientError::new(status_code, message)
            }
        }
    }
}

fn read_object(mut object: Map<String, Value>, base: &Url) -> Result<MaterializedEntry> {
    let mut entry = MaterializedEntry {
        type_name: object
            .get(ODATA_TYPE)
            .and_then(Value::as_str)
            .map(|t| t.trim_start_matches('#').to_string()),
        identity: link(&object, ODATA_ID, base)?,
        edit_link: link(&object, ODATA_EDIT_LINK, base)?,
        read_link: link(&object, ODATA_READ_LINK, base)?,
        etag: string(&object, ODATA_ETAG),
        media_read_link: link(&object, MEDIA_READ_LINK, base)?,
        media_edit_link: link(&object, MEDIA_EDIT_LINK, base)?,
        media_etag: string(&object, MEDIA_ETAG),
        media_content_type: string(&object, MEDIA_CONTENT_TYPE),
        ..MaterializedEntry::default()
    };
    // Instance annotations and property annotations are not properties.
    object.retain(|name, _| !name.contains('@'));
    entry.properties = object;
    if entry.identity.is_none() {
        entry.identity = entry.edit_link.clone().or_else(|| entry.read_link.clone());
    }
    Ok(entry)
}

fn string(object: &Map<String, Value>, name: &str) -> Option<String> {
    object.get(name).and_then(Value::as_str).map(str::to_string)
}

fn link(object: &Map<String, Value>, name: &str, base: &Url) -> Result<Option<Url>> {
    match object.get(name).and_then(Value::as_str) {
        Some(raw) => resolve(base, raw).map(Some),
        None => Ok(None),
    }
}

/// Resolve a possibly relative URI against the service root.
pub fn resolve(base: &Url, raw: &str) -> Result<Url> {
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let mut root = base.clone();
            if !root.path().ends_with('/') {
                let path = format!("{}/", root.path());
                root.set_path(&path);
            }
            root.join(raw.trim_start_matches('/'))
                .map_err(|e| ClientError::Format(format!("invalid link '{}': {}", raw, e)))
        }
        Err(e) => Err(ClientError::Format(format!("invalid link '{}': {}", raw, e))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Serialize an entity for an insert or update. With `only` set, just the
/// named properties are written.
pub fn write_entry(
    entity: &ClientEntity,
    namespace: Option<&str>,
    only: Option<&BTreeSet<String>>,
) -> Result<Bytes> {
    let mut body = Map::new();
    if let Some(namespace) = namespace {
        body.insert(
            ODATA_TYPE.to_string(),
            Value::String(format!("#{}.{}", namespace, entity.type_name)),
        );
    }
    for (name, value) in &entity.properties {
        if only.map(|set| set.contains(name)).unwrap_or(true) {
            body.insert(name.clone(), value.clone());
        }
    }
    Ok(Bytes::from(serde_json::to_vec(&Value::Object(body))?))
}

/// Body of a `$ref` request pointing at `target`, which may be a `$n`
/// reference inside a batch.
pub fn write_entity_reference(target: &str) -> Result<Bytes> {
    let mut body = Map::new();
    body.insert(ODATA_ID.to_string(), Value::String(target.to_string()));
    Ok(Bytes::from(serde_json::to_vec(&Value::Object(body))?))
}
