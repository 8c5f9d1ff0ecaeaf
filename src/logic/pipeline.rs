use http::{HeaderMap, HeaderValue, Method};
use log::debug;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Result;
use crate::logic::buffer_pool::BufferPool;
use crate::model::request::{headers, JSON_CONTENT_TYPE, ODATA_VERSION_4};
use crate::model::{
    ContextEvents, Descriptor, EntityStates, HasCore, HttpRequest,
    HttpResponse, MergeOption, RequestEventArgs, ResponsePreference, SaveState,
};
use crate::store::EntityTracker;
use crate::transport::{send_or_cancel, Transport};
use crate::wire::{json, ResponseMaterializer};

/// Per-context settings a pipeline run reads.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub service_root: Url,
    pub type_namespace: Option<String>,
    pub merge_option: MergeOption,
    pub ignore_resource_not_found: bool,
    pub response_preference: ResponsePreference,
}

impl ContextSettings {
    pub fn new(service_root: Url) -> Self {
        Self {
            service_root,
            type_namespace: None,
            merge_option: MergeOption::AppendOnly,
            ignore_resource_not_found: false,
            response_preference: ResponsePreference::None,
        }
    }
}

/// State of the most recent save or batch of a context.
#[derive(Debug)]
pub struct SaveProgress {
    state: Mutex<SaveState>,
}

impl Default for SaveProgress {
    fn default() -> Self {
        Self {
            state: Mutex::new(SaveState::Idle),
        }
    }
}

impl SaveProgress {
    pub fn get(&self) -> SaveState {
        *self.state.lock()
    }

    pub fn set(&self, state: SaveState) {
        let mut current = self.state.lock();
        debug!("save state {:?} -> {:?}", *current, state);
        *current = state;
    }
}

/// A request produced for one descriptor or query, before it is framed or
/// sent.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub method: Method,
    /// Absolute URI, or `$<content-id>` inside a batch.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Option<bytes::Bytes>,
    pub descriptor: Option<Descriptor>,
}

impl OperationRequest {
    pub fn new(method: Method, uri: impl Into<String>, descriptor: Option<Descriptor>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: None,
            descriptor,
        }
    }
}

/// Collaborators one save, query or batch runs against.
#[derive(Clone)]
pub struct Pipeline {
    pub tracker: Arc<EntityTracker>,
    pub transport: Arc<dyn Transport>,
    pub materializer: Arc<dyn ResponseMaterializer>,
    pub events: Arc<ContextEvents>,
    pub buffers: Arc<BufferPool>,
    pub progress: Arc<SaveProgress>,
    pub settings: ContextSettings,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("settings", &self.settings)
            .field("state", &self.progress.get())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn resolve(&self, uri: &str) -> Result<Url> {
        json::resolve(&self.settings.service_root, uri)
    }

    pub fn batch_uri(&self) -> Result<Url> {
        self.resolve("$batch")
    }

    /// Protocol headers every top-level request carries.
    pub fn protocol_headers(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(headers::ODATA_VERSION, HeaderValue::from_static(ODATA_VERSION_4));
        map.insert(headers::ODATA_MAX_VERSION, HeaderValue::from_static(ODATA_VERSION_4));
        map.insert(headers::ACCEPT, HeaderValue::from_static(JSON_CONTENT_TYPE));
        map
    }

    /// Run the BuildingRequest and SendingRequest extension points.
    pub fn fire_request_events(&self, request: &mut OperationRequest, is_batch_part: bool) {
        let mut args = RequestEventArgs {
            method: request.method.clone(),
            uri: std::mem::take(&mut request.uri),
            headers: std::mem::take(&mut request.headers),
            descriptor: request.descriptor.clone(),
            is_batch_part,
        };
        self.events.fire_building_request(&mut args);
        self.events.fire_sending_request(&mut args);
        request.uri = args.uri;
        request.headers = args.headers;
    }

    /// Send one top-level request, honoring `cancel`.
    pub async fn send(&self, request: OperationRequest, cancel: &CancellationToken) -> Result<HttpResponse> {
        let mut http = HttpRequest::new(request.method, self.resolve(&request.uri)?);
        http.headers = self.protocol_headers();
        // Per-request headers replace the protocol defaults of the same name.
        http.headers.extend(request.headers);
        http.body = request.body;
        send_or_cancel(self.transport.as_ref(), http, cancel).await
    }
}

/// Changed entries of the tracker with their save bookkeeping reset.
pub fn prepare_entries(tracker: &EntityTracker) -> Vec<Descriptor> {
    let entries = tracker.changed_entries();
    for entry in &entries {
        entry.with_core_mut(|core| core.reset_for_save());
        if let Descriptor::Link(link) = entry {
            let target = link.read().target();
            if let Some(target) = target.and_then(|t| tracker.try_get_entity_descriptor(t)) {
                let mut target = target.write();
                if target.state() == EntityStates::Unchanged {
                    target.core_mut().reset_for_save();
                }
            }
        }
    }
    entries
}

/// An entity inserted through its parent carries the parent link in the
/// same request.
pub fn mark_parent_link_generated(pipeline: &Pipeline, entry: &Descriptor) {
    let Descriptor::Entity(entity) = entry else {
        return;
    };
    let related_end = {
        let entity = entity.read();
        if entity.state() != EntityStates::Added {
            return;
        }
        entity.related_end()
    };
    if let Some(key) = related_end {
        if let Some(link) = pipeline
            .tracker
            .try_get_link_descriptor(key.source, &key.source_property, key.target)
        {
            link.write().core_mut().content_generated_for_save = true;
        }
    }
}
