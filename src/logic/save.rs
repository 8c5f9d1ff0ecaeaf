use http::{HeaderMap, StatusCode};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, DataServiceRequestError, Result};
use crate::logic::pipeline::{
    mark_parent_link_generated, prepare_entries, OperationRequest, Pipeline,
};
use crate::logic::request_builder::{
    entity_request, is_media_insert, link_request, media_insert_request, media_update_request,
    named_stream_request,
};
use crate::logic::response_handler::{apply_failure, apply_success, header_url, materialize_into};
use crate::model::request::{header_str, headers};
use crate::model::{
    ChangeOperationResponse, DataServiceResponse, Descriptor, EntityRef, EntityStates, HasCore,
    HttpResponse, MergeOption, OperationResponse, ResponseEventArgs,
    SaveChangesOptions, SaveState, StreamStates, TransientEntityDescriptor,
};

const SAVE_FAILED: &str = "an error occurred while processing this request";

/// Status recorded for an operation that failed without a response.
const NO_RESPONSE_STATUS: StatusCode = StatusCode::INTERNAL_SERVER_ERROR;

/// A failed entry, with the response that reported it when there was one.
struct EntryFailure {
    error: ClientError,
    response: Option<HttpResponse>,
}

impl From<ClientError> for EntryFailure {
    fn from(error: ClientError) -> Self {
        Self {
            error,
            response: None,
        }
    }
}

/// Non-batch save: one exchange per changed entry, in change order.
#[derive(Debug)]
pub struct SaveResult {
    pipeline: Pipeline,
    options: SaveChangesOptions,
    entries: Vec<Descriptor>,
}

impl SaveResult {
    pub fn new(pipeline: Pipeline, options: SaveChangesOptions) -> Result<Self> {
        options.validate()?;
        if options.is_batch() {
            return Err(ClientError::Argument(
                "a non-batch save cannot run a batch save mode".to_string(),
            ));
        }
        let entries = prepare_entries(&pipeline.tracker);
        Ok(Self {
            pipeline,
            options,
            entries,
        })
    }

    pub fn entries(&self) -> &[Descriptor] {
        &self.entries
    }

    pub async fn execute(self, cancel: &CancellationToken) -> Result<DataServiceResponse> {
        let progress = self.pipeline.progress.clone();
        let mut response = DataServiceResponse::default();
        if self.entries.is_empty() {
            progress.set(SaveState::Completed);
            return Ok(response);
        }

        let mut first_error: Option<Arc<ClientError>> = None;
        for entry in &self.entries {
            // A link written by its child's insert needs no request of its own.
            if entry.content_generated_for_save() {
                continue;
            }
            progress.set(SaveState::BuildingRequest);
            entry.with_core_mut(|core| core.content_generated_for_save = true);
            mark_parent_link_generated(&self.pipeline, entry);
            match self.save_entry(entry, cancel).await {
                Ok(http) => {
                    response.responses.push(OperationResponse::Change(ChangeOperationResponse {
                        status_code: http.status_code,
                        headers: http.headers,
                        descriptor: Some(entry.clone()),
                        error: None,
                    }));
                }
                Err(failure) if failure.error.is_fatal() => {
                    progress.set(if matches!(failure.error, ClientError::Aborted) {
                        SaveState::Aborted
                    } else {
                        SaveState::Faulted
                    });
                    return Err(failure.error);
                }
                Err(EntryFailure { error, response: http }) => {
                    warn!("saving change {} failed: {}", entry.change_order(), error);
                    let error = Arc::new(error);
                    apply_failure(entry, &error);
                    let (status_code, headers) = http
                        .map(|r| (r.status_code, r.headers))
                        .unwrap_or((NO_RESPONSE_STATUS, HeaderMap::new()));
                    response.responses.push(OperationResponse::Change(ChangeOperationResponse {
                        status_code,
                        headers,
                        descriptor: Some(entry.clone()),
                        error: Some(error.clone()),
                    }));
                    first_error.get_or_insert(error);
                    if !self.options.continue_on_error {
                        break;
                    }
                }
            }
        }

        if let Some(error) = first_error {
            progress.set(SaveState::Faulted);
            return Err(DataServiceRequestError::new(SAVE_FAILED, error, response).into_error());
        }
        progress.set(SaveState::Completed);
        info!("saved {} change(s)", response.len());
        Ok(response)
    }

    async fn save_entry(
        &self,
        entry: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, EntryFailure> {
        let pipeline = &self.pipeline;
        match entry {
            Descriptor::Entity(entity_ref) => {
                let (state, media_insert, stream_pending) = {
                    let entity = entity_ref.read();
                    (
                        entity.state(),
                        is_media_insert(pipeline, &entity),
                        entity.has_pending_save_stream(),
                    )
                };
                if state == EntityStates::Added && media_insert {
                    let request = media_insert_request(pipeline, entity_ref)?;
                    let created = self.exchange(request, entry, cancel).await?;
                    self.apply_media_insert(entity_ref, &created)
                        .map_err(|error| EntryFailure {
                            error,
                            response: Some(created),
                        })?;
                    return self.entity_exchange(entity_ref, entry, cancel).await;
                }
                if stream_pending && state != EntityStates::Deleted {
                    let request = media_update_request(pipeline, entity_ref)?;
                    let updated = self.exchange(request, entry, cancel).await?;
                    {
                        let mut entity = entity_ref.write();
                        entity.stream_state = StreamStates::NoStream;
                        if let Some(etag) = header_str(&updated.headers, headers::ETAG) {
                            entity.default_stream_mut().etag = Some(etag.to_string());
                        }
                    }
                    if state != EntityStates::Modified {
                        entity_ref.write().core_mut().save_result_was_processed = Some(state);
                        return Ok(updated);
                    }
                }
                self.entity_exchange(entity_ref, entry, cancel).await
            }
            Descriptor::Link(link_ref) => {
                let request = link_request(pipeline, link_ref, false)?;
                let http = self.exchange(request, entry, cancel).await?;
                self.apply(entry, http)
            }
            Descriptor::NamedStream(stream_ref) => {
                let request = named_stream_request(pipeline, stream_ref)?;
                let http = self.exchange(request, entry, cancel).await?;
                self.apply(entry, http)
            }
        }
    }

    async fn entity_exchange(
        &self,
        entity_ref: &EntityRef,
        entry: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, EntryFailure> {
        let request = entity_request(&self.pipeline, entity_ref, &self.options, false)?;
        let http = self.exchange(request, entry, cancel).await?;
        self.apply(entry, http)
    }

    fn apply(&self, entry: &Descriptor, http: HttpResponse) -> Result<HttpResponse, EntryFailure> {
        match apply_success(&self.pipeline, entry, &http.headers, &http.body) {
            Ok(()) => Ok(http),
            Err(error) => Err(EntryFailure {
                error,
                response: Some(http),
            }),
        }
    }

    /// Send one request and turn a non-success status into a failure.
    async fn exchange(
        &self,
        mut request: OperationRequest,
        entry: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, EntryFailure> {
        let pipeline = &self.pipeline;
        pipeline.fire_request_events(&mut request, false);
        debug!("{} {}", request.method, request.uri);
        let http = pipeline.send(request, cancel).await?;
        pipeline.progress.set(SaveState::Sent);

        pipeline.events.fire_receiving_response(&ResponseEventArgs {
            status_code: http.status_code,
            headers: http.headers.clone(),
            descriptor: Some(entry.clone()),
            is_batch_part: false,
        });
        pipeline.progress.set(SaveState::ReadingResponse);

        if http.is_success() {
            return Ok(http);
        }
        let error = pipeline.materializer.read_error(http.status_code, &http.body);
        Err(EntryFailure {
            error: error.into(),
            response: Some(http),
        })
    }

    /// Take over the entry created by a media POST, then leave the entity
    /// Modified so its properties follow in a second request.
    fn apply_media_insert(&self, entity_ref: &EntityRef, created: &HttpResponse) -> Result<()> {
        let tracker = &self.pipeline.tracker;
        let handle = entity_ref.read().handle();
        let location = header_url(&created.headers, headers::LOCATION)?;
        let entity_id = header_url(&created.headers, headers::ODATA_ENTITY_ID)?;
        if let Some(identity) = entity_id.clone().or_else(|| location.clone()) {
            let edit_link = location.unwrap_or_else(|| identity.clone());
            tracker.attach_location(handle, identity, edit_link)?;
        }
        if let Some(etag) = header_str(&created.headers, headers::ETAG) {
            entity_ref.write().stage_transient(TransientEntityDescriptor {
                etag: Some(etag.to_string()),
                ..TransientEntityDescriptor::default()
            });
        }

        if created.body.is_empty() {
            if entity_ref.read().identity().is_none() {
                return Err(ClientError::invalid_operation(
                    "a media insert response must carry a Location header or an entry",
                ));
            }
            entity_ref.write().merge_transient(MergeOption::PreserveChanges);
        } else {
            materialize_into(&self.pipeline, entity_ref, &created.body, MergeOption::PreserveChanges)?;
            entity_ref.write().merge_transient(MergeOption::PreserveChanges);
        }

        let mut entity = entity_ref.write();
        entity.set_state(EntityStates::Modified);
        entity.stream_state = StreamStates::NoStream;
        Ok(())
    }
}
