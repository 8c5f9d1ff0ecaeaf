use http::{HeaderValue, Method};
use log::{debug, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, DataServiceRequestError, Result};
use crate::logic::batch_response::{BatchResponseIter, BatchSource};
use crate::logic::pipeline::{
    mark_parent_link_generated, prepare_entries, OperationRequest, Pipeline,
};
use crate::logic::request_builder::{entity_request, link_request, validate_for_batch};
use crate::model::request::{header_str, headers};
use crate::model::{
    DataServiceRequest, DataServiceResponse, Descriptor, ResponseEventArgs, SaveChangesOptions,
    SaveMode, SaveState,
};
use crate::wire::{BatchOperation, BatchReader, BatchWriter};

const BATCH_FAILED: &str = "an error occurred while processing this batch";

/// One `$batch` exchange, either for pending changes or for a set of queries.
#[derive(Debug)]
pub struct BatchSaveResult {
    pipeline: Pipeline,
    options: SaveChangesOptions,
    source: BatchSource,
}

impl BatchSaveResult {
    pub fn for_changes(pipeline: Pipeline, options: SaveChangesOptions) -> Result<Self> {
        options.validate()?;
        if !options.is_batch() {
            return Err(ClientError::Argument(
                "a batch save needs a batch save mode".to_string(),
            ));
        }
        let entries = prepare_entries(&pipeline.tracker);
        Ok(Self {
            pipeline,
            options,
            source: BatchSource::Changes {
                mode: options.mode,
                entries,
            },
        })
    }

    pub fn for_queries(pipeline: Pipeline, queries: Vec<DataServiceRequest>) -> Self {
        Self {
            pipeline,
            options: SaveChangesOptions::batch_independent_operations(),
            source: BatchSource::Queries(queries),
        }
    }

    pub fn entries(&self) -> &[Descriptor] {
        match &self.source {
            BatchSource::Changes { entries, .. } => entries,
            BatchSource::Queries(_) => &[],
        }
    }

    fn is_empty(&self) -> bool {
        match &self.source {
            BatchSource::Changes { entries, .. } => entries.is_empty(),
            BatchSource::Queries(queries) => queries.is_empty(),
        }
    }

    /// Serialize the batch. `None` when there is nothing to send.
    pub fn generate_batch_request(&mut self) -> Result<Option<OperationRequest>> {
        if self.is_empty() {
            return Ok(None);
        }
        let pipeline = &self.pipeline;
        let mut writer = BatchWriter::new();

        match &self.source {
            BatchSource::Queries(queries) => {
                for query in queries {
                    let mut request =
                        OperationRequest::new(Method::GET, pipeline.resolve(&query.uri)?.to_string(), None);
                    request.headers = pipeline.protocol_headers();
                    pipeline.fire_request_events(&mut request, true);
                    writer.write_request(&BatchOperation {
                        method: request.method,
                        uri: request.uri,
                        headers: request.headers,
                        content_id: None,
                        body: None,
                    })?;
                }
            }
            BatchSource::Changes { mode, entries } => {
                // Reject what a changeset cannot carry before writing anything.
                for entry in entries.iter().filter(|e| !e.content_generated_for_save()) {
                    validate_for_batch(pipeline, entry)?;
                }

                let single = *mode == SaveMode::BatchWithSingleChangeset;
                if single {
                    writer.start_changeset()?;
                }
                for entry in entries {
                    if entry.content_generated_for_save() {
                        continue;
                    }
                    if !single {
                        writer.start_changeset()?;
                    }
                    let mut request = match entry {
                        Descriptor::Entity(entity) => entity_request(pipeline, entity, &self.options, true)?,
                        Descriptor::Link(link) => link_request(pipeline, link, true)?,
                        Descriptor::NamedStream(_) => {
                            return Err(ClientError::Internal(
                                "named stream reached the batch writer".to_string(),
                            ))
                        }
                    };
                    pipeline.fire_request_events(&mut request, true);
                    writer.write_request(&BatchOperation {
                        method: request.method,
                        uri: request.uri,
                        headers: request.headers,
                        content_id: Some(entry.change_order().to_string()),
                        body: request.body,
                    })?;
                    entry.with_core_mut(|core| core.content_generated_for_save = true);
                    mark_parent_link_generated(pipeline, entry);
                    if !single {
                        writer.end_changeset()?;
                    }
                }
                if single {
                    writer.end_changeset()?;
                }

                if entries.iter().any(|e| !e.content_generated_for_save()) {
                    return Err(ClientError::Internal(
                        "a changed entry produced no request".to_string(),
                    ));
                }
            }
        }

        let content_type = writer.content_type();
        debug!("batch request with {} operation(s)", writer.operation_count());
        let mut request = OperationRequest::new(Method::POST, pipeline.batch_uri()?.to_string(), None);
        request
            .headers
            .insert(headers::CONTENT_TYPE, HeaderValue::from_str(&content_type)?);
        request.body = Some(writer.finish()?);
        Ok(Some(request))
    }

    /// Send the batch and hand back the lazy response walk.
    pub async fn execute_lazy(mut self, cancel: &CancellationToken) -> Result<BatchResponseIter> {
        let progress = self.pipeline.progress.clone();
        progress.set(SaveState::BuildingRequest);

        let request = match self.generate_batch_request() {
            Ok(Some(request)) => request,
            Ok(None) => {
                progress.set(SaveState::Completed);
                return Ok(BatchResponseIter::empty(self.pipeline, self.source));
            }
            Err(err) => {
                progress.set(SaveState::Faulted);
                return Err(err);
            }
        };

        let response = match self.pipeline.send(request, cancel).await {
            Ok(response) => response,
            Err(err) => {
                progress.set(if matches!(err, ClientError::Aborted) {
                    SaveState::Aborted
                } else {
                    SaveState::Faulted
                });
                return Err(err);
            }
        };
        progress.set(SaveState::Sent);

        self.pipeline.events.fire_receiving_response(&ResponseEventArgs {
            status_code: response.status_code,
            headers: response.headers.clone(),
            descriptor: None,
            is_batch_part: false,
        });

        if !response.is_success() {
            progress.set(SaveState::Faulted);
            let error = self
                .pipeline
                .materializer
                .read_error(response.status_code, &response.body);
            let partial = DataServiceResponse {
                is_batch: true,
                batch_status_code: Some(response.status_code),
                batch_headers: response.headers,
                responses: Vec::new(),
            };
            return Err(DataServiceRequestError::new(BATCH_FAILED, Arc::new(error.into()), partial).into_error());
        }

        let content_type = header_str(&response.headers, headers::CONTENT_TYPE)
            .unwrap_or_default()
            .to_string();
        let reader = BatchReader::new(response.body, &content_type).map_err(|err| {
            progress.set(SaveState::Faulted);
            err
        })?;
        progress.set(SaveState::ReadingResponse);
        Ok(BatchResponseIter::new(
            self.pipeline,
            reader,
            self.source,
            response.status_code,
            response.headers,
        ))
    }

    /// Send the batch, read every response and aggregate.
    pub async fn execute(self, cancel: &CancellationToken) -> Result<DataServiceResponse> {
        let single = self.options.mode == SaveMode::BatchWithSingleChangeset
            && matches!(self.source, BatchSource::Changes { .. });
        let progress = self.pipeline.progress.clone();

        let mut responses = Vec::new();
        let response = {
            let mut iter = self.execute_lazy(cancel).await?;
            for item in iter.by_ref() {
                responses.push(item?);
            }
            DataServiceResponse {
                is_batch: true,
                batch_status_code: iter.batch_status_code(),
                batch_headers: iter.batch_headers().clone(),
                responses,
            }
        };

        if single {
            if let Some(error) = response.first_error().cloned() {
                progress.set(SaveState::Faulted);
                return Err(DataServiceRequestError::new(BATCH_FAILED, error, response).into_error());
            }
        }
        info!("batch completed with {} response(s)", response.len());
        Ok(response)
    }
}
