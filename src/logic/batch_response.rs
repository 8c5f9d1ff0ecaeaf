use http::{HeaderMap, StatusCode};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ClientError, Result};
use crate::logic::pipeline::Pipeline;
use crate::logic::{query, response_handler};
use crate::model::{
    ChangeOperationResponse, DataServiceRequest, Descriptor, OperationResponse,
    QueryOperationResponse, ResponseEventArgs, SaveMode, SaveState,
};
use crate::wire::{BatchItem, BatchOperationResponse, BatchReader, BatchReaderState};

/// What the batch was built from.
#[derive(Debug, Clone)]
pub enum BatchSource {
    /// `save_changes` with the entries written in change order.
    Changes { mode: SaveMode, entries: Vec<Descriptor> },
    /// `execute_batch` with the queries in request order.
    Queries(Vec<DataServiceRequest>),
}

/// Lazy, single-pass walk over a batch response.
///
/// The iterator owns the reader and drops it on exhaustion, on the first
/// error, or when the iterator itself is dropped. Polling after that yields
/// `None`.
#[derive(Debug)]
pub struct BatchResponseIter {
    pipeline: Pipeline,
    reader: Option<BatchReader>,
    source: BatchSource,
    batch_status_code: Option<StatusCode>,
    batch_headers: HeaderMap,
    by_change_order: HashMap<u32, usize>,
    query_count: usize,
    operation_count: usize,
    changeset_found: bool,
}

impl BatchResponseIter {
    pub fn new(
        pipeline: Pipeline,
        reader: BatchReader,
        source: BatchSource,
        batch_status_code: StatusCode,
        batch_headers: HeaderMap,
    ) -> Self {
        let by_change_order = match &source {
            BatchSource::Changes { entries, .. } => entries
                .iter()
                .enumerate()
                .map(|(index, entry)| (entry.change_order(), index))
                .collect(),
            BatchSource::Queries(_) => HashMap::new(),
        };
        Self {
            pipeline,
            reader: Some(reader),
            source,
            batch_status_code: Some(batch_status_code),
            batch_headers,
            by_change_order,
            query_count: 0,
            operation_count: 0,
            changeset_found: false,
        }
    }

    /// An iterator with nothing to read.
    pub fn empty(pipeline: Pipeline, source: BatchSource) -> Self {
        Self {
            pipeline,
            reader: None,
            source,
            batch_status_code: None,
            batch_headers: HeaderMap::new(),
            by_change_order: HashMap::new(),
            query_count: 0,
            operation_count: 0,
            changeset_found: false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.reader.is_none()
    }

    pub fn batch_status_code(&self) -> Option<StatusCode> {
        self.batch_status_code
    }

    pub fn batch_headers(&self) -> &HeaderMap {
        &self.batch_headers
    }

    fn queries(&self) -> &[DataServiceRequest] {
        match &self.source {
            BatchSource::Queries(queries) => queries,
            BatchSource::Changes { .. } => &[],
        }
    }

    fn entries(&self) -> &[Descriptor] {
        match &self.source {
            BatchSource::Changes { entries, .. } => entries,
            BatchSource::Queries(_) => &[],
        }
    }

    fn single_changeset(&self) -> bool {
        matches!(
            self.source,
            BatchSource::Changes {
                mode: SaveMode::BatchWithSingleChangeset,
                ..
            }
        )
    }

    fn step(&mut self, reader: &mut BatchReader) -> Result<Option<OperationResponse>> {
        loop {
            match reader.next_item()? {
                None => {
                    if reader.state() != BatchReaderState::Completed {
                        return Err(ClientError::unexpected_content("the batch ended prematurely"));
                    }
                    self.validate_completion()?;
                    return Ok(None);
                }
                Some(BatchItem::ChangesetStart) => {
                    if (self.single_changeset() && self.changeset_found) || self.operation_count != 0 {
                        return Err(ClientError::unexpected_content("unexpected changeset start"));
                    }
                }
                Some(BatchItem::ChangesetEnd) => {
                    self.changeset_found = true;
                    self.operation_count = 0;
                }
                Some(BatchItem::Operation(operation)) => {
                    self.operation_count += 1;
                    let response = if reader.in_changeset() {
                        self.change_response(operation)?
                    } else {
                        self.query_response(operation)?
                    };
                    return Ok(Some(response));
                }
            }
        }
    }

    fn query_response(&mut self, operation: BatchOperationResponse) -> Result<OperationResponse> {
        if self.queries().is_empty() {
            // The service refused the batch as a whole.
            if operation.status_code.is_success() {
                return Err(ClientError::unexpected_content(
                    "an operation response outside of a changeset",
                ));
            }
            let error = self
                .pipeline
                .materializer
                .read_error(operation.status_code, &operation.body);
            return Err(error.into());
        }
        let Some(query) = self.queries().get(self.query_count).cloned() else {
            return Err(ClientError::unexpected_content(
                "more query responses than queries",
            ));
        };
        self.query_count += 1;

        self.pipeline.events.fire_receiving_response(&ResponseEventArgs {
            status_code: operation.status_code,
            headers: operation.headers.clone(),
            descriptor: None,
            is_batch_part: true,
        });

        let status = operation.status_code;
        if status == StatusCode::NOT_FOUND && self.pipeline.settings.ignore_resource_not_found {
            return Ok(OperationResponse::Query(QueryOperationResponse::empty(
                status,
                operation.headers,
                query,
            )));
        }
        if !status.is_success() {
            let error = self.pipeline.materializer.read_error(status, &operation.body);
            let mut response = QueryOperationResponse::empty(status, operation.headers, query);
            response.error = Some(Arc::new(error.into()));
            return Ok(OperationResponse::Query(response));
        }

        match query::materialize(&self.pipeline, &query, status, &operation.headers, &operation.body) {
            Ok(response) => Ok(OperationResponse::Query(response)),
            Err(err) if err.is_materialization_failure() => {
                let mut response = QueryOperationResponse::empty(status, operation.headers, query);
                response.error = Some(Arc::new(err));
                Ok(OperationResponse::Query(response))
            }
            Err(err) => Err(err),
        }
    }

    fn change_response(&mut self, operation: BatchOperationResponse) -> Result<OperationResponse> {
        let success = operation.status_code.is_success();
        let descriptor = operation
            .content_id
            .as_deref()
            .and_then(|id| id.parse::<i32>().ok())
            .and_then(|id| u32::try_from(id).ok())
            .and_then(|order| self.by_change_order.get(&order))
            .map(|index| self.entries()[*index].clone());

        if success && descriptor.is_none() {
            return Err(ClientError::unexpected_content(format!(
                "Content-ID {:?} does not match any change",
                operation.content_id
            )));
        }

        self.pipeline.events.fire_receiving_response(&ResponseEventArgs {
            status_code: operation.status_code,
            headers: operation.headers.clone(),
            descriptor: if success { descriptor.clone() } else { None },
            is_batch_part: true,
        });

        let error = if success {
            let target = descriptor
                .as_ref()
                .ok_or_else(|| ClientError::Internal("descriptor vanished".to_string()))?;
            match response_handler::apply_success(&self.pipeline, target, &operation.headers, &operation.body) {
                Ok(()) => None,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => Some(Arc::new(err)),
            }
        } else {
            let error = self
                .pipeline
                .materializer
                .read_error(operation.status_code, &operation.body);
            Some(Arc::new(ClientError::from(error)))
        };

        if let (Some(error), Some(descriptor)) = (&error, &descriptor) {
            warn!("batch operation failed: {}", error);
            response_handler::apply_failure(descriptor, error);
        }

        Ok(OperationResponse::Change(ChangeOperationResponse {
            status_code: operation.status_code,
            headers: operation.headers,
            descriptor,
            error,
        }))
    }

    fn validate_completion(&self) -> Result<()> {
        match &self.source {
            BatchSource::Changes { entries, .. } => {
                if self.changeset_found {
                    return Ok(());
                }
                let unprocessed = entries
                    .iter()
                    .filter(|e| e.content_generated_for_save() && e.save_result_was_processed().is_none())
                    .count();
                if unprocessed == 0 || entries.iter().any(|e| e.save_error().is_some()) {
                    Ok(())
                } else {
                    Err(ClientError::incomplete_response_count())
                }
            }
            BatchSource::Queries(queries) => {
                if self.query_count == queries.len() {
                    Ok(())
                } else {
                    Err(ClientError::incomplete_response_count())
                }
            }
        }
    }
}

impl Iterator for BatchResponseIter {
    type Item = Result<OperationResponse>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut reader = self.reader.take()?;
        match self.step(&mut reader) {
            Ok(Some(response)) => {
                self.reader = Some(reader);
                Some(Ok(response))
            }
            Ok(None) => {
                debug!("batch response fully read");
                self.pipeline.progress.set(SaveState::Completed);
                None
            }
            Err(err) => {
                self.pipeline.progress.set(SaveState::Faulted);
                Some(Err(err))
            }
        }
    }
}
