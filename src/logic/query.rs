use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};
use crate::logic::pipeline::{OperationRequest, Pipeline};
use crate::model::{
    DataServiceRequest, EntityDescriptor, EntityHandle, EntityStates, HasCore, MaterializedEntry,
    MergeOption, QueryOperationResponse, ResponseEventArgs,
};

/// Run one query outside of a batch.
pub async fn execute(
    pipeline: &Pipeline,
    query: &DataServiceRequest,
    cancel: &CancellationToken,
) -> Result<QueryOperationResponse> {
    let mut request = OperationRequest::new(Method::GET, pipeline.resolve(&query.uri)?.to_string(), None);
    pipeline.fire_request_events(&mut request, false);
    let response = pipeline.send(request, cancel).await?;

    pipeline.events.fire_receiving_response(&ResponseEventArgs {
        status_code: response.status_code,
        headers: response.headers.clone(),
        descriptor: None,
        is_batch_part: false,
    });

    if response.status_code == StatusCode::NOT_FOUND && pipeline.settings.ignore_resource_not_found {
        return Ok(QueryOperationResponse::empty(
            StatusCode::NOT_FOUND,
            response.headers,
            query.clone(),
        ));
    }
    if !response.is_success() {
        let error = pipeline.materializer.read_error(response.status_code, &response.body);
        return Err(error.into());
    }
    materialize(pipeline, query, response.status_code, &response.headers, &response.body)
}

/// Read a query response and merge its entries into the tracker.
pub fn materialize(
    pipeline: &Pipeline,
    query: &DataServiceRequest,
    status_code: StatusCode,
    response_headers: &HeaderMap,
    body: &Bytes,
) -> Result<QueryOperationResponse> {
    debug_assert!(status_code.is_success());
    let feed = pipeline
        .materializer
        .read_feed(body, &pipeline.settings.service_root)?;
    let merge_option = pipeline.settings.merge_option;

    let mut handles = Vec::new();
    if merge_option != MergeOption::NoTracking {
        for entry in &feed.entries {
            if let Some(handle) = merge_entry(pipeline, query, entry, merge_option)? {
                handles.push(handle);
            }
        }
    }
    debug!(
        "materialized {} entries from {} ({} tracked)",
        feed.entries.len(),
        query.uri,
        handles.len()
    );

    Ok(QueryOperationResponse {
        status_code,
        headers: response_headers.clone(),
        query: query.clone(),
        entries: feed.entries,
        handles,
        count: feed.count,
        next_link: feed.next_link,
        error: None,
    })
}

fn merge_entry(
    pipeline: &Pipeline,
    query: &DataServiceRequest,
    entry: &MaterializedEntry,
    merge_option: MergeOption,
) -> Result<Option<EntityHandle>> {
    let tracker = &pipeline.tracker;
    let Some(identity) = entry.identity.as_ref() else {
        return Ok(None);
    };

    if let Some(existing) = tracker.try_get_entity_by_identity(identity) {
        let mut entity = existing.write();
        let replace = match merge_option {
            MergeOption::OverwriteChanges => true,
            MergeOption::PreserveChanges => entity.state() == EntityStates::Unchanged,
            _ => false,
        };
        if replace {
            let handle = entity.handle();
            let type_name = entity.entity().type_name.clone();
            let from_response = EntityDescriptor::from_entry(handle, &type_name, entry);
            entity.merge_properties(&entry.properties, true);
            entity.merge_info(&from_response, merge_option);
            entity.set_state(EntityStates::Unchanged);
            entity.properties_to_serialize.clear();
        }
        return Ok(Some(entity.handle()));
    }

    let type_name = entry
        .type_name
        .as_deref()
        .map(|name| registered_type_name(pipeline, name))
        .or_else(|| query.element_type.clone())
        .ok_or_else(|| {
            ClientError::Argument(format!(
                "the type of the entry '{}' is unknown; give the query an element type",
                identity
            ))
        })?;
    let mut descriptor = EntityDescriptor::from_entry(tracker.next_handle(), &type_name, entry);
    let entity_set = tracker
        .model()
        .try_get(&type_name)
        .and_then(|info| info.entity_set.clone());
    descriptor.set_entity_set(entity_set);
    let attached = tracker.internal_attach_entity_descriptor(descriptor, false)?;
    let handle = attached.read().handle();
    Ok(Some(handle))
}

/// Map a qualified `Namespace.Type` name onto a registered type name.
fn registered_type_name(pipeline: &Pipeline, name: &str) -> String {
    let model = pipeline.tracker.model();
    if model.try_get(name).is_some() {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((_, local)) if model.try_get(local).is_some() => local.to_string(),
        _ => name.to_string(),
    }
}
