use bytes::Bytes;
use http::{HeaderMap, HeaderName};
use log::debug;
use std::sync::Arc;
use url::Url;

use crate::error::{ClientError, Result};
use crate::logic::pipeline::Pipeline;
use crate::model::request::{header_str, headers};
use crate::model::{
    Descriptor, EntityDescriptor, EntityRef, EntityStates, HasCore, LinkRef,
    MergeOption, StreamRef, TransientEntityDescriptor,
};

/// Apply a successful change response to the descriptor it belongs to.
pub fn apply_success(
    pipeline: &Pipeline,
    descriptor: &Descriptor,
    response_headers: &HeaderMap,
    body: &Bytes,
) -> Result<()> {
    match descriptor {
        Descriptor::Entity(entity) => apply_entity(pipeline, entity, response_headers, body),
        Descriptor::Link(link) => apply_link(pipeline, link),
        Descriptor::NamedStream(stream) => {
            apply_named_stream(stream, response_headers);
            Ok(())
        }
    }
}

/// Record a failed operation on its descriptor.
pub fn apply_failure(descriptor: &Descriptor, error: &Arc<ClientError>) {
    descriptor.with_core_mut(|core| {
        core.save_error = Some(error.clone());
        core.save_result_was_processed = Some(core.state);
    });
}

pub(crate) fn header_url(response_headers: &HeaderMap, name: HeaderName) -> Result<Option<Url>> {
    let Some(value) = response_headers.get(&name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|raw| Url::parse(raw).ok())
        .map(Some)
        .ok_or_else(|| {
            ClientError::invalid_operation(format!(
                "the '{}' header must be an absolute URI, got {:?}",
                name, value
            ))
        })
}

fn apply_entity(
    pipeline: &Pipeline,
    entity_ref: &EntityRef,
    response_headers: &HeaderMap,
    body: &Bytes,
) -> Result<()> {
    let tracker = &pipeline.tracker;
    let (handle, state, related_end, stream_pending) = {
        let entity = entity_ref.read();
        (
            entity.handle(),
            entity.state(),
            entity.related_end(),
            entity.has_pending_save_stream(),
        )
    };

    match state {
        EntityStates::Added | EntityStates::Modified => {
            let location = header_url(response_headers, headers::LOCATION)?;
            let entity_id = header_url(response_headers, headers::ODATA_ENTITY_ID)?;
            if state == EntityStates::Added {
                match (entity_id.or_else(|| location.clone()), location) {
                    (Some(identity), Some(edit_link)) => {
                        tracker.attach_location(handle, identity, edit_link)?
                    }
                    (Some(identity), None) => {
                        tracker.attach_location(handle, identity.clone(), identity)?
                    }
                    _ if body.is_empty() => {
                        return Err(ClientError::invalid_operation(
                            "an insert response must carry a Location header or an entry",
                        ))
                    }
                    _ => {}
                }
            }
            if let Some(etag) = header_str(response_headers, headers::ETAG) {
                entity_ref.write().stage_transient(TransientEntityDescriptor {
                    etag: Some(etag.to_string()),
                    ..TransientEntityDescriptor::default()
                });
            }

            let merge_option = if stream_pending {
                MergeOption::PreserveChanges
            } else {
                MergeOption::OverwriteChanges
            };
            if body.is_empty() {
                let mut entity = entity_ref.write();
                entity.merge_transient(merge_option);
                entity.set_state(EntityStates::Unchanged);
                entity.properties_to_serialize.clear();
            } else {
                materialize_into(pipeline, entity_ref, body, merge_option)?;
            }
        }
        EntityStates::Deleted => {
            tracker.detach_resource(entity_ref)?;
        }
        other => {
            return Err(ClientError::Internal(format!(
                "a response arrived for an entity in state {:?}",
                other
            )))
        }
    }

    entity_ref.write().core_mut().save_result_was_processed = Some(state);
    if let Some(key) = related_end {
        if let Some(link) = tracker.try_get_link_descriptor(key.source, &key.source_property, key.target) {
            link.write().core_mut().save_result_was_processed = Some(state);
        }
    }
    debug!("applied {:?} response to entity {}", state, handle);
    Ok(())
}

/// Merge the entry in `body` into the tracked entity and install its identity.
pub fn materialize_into(
    pipeline: &Pipeline,
    entity_ref: &EntityRef,
    body: &Bytes,
    merge_option: MergeOption,
) -> Result<()> {
    let entry = pipeline
        .materializer
        .read_entry(body, &pipeline.settings.service_root)?;
    let (handle, type_name, identity) = {
        let entity = entity_ref.read();
        (
            entity.handle(),
            entity.entity().type_name.clone(),
            entity.identity().cloned(),
        )
    };
    let mut from_response = EntityDescriptor::from_entry(handle, &type_name, &entry);
    if from_response.identity().is_none() {
        from_response.set_identity(identity);
    }
    if from_response.identity().is_none() {
        return Err(ClientError::invalid_operation(
            "the response entry carries no identity and no Location header was sent",
        ));
    }
    entity_ref
        .write()
        .merge_properties(&entry.properties, merge_option == MergeOption::OverwriteChanges);
    pipeline.tracker.attach_identity(&from_response, merge_option)?;
    Ok(())
}

fn apply_link(pipeline: &Pipeline, link_ref: &LinkRef) -> Result<()> {
    let (state, has_target) = {
        let link = link_ref.read();
        (link.state(), link.target().is_some())
    };
    match state {
        EntityStates::Added => link_ref.write().set_state(EntityStates::Unchanged),
        EntityStates::Modified if has_target => link_ref.write().set_state(EntityStates::Unchanged),
        EntityStates::Modified | EntityStates::Deleted => {
            pipeline.tracker.detach_existing_link(link_ref, false)?;
        }
        other => {
            return Err(ClientError::Internal(format!(
                "a response arrived for a link in state {:?}",
                other
            )))
        }
    }
    link_ref.write().core_mut().save_result_was_processed = Some(state);
    Ok(())
}

fn apply_named_stream(stream_ref: &StreamRef, response_headers: &HeaderMap) {
    let mut stream = stream_ref.write();
    if let Some(etag) = header_str(response_headers, headers::ETAG) {
        stream.etag = Some(etag.to_string());
    }
    let state = stream.state();
    stream.save_stream = None;
    stream.set_state(EntityStates::Unchanged);
    stream.core_mut().save_result_was_processed = Some(state);
}
