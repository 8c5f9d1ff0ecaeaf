//! Turns pending descriptors into HTTP operations.
//!
//! Inside a batch an entity that has not been saved yet is addressed as
//! `$<change order>`, which is also the Content-ID of its insert.

use http::{HeaderValue, Method};

use crate::error::{ClientError, Result};
use crate::logic::pipeline::{OperationRequest, Pipeline};
use crate::model::request::{headers, JSON_CONTENT_TYPE};
use crate::model::{
    Descriptor, EntityDescriptor, EntityHandle, EntityRef, EntityStates, HasCore,
    LinkRef, SaveChangesOptions, StreamRef,
};
use crate::store::EntityTracker;
use crate::wire::json;

/// Address of a tracked entity for use in another request.
pub fn entity_address(tracker: &EntityTracker, handle: EntityHandle, in_batch: bool) -> Result<String> {
    let entity = tracker.get_entity_descriptor(handle)?;
    let entity = entity.read();
    if let Some(uri) = entity.resource_uri() {
        return Ok(uri.to_string());
    }
    if in_batch && entity.state() == EntityStates::Added {
        return Ok(format!("${}", entity.core().change_order));
    }
    Err(ClientError::invalid_operation(format!(
        "the entity {} has not been saved and cannot be addressed",
        handle
    )))
}

/// Whether an Added entity is inserted as a media resource.
pub fn is_media_insert(pipeline: &Pipeline, entity: &EntityDescriptor) -> bool {
    let has_stream = pipeline
        .tracker
        .model()
        .try_get(&entity.entity().type_name)
        .map(|info| info.has_stream)
        .unwrap_or(false);
    has_stream || entity.is_media_link_entry()
}

/// Reject operations a changeset cannot carry.
pub fn validate_for_batch(pipeline: &Pipeline, entry: &Descriptor) -> Result<()> {
    match entry {
        Descriptor::Entity(entity) => {
            let entity = entity.read();
            match entity.state() {
                EntityStates::Added if is_media_insert(pipeline, &entity) => Err(ClientError::not_supported(
                    "inserting a media link entry is not supported in a batch",
                )),
                EntityStates::Unchanged | EntityStates::Modified if entity.has_pending_save_stream() => {
                    Err(ClientError::not_supported(
                        "updating a media resource is not supported in a batch",
                    ))
                }
                _ => Ok(()),
            }
        }
        Descriptor::NamedStream(_) => Err(ClientError::not_supported(
            "saving a named stream is not supported in a batch",
        )),
        Descriptor::Link(_) => Ok(()),
    }
}

/// Insert, update or delete of an entity.
pub fn entity_request(
    pipeline: &Pipeline,
    entity_ref: &EntityRef,
    options: &SaveChangesOptions,
    in_batch: bool,
) -> Result<OperationRequest> {
    let tracker = &pipeline.tracker;
    let entity = entity_ref.read();
    let descriptor = Some(Descriptor::Entity(entity_ref.clone()));
    let namespace = pipeline.settings.type_namespace.as_deref();

    let mut request = match entity.state() {
        EntityStates::Added => {
            let uri = insert_address(pipeline, &entity, in_batch)?;
            let mut request = OperationRequest::new(Method::POST, uri, descriptor);
            let only = (options.post_only_set_properties && !entity.properties_to_serialize.is_empty())
                .then_some(&entity.properties_to_serialize);
            request.body = Some(json::write_entry(entity.entity(), namespace, only)?);
            request
        }
        EntityStates::Modified => {
            let uri = update_address(tracker, &entity, in_batch)?;
            let method = if options.replace_on_update {
                Method::PUT
            } else {
                Method::PATCH
            };
            let only = (method == Method::PATCH && !entity.properties_to_serialize.is_empty())
                .then_some(&entity.properties_to_serialize);
            let mut request = OperationRequest::new(method, uri, descriptor);
            request.body = Some(json::write_entry(entity.entity(), namespace, only)?);
            if let Some(etag) = &entity.etag {
                request.headers.insert(headers::IF_MATCH, HeaderValue::from_str(etag)?);
            }
            request
        }
        EntityStates::Deleted => {
            let uri = entity
                .resource_uri()
                .map(|u| u.to_string())
                .ok_or_else(|| ClientError::invalid_operation("the entity to delete has no address"))?;
            let mut request = OperationRequest::new(Method::DELETE, uri, descriptor);
            if let Some(etag) = &entity.etag {
                request.headers.insert(headers::IF_MATCH, HeaderValue::from_str(etag)?);
            }
            request
        }
        state => {
            return Err(ClientError::Internal(format!(
                "no request exists for an entity in state {:?}",
                state
            )))
        }
    };

    if request.body.is_some() {
        request
            .headers
            .insert(headers::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        if let Some(prefer) = pipeline.settings.response_preference.header_value() {
            request.headers.insert(headers::PREFER, HeaderValue::from_static(prefer));
        }
    }
    Ok(request)
}

fn insert_address(pipeline: &Pipeline, entity: &EntityDescriptor, in_batch: bool) -> Result<String> {
    if let Some((parent, property)) = entity.parent_for_insert() {
        let parent = entity_address(&pipeline.tracker, parent, in_batch)?;
        return Ok(format!("{}/{}", parent, property));
    }
    let entity_set = entity
        .entity_set()
        .map(str::to_string)
        .or_else(|| {
            pipeline
                .tracker
                .model()
                .try_get(&entity.entity().type_name)
                .and_then(|info| info.entity_set.clone())
        })
        .ok_or_else(|| {
            ClientError::invalid_operation(format!(
                "no entity set is known for type '{}'",
                entity.entity().type_name
            ))
        })?;
    Ok(pipeline.resolve(&entity_set)?.to_string())
}

fn update_address(tracker: &EntityTracker, entity: &EntityDescriptor, in_batch: bool) -> Result<String> {
    if let Some(uri) = entity.resource_uri() {
        return Ok(uri.to_string());
    }
    match entity.parent_for_update() {
        Some((parent, property)) => Ok(format!(
            "{}/{}",
            entity_address(tracker, parent, in_batch)?,
            property
        )),
        None => Err(ClientError::invalid_operation(
            "the entity to update has no address",
        )),
    }
}

/// `$ref` request adding, setting or removing a link.
pub fn link_request(pipeline: &Pipeline, link_ref: &LinkRef, in_batch: bool) -> Result<OperationRequest> {
    let tracker = &pipeline.tracker;
    let (source, property, target, state) = {
        let link = link_ref.read();
        (link.source(), link.source_property().to_string(), link.target(), link.state())
    };
    let descriptor = Some(Descriptor::Link(link_ref.clone()));
    let source_uri = entity_address(tracker, source, in_batch)?;
    let reference_uri = format!("{}/{}/$ref", source_uri, property);
    let target_uri = target
        .map(|t| entity_address(tracker, t, in_batch))
        .transpose()?;

    let mut request = match (state, target_uri) {
        (EntityStates::Added, Some(target)) => {
            let mut request = OperationRequest::new(Method::POST, reference_uri, descriptor);
            request.body = Some(json::write_entity_reference(&target)?);
            request
        }
        (EntityStates::Modified, Some(target)) => {
            let mut request = OperationRequest::new(Method::PUT, reference_uri, descriptor);
            request.body = Some(json::write_entity_reference(&target)?);
            request
        }
        (EntityStates::Modified, None) => OperationRequest::new(Method::DELETE, reference_uri, descriptor),
        (EntityStates::Deleted, target) => {
            let source_type = tracker
                .get_entity_descriptor(source)?
                .read()
                .entity()
                .type_name
                .clone();
            let uri = match target {
                Some(target) if tracker.model().is_collection(&source_type, &property)? => {
                    format!("{}?$id={}", reference_uri, target)
                }
                _ => reference_uri,
            };
            OperationRequest::new(Method::DELETE, uri, descriptor)
        }
        (state, _) => {
            return Err(ClientError::Internal(format!(
                "no request exists for a link in state {:?}",
                state
            )))
        }
    };
    if request.body.is_some() {
        request
            .headers
            .insert(headers::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    }
    Ok(request)
}

/// Media POST creating a media link entry; the body is the save stream.
pub fn media_insert_request(pipeline: &Pipeline, entity_ref: &EntityRef) -> Result<OperationRequest> {
    let (uri, save_stream) = {
        let mut entity = entity_ref.write();
        let uri = insert_address(pipeline, &entity, false)?;
        let save_stream = entity.default_stream_mut().save_stream.take().ok_or_else(|| {
            ClientError::invalid_operation(
                "a media link entry cannot be inserted without a save stream",
            )
        })?;
        (uri, save_stream)
    };
    let mut request = OperationRequest::new(Method::POST, uri, Some(Descriptor::Entity(entity_ref.clone())));
    stream_body(pipeline, &mut request, save_stream)?;
    Ok(request)
}

/// Media PUT replacing the media resource of a saved entity.
pub fn media_update_request(pipeline: &Pipeline, entity_ref: &EntityRef) -> Result<OperationRequest> {
    let (uri, etag, save_stream) = {
        let mut entity = entity_ref.write();
        let uri = match entity.edit_stream_uri() {
            Some(uri) => uri.to_string(),
            None => entity
                .resource_uri()
                .map(|u| format!("{}/$value", u))
                .ok_or_else(|| ClientError::invalid_operation("the entity has no media edit link"))?,
        };
        let stream = entity.default_stream_mut();
        let etag = stream.etag.clone();
        let save_stream = stream
            .save_stream
            .take()
            .ok_or_else(|| ClientError::Internal("no save stream is pending".to_string()))?;
        (uri, etag, save_stream)
    };
    let mut request = OperationRequest::new(Method::PUT, uri, Some(Descriptor::Entity(entity_ref.clone())));
    if let Some(etag) = etag {
        request.headers.insert(headers::IF_MATCH, HeaderValue::from_str(&etag)?);
    }
    stream_body(pipeline, &mut request, save_stream)?;
    Ok(request)
}

/// PUT of a named stream to its edit link.
pub fn named_stream_request(pipeline: &Pipeline, stream_ref: &StreamRef) -> Result<OperationRequest> {
    let (entity, name, edit_link, etag, save_stream) = {
        let mut stream = stream_ref.write();
        let save_stream = stream.save_stream.take().ok_or_else(|| {
            ClientError::invalid_operation("the named stream has no save stream")
        })?;
        (
            stream.entity(),
            stream.name().unwrap_or_default().to_string(),
            stream.edit_link.clone(),
            stream.etag.clone(),
            save_stream,
        )
    };
    let uri = match edit_link {
        Some(uri) => uri.to_string(),
        None => format!("{}/{}", entity_address(&pipeline.tracker, entity, false)?, name),
    };
    let mut request = OperationRequest::new(Method::PUT, uri, Some(Descriptor::NamedStream(stream_ref.clone())));
    if let Some(etag) = etag {
        request.headers.insert(headers::IF_MATCH, HeaderValue::from_str(&etag)?);
    }
    stream_body(pipeline, &mut request, save_stream)?;
    Ok(request)
}

fn stream_body(
    pipeline: &Pipeline,
    request: &mut OperationRequest,
    mut save_stream: crate::model::DataServiceSaveStream,
) -> Result<()> {
    let content_type = save_stream.args.content_type.clone().ok_or_else(|| {
        ClientError::Argument("a save stream requires a content type".to_string())
    })?;
    request.headers.extend(std::mem::take(&mut save_stream.args.headers));
    request
        .headers
        .insert(headers::CONTENT_TYPE, HeaderValue::from_str(&content_type)?);
    if let Some(slug) = &save_stream.args.slug {
        request.headers.insert(headers::SLUG, HeaderValue::from_str(slug)?);
    }
    request.body = Some(pipeline.buffers.read_to_bytes(save_stream.stream.as_mut())?);
    Ok(())
}
