use log::{debug, info};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::logic::{
    query, BatchResponseIter, BatchSaveResult, BufferPool, ContextSettings, Pipeline, SaveProgress,
    SaveResult,
};
use crate::model::{
    ClientEntity, ClientModel, ContextEvents, DataServiceRequest, DataServiceResponse, DataServiceSaveStream,
    EntityDescriptor, EntityHandle, EntityRef, EntityStates, HasCore, LinkDescriptor, LinkKey,
    LinkRef, MergeOption, QueryOperationResponse, RequestEventArgs, ResponseEventArgs,
    ResponsePreference, SaveChangesOptions, SaveState, StreamDescriptor, StreamStates,
};
use crate::store::EntityTracker;
use crate::transport::{HttpTransport, Transport};
use crate::wire::{JsonMaterializer, ResponseMaterializer};

/// Caller-facing client: tracks changes to entities and links, and runs
/// saves, queries and batches against one service.
pub struct DataServiceContext {
    tracker: Arc<EntityTracker>,
    transport: Arc<dyn Transport>,
    materializer: Arc<dyn ResponseMaterializer>,
    events: Arc<ContextEvents>,
    buffers: Arc<BufferPool>,
    progress: Arc<SaveProgress>,
    settings: RwLock<ContextSettings>,
    save_options: SaveChangesOptions,
}

impl std::fmt::Debug for DataServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataServiceContext")
            .field("settings", &*self.settings.read())
            .field("save_options", &self.save_options)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl DataServiceContext {
    pub fn new(service_root: Url, model: ClientModel, transport: Arc<dyn Transport>) -> Self {
        Self {
            tracker: Arc::new(EntityTracker::new(Arc::new(model))),
            transport,
            materializer: Arc::new(JsonMaterializer),
            events: Arc::new(ContextEvents::default()),
            buffers: Arc::new(BufferPool::default()),
            progress: Arc::new(SaveProgress::default()),
            settings: RwLock::new(ContextSettings::new(service_root)),
            save_options: SaveChangesOptions::default(),
        }
    }

    /// Build a context over HTTP from loaded configuration.
    pub fn from_config(config: &ClientConfig, model: ClientModel) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(&config.http)?;
        let mut context = Self::new(config.service_root()?, model, Arc::new(transport));
        context.buffers = Arc::new(BufferPool::new(config.http.buffer_size));
        context.save_options = config.save;
        {
            let mut settings = context.settings.write();
            settings.type_namespace = config.service.type_namespace.clone();
            settings.response_preference = config.service.response_preference;
            settings.merge_option = config.query.merge_option;
            settings.ignore_resource_not_found = config.query.ignore_resource_not_found;
        }
        Ok(context)
    }

    pub fn with_materializer(mut self, materializer: Arc<dyn ResponseMaterializer>) -> Self {
        self.materializer = materializer;
        self
    }

    // ── Settings ────────────────────────────────────────────────────────

    pub fn service_root(&self) -> Url {
        self.settings.read().service_root.clone()
    }

    pub fn merge_option(&self) -> MergeOption {
        self.settings.read().merge_option
    }

    pub fn set_merge_option(&self, merge_option: MergeOption) {
        self.settings.write().merge_option = merge_option;
    }

    pub fn set_ignore_resource_not_found(&self, ignore: bool) {
        self.settings.write().ignore_resource_not_found = ignore;
    }

    pub fn set_response_preference(&self, preference: ResponsePreference) {
        self.settings.write().response_preference = preference;
    }

    pub fn set_type_namespace(&self, namespace: Option<String>) {
        self.settings.write().type_namespace = namespace;
    }

    pub fn save_options(&self) -> SaveChangesOptions {
        self.save_options
    }

    pub fn set_save_options(&mut self, options: SaveChangesOptions) {
        self.save_options = options;
    }

    /// State of the most recent save or batch.
    pub fn save_state(&self) -> SaveState {
        self.progress.get()
    }

    pub fn tracker(&self) -> &EntityTracker {
        &self.tracker
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline {
            tracker: self.tracker.clone(),
            transport: self.transport.clone(),
            materializer: self.materializer.clone(),
            events: self.events.clone(),
            buffers: self.buffers.clone(),
            progress: self.progress.clone(),
            settings: self.settings.read().clone(),
        }
    }

    // ── Extension points ────────────────────────────────────────────────

    pub fn on_building_request(&self, handler: impl Fn(&mut RequestEventArgs) + Send + Sync + 'static) {
        self.events.on_building_request(Arc::new(handler));
    }

    pub fn on_sending_request(&self, handler: impl Fn(&mut RequestEventArgs) + Send + Sync + 'static) {
        self.events.on_sending_request(Arc::new(handler));
    }

    pub fn on_receiving_response(&self, handler: impl Fn(&ResponseEventArgs) + Send + Sync + 'static) {
        self.events.on_receiving_response(Arc::new(handler));
    }

    // ── Entities ────────────────────────────────────────────────────────

    /// Track `entity` as a new member of `entity_set`.
    pub fn add_object(&self, entity_set: &str, entity: ClientEntity) -> Result<EntityHandle> {
        validate_entity_set(entity_set)?;
        self.tracker.model().get(&entity.type_name)?;

        let handle = self.tracker.next_handle();
        let mut descriptor = EntityDescriptor::new(handle, entity, Some(entity_set.to_string()), EntityStates::Added);
        descriptor.properties_to_serialize = descriptor.entity().properties.keys().cloned().collect();
        self.tracker.increment_change(&mut descriptor);
        self.tracker.add_entity_descriptor(descriptor)?;
        debug!("added entity {} to {}", handle, entity_set);
        Ok(handle)
    }

    /// Track `entity` as a new member of the collection `source_property` of
    /// `source`; it is inserted through the parent.
    pub fn add_related_object(
        &self,
        source: EntityHandle,
        source_property: &str,
        entity: ClientEntity,
    ) -> Result<EntityHandle> {
        let source_ref = self.tracker.get_entity_descriptor(source)?;
        let source_type = {
            let source = source_ref.read();
            if source.state() == EntityStates::Deleted {
                return Err(ClientError::invalid_operation(
                    "an entity cannot be added through a deleted parent",
                ));
            }
            source.entity().type_name.clone()
        };
        if !self.tracker.model().is_collection(&source_type, source_property)? {
            return Err(ClientError::invalid_operation(format!(
                "'{}' is not a collection navigation property",
                source_property
            )));
        }
        self.tracker.model().get(&entity.type_name)?;

        let handle = self.tracker.next_handle();
        let mut descriptor = EntityDescriptor::new(handle, entity, None, EntityStates::Added);
        descriptor.set_parent_for_insert(source, source_property);
        descriptor.properties_to_serialize = descriptor.entity().properties.keys().cloned().collect();
        self.tracker.increment_change(&mut descriptor);
        self.tracker.add_entity_descriptor(descriptor)?;

        let mut link = LinkDescriptor::new(
            LinkKey::new(source, source_property, Some(handle)),
            EntityStates::Added,
        );
        self.tracker.increment_change(&mut link);
        self.tracker.add_link(link)?;
        Ok(handle)
    }

    /// Track an entity that already exists on the service. Its identity is
    /// derived from the entity set and the key properties of its type.
    pub fn attach_to(&self, entity_set: &str, entity: ClientEntity, etag: Option<String>) -> Result<EntityHandle> {
        validate_entity_set(entity_set)?;
        let identity = {
            let info = self.tracker.model().get(&entity.type_name)?;
            let key = key_segment(&info.key, &entity)?;
            self.pipeline().resolve(&format!("{}({})", entity_set, key))?
        };

        let handle = self.tracker.next_handle();
        let mut descriptor = EntityDescriptor::new(handle, entity, Some(entity_set.to_string()), EntityStates::Unchanged);
        descriptor.set_identity(Some(identity.clone()));
        descriptor.edit_link = Some(identity);
        descriptor.etag = etag;
        self.tracker.internal_attach_entity_descriptor(descriptor, true)?;
        Ok(handle)
    }

    /// Mark a tracked entity as modified.
    pub fn update_object(&self, handle: EntityHandle) -> Result<()> {
        let entity = self.tracker.get_entity_descriptor(handle)?;
        let mut entity = entity.write();
        match entity.state() {
            EntityStates::Unchanged => {
                entity.set_state(EntityStates::Modified);
                self.tracker.increment_change(&mut *entity);
                Ok(())
            }
            EntityStates::Deleted => Err(ClientError::invalid_operation(
                "a deleted entity cannot be updated",
            )),
            _ => Ok(()),
        }
    }

    /// Change one property; only changed properties go out in a PATCH.
    pub fn set_property(&self, handle: EntityHandle, name: &str, value: impl Into<Value>) -> Result<()> {
        let entity = self.tracker.get_entity_descriptor(handle)?;
        let mut entity = entity.write();
        match entity.state() {
            EntityStates::Deleted => {
                return Err(ClientError::invalid_operation(
                    "a deleted entity cannot be updated",
                ))
            }
            EntityStates::Unchanged => {
                entity.set_state(EntityStates::Modified);
                self.tracker.increment_change(&mut *entity);
            }
            _ => {}
        }
        entity.set_property(name, value.into());
        Ok(())
    }

    /// Mark an entity for deletion. An entity that was never saved is simply
    /// detached.
    pub fn delete_object(&self, handle: EntityHandle) -> Result<()> {
        let entity = self.tracker.get_entity_descriptor(handle)?;
        let state = entity.read().state();
        match state {
            EntityStates::Added => {
                self.tracker.detach_resource(&entity)?;
            }
            EntityStates::Unchanged | EntityStates::Modified => {
                let mut entity = entity.write();
                entity.set_state(EntityStates::Deleted);
                self.tracker.increment_change(&mut *entity);
            }
            _ => {}
        }
        Ok(())
    }

    /// Stop tracking an entity and its links. `false` if it was not tracked.
    pub fn detach(&self, handle: EntityHandle) -> Result<bool> {
        match self.tracker.try_get_entity_descriptor(handle) {
            Some(entity) => self.tracker.detach_resource(&entity),
            None => Ok(false),
        }
    }

    // ── Links ───────────────────────────────────────────────────────────

    /// Add `target` to the collection `source_property` of `source`.
    pub fn add_link(&self, source: EntityHandle, source_property: &str, target: EntityHandle) -> Result<()> {
        self.ensure_relatable(source, source_property, Some(target), true)?;
        if self.tracker.try_get_link_descriptor(source, source_property, Some(target)).is_some() {
            return Err(ClientError::invalid_operation(
                "the context is already tracking the relationship",
            ));
        }
        let mut link = LinkDescriptor::new(
            LinkKey::new(source, source_property, Some(target)),
            EntityStates::Added,
        );
        self.tracker.increment_change(&mut link);
        self.tracker.add_link(link)?;
        Ok(())
    }

    /// Point the reference `source_property` of `source` at `target`, or clear
    /// it with `None`.
    pub fn set_link(
        &self,
        source: EntityHandle,
        source_property: &str,
        target: Option<EntityHandle>,
    ) -> Result<()> {
        self.ensure_relatable(source, source_property, target, false)?;
        let link = match self
            .tracker
            .detach_reference_link(source, source_property, target, MergeOption::NoTracking)?
        {
            Some(link) => link,
            None => self.tracker.add_link(LinkDescriptor::new(
                LinkKey::new(source, source_property, target),
                EntityStates::Unchanged,
            ))?,
        };
        let mut link = link.write();
        if link.state() != EntityStates::Modified {
            link.set_state(EntityStates::Modified);
            self.tracker.increment_change(&mut *link);
        }
        Ok(())
    }

    /// Remove `target` from the collection `source_property` of `source`.
    pub fn delete_link(&self, source: EntityHandle, source_property: &str, target: EntityHandle) -> Result<()> {
        let (source_state, target_state) = self.ensure_linkable(source, Some(target))?;
        let existing = self.tracker.try_get_link_descriptor(source, source_property, Some(target));
        if let Some(existing) = &existing {
            if existing.read().state() == EntityStates::Added {
                return self.tracker.detach_existing_link(existing, false);
            }
        }
        if source_state == EntityStates::Added || target_state == Some(EntityStates::Added) {
            return Err(ClientError::invalid_operation(
                "no relationship can be deleted while one of its ends is still being inserted",
            ));
        }
        let existing = match existing {
            Some(existing) => existing,
            None => self.tracker.add_link(LinkDescriptor::new(
                LinkKey::new(source, source_property, Some(target)),
                EntityStates::Unchanged,
            ))?,
        };
        let mut link = existing.write();
        if link.state() != EntityStates::Deleted {
            link.set_state(EntityStates::Deleted);
            self.tracker.increment_change(&mut *link);
        }
        Ok(())
    }

    /// Track a link that already exists on the service.
    pub fn attach_link(
        &self,
        source: EntityHandle,
        source_property: &str,
        target: Option<EntityHandle>,
    ) -> Result<()> {
        self.ensure_linkable(source, target)?;
        self.tracker
            .attach_link(source, source_property, target, MergeOption::NoTracking)
    }

    /// Stop tracking a link. `false` if it was not tracked.
    pub fn detach_link(
        &self,
        source: EntityHandle,
        source_property: &str,
        target: Option<EntityHandle>,
    ) -> Result<bool> {
        match self.tracker.try_get_link_descriptor(source, source_property, target) {
            Some(link) => {
                self.tracker.detach_existing_link(&link, false)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn ensure_linkable(
        &self,
        source: EntityHandle,
        target: Option<EntityHandle>,
    ) -> Result<(EntityStates, Option<EntityStates>)> {
        let source_state = self.tracker.get_entity_descriptor(source)?.read().state();
        let target_state = target
            .map(|t| self.tracker.get_entity_descriptor(t).map(|e| e.read().state()))
            .transpose()?;
        if source_state == EntityStates::Deleted || target_state == Some(EntityStates::Deleted) {
            return Err(ClientError::invalid_operation(
                "a relationship cannot involve a deleted entity",
            ));
        }
        Ok((source_state, target_state))
    }

    fn ensure_relatable(
        &self,
        source: EntityHandle,
        source_property: &str,
        target: Option<EntityHandle>,
        collection: bool,
    ) -> Result<()> {
        self.ensure_linkable(source, target)?;
        let source_type = self
            .tracker
            .get_entity_descriptor(source)?
            .read()
            .entity()
            .type_name
            .clone();
        if self.tracker.model().is_collection(&source_type, source_property)? != collection {
            return Err(ClientError::invalid_operation(if collection {
                format!("'{}' is not a collection; use set_link", source_property)
            } else {
                format!("'{}' is a collection; use add_link", source_property)
            }));
        }
        Ok(())
    }

    // ── Streams ─────────────────────────────────────────────────────────

    /// Queue the media resource of an entity for upload on the next save.
    pub fn set_save_stream(&self, handle: EntityHandle, stream: DataServiceSaveStream) -> Result<()> {
        let entity = self.tracker.get_entity_descriptor(handle)?;
        let mut entity = entity.write();
        let state = entity.state();
        if state == EntityStates::Deleted {
            return Err(ClientError::invalid_operation(
                "a save stream cannot be set on a deleted entity",
            ));
        }
        entity.default_stream_mut().save_stream = Some(stream);
        entity.stream_state = if state == EntityStates::Added {
            StreamStates::Added
        } else {
            StreamStates::Modified
        };
        if state == EntityStates::Unchanged {
            self.tracker.increment_change(&mut *entity);
        }
        Ok(())
    }

    /// Queue a named stream of a saved entity for upload on the next save.
    pub fn set_named_save_stream(
        &self,
        handle: EntityHandle,
        name: &str,
        stream: DataServiceSaveStream,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(ClientError::Argument("a stream name is required".to_string()));
        }
        let entity = self.tracker.get_entity_descriptor(handle)?;
        let mut entity = entity.write();
        match entity.state() {
            EntityStates::Added => {
                return Err(ClientError::invalid_operation(
                    "a named stream can only be set on an entity that was saved",
                ))
            }
            EntityStates::Deleted => {
                return Err(ClientError::invalid_operation(
                    "a save stream cannot be set on a deleted entity",
                ))
            }
            _ => {}
        }
        let descriptor = entity
            .named_streams
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(StreamDescriptor::new_named(handle, name))))
            .clone();
        drop(entity);

        let mut descriptor = descriptor.write();
        descriptor.save_stream = Some(stream);
        if descriptor.state() != EntityStates::Modified {
            descriptor.set_state(EntityStates::Modified);
            self.tracker.increment_change(&mut *descriptor);
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn entity(&self, handle: EntityHandle) -> Option<ClientEntity> {
        self.tracker
            .try_get_entity_descriptor(handle)
            .map(|e| e.read().entity().clone())
    }

    pub fn entities(&self) -> Vec<EntityRef> {
        self.tracker.entities()
    }

    pub fn links(&self) -> Vec<LinkRef> {
        self.tracker.links()
    }

    pub fn entity_descriptor(&self, handle: EntityHandle) -> Option<EntityRef> {
        self.tracker.try_get_entity_descriptor(handle)
    }

    pub fn entity_by_identity(&self, identity: &Url) -> Option<EntityHandle> {
        self.tracker
            .try_get_entity_by_identity(identity)
            .map(|e| e.read().handle())
    }

    pub fn link_descriptor(
        &self,
        source: EntityHandle,
        source_property: &str,
        target: Option<EntityHandle>,
    ) -> Option<LinkRef> {
        self.tracker.try_get_link_descriptor(source, source_property, target)
    }

    // ── Saving ──────────────────────────────────────────────────────────

    /// Save every pending change with the context's save options.
    pub async fn save_changes(&self) -> Result<DataServiceResponse> {
        self.save_changes_with_cancel(self.save_options, &CancellationToken::new())
            .await
    }

    pub async fn save_changes_with(&self, options: SaveChangesOptions) -> Result<DataServiceResponse> {
        self.save_changes_with_cancel(options, &CancellationToken::new())
            .await
    }

    pub async fn save_changes_with_cancel(
        &self,
        options: SaveChangesOptions,
        cancel: &CancellationToken,
    ) -> Result<DataServiceResponse> {
        info!("saving changes ({:?})", options.mode);
        if options.is_batch() {
            BatchSaveResult::for_changes(self.pipeline(), options)?
                .execute(cancel)
                .await
        } else {
            SaveResult::new(self.pipeline(), options)?.execute(cancel).await
        }
    }

    /// Run a save to completion on a private current-thread runtime. Must not
    /// be called from inside a runtime.
    pub fn save_changes_blocking(&self, options: SaveChangesOptions) -> Result<DataServiceResponse> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ClientError::Internal(format!("failed to start a runtime: {}", e)))?;
        runtime.block_on(self.save_changes_with(options))
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub async fn execute(&self, query: &DataServiceRequest) -> Result<QueryOperationResponse> {
        self.execute_with_cancel(query, &CancellationToken::new()).await
    }

    pub async fn execute_with_cancel(
        &self,
        query: &DataServiceRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryOperationResponse> {
        query::execute(&self.pipeline(), query, cancel).await
    }

    /// Send several queries in one `$batch` and read every response.
    pub async fn execute_batch(&self, queries: Vec<DataServiceRequest>) -> Result<DataServiceResponse> {
        BatchSaveResult::for_queries(self.pipeline(), queries)
            .execute(&CancellationToken::new())
            .await
    }

    /// Send several queries in one `$batch`; responses are read and
    /// materialized as the iterator is advanced.
    pub async fn execute_batch_lazy(&self, queries: Vec<DataServiceRequest>) -> Result<BatchResponseIter> {
        BatchSaveResult::for_queries(self.pipeline(), queries)
            .execute_lazy(&CancellationToken::new())
            .await
    }
}

fn validate_entity_set(entity_set: &str) -> Result<()> {
    if entity_set.trim().is_empty() {
        return Err(ClientError::Argument("an entity set name is required".to_string()));
    }
    Ok(())
}

/// `1`, `'abc'` or `A=1,B='x'` for the key properties of `entity`.
fn key_segment(key: &[String], entity: &ClientEntity) -> Result<String> {
    if key.is_empty() {
        return Err(ClientError::Argument(format!(
            "the type '{}' has no key",
            entity.type_name
        )));
    }
    let values = key
        .iter()
        .map(|name| {
            let value = entity.get(name).ok_or_else(|| {
                ClientError::Argument(format!("the key property '{}' has no value", name))
            })?;
            key_literal(name, value)
        })
        .collect::<Result<Vec<_>>>()?;
    if values.len() == 1 {
        return Ok(values.into_iter().next().unwrap_or_default());
    }
    Ok(key
        .iter()
        .zip(values)
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(","))
}

fn key_literal(name: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(ClientError::Argument(format!(
            "the key property '{}' must be a string, number or boolean",
            name
        ))),
    }
}
