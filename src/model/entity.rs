use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use url::Url;

use crate::model::common::{EntityHandle, EntityStates, MergeOption, StreamStates};
use crate::model::descriptor::{DescriptorCore, HasCore, StreamRef};
use crate::model::link::LinkKey;
use crate::model::response::MaterializedEntry;
use crate::model::stream::{StreamDescriptor, TransientStreamInfo};

/// Client-side value of an entity: its type and a property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEntity {
    pub type_name: String,
    pub properties: Map<String, Value>,
}

impl ClientEntity {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            properties: Map::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

/// Response metadata staged for an entity until its response is fully applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransientEntityDescriptor {
    pub etag: Option<String>,
    pub edit_link: Option<Url>,
    pub self_link: Option<Url>,
    pub server_type_name: Option<String>,
    pub stream: Option<TransientStreamInfo>,
}

/// Tracked state of one entity.
#[derive(Debug)]
pub struct EntityDescriptor {
    core: DescriptorCore,
    handle: EntityHandle,
    entity: ClientEntity,
    entity_set: Option<String>,
    identity: Option<Url>,
    pub edit_link: Option<Url>,
    pub self_link: Option<Url>,
    pub etag: Option<String>,
    pub server_type_name: Option<String>,
    parent_for_insert: Option<(EntityHandle, String)>,
    parent_for_update: Option<(EntityHandle, String)>,
    default_stream: Option<StreamDescriptor>,
    pub stream_state: StreamStates,
    pub(crate) named_streams: HashMap<String, StreamRef>,
    transient: Option<TransientEntityDescriptor>,
    pub properties_to_serialize: BTreeSet<String>,
}

impl EntityDescriptor {
    pub fn new(
        handle: EntityHandle,
        entity: ClientEntity,
        entity_set: Option<String>,
        state: EntityStates,
    ) -> Self {
        Self {
            core: DescriptorCore::new(state),
            handle,
            entity,
            entity_set,
            identity: None,
            edit_link: None,
            self_link: None,
            etag: None,
            server_type_name: None,
            parent_for_insert: None,
            parent_for_update: None,
            default_stream: None,
            stream_state: StreamStates::NoStream,
            named_streams: HashMap::new(),
            transient: None,
            properties_to_serialize: BTreeSet::new(),
        }
    }

    /// Build the descriptor a response or query payload describes. The
    /// server's type name is kept in `server_type_name`.
    pub fn from_entry(handle: EntityHandle, type_name: &str, entry: &MaterializedEntry) -> Self {
        let entity = ClientEntity {
            type_name: type_name.to_string(),
            properties: entry.properties.clone(),
        };
        let mut descriptor = Self::new(handle, entity, None, EntityStates::Unchanged);
        descriptor.identity = entry.identity.clone().or_else(|| entry.edit_link.clone());
        descriptor.edit_link = entry.edit_link.clone();
        descriptor.self_link = entry.read_link.clone();
        descriptor.etag = entry.etag.clone();
        descriptor.server_type_name = entry.type_name.clone();
        if entry.media_read_link.is_some() || entry.media_edit_link.is_some() {
            let stream = descriptor.default_stream_mut();
            stream.self_link = entry.media_read_link.clone();
            stream.edit_link = entry.media_edit_link.clone();
            stream.etag = entry.media_etag.clone();
            stream.content_type = entry.media_content_type.clone();
        }
        descriptor
    }

    pub fn handle(&self) -> EntityHandle {
        self.handle
    }

    pub fn entity(&self) -> &ClientEntity {
        &self.entity
    }

    pub fn entity_set(&self) -> Option<&str> {
        self.entity_set.as_deref()
    }

    pub fn set_entity_set(&mut self, entity_set: Option<String>) {
        self.entity_set = entity_set;
    }

    /// Change one property and remember it for a partial update.
    pub fn set_property(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.entity.properties.insert(name.clone(), value);
        self.properties_to_serialize.insert(name);
    }

    /// Merge property values read from the service. Without `overwrite`
    /// only properties the client does not know yet are taken.
    pub fn merge_properties(&mut self, properties: &Map<String, Value>, overwrite: bool) {
        for (name, value) in properties {
            if overwrite || !self.entity.properties.contains_key(name) {
                self.entity.properties.insert(name.clone(), value.clone());
            }
        }
    }

    pub fn identity(&self) -> Option<&Url> {
        self.identity.as_ref()
    }

    /// Setting the identity ends the insert-time parent linkage.
    pub fn set_identity(&mut self, identity: Option<Url>) {
        self.identity = identity;
        self.parent_for_insert = None;
    }

    pub fn parent_for_insert(&self) -> Option<(EntityHandle, &str)> {
        self.parent_for_insert
            .as_ref()
            .map(|(handle, property)| (*handle, property.as_str()))
    }

    pub fn set_parent_for_insert(&mut self, parent: EntityHandle, property: impl Into<String>) {
        self.parent_for_insert = Some((parent, property.into()));
        self.parent_for_update = None;
    }

    pub fn parent_for_update(&self) -> Option<(EntityHandle, &str)> {
        self.parent_for_update
            .as_ref()
            .map(|(handle, property)| (*handle, property.as_str()))
    }

    pub fn set_parent_for_update(&mut self, parent: EntityHandle, property: impl Into<String>) {
        self.parent_for_update = Some((parent, property.into()));
        self.parent_for_insert = None;
    }

    pub fn is_deep_insert(&self) -> bool {
        self.parent_for_insert.is_some()
    }

    /// The link created when this entity was added through its parent.
    pub fn related_end(&self) -> Option<LinkKey> {
        self.parent_for_insert
            .as_ref()
            .map(|(parent, property)| LinkKey::new(*parent, property.clone(), Some(self.handle)))
    }

    /// URI addressing this entity on the service, if it was saved.
    pub fn resource_uri(&self) -> Option<&Url> {
        self.edit_link.as_ref().or(self.identity.as_ref())
    }

    pub fn default_stream(&self) -> Option<&StreamDescriptor> {
        self.default_stream.as_ref()
    }

    pub fn default_stream_mut(&mut self) -> &mut StreamDescriptor {
        let handle = self.handle;
        self.default_stream
            .get_or_insert_with(|| StreamDescriptor::new_default(handle))
    }

    pub fn read_stream_uri(&self) -> Option<&Url> {
        self.default_stream.as_ref().and_then(|s| s.self_link.as_ref())
    }

    pub fn set_read_stream_uri(&mut self, uri: Url) {
        self.default_stream_mut().self_link = Some(uri);
    }

    pub fn edit_stream_uri(&self) -> Option<&Url> {
        self.default_stream.as_ref().and_then(|s| s.edit_link.as_ref())
    }

    /// Entities with a default stream are media link entries.
    pub fn is_media_link_entry(&self) -> bool {
        self.default_stream.is_some()
    }

    pub fn has_pending_save_stream(&self) -> bool {
        self.default_stream
            .as_ref()
            .map(|s| s.save_stream.is_some())
            .unwrap_or(false)
    }

    pub fn named_stream(&self, name: &str) -> Option<StreamRef> {
        self.named_streams.get(name).cloned()
    }

    pub fn named_streams(&self) -> impl Iterator<Item = &StreamRef> {
        self.named_streams.values()
    }

    pub fn transient(&self) -> Option<&TransientEntityDescriptor> {
        self.transient.as_ref()
    }

    pub fn stage_transient(&mut self, staged: TransientEntityDescriptor) {
        let current = self
            .transient
            .get_or_insert_with(TransientEntityDescriptor::default);
        if staged.etag.is_some() {
            current.etag = staged.etag;
        }
        if staged.edit_link.is_some() {
            current.edit_link = staged.edit_link;
        }
        if staged.self_link.is_some() {
            current.self_link = staged.self_link;
        }
        if staged.server_type_name.is_some() {
            current.server_type_name = staged.server_type_name;
        }
        if staged.stream.is_some() {
            current.stream = staged.stream;
        }
    }

    /// Fold staged response metadata into the descriptor and clear it.
    pub fn merge_transient(&mut self, merge_option: MergeOption) {
        let Some(staged) = self.transient.take() else {
            return;
        };
        if staged.etag.is_some() && (merge_option != MergeOption::AppendOnly || self.etag.is_none()) {
            self.etag = staged.etag;
        }
        if staged.edit_link.is_some() {
            self.edit_link = staged.edit_link;
        }
        if staged.self_link.is_some() {
            self.self_link = staged.self_link;
        }
        if staged.server_type_name.is_some() {
            self.server_type_name = staged.server_type_name;
        }
        if let Some(stream) = staged.stream {
            self.default_stream_mut().merge_info(stream, merge_option);
        }
    }

    /// Merge metadata of a descriptor built from a response payload.
    pub fn merge_info(&mut self, from: &EntityDescriptor, merge_option: MergeOption) {
        if from.etag.is_some() && merge_option != MergeOption::AppendOnly {
            self.etag = from.etag.clone();
        }
        if from.edit_link.is_some() {
            self.edit_link = from.edit_link.clone();
        }
        if from.self_link.is_some() {
            self.self_link = from.self_link.clone();
        }
        if from.server_type_name.is_some() {
            self.server_type_name = from.server_type_name.clone();
        }
        if let Some(stream) = from.default_stream.as_ref() {
            let info = TransientStreamInfo {
                edit_link: stream.edit_link.clone(),
                self_link: stream.self_link.clone(),
                content_type: stream.content_type.clone(),
                etag: stream.etag.clone(),
            };
            self.default_stream_mut().merge_info(info, merge_option);
        }
    }
}

impl HasCore for EntityDescriptor {
    fn core(&self) -> &DescriptorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DescriptorCore {
        &mut self.core
    }
}
