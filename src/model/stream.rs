use http::HeaderMap;
use std::fmt;
use std::io::Read;
use url::Url;

use crate::model::common::{EntityHandle, EntityStates, MergeOption};
use crate::model::descriptor::{DescriptorCore, HasCore};

/// Headers sent along with a media resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataServiceRequestArgs {
    pub content_type: Option<String>,
    pub slug: Option<String>,
    pub headers: HeaderMap,
}

impl DataServiceRequestArgs {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Self::default()
        }
    }
}

/// Stream handed to the context to be uploaded on the next save.
pub struct DataServiceSaveStream {
    pub stream: Box<dyn Read + Send + Sync>,
    pub args: DataServiceRequestArgs,
}

impl DataServiceSaveStream {
    pub fn new(stream: Box<dyn Read + Send + Sync>, args: DataServiceRequestArgs) -> Self {
        Self { stream, args }
    }

    pub fn from_bytes(bytes: Vec<u8>, args: DataServiceRequestArgs) -> Self {
        Self::new(Box::new(std::io::Cursor::new(bytes)), args)
    }
}

impl fmt::Debug for DataServiceSaveStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataServiceSaveStream")
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Stream metadata read from a response and not merged yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransientStreamInfo {
    pub edit_link: Option<Url>,
    pub self_link: Option<Url>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
}

/// Default (media resource) or named stream of an entity.
#[derive(Debug)]
pub struct StreamDescriptor {
    core: DescriptorCore,
    entity: EntityHandle,
    name: Option<String>,
    pub edit_link: Option<Url>,
    pub self_link: Option<Url>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub save_stream: Option<DataServiceSaveStream>,
    transient: Option<TransientStreamInfo>,
}

impl StreamDescriptor {
    pub fn new_default(entity: EntityHandle) -> Self {
        Self::new(entity, None)
    }

    pub fn new_named(entity: EntityHandle, name: impl Into<String>) -> Self {
        Self::new(entity, Some(name.into()))
    }

    fn new(entity: EntityHandle, name: Option<String>) -> Self {
        Self {
            core: DescriptorCore::new(EntityStates::Unchanged),
            entity,
            name,
            edit_link: None,
            self_link: None,
            content_type: None,
            etag: None,
            save_stream: None,
            transient: None,
        }
    }

    pub fn entity(&self) -> EntityHandle {
        self.entity
    }

    /// `None` for the default stream.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn stage_transient(&mut self, info: TransientStreamInfo) {
        let staged = self.transient.get_or_insert_with(TransientStreamInfo::default);
        if info.edit_link.is_some() {
            staged.edit_link = info.edit_link;
        }
        if info.self_link.is_some() {
            staged.self_link = info.self_link;
        }
        if info.content_type.is_some() {
            staged.content_type = info.content_type;
        }
        if info.etag.is_some() {
            staged.etag = info.etag;
        }
    }

    /// Fold staged response metadata into the descriptor. AppendOnly keeps a
    /// known etag.
    pub fn merge_transient(&mut self, merge_option: MergeOption) {
        let Some(info) = self.transient.take() else {
            return;
        };
        self.merge_info(info, merge_option);
    }

    pub fn merge_info(&mut self, info: TransientStreamInfo, merge_option: MergeOption) {
        if info.edit_link.is_some() {
            self.edit_link = info.edit_link;
        }
        if info.self_link.is_some() {
            self.self_link = info.self_link;
        }
        if info.content_type.is_some() {
            self.content_type = info.content_type;
        }
        if info.etag.is_some() && (merge_option != MergeOption::AppendOnly || self.etag.is_none()) {
            self.etag = info.etag;
        }
    }

    pub fn has_transient(&self) -> bool {
        self.transient.is_some()
    }
}

impl HasCore for StreamDescriptor {
    fn core(&self) -> &DescriptorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DescriptorCore {
        &mut self.core
    }
}
