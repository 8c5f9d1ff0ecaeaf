use crate::model::common::{EntityHandle, EntityStates};
use crate::model::descriptor::{DescriptorCore, HasCore};

/// Identity of a link: two descriptors with the same triple are the same link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub source: EntityHandle,
    pub source_property: String,
    pub target: Option<EntityHandle>,
}

impl LinkKey {
    pub fn new(
        source: EntityHandle,
        source_property: impl Into<String>,
        target: Option<EntityHandle>,
    ) -> Self {
        Self {
            source,
            source_property: source_property.into(),
            target,
        }
    }
}

/// A navigation-property association between two tracked entities.
#[derive(Debug)]
pub struct LinkDescriptor {
    core: DescriptorCore,
    key: LinkKey,
}

impl LinkDescriptor {
    pub fn new(key: LinkKey, state: EntityStates) -> Self {
        Self {
            core: DescriptorCore::new(state),
            key,
        }
    }

    pub fn key(&self) -> &LinkKey {
        &self.key
    }

    pub fn source(&self) -> EntityHandle {
        self.key.source
    }

    pub fn source_property(&self) -> &str {
        &self.key.source_property
    }

    /// `None` for a reference link set to null.
    pub fn target(&self) -> Option<EntityHandle> {
        self.key.target
    }

    pub fn is_related_to(&self, handle: EntityHandle) -> bool {
        self.key.source == handle || self.key.target == Some(handle)
    }
}

impl HasCore for LinkDescriptor {
    fn core(&self) -> &DescriptorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DescriptorCore {
        &mut self.core
    }
}
