use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::ClientError;
use crate::model::common::{EntityStates, StreamStates, DETACHED_CHANGE_ORDER};
use crate::model::entity::EntityDescriptor;
use crate::model::link::LinkDescriptor;
use crate::model::stream::StreamDescriptor;

pub type EntityRef = Arc<RwLock<EntityDescriptor>>;
pub type LinkRef = Arc<RwLock<LinkDescriptor>>;
pub type StreamRef = Arc<RwLock<StreamDescriptor>>;

/// Save bookkeeping shared by entity, link and stream descriptors.
#[derive(Debug, Clone, Default)]
pub struct DescriptorCore {
    pub state: EntityStates,
    pub change_order: u32,
    pub save_error: Option<Arc<ClientError>>,
    pub content_generated_for_save: bool,
    /// State the descriptor had when its response was applied.
    pub save_result_was_processed: Option<EntityStates>,
}

impl DescriptorCore {
    pub fn new(state: EntityStates) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    /// Clear per-save bookkeeping before a new save starts.
    pub fn reset_for_save(&mut self) {
        self.content_generated_for_save = false;
        self.save_result_was_processed = None;
        self.save_error = None;
    }

    pub fn mark_detached(&mut self) {
        self.state = EntityStates::Detached;
        self.change_order = DETACHED_CHANGE_ORDER;
    }
}

pub trait HasCore {
    fn core(&self) -> &DescriptorCore;
    fn core_mut(&mut self) -> &mut DescriptorCore;

    fn state(&self) -> EntityStates {
        self.core().state
    }

    fn set_state(&mut self, state: EntityStates) {
        self.core_mut().state = state;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Entity,
    Link,
    NamedStream,
}

/// A tracked record that can take part in a save.
#[derive(Debug, Clone)]
pub enum Descriptor {
    Entity(EntityRef),
    Link(LinkRef),
    NamedStream(StreamRef),
}

impl Descriptor {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            Descriptor::Entity(_) => DescriptorKind::Entity,
            Descriptor::Link(_) => DescriptorKind::Link,
            Descriptor::NamedStream(_) => DescriptorKind::NamedStream,
        }
    }

    pub fn with_core<R>(&self, f: impl FnOnce(&DescriptorCore) -> R) -> R {
        match self {
            Descriptor::Entity(d) => f(d.read().core()),
            Descriptor::Link(d) => f(d.read().core()),
            Descriptor::NamedStream(d) => f(d.read().core()),
        }
    }

    pub fn with_core_mut<R>(&self, f: impl FnOnce(&mut DescriptorCore) -> R) -> R {
        match self {
            Descriptor::Entity(d) => f(d.write().core_mut()),
            Descriptor::Link(d) => f(d.write().core_mut()),
            Descriptor::NamedStream(d) => f(d.write().core_mut()),
        }
    }

    pub fn state(&self) -> EntityStates {
        self.with_core(|c| c.state)
    }

    pub fn change_order(&self) -> u32 {
        self.with_core(|c| c.change_order)
    }

    pub fn content_generated_for_save(&self) -> bool {
        self.with_core(|c| c.content_generated_for_save)
    }

    pub fn save_error(&self) -> Option<Arc<ClientError>> {
        self.with_core(|c| c.save_error.clone())
    }

    pub fn save_result_was_processed(&self) -> Option<EntityStates> {
        self.with_core(|c| c.save_result_was_processed)
    }

    /// Whether the descriptor has a change waiting to be saved.
    pub fn is_modified(&self) -> bool {
        match self {
            Descriptor::Entity(d) => {
                let d = d.read();
                d.state().is_pending() || d.stream_state != StreamStates::NoStream
            }
            Descriptor::Link(d) => d.read().state().is_pending(),
            Descriptor::NamedStream(d) => d.read().state() == EntityStates::Modified,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Descriptor::Entity(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&LinkRef> {
        match self {
            Descriptor::Link(d) => Some(d),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &Descriptor) -> bool {
        match (self, other) {
            (Descriptor::Entity(a), Descriptor::Entity(b)) => Arc::ptr_eq(a, b),
            (Descriptor::Link(a), Descriptor::Link(b)) => Arc::ptr_eq(a, b),
            (Descriptor::NamedStream(a), Descriptor::NamedStream(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
