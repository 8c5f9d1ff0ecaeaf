use serde::{Deserialize, Serialize};
use std::fmt;

/// Arena handle standing in for reference identity of a client entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityHandle(pub u64);

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Change-order value of descriptors that left the tracker.
pub const DETACHED_CHANGE_ORDER: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStates {
    Detached,
    Unchanged,
    Added,
    Deleted,
    Modified,
}

impl EntityStates {
    /// States that produce a request on save.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            EntityStates::Added | EntityStates::Modified | EntityStates::Deleted
        )
    }
}

impl Default for EntityStates {
    fn default() -> Self {
        EntityStates::Detached
    }
}

/// How data coming back from the service reconciles with tracked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOption {
    AppendOnly,
    OverwriteChanges,
    PreserveChanges,
    NoTracking,
}

impl Default for MergeOption {
    fn default() -> Self {
        MergeOption::AppendOnly
    }
}

/// State of the media resource attached to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStates {
    NoStream,
    Added,
    Modified,
}

impl Default for StreamStates {
    fn default() -> Self {
        StreamStates::NoStream
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// One exchange per change.
    NonBatch,
    /// All changes in one atomic changeset.
    BatchWithSingleChangeset,
    /// Every change in its own changeset.
    BatchWithIndependentOperations,
}

impl Default for SaveMode {
    fn default() -> Self {
        SaveMode::NonBatch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SaveChangesOptions {
    pub mode: SaveMode,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Send PUT instead of PATCH for updates.
    #[serde(default)]
    pub replace_on_update: bool,
    /// Only send properties that were explicitly set on inserts.
    #[serde(default)]
    pub post_only_set_properties: bool,
}

impl SaveChangesOptions {
    pub fn batch_single_changeset() -> Self {
        Self {
            mode: SaveMode::BatchWithSingleChangeset,
            ..Self::default()
        }
    }

    pub fn batch_independent_operations() -> Self {
        Self {
            mode: SaveMode::BatchWithIndependentOperations,
            ..Self::default()
        }
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn replace_on_update(mut self) -> Self {
        self.replace_on_update = true;
        self
    }

    pub fn is_batch(&self) -> bool {
        self.mode != SaveMode::NonBatch
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.continue_on_error && self.mode == SaveMode::BatchWithSingleChangeset {
            return Err(crate::error::ClientError::Argument(
                "continue_on_error cannot be combined with a single-changeset batch".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of one save or batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    BuildingRequest,
    Sent,
    ReadingResponse,
    Completed,
    Faulted,
    Aborted,
}

/// Value of the `Prefer: return=...` header sent with inserts and updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePreference {
    #[default]
    None,
    IncludeContent,
    NoContent,
}

impl ResponsePreference {
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            ResponsePreference::None => None,
            ResponsePreference::IncludeContent => Some("return=representation"),
            ResponsePreference::NoContent => Some("return=minimal"),
        }
    }
}
