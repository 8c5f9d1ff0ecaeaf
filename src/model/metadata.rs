//! Pre-registered entity type metadata.
//!
//! Types are described once, when the model is built, and the tracker and the
//! request builder only ever consult this registry: property lists, keys and
//! navigation kinds never come from runtime inspection of entity values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationKind {
    Reference,
    Collection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationProperty {
    pub name: String,
    pub target_type: String,
    pub kind: NavigationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTypeInfo {
    pub name: String,
    pub entity_set: Option<String>,
    pub key: Vec<String>,
    pub properties: Vec<String>,
    pub navigation: HashMap<String, NavigationProperty>,
    /// Media link entry: instances carry a default stream.
    #[serde(default)]
    pub has_stream: bool,
}

impl EntityTypeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_set: None,
            key: Vec::new(),
            properties: Vec::new(),
            navigation: HashMap::new(),
            has_stream: false,
        }
    }

    pub fn entity_set(mut self, set: impl Into<String>) -> Self {
        self.entity_set = Some(set.into());
        self
    }

    pub fn key(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.properties.contains(&name) {
            self.properties.push(name.clone());
        }
        self.key.push(name);
        self
    }

    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(name.into());
        self
    }

    pub fn reference(mut self, name: impl Into<String>, target_type: impl Into<String>) -> Self {
        let name = name.into();
        self.navigation.insert(
            name.clone(),
            NavigationProperty {
                name,
                target_type: target_type.into(),
                kind: NavigationKind::Reference,
            },
        );
        self
    }

    pub fn collection(mut self, name: impl Into<String>, target_type: impl Into<String>) -> Self {
        let name = name.into();
        self.navigation.insert(
            name.clone(),
            NavigationProperty {
                name,
                target_type: target_type.into(),
                kind: NavigationKind::Collection,
            },
        );
        self
    }

    pub fn media_entry(mut self) -> Self {
        self.has_stream = true;
        self
    }

    pub fn navigation_property(&self, name: &str) -> Result<&NavigationProperty> {
        self.navigation.get(name).ok_or_else(|| {
            ClientError::invalid_operation(format!(
                "the type '{}' has no navigation property '{}'",
                self.name, name
            ))
        })
    }
}

/// Registry of entity types known to a context.
#[derive(Debug, Clone, Default)]
pub struct ClientModel {
    types: HashMap<String, EntityTypeInfo>,
}

impl ClientModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, info: EntityTypeInfo) -> Self {
        self.register(info);
        self
    }

    pub fn register(&mut self, info: EntityTypeInfo) {
        self.types.insert(info.name.clone(), info);
    }

    pub fn try_get(&self, type_name: &str) -> Option<&EntityTypeInfo> {
        self.types.get(type_name)
    }

    pub fn get(&self, type_name: &str) -> Result<&EntityTypeInfo> {
        self.try_get(type_name).ok_or_else(|| {
            ClientError::invalid_operation(format!("the type '{}' is not registered", type_name))
        })
    }

    pub fn is_collection(&self, type_name: &str, property: &str) -> Result<bool> {
        let info = self.get(type_name)?;
        Ok(info.navigation_property(property)?.kind == NavigationKind::Collection)
    }

    /// Resolve the registered type whose entity set matches `entity_set`.
    pub fn type_for_set(&self, entity_set: &str) -> Option<&EntityTypeInfo> {
        self.types
            .values()
            .find(|info| info.entity_set.as_deref() == Some(entity_set))
    }
}
