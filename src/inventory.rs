//! Inventory collaborator: group membership lookup for target expansion.
//!
//! The expansion core only needs one operation from the inventory — resolve
//! a group id to its member node ids. Group management itself (editing,
//! syncing from an external source of truth) lives outside this service.

use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Read-only group membership lookup.
pub trait InventoryResolver: Send + Sync {
    /// Returns the member node ids of `group_id`, or `None` if the group
    /// does not exist. Membership order is preserved.
    fn resolve_group(&self, group_id: &str) -> Option<Vec<String>>;
}

/// Inventory backed by a static in-memory map, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    groups: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    groups: HashMap<String, Vec<String>>,
}

impl StaticInventory {
    pub fn new(groups: HashMap<String, Vec<String>>) -> Self {
        Self { groups }
    }

    /// Load the inventory from a JSON file of the form
    /// `{"groups": {"web": ["node-1", "node-2"], ...}}`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read inventory file {}", path.display()))?;
        let file: InventoryFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid inventory file {}", path.display()))?;
        Ok(Self::new(file.groups))
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl InventoryResolver for StaticInventory {
    fn resolve_group(&self, group_id: &str) -> Option<Vec<String>> {
        self.groups.get(group_id).cloned()
    }
}
