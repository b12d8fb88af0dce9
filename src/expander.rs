//! Target expansion: node ids + group ids → deduplicated execution targets.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::inventory::InventoryResolver;

#[derive(Debug, Error)]
pub enum ExpandError {
    /// A referenced group id does not exist in the inventory. Raised before
    /// anything is queued, so a bad batch request admits zero units.
    #[error("target group not found: {0}")]
    GroupNotFound(String),
}

/// Resolved target set for one batch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedTargets {
    /// Deduplicated node ids, in first-seen order: direct nodes first, then
    /// group members in group order.
    pub targets: Vec<String>,
}

/// Resolves batch target selections against the inventory.
///
/// Individual node ids are not validated for existence here; whether a node
/// is reachable is the transport's concern. Only an explicit group lookup
/// miss fails the expansion.
#[derive(Clone)]
pub struct TargetExpander {
    inventory: Arc<dyn InventoryResolver>,
}

impl TargetExpander {
    pub fn new(inventory: Arc<dyn InventoryResolver>) -> Self {
        Self { inventory }
    }

    /// Pure over the current inventory snapshot: no side effects.
    pub fn expand(
        &self,
        node_ids: &[String],
        group_ids: &[String],
    ) -> Result<ExpandedTargets, ExpandError> {
        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(node_ids.len());

        for node_id in node_ids {
            if seen.insert(node_id.clone()) {
                targets.push(node_id.clone());
            }
        }

        for group_id in group_ids {
            let members = self
                .inventory
                .resolve_group(group_id)
                .ok_or_else(|| ExpandError::GroupNotFound(group_id.clone()))?;
            for node_id in members {
                if seen.insert(node_id.clone()) {
                    targets.push(node_id);
                }
            }
        }

        Ok(ExpandedTargets { targets })
    }
}
