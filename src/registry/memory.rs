//! In-memory node registry with API-server-like patch semantics

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use serde_json::{Map, Value};

use super::NodeRegistry;
use crate::Error;

/// Node store that enforces resourceVersion preconditions on patch
///
/// Useful wherever a real API server is unavailable: patches are applied as
/// RFC 7386 merge patches and every successful write bumps the version.
#[derive(Default)]
pub struct InMemoryNodeRegistry {
    nodes: Mutex<BTreeMap<String, Node>>,
    patches: AtomicUsize,
    pending_conflicts: AtomicU32,
}

impl InMemoryNodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the given nodes
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let registry = Self::new();
        for node in nodes {
            registry.insert(node);
        }
        registry
    }

    /// Store a node, replacing any node with the same name
    pub fn insert(&self, mut node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        if node.metadata.resource_version.is_none() {
            node.metadata.resource_version = Some("1".to_string());
        }
        self.lock().insert(name, node);
    }

    /// Snapshot of a stored node
    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().get(name).cloned()
    }

    /// Number of patches applied successfully
    pub fn patch_count(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    /// Make the next `count` patches fail with a conflict, as if another
    /// writer had updated the node first
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Node>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl NodeRegistry for InMemoryNodeRegistry {
    async fn get(&self, name: &str) -> Result<Node, Error> {
        self.node(name).ok_or_else(|| Error::node_not_found(name))
    }

    async fn patch(&self, name: &str, patch: &Value) -> Result<Node, Error> {
        let mut nodes = self.lock();
        let current = nodes.get(name).ok_or_else(|| Error::node_not_found(name))?;

        let current_version = current.metadata.resource_version.clone().unwrap_or_default();
        let expected_version = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str);

        if self.take_injected_conflict()
            || expected_version.is_some_and(|v| v != current_version)
        {
            return Err(Error::conflict(
                name,
                "the object has been modified; please apply your changes to the latest version \
                 and try again",
            ));
        }

        let mut document = serde_json::to_value(current)?;
        merge_patch(&mut document, patch);
        let mut updated: Node = serde_json::from_value(document)?;

        let next_version = current_version.parse::<u64>().unwrap_or(0) + 1;
        updated.metadata.resource_version = Some(next_version.to_string());
        updated.metadata.name = Some(name.to_string());

        nodes.insert(name.to_string(), updated.clone());
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_fields) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_fields) = target {
        for (key, value) in patch_fields {
            if value.is_null() {
                target_fields.remove(key);
            } else {
                merge_patch(target_fields.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
