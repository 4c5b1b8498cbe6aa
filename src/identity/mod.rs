//! Node identity label synchronization
//!
//! Writes the cluster name, platform and spot lifecycle onto a node as
//! labels. Only the three keys in [`MANAGED_LABELS`] are ever written or
//! removed; every other label and annotation belongs to someone else.
//!
//! Updates are JSON merge patches that carry the node's resourceVersion, so
//! a concurrent writer causes a conflict instead of a lost update. When the
//! node already carries the desired labels no request is sent at all.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::registry::NodeRegistry;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Label carrying the cluster name
pub const CLUSTER_NAME_LABEL: &str = "node.cloudprovider.kubernetes.io/clustername";

/// Label carrying the platform identifier
pub const PLATFORM_LABEL: &str = "node.cloudprovider.kubernetes.io/platform";

/// Label marking spot/preemptible nodes
pub const LIFECYCLE_LABEL: &str = "node.cloudprovider.kubernetes.io/lifecycle";

/// Lifecycle label value for spot instances
pub const SPOT_LIFECYCLE: &str = "spot";

/// Label keys owned by identity synchronization
pub const MANAGED_LABELS: [&str; 3] = [CLUSTER_NAME_LABEL, PLATFORM_LABEL, LIFECYCLE_LABEL];

/// Metadata reported by the platform-metadata backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformMetadata {
    /// Platform identifier, e.g. `metal` or `gcp`
    #[serde(default)]
    pub platform: String,
    /// Hostname as seen by the platform
    #[serde(default)]
    pub hostname: String,
    /// Whether the instance is spot/preemptible
    #[serde(default)]
    pub spot: bool,
}

/// Identity derived for one node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Cluster the node belongs to
    pub cluster_name: String,
    /// Platform identifier, empty when unknown
    pub platform: String,
    /// Hostname reported by the platform
    pub hostname: String,
    /// Spot/preemptible instance
    pub is_spot_instance: bool,
}

impl NodeIdentity {
    /// Derive the identity from platform metadata
    pub fn from_metadata(cluster_name: impl Into<String>, meta: &PlatformMetadata) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            platform: meta.platform.clone(),
            hostname: meta.hostname.clone(),
            is_spot_instance: meta.spot,
        }
    }

    /// Desired value of each managed label; `None` means absent
    pub fn desired_labels(&self) -> BTreeMap<&'static str, Option<String>> {
        let platform = (!self.platform.is_empty()).then(|| self.platform.clone());
        let lifecycle = self.is_spot_instance.then(|| SPOT_LIFECYCLE.to_string());

        BTreeMap::from([
            (CLUSTER_NAME_LABEL, Some(self.cluster_name.clone())),
            (PLATFORM_LABEL, platform),
            (LIFECYCLE_LABEL, lifecycle),
        ])
    }
}

/// Compute the minimal merge patch that brings the managed labels in line.
///
/// Returns `None` when the node already matches. Labels set to `null` in
/// the patch are removed by the server.
pub fn label_patch(node: &Node, identity: &NodeIdentity) -> Option<Value> {
    let current = node.metadata.labels.as_ref();

    let mut labels = Map::new();
    for (key, desired) in identity.desired_labels() {
        let existing = current.and_then(|l| l.get(key));
        match (existing, desired) {
            (Some(have), Some(want)) if *have == want => {}
            (None, None) => {}
            (_, Some(want)) => {
                labels.insert(key.to_string(), Value::String(want));
            }
            (Some(_), None) => {
                labels.insert(key.to_string(), Value::Null);
            }
        }
    }

    if labels.is_empty() {
        return None;
    }

    let mut metadata = Map::new();
    metadata.insert("labels".to_string(), Value::Object(labels));
    if let Some(version) = &node.metadata.resource_version {
        metadata.insert("resourceVersion".to_string(), Value::String(version.clone()));
    }
    Some(json!({ "metadata": metadata }))
}

/// Bring a node's managed labels in line with its identity.
///
/// Works on the given snapshot: a stale snapshot surfaces as
/// [`Error::Conflict`] and the caller re-reads before trying again (see
/// [`sync_identity_with_retry`]). A missing node surfaces as
/// [`Error::NotFound`].
#[instrument(
    skip(registry, node, identity),
    fields(node = node.metadata.name.as_deref().unwrap_or_default())
)]
pub async fn sync_identity<R>(registry: &R, node: &Node, identity: &NodeIdentity) -> Result<()>
where
    R: NodeRegistry + ?Sized,
{
    let name = node
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::validation("node has no name"))?;

    let Some(patch) = label_patch(node, identity) else {
        debug!("identity labels already up to date");
        return Ok(());
    };

    registry.patch(name, &patch).await?;
    info!(
        cluster = %identity.cluster_name,
        platform = %identity.platform,
        spot = identity.is_spot_instance,
        "synced node identity labels"
    );
    Ok(())
}

/// Read the node fresh and sync its identity, retrying conflicts.
///
/// Conflicts and transient failures are retried with backoff up to
/// `retry.max_attempts`; the last error is returned once they run out.
/// Missing nodes and invalid input fail immediately.
pub async fn sync_identity_with_retry<R>(
    registry: &R,
    name: &str,
    identity: &NodeIdentity,
    retry: &RetryConfig,
) -> Result<()>
where
    R: NodeRegistry + ?Sized,
{
    let result = retry_with_backoff(
        retry,
        "sync_node_identity",
        Error::is_retryable,
        || async move {
            let node = registry.get(name).await?;
            sync_identity(registry, &node, identity).await
        },
    )
    .await;

    if let Err(e) = &result {
        warn!(node = %name, error = %e, "failed to sync node identity");
    }
    result
}
