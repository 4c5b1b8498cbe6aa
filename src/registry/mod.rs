//! Node registry seam
//!
//! Every component that reads or writes nodes takes a [`NodeRegistry`]
//! explicitly. Production code uses [`KubeNodeRegistry`] over the API
//! server; tests use mocks or the [`InMemoryNodeRegistry`].

mod memory;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

pub use memory::InMemoryNodeRegistry;

use crate::Error;

/// Field manager recorded on patches issued by this crate
pub const FIELD_MANAGER: &str = "node-trust";

/// Read and patch access to cluster nodes
///
/// Implementations must report a missing node as [`Error::NotFound`] and a
/// stale `metadata.resourceVersion` precondition as [`Error::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Fetch a node by name
    async fn get(&self, name: &str) -> Result<Node, Error>;

    /// Apply a JSON merge patch to a node and return the updated object
    ///
    /// A patch carrying `metadata.resourceVersion` only succeeds if the
    /// stored object is still at that version.
    async fn patch(&self, name: &str, patch: &serde_json::Value) -> Result<Node, Error>;
}

/// Node registry backed by the Kubernetes API server
pub struct KubeNodeRegistry {
    api: Api<Node>,
}

impl KubeNodeRegistry {
    /// Create a registry over cluster-scoped nodes
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeRegistry for KubeNodeRegistry {
    async fn get(&self, name: &str) -> Result<Node, Error> {
        self.api
            .get(name)
            .await
            .map_err(|e| map_kube_error(name, e))
    }

    async fn patch(&self, name: &str, patch: &serde_json::Value) -> Result<Node, Error> {
        debug!(node = %name, "patching node");
        self.api
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| map_kube_error(name, e))
    }
}

/// Map a kube-rs error into the crate taxonomy
///
/// 404 becomes NotFound with the API server's wording, 409 becomes Conflict,
/// throttling, server-side and connection failures become Transient.
pub fn map_kube_error(name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::node_not_found(name),
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(name, ae.message),
        kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => {
            Error::transient(format!("{} ({})", ae.message, ae.code))
        }
        kube::Error::HyperError(e) => Error::transient(e.to_string()),
        kube::Error::Service(e) => Error::transient(e.to_string()),
        other => Error::Kube(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn not_found_uses_api_server_wording() {
        let err = map_kube_error("node1", api_error(404, "nodes \"node1\" not found"));
        assert_eq!(err.to_string(), "nodes \"node1\" not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn conflict_is_retryable() {
        let err = map_kube_error(
            "node1",
            api_error(409, "the object has been modified; please apply your changes"),
        );
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(matches!(
            map_kube_error("node1", api_error(503, "unavailable")),
            Error::Transient(_)
        ));
        assert!(matches!(
            map_kube_error("node1", api_error(429, "too many requests")),
            Error::Transient(_)
        ));
    }

    #[test]
    fn other_client_errors_pass_through() {
        let err = map_kube_error("node1", api_error(403, "forbidden"));
        assert!(matches!(err, Error::Kube(_)));
        assert!(!err.is_retryable());
    }
}
