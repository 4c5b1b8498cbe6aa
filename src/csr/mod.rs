//! Kubelet serving certificate trust checks
//!
//! A kubelet asks for a serving certificate by creating a CSR whose SANs
//! name the node and its IPs. Anyone who can create CSRs can claim any IP,
//! so before approval the claimed IPs are checked against the addresses
//! recorded on the node object. Those addresses are only ever written
//! through address classification, which closes the loop.
//!
//! The node lookup is the only I/O. It runs under a cancellation token and
//! a timeout; a cancelled or slow lookup is an error, never a denial, and a
//! missing node is an error carrying the registry's not-found message.

mod approval;
mod recognizer;

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use approval::{
    approval_condition, approval_patch, is_decided, reconcile_csr, review, CertificateApprover,
    KubeCertificateApprover, TrustDecision, APPROVAL_REASON,
};
pub use recognizer::{
    KubeletServingRequest, KUBELET_SERVING_SIGNER, NODE_USER_PREFIX, NODES_GROUP,
};

use crate::config::CloudConfig;
use crate::registry::NodeRegistry;
use crate::{Error, Result};

/// Annotation holding the node IP(s) passed to the kubelet
pub const PROVIDED_IP_ANNOTATION: &str = "alpha.kubernetes.io/provided-node-ip";

/// Identity claims of a certificate signing request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateRequest {
    /// DNS SANs in request order; the first names the node
    pub dns_names: Vec<String>,
    /// IP SANs in request order
    pub ip_sans: Vec<IpAddr>,
}

/// Cancellation, deadline and approval switch for one evaluation
#[derive(Clone, Debug)]
pub struct EvaluationContext {
    cancel: CancellationToken,
    timeout: Duration,
    approve: bool,
}

impl EvaluationContext {
    /// Context with its own token and the given lookup timeout
    ///
    /// Approvals are enabled; contexts built from config follow
    /// `approveNodeCSR` instead.
    pub fn new(timeout: Duration) -> Self {
        Self::with_cancellation(CancellationToken::new(), timeout)
    }

    /// Context bound to a caller-owned cancellation token
    pub fn with_cancellation(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            timeout,
            approve: true,
        }
    }

    /// Context using the configured lookup timeout and approval switch
    pub fn from_config(config: &CloudConfig, cancel: CancellationToken) -> Self {
        Self::with_cancellation(cancel, config.lookup_timeout())
            .with_approval(config.global.approve_node_csr)
    }

    /// Enable or disable writing approvals
    pub fn with_approval(mut self, enabled: bool) -> Self {
        self.approve = enabled;
        self
    }

    /// Whether reconciliation may approve CSRs
    pub fn approval_enabled(&self) -> bool {
        self.approve
    }

    /// Token that aborts in-flight lookups
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Decide whether a request's IP claims are backed by the node's addresses.
///
/// Returns `Ok(true)` when the node exists and every IP SAN is one of its
/// recorded addresses (or there are no IP SANs), `Ok(false)` when any IP SAN
/// is not. Lookup failures are returned as
/// `failed to get node <name>: <cause>`.
#[instrument(
    skip(ctx, registry, request),
    fields(node = request.dns_names.first().map(String::as_str).unwrap_or_default())
)]
pub async fn evaluate<R>(
    ctx: &EvaluationContext,
    registry: &R,
    request: &CertificateRequest,
) -> Result<bool>
where
    R: NodeRegistry + ?Sized,
{
    let name = request
        .dns_names
        .first()
        .ok_or_else(|| Error::validation("certificate request has no DNS names"))?;

    let node = lookup_node(ctx, registry, name)
        .await
        .map_err(|e| Error::node_lookup(name, e))?;

    if request.ip_sans.is_empty() {
        debug!("no IP SANs requested");
        return Ok(true);
    }

    let recorded = recorded_addresses(&node);
    for ip in &request.ip_sans {
        if !recorded.contains(&ip.to_canonical()) {
            info!(
                ip = %ip,
                recorded = ?recorded,
                "requested IP SAN is not a recorded node address"
            );
            return Ok(false);
        }
    }

    Ok(true)
}

/// Addresses recorded for a node, in canonical form.
///
/// The union of InternalIP/ExternalIP status addresses and the IPs in the
/// provided-node-ip annotation. Entries that do not parse are skipped.
pub fn recorded_addresses(node: &Node) -> BTreeSet<IpAddr> {
    let mut recorded = BTreeSet::new();

    let provided = node
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PROVIDED_IP_ANNOTATION));
    for text in provided.into_iter().flat_map(|v| v.split(',')) {
        record(&mut recorded, text);
    }

    let status_addresses = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .into_iter()
        .flatten()
        .filter(|a| a.type_ == "InternalIP" || a.type_ == "ExternalIP");
    for address in status_addresses {
        record(&mut recorded, &address.address);
    }

    recorded
}

fn record(recorded: &mut BTreeSet<IpAddr>, text: &str) {
    match text.trim().parse::<IpAddr>() {
        Ok(ip) => {
            recorded.insert(ip.to_canonical());
        }
        Err(_) => warn!(address = %text, "ignoring unparseable recorded node address"),
    }
}

async fn lookup_node<R>(ctx: &EvaluationContext, registry: &R, name: &str) -> Result<Node>
where
    R: NodeRegistry + ?Sized,
{
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(Error::transient("node lookup cancelled")),
        result = tokio::time::timeout(ctx.timeout, registry.get(name)) => match result {
            Ok(lookup) => lookup,
            Err(_) => Err(Error::transient(format!(
                "node lookup timed out after {}s",
                ctx.timeout.as_secs_f64()
            ))),
        },
    }
}
