//! Review kubelet serving CSRs and record approvals

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::{evaluate, EvaluationContext, KubeletServingRequest};
use crate::registry::{NodeRegistry, FIELD_MANAGER};
use crate::Result;

/// Reason recorded on approvals written by this crate
pub const APPROVAL_REASON: &str = "NodeAddressesVerified";

/// Outcome of reviewing a CSR
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustDecision {
    /// Every claim is backed by the node object
    Approve,
    /// A claim is not backed; the request stays pending
    Deny {
        /// Human-readable explanation
        reason: String,
    },
}

/// Writes approval decisions to CSR objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateApprover: Send + Sync {
    /// Add an Approved condition to the CSR, keeping its other conditions
    async fn approve(
        &self,
        csr: &CertificateSigningRequest,
        condition: CertificateSigningRequestCondition,
    ) -> Result<()>;
}

/// Approver using the CSR `/approval` subresource
pub struct KubeCertificateApprover {
    api: Api<CertificateSigningRequest>,
}

impl KubeCertificateApprover {
    /// Create an approver for cluster-scoped CSRs
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CertificateApprover for KubeCertificateApprover {
    async fn approve(
        &self,
        csr: &CertificateSigningRequest,
        condition: CertificateSigningRequestCondition,
    ) -> Result<()> {
        let name = csr.metadata.name.as_deref().unwrap_or_default();
        let patch = approval_patch(csr, condition);
        self.api
            .patch_approval(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Merge patch appending `condition` to the CSR's current conditions.
///
/// A merge patch replaces arrays wholesale, so the existing conditions are
/// carried along and the resourceVersion pins them to the object they were
/// read from.
pub fn approval_patch(
    csr: &CertificateSigningRequest,
    condition: CertificateSigningRequestCondition,
) -> Value {
    let mut conditions = csr
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    conditions.push(condition);

    let mut patch = json!({ "status": { "conditions": conditions } });
    if let Some(version) = &csr.metadata.resource_version {
        patch["metadata"] = json!({ "resourceVersion": version });
    }
    patch
}

/// Check a CSR object end to end: recognize it, then evaluate its claims
pub async fn review<R>(
    ctx: &EvaluationContext,
    registry: &R,
    csr: &CertificateSigningRequest,
) -> Result<TrustDecision>
where
    R: NodeRegistry + ?Sized,
{
    let recognized = KubeletServingRequest::from_csr(csr)?;
    decide(ctx, registry, &recognized).await
}

async fn decide<R>(
    ctx: &EvaluationContext,
    registry: &R,
    recognized: &KubeletServingRequest,
) -> Result<TrustDecision>
where
    R: NodeRegistry + ?Sized,
{
    if evaluate(ctx, registry, &recognized.request).await? {
        Ok(TrustDecision::Approve)
    } else {
        Ok(TrustDecision::Deny {
            reason: format!(
                "IP SANs of {} are not all recorded addresses of node {}",
                recognized.csr_name, recognized.node_name
            ),
        })
    }
}

/// Build the Approved condition for a reviewed node
pub fn approval_condition(node_name: &str) -> CertificateSigningRequestCondition {
    CertificateSigningRequestCondition {
        type_: "Approved".to_string(),
        status: "True".to_string(),
        reason: Some(APPROVAL_REASON.to_string()),
        message: Some(format!(
            "kubelet serving certificate claims verified against node {}",
            node_name
        )),
        ..Default::default()
    }
}

/// True once a CSR carries an Approved or Denied condition
pub fn is_decided(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
        })
}

/// Review a pending CSR and approve it when its claims check out.
///
/// Returns `None` for CSRs that already carry a decision and when the
/// context has approvals disabled. Denials and errors
/// write nothing, so the request stays pending and a later pass sees the
/// node's addresses as they are then.
#[instrument(skip_all, fields(csr = csr.metadata.name.as_deref().unwrap_or_default()))]
pub async fn reconcile_csr<R, A>(
    ctx: &EvaluationContext,
    registry: &R,
    approver: &A,
    csr: &CertificateSigningRequest,
) -> Result<Option<TrustDecision>>
where
    R: NodeRegistry + ?Sized,
    A: CertificateApprover + ?Sized,
{
    if is_decided(csr) {
        debug!("CSR already decided");
        return Ok(None);
    }
    if !ctx.approval_enabled() {
        debug!("CSR approval disabled");
        return Ok(None);
    }

    let decision = match KubeletServingRequest::from_csr(csr) {
        Ok(recognized) => decide(ctx, registry, &recognized)
            .await
            .map(|decision| (recognized, decision)),
        Err(e) => Err(e),
    };
    let (recognized, decision) = match decision {
        Ok(reviewed) => reviewed,
        Err(e) => {
            warn!(error = %e, "CSR review failed, leaving it pending");
            return Err(e);
        }
    };

    match &decision {
        TrustDecision::Approve => {
            let condition = approval_condition(&recognized.node_name);
            approver.approve(csr, condition).await?;
            info!(node = %recognized.node_name, "approved kubelet serving CSR");
        }
        TrustDecision::Deny { reason } => {
            warn!(
                node = %recognized.node_name,
                reason = %reason,
                "not approving kubelet serving CSR"
            );
        }
    }

    Ok(Some(decision))
}
