//! Recognize kubelet serving CSRs and extract their identity claims
//!
//! Only requests that look exactly like what a kubelet sends for its
//! serving certificate are eligible for automatic approval: the right
//! signer, a node user in the nodes group, server-auth usages, and a
//! PKCS#10 body whose subject and SANs agree with that user.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use super::CertificateRequest;
use crate::{Error, Result};

/// Signer used by kubelets for serving certificates
pub const KUBELET_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";

/// Username prefix of node identities
pub const NODE_USER_PREFIX: &str = "system:node:";

/// Group every node identity belongs to
pub const NODES_GROUP: &str = "system:nodes";

const SERVER_AUTH: &str = "server auth";
const ALLOWED_USAGES: &[&str] = &["digital signature", "key encipherment", SERVER_AUTH];
const PEM_TAG: &str = "CERTIFICATE REQUEST";

/// A validated kubelet serving CSR
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeletServingRequest {
    /// Name of the CSR object
    pub csr_name: String,
    /// Node the request was made by
    pub node_name: String,
    /// SAN claims, first DNS name equal to the node name
    pub request: CertificateRequest,
}

impl KubeletServingRequest {
    /// Validate a CSR object and extract its claims
    pub fn from_csr(csr: &CertificateSigningRequest) -> Result<Self> {
        let csr_name = csr.metadata.name.clone().unwrap_or_default();
        let spec = &csr.spec;

        if spec.signer_name != KUBELET_SERVING_SIGNER {
            return Err(Error::validation(format!(
                "CSR {} has signer {:?}, expected {:?}",
                csr_name, spec.signer_name, KUBELET_SERVING_SIGNER
            )));
        }

        let username = spec.username.as_deref().unwrap_or_default();
        let node_name = username
            .strip_prefix(NODE_USER_PREFIX)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::validation(format!(
                    "CSR {} was requested by {:?}, not a node",
                    csr_name, username
                ))
            })?
            .to_string();

        let in_nodes_group = spec
            .groups
            .as_ref()
            .is_some_and(|g| g.iter().any(|g| g == NODES_GROUP));
        if !in_nodes_group {
            return Err(Error::validation(format!(
                "CSR {} requester is not in group {}",
                csr_name, NODES_GROUP
            )));
        }

        validate_usages(&csr_name, spec.usages.as_deref().unwrap_or_default())?;

        let parsed = parse_request(&csr_name, username, &spec.request.0)?;

        match parsed.dns_names.first() {
            Some(first) if *first == node_name => {}
            first => {
                return Err(Error::validation(format!(
                    "CSR {} first DNS SAN {:?} does not name node {}",
                    csr_name, first, node_name
                )))
            }
        }

        Ok(Self {
            csr_name,
            node_name,
            request: parsed,
        })
    }
}

fn validate_usages(csr_name: &str, usages: &[String]) -> Result<()> {
    if let Some(bad) = usages.iter().find(|u| !ALLOWED_USAGES.contains(&u.as_str())) {
        return Err(Error::validation(format!(
            "CSR {} requests disallowed usage {:?}",
            csr_name, bad
        )));
    }
    if !usages.iter().any(|u| u == SERVER_AUTH) {
        return Err(Error::validation(format!(
            "CSR {} does not request {:?}",
            csr_name, SERVER_AUTH
        )));
    }
    Ok(())
}

fn parse_request(csr_name: &str, username: &str, pem_bytes: &[u8]) -> Result<CertificateRequest> {
    let block = ::pem::parse(pem_bytes)
        .map_err(|e| Error::validation(format!("CSR {} is not valid PEM: {}", csr_name, e)))?;
    if block.tag() != PEM_TAG {
        return Err(Error::validation(format!(
            "CSR {} PEM block is {:?}, expected {:?}",
            csr_name,
            block.tag(),
            PEM_TAG
        )));
    }

    let (_, parsed) = X509CertificationRequest::from_der(block.contents()).map_err(|e| {
        Error::validation(format!("CSR {} has an unparseable body: {}", csr_name, e))
    })?;

    let subject = &parsed.certification_request_info.subject;
    let common_names: Vec<&str> = subject
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .collect();
    if common_names != [username] {
        return Err(Error::validation(format!(
            "CSR {} subject CN {:?} does not match requester {}",
            csr_name, common_names, username
        )));
    }

    let organizations: Vec<&str> = subject
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .collect();
    if organizations != [NODES_GROUP] {
        return Err(Error::validation(format!(
            "CSR {} subject organizations {:?}, expected [{}]",
            csr_name, organizations, NODES_GROUP
        )));
    }

    let mut request = CertificateRequest::default();
    for extension in parsed.requested_extensions().into_iter().flatten() {
        let ParsedExtension::SubjectAlternativeName(san) = extension else {
            continue;
        };
        for name in &san.general_names {
            match name {
                GeneralName::DNSName(dns) => request.dns_names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    request.ip_sans.push(ip_from_bytes(csr_name, bytes)?)
                }
                other => {
                    return Err(Error::validation(format!(
                        "CSR {} carries unsupported SAN {:?}",
                        csr_name, other
                    )))
                }
            }
        }
    }

    if request.dns_names.is_empty() && request.ip_sans.is_empty() {
        return Err(Error::validation(format!(
            "CSR {} carries no DNS or IP SANs",
            csr_name
        )));
    }

    Ok(request)
}

fn ip_from_bytes(csr_name: &str, bytes: &[u8]) -> Result<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    Err(Error::validation(format!(
        "CSR {} has an IP SAN of {} bytes",
        csr_name,
        bytes.len()
    )))
}
