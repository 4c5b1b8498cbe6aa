//! Node address classification
//!
//! Turns the raw addresses an address-discovery backend reports for a node
//! into the ordered internal/external list published in node status. The
//! result is the ground truth the CSR validator later checks IP SANs
//! against, so the rules here are strict:
//!
//! - at most one internal address, the kubelet-provided node IP
//! - at most one external address per IP family
//! - loopback, link-local, unspecified and multicast addresses are never
//!   external, and neither is anything on an overlay or dummy link
//! - output depends only on the set of inputs, never on their order

mod platform;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use k8s_openapi::api::core::v1::NodeAddress;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub use platform::{PlatformKind, PlatformPolicy, EXTERNAL_LINK_NAME};

use crate::{Error, Result};

/// Links that never carry an externally reachable node identity
const EXCLUDED_LINKS: &[&str] = &["kubespan", "siderolink", "lo"];

/// Prefix of dummy interfaces, also excluded
const DUMMY_LINK_PREFIX: &str = "dummy";

/// An address as reported by the discovery backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedAddress {
    /// IP with prefix length, e.g. `1.2.3.4/24`
    pub address: IpNet,
    /// Interface the address was observed on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_name: Option<String>,
}

impl ObservedAddress {
    /// Address observed on an unnamed link
    pub fn new(address: IpNet) -> Self {
        Self {
            address,
            link_name: None,
        }
    }

    /// Address observed on the given link
    pub fn on_link(address: IpNet, link: impl Into<String>) -> Self {
        Self {
            address,
            link_name: Some(link.into()),
        }
    }

    /// Parse `ip/prefix` text
    pub fn parse(s: &str) -> Result<Self> {
        let address = IpNet::from_str(s.trim())
            .map_err(|e| Error::validation(format!("invalid address {:?}: {}", s, e)))?;
        Ok(Self::new(address))
    }

    fn ip(&self) -> IpAddr {
        self.address.addr().to_canonical()
    }

    fn on_excluded_link(&self) -> bool {
        self.link_name.as_deref().is_some_and(|link| {
            EXCLUDED_LINKS.contains(&link) || link.starts_with(DUMMY_LINK_PREFIX)
        })
    }

    fn on_external_link(&self) -> bool {
        self.link_name.as_deref() == Some(EXTERNAL_LINK_NAME)
    }
}

/// Internal or external
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressCategory {
    /// Routable inside the cluster
    Internal,
    /// Reachable from outside the cluster
    External,
}

impl AddressCategory {
    /// Kubernetes `NodeAddress` type string
    pub fn node_address_type(&self) -> &'static str {
        match self {
            Self::Internal => "InternalIP",
            Self::External => "ExternalIP",
        }
    }
}

impl fmt::Display for AddressCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.node_address_type())
    }
}

/// One entry of the classified output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedAddress {
    /// Internal or external
    pub category: AddressCategory,
    /// Bare IP in canonical textual form
    pub address: String,
}

impl ClassifiedAddress {
    /// Internal entry
    pub fn internal(address: impl Into<String>) -> Self {
        Self {
            category: AddressCategory::Internal,
            address: address.into(),
        }
    }

    /// External entry
    pub fn external(address: impl Into<String>) -> Self {
        Self {
            category: AddressCategory::External,
            address: address.into(),
        }
    }
}

/// Classify a node's observed addresses.
///
/// Returns the provided node IP as the internal address (when set) followed
/// by at most one external IPv4 and one external IPv6 address, IPv6 first
/// when the policy prefers it. Within a family the candidate with the
/// smallest canonical text wins, so any permutation of the input produces
/// the same answer.
pub fn classify(
    policy: &PlatformPolicy,
    observed: &[ObservedAddress],
) -> Result<Vec<ClassifiedAddress>> {
    let provided = parse_provided_ip(policy.provided_ip.as_deref())?;
    let kind = policy.kind();

    let mut best_v4: Option<IpAddr> = None;
    let mut best_v6: Option<IpAddr> = None;

    for candidate in observed {
        let ip = candidate.ip();

        if Some(ip) == provided || !is_external_candidate(kind, candidate, ip) {
            trace!(
                address = %candidate.address,
                link = ?candidate.link_name,
                "not an external candidate"
            );
            continue;
        }

        let slot = if ip.is_ipv6() {
            &mut best_v6
        } else {
            &mut best_v4
        };
        if slot.map_or(true, |current| ip.to_string() < current.to_string()) {
            *slot = Some(ip);
        }
    }

    let mut addresses = Vec::with_capacity(3);
    if let Some(ip) = provided {
        addresses.push(ClassifiedAddress::internal(ip.to_string()));
    }

    let ordered = if policy.prefer_ipv6 {
        [best_v6, best_v4]
    } else {
        [best_v4, best_v6]
    };
    addresses.extend(
        ordered
            .into_iter()
            .flatten()
            .map(|ip| ClassifiedAddress::external(ip.to_string())),
    );

    debug!(
        platform = %policy.platform,
        observed = observed.len(),
        classified = addresses.len(),
        "classified node addresses"
    );

    Ok(addresses)
}

/// Convert classified addresses into node status entries
pub fn to_node_addresses(addresses: &[ClassifiedAddress]) -> Vec<NodeAddress> {
    addresses
        .iter()
        .map(|a| NodeAddress {
            address: a.address.clone(),
            type_: a.category.node_address_type().to_string(),
        })
        .collect()
}

fn parse_provided_ip(provided: Option<&str>) -> Result<Option<IpAddr>> {
    match provided.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => IpAddr::from_str(text)
            .map(|ip| Some(ip.to_canonical()))
            .map_err(|_| Error::validation(format!("failed to parse provided IP {:?}", text))),
    }
}

fn is_external_candidate(kind: PlatformKind, candidate: &ObservedAddress, ip: IpAddr) -> bool {
    if never_external(ip) || candidate.on_excluded_link() {
        return false;
    }
    match kind {
        PlatformKind::SelfManaged => is_publicly_routable(ip),
        PlatformKind::ManagedCloud => candidate.on_external_link(),
    }
}

fn never_external(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => v4.is_link_local() || v4.is_broadcast(),
        // fe80::/10
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn is_publicly_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            // 100.64.0.0/10 shared address space
            let shared = a == 100 && (b & 0xc0) == 64;
            !v4.is_private() && !shared
        }
        // fc00::/7 unique local
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) != 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ObservedAddress {
        ObservedAddress::parse(s).unwrap()
    }

    fn on_link(s: &str, link: &str) -> ObservedAddress {
        ObservedAddress::on_link(s.parse().unwrap(), link)
    }

    fn internal(s: &str) -> ClassifiedAddress {
        ClassifiedAddress::internal(s)
    }

    fn external(s: &str) -> ClassifiedAddress {
        ClassifiedAddress::external(s)
    }

    fn many_public_ips() -> Vec<ObservedAddress> {
        vec![
            addr("192.168.0.1/24"),
            addr("fe80::e0b5:71ff:fe24:7e60/64"),
            addr("fd15:1:2::192:168:0:1/64"),
            addr("1.2.3.4/24"),
            addr("4.3.2.1/24"),
            addr("2001:1234::1/64"),
            addr("2001:1234:4321::32/64"),
        ]
    }

    mod self_managed {
        use super::*;

        #[test]
        fn nocloud_without_public_ips_has_only_internal() {
            let policy = PlatformPolicy::new("nocloud").with_provided_ip("192.168.0.1");
            let observed = vec![
                addr("192.168.0.1/24"),
                addr("fe80::e0b5:71ff:fe24:7e60/64"),
                addr("fd15:1:2::192:168:0:1/64"),
                on_link("fd43:fe8a:be2:ab02:dc3c:38ff:fe51:5022/64", "kubespan"),
            ];

            assert_eq!(
                classify(&policy, &observed).unwrap(),
                vec![internal("192.168.0.1")]
            );
        }

        #[test]
        fn nocloud_with_many_public_ips_picks_one_per_family() {
            let policy = PlatformPolicy::new("nocloud").with_provided_ip("192.168.0.1");

            assert_eq!(
                classify(&policy, &many_public_ips()).unwrap(),
                vec![
                    internal("192.168.0.1"),
                    external("1.2.3.4"),
                    external("2001:1234:4321::32"),
                ]
            );
        }

        #[test]
        fn nocloud_prefer_ipv6_puts_ipv6_first() {
            let policy = PlatformPolicy::new("nocloud")
                .with_provided_ip("192.168.0.1")
                .prefer_ipv6(true);

            assert_eq!(
                classify(&policy, &many_public_ips()).unwrap(),
                vec![
                    internal("192.168.0.1"),
                    external("2001:1234:4321::32"),
                    external("1.2.3.4"),
                ]
            );
        }

        #[test]
        fn metal_promotes_public_addresses() {
            let policy = PlatformPolicy::new("metal").with_provided_ip("192.168.0.1");
            let observed = vec![
                addr("192.168.0.1/24"),
                addr("fe80::e0b5:71ff:fe24:7e60/64"),
                addr("fd15:1:2::192:168:0:1/64"),
                addr("1.2.3.4/24"),
                addr("2001:1234::1/128"),
            ];

            assert_eq!(
                classify(&policy, &observed).unwrap(),
                vec![
                    internal("192.168.0.1"),
                    external("1.2.3.4"),
                    external("2001:1234::1"),
                ]
            );
        }

        #[test]
        fn overlay_and_dummy_links_are_never_external() {
            let policy = PlatformPolicy::new("metal");
            let observed = vec![
                on_link("5.6.7.8/32", "siderolink"),
                on_link("5.6.7.9/32", "dummy0"),
                on_link("2001:db8::5/64", "kubespan"),
            ];

            assert!(classify(&policy, &observed).unwrap().is_empty());
        }

        #[test]
        fn shared_address_space_is_not_external() {
            let policy = PlatformPolicy::new("metal");
            let observed = vec![addr("100.64.1.1/10"), addr("8.8.8.8/24")];

            assert_eq!(
                classify(&policy, &observed).unwrap(),
                vec![external("8.8.8.8")]
            );
        }
    }

    mod managed_cloud {
        use super::*;

        #[test]
        fn gcp_promotes_only_external_link_addresses() {
            let policy = PlatformPolicy::new("gcp").with_provided_ip("192.168.0.1");
            let observed = vec![
                addr("192.168.0.1/24"),
                addr("fe80::e0b5:71ff:fe24:7e60/64"),
                on_link("1.2.3.4/24", "external"),
                addr("4.3.2.1/24"),
                on_link("2001:1234::1/128", "external"),
                addr("2001:1234::123/64"),
            ];

            assert_eq!(
                classify(&policy, &observed).unwrap(),
                vec![
                    internal("192.168.0.1"),
                    external("1.2.3.4"),
                    external("2001:1234::1"),
                ]
            );
        }

        #[test]
        fn link_local_on_external_link_is_still_rejected() {
            let policy = PlatformPolicy::new("aws");
            let observed = vec![
                on_link("169.254.169.254/32", "external"),
                on_link("fe80::1/64", "external"),
                on_link("127.0.0.1/8", "external"),
            ];

            assert!(classify(&policy, &observed).unwrap().is_empty());
        }
    }

    mod invariants {
        use super::*;

        #[test]
        fn empty_input_is_empty_output() {
            let policy = PlatformPolicy::new("nocloud");
            assert!(classify(&policy, &[]).unwrap().is_empty());
        }

        #[test]
        fn empty_provided_ip_emits_no_internal() {
            let policy = PlatformPolicy::new("nocloud").with_provided_ip("  ");
            let result = classify(&policy, &[addr("1.2.3.4/24")]).unwrap();
            assert_eq!(result, vec![external("1.2.3.4")]);
        }

        #[test]
        fn unparseable_provided_ip_is_a_validation_error() {
            let policy = PlatformPolicy::new("nocloud").with_provided_ip("not-an-ip");
            let err = classify(&policy, &[]).unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }

        #[test]
        fn output_is_independent_of_input_order() {
            let policy = PlatformPolicy::new("nocloud").with_provided_ip("192.168.0.1");
            let forward = many_public_ips();
            let expected = classify(&policy, &forward).unwrap();

            let mut reversed = forward.clone();
            reversed.reverse();
            assert_eq!(classify(&policy, &reversed).unwrap(), expected);

            for shift in 1..forward.len() {
                let mut rotated = forward.clone();
                rotated.rotate_left(shift);
                assert_eq!(classify(&policy, &rotated).unwrap(), expected);
            }
        }

        #[test]
        fn loopback_and_link_local_are_never_external_on_any_platform() {
            let observed = vec![
                addr("127.0.0.1/8"),
                addr("::1/128"),
                addr("169.254.10.10/16"),
                addr("fe80::e0b5:71ff:fe24:7e60/64"),
            ];
            for platform in ["nocloud", "metal", "gcp", "aws", "azure"] {
                let policy = PlatformPolicy::new(platform);
                let result = classify(&policy, &observed).unwrap();
                assert!(
                    result.iter().all(|a| a.category != AddressCategory::External),
                    "{platform} promoted a loopback or link-local address: {result:?}"
                );
            }
        }

        #[test]
        fn prefer_ipv6_only_swaps_external_order() {
            let observed = vec![addr("1.2.3.4/24"), addr("2001:1234::1/64")];
            let v4_first = classify(&PlatformPolicy::new("metal"), &observed).unwrap();
            let v6_first =
                classify(&PlatformPolicy::new("metal").prefer_ipv6(true), &observed).unwrap();

            assert_eq!(v4_first, vec![external("1.2.3.4"), external("2001:1234::1")]);
            assert_eq!(v6_first, vec![external("2001:1234::1"), external("1.2.3.4")]);
        }

        #[test]
        fn provided_ip_is_never_also_external() {
            let policy = PlatformPolicy::new("metal").with_provided_ip("1.2.3.4");
            let result = classify(&policy, &[addr("1.2.3.4/24")]).unwrap();
            assert_eq!(result, vec![internal("1.2.3.4")]);
        }

        #[test]
        fn ipv4_mapped_ipv6_counts_as_ipv4() {
            let policy = PlatformPolicy::new("metal");
            let result = classify(&policy, &[addr("::ffff:8.8.4.4/128")]).unwrap();
            assert_eq!(result, vec![external("8.8.4.4")]);
        }
    }

    #[test]
    fn converts_to_node_status_entries() {
        let entries = to_node_addresses(&[internal("10.0.0.5"), external("2000::1")]);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].type_, "InternalIP");
        assert_eq!(entries[0].address, "10.0.0.5");
        assert_eq!(entries[1].type_, "ExternalIP");
        assert_eq!(entries[1].address, "2000::1");
    }

    #[test]
    fn observed_addresses_load_from_backend_yaml() {
        let observed: Vec<ObservedAddress> = serde_yaml::from_str(
            "- address: 10.0.0.5/24\n  linkName: eth0\n- address: 2000::1/64\n",
        )
        .unwrap();

        assert_eq!(observed[0], on_link("10.0.0.5/24", "eth0"));
        assert_eq!(observed[1], addr("2000::1/64"));

        let policy = PlatformPolicy::new("metal").with_provided_ip("10.0.0.5");
        assert_eq!(
            classify(&policy, &observed).unwrap(),
            vec![internal("10.0.0.5"), external("2000::1")]
        );
    }
}
