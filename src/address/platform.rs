//! Platform policy for external address promotion

use serde::{Deserialize, Serialize};

/// Link name managed-cloud platforms use for addresses they know are public
pub const EXTERNAL_LINK_NAME: &str = "external";

/// Platforms where the node owns its network configuration and no cloud
/// API reports public addresses
const SELF_MANAGED_PLATFORMS: &[&str] = &[
    "nocloud",
    "metal",
    "openstack",
    "oracle",
    "vmware",
    "upcloud",
    "equinixMetal",
    "hcloud",
    "vultr",
    "cloudstack",
];

/// How a platform decides which observed addresses are externally reachable
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlatformKind {
    /// Any publicly routable address on a regular interface is external
    SelfManaged,
    /// Only addresses reported on the `external` link are external
    ManagedCloud,
}

impl PlatformKind {
    /// Classify a platform identifier
    pub fn of(platform: &str) -> Self {
        if SELF_MANAGED_PLATFORMS.contains(&platform) {
            Self::SelfManaged
        } else {
            Self::ManagedCloud
        }
    }
}

/// Inputs that steer address classification for one node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformPolicy {
    /// Platform identifier reported by the metadata backend
    pub platform: String,
    /// Order IPv6 external addresses first
    #[serde(rename = "preferIPv6")]
    pub prefer_ipv6: bool,
    /// Node IP supplied by the kubelet, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provided_ip: Option<String>,
}

impl PlatformPolicy {
    /// Create a policy for a platform
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            ..Default::default()
        }
    }

    /// Set the kubelet-provided node IP
    pub fn with_provided_ip(mut self, ip: impl Into<String>) -> Self {
        self.provided_ip = Some(ip.into());
        self
    }

    /// Prefer IPv6 external addresses
    pub fn prefer_ipv6(mut self, prefer: bool) -> Self {
        self.prefer_ipv6 = prefer;
        self
    }

    /// Platform kind derived from the identifier
    pub fn kind(&self) -> PlatformKind {
        PlatformKind::of(&self.platform)
    }
}
