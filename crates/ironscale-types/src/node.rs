//! node type representing a coordinated device.
//!
//! nodes are the core entity in ironscale - every device that registers
//! with the control server becomes one.

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::keys::{DiscoKey, MachineKey, NodeKey};
use crate::user::UserId;

/// unique identifier for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// stable id string used in the client protocol.
    pub fn stable_id(&self) -> String {
        self.0.to_string()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// an ironscale node.
///
/// nodes are either:
/// - **user-owned**: belong to a specific user, no tags
/// - **tagged**: identity defined by tags, not user ownership
///
/// tags are stamped from forced tags or from the registering auth key, and
/// once present they replace user identity at the acl layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// unique identifier.
    pub id: NodeId,

    /// machine key - identifies the physical device.
    pub machine_key: MachineKey,

    /// node key - identifies the current session (can rotate).
    pub node_key: NodeKey,

    /// disco key - used for peer discovery.
    pub disco_key: DiscoKey,

    /// network endpoints where this node can be reached.
    pub endpoints: Vec<SocketAddr>,

    /// host information from the client.
    pub hostinfo: Option<HostInfo>,

    /// ipv4 address assigned from the cgnat pool.
    pub ipv4: Option<IpAddr>,

    /// ipv6 address assigned from the tailnet ula prefix.
    pub ipv6: Option<IpAddr>,

    /// hostname reported by the client during registration.
    pub hostname: String,

    /// dns-safe name for the node, auto-generated or manually set.
    pub given_name: String,

    /// owning user for user-owned nodes. informational for tagged nodes.
    pub user_id: Option<UserId>,

    /// how the node was registered.
    pub register_method: RegisterMethod,

    /// tags defining the node's identity.
    ///
    /// populated from forced tags and from the registering auth key's tag
    /// list. when non-empty, the node is tagged and the tags are its acl
    /// identity.
    pub forced_tags: Vec<String>,

    /// pre-auth key id used to register this node, if any.
    pub auth_key_id: Option<u64>,

    /// whether this node is ephemeral (deleted when its session ends).
    pub ephemeral: bool,

    /// when the node registration expires.
    pub expiry: Option<DateTime<Utc>>,

    /// last time the node contacted the server.
    pub last_seen: Option<DateTime<Utc>>,

    /// when the node was created.
    pub created_at: DateTime<Utc>,

    /// when the node was last updated.
    pub updated_at: DateTime<Utc>,

    /// whether the node is currently online (not persisted).
    #[serde(skip)]
    pub is_online: Option<bool>,
}

impl Node {
    /// whether the node registration has expired.
    pub fn is_expired(&self) -> bool {
        match &self.expiry {
            None => false,
            Some(expiry) => Utc::now() > *expiry,
        }
    }

    /// whether this is a tagged node.
    pub fn is_tagged(&self) -> bool {
        !self.forced_tags.is_empty()
    }

    /// whether the node carries a specific tag (full `tag:` form).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.forced_tags.iter().any(|t| t == tag)
    }

    /// all ip addresses assigned to this node.
    pub fn ips(&self) -> Vec<IpAddr> {
        let mut ips = Vec::with_capacity(2);
        if let Some(ip) = self.ipv4 {
            ips.push(ip);
        }
        if let Some(ip) = self.ipv6 {
            ips.push(ip);
        }
        ips
    }

    /// routes the node is currently announcing via hostinfo.
    pub fn announced_routes(&self) -> &[IpNet] {
        self.hostinfo
            .as_ref()
            .map(|h| h.routable_ips.as_slice())
            .unwrap_or(&[])
    }
}

/// host information reported by the client.
///
/// field names match the upstream go struct (pascalcase on the wire).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostInfo {
    /// client version (e.g. "1.80.0").
    #[serde(rename = "IPNVersion", default, skip_serializing_if = "Option::is_none")]
    pub ipn_version: Option<String>,

    /// operating system (e.g. "linux", "windows", "darwin").
    #[serde(rename = "OS", default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    /// os version.
    #[serde(rename = "OSVersion", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// linux distribution, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro: Option<String>,

    /// distribution version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro_version: Option<String>,

    /// device model (e.g. "pixel 3a").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,

    /// hostname of the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// whether the host blocks incoming connections.
    #[serde(default)]
    pub shields_up: bool,

    /// routes this node wants to advertise.
    #[serde(rename = "RoutableIPs", default, skip_serializing_if = "Vec::is_empty")]
    pub routable_ips: Vec<IpNet>,

    /// tags the node is requesting (granted only via policy tag owners).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_tags: Vec<String>,

    /// network information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_info: Option<NetInfo>,

    /// ssh host keys, when the node runs the ssh server.
    #[serde(rename = "sshHostKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_host_keys: Vec<String>,
}

/// network information for a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetInfo {
    /// preferred derp region.
    #[serde(rename = "PreferredDERP", default)]
    pub preferred_derp: i32,

    /// latency to each derp region in seconds.
    #[serde(rename = "DERPLatency", default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub derp_latency: std::collections::HashMap<String, f64>,
}

/// how a node was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegisterMethod {
    /// registered via pre-authentication key.
    #[default]
    AuthKey,
    /// registered via interactive oidc login.
    Oidc,
    /// registered via cli.
    Cli,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestNodeBuilder;

    #[test]
    fn hostinfo_deserializes_upstream_format() {
        let json = r#"{
            "OS": "linux",
            "OSVersion": "6.18.4",
            "IPNVersion": "1.80.0",
            "RoutableIPs": ["192.168.1.0/24", "10.0.0.0/8"],
            "RequestTags": ["tag:server"],
            "NetInfo": {
                "PreferredDERP": 1,
                "DERPLatency": {"1": 0.025}
            },
            "Hostname": "test-node"
        }"#;

        let hostinfo: HostInfo = serde_json::from_str(json).expect("should deserialize");
        assert_eq!(hostinfo.os, Some("linux".to_string()));
        assert_eq!(hostinfo.routable_ips.len(), 2);
        assert_eq!(hostinfo.request_tags, vec!["tag:server".to_string()]);
        assert_eq!(hostinfo.net_info.unwrap().preferred_derp, 1);
    }

    #[test]
    fn node_ips() {
        let node = TestNodeBuilder::new(1)
            .with_ipv6("fd7a:115c:a1e0::1".parse().unwrap())
            .build();
        assert_eq!(node.ips().len(), 2);
    }

    #[test]
    fn node_is_tagged() {
        let mut node = TestNodeBuilder::new(1).build();
        assert!(!node.is_tagged());

        node.forced_tags = vec!["tag:server".to_string()];
        assert!(node.is_tagged());
        assert!(node.has_tag("tag:server"));
        assert!(!node.has_tag("tag:db"));
    }

    #[test]
    fn node_expiry() {
        let mut node = TestNodeBuilder::new(1).build();
        assert!(!node.is_expired());

        node.expiry = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(node.is_expired());

        node.expiry = Some(Utc::now() + chrono::Duration::hours(1));
        assert!(!node.is_expired());
    }

    #[test]
    fn announced_routes_come_from_hostinfo() {
        let node = TestNodeBuilder::new(1)
            .with_routable_ips(vec!["10.33.0.0/16".parse().unwrap()])
            .build();
        assert_eq!(node.announced_routes().len(), 1);
    }
}
