//! maprequest and mapresponse wire types.
//!
//! field names and json tags follow the upstream client structs; the
//! shapes here are the wire contract and must not drift.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use ironscale_types::{DiscoKey, HostInfo, MachineKey, NodeKey};

use crate::CapabilityVersion;

/// a map request from a client.
///
/// sent once for a read-only poll, or with `stream: true` to open the
/// long-poll update channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapRequest {
    /// client capability version.
    pub version: CapabilityVersion,

    /// client's current node key.
    pub node_key: NodeKey,

    /// client's disco key.
    #[serde(default, skip_serializing_if = "DiscoKey::is_empty")]
    pub disco_key: DiscoKey,

    /// client's current endpoints.
    #[serde(default)]
    pub endpoints: Vec<SocketAddr>,

    /// client host information.
    #[serde(default)]
    pub hostinfo: Option<HostInfo>,

    /// omit peers in the response (lightweight state report).
    #[serde(default)]
    pub omit_peers: bool,

    /// keep the connection open and stream updates.
    #[serde(default)]
    pub stream: bool,

    /// the request only reads the map; endpoint/hostinfo fields are ignored.
    #[serde(default)]
    pub read_only: bool,

    /// requested response compression ("zstd" or empty).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<String>,
}

/// a map response pushed to clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapResponse {
    /// true for keep-alive pings that carry no state.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub keep_alive: bool,

    /// the receiving node's own view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<MapResponseNode>,

    /// full peer list (only on full responses).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<MapResponseNode>,

    /// peers that changed structurally; full node objects.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers_changed: Vec<MapResponseNode>,

    /// ids of peers removed from the tailnet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers_removed: Vec<u64>,

    /// lightweight field-level peer patches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers_changed_patch: Vec<PeerChange>,

    /// online-state transitions keyed by node id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub online_change: HashMap<u64, bool>,

    /// dns configuration.
    #[serde(rename = "DNSConfig", default, skip_serializing_if = "Option::is_none")]
    pub dns_config: Option<DnsConfig>,

    /// derp relay map.
    #[serde(rename = "DERPMap", default, skip_serializing_if = "Option::is_none")]
    pub derp_map: Option<DerpMap>,

    /// packet filter rules for the receiving node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packet_filter: Vec<FilterRule>,

    /// ssh policy for the receiving node.
    #[serde(rename = "SSHPolicy", default, skip_serializing_if = "Option::is_none")]
    pub ssh_policy: Option<crate::SshPolicy>,

    /// user profiles for client display.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_profiles: Vec<UserProfile>,

    /// server time at generation (rfc3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_time: Option<String>,
}

impl MapResponse {
    /// an empty keep-alive ping.
    pub fn keepalive() -> Self {
        Self {
            keep_alive: true,
            ..Default::default()
        }
    }
}

/// a node as rendered in a map response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapResponseNode {
    /// numeric node id.
    #[serde(rename = "ID")]
    pub id: u64,

    /// stable string id.
    #[serde(rename = "StableID")]
    pub stable_id: String,

    /// magicdns name.
    pub name: String,

    /// owning user id (sentinel for tagged nodes).
    pub user: u64,

    /// current node key.
    pub key: NodeKey,

    /// node key expiry (rfc3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_expiry: Option<String>,

    /// machine key.
    pub machine: MachineKey,

    /// disco key.
    #[serde(default, skip_serializing_if = "DiscoKey::is_empty")]
    pub disco_key: DiscoKey,

    /// assigned addresses in cidr notation.
    pub addresses: Vec<String>,

    /// addresses plus enabled routes.
    #[serde(rename = "AllowedIPs")]
    pub allowed_ips: Vec<String>,

    /// known endpoints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,

    /// home derp region.
    #[serde(rename = "HomeDERP", default)]
    pub home_derp: i32,

    /// host information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostinfo: Option<HostInfo>,

    /// online state as tracked by the batcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,

    /// tags defining a tagged node's identity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// prefixes this node is the current primary for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_routes: Vec<String>,

    /// whether the machine has been authorized by the control server.
    pub machine_authorized: bool,

    /// whether the node's key has expired.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub expired: bool,
}

/// a lightweight field-level patch for one peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerChange {
    /// which peer this patch applies to.
    #[serde(rename = "NodeID")]
    pub node_id: u64,

    /// new derp region, if changed.
    #[serde(rename = "DERPRegion", default, skip_serializing_if = "Option::is_none")]
    pub derp_region: Option<i32>,

    /// new endpoints, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<String>>,

    /// new node key, if rotated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<NodeKey>,

    /// new key expiry, if changed (rfc3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_expiry: Option<String>,

    /// new online state, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
}

/// a compiled packet filter rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// source prefixes allowed by this rule.
    #[serde(rename = "SrcIPs")]
    pub src_ips: Vec<String>,

    /// destination ip/port pairs.
    #[serde(rename = "DstPorts")]
    pub dst_ports: Vec<NetPortRange>,

    /// allowed ip protocols. empty means the implied default set
    /// (icmp4, icmp6, tcp, udp), which is omitted on the wire.
    #[serde(rename = "IPProto", default, skip_serializing_if = "Vec::is_empty")]
    pub ip_proto: Vec<i32>,
}

/// a destination ip with a port range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetPortRange {
    /// destination prefix, or "*" for any.
    #[serde(rename = "IP")]
    pub ip: String,

    /// allowed port range.
    #[serde(rename = "Ports")]
    pub ports: PortRange,
}

/// an inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// first allowed port.
    #[serde(rename = "First")]
    pub first: u16,

    /// last allowed port.
    #[serde(rename = "Last")]
    pub last: u16,
}

impl PortRange {
    /// the wildcard range covering all ports.
    pub const ANY: PortRange = PortRange { first: 0, last: 65535 };

    /// a range covering exactly one port.
    pub fn single(port: u16) -> Self {
        Self { first: port, last: port }
    }
}

/// dns configuration for clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DnsConfig {
    /// resolvers to use.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolvers: Vec<DnsResolver>,

    /// search domains.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,

    /// whether magicdns proxying is enabled.
    #[serde(default)]
    pub proxied: bool,
}

/// a dns resolver address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsResolver {
    /// resolver address (ip or doh url).
    #[serde(rename = "Addr")]
    pub addr: String,
}

/// derp map for relay servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DerpMap {
    /// derp regions by id.
    pub regions: HashMap<i32, DerpRegion>,
}

/// a derp region.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DerpRegion {
    /// region id.
    #[serde(rename = "RegionID")]
    pub region_id: i32,

    /// short region code (e.g. "nyc").
    pub region_code: String,

    /// human-readable region name.
    pub region_name: String,

    /// derp nodes in this region.
    pub nodes: Vec<DerpNode>,
}

/// a single derp relay server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DerpNode {
    /// node name.
    pub name: String,

    /// region this node belongs to.
    #[serde(rename = "RegionID")]
    pub region_id: i32,

    /// dns name of the relay.
    pub host_name: String,

    /// ipv4 address override.
    #[serde(rename = "IPv4", default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,

    /// ipv6 address override.
    #[serde(rename = "IPv6", default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,

    /// stun port (0 means 3478).
    #[serde(rename = "STUNPort", default)]
    pub stun_port: i32,

    /// whether the node only serves stun.
    #[serde(rename = "STUNOnly", default)]
    pub stun_only: bool,

    /// derp port (0 means 443).
    #[serde(rename = "DERPPort", default)]
    pub derp_port: i32,
}

/// a user profile for client display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserProfile {
    /// user id.
    #[serde(rename = "ID")]
    pub id: u64,

    /// login name.
    pub login_name: String,

    /// display name.
    pub display_name: String,

    /// profile picture url.
    #[serde(rename = "ProfilePicURL", default, skip_serializing_if = "Option::is_none")]
    pub profile_pic_url: Option<String>,
}
