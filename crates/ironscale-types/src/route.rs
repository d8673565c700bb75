//! route entity for subnet routing and exit nodes.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// the ipv4 exit route.
pub const EXIT_ROUTE_V4: &str = "0.0.0.0/0";

/// the ipv6 exit route.
pub const EXIT_ROUTE_V6: &str = "::/0";

/// unique identifier for a route row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteId(pub u64);

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// a route advertised by a node.
///
/// `advertised` tracks what the node announces via hostinfo; `enabled` is
/// the admin/auto-approver decision; `is_primary` marks the node currently
/// serving the prefix. exit routes are enabled as a v4/v6 pair and are
/// never primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// unique identifier.
    pub id: RouteId,

    /// the node advertising this route.
    pub node_id: NodeId,

    /// the route prefix.
    pub prefix: IpNet,

    /// whether the node currently announces this prefix.
    pub advertised: bool,

    /// whether the prefix is approved for distribution to peers.
    pub enabled: bool,

    /// whether this node is the current primary for the prefix.
    pub is_primary: bool,
}

impl Route {
    /// whether this is an exit route (0.0.0.0/0 or ::/0).
    pub fn is_exit_route(&self) -> bool {
        is_exit_route(&self.prefix)
    }
}

/// check if a prefix is an exit route.
pub fn is_exit_route(prefix: &IpNet) -> bool {
    prefix.prefix_len() == 0
}
