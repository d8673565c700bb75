//! test helpers shared across the workspace.

use std::net::IpAddr;

use chrono::Utc;
use ipnet::IpNet;

use crate::keys::{DiscoKey, MachineKey, NodeKey};
use crate::node::{HostInfo, Node, NodeId, RegisterMethod};
use crate::user::UserId;

/// builder for nodes in tests.
///
/// defaults: keys filled with the id byte, ipv4 `100.64.0.<id>`, owned by
/// `UserId(<id>)`, hostname `node-<id>`.
pub struct TestNodeBuilder {
    node: Node,
}

impl TestNodeBuilder {
    /// start a builder for node `id`.
    pub fn new(id: u64) -> Self {
        let now = Utc::now();
        let node = Node {
            id: NodeId(id),
            machine_key: MachineKey::from_bytes(vec![id as u8; 32]),
            node_key: NodeKey::from_bytes(vec![id as u8; 32]),
            disco_key: DiscoKey::from_bytes(vec![id as u8; 32]),
            endpoints: vec![],
            hostinfo: None,
            ipv4: Some(format!("100.64.0.{}", id % 250 + 1).parse().unwrap()),
            ipv6: None,
            hostname: format!("node-{id}"),
            given_name: format!("node-{id}"),
            user_id: Some(UserId(id)),
            register_method: RegisterMethod::AuthKey,
            forced_tags: vec![],
            auth_key_id: None,
            ephemeral: false,
            expiry: None,
            last_seen: Some(now),
            created_at: now,
            updated_at: now,
            is_online: None,
        };
        Self { node }
    }

    /// set the hostname and given name.
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.node.hostname = hostname.to_string();
        self.node.given_name = hostname.to_string();
        self
    }

    /// set the owning user.
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.node.user_id = Some(user_id);
        self
    }

    /// set the node's tags (making it a tagged node).
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        if !tags.is_empty() {
            self.node.user_id = None;
        }
        self.node.forced_tags = tags;
        self
    }

    /// set the ipv4 address.
    pub fn with_ipv4(mut self, ip: IpAddr) -> Self {
        self.node.ipv4 = Some(ip);
        self
    }

    /// set the ipv6 address.
    pub fn with_ipv6(mut self, ip: IpAddr) -> Self {
        self.node.ipv6 = Some(ip);
        self
    }

    /// advertise routes via hostinfo.
    pub fn with_routable_ips(mut self, routes: Vec<IpNet>) -> Self {
        let hostinfo = self.node.hostinfo.get_or_insert_with(HostInfo::default);
        hostinfo.routable_ips = routes;
        self
    }

    /// finish building.
    pub fn build(self) -> Node {
        self.node
    }
}
