//! map response generation.
//!
//! given a target node and a change, builds the map response the node
//! should receive: a full map for policy/full changes, field-level
//! patches for presence transitions, peer objects for batched mutations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use ironscale_db::{Database, IronscaleDb};
use ironscale_policy::PolicyEngine;
use ironscale_proto::{
    CapabilityVersion, DerpMap, DnsConfig, DnsResolver, MapResponse, MapResponseNode, PeerChange,
    UserProfile,
};
use ironscale_types::{Change, ChangeSet, Config, Node, NodeId, Route, UserId};

/// errors from map generation.
#[derive(Debug, Error)]
pub enum MapperError {
    /// the target node does not exist.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// the repository failed.
    #[error(transparent)]
    Database(#[from] ironscale_db::Error),

    /// policy compilation failed.
    #[error(transparent)]
    Policy(#[from] ironscale_policy::Error),
}

/// builds map responses from the authoritative view.
#[derive(Clone)]
pub struct Mapper {
    db: IronscaleDb,
    policy: Arc<RwLock<PolicyEngine>>,
    derp_map: Arc<RwLock<DerpMap>>,
    config: Arc<Config>,
}

impl Mapper {
    /// create a mapper over the shared state.
    pub fn new(
        db: IronscaleDb,
        policy: Arc<RwLock<PolicyEngine>>,
        derp_map: Arc<RwLock<DerpMap>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            policy,
            derp_map,
            config,
        }
    }

    /// build the response for `target` observing `change`.
    ///
    /// `online` is the batcher's current connection snapshot. returns
    /// `Ok(None)` when the change is a no-op for this target.
    pub async fn generate(
        &self,
        target: NodeId,
        change: &ChangeSet,
        _version: CapabilityVersion,
        online: &HashMap<NodeId, bool>,
    ) -> Result<Option<MapResponse>, MapperError> {
        match change.change {
            Change::Full | Change::Policy | Change::NodeAdded => {
                self.full_response(target, online, false).await.map(Some)
            }
            Change::SelfUpdate => self.full_response(target, online, true).await.map(Some),
            Change::NodeCameOnline => Ok(Some(online_patch(change.node_id, true))),
            Change::NodeWentOffline => Ok(Some(online_patch(change.node_id, false))),
            Change::NodeRemove => Ok(Some(MapResponse {
                peers_removed: vec![change.node_id.0],
                ..Default::default()
            })),
            Change::KeyExpiry => self.key_expiry_patch(change.node_id).await,
            Change::PeerChanged => self.peer_changed(target, change.node_id, online).await,
        }
    }

    /// full map: self node, visible peers, packet filter, ssh policy,
    /// dns, derp, user profiles. `self_only` omits the peer view.
    async fn full_response(
        &self,
        target: NodeId,
        online: &HashMap<NodeId, bool>,
        self_only: bool,
    ) -> Result<MapResponse, MapperError> {
        let node = self
            .db
            .get_node(target)
            .await?
            .ok_or(MapperError::NodeNotFound(target))?;

        let all_routes = self.db.get_routes().await?;
        let routes_by_node = group_routes(&all_routes);

        let derp_map = self.derp_map.read().await.clone();
        let home_derp = home_derp_for(&node, &derp_map);

        // the node making the request is online by definition
        let self_node = self.render_node(&node, &routes_by_node, home_derp, Some(true));

        if self_only {
            return Ok(MapResponse {
                node: Some(self_node),
                dns_config: Some(self.dns_config()),
                derp_map: Some(derp_map),
                control_time: Some(chrono::Utc::now().to_rfc3339()),
                ..Default::default()
            });
        }

        let nodes = self.db.list_nodes().await?;
        let users = self.db.list_users().await?;
        let engine = self.policy.read().await.clone();

        let visible = engine.visible_peers(&node, &nodes, &users)?;

        let node_routes = enabled_prefixes(routes_by_node.get(&node.id));
        let packet_filter = engine.filter_for_node(&users, &node, &nodes, &node_routes)?;
        let ssh_policy = engine.ssh_policy_for_node(&users, &node, &nodes)?;

        let peers: Vec<MapResponseNode> = visible
            .iter()
            .map(|peer| {
                let peer_online = online.get(&peer.id).copied();
                self.render_node(peer, &routes_by_node, home_derp, peer_online)
            })
            .collect();

        // profiles for the users of everything in view
        let mut visible_users: HashSet<UserId> =
            visible.iter().filter_map(|n| n.user_id).collect();
        if let Some(uid) = node.user_id {
            visible_users.insert(uid);
        }
        let user_profiles: Vec<UserProfile> = users
            .iter()
            .filter(|u| visible_users.contains(&u.id))
            .map(|u| UserProfile {
                id: u.id.0,
                login_name: u.username(),
                display_name: u.display(),
                profile_pic_url: u.profile_pic_url.clone(),
            })
            .collect();

        Ok(MapResponse {
            node: Some(self_node),
            peers,
            dns_config: Some(self.dns_config()),
            derp_map: Some(derp_map),
            packet_filter,
            ssh_policy,
            user_profiles,
            control_time: Some(chrono::Utc::now().to_rfc3339()),
            ..Default::default()
        })
    }

    async fn key_expiry_patch(&self, changed: NodeId) -> Result<Option<MapResponse>, MapperError> {
        let Some(node) = self.db.get_node(changed).await? else {
            return Ok(None);
        };
        Ok(Some(MapResponse {
            peers_changed_patch: vec![PeerChange {
                node_id: changed.0,
                key_expiry: node.expiry.map(|e| e.to_rfc3339()),
                ..Default::default()
            }],
            ..Default::default()
        }))
    }

    /// a changed peer, rendered in full - but only when the target is
    /// allowed to see it.
    async fn peer_changed(
        &self,
        target: NodeId,
        changed: NodeId,
        online: &HashMap<NodeId, bool>,
    ) -> Result<Option<MapResponse>, MapperError> {
        if target == changed {
            return self.full_response(target, online, true).await.map(Some);
        }

        let node = self
            .db
            .get_node(target)
            .await?
            .ok_or(MapperError::NodeNotFound(target))?;
        let Some(peer) = self.db.get_node(changed).await? else {
            return Ok(None);
        };

        let nodes = self.db.list_nodes().await?;
        let users = self.db.list_users().await?;
        let engine = self.policy.read().await.clone();
        let visible = engine.visible_peers(&node, &nodes, &users)?;
        if !visible.iter().any(|n| n.id == changed) {
            return Ok(None);
        }

        let all_routes = self.db.get_routes().await?;
        let routes_by_node = group_routes(&all_routes);
        let derp_map = self.derp_map.read().await;
        let home_derp = home_derp_for(&peer, &derp_map);

        let peer_online = online.get(&changed).copied();
        let rendered = self.render_node(&peer, &routes_by_node, home_derp, peer_online);

        Ok(Some(MapResponse {
            peers_changed: vec![rendered],
            ..Default::default()
        }))
    }

    /// render one node for the wire.
    fn render_node(
        &self,
        node: &Node,
        routes_by_node: &HashMap<NodeId, Vec<&Route>>,
        home_derp: i32,
        online: Option<bool>,
    ) -> MapResponseNode {
        let mut addresses = Vec::with_capacity(2);
        if let Some(ip) = node.ipv4 {
            addresses.push(host_cidr(ip));
        }
        if let Some(ip) = node.ipv6 {
            addresses.push(host_cidr(ip));
        }

        let node_routes = routes_by_node.get(&node.id);
        let mut allowed_ips = addresses.clone();
        for prefix in enabled_prefixes(node_routes) {
            allowed_ips.push(prefix.to_string());
        }

        let primary_routes: Vec<String> = node_routes
            .map(|routes| {
                routes
                    .iter()
                    .filter(|r| r.advertised && r.enabled && r.is_primary)
                    .map(|r| r.prefix.to_string())
                    .collect()
            })
            .unwrap_or_default();

        MapResponseNode {
            id: node.id.0,
            stable_id: node.id.stable_id(),
            name: format!("{}.{}.", node.given_name, self.config.base_domain),
            user: node.user_id.unwrap_or(UserId::TAGGED_DEVICES).0,
            key: node.node_key.clone(),
            key_expiry: node.expiry.map(|e| e.to_rfc3339()),
            machine: node.machine_key.clone(),
            disco_key: node.disco_key.clone(),
            addresses,
            allowed_ips,
            endpoints: node.endpoints.iter().map(|e| e.to_string()).collect(),
            home_derp,
            // hostinfo always present so clients never dereference nil
            hostinfo: Some(node.hostinfo.clone().unwrap_or_default()),
            online,
            tags: node.forced_tags.clone(),
            primary_routes,
            machine_authorized: true,
            expired: node.is_expired(),
        }
    }

    fn dns_config(&self) -> DnsConfig {
        DnsConfig {
            resolvers: self
                .config
                .dns
                .nameservers
                .iter()
                .map(|addr| DnsResolver { addr: addr.clone() })
                .collect(),
            domains: {
                let mut domains = vec![self.config.base_domain.clone()];
                domains.extend(self.config.dns.search_domains.iter().cloned());
                domains
            },
            proxied: self.config.dns.magic_dns,
        }
    }
}

fn online_patch(node_id: NodeId, online: bool) -> MapResponse {
    MapResponse {
        peers_changed_patch: vec![PeerChange {
            node_id: node_id.0,
            online: Some(online),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn group_routes(routes: &[Route]) -> HashMap<NodeId, Vec<&Route>> {
    let mut map: HashMap<NodeId, Vec<&Route>> = HashMap::new();
    for route in routes {
        map.entry(route.node_id).or_default().push(route);
    }
    map
}

fn enabled_prefixes(routes: Option<&Vec<&Route>>) -> Vec<ipnet::IpNet> {
    routes
        .map(|routes| {
            routes
                .iter()
                .filter(|r| r.advertised && r.enabled)
                .map(|r| r.prefix)
                .collect()
        })
        .unwrap_or_default()
}

fn host_cidr(ip: std::net::IpAddr) -> String {
    match ip {
        std::net::IpAddr::V4(v4) => ipnet::Ipv4Net::from(v4).to_string(),
        std::net::IpAddr::V6(v6) => ipnet::Ipv6Net::from(v6).to_string(),
    }
}

/// the node's home derp region: its reported preference when valid,
/// otherwise the lowest configured region.
fn home_derp_for(node: &Node, derp_map: &DerpMap) -> i32 {
    let preferred = node
        .hostinfo
        .as_ref()
        .and_then(|h| h.net_info.as_ref())
        .map(|ni| ni.preferred_derp)
        .unwrap_or(0);

    if preferred != 0 && derp_map.regions.contains_key(&preferred) {
        return preferred;
    }
    derp_map.regions.keys().min().copied().unwrap_or(1)
}
