//! route manager.
//!
//! tracks advertised/enabled/primary state for subnet and exit routes and
//! runs primary failover when the serving node disappears. multi-row
//! updates (the exit pair, primary handover) run inside one transaction
//! so peers never observe a half-applied state.

use std::collections::HashMap;

use ipnet::IpNet;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use tracing::{debug, info};

use ironscale_types::{EXIT_ROUTE_V4, EXIT_ROUTE_V6, NodeId, Route, RouteId, is_exit_route};

use crate::entity::route;
use crate::{Error, IronscaleDb, Result};

/// map of node id to live connection state, supplied by the batcher.
pub type NodeConnectedMap = HashMap<NodeId, bool>;

impl IronscaleDb {
    /// all routes.
    pub async fn get_routes(&self) -> Result<Vec<Route>> {
        let models = route::Entity::find().all(self.conn()).await?;
        models.into_iter().map(Route::try_from).collect()
    }

    /// all routes advertised by one node.
    pub async fn get_node_routes(&self, node_id: NodeId) -> Result<Vec<Route>> {
        let models = route::Entity::find()
            .filter(route::Column::NodeId.eq(node_id.0 as i64))
            .all(self.conn())
            .await?;
        models.into_iter().map(Route::try_from).collect()
    }

    /// routes a node currently serves: advertised, enabled prefixes.
    pub async fn enabled_routes_for_node(&self, node_id: NodeId) -> Result<Vec<IpNet>> {
        Ok(self
            .get_node_routes(node_id)
            .await?
            .into_iter()
            .filter(|r| r.advertised && r.enabled)
            .map(|r| r.prefix)
            .collect())
    }

    /// prefixes this node is the current primary for.
    ///
    /// exit routes are never primary and never appear here.
    pub async fn primary_routes_for_node(&self, node_id: NodeId) -> Result<Vec<IpNet>> {
        Ok(self
            .get_node_routes(node_id)
            .await?
            .into_iter()
            .filter(|r| r.advertised && r.enabled && r.is_primary)
            .map(|r| r.prefix)
            .collect())
    }

    /// sync the route table with a node's announced routes.
    ///
    /// newly announced prefixes are created (advertised, not enabled);
    /// prefixes no longer announced are marked unadvertised and disabled.
    /// returns true when peers should be updated, i.e. when a previously
    /// enabled route reappeared or disappeared.
    pub async fn save_node_routes(&self, node_id: NodeId, announced: &[IpNet]) -> Result<bool> {
        let txn = self.conn().begin().await?;
        let mut send_update = false;

        let current = route::Entity::find()
            .filter(route::Column::NodeId.eq(node_id.0 as i64))
            .all(&txn)
            .await?;

        let mut seen: HashMap<String, bool> =
            announced.iter().map(|p| (p.to_string(), false)).collect();

        for model in current {
            if let Some(found) = seen.get_mut(&model.prefix) {
                *found = true;
                if !model.advertised {
                    let was_enabled = model.enabled;
                    let mut am: route::ActiveModel = model.into();
                    am.advertised = Set(true);
                    am.update(&txn).await?;
                    if was_enabled {
                        send_update = true;
                    }
                }
            } else if model.advertised {
                let was_enabled = model.enabled;
                let mut am: route::ActiveModel = model.into();
                am.advertised = Set(false);
                am.enabled = Set(false);
                am.is_primary = Set(false);
                am.update(&txn).await?;
                if was_enabled {
                    send_update = true;
                }
            }
        }

        for (prefix, found) in seen {
            if !found {
                route::ActiveModel {
                    node_id: Set(node_id.0 as i64),
                    prefix: Set(prefix),
                    advertised: Set(true),
                    enabled: Set(false),
                    is_primary: Set(false),
                    ..Default::default()
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        Ok(send_update)
    }

    /// enable a route by id.
    ///
    /// exit routes are enabled as an ipv4/ipv6 pair in one transaction and
    /// never become primary. a non-exit route becomes primary when the
    /// prefix has no primary yet. returns the nodes whose peers changed.
    pub async fn enable_route(&self, id: RouteId) -> Result<Vec<NodeId>> {
        let txn = self.conn().begin().await?;

        let model = route::Entity::find_by_id(id.0 as i64)
            .one(&txn)
            .await?
            .ok_or_else(|| Error::NotFound(format!("route {id}")))?;
        let target = Route::try_from(model)?;

        if target.is_exit_route() {
            enable_exit_pair(&txn, target.node_id).await?;
        } else {
            let has_primary = !route::Entity::find()
                .filter(route::Column::Prefix.eq(target.prefix.to_string()))
                .filter(route::Column::Enabled.eq(true))
                .filter(route::Column::IsPrimary.eq(true))
                .all(&txn)
                .await?
                .is_empty();

            let mut am = route::ActiveModel {
                id: Set(target.id.0 as i64),
                ..Default::default()
            };
            am.enabled = Set(true);
            am.is_primary = Set(!has_primary);
            am.update(&txn).await?;
        }

        txn.commit().await?;
        Ok(vec![target.node_id])
    }

    /// enable a node's advertised routes matching the given prefixes.
    ///
    /// used by the auto-approver path at registration and hostinfo
    /// refresh. exit prefixes expand to the full pair.
    pub async fn enable_approved_routes(
        &self,
        node_id: NodeId,
        approved: &[IpNet],
    ) -> Result<bool> {
        if approved.is_empty() {
            return Ok(false);
        }

        let txn = self.conn().begin().await?;
        let mut changed = false;

        let has_exit = approved.iter().any(is_exit_route);
        if has_exit {
            changed |= enable_exit_pair(&txn, node_id).await?;
        }

        for prefix in approved.iter().filter(|p| !is_exit_route(p)) {
            let models = route::Entity::find()
                .filter(route::Column::NodeId.eq(node_id.0 as i64))
                .filter(route::Column::Prefix.eq(prefix.to_string()))
                .filter(route::Column::Enabled.eq(false))
                .all(&txn)
                .await?;

            for model in models {
                let has_primary = !route::Entity::find()
                    .filter(route::Column::Prefix.eq(model.prefix.clone()))
                    .filter(route::Column::Enabled.eq(true))
                    .filter(route::Column::IsPrimary.eq(true))
                    .all(&txn)
                    .await?
                    .is_empty();

                let mut am: route::ActiveModel = model.into();
                am.enabled = Set(true);
                am.is_primary = Set(!has_primary);
                am.update(&txn).await?;
                changed = true;
            }
        }

        txn.commit().await?;
        if changed {
            info!(node_id = %node_id, routes = ?approved, "auto-approved routes enabled");
        }
        Ok(changed)
    }

    /// disable a route by id, failing over the primary when needed.
    pub async fn disable_route(
        &self,
        id: RouteId,
        is_connected: &NodeConnectedMap,
    ) -> Result<Vec<NodeId>> {
        let txn = self.conn().begin().await?;

        let model = route::Entity::find_by_id(id.0 as i64)
            .one(&txn)
            .await?
            .ok_or_else(|| Error::NotFound(format!("route {id}")))?;
        let target = Route::try_from(model)?;

        let mut changed: Vec<NodeId> = Vec::new();

        if target.is_exit_route() {
            disable_exit_pair(&txn, target.node_id).await?;
        } else {
            let mut am = route::ActiveModel {
                id: Set(target.id.0 as i64),
                ..Default::default()
            };
            am.enabled = Set(false);
            am.is_primary = Set(false);
            am.update(&txn).await?;

            changed = failover_in_txn(&txn, is_connected, &target).await?;
        }

        txn.commit().await?;

        if changed.is_empty() {
            changed = vec![target.node_id];
        }
        Ok(changed)
    }

    /// drop all routes of a node (node deletion cascade), failing over any
    /// primaries it held.
    pub async fn delete_node_routes(
        &self,
        node_id: NodeId,
        is_connected: &NodeConnectedMap,
    ) -> Result<Vec<NodeId>> {
        let txn = self.conn().begin().await?;
        let routes = route::Entity::find()
            .filter(route::Column::NodeId.eq(node_id.0 as i64))
            .all(&txn)
            .await?;

        let mut changed = Vec::new();
        for model in routes {
            let r = Route::try_from(model)?;
            route::Entity::delete_by_id(r.id.0 as i64).exec(&txn).await?;
            changed.extend(failover_in_txn(&txn, is_connected, &r).await?);
        }

        txn.commit().await?;
        Ok(changed)
    }

    /// fail over any primaries held by a node that lost connectivity.
    ///
    /// returns the nodes on both ends of each handover so the caller can
    /// emit peer-changed events for them.
    pub async fn failover_node_routes(
        &self,
        node_id: NodeId,
        is_connected: &NodeConnectedMap,
    ) -> Result<Vec<NodeId>> {
        let txn = self.conn().begin().await?;

        let routes = route::Entity::find()
            .filter(route::Column::NodeId.eq(node_id.0 as i64))
            .filter(route::Column::IsPrimary.eq(true))
            .all(&txn)
            .await?;

        let mut changed = Vec::new();
        for model in routes {
            let r = Route::try_from(model)?;
            if is_connected.get(&r.node_id).copied().unwrap_or(false) {
                continue;
            }
            changed.extend(failover_in_txn(&txn, is_connected, &r).await?);
        }

        txn.commit().await?;
        Ok(changed)
    }
}

/// enable both exit routes of a node together. returns whether anything
/// actually flipped.
async fn enable_exit_pair<C: ConnectionTrait>(conn: &C, node_id: NodeId) -> Result<bool> {
    let models = route::Entity::find()
        .filter(route::Column::NodeId.eq(node_id.0 as i64))
        .filter(
            route::Column::Prefix
                .eq(EXIT_ROUTE_V4)
                .or(route::Column::Prefix.eq(EXIT_ROUTE_V6)),
        )
        .all(conn)
        .await?;

    let mut changed = false;
    for model in models {
        if !model.enabled {
            let mut am: route::ActiveModel = model.into();
            am.enabled = Set(true);
            am.is_primary = Set(false);
            am.update(conn).await?;
            changed = true;
        }
    }
    Ok(changed)
}

/// disable both exit routes of a node together.
async fn disable_exit_pair<C: ConnectionTrait>(conn: &C, node_id: NodeId) -> Result<()> {
    let models = route::Entity::find()
        .filter(route::Column::NodeId.eq(node_id.0 as i64))
        .filter(
            route::Column::Prefix
                .eq(EXIT_ROUTE_V4)
                .or(route::Column::Prefix.eq(EXIT_ROUTE_V6)),
        )
        .all(conn)
        .await?;

    for model in models {
        let mut am: route::ActiveModel = model.into();
        am.enabled = Set(false);
        am.is_primary = Set(false);
        am.update(conn).await?;
    }
    Ok(())
}

/// pick and persist a new primary for a route that stopped serving.
async fn failover_in_txn<C: ConnectionTrait>(
    conn: &C,
    is_connected: &NodeConnectedMap,
    lost: &Route,
) -> Result<Vec<NodeId>> {
    if !lost.is_primary || lost.is_exit_route() {
        return Ok(Vec::new());
    }

    let alternatives: Vec<Route> = route::Entity::find()
        .filter(route::Column::Prefix.eq(lost.prefix.to_string()))
        .all(conn)
        .await?
        .into_iter()
        .map(Route::try_from)
        .collect::<Result<_>>()?;

    let Some((old, new)) = failover_route(is_connected, lost, &alternatives) else {
        return Ok(Vec::new());
    };

    let mut old_am = route::ActiveModel {
        id: Set(old.id.0 as i64),
        ..Default::default()
    };
    old_am.is_primary = Set(false);
    old_am.update(conn).await?;

    let mut new_am = route::ActiveModel {
        id: Set(new.id.0 as i64),
        ..Default::default()
    };
    new_am.is_primary = Set(true);
    new_am.update(conn).await?;

    debug!(
        prefix = %lost.prefix,
        old_node = %old.node_id,
        new_node = %new.node_id,
        "route primary failed over"
    );

    Ok(vec![old.node_id, new.node_id])
}

/// choose a replacement primary among the alternatives.
///
/// returns `(old, new)` when a connected, enabled alternative exists.
/// when nothing better is available the current primary stays; a stale
/// primary beats none at all.
pub fn failover_route(
    is_connected: &NodeConnectedMap,
    route_to_replace: &Route,
    alternatives: &[Route],
) -> Option<(Route, Route)> {
    if !route_to_replace.is_primary || route_to_replace.is_exit_route() {
        return None;
    }

    let new_primary = alternatives.iter().find(|alt| {
        alt.id != route_to_replace.id
            && alt.advertised
            && alt.enabled
            && is_connected.get(&alt.node_id).copied().unwrap_or(false)
    })?;

    Some((route_to_replace.clone(), new_primary.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_route(id: u64, node: u64, prefix: &str, enabled: bool, primary: bool) -> Route {
        Route {
            id: RouteId(id),
            node_id: NodeId(node),
            prefix: prefix.parse().unwrap(),
            advertised: true,
            enabled,
            is_primary: primary,
        }
    }

    #[test]
    fn failover_picks_connected_alternative() {
        let primary = mk_route(1, 1, "10.0.0.0/8", true, true);
        let alt = mk_route(2, 2, "10.0.0.0/8", true, false);
        let connected: NodeConnectedMap = [(NodeId(2), true)].into_iter().collect();

        let (old, new) = failover_route(&connected, &primary, &[primary.clone(), alt.clone()])
            .expect("failover should happen");
        assert_eq!(old.node_id, NodeId(1));
        assert_eq!(new.node_id, NodeId(2));
    }

    #[test]
    fn failover_skips_disconnected_alternative() {
        let primary = mk_route(1, 1, "10.0.0.0/8", true, true);
        let alt = mk_route(2, 2, "10.0.0.0/8", true, false);
        let connected: NodeConnectedMap = [(NodeId(2), false)].into_iter().collect();

        assert!(failover_route(&connected, &primary, &[primary.clone(), alt]).is_none());
    }

    #[test]
    fn failover_skips_disabled_alternative() {
        let primary = mk_route(1, 1, "10.0.0.0/8", true, true);
        let alt = mk_route(2, 2, "10.0.0.0/8", false, false);
        let connected: NodeConnectedMap = [(NodeId(2), true)].into_iter().collect();

        assert!(failover_route(&connected, &primary, &[primary.clone(), alt]).is_none());
    }

    #[test]
    fn non_primary_route_never_fails_over() {
        let route = mk_route(1, 1, "10.0.0.0/8", true, false);
        let alt = mk_route(2, 2, "10.0.0.0/8", true, false);
        let connected: NodeConnectedMap = [(NodeId(2), true)].into_iter().collect();

        assert!(failover_route(&connected, &route, &[alt]).is_none());
    }

    #[test]
    fn exit_routes_never_fail_over() {
        let mut exit = mk_route(1, 1, EXIT_ROUTE_V4, true, false);
        exit.is_primary = true; // even corrupted state must not fail over
        let alt = mk_route(2, 2, EXIT_ROUTE_V4, true, false);
        let connected: NodeConnectedMap = [(NodeId(2), true)].into_iter().collect();

        assert!(failover_route(&connected, &exit, &[alt]).is_none());
    }
}
