//! typed change events driving the session fan-out.
//!
//! every mutation of the tailnet view (registration, expiry, routes,
//! policy, presence) produces a [`ChangeSet`] that the batcher distributes
//! to the nodes that should observe it.

use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// the kind of a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    /// everything changed; regenerate the full map.
    Full,
    /// the access policy changed.
    Policy,
    /// a new node joined the tailnet.
    NodeAdded,
    /// a node was deleted.
    NodeRemove,
    /// a node opened its first map stream.
    NodeCameOnline,
    /// a node's last map stream ended.
    NodeWentOffline,
    /// a node's key expiry changed.
    KeyExpiry,
    /// a node's mutable attributes changed (endpoints, hostinfo, routes).
    PeerChanged,
    /// only the originating node needs an update.
    SelfUpdate,
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Change::Full => "full",
            Change::Policy => "policy",
            Change::NodeAdded => "node-added",
            Change::NodeRemove => "node-remove",
            Change::NodeCameOnline => "node-came-online",
            Change::NodeWentOffline => "node-went-offline",
            Change::KeyExpiry => "key-expiry",
            Change::PeerChanged => "peer-changed",
            Change::SelfUpdate => "self-update",
        };
        f.write_str(s)
    }
}

/// a change event addressed to the batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// what changed.
    pub change: Change,

    /// the node the change originates from. `NodeId(0)` for tailnet-wide
    /// changes like policy swaps.
    pub node_id: NodeId,

    /// deliver only to the originating node.
    pub self_update_only: bool,
}

impl ChangeSet {
    /// a full-map change for every node.
    pub fn full() -> Self {
        Self {
            change: Change::Full,
            node_id: NodeId(0),
            self_update_only: false,
        }
    }

    /// a full-map change addressed only to one node (initial map).
    pub fn full_self(node_id: NodeId) -> Self {
        Self {
            change: Change::Full,
            node_id,
            self_update_only: true,
        }
    }

    /// the policy changed; broadcast to all.
    pub fn policy() -> Self {
        Self {
            change: Change::Policy,
            node_id: NodeId(0),
            self_update_only: false,
        }
    }

    /// a node joined.
    pub fn node_added(node_id: NodeId) -> Self {
        Self {
            change: Change::NodeAdded,
            node_id,
            self_update_only: false,
        }
    }

    /// a node was removed.
    pub fn node_removed(node_id: NodeId) -> Self {
        Self {
            change: Change::NodeRemove,
            node_id,
            self_update_only: false,
        }
    }

    /// a node came online.
    pub fn node_came_online(node_id: NodeId) -> Self {
        Self {
            change: Change::NodeCameOnline,
            node_id,
            self_update_only: false,
        }
    }

    /// a node went offline.
    pub fn node_went_offline(node_id: NodeId) -> Self {
        Self {
            change: Change::NodeWentOffline,
            node_id,
            self_update_only: false,
        }
    }

    /// a node's key expiry changed.
    pub fn key_expiry(node_id: NodeId) -> Self {
        Self {
            change: Change::KeyExpiry,
            node_id,
            self_update_only: false,
        }
    }

    /// a node's mutable attributes changed.
    pub fn peer_changed(node_id: NodeId) -> Self {
        Self {
            change: Change::PeerChanged,
            node_id,
            self_update_only: false,
        }
    }

    /// only the originating node needs a refreshed map.
    pub fn self_update(node_id: NodeId) -> Self {
        Self {
            change: Change::SelfUpdate,
            node_id,
            self_update_only: true,
        }
    }

    /// whether the originating node should receive this change too.
    ///
    /// most changes describe the origin node to its peers; the origin only
    /// cares when its own view changed as well.
    pub fn also_self(&self) -> bool {
        self.self_update_only
            || matches!(
                self.change,
                Change::KeyExpiry | Change::SelfUpdate | Change::Full | Change::Policy
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_update_targets_only_origin() {
        let c = ChangeSet::self_update(NodeId(7));
        assert!(c.self_update_only);
        assert!(c.also_self());
    }

    #[test]
    fn online_change_excludes_origin() {
        let c = ChangeSet::node_came_online(NodeId(7));
        assert!(!c.self_update_only);
        assert!(!c.also_self());
    }

    #[test]
    fn policy_change_includes_everyone() {
        let c = ChangeSet::policy();
        assert!(c.also_self());
        assert_eq!(c.node_id, NodeId(0));
    }

    #[test]
    fn key_expiry_reaches_origin() {
        assert!(ChangeSet::key_expiry(NodeId(3)).also_self());
    }
}
