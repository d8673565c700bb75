//! the policy engine.
//!
//! wraps the active policy in an arc for cheap snapshots; the server
//! swaps the whole engine on policy updates and broadcasts a policy
//! change. all compilation goes through `&self`, so the engine is safe to
//! share across handlers.

use std::sync::Arc;

use ipnet::IpNet;

use ironscale_proto::{FilterRule, SshPolicy};
use ironscale_types::{Node, User};

use crate::error::Error;
use crate::filter::{compile_filter_rules, compile_filter_rules_for_node, reduce_filter_rules};
use crate::policy::Policy;
use crate::ssh::compile_ssh_policy;

/// thread-safe policy evaluation engine.
#[derive(Clone)]
pub struct PolicyEngine {
    policy: Arc<Policy>,
}

impl PolicyEngine {
    /// create an engine over a validated policy.
    pub fn new(policy: Policy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    /// an engine with the empty policy (open tailnet).
    pub fn empty() -> Self {
        Self::new(Policy::empty())
    }

    /// swap in a new policy.
    pub fn update_policy(&mut self, policy: Policy) {
        self.policy = Arc::new(policy);
    }

    /// the current policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// compile and reduce the packet filter for one node.
    ///
    /// `node_routes` are the routes the node currently serves (enabled
    /// subnets and exit routes); they keep subnet-router rules alive
    /// through reduction.
    pub fn filter_for_node(
        &self,
        users: &[User],
        node: &Node,
        nodes: &[Node],
        node_routes: &[IpNet],
    ) -> Result<Vec<FilterRule>, Error> {
        let rules = compile_filter_rules_for_node(&self.policy, users, node, nodes)?;
        Ok(reduce_filter_rules(node, node_routes, &rules))
    }

    /// compile the ssh policy for one node.
    pub fn ssh_policy_for_node(
        &self,
        users: &[User],
        node: &Node,
        nodes: &[Node],
    ) -> Result<Option<SshPolicy>, Error> {
        compile_ssh_policy(&self.policy, users, node, nodes)
    }

    /// peers of `node` that the policy allows it to communicate with.
    ///
    /// visibility is filter-driven and bidirectional: a peer that can
    /// reach the node (or be reached by it) under some rule is visible.
    pub fn visible_peers<'a>(
        &self,
        node: &Node,
        nodes: &'a [Node],
        users: &[User],
    ) -> Result<Vec<&'a Node>, Error> {
        let rules = compile_filter_rules(&self.policy, users, nodes)?;

        Ok(nodes
            .iter()
            .filter(|peer| {
                peer.id != node.id
                    && (rules_admit(&rules, node, peer) || rules_admit(&rules, peer, node))
            })
            .collect())
    }
}

/// whether any compiled rule lets `src` send to `dst`.
fn rules_admit(rules: &[FilterRule], src: &Node, dst: &Node) -> bool {
    let src_ips = src.ips();
    let dst_ips = dst.ips();

    rules.iter().any(|rule| {
        let src_match = rule.src_ips.iter().any(|spec| {
            spec == "*"
                || spec
                    .parse::<IpNet>()
                    .map(|p| src_ips.iter().any(|ip| p.contains(ip)))
                    .unwrap_or(false)
        });
        if !src_match {
            return false;
        }

        rule.dst_ports.iter().any(|dest| {
            dest.ip == "*"
                || dest
                    .ip
                    .parse::<IpNet>()
                    .map(|p| dst_ips.iter().any(|ip| p.contains(ip)))
                    .unwrap_or(false)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironscale_types::UserId;
    use ironscale_types::test_utils::TestNodeBuilder;

    fn user(id: u64, email: &str) -> User {
        let mut u = User::new(UserId(id), email.split('@').next().unwrap().to_string());
        u.email = Some(email.to_string());
        u
    }

    #[test]
    fn empty_policy_shows_all_peers() {
        let engine = PolicyEngine::empty();
        let nodes = vec![
            TestNodeBuilder::new(1).build(),
            TestNodeBuilder::new(2).build(),
            TestNodeBuilder::new(3).build(),
        ];

        let peers = engine.visible_peers(&nodes[0], &nodes, &[]).unwrap();
        assert_eq!(peers.len(), 2);
    }

    #[test]
    fn directional_rule_makes_both_ends_visible() {
        let users = vec![user(1, "alice@example.com"), user(2, "bob@example.com")];
        let alice = TestNodeBuilder::new(1).with_user(UserId(1)).build();
        let bob = TestNodeBuilder::new(2).with_user(UserId(2)).build();
        let nodes = vec![alice.clone(), bob.clone()];

        let policy = Policy::from_bytes(
            br#"{"acls": [{"action": "accept", "src": ["alice@example.com"], "dst": ["bob@example.com:22"]}]}"#,
        )
        .unwrap();
        let engine = PolicyEngine::new(policy);

        // alice can reach bob, so each sees the other
        assert_eq!(engine.visible_peers(&alice, &nodes, &users).unwrap().len(), 1);
        assert_eq!(engine.visible_peers(&bob, &nodes, &users).unwrap().len(), 1);
    }

    #[test]
    fn unrelated_nodes_not_visible() {
        let users = vec![
            user(1, "alice@example.com"),
            user(2, "bob@example.com"),
            user(3, "carol@example.com"),
        ];
        let alice = TestNodeBuilder::new(1).with_user(UserId(1)).build();
        let bob = TestNodeBuilder::new(2).with_user(UserId(2)).build();
        let carol = TestNodeBuilder::new(3).with_user(UserId(3)).build();
        let nodes = vec![alice.clone(), bob.clone(), carol.clone()];

        let policy = Policy::from_bytes(
            br#"{"acls": [{"action": "accept", "src": ["alice@example.com"], "dst": ["bob@example.com:*"]}]}"#,
        )
        .unwrap();
        let engine = PolicyEngine::new(policy);

        let carols_peers = engine.visible_peers(&carol, &nodes, &users).unwrap();
        assert!(carols_peers.is_empty());
    }

    #[test]
    fn update_policy_swaps_snapshot() {
        let mut engine = PolicyEngine::empty();
        assert!(engine.policy().acls.is_empty());

        let policy = Policy::from_bytes(
            br#"{"acls": [{"action": "accept", "src": ["*"], "dst": ["*:22"]}]}"#,
        )
        .unwrap();
        engine.update_policy(policy);
        assert_eq!(engine.policy().acls.len(), 1);
    }

    #[test]
    fn filter_for_node_reduces() {
        let users = vec![user(1, "alice@example.com"), user(2, "bob@example.com")];
        let alice = TestNodeBuilder::new(1).with_user(UserId(1)).build();
        let bob = TestNodeBuilder::new(2).with_user(UserId(2)).build();
        let nodes = vec![alice.clone(), bob.clone()];

        let policy = Policy::from_bytes(
            br#"{"acls": [
                {"action": "accept", "src": ["alice@example.com"], "dst": ["bob@example.com:22"]}
            ]}"#,
        )
        .unwrap();
        let engine = PolicyEngine::new(policy);

        // bob is the destination; alice's own view keeps nothing
        let bob_rules = engine.filter_for_node(&users, &bob, &nodes, &[]).unwrap();
        assert_eq!(bob_rules.len(), 1);

        let alice_rules = engine.filter_for_node(&users, &alice, &nodes, &[]).unwrap();
        assert!(alice_rules.is_empty());
    }
}
