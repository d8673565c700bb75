//! automatic route approval.
//!
//! when a node advertises routes, the auto-approvers section can enable
//! them immediately instead of waiting for an operator. approvers are the
//! usual identities (usernames, groups, tags).

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use ironscale_types::{Node, User, is_exit_route};

use crate::alias::{Alias, parse_prefix_str};
use crate::error::Error;
use crate::policy::Policy;

/// the autoApprovers policy section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoApprovers {
    /// route prefix -> identities that auto-approve routes under it.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub routes: HashMap<String, Vec<String>>,

    /// identities that auto-approve exit-node routes.
    #[serde(default, rename = "exitNode", skip_serializing_if = "Vec::is_empty")]
    pub exit_node: Vec<String>,
}

impl AutoApprovers {
    /// whether the section declares nothing.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.exit_node.is_empty()
    }

    /// validate prefixes and approver syntax.
    pub fn validate(&self) -> Result<(), Error> {
        for (prefix, approvers) in &self.routes {
            parse_prefix_str(prefix)?;
            for approver in approvers {
                Alias::parse(approver)?;
            }
        }
        for approver in &self.exit_node {
            Alias::parse(approver)?;
        }
        Ok(())
    }
}

/// the advertised routes of `node` that the policy auto-approves.
///
/// a subnet route is approved when some approver for a containing prefix
/// matches the node; the exit pair is approved by `exitNode` approvers.
/// both exit routes are returned together so enabling stays atomic.
pub fn approved_routes(
    policy: &Policy,
    users: &[User],
    node: &Node,
    nodes: &[Node],
) -> Vec<IpNet> {
    let mut approved = Vec::new();

    for route in node.announced_routes() {
        let is_approved = if is_exit_route(route) {
            approver_matches_node(&policy.auto_approvers.exit_node, policy, users, node, nodes)
        } else {
            policy.auto_approvers.routes.iter().any(|(prefix, approvers)| {
                let Ok(prefix) = parse_prefix_str(prefix) else {
                    return false;
                };
                contains_route(&prefix, route)
                    && approver_matches_node(approvers, policy, users, node, nodes)
            })
        };

        if is_approved {
            approved.push(*route);
        }
    }

    approved
}

/// true when a route is entirely inside a prefix.
fn contains_route(outer: &IpNet, inner: &IpNet) -> bool {
    outer.contains(&inner.network()) && outer.prefix_len() <= inner.prefix_len()
        && matches!(
            (outer, inner),
            (IpNet::V4(_), IpNet::V4(_)) | (IpNet::V6(_), IpNet::V6(_))
        )
}

fn approver_matches_node(
    approvers: &[String],
    policy: &Policy,
    users: &[User],
    node: &Node,
    nodes: &[Node],
) -> bool {
    let owner_username = node
        .user_id
        .and_then(|id| users.iter().find(|u| u.id == id))
        .map(|u| u.username());

    approvers.iter().any(|approver| {
        // direct owner match by username
        if let Some(ref username) = owner_username
            && approver == username
        {
            return true;
        }

        // otherwise resolve the approver and check the node's addresses
        let Ok(alias) = Alias::parse(approver) else {
            return false;
        };
        match alias.resolve(policy, users, nodes) {
            Ok(set) => set.contains_any(&node.ips()),
            Err(_) => false,
        }
    })
}
