//! ssh policy compilation.
//!
//! compiles the policy's ssh section into the wire rules one node
//! receives. check-mode rules delegate the verdict back to the control
//! server through a placeholder url the client substitutes node ids into.

use std::collections::HashMap;

use ironscale_proto::{SshAction, SshPolicy, SshPrincipal, SshRule};
use ironscale_types::{Node, User, UserId};

use crate::alias::Alias;
use crate::error::Error;
use crate::ipset::{IpSet, IpSetBuilder};
use crate::policy::{Policy, SshAclRule, SshActionKind};

/// placeholder check-mode delegation url; the client substitutes the
/// variables before calling back.
const CHECK_ACTION_URL: &str =
    "https://unused/machine/ssh/action/$SRC_NODE_ID/to/$DST_NODE_ID?local_user=$LOCAL_USER";

/// compile the ssh policy for one target node.
///
/// returns `None` when the policy has no ssh section.
pub fn compile_ssh_policy(
    policy: &Policy,
    users: &[User],
    node: &Node,
    nodes: &[Node],
) -> Result<Option<SshPolicy>, Error> {
    if policy.ssh.is_empty() {
        return Ok(None);
    }

    let mut rules: Vec<SshRule> = Vec::new();

    for rule in &policy.ssh {
        compile_rule(rule, policy, users, node, nodes, &mut rules)?;
    }

    // check rules take precedence over accept under first-match-wins
    rules.sort_by_key(|r| if r.action.is_check() { 0 } else { 1 });

    Ok(Some(SshPolicy { rules }))
}

fn compile_rule(
    rule: &SshAclRule,
    policy: &Policy,
    users: &[User],
    node: &Node,
    nodes: &[Node],
    out: &mut Vec<SshRule>,
) -> Result<(), Error> {
    let (self_dests, other_dests): (Vec<_>, Vec<_>) =
        rule.dst.iter().partition(|d| d.is_self());

    let mut src_builder = IpSetBuilder::new();
    for src in &rule.src {
        if src.is_self() {
            return Err(Error::SelfInSources);
        }
        src_builder.add_set(&src.resolve(policy, users, nodes)?);
    }
    let src_set = src_builder.build();
    if src_set.is_empty() {
        return Ok(());
    }

    let action = match rule.action {
        SshActionKind::Accept => SshAction::accept(),
        SshActionKind::Check => SshAction::hold_and_delegate(CHECK_ACTION_URL),
    };
    let accept_env = if rule.accept_env.is_empty() {
        None
    } else {
        Some(rule.accept_env.clone())
    };

    // user map for the non-localpart entries. root is denied unless
    // explicitly listed; autogroup:nonroot maps any other user to itself.
    let mut common_users: HashMap<String, String> = HashMap::new();
    if rule.users.iter().any(|u| u.is_nonroot()) {
        common_users.insert("*".to_string(), "=".to_string());
    }
    if rule.users.iter().any(|u| u.is_root()) {
        common_users.insert("root".to_string(), "root".to_string());
    } else {
        common_users.insert("root".to_string(), String::new());
    }
    for user_spec in rule.users.iter().filter(|u| u.is_plain()) {
        common_users.insert(user_spec.0.clone(), user_spec.0.clone());
    }
    // the root entry is always present (allow or deny), so every match
    // gets at least the root-deny common rule
    let has_common = !common_users.is_empty();

    let localpart_domains: Vec<&str> = rule
        .users
        .iter()
        .filter_map(|u| u.localpart_domain())
        .collect();

    // autogroup:self destinations: same-user untagged devices only
    if !self_dests.is_empty()
        && !node.is_tagged()
        && let Some(user_id) = node.user_id
    {
        let same_user: Vec<&Node> = nodes
            .iter()
            .filter(|n| !n.is_tagged() && n.user_id == Some(user_id))
            .collect();

        let mut filtered = IpSetBuilder::new();
        for n in &same_user {
            if src_set.contains_any(&n.ips()) {
                for ip in n.ips() {
                    filtered.add_ip(ip);
                }
            }
        }
        let filtered_src = filtered.build();

        if !filtered_src.is_empty() {
            if has_common {
                let principals = principals_from_nodes(&same_user, &filtered_src);
                if !principals.is_empty() {
                    out.push(SshRule {
                        principals,
                        ssh_users: common_users.clone(),
                        action: action.clone(),
                        accept_env: accept_env.clone(),
                    });
                }
            }

            // localpart sub-rules stay scoped to the same-user sources
            out.extend(localpart_rules(
                &localpart_domains,
                users,
                nodes,
                &filtered_src,
                &action,
                &accept_env,
            ));
        }
    }

    // other destinations: emit when this node is in the destination set
    if !other_dests.is_empty() {
        let mut dst_builder = IpSetBuilder::new();
        for dst in &other_dests {
            if let Alias::Asterix = dst {
                dst_builder.add_prefix("0.0.0.0/0".parse().expect("valid prefix"));
                dst_builder.add_prefix("::/0".parse().expect("valid prefix"));
                continue;
            }
            dst_builder.add_set(&dst.resolve(policy, users, nodes)?);
        }
        let dst_set = dst_builder.build();

        if dst_set.contains_any(&node.ips()) {
            if localpart_domains.is_empty() {
                if has_common {
                    let all_nodes: Vec<&Node> = nodes.iter().collect();
                    let principals = principals_from_nodes(&all_nodes, &src_set);
                    if !principals.is_empty() {
                        out.push(SshRule {
                            principals,
                            ssh_users: common_users.clone(),
                            action: action.clone(),
                            accept_env: accept_env.clone(),
                        });
                    }
                }
            } else {
                // with localpart entries each source user gets its own
                // common rule followed by its localpart rule, so the map
                // stays per-user. tagged sources share one common rule.
                let groups = group_source_nodes_by_user(nodes, &src_set);

                for (_, user_nodes) in &groups.per_user {
                    let user_src = ipset_of_nodes(user_nodes);

                    if has_common {
                        let principals = principals_from_nodes(user_nodes, &src_set);
                        if !principals.is_empty() {
                            out.push(SshRule {
                                principals,
                                ssh_users: common_users.clone(),
                                action: action.clone(),
                                accept_env: accept_env.clone(),
                            });
                        }
                    }

                    out.extend(localpart_rules(
                        &localpart_domains,
                        users,
                        nodes,
                        &user_src,
                        &action,
                        &accept_env,
                    ));
                }

                if has_common && !groups.tagged.is_empty() {
                    let principals = principals_from_nodes(&groups.tagged, &src_set);
                    if !principals.is_empty() {
                        out.push(SshRule {
                            principals,
                            ssh_users: common_users.clone(),
                            action: action.clone(),
                            accept_env: accept_env.clone(),
                        });
                    }
                }
            }
        } else if !localpart_domains.is_empty() && src_set.contains_any(&node.ips()) {
            // self-access distribution: with localpart entries, a source
            // node outside the destination set still receives rules
            // scoped to its own user - a user can always reach their own
            // devices over ssh
            let self_src = self_access_set(node, nodes, &src_set);
            if !self_src.is_empty() {
                if has_common {
                    let all_nodes: Vec<&Node> = nodes.iter().collect();
                    let principals = principals_from_nodes(&all_nodes, &self_src);
                    if !principals.is_empty() {
                        out.push(SshRule {
                            principals,
                            ssh_users: common_users.clone(),
                            action: action.clone(),
                            accept_env: accept_env.clone(),
                        });
                    }
                }

                // restricting the source set to the node's own user keeps
                // only that user's localpart sub-rule
                out.extend(localpart_rules(
                    &localpart_domains,
                    users,
                    nodes,
                    &self_src,
                    &action,
                    &accept_env,
                ));
            }
        }
    }

    Ok(())
}

/// the source addresses a node keeps under self-access distribution:
/// its own ips for tagged nodes, all of its user's source device ips
/// otherwise.
fn self_access_set(node: &Node, nodes: &[Node], src_set: &IpSet) -> IpSet {
    let mut b = IpSetBuilder::new();

    if node.is_tagged() {
        if src_set.contains_any(&node.ips()) {
            for ip in node.ips() {
                b.add_ip(ip);
            }
        }
        return b.build();
    }

    let Some(user_id) = node.user_id else {
        return b.build();
    };
    for n in nodes
        .iter()
        .filter(|n| !n.is_tagged() && n.user_id == Some(user_id))
    {
        if src_set.contains_any(&n.ips()) {
            for ip in n.ips() {
                b.add_ip(ip);
            }
        }
    }
    b.build()
}

/// per-user localpart sub-rules.
///
/// each `localpart:*@<domain>` entry expands to one rule per user in the
/// domain, restricting that user's devices to an ssh user equal to their
/// email local part.
fn localpart_rules(
    domains: &[&str],
    users: &[User],
    nodes: &[Node],
    src_set: &IpSet,
    action: &SshAction,
    accept_env: &Option<Vec<String>>,
) -> Vec<SshRule> {
    let mut rules = Vec::new();

    for domain in domains {
        for user in users {
            let (Some(local), Some(user_domain)) = (user.email_local_part(), user.email_domain())
            else {
                continue;
            };
            if !user_domain.eq_ignore_ascii_case(domain) {
                continue;
            }

            let user_nodes: Vec<&Node> = nodes
                .iter()
                .filter(|n| !n.is_tagged() && n.user_id == Some(user.id))
                .collect();
            let principals = principals_from_nodes(&user_nodes, src_set);
            if principals.is_empty() {
                continue;
            }

            rules.push(SshRule {
                principals,
                ssh_users: [(local.to_string(), local.to_string())].into_iter().collect(),
                action: action.clone(),
                accept_env: accept_env.clone(),
            });
        }
    }

    rules
}

/// node-ip principals for every node address present in the source set.
fn principals_from_nodes(nodes: &[&Node], src_set: &IpSet) -> Vec<SshPrincipal> {
    let mut principals = Vec::new();
    for node in nodes {
        for ip in node.ips() {
            if src_set.contains(&ip) {
                principals.push(SshPrincipal::node_ip(ip.to_string()));
            }
        }
    }
    principals
}

fn ipset_of_nodes(nodes: &[&Node]) -> IpSet {
    let mut b = IpSetBuilder::new();
    for node in nodes {
        for ip in node.ips() {
            b.add_ip(ip);
        }
    }
    b.build()
}

struct SourceGroups<'a> {
    /// user-owned source nodes grouped by owner, ordered by user id.
    per_user: Vec<(UserId, Vec<&'a Node>)>,
    /// tagged source nodes; no user identity, one shared bucket.
    tagged: Vec<&'a Node>,
}

fn group_source_nodes_by_user<'a>(nodes: &'a [Node], src_set: &IpSet) -> SourceGroups<'a> {
    let mut by_user: HashMap<UserId, Vec<&Node>> = HashMap::new();
    let mut tagged = Vec::new();

    for node in nodes {
        if !src_set.contains_any(&node.ips()) {
            continue;
        }
        if node.is_tagged() {
            tagged.push(node);
            continue;
        }
        if let Some(user_id) = node.user_id {
            by_user.entry(user_id).or_default().push(node);
        }
    }

    let mut per_user: Vec<(UserId, Vec<&Node>)> = by_user.into_iter().collect();
    per_user.sort_by_key(|(id, _)| *id);

    SourceGroups { per_user, tagged }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironscale_types::test_utils::TestNodeBuilder;

    fn user(id: u64, email: &str) -> User {
        let mut u = User::new(UserId(id), email.split('@').next().unwrap().to_string());
        u.email = Some(email.to_string());
        u
    }

    fn policy_from(doc: &str) -> Policy {
        Policy::from_bytes(doc.as_bytes()).unwrap()
    }

    #[test]
    fn no_ssh_section_means_no_policy() {
        let policy = Policy::empty();
        let node = TestNodeBuilder::new(1).build();
        let result = compile_ssh_policy(&policy, &[], &node, &[]).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn accept_rule_for_tagged_destination() {
        let users = vec![user(1, "alice@example.com")];
        let alice = TestNodeBuilder::new(1).with_user(UserId(1)).build();
        let server = TestNodeBuilder::new(2)
            .with_tags(vec!["tag:server".to_string()])
            .build();
        let nodes = vec![alice.clone(), server.clone()];

        let policy = policy_from(
            r#"{"ssh": [{
                "action": "accept",
                "src": ["alice@example.com"],
                "dst": ["tag:server"],
                "users": ["autogroup:nonroot"]
            }]}"#,
        );

        let compiled = compile_ssh_policy(&policy, &users, &server, &nodes)
            .unwrap()
            .unwrap();
        assert_eq!(compiled.rules.len(), 1);

        let rule = &compiled.rules[0];
        assert_eq!(rule.principals, vec![SshPrincipal::node_ip("100.64.0.2")]);
        assert_eq!(rule.ssh_users.get("*"), Some(&"=".to_string()));
        assert_eq!(rule.ssh_users.get("root"), Some(&String::new()));
        assert_eq!(rule.action.accept, Some(true));
    }

    #[test]
    fn rule_skipped_for_non_destination_node() {
        let users = vec![user(1, "alice@example.com")];
        let alice = TestNodeBuilder::new(1).with_user(UserId(1)).build();
        let server = TestNodeBuilder::new(2)
            .with_tags(vec!["tag:server".to_string()])
            .build();
        let nodes = vec![alice.clone(), server.clone()];

        let policy = policy_from(
            r#"{"ssh": [{
                "action": "accept",
                "src": ["alice@example.com"],
                "dst": ["tag:server"],
                "users": ["ubuntu"]
            }]}"#,
        );

        // alice is not a destination, so her compiled view has no rules
        let compiled = compile_ssh_policy(&policy, &users, &alice, &nodes)
            .unwrap()
            .unwrap();
        assert!(compiled.rules.is_empty());
    }

    #[test]
    fn root_allowed_only_when_listed() {
        let users = vec![user(1, "alice@example.com")];
        let server = TestNodeBuilder::new(2)
            .with_tags(vec!["tag:server".to_string()])
            .build();
        let nodes = vec![
            TestNodeBuilder::new(1).with_user(UserId(1)).build(),
            server.clone(),
        ];

        let policy = policy_from(
            r#"{"ssh": [{
                "action": "accept",
                "src": ["alice@example.com"],
                "dst": ["tag:server"],
                "users": ["root", "autogroup:nonroot"]
            }]}"#,
        );

        let compiled = compile_ssh_policy(&policy, &users, &server, &nodes)
            .unwrap()
            .unwrap();
        let rule = &compiled.rules[0];
        assert_eq!(rule.ssh_users.get("root"), Some(&"root".to_string()));
        assert_eq!(rule.ssh_users.get("*"), Some(&"=".to_string()));
    }

    #[test]
    fn check_action_emits_hold_and_delegate() {
        let users = vec![user(1, "alice@example.com")];
        let server = TestNodeBuilder::new(2)
            .with_tags(vec!["tag:server".to_string()])
            .build();
        let nodes = vec![
            TestNodeBuilder::new(1).with_user(UserId(1)).build(),
            server.clone(),
        ];

        let policy = policy_from(
            r#"{"ssh": [{
                "action": "check",
                "checkPeriod": "12h",
                "src": ["alice@example.com"],
                "dst": ["tag:server"],
                "users": ["autogroup:nonroot"]
            }]}"#,
        );

        let compiled = compile_ssh_policy(&policy, &users, &server, &nodes)
            .unwrap()
            .unwrap();
        let rule = &compiled.rules[0];
        assert!(rule.action.is_check());
        assert_eq!(
            rule.action.hold_and_delegate.as_deref(),
            Some(CHECK_ACTION_URL)
        );
    }

    #[test]
    fn check_rules_sort_before_accept() {
        let users = vec![user(1, "alice@example.com")];
        let server = TestNodeBuilder::new(2)
            .with_tags(vec!["tag:server".to_string()])
            .build();
        let nodes = vec![
            TestNodeBuilder::new(1).with_user(UserId(1)).build(),
            server.clone(),
        ];

        let policy = policy_from(
            r#"{"ssh": [
                {"action": "accept", "src": ["alice@example.com"], "dst": ["tag:server"],
                 "users": ["ubuntu"]},
                {"action": "check", "src": ["alice@example.com"], "dst": ["tag:server"],
                 "users": ["ubuntu"]}
            ]}"#,
        );

        let compiled = compile_ssh_policy(&policy, &users, &server, &nodes)
            .unwrap()
            .unwrap();
        assert_eq!(compiled.rules.len(), 2);
        assert!(compiled.rules[0].action.is_check());
        assert!(!compiled.rules[1].action.is_check());
    }

    #[test]
    fn self_destination_restricts_to_same_user() {
        let users = vec![user(1, "alice@example.com"), user(2, "bob@example.com")];
        let alice1 = TestNodeBuilder::new(1).with_user(UserId(1)).build();
        let alice2 = TestNodeBuilder::new(4).with_user(UserId(1)).build();
        let bob = TestNodeBuilder::new(7).with_user(UserId(2)).build();
        let nodes = vec![alice1.clone(), alice2.clone(), bob.clone()];

        let policy = policy_from(
            r#"{"ssh": [{
                "action": "accept",
                "src": ["autogroup:member"],
                "dst": ["autogroup:self"],
                "users": ["autogroup:nonroot"]
            }]}"#,
        );

        let compiled = compile_ssh_policy(&policy, &users, &alice1, &nodes)
            .unwrap()
            .unwrap();
        assert_eq!(compiled.rules.len(), 1);

        let ips: Vec<&str> = compiled.rules[0]
            .principals
            .iter()
            .filter_map(|p| p.node_ip.as_deref())
            .collect();
        assert_eq!(ips, vec!["100.64.0.2", "100.64.0.5"]);
    }

    #[test]
    fn tagged_node_never_matches_self() {
        let users = vec![user(1, "alice@example.com")];
        let tagged = TestNodeBuilder::new(3)
            .with_tags(vec!["tag:server".to_string()])
            .build();
        let nodes = vec![
            TestNodeBuilder::new(1).with_user(UserId(1)).build(),
            tagged.clone(),
        ];

        let policy = policy_from(
            r#"{"ssh": [{
                "action": "accept",
                "src": ["autogroup:member"],
                "dst": ["autogroup:self"],
                "users": ["autogroup:nonroot"]
            }]}"#,
        );

        let compiled = compile_ssh_policy(&policy, &users, &tagged, &nodes)
            .unwrap()
            .unwrap();
        assert!(compiled.rules.is_empty());
    }

    #[test]
    fn localpart_expands_per_user() {
        let users = vec![user(1, "alice@example.com"), user(2, "bob@example.com")];
        let alice = TestNodeBuilder::new(1).with_user(UserId(1)).build();
        let bob = TestNodeBuilder::new(4).with_user(UserId(2)).build();
        let server = TestNodeBuilder::new(7)
            .with_tags(vec!["tag:server".to_string()])
            .build();
        let nodes = vec![alice.clone(), bob.clone(), server.clone()];

        let policy = policy_from(
            r#"{"ssh": [{
                "action": "accept",
                "src": ["alice@example.com", "bob@example.com"],
                "dst": ["tag:server"],
                "users": ["localpart:*@example.com"]
            }]}"#,
        );

        let compiled = compile_ssh_policy(&policy, &users, &server, &nodes)
            .unwrap()
            .unwrap();

        // per user: the always-present root-deny common rule, then the
        // localpart rule
        assert_eq!(compiled.rules.len(), 4);
        assert_eq!(
            compiled.rules[0].ssh_users,
            [("root".to_string(), String::new())].into_iter().collect()
        );
        assert_eq!(
            compiled.rules[0].principals,
            vec![SshPrincipal::node_ip("100.64.0.2")]
        );
        assert_eq!(
            compiled.rules[1].ssh_users,
            [("alice".to_string(), "alice".to_string())].into_iter().collect()
        );
        assert_eq!(
            compiled.rules[1].principals,
            vec![SshPrincipal::node_ip("100.64.0.2")]
        );
        assert_eq!(
            compiled.rules[2].ssh_users,
            [("root".to_string(), String::new())].into_iter().collect()
        );
        assert_eq!(
            compiled.rules[3].ssh_users,
            [("bob".to_string(), "bob".to_string())].into_iter().collect()
        );
    }

    #[test]
    fn localpart_source_gets_self_access_rules() {
        let users = vec![user(1, "alice@example.com")];
        let alice1 = TestNodeBuilder::new(1).with_user(UserId(1)).build();
        let alice2 = TestNodeBuilder::new(4).with_user(UserId(1)).build();
        let server = TestNodeBuilder::new(7)
            .with_tags(vec!["tag:server".to_string()])
            .build();
        let nodes = vec![alice1.clone(), alice2.clone(), server.clone()];

        let policy = policy_from(
            r#"{"ssh": [{
                "action": "accept",
                "src": ["alice@example.com"],
                "dst": ["tag:server"],
                "users": ["localpart:*@example.com"]
            }]}"#,
        );

        // alice's second device is a source but not a destination; with
        // localpart entries it still gets rules scoped to its own user
        let compiled = compile_ssh_policy(&policy, &users, &alice2, &nodes)
            .unwrap()
            .unwrap();
        assert_eq!(compiled.rules.len(), 2);

        let self_ips = vec![
            SshPrincipal::node_ip("100.64.0.2"),
            SshPrincipal::node_ip("100.64.0.5"),
        ];

        // the root-deny common rule, scoped to alice's source devices
        assert_eq!(compiled.rules[0].principals, self_ips);
        assert_eq!(
            compiled.rules[0].ssh_users,
            [("root".to_string(), String::new())].into_iter().collect()
        );

        // alice's localpart rule with the same self-scoped principals
        assert_eq!(compiled.rules[1].principals, self_ips);
        assert_eq!(
            compiled.rules[1].ssh_users,
            [("alice".to_string(), "alice".to_string())].into_iter().collect()
        );
    }

    #[test]
    fn non_localpart_source_gets_no_self_access() {
        let users = vec![user(1, "alice@example.com")];
        let alice1 = TestNodeBuilder::new(1).with_user(UserId(1)).build();
        let alice2 = TestNodeBuilder::new(4).with_user(UserId(1)).build();
        let server = TestNodeBuilder::new(7)
            .with_tags(vec!["tag:server".to_string()])
            .build();
        let nodes = vec![alice1.clone(), alice2.clone(), server.clone()];

        let policy = policy_from(
            r#"{"ssh": [{
                "action": "accept",
                "src": ["alice@example.com"],
                "dst": ["tag:server"],
                "users": ["ubuntu"]
            }]}"#,
        );

        // self-access distribution only applies to localpart rules
        let compiled = compile_ssh_policy(&policy, &users, &alice2, &nodes)
            .unwrap()
            .unwrap();
        assert!(compiled.rules.is_empty());
    }

    #[test]
    fn localpart_with_common_users_interleaves_per_user() {
        let users = vec![user(1, "alice@example.com"), user(2, "bob@example.com")];
        let alice = TestNodeBuilder::new(1).with_user(UserId(1)).build();
        let bob = TestNodeBuilder::new(4).with_user(UserId(2)).build();
        let server = TestNodeBuilder::new(7)
            .with_tags(vec!["tag:server".to_string()])
            .build();
        let nodes = vec![alice.clone(), bob.clone(), server.clone()];

        let policy = policy_from(
            r#"{"ssh": [{
                "action": "accept",
                "src": ["alice@example.com", "bob@example.com"],
                "dst": ["tag:server"],
                "users": ["ubuntu", "localpart:*@example.com"]
            }]}"#,
        );

        let compiled = compile_ssh_policy(&policy, &users, &server, &nodes)
            .unwrap()
            .unwrap();

        // alice common, alice localpart, bob common, bob localpart
        assert_eq!(compiled.rules.len(), 4);
        assert_eq!(
            compiled.rules[0].ssh_users.get("ubuntu"),
            Some(&"ubuntu".to_string())
        );
        assert_eq!(
            compiled.rules[1].ssh_users.get("alice"),
            Some(&"alice".to_string())
        );
        assert_eq!(
            compiled.rules[2].ssh_users.get("ubuntu"),
            Some(&"ubuntu".to_string())
        );
        assert_eq!(
            compiled.rules[3].ssh_users.get("bob"),
            Some(&"bob".to_string())
        );
    }

    #[test]
    fn accept_env_passes_through() {
        let users = vec![user(1, "alice@example.com")];
        let server = TestNodeBuilder::new(2)
            .with_tags(vec!["tag:server".to_string()])
            .build();
        let nodes = vec![
            TestNodeBuilder::new(1).with_user(UserId(1)).build(),
            server.clone(),
        ];

        let policy = policy_from(
            r#"{"ssh": [{
                "action": "accept",
                "src": ["alice@example.com"],
                "dst": ["tag:server"],
                "users": ["ubuntu"],
                "acceptEnv": ["GIT_*", "LANG"]
            }]}"#,
        );

        let compiled = compile_ssh_policy(&policy, &users, &server, &nodes)
            .unwrap()
            .unwrap();
        assert_eq!(
            compiled.rules[0].accept_env,
            Some(vec!["GIT_*".to_string(), "LANG".to_string()])
        );
    }
}
