//! packet filter compilation.
//!
//! turns acls into client-compatible filter rules, per target node:
//! `autogroup:self` destinations are split out and compiled against the
//! target's user, wildcard destinations stay literal `"*"`,
//! `autogroup:internet` never produces filter entries (exit routing
//! carries it), and the result is merged and reduced to what the target
//! actually needs.

use ipnet::IpNet;
use tracing::trace;

use ironscale_proto::{FilterRule, NetPortRange, PortRange};
use ironscale_types::{Node, User};

use crate::alias::{Alias, AliasWithPorts};
use crate::error::Error;
use crate::ipset::{IpSet, IpSetBuilder};
use crate::policy::{Acl, Policy};

/// ip protocol numbers used by the compiler (iana assignments).
const PROTO_ICMP: i32 = 1;
const PROTO_IGMP: i32 = 2;
const PROTO_IPV4: i32 = 4;
const PROTO_TCP: i32 = 6;
const PROTO_EGP: i32 = 8;
const PROTO_IGP: i32 = 9;
const PROTO_UDP: i32 = 17;
const PROTO_GRE: i32 = 47;
const PROTO_ESP: i32 = 50;
const PROTO_AH: i32 = 51;
const PROTO_IPV6_ICMP: i32 = 58;
const PROTO_SCTP: i32 = 132;

/// parse the proto field of an acl.
///
/// an empty proto means the implied default set (icmp4, icmp6, tcp, udp),
/// which is represented as an empty list and omitted on the wire. the
/// second value reports whether the protocol lacks port semantics, in
/// which case destinations must use the wildcard port.
pub(crate) fn parse_protocol(proto: &str) -> Result<(Vec<i32>, bool), Error> {
    match proto {
        "" => Ok((vec![], false)),
        "igmp" => Ok((vec![PROTO_IGMP], true)),
        "ipv4" | "ip-in-ip" => Ok((vec![PROTO_IPV4], true)),
        "tcp" => Ok((vec![PROTO_TCP], false)),
        "egp" => Ok((vec![PROTO_EGP], true)),
        "igp" => Ok((vec![PROTO_IGP], true)),
        "udp" => Ok((vec![PROTO_UDP], false)),
        "gre" => Ok((vec![PROTO_GRE], true)),
        "esp" => Ok((vec![PROTO_ESP], true)),
        "ah" => Ok((vec![PROTO_AH], true)),
        "sctp" => Ok((vec![PROTO_SCTP], false)),
        "icmp" => Ok((vec![PROTO_ICMP, PROTO_IPV6_ICMP], true)),
        other => {
            let number: i32 = other
                .parse()
                .map_err(|_| Error::UnknownProtocol(other.to_string()))?;
            let needs_wildcard =
                number != PROTO_TCP && number != PROTO_UDP && number != PROTO_SCTP;
            Ok((vec![number], needs_wildcard))
        }
    }
}

/// the allow-all filter emitted when the policy has no acls.
fn filter_allow_all() -> Vec<FilterRule> {
    vec![FilterRule {
        src_ips: vec!["*".to_string()],
        dst_ports: vec![NetPortRange {
            ip: "*".to_string(),
            ports: PortRange::ANY,
        }],
        ip_proto: vec![],
    }]
}

/// compile the tailnet-wide filter rules, without autogroup:self handling.
///
/// used for peer-visibility decisions; per-node map generation goes
/// through [`compile_filter_rules_for_node`].
pub fn compile_filter_rules(
    policy: &Policy,
    users: &[User],
    nodes: &[Node],
) -> Result<Vec<FilterRule>, Error> {
    if policy.acls.is_empty() {
        return Ok(filter_allow_all());
    }

    let mut rules = Vec::new();

    for acl in &policy.acls {
        if acl.action != "accept" {
            return Err(Error::InvalidAction(acl.action.clone()));
        }

        let src_set = resolve_sources(&acl.src, policy, users, nodes)?;
        if src_set.is_empty() {
            continue;
        }

        let (protocols, _) = parse_protocol(&acl.proto)?;
        let dst_ports = expand_destinations(&acl.dst, policy, users, nodes)?;
        if dst_ports.is_empty() {
            continue;
        }

        rules.push(FilterRule {
            src_ips: src_set.prefix_strings(),
            dst_ports,
            ip_proto: protocols,
        });
    }

    Ok(merge_filter_rules(rules))
}

/// compile filter rules for a specific target node.
///
/// `autogroup:self` destinations compile against the target's user: the
/// self part admits only sources owned by that user and points at the
/// same-user devices, while the remaining destinations use the full
/// source set. tagged targets skip the self part entirely.
pub fn compile_filter_rules_for_node(
    policy: &Policy,
    users: &[User],
    node: &Node,
    nodes: &[Node],
) -> Result<Vec<FilterRule>, Error> {
    if policy.acls.is_empty() {
        return Ok(filter_allow_all());
    }

    let mut rules = Vec::new();

    for acl in &policy.acls {
        if acl.action != "accept" {
            return Err(Error::InvalidAction(acl.action.clone()));
        }
        compile_acl_for_node(acl, policy, users, node, nodes, &mut rules)?;
    }

    Ok(merge_filter_rules(rules))
}

fn compile_acl_for_node(
    acl: &Acl,
    policy: &Policy,
    users: &[User],
    node: &Node,
    nodes: &[Node],
    rules: &mut Vec<FilterRule>,
) -> Result<(), Error> {
    let (self_dests, other_dests): (Vec<_>, Vec<_>) =
        acl.dst.iter().partition(|d| d.alias.is_self());

    for src in &acl.src {
        if src.is_self() {
            return Err(Error::SelfInSources);
        }
    }

    let src_set = resolve_sources(&acl.src, policy, users, nodes)?;
    if src_set.is_empty() {
        return Ok(());
    }

    let (protocols, _) = parse_protocol(&acl.proto)?;

    // self destinations: restrict sources and destinations to the target
    // user's untagged devices. tagged nodes have no self.
    if !self_dests.is_empty()
        && !node.is_tagged()
        && let Some(user_id) = node.user_id
    {
        let same_user: Vec<&Node> = nodes
            .iter()
            .filter(|n| !n.is_tagged() && n.user_id == Some(user_id))
            .collect();

        let mut self_src = IpSetBuilder::new();
        for n in &same_user {
            if src_set.contains_any(&n.ips()) {
                for ip in n.ips() {
                    self_src.add_ip(ip);
                }
            }
        }
        let self_src = self_src.build();

        if !self_src.is_empty() {
            let mut dst_ports = Vec::new();
            for dest in &self_dests {
                for n in &same_user {
                    for port in &dest.ports {
                        for ip in n.ips() {
                            dst_ports.push(NetPortRange {
                                ip: host_prefix(ip).to_string(),
                                ports: *port,
                            });
                        }
                    }
                }
            }
            if !dst_ports.is_empty() {
                rules.push(FilterRule {
                    src_ips: self_src.prefix_strings(),
                    dst_ports,
                    ip_proto: protocols.clone(),
                });
            }
        }
    }

    if !other_dests.is_empty() {
        let dst_ports = expand_destinations_refs(&other_dests, policy, users, nodes)?;
        if !dst_ports.is_empty() {
            rules.push(FilterRule {
                src_ips: src_set.prefix_strings(),
                dst_ports,
                ip_proto: protocols,
            });
        }
    }

    Ok(())
}

/// resolve and union a source list.
fn resolve_sources(
    srcs: &[Alias],
    policy: &Policy,
    users: &[User],
    nodes: &[Node],
) -> Result<IpSet, Error> {
    let mut b = IpSetBuilder::new();
    for src in srcs {
        match src.resolve(policy, users, nodes) {
            Ok(set) => b.add_set(&set),
            Err(e @ (Error::SelfInSources | Error::SelfRequiresNode)) => return Err(e),
            Err(e) => {
                trace!(error = %e, "resolving source alias");
                return Err(e);
            }
        }
    }
    Ok(b.build())
}

fn expand_destinations(
    dests: &[AliasWithPorts],
    policy: &Policy,
    users: &[User],
    nodes: &[Node],
) -> Result<Vec<NetPortRange>, Error> {
    let refs: Vec<&AliasWithPorts> = dests.iter().collect();
    expand_destinations_refs(&refs, policy, users, nodes)
}

/// expand destinations into (prefix, port) entries.
///
/// wildcards stay literal `"*"`; `autogroup:internet` produces nothing
/// (exit-route allowed-ips carry it).
fn expand_destinations_refs(
    dests: &[&AliasWithPorts],
    policy: &Policy,
    users: &[User],
    nodes: &[Node],
) -> Result<Vec<NetPortRange>, Error> {
    let mut dst_ports = Vec::new();

    for dest in dests {
        if matches!(dest.alias, Alias::Asterix) {
            for port in &dest.ports {
                dst_ports.push(NetPortRange {
                    ip: "*".to_string(),
                    ports: *port,
                });
            }
            continue;
        }

        if dest.alias.is_internet() {
            continue;
        }

        let set = dest.alias.resolve(policy, users, nodes)?;
        for prefix in set.prefixes() {
            for port in &dest.ports {
                dst_ports.push(NetPortRange {
                    ip: prefix.to_string(),
                    ports: *port,
                });
            }
        }
    }

    Ok(dst_ports)
}

/// merge rules with identical sources and protocols by concatenating
/// their destination ports. ports are not deduplicated, matching the
/// upstream server byte for byte.
pub fn merge_filter_rules(rules: Vec<FilterRule>) -> Vec<FilterRule> {
    if rules.len() <= 1 {
        return rules;
    }

    let mut key_to_idx: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut result: Vec<FilterRule> = Vec::with_capacity(rules.len());

    for rule in rules {
        let key = format!(
            "{}|{}",
            rule.src_ips.join(","),
            rule.ip_proto
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );

        match key_to_idx.get(&key) {
            Some(&idx) => {
                result[idx].dst_ports.extend(rule.dst_ports);
            }
            None => {
                key_to_idx.insert(key, result.len());
                result.push(rule);
            }
        }
    }

    result
}

/// reduce compiled rules to what one node needs.
///
/// a destination entry survives when it is the wildcard, touches one of
/// the node's own addresses, or overlaps a route the node serves
/// (enabled subnets and exit routes). rules left with no destinations are
/// dropped.
pub fn reduce_filter_rules(
    node: &Node,
    node_routes: &[IpNet],
    rules: &[FilterRule],
) -> Vec<FilterRule> {
    let node_ips = node.ips();
    let mut reduced = Vec::new();

    for rule in rules {
        let mut dests = Vec::new();

        for dest in &rule.dst_ports {
            if dest.ip == "*" {
                dests.push(dest.clone());
                continue;
            }

            let Ok(prefix) = dest.ip.parse::<IpNet>() else {
                continue;
            };

            if node_ips.iter().any(|ip| prefix.contains(ip)) {
                dests.push(dest.clone());
                continue;
            }

            if node_routes.iter().any(|route| overlaps(&prefix, route)) {
                dests.push(dest.clone());
            }
        }

        if !dests.is_empty() {
            reduced.push(FilterRule {
                src_ips: rule.src_ips.clone(),
                dst_ports: dests,
                ip_proto: rule.ip_proto.clone(),
            });
        }
    }

    reduced
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

fn host_prefix(ip: std::net::IpAddr) -> IpNet {
    match ip {
        std::net::IpAddr::V4(v4) => IpNet::V4(ipnet::Ipv4Net::from(v4)),
        std::net::IpAddr::V6(v6) => IpNet::V6(ipnet::Ipv6Net::from(v6)),
    }
}
