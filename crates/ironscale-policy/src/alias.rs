//! typed policy aliases.
//!
//! every identity that can appear in an acl source or destination is one
//! of a closed set of variants. deserialization inspects the string
//! payload and constructs the concrete variant up front, so resolution
//! never re-parses.

use std::net::IpAddr;
use std::sync::OnceLock;

use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use ironscale_types::{Node, User};
use ironscale_proto::PortRange;

use crate::error::Error;
use crate::ipset::{IpSet, IpSetBuilder};
use crate::policy::Policy;

/// the supported autogroups. everything else is rejected at parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoGroup {
    /// the public internet (destinations only; carried by exit routes).
    Internet,
    /// the target node's own user's untagged devices (destinations only).
    SelfNodes,
    /// all untagged nodes.
    Member,
    /// all tagged nodes.
    Tagged,
    /// any ssh user except root (ssh users only).
    NonRoot,
    /// every address; the explicit opt-in spelling of `*`.
    DangerAll,
}

impl AutoGroup {
    fn parse(name: &str) -> Result<Self, Error> {
        match name {
            "autogroup:internet" => Ok(AutoGroup::Internet),
            "autogroup:self" => Ok(AutoGroup::SelfNodes),
            "autogroup:member" => Ok(AutoGroup::Member),
            "autogroup:tagged" => Ok(AutoGroup::Tagged),
            "autogroup:nonroot" => Ok(AutoGroup::NonRoot),
            "autogroup:danger-all" => Ok(AutoGroup::DangerAll),
            other => Err(Error::UnknownAutogroup(other.to_string())),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            AutoGroup::Internet => "autogroup:internet",
            AutoGroup::SelfNodes => "autogroup:self",
            AutoGroup::Member => "autogroup:member",
            AutoGroup::Tagged => "autogroup:tagged",
            AutoGroup::NonRoot => "autogroup:nonroot",
            AutoGroup::DangerAll => "autogroup:danger-all",
        }
    }
}

/// an identity in a policy source or destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Alias {
    /// `*` - every address.
    Asterix,
    /// a user, identified by an email-shaped name.
    Username(String),
    /// a declared group (`group:` prefix included).
    Group(String),
    /// a tag (`tag:` prefix included).
    Tag(String),
    /// a symbolic host declared in the policy's hosts table.
    Host(String),
    /// a literal prefix or address.
    Prefix(IpNet),
    /// one of the built-in autogroups.
    AutoGroup(AutoGroup),
}

/// parse a bare prefix or address string into a host-route prefix.
pub(crate) fn parse_prefix_str(s: &str) -> Result<IpNet, Error> {
    if s.contains('/') {
        return s.parse().map_err(|_| Error::InvalidCidr(s.to_string()));
    }
    let addr: IpAddr = s.parse().map_err(|_| Error::InvalidCidr(s.to_string()))?;
    let len = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    IpNet::new(addr, len).map_err(|_| Error::InvalidCidr(s.to_string()))
}

impl Alias {
    /// parse an alias from its policy string form.
    pub fn parse(s: &str) -> Result<Self, Error> {
        // literal addresses and prefixes win over symbolic forms
        if let Ok(prefix) = parse_prefix_str(s) {
            return Ok(Alias::Prefix(prefix));
        }

        match s {
            "*" => Ok(Alias::Asterix),
            s if s.starts_with("group:") => Ok(Alias::Group(s.to_string())),
            s if s.starts_with("tag:") => Ok(Alias::Tag(s.to_string())),
            s if s.starts_with("autogroup:") => Ok(Alias::AutoGroup(AutoGroup::parse(s)?)),
            s if s.contains('@') => Ok(Alias::Username(s.to_string())),
            s if !s.contains(':') && !s.is_empty() => Ok(Alias::Host(s.to_string())),
            other => Err(Error::UnknownAlias(other.to_string())),
        }
    }

    /// the policy string form.
    pub fn as_string(&self) -> String {
        match self {
            Alias::Asterix => "*".to_string(),
            Alias::Username(u) => u.clone(),
            Alias::Group(g) => g.clone(),
            Alias::Tag(t) => t.clone(),
            Alias::Host(h) => h.clone(),
            Alias::Prefix(p) => p.to_string(),
            Alias::AutoGroup(ag) => ag.as_str().to_string(),
        }
    }

    /// resolve this alias to the set of addresses it names.
    ///
    /// `autogroup:self` is context-sensitive and handled by the per-node
    /// compilers; resolving it here is an error, as is `autogroup:nonroot`
    /// outside ssh users.
    pub fn resolve(&self, policy: &Policy, users: &[User], nodes: &[Node]) -> Result<IpSet, Error> {
        let mut b = IpSetBuilder::new();
        match self {
            Alias::Asterix | Alias::AutoGroup(AutoGroup::DangerAll) => {
                b.add_prefix("0.0.0.0/0".parse().expect("valid prefix"));
                b.add_prefix("::/0".parse().expect("valid prefix"));
            }
            Alias::Username(username) => {
                add_user_nodes(&mut b, username, users, nodes);
            }
            Alias::Group(group) => {
                let members = policy
                    .groups
                    .get(group)
                    .ok_or_else(|| Error::UnknownGroup(group.clone()))?;
                for member in members {
                    add_user_nodes(&mut b, member, users, nodes);
                }
            }
            Alias::Tag(tag) => {
                for node in nodes.iter().filter(|n| n.has_tag(tag)) {
                    for ip in node.ips() {
                        b.add_ip(ip);
                    }
                }
            }
            Alias::Host(host) => {
                let prefix = policy
                    .hosts
                    .get(host)
                    .ok_or_else(|| Error::UnknownHost(host.clone()))?;
                b.add_prefix(*prefix);
            }
            Alias::Prefix(prefix) => {
                b.add_prefix(*prefix);
            }
            Alias::AutoGroup(AutoGroup::Internet) => {
                return Ok(the_internet().clone());
            }
            Alias::AutoGroup(AutoGroup::Member) => {
                for node in nodes.iter().filter(|n| !n.is_tagged()) {
                    for ip in node.ips() {
                        b.add_ip(ip);
                    }
                }
            }
            Alias::AutoGroup(AutoGroup::Tagged) => {
                for node in nodes.iter().filter(|n| n.is_tagged()) {
                    for ip in node.ips() {
                        b.add_ip(ip);
                    }
                }
            }
            Alias::AutoGroup(AutoGroup::SelfNodes) => return Err(Error::SelfRequiresNode),
            Alias::AutoGroup(AutoGroup::NonRoot) => return Err(Error::NonRootOutsideSshUsers),
        }
        Ok(b.build())
    }

    /// whether this alias is `autogroup:self`.
    pub fn is_self(&self) -> bool {
        matches!(self, Alias::AutoGroup(AutoGroup::SelfNodes))
    }

    /// whether this alias is `autogroup:internet`.
    pub fn is_internet(&self) -> bool {
        matches!(self, Alias::AutoGroup(AutoGroup::Internet))
    }
}

/// add all ips of a user's untagged nodes to the builder.
fn add_user_nodes(b: &mut IpSetBuilder, username: &str, users: &[User], nodes: &[Node]) {
    let Some(user) = users.iter().find(|u| u.username() == username) else {
        return;
    };
    for node in nodes {
        if node.is_tagged() {
            continue;
        }
        if node.user_id == Some(user.id) {
            for ip in node.ips() {
                b.add_ip(ip);
            }
        }
    }
}

/// the fixed "internet" address set.
///
/// all of ipv4 and 2000::/3, minus private ranges, link-local, the
/// tailnet ula range and the cgnat pool. generated once and cached; the
/// resulting prefix list is part of the wire contract.
pub(crate) fn the_internet() -> &'static IpSet {
    static THE_INTERNET: OnceLock<IpSet> = OnceLock::new();
    THE_INTERNET.get_or_init(|| {
        let mut b = IpSetBuilder::new();
        b.add_prefix("2000::/3".parse().expect("valid prefix"));
        b.add_prefix("0.0.0.0/0".parse().expect("valid prefix"));

        b.remove_prefix("10.0.0.0/8".parse().expect("valid prefix"));
        b.remove_prefix("172.16.0.0/12".parse().expect("valid prefix"));
        b.remove_prefix("192.168.0.0/16".parse().expect("valid prefix"));
        b.remove_prefix("169.254.0.0/16".parse().expect("valid prefix"));
        b.remove_prefix("100.64.0.0/10".parse().expect("valid prefix"));

        b.remove_prefix("fc00::/7".parse().expect("valid prefix"));
        b.remove_prefix("fe80::/10".parse().expect("valid prefix"));
        b.remove_prefix("fd7a:115c:a1e0::/48".parse().expect("valid prefix"));

        b.build()
    })
}

impl Serialize for Alias {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for Alias {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Alias::parse(&s).map_err(de::Error::custom)
    }
}

/// a destination alias with its port list.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasWithPorts {
    /// the destination identity.
    pub alias: Alias,
    /// allowed port ranges.
    pub ports: Vec<PortRange>,
}

impl AliasWithPorts {
    /// the policy string form, `alias:ports`.
    pub fn as_string(&self) -> String {
        format!("{}:{}", self.alias.as_string(), format_ports(&self.ports))
    }
}

impl Serialize for AliasWithPorts {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for AliasWithPorts {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let (alias_part, ports_part) = split_destination(&s).map_err(de::Error::custom)?;
        let alias = Alias::parse(alias_part).map_err(de::Error::custom)?;
        let ports = parse_ports(ports_part).map_err(de::Error::custom)?;
        Ok(AliasWithPorts { alias, ports })
    }
}

/// split `alias:ports` at the final colon.
///
/// the alias itself may contain colons (`tag:web`, ipv6 literals), so the
/// port spec is whatever follows the last one.
fn split_destination(dest: &str) -> Result<(&str, &str), Error> {
    let idx = dest
        .rfind(':')
        .ok_or_else(|| Error::InvalidPort(dest.to_string()))?;
    let (alias, ports) = (&dest[..idx], &dest[idx + 1..]);
    if alias.is_empty() || ports.is_empty() {
        return Err(Error::InvalidPort(dest.to_string()));
    }
    Ok((alias, ports))
}

/// parse a port spec: `*`, a port, a comma list, or inclusive `a-b` ranges.
pub(crate) fn parse_ports(spec: &str) -> Result<Vec<PortRange>, Error> {
    if spec == "*" {
        return Ok(vec![PortRange::ANY]);
    }

    let mut ports = Vec::new();
    for part in spec.split(',') {
        match part.split_once('-') {
            None => {
                let port: u16 = part
                    .parse()
                    .map_err(|_| Error::InvalidPort(spec.to_string()))?;
                ports.push(PortRange::single(port));
            }
            Some((first, last)) => {
                let first: u16 = first
                    .parse()
                    .map_err(|_| Error::InvalidPort(spec.to_string()))?;
                let last: u16 = last
                    .parse()
                    .map_err(|_| Error::InvalidPort(spec.to_string()))?;
                if first > last {
                    return Err(Error::InvalidPort(spec.to_string()));
                }
                ports.push(PortRange { first, last });
            }
        }
    }
    Ok(ports)
}

fn format_ports(ports: &[PortRange]) -> String {
    ports
        .iter()
        .map(|p| {
            if *p == PortRange::ANY {
                "*".to_string()
            } else if p.first == p.last {
                p.first.to_string()
            } else {
                format!("{}-{}", p.first, p.last)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_wildcard() {
        assert_eq!(Alias::parse("*").unwrap(), Alias::Asterix);
    }

    #[test]
    fn parse_username() {
        assert_eq!(
            Alias::parse("alice@example.com").unwrap(),
            Alias::Username("alice@example.com".to_string())
        );
    }

    #[test]
    fn parse_group_and_tag() {
        assert_eq!(
            Alias::parse("group:eng").unwrap(),
            Alias::Group("group:eng".to_string())
        );
        assert_eq!(
            Alias::parse("tag:web").unwrap(),
            Alias::Tag("tag:web".to_string())
        );
    }

    #[test]
    fn parse_prefix_and_bare_ip() {
        assert_eq!(
            Alias::parse("192.168.1.0/24").unwrap(),
            Alias::Prefix("192.168.1.0/24".parse().unwrap())
        );
        assert_eq!(
            Alias::parse("100.100.100.100").unwrap(),
            Alias::Prefix("100.100.100.100/32".parse().unwrap())
        );
        assert_eq!(
            Alias::parse("fd7a:115c:a1e0::2").unwrap(),
            Alias::Prefix("fd7a:115c:a1e0::2/128".parse().unwrap())
        );
    }

    #[test]
    fn parse_host() {
        assert_eq!(
            Alias::parse("git-server").unwrap(),
            Alias::Host("git-server".to_string())
        );
    }

    #[test]
    fn parse_autogroups() {
        assert_eq!(
            Alias::parse("autogroup:internet").unwrap(),
            Alias::AutoGroup(AutoGroup::Internet)
        );
        assert_eq!(
            Alias::parse("autogroup:danger-all").unwrap(),
            Alias::AutoGroup(AutoGroup::DangerAll)
        );
    }

    #[test]
    fn unknown_autogroup_rejected() {
        assert!(matches!(
            Alias::parse("autogroup:admin"),
            Err(Error::UnknownAutogroup(_))
        ));
    }

    #[test]
    fn destination_with_ports() {
        let d: AliasWithPorts = serde_json::from_str(r#""tag:web:80,443""#).unwrap();
        assert_eq!(d.alias, Alias::Tag("tag:web".to_string()));
        assert_eq!(d.ports, vec![PortRange::single(80), PortRange::single(443)]);
    }

    #[test]
    fn destination_wildcard_port() {
        let d: AliasWithPorts = serde_json::from_str(r#""git-server:*""#).unwrap();
        assert_eq!(d.alias, Alias::Host("git-server".to_string()));
        assert_eq!(d.ports, vec![PortRange::ANY]);
    }

    #[test]
    fn destination_ipv6_with_port() {
        let d: AliasWithPorts = serde_json::from_str(r#""fd7a:115c:a1e0::2:22""#).unwrap();
        assert_eq!(
            d.alias,
            Alias::Prefix("fd7a:115c:a1e0::2/128".parse().unwrap())
        );
        assert_eq!(d.ports, vec![PortRange::single(22)]);
    }

    #[test]
    fn destination_port_range() {
        let d: AliasWithPorts = serde_json::from_str(r#""*:5000-5010""#).unwrap();
        assert_eq!(d.ports, vec![PortRange { first: 5000, last: 5010 }]);
    }

    #[test]
    fn inverted_port_range_rejected() {
        assert!(parse_ports("5010-5000").is_err());
    }

    #[test]
    fn destination_roundtrip() {
        for s in ["tag:web:80,443", "git-server:*", "192.168.1.0/24:22", "*:5000-5010"] {
            let d: AliasWithPorts = serde_json::from_str(&format!("\"{s}\"")).unwrap();
            assert_eq!(d.as_string(), s);
        }
    }

    #[test]
    fn the_internet_excludes_private_space() {
        let internet = the_internet();
        assert!(!internet.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!internet.contains(&"192.168.1.1".parse().unwrap()));
        assert!(!internet.contains(&"172.16.0.1".parse().unwrap()));
        assert!(!internet.contains(&"100.64.0.1".parse().unwrap()));
        assert!(!internet.contains(&"169.254.1.1".parse().unwrap()));
        assert!(!internet.contains(&"fd7a:115c:a1e0::1".parse().unwrap()));
        assert!(internet.contains(&"8.8.8.8".parse().unwrap()));
        assert!(internet.contains(&"2606:4700::1111".parse().unwrap()));
    }

    #[test]
    fn the_internet_is_cached() {
        assert!(std::ptr::eq(the_internet(), the_internet()));
    }
}
