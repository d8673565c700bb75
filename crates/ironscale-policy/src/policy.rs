//! the policy document.

use std::collections::HashMap;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::alias::{Alias, AliasWithPorts, parse_prefix_str};
use crate::autoapprovers::AutoApprovers;
use crate::error::Error;
use crate::filter::parse_protocol;
use crate::hujson::standardize;

/// a complete access-control policy.
///
/// parsed from hujson; see [`Policy::from_bytes`]. all references are
/// checked by [`Policy::validate`] before the policy is accepted, so the
/// compilers can assume declared groups and hosts exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// group name (`group:` prefix included) to member usernames.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub groups: HashMap<String, Vec<String>>,

    /// symbolic host names to prefixes.
    #[serde(
        default,
        skip_serializing_if = "HashMap::is_empty",
        deserialize_with = "de_hosts",
        serialize_with = "ser_hosts"
    )]
    pub hosts: HashMap<String, IpNet>,

    /// tag name to the identities allowed to apply it.
    #[serde(default, rename = "tagOwners", skip_serializing_if = "HashMap::is_empty")]
    pub tag_owners: HashMap<String, Vec<Owner>>,

    /// access rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acls: Vec<Acl>,

    /// ssh access rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh: Vec<SshAclRule>,

    /// automatic route approval.
    #[serde(default, rename = "autoApprovers", skip_serializing_if = "AutoApprovers::is_empty")]
    pub auto_approvers: AutoApprovers,
}

/// a single access rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acl {
    /// only "accept" is valid.
    pub action: String,

    /// ip protocol name or number; empty means the implied default set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proto: String,

    /// traffic sources.
    pub src: Vec<Alias>,

    /// traffic destinations with ports.
    pub dst: Vec<AliasWithPorts>,
}

/// an ssh access rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshAclRule {
    /// "accept" or "check".
    pub action: SshActionKind,

    /// recency window for check mode (e.g. "12h"). optional; the server
    /// default applies when unset.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub check_period: Option<Duration>,

    /// who may initiate ssh.
    pub src: Vec<Alias>,

    /// which nodes may be reached.
    pub dst: Vec<Alias>,

    /// ssh usernames allowed on the destination.
    pub users: Vec<SshUserSpec>,

    /// environment variable globs to accept.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accept_env: Vec<String>,
}

/// ssh rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshActionKind {
    /// accept the connection immediately.
    Accept,
    /// hold the connection and delegate the verdict to the control server.
    Check,
}

/// one entry in an ssh rule's user list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshUserSpec(pub String);

impl SshUserSpec {
    /// the literal root user.
    pub fn is_root(&self) -> bool {
        self.0 == "root"
    }

    /// the `autogroup:nonroot` wildcard.
    pub fn is_nonroot(&self) -> bool {
        self.0 == "autogroup:nonroot"
    }

    /// the email domain of a `localpart:*@<domain>` entry, when it is one.
    pub fn localpart_domain(&self) -> Option<&str> {
        self.0
            .strip_prefix("localpart:")
            .and_then(|rest| rest.strip_prefix("*@"))
            .filter(|domain| !domain.is_empty())
    }

    /// a plain ssh username entry.
    pub fn is_plain(&self) -> bool {
        !self.is_root() && !self.is_nonroot() && self.localpart_domain().is_none()
    }
}

/// an identity allowed to own a tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Owner {
    /// a user by email-shaped name.
    Username(String),
    /// a declared group.
    Group(String),
}

impl Serialize for Owner {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Owner::Username(u) => serializer.serialize_str(u),
            Owner::Group(g) => serializer.serialize_str(g),
        }
    }
}

impl<'de> Deserialize<'de> for Owner {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.starts_with("group:") {
            Ok(Owner::Group(s))
        } else if s.contains('@') {
            Ok(Owner::Username(s))
        } else {
            Err(de::Error::custom(Error::InvalidTagOwner(s)))
        }
    }
}

fn de_hosts<'de, D>(deserializer: D) -> Result<HashMap<String, IpNet>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, String> = HashMap::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(name, prefix)| {
            let prefix = parse_prefix_str(&prefix).map_err(de::Error::custom)?;
            Ok((name, prefix))
        })
        .collect()
}

fn ser_hosts<S>(hosts: &HashMap<String, IpNet>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(hosts.len()))?;
    for (name, prefix) in hosts {
        map.serialize_entry(name, &prefix.to_string())?;
    }
    map.end()
}

impl Policy {
    /// an empty policy.
    ///
    /// an empty policy has no acls, which means an open tailnet: the
    /// compilers emit an allow-all filter, matching the reference server.
    pub fn empty() -> Self {
        Self::default()
    }

    /// parse and validate a hujson policy document.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let json = standardize(bytes)?;
        let policy: Policy = serde_json::from_str(&json)?;
        policy.validate()?;
        Ok(policy)
    }

    /// validate internal consistency.
    ///
    /// fails on the first violation; a failed validation means the policy
    /// write is rejected with no partial apply.
    pub fn validate(&self) -> Result<(), Error> {
        for (group, members) in &self.groups {
            if !group.starts_with("group:") {
                return Err(Error::InvalidKey(
                    group.clone(),
                    "group names must start with \"group:\"".to_string(),
                ));
            }
            for member in members {
                if !member.contains('@') {
                    return Err(Error::InvalidUsername(member.clone()));
                }
            }
        }

        for tag in self.tag_owners.keys() {
            if !tag.starts_with("tag:") {
                return Err(Error::InvalidKey(
                    tag.clone(),
                    "tag names must start with \"tag:\"".to_string(),
                ));
            }
        }
        for owners in self.tag_owners.values() {
            for owner in owners {
                if let Owner::Group(group) = owner
                    && !self.groups.contains_key(group)
                {
                    return Err(Error::UnknownGroup(group.clone()));
                }
            }
        }

        for acl in &self.acls {
            if acl.action != "accept" {
                return Err(Error::InvalidAction(acl.action.clone()));
            }
            if acl.src.is_empty() {
                return Err(Error::EmptyList("src"));
            }
            if acl.dst.is_empty() {
                return Err(Error::EmptyList("dst"));
            }

            for src in &acl.src {
                if src.is_self() {
                    return Err(Error::SelfInSources);
                }
                self.check_reference(src)?;
            }

            let (_, needs_wildcard) = parse_protocol(&acl.proto)?;
            for dst in &acl.dst {
                self.check_reference(&dst.alias)?;
                if needs_wildcard
                    && dst
                        .ports
                        .iter()
                        .any(|p| *p != ironscale_proto::PortRange::ANY)
                {
                    return Err(Error::ProtocolRequiresWildcardPorts(acl.proto.clone()));
                }
            }
        }

        for rule in &self.ssh {
            if rule.src.is_empty() {
                return Err(Error::EmptyList("src"));
            }
            if rule.dst.is_empty() {
                return Err(Error::EmptyList("dst"));
            }
            if rule.users.is_empty() {
                return Err(Error::EmptySshUsers);
            }
            for src in &rule.src {
                if src.is_self() {
                    return Err(Error::SelfInSources);
                }
                self.check_reference(src)?;
            }
            for dst in &rule.dst {
                self.check_reference(dst)?;
            }
        }

        self.auto_approvers.validate()?;

        Ok(())
    }

    /// fail on references to undeclared groups/hosts and misplaced
    /// ssh-only autogroups.
    fn check_reference(&self, alias: &Alias) -> Result<(), Error> {
        match alias {
            Alias::Group(group) if !self.groups.contains_key(group) => {
                Err(Error::UnknownGroup(group.clone()))
            }
            Alias::Host(host) if !self.hosts.contains_key(host) => {
                Err(Error::UnknownHost(host.clone()))
            }
            Alias::AutoGroup(crate::alias::AutoGroup::NonRoot) => {
                Err(Error::NonRootOutsideSshUsers)
            }
            _ => Ok(()),
        }
    }

    /// whether a user may apply the given tag, per tagOwners.
    pub fn user_owns_tag(&self, tag: &str, username: &str) -> bool {
        let Some(owners) = self.tag_owners.get(tag) else {
            return false;
        };
        owners.iter().any(|owner| match owner {
            Owner::Username(u) => u == username,
            Owner::Group(group) => self
                .groups
                .get(group)
                .is_some_and(|members| members.iter().any(|m| m == username)),
        })
    }
}
