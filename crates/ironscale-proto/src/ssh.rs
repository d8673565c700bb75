//! ssh policy wire types.
//!
//! sent to clients inside the map response; the wire format uses
//! lowercase/camelcase field names, matching the upstream client.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// ssh policy for incoming connections; first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshPolicy {
    /// rules evaluated in order.
    pub rules: Vec<SshRule>,
}

/// a single ssh rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshRule {
    /// principals that can match this rule.
    pub principals: Vec<SshPrincipal>,

    /// ssh user to local user mapping.
    ///
    /// keys: ssh username or "*". values: local username, "=" for
    /// same-as-ssh-user, "" to deny.
    pub ssh_users: HashMap<String, String>,

    /// action when the rule matches.
    pub action: SshAction,

    /// environment variable globs the server will accept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_env: Option<Vec<String>>,
}

/// who an ssh rule applies to. any matching field matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshPrincipal {
    /// node's tailnet ip address.
    #[serde(rename = "nodeIP", default, skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<String>,

    /// user's login email.
    #[serde(rename = "userLogin", default, skip_serializing_if = "Option::is_none")]
    pub user_login: Option<String>,

    /// match any connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<bool>,
}

impl SshPrincipal {
    /// a principal matching one node ip.
    pub fn node_ip(ip: impl Into<String>) -> Self {
        Self {
            node_ip: Some(ip.into()),
            ..Default::default()
        }
    }
}

/// the action for a matching ssh rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshAction {
    /// message shown to the connecting user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// reject the connection (wins over accept).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject: Option<bool>,

    /// accept the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<bool>,

    /// allow ssh agent forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_agent_forwarding: Option<bool>,

    /// url the destination must call back to resolve the final verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_and_delegate: Option<String>,

    /// allow local port forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_local_port_forwarding: Option<bool>,

    /// allow remote port forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_remote_port_forwarding: Option<bool>,
}

impl SshAction {
    /// a full accept action with forwarding enabled.
    pub fn accept() -> Self {
        Self {
            accept: Some(true),
            allow_agent_forwarding: Some(true),
            allow_local_port_forwarding: Some(true),
            allow_remote_port_forwarding: Some(true),
            ..Default::default()
        }
    }

    /// a rejection with a message.
    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            reject: Some(true),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// a hold-and-delegate action pointing at the given url.
    pub fn hold_and_delegate(url: impl Into<String>) -> Self {
        Self {
            hold_and_delegate: Some(url.into()),
            ..Default::default()
        }
    }

    /// whether this action delegates the verdict.
    pub fn is_check(&self) -> bool {
        self.hold_and_delegate.is_some()
    }
}
