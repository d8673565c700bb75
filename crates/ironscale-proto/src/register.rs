//! node registration wire types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ironscale_types::{HostInfo, NodeKey};

/// a registration request from a client.
///
/// drives the whole registration state machine: fresh registrations,
/// pre-auth key use, interactive login followups, key rotation and logout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterRequest {
    /// client capability version.
    #[serde(default)]
    pub version: u32,

    /// the node key the client wants to register.
    pub node_key: NodeKey,

    /// previous node key when rotating.
    #[serde(default)]
    pub old_node_key: NodeKey,

    /// authentication material.
    #[serde(default)]
    pub auth: Option<RegisterAuth>,

    /// requested key expiry. a time in the past means logout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,

    /// host information.
    #[serde(default)]
    pub hostinfo: Option<HostInfo>,

    /// request an ephemeral node.
    #[serde(default)]
    pub ephemeral: bool,

    /// auth url from a previous response; set when the client is polling
    /// for interactive login completion.
    #[serde(default)]
    pub followup: String,
}

/// authentication material in a register request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterAuth {
    /// pre-auth key, if registering non-interactively.
    #[serde(default)]
    pub auth_key: String,

    /// identity provider hint.
    #[serde(default)]
    pub provider: String,
}

/// the server's answer to a register request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterResponse {
    /// user info for this node.
    pub user: TailcfgUser,

    /// login info.
    pub login: TailcfgLogin,

    /// the presented node key has expired and must be rotated.
    #[serde(default)]
    pub node_key_expired: bool,

    /// whether the machine is authorized for the tailnet.
    pub machine_authorized: bool,

    /// when non-empty, the user must visit this url to complete auth.
    #[serde(rename = "AuthURL", default, skip_serializing_if = "String::is_empty")]
    pub auth_url: String,

    /// error message when registration failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl RegisterResponse {
    /// an error response with the given message.
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            ..Default::default()
        }
    }
}

/// user info in a register response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TailcfgUser {
    /// user id.
    #[serde(rename = "ID")]
    pub id: i64,

    /// display name.
    #[serde(default)]
    pub display_name: String,
}

/// login info in a register response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TailcfgLogin {
    /// login id.
    #[serde(rename = "ID")]
    pub id: i64,

    /// provider that authenticated the login.
    #[serde(default)]
    pub provider: String,

    /// login name.
    #[serde(default)]
    pub login_name: String,

    /// display name.
    #[serde(default)]
    pub display_name: String,
}

/// early payload written before http/2 on a fresh noise connection.
///
/// framed as 5 magic bytes `"\xff\xff\xffTS"`, a 4-byte big-endian length,
/// then this struct as json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EarlyNoise {
    /// public half of the per-connection node-key challenge.
    pub node_key_challenge: String,
}
