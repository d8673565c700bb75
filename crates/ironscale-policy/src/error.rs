//! error types for policy parsing and compilation.

use thiserror::Error;

/// errors that can occur parsing, validating or compiling a policy.
#[derive(Debug, Error)]
pub enum Error {
    /// hujson pre-pass failed (unterminated string or comment).
    #[error("malformed HuJSON: {0}")]
    Hujson(String),

    /// standardized json failed to deserialize.
    #[error("failed to parse policy: {0}")]
    Json(#[from] serde_json::Error),

    /// an alias string did not match any known form.
    #[error("could not determine the type of alias {0:?}")]
    UnknownAlias(String),

    /// an autogroup outside the supported closed set.
    #[error("unknown autogroup {0:?}")]
    UnknownAutogroup(String),

    /// a prefix failed to parse.
    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),

    /// a username without an @.
    #[error("username must contain @, got {0:?}")]
    InvalidUsername(String),

    /// a group reference without a declaration.
    #[error("undeclared group {0:?}")]
    UnknownGroup(String),

    /// a host reference without a declaration.
    #[error("undeclared host {0:?}")]
    UnknownHost(String),

    /// an acl action other than accept.
    #[error("invalid action {0:?}, only \"accept\" is supported")]
    InvalidAction(String),

    /// an ssh action other than accept or check.
    #[error("invalid SSH action {0:?}")]
    InvalidSshAction(String),

    /// autogroup:self appeared in a source list.
    #[error("autogroup:self cannot be used in sources")]
    SelfInSources,

    /// autogroup:self resolved without a target node.
    #[error("autogroup:self requires a target node context")]
    SelfRequiresNode,

    /// autogroup:nonroot outside ssh users.
    #[error("autogroup:nonroot is only valid in SSH users")]
    NonRootOutsideSshUsers,

    /// a port spec failed to parse.
    #[error("invalid port spec {0:?}")]
    InvalidPort(String),

    /// a protocol name or number failed to parse.
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),

    /// a protocol without port semantics was given concrete ports.
    #[error("protocol {0:?} requires wildcard ports")]
    ProtocolRequiresWildcardPorts(String),

    /// a tag owner that is neither a username nor a group.
    #[error("tag owner must be a username or group, got {0:?}")]
    InvalidTagOwner(String),

    /// a tag key without the tag: prefix, or similar key-shape problem.
    #[error("invalid policy key {0:?}: {1}")]
    InvalidKey(String, String),

    /// an ssh rule without users.
    #[error("SSH rule users cannot be empty")]
    EmptySshUsers,

    /// a rule with an empty source or destination list.
    #[error("{0} cannot be empty")]
    EmptyList(&'static str),
}
