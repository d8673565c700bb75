//! acl policy engine for ironscale.
//!
//! parses hujson policy documents into typed entities, resolves aliases
//! against the live node set, and compiles per-node packet filter and ssh
//! rules compatible with the upstream client.

#![warn(missing_docs)]

mod alias;
mod autoapprovers;
mod engine;
mod error;
mod filter;
mod hujson;
mod ipset;
mod policy;
mod ssh;

pub use alias::{Alias, AliasWithPorts, AutoGroup};
pub use autoapprovers::{AutoApprovers, approved_routes};
pub use engine::PolicyEngine;
pub use error::Error;
pub use filter::{
    compile_filter_rules, compile_filter_rules_for_node, merge_filter_rules, reduce_filter_rules,
};
pub use hujson::standardize;
pub use ipset::{IpSet, IpSetBuilder};
pub use policy::{Acl, Owner, Policy, SshAclRule, SshActionKind, SshUserSpec};
pub use ssh::compile_ssh_policy;

/// result type for policy operations.
pub type Result<T> = std::result::Result<T, Error>;
