//! core types for ironscale - a mesh vpn coordination server.
//!
//! this crate provides the fundamental data structures used throughout
//! ironscale:
//! - [`Node`]: a device coordinated by the tailnet
//! - [`User`]: user/namespace management
//! - [`PreAuthKey`]: pre-authentication keys for automated registration
//! - [`ApiKey`]: admin api credentials
//! - [`Route`]: advertised/enabled subnet and exit routes
//! - [`ChangeSet`]: typed change events feeding the session fan-out
//! - [`Config`]: application configuration

#![warn(missing_docs)]

mod api_key;
mod change;
mod config;
mod error;
mod keys;
mod node;
mod preauth_key;
mod registration;
mod route;
pub mod test_utils;
mod user;

pub use api_key::{API_KEY_PREFIX_LEN, API_KEY_SECRET_LEN, ApiKey};
pub use change::{Change, ChangeSet};
pub use config::{Config, DatabaseConfig, DerpConfig, DnsConfig, TuningConfig};
pub use error::Error;
pub use keys::{DiscoKey, MachineKey, NodeKey};
pub use node::{HostInfo, NetInfo, Node, NodeId, RegisterMethod};
pub use preauth_key::PreAuthKey;
pub use registration::RegistrationId;
pub use route::{EXIT_ROUTE_V4, EXIT_ROUTE_V6, Route, RouteId, is_exit_route};
pub use user::{User, UserId};

/// result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;
