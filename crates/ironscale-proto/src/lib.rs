//! control protocol implementation for ironscale.
//!
//! this crate handles:
//! - the noise protocol for the secure control channel
//! - maprequest/mapresponse wire types
//! - the node registration messages
//! - ssh policy wire types

#![warn(missing_docs)]

mod error;
mod map;
mod noise;
mod register;
mod ssh;

pub use error::Error;
pub use map::{
    DerpMap, DerpNode, DerpRegion, DnsConfig, DnsResolver, FilterRule, MapRequest, MapResponse,
    MapResponseNode, NetPortRange, PeerChange, PortRange, UserProfile,
};
pub use noise::{
    EARLY_PAYLOAD_MAGIC, MAX_PLAINTEXT_SIZE, MSG_TYPE_INITIATION, MSG_TYPE_RECORD,
    MSG_TYPE_RESPONSE, NoiseHandshake, NoiseTransport, builder as noise_builder, generate_keypair,
};
pub use register::{EarlyNoise, RegisterAuth, RegisterRequest, RegisterResponse, TailcfgLogin, TailcfgUser};
pub use snow::Keypair;
pub use ssh::{SshAction, SshPolicy, SshPrincipal, SshRule};

use serde::{Deserialize, Serialize};

/// result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// client capability version.
///
/// declares the client's wire-protocol feature level; used to gate features
/// and reject clients too old to understand current map responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapabilityVersion(pub u32);

impl CapabilityVersion {
    /// minimum capability version the server will talk to by default.
    pub const MIN: CapabilityVersion = CapabilityVersion(68);

    /// capability version the server itself speaks.
    pub const CURRENT: CapabilityVersion = CapabilityVersion(106);

    /// early-noise payloads were added in protocol version 49.
    pub const EARLY_NOISE_MIN: CapabilityVersion = CapabilityVersion(49);
}

impl Default for CapabilityVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl std::fmt::Display for CapabilityVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// capability version -> first client release that speaks it.
/// sorted ascending; used for human-readable rejection messages.
const CAPVER_RELEASES: &[(u32, &str)] = &[
    (68, "v1.48.0"),
    (74, "v1.54.0"),
    (79, "v1.58.0"),
    (82, "v1.60.0"),
    (87, "v1.66.0"),
    (90, "v1.68.0"),
    (95, "v1.72.0"),
    (97, "v1.74.0"),
    (100, "v1.76.0"),
    (102, "v1.78.0"),
    (106, "v1.80.0"),
];

/// human-readable client release label for a capability version.
///
/// returns the newest known release at or below `version`, or "unknown"
/// for versions predating the table.
pub fn version_label(version: CapabilityVersion) -> &'static str {
    let mut label = "unknown";
    for (capver, release) in CAPVER_RELEASES {
        if *capver <= version.0 {
            label = release;
        } else {
            break;
        }
    }
    label
}
