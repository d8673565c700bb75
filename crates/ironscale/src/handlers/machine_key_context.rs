//! machine key context from the noise handshake.
//!
//! requests arriving over the upgraded control channel carry the
//! client's cryptographically authenticated machine key as a request
//! extension. handlers extract it to bind the request to the device.

use std::convert::Infallible;

use axum::{extract::FromRequestParts, http::request::Parts};

use ironscale_types::MachineKey;

/// the authenticated machine key of the connection.
#[derive(Debug, Clone)]
pub struct MachineKeyContext(pub MachineKey);

impl MachineKeyContext {
    /// build the context from the raw static key of the handshake.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(MachineKey::from_bytes(bytes))
    }
}

/// extractor yielding the machine key context when present.
///
/// absent outside the noise channel (e.g. direct handler tests); the
/// handlers decide whether that is acceptable.
pub struct OptionalMachineKeyContext(pub Option<MachineKeyContext>);

impl<S> FromRequestParts<S> for OptionalMachineKeyContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalMachineKeyContext(
            parts.extensions.get::<MachineKeyContext>().cloned(),
        ))
    }
}
