//! registration ids for the interactive login flow.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::Error;

const REGISTRATION_ID_BYTES: usize = 16;

/// an opaque identifier for a pending interactive registration.
///
/// handed to the client as `/register/<id>` in the auth url, and presented
/// back in the followup request while the user completes authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationId(String);

impl RegistrationId {
    /// generate a fresh random id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; REGISTRATION_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// parse an id from its string form.
    pub fn from_string(s: &str) -> Result<Self, Error> {
        if s.len() != REGISTRATION_ID_BYTES * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidRegistrationId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl std::fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
