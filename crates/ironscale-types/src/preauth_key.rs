//! pre-authentication keys for automated node registration.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::user::UserId;

/// number of random bytes in a generated key (hex-encoded on the wire).
const KEY_BYTES: usize = 24;

/// a pre-authentication key.
///
/// pre-auth keys can be:
/// - **reusable**: register any number of nodes
/// - **ephemeral**: nodes registered with it are deleted when they go offline
/// - **tagged**: registered nodes get the key's tags as their identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreAuthKey {
    /// unique identifier.
    pub id: u64,

    /// the opaque key string presented by clients.
    pub key: String,

    /// user who created this key.
    pub user_id: UserId,

    /// whether this key can be used multiple times.
    pub reusable: bool,

    /// whether nodes registered with this key are ephemeral.
    pub ephemeral: bool,

    /// whether this key has been used (non-reusable keys only).
    pub used: bool,

    /// tags stamped onto nodes registered with this key.
    pub tags: Vec<String>,

    /// when this key expires.
    pub expiration: Option<DateTime<Utc>>,

    /// when this key was created.
    pub created_at: DateTime<Utc>,
}

impl PreAuthKey {
    /// generate a fresh key for the given user.
    pub fn generate(user_id: UserId) -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            id: 0,
            key: hex::encode(bytes),
            user_id,
            reusable: false,
            ephemeral: false,
            used: false,
            tags: vec![],
            expiration: None,
            created_at: Utc::now(),
        }
    }

    /// check if this key is expired.
    pub fn is_expired(&self) -> bool {
        match &self.expiration {
            None => false,
            Some(exp) => Utc::now() > *exp,
        }
    }

    /// check if this key is valid for registering a node.
    pub fn is_valid(&self) -> bool {
        !self.is_expired() && (self.reusable || !self.used)
    }

    /// whether nodes registered with this key become tagged nodes.
    pub fn creates_tagged_nodes(&self) -> bool {
        !self.tags.is_empty()
    }
}
