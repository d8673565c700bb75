//! api keys for the admin surface.
//!
//! keys use the split form `prefix.secret`: the url-safe prefix is stored
//! for lookup and display, the secret is bcrypt-hashed and only shown at
//! creation time.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// length of the lookup prefix.
pub const API_KEY_PREFIX_LEN: usize = 7;

/// length of the hashed secret.
pub const API_KEY_SECRET_LEN: usize = 32;

const URLSAFE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// an api key for authenticating with the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// unique identifier.
    pub id: u64,

    /// url-safe lookup prefix, unique.
    pub prefix: String,

    /// bcrypt hash of the secret half.
    pub hash: String,

    /// when this key was created.
    pub created_at: DateTime<Utc>,

    /// when this key expires.
    pub expiration: Option<DateTime<Utc>>,

    /// when this key was last used for authentication.
    pub last_seen: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// generate a new api key.
    ///
    /// returns the full `prefix.secret` string, which is only visible once,
    /// together with the storable key record.
    pub fn generate(expiration: Option<DateTime<Utc>>) -> crate::Result<(String, Self)> {
        let prefix = random_urlsafe(API_KEY_PREFIX_LEN);
        let secret = random_urlsafe(API_KEY_SECRET_LEN);

        let hash = bcrypt::hash(&secret, bcrypt::DEFAULT_COST)
            .map_err(|e| crate::Error::InvalidData(format!("hashing api key: {e}")))?;

        let full = format!("{prefix}.{secret}");
        let key = Self {
            id: 0,
            prefix,
            hash,
            created_at: Utc::now(),
            expiration,
            last_seen: None,
        };
        Ok((full, key))
    }

    /// split a presented `prefix.secret` string into its halves.
    pub fn split(key_str: &str) -> Option<(&str, &str)> {
        key_str.split_once('.')
    }

    /// verify a presented secret against the stored hash.
    pub fn verify(&self, secret: &str) -> bool {
        bcrypt::verify(secret, &self.hash).unwrap_or(false)
    }

    /// check if this key is expired.
    pub fn is_expired(&self) -> bool {
        match &self.expiration {
            None => false,
            Some(exp) => Utc::now() > *exp,
        }
    }
}

fn random_urlsafe(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| URLSAFE_ALPHABET[rng.gen_range(0..URLSAFE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_verify() {
        let (full, key) = ApiKey::generate(None).unwrap();
        let (prefix, secret) = ApiKey::split(&full).unwrap();

        assert_eq!(prefix, key.prefix);
        assert_eq!(prefix.len(), API_KEY_PREFIX_LEN);
        assert_eq!(secret.len(), API_KEY_SECRET_LEN);
        assert!(key.verify(secret));
        assert!(!key.verify("wrong-secret"));
    }

    #[test]
    fn split_rejects_malformed() {
        assert!(ApiKey::split("no-separator").is_none());
    }

    #[test]
    fn expiration() {
        let (_, mut key) = ApiKey::generate(None).unwrap();
        assert!(!key.is_expired());

        key.expiration = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(key.is_expired());
    }
}
