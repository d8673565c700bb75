//! user type representing a namespace of nodes.
//!
//! users are created by the admin surface or on first oidc login. untagged
//! nodes belong to exactly one user; tagged nodes have no user identity at
//! the acl layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// unique identifier for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl UserId {
    /// sentinel user id used when rendering tagged nodes on the wire.
    ///
    /// tagged nodes do not belong to a real user - the tag is their
    /// identity - but the client protocol still wants a user field.
    pub const TAGGED_DEVICES: UserId = UserId(2147455555);
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// an ironscale user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// unique identifier.
    pub id: UserId,

    /// username - used if email is empty. unique unless the user came from
    /// an identity provider, in which case provider_identifier is unique.
    pub name: String,

    /// display name - typically the user's full name.
    pub display_name: Option<String>,

    /// email address from the identity provider.
    pub email: Option<String>,

    /// provider identifier (issuer + subject claim) when provisioned by oidc.
    pub provider_identifier: Option<String>,

    /// provider origin (e.g. "oidc", "cli").
    pub provider: Option<String>,

    /// profile picture url for client display.
    pub profile_pic_url: Option<String>,

    /// when the user was created.
    pub created_at: DateTime<Utc>,
}

impl User {
    /// create a new user with the given name.
    pub fn new(id: UserId, name: String) -> Self {
        Self {
            id,
            name,
            display_name: None,
            email: None,
            provider_identifier: None,
            provider: None,
            profile_pic_url: None,
            created_at: Utc::now(),
        }
    }

    /// the identity used for display and policy evaluation.
    ///
    /// priority: email > name > provider_identifier > id.
    pub fn username(&self) -> String {
        if let Some(email) = self.email.as_deref().filter(|s| !s.is_empty()) {
            return email.to_string();
        }
        if !self.name.is_empty() {
            return self.name.clone();
        }
        if let Some(pi) = self.provider_identifier.as_deref().filter(|s| !s.is_empty()) {
            return pi.to_string();
        }
        self.id.to_string()
    }

    /// display name, falling back to the username.
    pub fn display(&self) -> String {
        self.display_name
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.username())
    }

    /// the local part of the user's email, when they have one.
    pub fn email_local_part(&self) -> Option<&str> {
        let email = self.email.as_deref()?;
        let at = email.rfind('@')?;
        Some(&email[..at])
    }

    /// the domain of the user's email, when they have one.
    pub fn email_domain(&self) -> Option<&str> {
        let email = self.email.as_deref()?;
        let at = email.rfind('@')?;
        Some(&email[at + 1..])
    }
}

impl Default for User {
    fn default() -> Self {
        Self::new(UserId(0), String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_priority() {
        let mut user = User::new(UserId(1), "testuser".to_string());
        assert_eq!(user.username(), "testuser");

        user.email = Some("test@example.com".to_string());
        assert_eq!(user.username(), "test@example.com");
    }

    #[test]
    fn username_falls_back_to_id() {
        let user = User::new(UserId(42), String::new());
        assert_eq!(user.username(), "42");
    }

    #[test]
    fn display_falls_back_to_username() {
        let mut user = User::new(UserId(1), "testuser".to_string());
        assert_eq!(user.display(), "testuser");

        user.display_name = Some("Test User".to_string());
        assert_eq!(user.display(), "Test User");
    }

    #[test]
    fn email_parts() {
        let mut user = User::new(UserId(1), "u".to_string());
        assert!(user.email_local_part().is_none());

        user.email = Some("alice@example.com".to_string());
        assert_eq!(user.email_local_part(), Some("alice"));
        assert_eq!(user.email_domain(), Some("example.com"));
    }

    #[test]
    fn tagged_devices_sentinel() {
        assert_eq!(UserId::TAGGED_DEVICES.0, 2147455555);
    }
}
