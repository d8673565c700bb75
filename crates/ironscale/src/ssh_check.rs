//! ssh check-mode state.
//!
//! check-mode rules force the source to re-authenticate before the
//! destination admits the connection. successful checks are remembered
//! in memory for a recency window; a restart forgets them, which fails
//! safe by forcing a fresh authentication.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use ironscale_types::NodeId;

/// default recency window when a rule carries no checkPeriod.
pub const DEFAULT_CHECK_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// key for a recorded check auth. `dst_specific` distinguishes an auth
/// for one destination from a global one covering any destination.
type CheckPair = (NodeId, NodeId, bool);

/// a pending delegation token handed out by the action handler.
struct PendingCheck {
    src: NodeId,
    dst: NodeId,
    created_at: DateTime<Utc>,
}

/// in-memory ssh check-mode state.
#[derive(Default)]
pub struct SshCheckState {
    auth: Mutex<HashMap<CheckPair, DateTime<Utc>>>,
    tokens: Mutex<HashMap<String, PendingCheck>>,
}

impl SshCheckState {
    /// create empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// record a successful check authentication for (src, dst).
    pub fn record_auth(&self, src: NodeId, dst: NodeId, dst_specific: bool) {
        self.auth
            .lock()
            .expect("ssh check mutex poisoned")
            .insert((src, if dst_specific { dst } else { NodeId(0) }, dst_specific), Utc::now());
    }

    /// when (src, dst) last completed a check auth, if ever.
    ///
    /// a dst-specific record only matches the same destination; a global
    /// record matches any.
    pub fn auth_time(&self, src: NodeId, dst: NodeId, dst_specific: bool) -> Option<DateTime<Utc>> {
        let auth = self.auth.lock().expect("ssh check mutex poisoned");
        if dst_specific {
            auth.get(&(src, dst, true)).copied()
        } else {
            auth.get(&(src, NodeId(0), false)).copied()
        }
    }

    /// whether (src, dst) has a check auth within the window, specific or
    /// global.
    pub fn recently_authed(&self, src: NodeId, dst: NodeId, window: Duration) -> bool {
        let now = Utc::now();
        let fresh = |t: DateTime<Utc>| {
            now.signed_duration_since(t)
                .to_std()
                .map(|d| d < window)
                .unwrap_or(true)
        };

        self.auth_time(src, dst, true).map(&fresh).unwrap_or(false)
            || self.auth_time(src, dst, false).map(&fresh).unwrap_or(false)
    }

    /// forget every recorded auth (policy change invalidates them).
    pub fn clear(&self) {
        self.auth.lock().expect("ssh check mutex poisoned").clear();
    }

    /// mint a delegation token for a pending (src, dst) check.
    pub fn create_token(&self, src: NodeId, dst: NodeId) -> String {
        let token = format!("{}-{}", src.0, random_token());
        self.tokens.lock().expect("ssh check mutex poisoned").insert(
            token.clone(),
            PendingCheck {
                src,
                dst,
                created_at: Utc::now(),
            },
        );
        token
    }

    /// consume a token, returning its (src, dst) when it is valid for the
    /// given pair and younger than the window.
    pub fn take_token(
        &self,
        token: &str,
        src: NodeId,
        dst: NodeId,
        window: Duration,
    ) -> Option<(NodeId, NodeId)> {
        let mut tokens = self.tokens.lock().expect("ssh check mutex poisoned");
        let pending = tokens.get(token)?;

        if pending.src != src || pending.dst != dst {
            return None;
        }
        let age = Utc::now().signed_duration_since(pending.created_at);
        if age.to_std().map(|d| d > window).unwrap_or(false) {
            tokens.remove(token);
            return None;
        }

        let pending = tokens.remove(token)?;
        Some((pending.src, pending.dst))
    }
}

fn random_token() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
