//! pending interactive registrations.
//!
//! when a client registers without credentials it receives an auth url
//! and polls with a followup request. the identity callback - an
//! external event source - completes the pending entry and wakes the
//! waiting poll.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use ironscale_types::{HostInfo, MachineKey, NodeId, NodeKey, User};

/// the outcome of a completed interactive registration.
#[derive(Debug, Clone)]
pub struct CompletedRegistration {
    /// the authenticated user.
    pub user: User,
    /// the node created for them.
    pub node_id: NodeId,
}

/// a registration waiting for interactive authentication.
pub struct PendingRegistration {
    /// node key from the original request.
    pub node_key: NodeKey,
    /// machine key from the noise handshake.
    pub machine_key: MachineKey,
    /// host information from the original request.
    pub hostinfo: Option<HostInfo>,
    /// whether the client asked for an ephemeral node.
    pub ephemeral: bool,
    /// when the entry was created; stale entries are dropped.
    pub created_at: Instant,

    completed: Mutex<Option<CompletedRegistration>>,
    /// woken when the registration completes.
    pub notify: Notify,
}

impl PendingRegistration {
    /// create a pending entry from the registration request.
    pub fn new(
        node_key: NodeKey,
        machine_key: MachineKey,
        hostinfo: Option<HostInfo>,
        ephemeral: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_key,
            machine_key,
            hostinfo,
            ephemeral,
            created_at: Instant::now(),
            completed: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    /// mark the registration complete and wake waiters.
    pub async fn complete(&self, completed: CompletedRegistration) {
        *self.completed.lock().await = Some(completed);
        self.notify.notify_waiters();
    }

    /// the completion outcome, when authentication has finished.
    pub async fn get_completed(&self) -> Option<CompletedRegistration> {
        self.completed.lock().await.clone()
    }
}
