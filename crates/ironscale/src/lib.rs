//! ironscale - mesh vpn coordination server.
//!
//! the control-plane core: node registration, the authoritative tailnet
//! view (users, nodes, keys, policy, routes), and incremental network
//! maps pushed to every connected node over long-lived streams.

pub mod batcher;
pub mod cli;
mod derp;
pub mod handlers;
pub mod mapper;
mod registration_cache;
mod ssh_check;

pub use batcher::{Batcher, BatcherError};
pub use mapper::{Mapper, MapperError};
pub use registration_cache::{CompletedRegistration, PendingRegistration};
pub use ssh_check::{DEFAULT_CHECK_WINDOW, SshCheckState};

use std::path::Path;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use zeroize::Zeroizing;

use ironscale_db::{Database, IpAllocator, IronscaleDb};
use ironscale_policy::{Policy, PolicyEngine};
use ironscale_proto::DerpMap;
use ironscale_types::{ChangeSet, Config, Node, NodeId, RegistrationId, User};

/// application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// the repository.
    pub db: IronscaleDb,
    /// the active policy engine; swapped wholesale on policy writes.
    pub policy: Arc<RwLock<PolicyEngine>>,
    /// server configuration.
    pub config: Arc<Config>,
    /// the session fan-out engine.
    pub batcher: Batcher,
    /// the active derp map.
    pub derp_map: Arc<RwLock<DerpMap>>,
    /// ssh check-mode state.
    pub ssh_check: Arc<SshCheckState>,
    /// registrations awaiting interactive authentication.
    pub pending_registrations: Arc<DashMap<RegistrationId, Arc<PendingRegistration>>>,
    /// tailnet address allocator.
    pub ip_allocator: Arc<Mutex<IpAllocator>>,
    /// the server's noise private key, when the noise listener is up.
    pub noise_private_key: Option<Zeroizing<Vec<u8>>>,
}

impl AppState {
    /// assemble the application state and start the batcher.
    ///
    /// loads the stored policy (falling back to the empty policy on a
    /// parse failure, which keeps the tailnet up under the open default)
    /// and seeds the address allocator from existing nodes.
    pub async fn new(
        db: IronscaleDb,
        config: Config,
        noise_private_key: Option<Zeroizing<Vec<u8>>>,
    ) -> Result<Self, ironscale_db::Error> {
        let config = Arc::new(config);

        let engine = match db.get_policy().await? {
            Some(data) => match Policy::from_bytes(data.as_bytes()) {
                Ok(policy) => PolicyEngine::new(policy),
                Err(e) => {
                    warn!(error = %e, "stored policy failed to parse, starting with empty policy");
                    PolicyEngine::empty()
                }
            },
            None => PolicyEngine::empty(),
        };
        let policy = Arc::new(RwLock::new(engine));

        let mut allocator = IpAllocator::new(config.prefix_v4, config.prefix_v6);
        let nodes = db.list_nodes().await?;
        allocator.load_allocated(nodes.iter().flat_map(|n| n.ips()));
        info!(existing_nodes = nodes.len(), "address allocator seeded");

        let derp_map = Arc::new(RwLock::new(derp::load_derp_map(&config.derp)));

        let mapper = Mapper::new(db.clone(), policy.clone(), derp_map.clone(), config.clone());
        let batcher = Batcher::start(mapper, config.tuning.clone());

        Ok(Self {
            db,
            policy,
            config,
            batcher,
            derp_map,
            ssh_check: Arc::new(SshCheckState::new()),
            pending_registrations: Arc::new(DashMap::new()),
            ip_allocator: Arc::new(Mutex::new(allocator)),
            noise_private_key,
        })
    }

    /// validate and apply a new policy document.
    ///
    /// a validation failure rejects the write with no partial apply. a
    /// successful swap broadcasts a policy change and drops recorded ssh
    /// check authentications, whose rules may no longer exist.
    pub async fn set_policy(&self, data: &str) -> Result<(), ironscale_policy::Error> {
        let parsed = Policy::from_bytes(data.as_bytes())?;

        if let Err(e) = self.db.set_policy(data).await {
            warn!(error = %e, "failed to persist policy");
        }

        self.policy.write().await.update_policy(parsed);
        self.ssh_check.clear();
        self.batcher.add_work(ChangeSet::policy()).await;
        info!("policy updated");
        Ok(())
    }

    /// complete a pending interactive registration with an authenticated
    /// user. driven by the identity callback, an external event source.
    pub async fn complete_interactive_registration(
        &self,
        registration_id: &RegistrationId,
        user: User,
    ) -> Result<NodeId, ironscale_db::Error> {
        let pending = self
            .pending_registrations
            .get(registration_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                ironscale_db::Error::NotFound(format!("registration {registration_id}"))
            })?;

        let node = self
            .create_registered_node(
                pending.machine_key.clone(),
                pending.node_key.clone(),
                pending.hostinfo.clone(),
                Some(user.id),
                vec![],
                None,
                pending.ephemeral,
                ironscale_types::RegisterMethod::Oidc,
            )
            .await?;

        pending
            .complete(CompletedRegistration {
                user,
                node_id: node.id,
            })
            .await;

        Ok(node.id)
    }

    /// create a node after successful authentication, assign addresses,
    /// record its routes and announce it to the tailnet.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn create_registered_node(
        &self,
        machine_key: ironscale_types::MachineKey,
        node_key: ironscale_types::NodeKey,
        hostinfo: Option<ironscale_types::HostInfo>,
        user_id: Option<ironscale_types::UserId>,
        forced_tags: Vec<String>,
        auth_key_id: Option<u64>,
        ephemeral: bool,
        register_method: ironscale_types::RegisterMethod,
    ) -> Result<Node, ironscale_db::Error> {
        let hostname = hostinfo
            .as_ref()
            .and_then(|h| h.hostname.clone())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "node".to_string());

        let (ipv4, ipv6) = {
            let mut allocator = self.ip_allocator.lock().await;
            allocator
                .allocate()
                .map_err(|e| ironscale_db::Error::InvalidData(e.to_string()))?
        };

        let now = chrono::Utc::now();
        let node = Node {
            id: NodeId(0),
            machine_key,
            node_key,
            disco_key: Default::default(),
            endpoints: vec![],
            hostinfo,
            ipv4,
            ipv6,
            hostname: hostname.clone(),
            given_name: hostname,
            user_id,
            register_method,
            forced_tags,
            auth_key_id,
            ephemeral,
            expiry: None,
            last_seen: Some(now),
            created_at: now,
            updated_at: now,
            is_online: None,
        };

        let node = self.db.create_node(&node).await?;
        self.sync_node_routes(&node).await?;
        self.batcher.add_work(ChangeSet::node_added(node.id)).await;
        Ok(node)
    }

    /// sync the route table with a node's announced routes and run the
    /// auto-approver over them.
    pub(crate) async fn sync_node_routes(&self, node: &Node) -> Result<bool, ironscale_db::Error> {
        let announced = node.announced_routes().to_vec();
        let mut changed = self.db.save_node_routes(node.id, &announced).await?;

        let approved = {
            let engine = self.policy.read().await;
            let users = self.db.list_users().await?;
            let nodes = self.db.list_nodes().await?;
            ironscale_policy::approved_routes(engine.policy(), &users, node, &nodes)
        };
        if !approved.is_empty() {
            changed |= self.db.enable_approved_routes(node.id, &approved).await?;
        }

        Ok(changed)
    }

    /// delete a node: routes, address reservations, fan-out announcement.
    pub async fn remove_node_from_tailnet(&self, node: &Node) -> Result<(), ironscale_db::Error> {
        let live = self.batcher.live_connected_map();
        let changed = self.db.delete_node_routes(node.id, &live).await?;
        self.db.delete_node(node.id).await?;

        {
            let mut allocator = self.ip_allocator.lock().await;
            for ip in node.ips() {
                allocator.release(ip);
            }
        }

        self.batcher.add_work(ChangeSet::node_removed(node.id)).await;
        for id in changed {
            if id != node.id {
                self.batcher.add_work(ChangeSet::peer_changed(id)).await;
            }
        }
        Ok(())
    }

    /// handle a stream ending for a node: fires the offline transition
    /// and route failover when the last channel is gone, and schedules
    /// ephemeral deletion after the grace window.
    pub(crate) async fn handle_stream_closed(
        &self,
        node_id: NodeId,
        tx: &tokio::sync::mpsc::Sender<ironscale_proto::MapResponse>,
    ) {
        if !self.batcher.remove_node(node_id, tx).await {
            return;
        }

        let live = self.batcher.live_connected_map();
        if live.get(&node_id).copied().unwrap_or(false) {
            // another stream is still up for this node
            return;
        }

        self.batcher
            .add_work(ChangeSet::node_went_offline(node_id))
            .await;

        match self.db.failover_node_routes(node_id, &live).await {
            Ok(changed) => {
                for id in changed {
                    self.batcher.add_work(ChangeSet::peer_changed(id)).await;
                }
            }
            Err(e) => warn!(node_id = %node_id, error = %e, "route failover failed"),
        }

        // ephemeral nodes are deleted once the grace window passes
        // without a reconnect
        let state = self.clone();
        let grace = std::time::Duration::from_secs(self.config.tuning.disconnect_grace_secs);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if state.batcher.is_connected(node_id) {
                return;
            }
            match state.db.get_node(node_id).await {
                Ok(Some(node)) if node.ephemeral => {
                    info!(node_id = %node_id, "deleting ephemeral node after disconnect");
                    if let Err(e) = state.remove_node_from_tailnet(&node).await {
                        warn!(node_id = %node_id, error = %e, "failed to delete ephemeral node");
                    }
                }
                _ => {}
            }
        });
    }
}

/// create the axum application with all control-plane routes.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/machine/register", post(handlers::register))
        .route("/machine/map", post(handlers::map))
        .route("/machine/ssh/action/{src}/to/{dst}", post(handlers::ssh_action))
        .route(
            "/machine/ssh/wait/{src}/to/{dst}/a/{token}",
            post(handlers::ssh_wait),
        )
        .route(
            "/ts2021",
            get(handlers::ts2021_upgrade).post(handlers::ts2021_upgrade),
        )
        .with_state(state)
}

/// load the noise private key from disk, generating one on first start.
pub async fn load_or_generate_noise_key(path: &Path) -> std::io::Result<Zeroizing<Vec<u8>>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let hex_str = contents.trim().strip_prefix("privkey:").unwrap_or(contents.trim());
            let bytes = hex::decode(hex_str).map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "noise private key file is not valid hex",
                )
            })?;
            Ok(Zeroizing::new(bytes))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = ironscale_proto::generate_keypair().map_err(|e| {
                std::io::Error::other(format!("failed to generate noise keypair: {e}"))
            })?;

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let encoded = format!("privkey:{}", hex::encode(&keypair.private));
            tokio::fs::write(path, &encoded).await?;
            info!(path = %path.display(), "generated new noise private key");

            Ok(Zeroizing::new(keypair.private))
        }
        Err(e) => Err(e),
    }
}
