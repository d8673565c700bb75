//! handler for /machine/register.
//!
//! drives the registration state machine: new nodes via pre-auth key or
//! interactive login, re-registration, node-key rotation, logout, and
//! expired-node refresh. request/response shapes match the upstream
//! client.

use axum::{Json, extract::State};
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info};

use ironscale_db::Database;
use ironscale_proto::{
    CapabilityVersion, RegisterRequest, RegisterResponse, TailcfgLogin, TailcfgUser, version_label,
};
use ironscale_types::{ChangeSet, MachineKey, Node, RegisterMethod, RegistrationId, User};

use super::{ApiError, OptionExt, OptionalMachineKeyContext, ResultExt};
use crate::registration_cache::PendingRegistration;
use crate::AppState;

/// handle node registration.
///
/// domain failures (bad or spent keys, authorization) come back as a
/// 200 with the error in the response body, which is what the client
/// displays; protocol failures stay http errors.
///
/// NOTE: the body is read as raw bytes because the client does not send
/// a content-type header over the control channel.
pub async fn register(
    State(state): State<AppState>,
    OptionalMachineKeyContext(machine_key_ctx): OptionalMachineKeyContext,
    body: Bytes,
) -> Result<Json<RegisterResponse>, ApiError> {
    match handle_register(state, machine_key_ctx, body).await {
        Ok(resp) => Ok(resp),
        Err(ApiError::Unauthorized(msg)) => Ok(Json(RegisterResponse::error(msg))),
        Err(e) => Err(e),
    }
}

async fn handle_register(
    state: AppState,
    machine_key_ctx: Option<super::MachineKeyContext>,
    body: Bytes,
) -> Result<Json<RegisterResponse>, ApiError> {
    let req: RegisterRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("invalid JSON request body"))?;

    if req.version < state.config.min_capability_version {
        return Err(ApiError::bad_request(format!(
            "unsupported client version: {} ({})",
            version_label(CapabilityVersion(req.version)),
            req.version
        )));
    }

    // the machine key comes from the noise handshake; outside the noise
    // channel registration is rejected unless tests opted in
    let machine_key = match machine_key_ctx {
        Some(ctx) => ctx.0,
        None => {
            if !state.config.allow_unauthenticated_registration {
                return Err(ApiError::bad_request(
                    "registration requires the Noise control channel",
                ));
            }
            // unique synthetic identity per registration for tests
            let mut bytes = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
            MachineKey::from_bytes(bytes.to_vec())
        }
    };

    if !req.followup.is_empty() {
        return handle_followup(state, &req.followup).await;
    }

    // an already-known machine drives the re-registration transitions
    if let Some(node) = state
        .db
        .get_node_by_machine_key(&machine_key)
        .await
        .map_internal()?
    {
        return handle_known_machine(state, req, node).await;
    }

    let auth_key = req
        .auth
        .as_ref()
        .map(|a| a.auth_key.clone())
        .unwrap_or_default();

    if !auth_key.is_empty() {
        handle_preauth(state, req, machine_key, &auth_key).await
    } else {
        handle_interactive(state, req, machine_key).await
    }
}

/// transitions for a machine the server already knows.
async fn handle_known_machine(
    state: AppState,
    req: RegisterRequest,
    mut node: Node,
) -> Result<Json<RegisterResponse>, ApiError> {
    // logout: a requested expiry in the past expires the node now
    if let Some(expiry) = req.expiry
        && expiry <= Utc::now()
    {
        info!(node_id = %node.id, "node logged out");
        node.expiry = Some(expiry);
        state.db.update_node(&node).await.map_internal()?;
        state.batcher.add_work(ChangeSet::key_expiry(node.id)).await;

        let (user, login) = user_payload(&state, &node).await?;
        return Ok(Json(RegisterResponse {
            user,
            login,
            node_key_expired: true,
            machine_authorized: true,
            ..Default::default()
        }));
    }

    // node-key rotation: old key matches the stored session key
    if !req.old_node_key.is_empty()
        && req.old_node_key == node.node_key
        && req.node_key != node.node_key
    {
        info!(node_id = %node.id, "rotating node key");
        node.node_key = req.node_key.clone();
        node.expiry = req.expiry.filter(|e| *e > Utc::now());
        if let Some(hostinfo) = req.hostinfo.clone() {
            node.hostinfo = Some(hostinfo);
        }
        let node = state.db.update_node(&node).await.map_internal()?;
        state.batcher.add_work(ChangeSet::full()).await;

        let (user, login) = user_payload(&state, &node).await?;
        return Ok(Json(RegisterResponse {
            user,
            login,
            machine_authorized: true,
            ..Default::default()
        }));
    }

    // same session key: refresh, unless the registration has lapsed
    if req.node_key == node.node_key {
        if node.is_expired() {
            debug!(node_id = %node.id, "expired node must re-authenticate");
            return Ok(Json(RegisterResponse {
                node_key_expired: true,
                machine_authorized: false,
                ..Default::default()
            }));
        }

        if let Some(hostinfo) = req.hostinfo.clone() {
            node.hostinfo = Some(hostinfo);
            let node = state.db.update_node(&node).await.map_internal()?;
            if state.sync_node_routes(&node).await.map_internal()? {
                state.batcher.add_work(ChangeSet::peer_changed(node.id)).await;
            }
            node_refresh_response(&state, &node).await
        } else {
            node_refresh_response(&state, &node).await
        }
    } else {
        // unknown session key: the node is re-authenticating (e.g. after
        // expiry). a valid pre-auth key refreshes in place.
        let auth_key = req
            .auth
            .as_ref()
            .map(|a| a.auth_key.clone())
            .unwrap_or_default();

        if auth_key.is_empty() {
            return handle_interactive(state, req, node.machine_key.clone()).await;
        }

        let key = state
            .db
            .get_preauth_key(&auth_key)
            .await
            .map_internal()?
            .or_unauthorized("invalid pre-auth key")?;
        if !key.is_valid() {
            return Err(ApiError::unauthorized("pre-auth key expired or already used"));
        }

        info!(node_id = %node.id, "node re-authenticated with pre-auth key");
        node.node_key = req.node_key.clone();
        node.expiry = req.expiry.filter(|e| *e > Utc::now());
        if let Some(hostinfo) = req.hostinfo.clone() {
            node.hostinfo = Some(hostinfo);
        }
        let node = state.db.update_node(&node).await.map_internal()?;
        if !key.reusable {
            state.db.mark_preauth_key_used(key.id).await.map_internal()?;
        }
        state.batcher.add_work(ChangeSet::full()).await;

        node_refresh_response(&state, &node).await
    }
}

/// registration with a pre-auth key.
async fn handle_preauth(
    state: AppState,
    req: RegisterRequest,
    machine_key: MachineKey,
    auth_key: &str,
) -> Result<Json<RegisterResponse>, ApiError> {
    let key = state
        .db
        .get_preauth_key(auth_key)
        .await
        .map_internal()?
        .or_unauthorized("invalid pre-auth key")?;

    if !key.is_valid() {
        return Err(ApiError::unauthorized("pre-auth key expired or already used"));
    }

    let user = state.db.get_user(key.user_id).await.map_internal()?;

    // the key's tags become the node's identity; requested tags are
    // granted only when the policy's tag owners allow the user
    let mut tags = key.tags.clone();
    if let (Some(hostinfo), Some(user)) = (&req.hostinfo, &user) {
        let engine = state.policy.read().await;
        for tag in &hostinfo.request_tags {
            if engine.policy().user_owns_tag(tag, &user.username()) && !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
    }

    let node = state
        .create_registered_node(
            machine_key,
            req.node_key.clone(),
            req.hostinfo.clone(),
            if key.creates_tagged_nodes() || !tags.is_empty() {
                None
            } else {
                Some(key.user_id)
            },
            tags,
            Some(key.id),
            key.ephemeral || req.ephemeral,
            RegisterMethod::AuthKey,
        )
        .await
        .map_internal()?;

    if !key.reusable {
        state.db.mark_preauth_key_used(key.id).await.map_internal()?;
    }

    info!(node_id = %node.id, hostname = %node.hostname, "node registered with pre-auth key");

    let (user, login) = match user {
        Some(u) => auth_payload(&u, "authkey"),
        None => (TailcfgUser::default(), TailcfgLogin::default()),
    };
    Ok(Json(RegisterResponse {
        user,
        login,
        machine_authorized: true,
        ..Default::default()
    }))
}

/// registration without credentials: park it and hand back an auth url.
async fn handle_interactive(
    state: AppState,
    req: RegisterRequest,
    machine_key: MachineKey,
) -> Result<Json<RegisterResponse>, ApiError> {
    let registration_id = RegistrationId::generate();
    let pending = PendingRegistration::new(
        req.node_key.clone(),
        machine_key,
        req.hostinfo.clone(),
        req.ephemeral,
    );
    state
        .pending_registrations
        .insert(registration_id.clone(), pending);

    debug!(registration_id = %registration_id, "created pending interactive registration");

    Ok(Json(RegisterResponse {
        auth_url: format!("/register/{registration_id}"),
        machine_authorized: false,
        ..Default::default()
    }))
}

/// a followup poll waiting on interactive completion.
async fn handle_followup(
    state: AppState,
    followup: &str,
) -> Result<Json<RegisterResponse>, ApiError> {
    let reg_id_str = followup
        .strip_prefix("/register/")
        .ok_or_else(|| ApiError::bad_request("invalid followup URL"))?;
    let registration_id = RegistrationId::from_string(reg_id_str)
        .map_err(|e| ApiError::bad_request(format!("invalid registration id: {e}")))?;

    let pending = state
        .pending_registrations
        .get(&registration_id)
        .map(|e| e.value().clone())
        .ok_or_else(|| ApiError::bad_request("registration not found or expired"))?;

    if let Some(completed) = pending.get_completed().await {
        state.pending_registrations.remove(&registration_id);
        let (user, login) = auth_payload(&completed.user, "oidc");
        return Ok(Json(RegisterResponse {
            user,
            login,
            machine_authorized: true,
            ..Default::default()
        }));
    }

    // wait for the identity callback, then re-check
    let wait = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        pending.notify.notified(),
    )
    .await;

    if wait.is_ok()
        && let Some(completed) = pending.get_completed().await
    {
        state.pending_registrations.remove(&registration_id);
        let (user, login) = auth_payload(&completed.user, "oidc");
        return Ok(Json(RegisterResponse {
            user,
            login,
            machine_authorized: true,
            ..Default::default()
        }));
    }

    // not done yet - hand the auth url back so the client keeps polling
    Ok(Json(RegisterResponse {
        auth_url: followup.to_string(),
        machine_authorized: false,
        ..Default::default()
    }))
}

async fn node_refresh_response(
    state: &AppState,
    node: &Node,
) -> Result<Json<RegisterResponse>, ApiError> {
    let (user, login) = user_payload(state, node).await?;
    Ok(Json(RegisterResponse {
        user,
        login,
        machine_authorized: true,
        ..Default::default()
    }))
}

async fn user_payload(
    state: &AppState,
    node: &Node,
) -> Result<(TailcfgUser, TailcfgLogin), ApiError> {
    let user = match node.user_id {
        Some(id) => state.db.get_user(id).await.map_internal()?,
        None => None,
    };
    Ok(match user {
        Some(u) => auth_payload(&u, provider_name(node.register_method)),
        None => (TailcfgUser::default(), TailcfgLogin::default()),
    })
}

fn auth_payload(user: &User, provider: &str) -> (TailcfgUser, TailcfgLogin) {
    (
        TailcfgUser {
            id: user.id.0 as i64,
            display_name: user.display(),
        },
        TailcfgLogin {
            id: user.id.0 as i64,
            provider: provider.to_string(),
            login_name: user.username(),
            display_name: user.display(),
        },
    )
}

fn provider_name(method: RegisterMethod) -> &'static str {
    match method {
        RegisterMethod::AuthKey => "authkey",
        RegisterMethod::Oidc => "oidc",
        RegisterMethod::Cli => "cli",
    }
}
