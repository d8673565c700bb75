//! handlers for ssh check-mode delegation.
//!
//! when a compiled ssh rule says `check`, the destination node holds the
//! incoming connection and calls `/machine/ssh/action/{src}/to/{dst}`.
//! a recent successful check answers accept immediately; otherwise the
//! destination receives a hold-and-delegate action with a wait url and
//! polls it until authentication completes.

use axum::{
    Json,
    extract::{Path, State},
};
use tracing::{debug, info};

use ironscale_db::Database;
use ironscale_proto::SshAction;
use ironscale_types::{Node, NodeId};

use super::{ApiError, OptionExt, OptionalMachineKeyContext, ResultExt};
use crate::{AppState, DEFAULT_CHECK_WINDOW};

/// check-mode action endpoint, called by the destination node.
pub async fn ssh_action(
    State(state): State<AppState>,
    OptionalMachineKeyContext(machine_key_ctx): OptionalMachineKeyContext,
    Path((src_id, dst_id)): Path<(u64, u64)>,
) -> Result<Json<SshAction>, ApiError> {
    let (src, dst) = load_checked_pair(&state, src_id, dst_id, machine_key_ctx).await?;

    // tagged sources have no user to authenticate
    if src.is_tagged() {
        return Ok(Json(SshAction::reject(
            "SSH access denied: source node is tagged\n",
        )));
    }

    // a user-owned destination only admits its own user's devices
    if !dst.is_tagged() && dst.user_id != src.user_id {
        return Ok(Json(SshAction::reject(
            "SSH access denied: different users\n",
        )));
    }

    if src.is_expired() {
        return Ok(Json(SshAction::reject(
            "SSH access denied: source node is expired\n",
        )));
    }

    let window = check_window(&state).await;
    if state.ssh_check.recently_authed(src.id, dst.id, window) {
        debug!(src = %src.id, dst = %dst.id, "check-mode auth still fresh, accepting");
        let mut action = SshAction::accept();
        action.message = Some(format!(
            "SSH connection from {} authorized (recent authentication)\n",
            src.hostname
        ));
        return Ok(Json(action));
    }

    // no fresh auth: hand out a wait url with a one-shot token
    let token = state.ssh_check.create_token(src.id, dst.id);
    let wait_url = format!("/machine/ssh/wait/{}/to/{}/a/{}", src.id, dst.id, token);

    debug!(src = %src.id, dst = %dst.id, "check-mode requires authentication");

    let mut action = SshAction::hold_and_delegate(wait_url);
    action.message = Some(format!(
        "Authentication required for SSH connection from {}...\n",
        src.hostname
    ));
    Ok(Json(action))
}

/// check-mode wait endpoint, polled by the destination until the source
/// finishes authenticating.
pub async fn ssh_wait(
    State(state): State<AppState>,
    OptionalMachineKeyContext(machine_key_ctx): OptionalMachineKeyContext,
    Path((src_id, dst_id, token)): Path<(u64, u64, String)>,
) -> Result<Json<SshAction>, ApiError> {
    let (src, dst) = load_checked_pair(&state, src_id, dst_id, machine_key_ctx).await?;

    let window = check_window(&state).await;
    if state
        .ssh_check
        .take_token(&token, src.id, dst.id, window)
        .is_none()
    {
        return Err(ApiError::unauthorized("invalid auth token"));
    }

    // the token round-trip is the authentication event
    state.ssh_check.record_auth(src.id, dst.id, true);
    info!(src = %src.id, dst = %dst.id, "ssh check-mode authentication completed");

    let mut action = SshAction::accept();
    action.message = Some(format!("SSH connection from {} authorized\n", src.hostname));
    Ok(Json(action))
}

/// load both nodes and verify the caller is the destination machine.
async fn load_checked_pair(
    state: &AppState,
    src_id: u64,
    dst_id: u64,
    machine_key_ctx: Option<super::MachineKeyContext>,
) -> Result<(Node, Node), ApiError> {
    let dst = state
        .db
        .get_node(NodeId(dst_id))
        .await
        .map_internal()?
        .or_not_found("destination node not found")?;

    // the delegation endpoints are called by the destination itself; the
    // machine key of the connection must be its own
    match machine_key_ctx {
        Some(ctx) => {
            if ctx.0 != dst.machine_key {
                return Err(ApiError::unauthorized("machine key mismatch"));
            }
        }
        None => {
            if !state.config.allow_unauthenticated_registration {
                return Err(ApiError::unauthorized(
                    "SSH delegation requires the Noise control channel",
                ));
            }
        }
    }

    let src = state
        .db
        .get_node(NodeId(src_id))
        .await
        .map_internal()?
        .or_not_found("source node not found")?;

    Ok((src, dst))
}

/// the recency window: the shortest checkPeriod among check rules, or
/// the default when none declares one.
async fn check_window(state: &AppState) -> std::time::Duration {
    let engine = state.policy.read().await;
    engine
        .policy()
        .ssh
        .iter()
        .filter(|rule| rule.action == ironscale_policy::SshActionKind::Check)
        .filter_map(|rule| rule.check_period)
        .min()
        .unwrap_or(DEFAULT_CHECK_WINDOW)
}
