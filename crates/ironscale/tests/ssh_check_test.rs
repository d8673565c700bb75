//! ssh check-mode delegation round-trip tests.

mod common;

use axum::http::StatusCode;
use tower::ServiceExt;

use common::*;
use ironscale::create_app;
use ironscale_db::Database;
use ironscale_proto::SshAction;
use ironscale_types::NodeId;

async fn get_action(
    app: &axum::Router,
    uri: &str,
    machine_key: Vec<u8>,
) -> (StatusCode, Option<SshAction>) {
    let response = app
        .clone()
        .oneshot(post_with_machine_key(
            uri,
            serde_json::json!({}),
            machine_key,
        ))
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let action = serde_json::from_slice(&bytes).ok();
    (status, action)
}

/// register source and destination nodes for the same user.
async fn setup_pair(state: &ironscale::AppState) -> (NodeId, NodeId) {
    let (_, key) = seed_user_and_key(state, "alice").await;
    let app = create_app(state.clone());
    do_register(&app, 1, 10, Some(&key.key)).await;
    do_register(&app, 2, 11, Some(&key.key)).await;

    let nodes = state.db.list_nodes().await.unwrap();
    let src = nodes.iter().find(|n| n.hostname == "test-10").unwrap().id;
    let dst = nodes.iter().find(|n| n.hostname == "test-11").unwrap().id;
    (src, dst)
}

#[tokio::test]
async fn check_mode_round_trip() {
    let state = test_state().await;
    let (src, dst) = setup_pair(&state).await;
    let app = create_app(state.clone());

    // first action: no recent auth, so hold and delegate
    let (status, action) = get_action(
        &app,
        &format!("/machine/ssh/action/{src}/to/{dst}"),
        machine_key_bytes(2),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let action = action.unwrap();
    let wait_url = action
        .hold_and_delegate
        .expect("first contact must delegate");
    assert!(wait_url.starts_with(&format!("/machine/ssh/wait/{src}/to/{dst}/a/")));

    // the destination polls the wait url; the token round-trip records
    // the authentication
    let (status, action) = get_action(&app, &wait_url, machine_key_bytes(2)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(action.unwrap().accept, Some(true));

    // second action within the recency window: immediate accept
    let (status, action) = get_action(
        &app,
        &format!("/machine/ssh/action/{src}/to/{dst}"),
        machine_key_bytes(2),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let action = action.unwrap();
    assert_eq!(action.accept, Some(true));
    assert!(action.hold_and_delegate.is_none());
}

#[tokio::test]
async fn tagged_source_rejected() {
    let state = test_state().await;
    let (user, _) = seed_user_and_key(&state, "alice").await;

    // tagged source node
    let mut tagged_key = ironscale_types::PreAuthKey::generate(user.id);
    tagged_key.tags = vec!["tag:ci".to_string()];
    let tagged_key = state.db.create_preauth_key(&tagged_key).await.unwrap();
    let plain_key = state
        .db
        .create_preauth_key(&{
            let mut k = ironscale_types::PreAuthKey::generate(user.id);
            k.reusable = true;
            k
        })
        .await
        .unwrap();

    let app = create_app(state.clone());
    do_register(&app, 1, 10, Some(&tagged_key.key)).await;
    do_register(&app, 2, 11, Some(&plain_key.key)).await;

    let nodes = state.db.list_nodes().await.unwrap();
    let src = nodes.iter().find(|n| n.is_tagged()).unwrap().id;
    let dst = nodes.iter().find(|n| !n.is_tagged()).unwrap().id;

    let (status, action) = get_action(
        &app,
        &format!("/machine/ssh/action/{src}/to/{dst}"),
        machine_key_bytes(2),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(action.unwrap().reject, Some(true));
}

#[tokio::test]
async fn cross_user_untagged_destination_rejected() {
    let state = test_state().await;
    let (_, key_alice) = seed_user_and_key(&state, "alice").await;
    let (_, key_bob) = seed_user_and_key(&state, "bob").await;
    let app = create_app(state.clone());

    do_register(&app, 1, 10, Some(&key_alice.key)).await;
    do_register(&app, 2, 11, Some(&key_bob.key)).await;

    let nodes = state.db.list_nodes().await.unwrap();
    let src = nodes.iter().find(|n| n.hostname == "test-10").unwrap().id;
    let dst = nodes.iter().find(|n| n.hostname == "test-11").unwrap().id;

    let (status, action) = get_action(
        &app,
        &format!("/machine/ssh/action/{src}/to/{dst}"),
        machine_key_bytes(2),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(action.unwrap().reject, Some(true));
}

#[tokio::test]
async fn expired_source_rejected() {
    let state = test_state().await;
    let (src, dst) = setup_pair(&state).await;

    let mut node = state.db.get_node(src).await.unwrap().unwrap();
    node.expiry = Some(chrono::Utc::now() - chrono::Duration::hours(1));
    state.db.update_node(&node).await.unwrap();

    let app = create_app(state.clone());
    let (status, action) = get_action(
        &app,
        &format!("/machine/ssh/action/{src}/to/{dst}"),
        machine_key_bytes(2),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(action.unwrap().reject, Some(true));
}

#[tokio::test]
async fn wrong_machine_key_unauthorized() {
    let state = test_state().await;
    let (src, dst) = setup_pair(&state).await;
    let app = create_app(state.clone());

    // the caller must be the destination machine; source's key is wrong
    let (status, _) = get_action(
        &app,
        &format!("/machine/ssh/action/{src}/to/{dst}"),
        machine_key_bytes(1),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bogus_wait_token_unauthorized() {
    let state = test_state().await;
    let (src, dst) = setup_pair(&state).await;
    let app = create_app(state.clone());

    let (status, _) = get_action(
        &app,
        &format!("/machine/ssh/wait/{src}/to/{dst}/a/{src}-bogustoken"),
        machine_key_bytes(2),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn policy_change_clears_check_auth() {
    let state = test_state().await;
    let (src, dst) = setup_pair(&state).await;
    let app = create_app(state.clone());

    // complete a check round-trip
    let (_, action) = get_action(
        &app,
        &format!("/machine/ssh/action/{src}/to/{dst}"),
        machine_key_bytes(2),
    )
    .await;
    let wait_url = action.unwrap().hold_and_delegate.unwrap();
    get_action(&app, &wait_url, machine_key_bytes(2)).await;

    // a policy swap forgets the recorded auth
    state
        .set_policy(r#"{"acls": [{"action": "accept", "src": ["*"], "dst": ["*:*"]}]}"#)
        .await
        .unwrap();

    let (status, action) = get_action(
        &app,
        &format!("/machine/ssh/action/{src}/to/{dst}"),
        machine_key_bytes(2),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        action.unwrap().hold_and_delegate.is_some(),
        "auth must be re-done after a policy change"
    );
}
