//! registration state machine tests over the http surface.

mod common;

use axum::http::StatusCode;
use tower::ServiceExt;

use common::*;
use ironscale::create_app;
use ironscale_db::Database;
use ironscale_proto::RegisterResponse;
use ironscale_types::NodeId;

#[tokio::test]
async fn preauth_key_registers_node() {
    let state = test_state().await;
    let (user, key) = seed_user_and_key(&state, "alice").await;
    let app = create_app(state.clone());

    let resp = do_register(&app, 1, 10, Some(&key.key)).await;

    assert!(resp.machine_authorized);
    assert!(resp.auth_url.is_empty());
    assert_eq!(resp.user.id, user.id.0 as i64);
    assert_eq!(resp.login.provider, "authkey");

    // the node exists with an address from each pool
    let nodes = state.db.list_nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert!(nodes[0].ipv4.is_some());
    assert!(nodes[0].ipv6.is_some());
    assert_eq!(nodes[0].hostname, "test-10");
    assert_eq!(nodes[0].user_id, Some(user.id));
}

#[tokio::test]
async fn invalid_preauth_key_rejected() {
    let state = test_state().await;
    let app = create_app(state.clone());

    let body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(10),
        "Auth": {"AuthKey": "no-such-key"},
    });
    let response = app
        .oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(1),
        ))
        .await
        .unwrap();

    // domain failures travel in the response body for client display
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let resp: RegisterResponse = serde_json::from_slice(&bytes).unwrap();
    assert!(!resp.error.is_empty());
    assert!(!resp.machine_authorized);
    assert!(state.db.list_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn non_reusable_key_single_use() {
    let state = test_state().await;
    let (user, _) = seed_user_and_key(&state, "alice").await;
    // a fresh single-use key
    let single = state
        .db
        .create_preauth_key(&ironscale_types::PreAuthKey::generate(user.id))
        .await
        .unwrap();
    let app = create_app(state.clone());

    let first = do_register(&app, 1, 10, Some(&single.key)).await;
    assert!(first.machine_authorized);

    // second machine with the same key is refused
    let body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(11),
        "Auth": {"AuthKey": single.key},
    });
    let response = app
        .oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(2),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let resp: RegisterResponse = serde_json::from_slice(&bytes).unwrap();
    assert!(!resp.error.is_empty());
    assert_eq!(state.db.list_nodes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn tagged_key_creates_tagged_node() {
    let state = test_state().await;
    let (user, _) = seed_user_and_key(&state, "alice").await;

    let mut key = ironscale_types::PreAuthKey::generate(user.id);
    key.tags = vec!["tag:server".to_string()];
    let key = state.db.create_preauth_key(&key).await.unwrap();
    let app = create_app(state.clone());

    let resp = do_register(&app, 1, 10, Some(&key.key)).await;
    assert!(resp.machine_authorized);

    let nodes = state.db.list_nodes().await.unwrap();
    assert_eq!(nodes[0].forced_tags, vec!["tag:server".to_string()]);
    assert!(nodes[0].user_id.is_none(), "tagged nodes have no user identity");
}

#[tokio::test]
async fn interactive_registration_returns_auth_url() {
    let state = test_state().await;
    let app = create_app(state.clone());

    let resp = do_register(&app, 1, 10, None).await;

    assert!(!resp.machine_authorized);
    assert!(resp.auth_url.starts_with("/register/"), "got {}", resp.auth_url);
    assert!(state.db.list_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn followup_completes_after_idp_callback() {
    let state = test_state().await;
    let (user, _) = seed_user_and_key(&state, "alice").await;
    let app = create_app(state.clone());

    let resp = do_register(&app, 1, 10, None).await;
    let auth_url = resp.auth_url.clone();
    let reg_id = ironscale_types::RegistrationId::from_string(
        auth_url.strip_prefix("/register/").unwrap(),
    )
    .unwrap();

    // the identity callback completes the registration out of band
    let node_id = state
        .complete_interactive_registration(&reg_id, user.clone())
        .await
        .unwrap();
    assert!(node_id.0 > 0);

    // the followup poll now reports success
    let body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(10),
        "Followup": auth_url,
    });
    let response = app
        .oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(1),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let resp: RegisterResponse = serde_json::from_slice(&bytes).unwrap();
    assert!(resp.machine_authorized);
    assert_eq!(resp.login.provider, "oidc");
}

#[tokio::test]
async fn followup_times_out_back_to_auth_url() {
    let state = test_state().await;
    let app = create_app(state.clone());

    let resp = do_register(&app, 1, 10, None).await;
    let auth_url = resp.auth_url.clone();

    // nobody completes it; the poll must come back with the same url
    // (under the 30s server-side wait, driven here by a short timeout)
    let body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(10),
        "Followup": auth_url,
    });
    let poll = tokio::time::timeout(
        std::time::Duration::from_secs(40),
        app.oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(1),
        )),
    );

    // complete it shortly after the poll starts so the wait resolves
    let state2 = state.clone();
    let reg_id = ironscale_types::RegistrationId::from_string(
        resp.auth_url.strip_prefix("/register/").unwrap(),
    )
    .unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let user = ironscale_types::User::new(ironscale_types::UserId(0), "late".to_string());
        let user = state2.db.create_user(&user).await.unwrap();
        let _ = state2.complete_interactive_registration(&reg_id, user).await;
    });

    let response = poll.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let resp: RegisterResponse = serde_json::from_slice(&bytes).unwrap();
    assert!(resp.machine_authorized, "wait resolved by the callback");
}

#[tokio::test]
async fn node_key_rotation() {
    let state = test_state().await;
    let (_, key) = seed_user_and_key(&state, "alice").await;
    let app = create_app(state.clone());

    do_register(&app, 1, 10, Some(&key.key)).await;
    let node_before = state.db.list_nodes().await.unwrap().remove(0);

    // same machine presents a new node key with the old one attached
    let body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(20),
        "OldNodeKey": node_key_str(10),
    });
    let response = app
        .oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(1),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let resp: RegisterResponse = serde_json::from_slice(&bytes).unwrap();
    assert!(resp.machine_authorized);

    let node_after = state.db.get_node(node_before.id).await.unwrap().unwrap();
    assert_ne!(node_before.node_key, node_after.node_key);
    assert_eq!(node_before.id, node_after.id, "rotation keeps the node");
}

#[tokio::test]
async fn logout_expires_node() {
    let state = test_state().await;
    let (_, key) = seed_user_and_key(&state, "alice").await;
    let app = create_app(state.clone());

    do_register(&app, 1, 10, Some(&key.key)).await;
    let node = state.db.list_nodes().await.unwrap().remove(0);
    assert!(!node.is_expired());

    // a requested expiry in the past is a logout
    let body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(10),
        "Expiry": "2020-01-01T00:00:00Z",
    });
    let response = app
        .oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(1),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let resp: RegisterResponse = serde_json::from_slice(&bytes).unwrap();
    assert!(resp.node_key_expired);

    let node = state.db.get_node(node.id).await.unwrap().unwrap();
    assert!(node.is_expired());
}

#[tokio::test]
async fn expired_node_reauths_with_preauth_key() {
    let state = test_state().await;
    let (_, key) = seed_user_and_key(&state, "alice").await;
    let app = create_app(state.clone());

    do_register(&app, 1, 10, Some(&key.key)).await;
    let mut node = state.db.list_nodes().await.unwrap().remove(0);

    // expire it
    node.expiry = Some(chrono::Utc::now() - chrono::Duration::hours(1));
    state.db.update_node(&node).await.unwrap();

    // same session key: the server demands re-authentication
    let body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(10),
    });
    let response = app
        .clone()
        .oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(1),
        ))
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let resp: RegisterResponse = serde_json::from_slice(&bytes).unwrap();
    assert!(resp.node_key_expired);
    assert!(!resp.machine_authorized);

    // re-auth with a fresh session key and the pre-auth key refreshes
    // the registration in place
    let body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(30),
        "Auth": {"AuthKey": key.key},
    });
    let response = app
        .oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(1),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let refreshed = state.db.get_node(node.id).await.unwrap().unwrap();
    assert!(!refreshed.is_expired());
    assert_eq!(
        state.db.list_nodes().await.unwrap().len(),
        1,
        "refresh does not create a second node"
    );
}

#[tokio::test]
async fn unsupported_version_rejected() {
    let state = test_state().await;
    let app = create_app(state.clone());

    let body = serde_json::json!({
        "Version": 30,
        "NodeKey": node_key_str(10),
    });
    let response = app
        .oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(1),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("unsupported client version"), "got {text}");
}

#[tokio::test]
async fn register_requires_noise_channel() {
    let state = test_state().await;
    let app = create_app(state.clone());

    // no machine key extension and no opt-in: rejected
    let body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(10),
    });
    let response = app
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/machine/register")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn auto_approved_routes_enabled_at_registration() {
    let state = test_state().await;
    let (_, key) = seed_user_and_key(&state, "alice").await;

    state
        .set_policy(
            r#"{
                "autoApprovers": {"routes": {"10.0.0.0/8": ["alice@example.com"]}},
                "acls": [{"action": "accept", "src": ["*"], "dst": ["*:*"]}]
            }"#,
        )
        .await
        .unwrap();

    let app = create_app(state.clone());

    let body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(10),
        "Hostinfo": {
            "Hostname": "router",
            "RoutableIPs": ["10.33.0.0/16"]
        },
        "Auth": {"AuthKey": key.key},
    });
    let response = app
        .oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(1),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let node = state.db.list_nodes().await.unwrap().remove(0);
    let routes = state.db.get_node_routes(node.id).await.unwrap();
    assert_eq!(routes.len(), 1);
    assert!(routes[0].enabled, "auto-approver enabled the route");
    assert!(routes[0].is_primary);
}

#[tokio::test]
async fn request_tags_granted_via_tag_owners() {
    let state = test_state().await;
    let (_, key) = seed_user_and_key(&state, "alice").await;

    state
        .set_policy(
            r#"{
                "tagOwners": {"tag:web": ["alice@example.com"]},
                "acls": [{"action": "accept", "src": ["*"], "dst": ["*:*"]}]
            }"#,
        )
        .await
        .unwrap();

    let app = create_app(state.clone());

    let body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(10),
        "Hostinfo": {
            "Hostname": "web-1",
            "RequestTags": ["tag:web", "tag:forbidden"]
        },
        "Auth": {"AuthKey": key.key},
    });
    let response = app
        .oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(1),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let node = state.db.list_nodes().await.unwrap().remove(0);
    assert_eq!(
        node.forced_tags,
        vec!["tag:web".to_string()],
        "only owned tags are granted"
    );
    assert!(node.user_id.is_none(), "tag grant makes the node tagged");
}

#[tokio::test]
async fn allocated_node_id_is_stable() {
    let state = test_state().await;
    let (_, key) = seed_user_and_key(&state, "alice").await;
    let app = create_app(state.clone());

    do_register(&app, 1, 10, Some(&key.key)).await;
    do_register(&app, 2, 11, Some(&key.key)).await;

    let nodes = state.db.list_nodes().await.unwrap();
    let ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    assert_ne!(nodes[0].ipv4, nodes[1].ipv4, "distinct addresses");
}
