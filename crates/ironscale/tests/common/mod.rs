//! shared helpers for the integration tests.

use axum::{Router, body::Body, http::Request};
use tower::ServiceExt;

use ironscale::AppState;
use ironscale::handlers::MachineKeyContext;
use ironscale_db::{Database, IronscaleDb};
use ironscale_proto::RegisterResponse;
use ironscale_types::{Config, PreAuthKey, User, UserId};

/// build an app state over an in-memory database.
pub async fn test_state() -> AppState {
    let db = IronscaleDb::new_in_memory().await.unwrap();
    let mut config = Config::default();
    // faster ticks keep the tests snappy
    config.tuning.batch_tick_ms = 50;
    config.tuning.batcher_workers = 2;
    AppState::new(db, config, None).await.unwrap()
}

/// create a user and a reusable pre-auth key for it.
pub async fn seed_user_and_key(state: &AppState, name: &str) -> (User, PreAuthKey) {
    let mut user = User::new(UserId(0), name.to_string());
    user.email = Some(format!("{name}@example.com"));
    let user = state.db.create_user(&user).await.unwrap();

    let mut key = PreAuthKey::generate(user.id);
    key.reusable = true;
    let key = state.db.create_preauth_key(&key).await.unwrap();
    (user, key)
}

/// a machine-key hex for test node `seed`.
pub fn machine_key_bytes(seed: u8) -> Vec<u8> {
    vec![seed; 32]
}

/// the prefixed-hex node key string for test node `seed`.
pub fn node_key_str(seed: u8) -> String {
    format!("nodekey:{}", hex_of(seed))
}

fn hex_of(seed: u8) -> String {
    vec![seed; 32].iter().map(|b| format!("{b:02x}")).collect()
}

/// POST a json body with an authenticated machine key.
pub fn post_with_machine_key(
    uri: &str,
    body: serde_json::Value,
    machine_key: Vec<u8>,
) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .extension(MachineKeyContext::from_bytes(machine_key))
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

/// drive one request through the router and parse a register response.
pub async fn do_register(
    app: &Router,
    machine_seed: u8,
    node_seed: u8,
    auth_key: Option<&str>,
) -> RegisterResponse {
    let mut body = serde_json::json!({
        "Version": 106,
        "NodeKey": node_key_str(node_seed),
        "Hostinfo": {"Hostname": format!("test-{node_seed}")},
    });
    if let Some(key) = auth_key {
        body["Auth"] = serde_json::json!({"AuthKey": key});
    }

    let response = app
        .clone()
        .oneshot(post_with_machine_key(
            "/machine/register",
            body,
            machine_key_bytes(machine_seed),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
