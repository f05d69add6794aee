//! Integration tests for the REST surface (§6/§8's end-to-end scenarios).
//!
//! Grounded on the teacher's `tests/webserver.rs`: each test spins up a
//! running server and issues real HTTP requests at it rather than
//! calling handler functions directly. The teacher spawns the compiled
//! binary and talks to it with `reqwest`; since identity here is local
//! username/password rather than Google OAuth, there's no need for a
//! separate process, so each test binds its own `TcpListener` on an
//! ephemeral port, serves `rest::handle_request` over it with
//! `hyper::server::conn::http1`, and drives it with a bare
//! `hyper::client::conn::http1` connection (no extra HTTP client
//! dependency needed).
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{client::conn::http1 as client_http1, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};

use callisto::audit::AuditSink;
use callisto::compendium::Compendium;
use callisto::config::Config;
use callisto::identity::IdentityStore;
use callisto::persistence::{connect, run_migrations, Persistence};
use callisto::rest::{handle_request, AppState};
use callisto::server::SessionManager;

async fn test_state() -> Arc<AppState> {
  let pool = connect("sqlite::memory:").await.unwrap();
  run_migrations(&pool).await.unwrap();

  let config = Arc::new(Config {
    bind_addr: "127.0.0.1:0".into(),
    database_url: "sqlite::memory:".into(),
    secret_key: "test-secret".into(),
    session_secret: None,
    base_url: "http://localhost".into(),
    environment: "development".into(),
    session_idle_timeout_secs: 300,
    client_queue_depth: 64,
    mutation_batch_size: 50,
    mutation_batch_interval_ms: 500,
    registration_flood_limit: 1000,
    registration_flood_window_secs: 600,
    jwt_expiry_secs: 604_800,
    compendium_dir: "compendium".into(),
  });

  let persistence = Arc::new(Persistence::new(pool.clone()));
  Arc::new(AppState {
    identity: Arc::new(IdentityStore::new(pool.clone(), config.secret_key.clone(), config.jwt_expiry_secs)),
    sessions: Arc::new(SessionManager::new(Arc::clone(&persistence), std::time::Duration::from_secs(300))),
    persistence,
    audit: Arc::new(AuditSink::new(pool)),
    config,
    compendium: Arc::new(Compendium::load(Path::new("/nonexistent/compendium/dir"))),
  })
}

/// Bind an ephemeral port and serve `state` on it until the test process
/// ends; returns the bound address.
async fn spawn_server(state: Arc<AppState>) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else { return };
      let io = TokioIo::new(stream);
      let state = Arc::clone(&state);
      tokio::spawn(async move {
        let handler = move |req| handle_request(req, Arc::clone(&state));
        let _ = server_http1::Builder::new().serve_connection(io, service_fn(handler)).await;
      });
    }
  });
  addr
}

async fn request(addr: SocketAddr, method: Method, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
  let stream = TcpStream::connect(addr).await.unwrap();
  let io = TokioIo::new(stream);
  let (mut sender, conn) = client_http1::handshake(io).await.unwrap();
  tokio::spawn(async move {
    let _ = conn.await;
  });

  let mut builder = Request::builder().method(method).uri(path).header("Host", "localhost").header("Content-Type", "application/json");
  if let Some(token) = token {
    builder = builder.header("Authorization", format!("Bearer {token}"));
  }
  let req = builder.body(Full::new(Bytes::from(body.to_string()))).unwrap();

  let resp = sender.send_request(req).await.unwrap();
  let status = resp.status();
  let bytes = resp.into_body().collect().await.unwrap().to_bytes();
  let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
  (status, value)
}

async fn register(addr: SocketAddr, username: &str, password: &str) {
  let (status, _) = request(addr, Method::POST, "/users/register", None, json!({"username": username, "password": password, "email": null})).await;
  assert_eq!(status, StatusCode::OK);
}

async fn token(addr: SocketAddr, username: &str, password: &str) -> String {
  let (status, body) = request(addr, Method::POST, "/users/token", None, json!({"username": username, "password": password})).await;
  assert_eq!(status, StatusCode::OK);
  body["token"].as_str().unwrap().to_string()
}

/// Scenario 1 (§8): register -> login -> create session -> list memberships.
#[tokio::test]
async fn registration_login_and_session_create() {
  let addr = spawn_server(test_state().await).await;
  register(addr, "alice_wonder", "Secret123").await;
  let tok = token(addr, "alice_wonder", "Secret123").await;

  let (status, body) = request(addr, Method::POST, "/game/create", Some(&tok), json!({"game_name": "Epic"})).await;
  assert_eq!(status, StatusCode::OK);
  let code = body["session_code"].as_str().unwrap();
  assert!((6..=8).contains(&code.len()));

  let (status, sessions) = request(addr, Method::GET, "/game/api/sessions", Some(&tok), Value::Null).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(sessions.as_array().unwrap().len(), 1);
  assert_eq!(sessions[0]["role"], "owner");
}

/// Scenario 2 (§8): an invitation's `max_uses` is enforced exactly.
#[tokio::test]
async fn invite_flow_respects_max_uses() {
  let addr = spawn_server(test_state().await).await;
  register(addr, "owner_alice", "Secret123").await;
  let owner_tok = token(addr, "owner_alice", "Secret123").await;
  let (_, created) = request(addr, Method::POST, "/game/create", Some(&owner_tok), json!({"game_name": "Epic"})).await;
  let session_code = created["session_code"].as_str().unwrap().to_string();

  let (status, invite) = request(
    addr,
    Method::POST,
    "/game/invitations/create",
    Some(&owner_tok),
    json!({"session_code": session_code, "pre_assigned_role": "player", "max_uses": 2}),
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  let invite_code = invite["invite_code"].as_str().unwrap().to_string();

  register(addr, "bob_player", "Secret123").await;
  let bob_tok = token(addr, "bob_player", "Secret123").await;
  let (status, _) = request(addr, Method::POST, &format!("/game/invitations/{invite_code}/accept"), Some(&bob_tok), Value::Null).await;
  assert_eq!(status, StatusCode::OK);

  register(addr, "carol_player", "Secret123").await;
  let carol_tok = token(addr, "carol_player", "Secret123").await;
  let (status, _) = request(addr, Method::POST, &format!("/game/invitations/{invite_code}/accept"), Some(&carol_tok), Value::Null).await;
  assert_eq!(status, StatusCode::OK);

  register(addr, "dave_player", "Secret123").await;
  let dave_tok = token(addr, "dave_player", "Secret123").await;
  let (status, _) = request(addr, Method::POST, &format!("/game/invitations/{invite_code}/accept"), Some(&dave_tok), Value::Null).await;
  assert_eq!(status, StatusCode::GONE);
}

/// Scenario 3 (§8): role change reports the new role.
#[tokio::test]
async fn role_change_reports_new_role() {
  let addr = spawn_server(test_state().await).await;
  register(addr, "owner_alice", "Secret123").await;
  let owner_tok = token(addr, "owner_alice", "Secret123").await;
  let (_, created) = request(addr, Method::POST, "/game/create", Some(&owner_tok), json!({"game_name": "Epic"})).await;
  let session_code = created["session_code"].as_str().unwrap().to_string();

  register(addr, "bob_player", "Secret123").await;
  let bob_tok = token(addr, "bob_player", "Secret123").await;
  request(addr, Method::POST, "/game/join", Some(&bob_tok), json!({"session_code": session_code})).await;
  let (_, me) = request(addr, Method::GET, "/users/me", Some(&bob_tok), Value::Null).await;
  let bob_id = me["user_id"].as_str().unwrap().to_string();

  let (status, body) =
    request(addr, Method::POST, &format!("/game/session/{session_code}/players/{bob_id}/role"), Some(&owner_tok), json!({"new_role": "co_dm"})).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["role"], "co_dm");
}

#[tokio::test]
async fn non_member_cannot_list_players() {
  let addr = spawn_server(test_state().await).await;
  register(addr, "owner_alice", "Secret123").await;
  let owner_tok = token(addr, "owner_alice", "Secret123").await;
  let (_, created) = request(addr, Method::POST, "/game/create", Some(&owner_tok), json!({"game_name": "Epic"})).await;
  let session_code = created["session_code"].as_str().unwrap().to_string();

  register(addr, "eve_outsider", "Secret123").await;
  let eve_tok = token(addr, "eve_outsider", "Secret123").await;
  let (status, _) = request(addr, Method::GET, &format!("/game/session/{session_code}/players"), Some(&eve_tok), Value::Null).await;
  assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unauthenticated_request_is_rejected() {
  let addr = spawn_server(test_state().await).await;
  let (status, _) = request(addr, Method::GET, "/users/me", None, Value::Null).await;
  assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_compendium_category_is_not_found() {
  let addr = spawn_server(test_state().await).await;
  register(addr, "alice_wonder", "Secret123").await;
  let tok = token(addr, "alice_wonder", "Secret123").await;
  let (status, _) = request(addr, Method::GET, "/api/compendium/spells", Some(&tok), Value::Null).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Duplicate registration must be rejected as a conflict (§7).
#[tokio::test]
async fn duplicate_username_is_rejected() {
  let addr = spawn_server(test_state().await).await;
  register(addr, "alice_wonder", "Secret123").await;
  let (status, _) = request(addr, Method::POST, "/users/register", None, json!({"username": "alice_wonder", "password": "Secret123", "email": null})).await;
  assert_eq!(status, StatusCode::CONFLICT);
}
