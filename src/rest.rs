//! REST surface (§4.G/§6): session CRUD, player/role management,
//! invitations, admin operations, audit query, compendium pass-through.
//!
//! Grounded on the teacher's `main.rs`: a manual `match (method, path)`
//! router over `hyper::service_fn`, the `deserialize_body_or_respond!`
//! macro, and `get_body_size_check`'s 64KB body guard. Every handler here
//! follows the same resolve-credential / check-permission / mutate /
//! audit / respond shape required by §4.G.
use std::collections::HashMap;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::audit::{query_audit_log, AuditContext, AuditEvent, AuditQuery, AuditSink};
use crate::compendium::Compendium;
use crate::config::Config;
use crate::entity::Table;
use crate::error::{AppError, AppResult};
use crate::identity::{extract_bearer_token, IdentityStore, User};
use crate::permission::{Permission, Role};
use crate::persistence::{check_registration_flood, record_registration_attempt, PendingWrite, Persistence};
use crate::server::SessionManager;
use crate::{info, warn};

pub struct AppState {
  pub identity: Arc<IdentityStore>,
  pub persistence: Arc<Persistence>,
  pub sessions: Arc<SessionManager>,
  pub audit: Arc<AuditSink>,
  pub config: Arc<Config>,
  pub compendium: Arc<Compendium>,
}

enum SizeCheckError {
  TooLarge(Response<Full<Bytes>>),
  Hyper(hyper::Error),
}

impl From<hyper::Error> for SizeCheckError {
  fn from(err: hyper::Error) -> Self {
    SizeCheckError::Hyper(err)
  }
}

const MAX_BODY_BYTES: u64 = 1024 * 64;

async fn read_body(req: Request<Incoming>) -> Result<Bytes, SizeCheckError> {
  let upper = req.body().size_hint().upper().unwrap_or(u64::MAX);
  if upper > MAX_BODY_BYTES {
    let mut resp = Response::new(Full::new(Bytes::from_static(b"body too large")));
    *resp.status_mut() = StatusCode::PAYLOAD_TOO_LARGE;
    return Err(SizeCheckError::TooLarge(resp));
  }
  Ok(req.collect().await?.to_bytes())
}

fn json_response(status: StatusCode, body: &impl Serialize) -> Response<Full<Bytes>> {
  let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
  Response::builder()
    .status(status)
    .header("Content-Type", "application/json")
    .header("Access-Control-Allow-Origin", "*")
    .body(Full::new(Bytes::from(bytes)))
    .expect("response builder with fixed headers never fails")
}

fn error_response(err: AppError) -> Response<Full<Bytes>> {
  let status = err.status();
  json_response(status, &err.to_wire())
}

/// Parses and body-size-checks a JSON request body, or returns early with
/// the appropriate error response. Mirrors the teacher's
/// `deserialize_body_or_respond!` macro as a function since async macros
/// are awkward to express without duplicating the `.await`.
async fn parse_body<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> Result<T, Response<Full<Bytes>>> {
  let bytes = match read_body(req).await {
    Ok(bytes) => bytes,
    Err(SizeCheckError::TooLarge(resp)) => return Err(resp),
    Err(SizeCheckError::Hyper(e)) => return Err(error_response(AppError::Transient(e.to_string()))),
  };
  serde_json::from_slice(&bytes).map_err(|e| {
    warn!("(rest) malformed request body: {e}");
    error_response(AppError::validation(format!("malformed body: {e}")))
  })
}

async fn authenticate(state: &AppState, req: &Request<Incoming>) -> AppResult<User> {
  let token = extract_bearer_token(req).ok_or(AppError::Authentication)?;
  state.identity.verify_credential(&token).await
}

/// Session code: 6 characters, unambiguous alphabet (§6: 0/O/1/I/L excluded).
const SESSION_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

fn generate_session_code() -> String {
  let mut rng = rand::thread_rng();
  (0..6).map(|_| SESSION_CODE_ALPHABET[rng.gen_range(0..SESSION_CODE_ALPHABET.len())] as char).collect()
}

async fn session_exists(pool: &SqlitePool, code: &str) -> AppResult<bool> {
  let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM game_sessions WHERE session_code = ?1 AND is_active = 1")
    .bind(code)
    .fetch_one(pool)
    .await?;
  Ok(count > 0)
}

/// Look up a member's role in a session, the basis for every permission
/// check in this module (§4.B).
async fn member_role(pool: &SqlitePool, session_code: &str, user_id: Uuid) -> AppResult<Role> {
  let row: Option<String> = sqlx::query_scalar("SELECT role FROM game_players WHERE session_code = ?1 AND user_id = ?2")
    .bind(session_code)
    .bind(user_id.to_string())
    .fetch_optional(pool)
    .await?;
  let role = row.ok_or_else(|| AppError::forbidden("not a member of this session"))?;
  role.parse::<Role>().map_err(|_| AppError::Fatal("corrupt role in storage".to_string()))
}

async fn custom_grants(pool: &SqlitePool, session_code: &str, user_id: Uuid) -> AppResult<Vec<Permission>> {
  let rows: Vec<String> =
    sqlx::query_scalar("SELECT permission FROM session_permissions WHERE session_code = ?1 AND user_id = ?2 AND is_active = 1")
      .bind(session_code)
      .bind(user_id.to_string())
      .fetch_all(pool)
      .await?;
  Ok(rows.into_iter().filter_map(|p| p.parse().ok()).collect())
}

async fn require_role(pool: &SqlitePool, session_code: &str, user_id: Uuid, minimum: Role) -> AppResult<Role> {
  let role = member_role(pool, session_code, user_id).await?;
  if !role.at_least(minimum) {
    return Err(AppError::forbidden(format!("requires role >= {minimum}")));
  }
  Ok(role)
}

async fn require_permission(pool: &SqlitePool, session_code: &str, user_id: Uuid, permission: Permission) -> AppResult<Role> {
  let role = member_role(pool, session_code, user_id).await?;
  let grants = custom_grants(pool, session_code, user_id).await?;
  if !crate::permission::has_permission(role, &grants, permission) {
    return Err(AppError::forbidden(format!("missing permission {permission}")));
  }
  Ok(role)
}

fn query_params(req: &Request<Incoming>) -> HashMap<String, String> {
  req
    .uri()
    .query()
    .map(|q| {
      q.split('&')
        .filter_map(|pair| {
          let mut parts = pair.splitn(2, '=');
          Some((parts.next()?.to_string(), parts.next().unwrap_or("").to_string()))
        })
        .collect()
    })
    .unwrap_or_default()
}

/// Top-level router: matches `(method, path segments)` exactly as the
/// teacher's `handle_request` does, dispatching the dynamic `{code}`/`{uid}`
/// segments by position.
pub async fn handle_request(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<Full<Bytes>>, hyper::Error> {
  let method = req.method().clone();
  let path = req.uri().path().to_string();
  let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

  info!("(rest) {method} {path}");

  Ok(route(&method, &segments, req, &state).await)
}

async fn route(method: &Method, segments: &[&str], req: Request<Incoming>, state: &Arc<AppState>) -> Response<Full<Bytes>> {
  match (method, segments) {
    (&Method::OPTIONS, _) => cors_preflight(),

    (&Method::POST, ["users", "register"]) => handle_register(req, state).await.unwrap_or_else(error_response),
    (&Method::POST, ["users", "token"]) => handle_token(req, state).await.unwrap_or_else(error_response),
    (&Method::GET, ["users", "me"]) => handle_me(req, state).await.unwrap_or_else(error_response),

    (&Method::POST, ["game", "create"]) => handle_create_game(req, state).await.unwrap_or_else(error_response),
    (&Method::POST, ["game", "join"]) => handle_join_game(req, state).await.unwrap_or_else(error_response),
    (&Method::GET, ["game", "api", "sessions"]) => handle_list_sessions(req, state).await.unwrap_or_else(error_response),

    (&Method::GET, ["game", "session", code, "players"]) => handle_list_players(req, state, code).await.unwrap_or_else(error_response),
    (&Method::POST, ["game", "session", code, "tables"]) => handle_create_table(req, state, code).await.unwrap_or_else(error_response),
    (&Method::DELETE, ["game", "session", code, "tables", table_id]) => handle_delete_table(req, state, code, table_id).await.unwrap_or_else(error_response),
    (&Method::POST, ["game", "session", code, "players", uid, "role"]) => {
      handle_set_role(req, state, code, uid).await.unwrap_or_else(error_response)
    }
    (&Method::DELETE, ["game", "session", code, "players", uid]) => handle_kick(req, state, code, uid).await.unwrap_or_else(error_response),
    (&Method::POST, ["game", "session", code, "players", uid, "permissions"]) => {
      handle_grant_permission(req, state, code, uid).await.unwrap_or_else(error_response)
    }
    (&Method::GET, ["game", "session", code, "players", uid, "permissions"]) => {
      handle_get_permissions(req, state, code, uid).await.unwrap_or_else(error_response)
    }

    (&Method::POST, ["game", "invitations", "create"]) => handle_create_invitation(req, state).await.unwrap_or_else(error_response),
    (&Method::GET, ["game", "invitations", invite_code]) => handle_get_invitation(state, invite_code).await.unwrap_or_else(error_response),
    (&Method::POST, ["game", "invitations", invite_code, "accept"]) => {
      handle_accept_invitation(req, state, invite_code).await.unwrap_or_else(error_response)
    }
    (&Method::DELETE, ["game", "invitations", invite_code]) => {
      handle_revoke_invitation(req, state, invite_code).await.unwrap_or_else(error_response)
    }

    (&Method::GET, ["game", "session", code, "admin", "settings"]) => {
      handle_get_settings(req, state, code).await.unwrap_or_else(error_response)
    }
    (&Method::PUT, ["game", "session", code, "admin", "settings"]) => {
      handle_put_settings(req, state, code).await.unwrap_or_else(error_response)
    }
    (&Method::POST, ["game", "session", code, "admin", "bulk-role-change"]) => {
      handle_bulk_role_change(req, state, code).await.unwrap_or_else(error_response)
    }
    (&Method::GET, ["game", "session", code, "admin", "audit-log"]) => {
      handle_audit_log(req, state, code).await.unwrap_or_else(error_response)
    }
    (&Method::DELETE, ["game", "session", code, "admin", "delete"]) => {
      handle_delete_session(req, state, code).await.unwrap_or_else(error_response)
    }

    (&Method::GET, ["api", "compendium", category]) => handle_compendium_category(state, category),
    (&Method::GET, ["api", "compendium", category, name]) => handle_compendium_entry(state, category, name),

    (&Method::GET, ["demo"]) => handle_demo(req, state).await.unwrap_or_else(error_response),

    _ => Response::builder().status(StatusCode::NOT_FOUND).body(Full::new(Bytes::from_static(b"not found"))).unwrap(),
  }
}

fn cors_preflight() -> Response<Full<Bytes>> {
  Response::builder()
    .status(StatusCode::NO_CONTENT)
    .header("Access-Control-Allow-Origin", "*")
    .header("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE, OPTIONS")
    .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
    .body(Full::new(Bytes::new()))
    .unwrap()
}

#[derive(Deserialize)]
struct RegisterForm {
  username: String,
  password: Option<String>,
  email: Option<String>,
}

async fn handle_register(req: Request<Incoming>, state: &Arc<AppState>) -> AppResult<Response<Full<Bytes>>> {
  let client_ip = req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(ToString::to_string);
  let form: RegisterForm = match parse_body(req).await {
    Ok(form) => form,
    Err(resp) => return Ok(resp),
  };

  if !check_registration_flood(
    state.persistence.pool(),
    client_ip.as_deref(),
    state.config.registration_flood_limit,
    state.config.registration_flood_window_secs,
  )
  .await?
  {
    return Err(AppError::RateLimited { retry_after_secs: state.config.registration_flood_window_secs as u64 });
  }
  record_registration_attempt(state.persistence.pool(), client_ip.as_deref()).await?;

  let user = state.identity.register(&form.username, form.password.as_deref(), form.email.as_deref()).await?;
  state.audit.record(AuditEvent::Registration, &AuditContext { actor_user_id: Some(user.user_id), ..AuditContext::system() }, json!({})).await?;
  Ok(json_response(StatusCode::OK, &json!({"user_id": user.user_id, "username": user.username})))
}

#[derive(Deserialize)]
struct TokenForm {
  username: String,
  password: String,
}

async fn handle_token(req: Request<Incoming>, state: &Arc<AppState>) -> AppResult<Response<Full<Bytes>>> {
  let form: TokenForm = match parse_body(req).await {
    Ok(form) => form,
    Err(resp) => return Ok(resp),
  };
  let user = state.identity.authenticate(&form.username, &form.password).await?;
  let token = state.identity.issue_credential(&user)?;
  state.audit.record(AuditEvent::Login, &AuditContext { actor_user_id: Some(user.user_id), ..AuditContext::system() }, json!({})).await?;
  Ok(json_response(StatusCode::OK, &json!({"token": token})))
}

async fn handle_me(req: Request<Incoming>, state: &Arc<AppState>) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  Ok(json_response(StatusCode::OK, &json!({"user_id": user.user_id, "username": user.username, "email": user.email})))
}

#[derive(Deserialize)]
struct CreateGameForm {
  game_name: String,
}

async fn handle_create_game(req: Request<Incoming>, state: &Arc<AppState>) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  let form: CreateGameForm = match parse_body(req).await {
    Ok(form) => form,
    Err(resp) => return Ok(resp),
  };

  let mut code = generate_session_code();
  while session_exists(state.persistence.pool(), &code).await? {
    code = generate_session_code();
  }

  sqlx::query("INSERT INTO game_sessions (session_code, name, owner_user_id) VALUES (?1, ?2, ?3)")
    .bind(&code)
    .bind(&form.game_name)
    .bind(user.user_id.to_string())
    .execute(state.persistence.pool())
    .await?;
  sqlx::query("INSERT INTO game_players (session_code, user_id, role) VALUES (?1, ?2, 'owner')")
    .bind(&code)
    .bind(user.user_id.to_string())
    .execute(state.persistence.pool())
    .await?;

  let default_table = Table::new("main", 30, 30)?;
  state.persistence.flush(vec![PendingWrite::UpsertTable { session_code: code.clone(), table: default_table }]).await?;

  Ok(json_response(StatusCode::OK, &json!({"session_code": code})))
}

#[derive(Deserialize)]
struct JoinGameForm {
  session_code: String,
}

async fn handle_join_game(req: Request<Incoming>, state: &Arc<AppState>) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  let form: JoinGameForm = match parse_body(req).await {
    Ok(form) => form,
    Err(resp) => return Ok(resp),
  };

  if !session_exists(state.persistence.pool(), &form.session_code).await? {
    return Err(AppError::not_found("session"));
  }
  let already_member = member_role(state.persistence.pool(), &form.session_code, user.user_id).await.is_ok();
  if !already_member {
    sqlx::query("INSERT INTO game_players (session_code, user_id, role) VALUES (?1, ?2, 'spectator')")
      .bind(&form.session_code)
      .bind(user.user_id.to_string())
      .execute(state.persistence.pool())
      .await?;
  }
  Ok(json_response(StatusCode::OK, &json!({"session_code": form.session_code})))
}

async fn handle_list_sessions(req: Request<Incoming>, state: &Arc<AppState>) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  let rows = sqlx::query(
    "SELECT gs.session_code, gs.name, gp.role FROM game_players gp \
     JOIN game_sessions gs ON gs.session_code = gp.session_code \
     WHERE gp.user_id = ?1 AND gs.is_active = 1",
  )
  .bind(user.user_id.to_string())
  .fetch_all(state.persistence.pool())
  .await?;

  let memberships: Vec<Value> = rows
    .iter()
    .map(|row| {
      json!({
        "session_code": row.try_get::<String, _>("session_code").unwrap_or_default(),
        "name": row.try_get::<String, _>("name").unwrap_or_default(),
        "role": row.try_get::<String, _>("role").unwrap_or_default(),
      })
    })
    .collect();
  Ok(json_response(StatusCode::OK, &memberships))
}

async fn handle_list_players(req: Request<Incoming>, state: &Arc<AppState>, code: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_role(state.persistence.pool(), code, user.user_id, Role::Spectator).await?;

  let rows = sqlx::query(
    "SELECT u.user_id, u.username, gp.role, gp.is_connected FROM game_players gp \
     JOIN users u ON u.user_id = gp.user_id WHERE gp.session_code = ?1",
  )
  .bind(code)
  .fetch_all(state.persistence.pool())
  .await?;

  let players: Vec<Value> = rows
    .iter()
    .map(|row| {
      json!({
        "user_id": row.try_get::<String, _>("user_id").unwrap_or_default(),
        "username": row.try_get::<String, _>("username").unwrap_or_default(),
        "role": row.try_get::<String, _>("role").unwrap_or_default(),
        "is_connected": row.try_get::<bool, _>("is_connected").unwrap_or(false),
      })
    })
    .collect();
  Ok(json_response(StatusCode::OK, &players))
}

#[derive(Deserialize)]
struct RoleChangeBody {
  new_role: Role,
}

async fn handle_set_role(req: Request<Incoming>, state: &Arc<AppState>, code: &str, uid: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_role(state.persistence.pool(), code, user.user_id, Role::Owner).await?;
  let body: RoleChangeBody = match parse_body(req).await {
    Ok(body) => body,
    Err(resp) => return Ok(resp),
  };
  let target = Uuid::parse_str(uid).map_err(|_| AppError::validation("invalid user id"))?;
  let previous = member_role(state.persistence.pool(), code, target).await?;

  sqlx::query("UPDATE game_players SET role = ?1 WHERE session_code = ?2 AND user_id = ?3")
    .bind(body.new_role.to_string())
    .bind(code)
    .bind(target.to_string())
    .execute(state.persistence.pool())
    .await?;

  let diff = crate::permission::diff_roles(previous, body.new_role);
  state
    .audit
    .record(
      AuditEvent::RoleChanged,
      &AuditContext { session_code: Some(code.to_string()), actor_user_id: Some(user.user_id), target_user_id: Some(target), ..AuditContext::system() },
      json!({"from": previous, "to": body.new_role}),
    )
    .await?;

  if let Some(session) = state.sessions.get(code).await {
    session.set_role(target, body.new_role).await;
    session
      .broadcast(
        crate::payloads::OutboundMsg::PlayerRoleChanged(crate::payloads::PlayerRoleChangedMsg::from_diff(target, body.new_role, diff)),
        None,
      )
      .await;
  }
  Ok(json_response(StatusCode::OK, &json!({"user_id": target, "role": body.new_role})))
}

async fn handle_kick(req: Request<Incoming>, state: &Arc<AppState>, code: &str, uid: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_role(state.persistence.pool(), code, user.user_id, Role::CoDm).await?;
  let target = Uuid::parse_str(uid).map_err(|_| AppError::validation("invalid user id"))?;

  let owner_id: String = sqlx::query_scalar("SELECT owner_user_id FROM game_sessions WHERE session_code = ?1")
    .bind(code)
    .fetch_one(state.persistence.pool())
    .await?;
  if owner_id == target.to_string() {
    return Err(AppError::forbidden("cannot kick the session owner"));
  }
  if target == user.user_id {
    return Err(AppError::forbidden("cannot kick yourself"));
  }

  sqlx::query("DELETE FROM game_players WHERE session_code = ?1 AND user_id = ?2")
    .bind(code)
    .bind(target.to_string())
    .execute(state.persistence.pool())
    .await?;

  state
    .audit
    .record(
      AuditEvent::PlayerKicked,
      &AuditContext { session_code: Some(code.to_string()), actor_user_id: Some(user.user_id), target_user_id: Some(target), ..AuditContext::system() },
      json!({}),
    )
    .await?;

  if let Some(session) = state.sessions.get(code).await {
    session.kick(target).await;
    session.broadcast(crate::payloads::OutboundMsg::PlayerKicked(crate::payloads::PlayerKickedMsg { user_id: target }), None).await;
  }
  Ok(json_response(StatusCode::OK, &json!({"kicked": target})))
}

#[derive(Deserialize)]
struct CreateTableBody {
  name: String,
  width: i32,
  height: i32,
}

async fn handle_create_table(req: Request<Incoming>, state: &Arc<AppState>, code: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_permission(state.persistence.pool(), code, user.user_id, Permission::ModifySession).await?;
  let body: CreateTableBody = match parse_body(req).await {
    Ok(body) => body,
    Err(resp) => return Ok(resp),
  };

  let table = match state.sessions.get(code).await {
    Some(session) => {
      let mut tables = session.tables().await;
      let table = tables.create_table(body.name, body.width, body.height)?.clone();
      drop(tables);
      session.stage(PendingWrite::UpsertTable { session_code: code.to_string(), table: table.clone() }).await;
      session.broadcast(crate::payloads::OutboundMsg::TableCreated(table.clone()), None).await;
      table
    }
    None => {
      let table = Table::new(body.name, body.width, body.height)?;
      state.persistence.flush(vec![PendingWrite::UpsertTable { session_code: code.to_string(), table: table.clone() }]).await?;
      table
    }
  };

  Ok(json_response(StatusCode::OK, &json!(table)))
}

async fn handle_delete_table(req: Request<Incoming>, state: &Arc<AppState>, code: &str, table_id: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_permission(state.persistence.pool(), code, user.user_id, Permission::ModifySession).await?;
  let table_id = Uuid::parse_str(table_id).map_err(|_| AppError::validation("invalid table id"))?;

  match state.sessions.get(code).await {
    Some(session) => {
      let mut tables = session.tables().await;
      tables.delete_table(table_id)?;
      drop(tables);
      session.stage(PendingWrite::DeleteTable { table_id }).await;
      session
        .broadcast(crate::payloads::OutboundMsg::TableDeleted(crate::payloads::TableDeletedMsg { table_id }), None)
        .await;
    }
    None => {
      state.persistence.flush(vec![PendingWrite::DeleteTable { table_id }]).await?;
    }
  }

  Ok(json_response(StatusCode::OK, &json!({"deleted": table_id})))
}

#[derive(Deserialize)]
struct GrantPermissionBody {
  permission: Permission,
}

async fn handle_grant_permission(req: Request<Incoming>, state: &Arc<AppState>, code: &str, uid: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_role(state.persistence.pool(), code, user.user_id, Role::Owner).await?;
  let body: GrantPermissionBody = match parse_body(req).await {
    Ok(body) => body,
    Err(resp) => return Ok(resp),
  };
  let target = Uuid::parse_str(uid).map_err(|_| AppError::validation("invalid user id"))?;

  sqlx::query(
    "INSERT INTO session_permissions (session_code, user_id, permission, granted_by) VALUES (?1, ?2, ?3, ?4) \
     ON CONFLICT(session_code, user_id, permission) DO UPDATE SET is_active = 1",
  )
  .bind(code)
  .bind(target.to_string())
  .bind(body.permission.to_string())
  .bind(user.user_id.to_string())
  .execute(state.persistence.pool())
  .await?;

  state
    .audit
    .record(
      AuditEvent::PermissionGranted,
      &AuditContext { session_code: Some(code.to_string()), actor_user_id: Some(user.user_id), target_user_id: Some(target), ..AuditContext::system() },
      json!({"permission": body.permission}),
    )
    .await?;

  if let Some(session) = state.sessions.get(code).await {
    session.grant_permission(target, body.permission).await;
    session
      .broadcast(
        crate::payloads::OutboundMsg::PermissionGranted(crate::payloads::PermissionGrantedMsg { user_id: target, permission: body.permission }),
        None,
      )
      .await;
  }
  Ok(json_response(StatusCode::OK, &json!({"granted": body.permission})))
}

async fn handle_get_permissions(req: Request<Incoming>, state: &Arc<AppState>, code: &str, uid: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_role(state.persistence.pool(), code, user.user_id, Role::Spectator).await?;
  let target = Uuid::parse_str(uid).map_err(|_| AppError::validation("invalid user id"))?;
  let role = member_role(state.persistence.pool(), code, target).await?;
  let grants = custom_grants(state.persistence.pool(), code, target).await?;
  let effective = crate::permission::effective_permissions(role, &grants);
  Ok(json_response(StatusCode::OK, &json!({"role": role, "custom_grants": grants, "effective": effective})))
}

#[derive(Deserialize)]
struct CreateInvitationForm {
  session_code: String,
  pre_assigned_role: Role,
  expires_hours: Option<i64>,
  max_uses: i64,
}

async fn handle_create_invitation(req: Request<Incoming>, state: &Arc<AppState>) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  let form: CreateInvitationForm = match parse_body(req).await {
    Ok(form) => form,
    Err(resp) => return Ok(resp),
  };
  require_permission(state.persistence.pool(), &form.session_code, user.user_id, Permission::InvitePlayers).await?;

  let invite_code = crate::identity::generate_raw_token()[..10].to_string();
  let expires_at = form.expires_hours.map(|hours| format!("+{} hours", hours));

  sqlx::query(
    "INSERT INTO invitations (invite_code, session_code, pre_assigned_role, created_by, expires_at, max_uses) \
     VALUES (?1, ?2, ?3, ?4, datetime('now', ?5), ?6)",
  )
  .bind(&invite_code)
  .bind(&form.session_code)
  .bind(form.pre_assigned_role.to_string())
  .bind(user.user_id.to_string())
  .bind(expires_at.as_deref().unwrap_or("+100 years"))
  .bind(form.max_uses)
  .execute(state.persistence.pool())
  .await?;

  state
    .audit
    .record(
      AuditEvent::InvitationCreated,
      &AuditContext { session_code: Some(form.session_code.clone()), actor_user_id: Some(user.user_id), ..AuditContext::system() },
      json!({"invite_code": invite_code}),
    )
    .await?;
  Ok(json_response(StatusCode::OK, &json!({"invite_code": invite_code})))
}

#[derive(sqlx::FromRow)]
struct InvitationRow {
  invite_code: String,
  session_code: String,
  pre_assigned_role: String,
  max_uses: i64,
  uses_count: i64,
  is_active: bool,
}

async fn fetch_invitation(pool: &SqlitePool, invite_code: &str) -> AppResult<InvitationRow> {
  let row = sqlx::query_as::<_, InvitationRow>(
    "SELECT invite_code, session_code, pre_assigned_role, max_uses, uses_count, is_active FROM invitations \
     WHERE invite_code = ?1 AND (expires_at IS NULL OR expires_at > datetime('now'))",
  )
  .bind(invite_code)
  .fetch_optional(pool)
  .await?;
  row.ok_or_else(|| AppError::NotFound("invitation expired or unknown".to_string()))
}

async fn handle_get_invitation(state: &Arc<AppState>, invite_code: &str) -> AppResult<Response<Full<Bytes>>> {
  let invite = fetch_invitation(state.persistence.pool(), invite_code).await?;
  if !invite.is_active || invite.uses_count >= invite.max_uses {
    return Err(AppError::gone("invitation exhausted"));
  }
  Ok(json_response(
    StatusCode::OK,
    &json!({"invite_code": invite.invite_code, "session_code": invite.session_code, "pre_assigned_role": invite.pre_assigned_role}),
  ))
}

async fn handle_accept_invitation(req: Request<Incoming>, state: &Arc<AppState>, invite_code: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  let invite = fetch_invitation(state.persistence.pool(), invite_code).await?;
  if !invite.is_active || invite.uses_count >= invite.max_uses {
    return Err(AppError::gone("invitation exhausted"));
  }

  let mut tx = state.persistence.pool().begin().await?;
  sqlx::query(
    "INSERT INTO game_players (session_code, user_id, role) VALUES (?1, ?2, ?3) \
     ON CONFLICT(session_code, user_id) DO UPDATE SET role = excluded.role",
  )
  .bind(&invite.session_code)
  .bind(user.user_id.to_string())
  .bind(&invite.pre_assigned_role)
  .execute(&mut *tx)
  .await?;
  sqlx::query("UPDATE invitations SET uses_count = uses_count + 1 WHERE invite_code = ?1").bind(invite_code).execute(&mut *tx).await?;
  tx.commit().await?;

  state
    .audit
    .record(
      AuditEvent::InvitationAccepted,
      &AuditContext { session_code: Some(invite.session_code.clone()), actor_user_id: Some(user.user_id), ..AuditContext::system() },
      json!({"invite_code": invite_code}),
    )
    .await?;
  Ok(json_response(StatusCode::OK, &json!({"session_code": invite.session_code, "role": invite.pre_assigned_role})))
}

async fn handle_revoke_invitation(req: Request<Incoming>, state: &Arc<AppState>, invite_code: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  let invite = fetch_invitation(state.persistence.pool(), invite_code).await?;
  require_role(state.persistence.pool(), &invite.session_code, user.user_id, Role::CoDm).await?;

  sqlx::query("UPDATE invitations SET is_active = 0 WHERE invite_code = ?1").bind(invite_code).execute(state.persistence.pool()).await?;
  state
    .audit
    .record(
      AuditEvent::InvitationRevoked,
      &AuditContext { session_code: Some(invite.session_code.clone()), actor_user_id: Some(user.user_id), ..AuditContext::system() },
      json!({"invite_code": invite_code}),
    )
    .await?;
  Ok(json_response(StatusCode::OK, &json!({"revoked": invite_code})))
}

async fn handle_get_settings(req: Request<Incoming>, state: &Arc<AppState>, code: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_role(state.persistence.pool(), code, user.user_id, Role::CoDm).await?;
  let row = sqlx::query("SELECT name, game_data FROM game_sessions WHERE session_code = ?1").bind(code).fetch_optional(state.persistence.pool()).await?;
  let row = row.ok_or_else(|| AppError::not_found("session"))?;
  let game_data: Option<String> = row.try_get("game_data").ok();
  Ok(json_response(
    StatusCode::OK,
    &json!({
      "name": row.try_get::<String, _>("name").unwrap_or_default(),
      "game_data": game_data.and_then(|s| serde_json::from_str::<Value>(&s).ok()).unwrap_or(Value::Null),
    }),
  ))
}

#[derive(Deserialize)]
struct SettingsBody {
  name: Option<String>,
  game_data: Option<Value>,
}

async fn handle_put_settings(req: Request<Incoming>, state: &Arc<AppState>, code: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_role(state.persistence.pool(), code, user.user_id, Role::Owner).await?;
  let body: SettingsBody = match parse_body(req).await {
    Ok(body) => body,
    Err(resp) => return Ok(resp),
  };

  if let Some(name) = &body.name {
    sqlx::query("UPDATE game_sessions SET name = ?1 WHERE session_code = ?2").bind(name).bind(code).execute(state.persistence.pool()).await?;
  }
  if let Some(data) = &body.game_data {
    sqlx::query("UPDATE game_sessions SET game_data = ?1 WHERE session_code = ?2")
      .bind(data.to_string())
      .bind(code)
      .execute(state.persistence.pool())
      .await?;
  }
  state
    .audit
    .record(
      AuditEvent::SessionSettingsUpdated,
      &AuditContext { session_code: Some(code.to_string()), actor_user_id: Some(user.user_id), ..AuditContext::system() },
      json!({"name": body.name}),
    )
    .await?;
  Ok(json_response(StatusCode::OK, &json!({"updated": true})))
}

#[derive(Deserialize)]
struct BulkRoleChangeBody {
  changes: Vec<(Uuid, Role)>,
}

async fn handle_bulk_role_change(req: Request<Incoming>, state: &Arc<AppState>, code: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_role(state.persistence.pool(), code, user.user_id, Role::Owner).await?;
  let body: BulkRoleChangeBody = match parse_body(req).await {
    Ok(body) => body,
    Err(resp) => return Ok(resp),
  };

  for (target, new_role) in &body.changes {
    sqlx::query("UPDATE game_players SET role = ?1 WHERE session_code = ?2 AND user_id = ?3")
      .bind(new_role.to_string())
      .bind(code)
      .bind(target.to_string())
      .execute(state.persistence.pool())
      .await?;
    if let Some(session) = state.sessions.get(code).await {
      session.set_role(*target, *new_role).await;
    }
  }
  state
    .audit
    .record(
      AuditEvent::RoleChanged,
      &AuditContext { session_code: Some(code.to_string()), actor_user_id: Some(user.user_id), ..AuditContext::system() },
      json!({"bulk_changes": body.changes.len()}),
    )
    .await?;
  Ok(json_response(StatusCode::OK, &json!({"changed": body.changes.len()})))
}

async fn handle_audit_log(req: Request<Incoming>, state: &Arc<AppState>, code: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_role(state.persistence.pool(), code, user.user_id, Role::CoDm).await?;
  let params = query_params(&req);
  let filter = AuditQuery {
    session_code: Some(code.to_string()),
    event_type: params.get("event_type").cloned(),
    user_id: params.get("user_id").and_then(|s| Uuid::parse_str(s).ok()),
    limit: params.get("limit").and_then(|s| s.parse().ok()).unwrap_or(50),
    offset: params.get("offset").and_then(|s| s.parse().ok()).unwrap_or(0),
  };
  let rows = query_audit_log(state.persistence.pool(), &filter).await?;
  Ok(json_response(StatusCode::OK, &rows.iter().map(|r| json!({
    "id": r.id, "event_type": r.event_type, "actor_user_id": r.actor_user_id,
    "target_user_id": r.target_user_id, "timestamp": r.timestamp,
  })).collect::<Vec<_>>()))
}

async fn handle_delete_session(req: Request<Incoming>, state: &Arc<AppState>, code: &str) -> AppResult<Response<Full<Bytes>>> {
  let user = authenticate(state, &req).await?;
  require_role(state.persistence.pool(), code, user.user_id, Role::Owner).await?;
  let params = query_params(&req);
  if params.get("confirm").map(String::as_str) != Some("true") {
    return Err(AppError::validation("delete requires confirm=true"));
  }

  sqlx::query("UPDATE game_sessions SET is_active = 0 WHERE session_code = ?1").bind(code).execute(state.persistence.pool()).await?;
  state
    .audit
    .record(
      AuditEvent::SessionDeleted,
      &AuditContext { session_code: Some(code.to_string()), actor_user_id: Some(user.user_id), ..AuditContext::system() },
      json!({}),
    )
    .await?;
  Ok(json_response(StatusCode::OK, &json!({"deleted": code})))
}

fn handle_compendium_category(state: &Arc<AppState>, category: &str) -> Response<Full<Bytes>> {
  match state.compendium.category(category) {
    Some(entries) => json_response(StatusCode::OK, &entries),
    None => error_response(AppError::not_found(format!("compendium category {category}"))),
  }
}

fn handle_compendium_entry(state: &Arc<AppState>, category: &str, name: &str) -> Response<Full<Bytes>> {
  match state.compendium.entry(category, name) {
    Some(entry) => json_response(StatusCode::OK, entry),
    None => error_response(AppError::not_found(format!("{category}/{name}"))),
  }
}

/// Public, rate-limited demo entry point (§11): issues a spectator
/// credential scoped to a standing demo session rather than requiring
/// registration.
async fn handle_demo(req: Request<Incoming>, state: &Arc<AppState>) -> AppResult<Response<Full<Bytes>>> {
  let client_ip = req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(ToString::to_string);
  if !check_registration_flood(state.persistence.pool(), client_ip.as_deref(), state.config.registration_flood_limit, state.config.registration_flood_window_secs).await? {
    return Err(AppError::RateLimited { retry_after_secs: state.config.registration_flood_window_secs as u64 });
  }

  let demo_code: Option<String> =
    sqlx::query_scalar("SELECT session_code FROM game_sessions WHERE is_demo = 1 AND is_active = 1 LIMIT 1").fetch_optional(state.persistence.pool()).await?;
  let demo_code = match demo_code {
    Some(code) => code,
    None => {
      let code = generate_session_code();
      let system_user: Option<String> = sqlx::query_scalar("SELECT user_id FROM users LIMIT 1").fetch_optional(state.persistence.pool()).await?;
      let Some(owner) = system_user else { return Err(AppError::Fatal("no users exist to own the demo session".to_string())) };
      sqlx::query("INSERT INTO game_sessions (session_code, name, owner_user_id, is_demo) VALUES (?1, 'Demo', ?2, 1)")
        .bind(&code)
        .bind(owner)
        .execute(state.persistence.pool())
        .await?;
      code
    }
  };

  let username = format!("guest_{}", &Uuid::new_v4().simple().to_string()[..8]);
  let guest = state.identity.register(&username, None, None).await?;
  sqlx::query("INSERT INTO game_players (session_code, user_id, role) VALUES (?1, ?2, 'spectator')")
    .bind(&demo_code)
    .bind(guest.user_id.to_string())
    .execute(state.persistence.pool())
    .await?;
  let token = state.identity.issue_credential(&guest)?;
  Ok(json_response(StatusCode::OK, &json!({"token": token, "session_code": demo_code})))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generated_session_codes_avoid_ambiguous_characters() {
    for _ in 0..100 {
      let code = generate_session_code();
      assert_eq!(code.len(), 6);
      assert!(code.chars().all(|c| !"0O1IL".contains(c)));
    }
  }
}
