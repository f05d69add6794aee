//! Append-only audit log (§4.H). Writes happen before the triggering
//! operation's response is sent; a write failure aborts (and, for
//! destructive mutations, rolls back) the operation per §7's
//! audit-first rule.
//!
//! Grounded on `original_source/server_host/database/models.py::AuditLog`
//! for the column shape, and on the teacher's `server.rs` use of
//! `tracing::event!(target: ..., Level::INFO, ...)` for the structured
//! side-channel mirror kept alongside the durable row.
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{event, Level};
use uuid::Uuid;

use crate::error::AppResult;

pub const LOG_AUDIT_ACTIVITY: &str = "callisto::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
  Login,
  Registration,
  RoleChanged,
  PlayerKicked,
  InvitationCreated,
  InvitationAccepted,
  InvitationRevoked,
  PermissionGranted,
  PermissionRevoked,
  SessionSettingsUpdated,
  SessionDeleted,
  PasswordReset,
  EmailChanged,
  SlowConsumerDisconnected,
  AuthorizationDenied,
}

#[derive(Debug, Clone)]
pub struct AuditContext {
  pub session_code: Option<String>,
  pub actor_user_id: Option<Uuid>,
  pub target_user_id: Option<Uuid>,
  pub ip_address: Option<String>,
  pub user_agent: Option<String>,
}

impl AuditContext {
  #[must_use]
  pub fn system() -> Self {
    AuditContext { session_code: None, actor_user_id: None, target_user_id: None, ip_address: None, user_agent: None }
  }
}

pub struct AuditSink {
  pool: SqlitePool,
}

impl AuditSink {
  #[must_use]
  pub fn new(pool: SqlitePool) -> Self {
    AuditSink { pool }
  }

  /// Record one audit entry. Must complete before the caller's response
  /// is emitted; propagate the error so the caller can roll back.
  pub async fn record(&self, event_type: AuditEvent, ctx: &AuditContext, details: Value) -> AppResult<()> {
    event!(
      target: LOG_AUDIT_ACTIVITY,
      Level::INFO,
      event_type = %event_type,
      session_code = ctx.session_code.as_deref().unwrap_or(""),
      actor = ?ctx.actor_user_id,
      "audit event"
    );

    sqlx::query(
      "INSERT INTO audit_log (event_type, session_code, actor_user_id, target_user_id, ip_address, user_agent, details) \
       VALUES (?1,?2,?3,?4,?5,?6,?7)",
    )
    .bind(event_type.to_string())
    .bind(&ctx.session_code)
    .bind(ctx.actor_user_id.map(|id| id.to_string()))
    .bind(ctx.target_user_id.map(|id| id.to_string()))
    .bind(&ctx.ip_address)
    .bind(&ctx.user_agent)
    .bind(details.to_string())
    .execute(&self.pool)
    .await?;
    Ok(())
  }
}

#[derive(Debug, sqlx::FromRow)]
pub struct AuditRow {
  pub id: i64,
  pub event_type: String,
  pub session_code: Option<String>,
  pub actor_user_id: Option<String>,
  pub target_user_id: Option<String>,
  pub ip_address: Option<String>,
  pub user_agent: Option<String>,
  pub details: Option<String>,
  pub timestamp: String,
}

/// Query filters for the admin audit-log endpoint (§6, §11).
#[derive(Debug, Default)]
pub struct AuditQuery {
  pub session_code: Option<String>,
  pub event_type: Option<String>,
  pub user_id: Option<Uuid>,
  pub limit: i64,
  pub offset: i64,
}

pub async fn query_audit_log(pool: &SqlitePool, filter: &AuditQuery) -> AppResult<Vec<AuditRow>> {
  let mut sql = String::from("SELECT * FROM audit_log WHERE 1=1");
  if filter.session_code.is_some() {
    sql.push_str(" AND session_code = ?");
  }
  if filter.event_type.is_some() {
    sql.push_str(" AND event_type = ?");
  }
  if filter.user_id.is_some() {
    sql.push_str(" AND (actor_user_id = ? OR target_user_id = ?)");
  }
  sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");

  let mut query = sqlx::query_as::<_, AuditRow>(&sql);
  if let Some(code) = &filter.session_code {
    query = query.bind(code);
  }
  if let Some(event_type) = &filter.event_type {
    query = query.bind(event_type);
  }
  if let Some(user_id) = filter.user_id {
    let id = user_id.to_string();
    query = query.bind(id.clone()).bind(id);
  }
  query = query.bind(filter.limit).bind(filter.offset);

  Ok(query.fetch_all(pool).await?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::persistence::{connect, run_migrations};
  use serde_json::json;

  #[test_log::test(tokio::test)]
  async fn records_and_queries_an_entry() {
    let pool = connect("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    let sink = AuditSink::new(pool.clone());

    let ctx = AuditContext { session_code: Some("ABCDEF".to_string()), ..AuditContext::system() };
    sink.record(AuditEvent::RoleChanged, &ctx, json!({"from": "player", "to": "co_dm"})).await.unwrap();

    let rows = query_audit_log(&pool, &AuditQuery { session_code: Some("ABCDEF".to_string()), limit: 10, offset: 0, ..AuditQuery::default() })
      .await
      .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_type, "role_changed");
  }
}
