//! Session manager (§4.E): `LiveSession` holds one session's in-memory
//! engine state, connected clients, and permission cache; `SessionManager`
//! maps session codes to lazily-instantiated `LiveSession`s and sweeps
//! idle ones.
//!
//! Grounded on the teacher's `Server`/`ServerMembersTable` (membership
//! keyed by session id, `clean_expired_scenarios`'s
//! `SCENARIO_EXPIRATION_TIME`-driven sweep) and on
//! `original_source/server_host/api/persistent_sessions.py`'s
//! `active_sessions` dict (lazy instantiation by session code).
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{event, Level};
use uuid::Uuid;

use crate::character::Character;
use crate::entity::Tables;
use crate::error::{AppError, AppResult};
use crate::payloads::{OutboundMsg, PlayerSummary, SnapshotMsg};
use crate::permission::{Permission, Role};
use crate::persistence::{PendingWrite, Persistence};
use crate::transport::{ClientHandle, OutboundQueue, PushOutcome};
use crate::{info, warn};

pub const LOG_SESSION_ACTIVITY: &str = "callisto::session";

/// Snapshot of one player's membership, cached per `LiveSession` and
/// invalidated on any role/permission write (§4.E).
#[derive(Debug, Clone)]
pub struct PlayerContext {
  pub user_id: Uuid,
  pub username: String,
  pub role: Role,
  pub custom_permissions: Vec<Permission>,
  pub is_connected: bool,
  pub active_table: Option<Uuid>,
}

impl PlayerContext {
  #[must_use]
  pub fn has_permission(&self, permission: Permission) -> bool {
    crate::permission::has_permission(self.role, &self.custom_permissions, permission)
  }

  #[must_use]
  pub fn can_view_dm_layer(&self) -> bool {
    self.has_permission(Permission::ViewDmLayer)
  }
}

/// One live, in-memory session: the engine state plus everything needed
/// to serve connected clients. All mutation goes through `&self` methods
/// serialized by the caller's session loop (§5) — this struct itself
/// holds only the locks needed for that single-writer discipline.
pub struct LiveSession {
  pub session_code: String,
  tables: AsyncMutex<Tables>,
  characters: AsyncMutex<HashMap<Uuid, Character>>,
  players: AsyncMutex<HashMap<Uuid, PlayerContext>>,
  clients: AsyncMutex<HashMap<Uuid, ClientHandle>>,
  pending: AsyncMutex<Vec<PendingWrite>>,
  last_activity: AsyncMutex<SystemTime>,
}

impl LiveSession {
  #[must_use]
  pub fn new(session_code: String, tables: Tables, characters: Vec<Character>, players: Vec<PlayerContext>) -> Self {
    LiveSession {
      session_code,
      tables: AsyncMutex::new(tables),
      characters: AsyncMutex::new(characters.into_iter().map(|c| (c.character_id, c)).collect()),
      players: AsyncMutex::new(players.into_iter().map(|p| (p.user_id, p)).collect()),
      clients: AsyncMutex::new(HashMap::new()),
      pending: AsyncMutex::new(Vec::new()),
      last_activity: AsyncMutex::new(SystemTime::now()),
    }
  }

  pub async fn tables(&self) -> tokio::sync::MutexGuard<'_, Tables> {
    self.tables.lock().await
  }

  pub async fn characters(&self) -> tokio::sync::MutexGuard<'_, HashMap<Uuid, Character>> {
    self.characters.lock().await
  }

  pub async fn stage(&self, write: PendingWrite) {
    self.pending.lock().await.push(write);
  }

  pub async fn take_pending(&self) -> Vec<PendingWrite> {
    std::mem::take(&mut *self.pending.lock().await)
  }

  async fn touch(&self) {
    *self.last_activity.lock().await = SystemTime::now();
  }

  pub async fn idle_for(&self) -> Duration {
    SystemTime::now().duration_since(*self.last_activity.lock().await).unwrap_or_default()
  }

  /// Attach a client: verify membership, cache its permission view, add
  /// it to the fan-out set, and return the initial snapshot (§4.E).
  pub async fn attach(&self, user_id: Uuid, client_id: Uuid, outbound: Arc<OutboundQueue>) -> AppResult<SnapshotMsg> {
    self.touch().await;
    let mut players = self.players.lock().await;
    let player = players.get_mut(&user_id).ok_or_else(|| AppError::not_found("player is not a member of this session"))?;
    player.is_connected = true;
    let role = player.role;

    self.clients.lock().await.insert(client_id, ClientHandle { client_id, user_id, outbound });

    let can_view_dm = crate::permission::has_permission(role, &player.custom_permissions, Permission::ViewDmLayer);
    let tables = self.tables.lock().await;
    let table_snapshots = tables
      .iter()
      .map(|t| {
        let mut visible = t.clone();
        let filtered: Vec<_> = t.visible_entities(can_view_dm).into_iter().cloned().collect();
        visible.replace_entities(filtered);
        visible
      })
      .collect();
    drop(tables);

    let characters = self.characters.lock().await.values().cloned().collect();
    let player_summaries = players
      .values()
      .map(|p| PlayerSummary { user_id: p.user_id, username: p.username.clone(), role: p.role, is_connected: p.is_connected })
      .collect();

    event!(target: LOG_SESSION_ACTIVITY, Level::INFO, session = %self.session_code, user = %user_id, action = "attach");

    Ok(SnapshotMsg { session_code: self.session_code.clone(), tables: table_snapshots, characters, players: player_summaries, your_role: role })
  }

  /// Detach a client, mark the player disconnected if this was their
  /// last connection, and broadcast `player_left`.
  pub async fn detach(&self, client_id: Uuid) {
    let user_id = {
      let mut clients = self.clients.lock().await;
      clients.remove(&client_id).map(|h| h.user_id)
    };
    let Some(user_id) = user_id else { return };

    let still_connected = {
      let clients = self.clients.lock().await;
      clients.values().any(|h| h.user_id == user_id)
    };
    if !still_connected {
      if let Some(player) = self.players.lock().await.get_mut(&user_id) {
        player.is_connected = false;
      }
      self.broadcast(OutboundMsg::PlayerLeft { user_id }, None).await;
    }
    event!(target: LOG_SESSION_ACTIVITY, Level::INFO, session = %self.session_code, user = %user_id, action = "detach");
  }

  pub async fn player(&self, user_id: Uuid) -> Option<PlayerContext> {
    self.players.lock().await.get(&user_id).cloned()
  }

  /// Seed a connecting player's membership into the live session if it
  /// isn't already cached, e.g. a second distinct user reaching a
  /// session instantiated by someone else. Leaves an already-cached
  /// entry (with its live `is_connected` state) untouched.
  pub async fn ensure_player(&self, player: PlayerContext) {
    self.players.lock().await.entry(player.user_id).or_insert(player);
  }

  pub async fn set_role(&self, user_id: Uuid, role: Role) {
    if let Some(player) = self.players.lock().await.get_mut(&user_id) {
      player.role = role;
    }
  }

  /// Update a player's active-table pointer (§4.E). Persistence of the
  /// change is the caller's job (`PendingWrite::SetActiveTable`).
  pub async fn set_active_table(&self, user_id: Uuid, table_id: Option<Uuid>) {
    if let Some(player) = self.players.lock().await.get_mut(&user_id) {
      player.active_table = table_id;
    }
  }

  pub async fn grant_permission(&self, user_id: Uuid, permission: Permission) {
    if let Some(player) = self.players.lock().await.get_mut(&user_id) {
      if !player.custom_permissions.contains(&permission) {
        player.custom_permissions.push(permission);
      }
    }
  }

  pub async fn kick(&self, user_id: Uuid) {
    self.players.lock().await.remove(&user_id);
    let client_ids: Vec<Uuid> = {
      let clients = self.clients.lock().await;
      clients.values().filter(|h| h.user_id == user_id).map(|h| h.client_id).collect()
    };
    for client_id in client_ids {
      self.clients.lock().await.remove(&client_id);
    }
  }

  /// Fan out a frame to every connected client, applying layer
  /// visibility per-recipient and the §4.F backpressure policy.
  /// `table_id` narrows an entity-scoped frame's layer check; `None`
  /// means the frame is unconditionally visible (chat, role changes, ...).
  pub async fn broadcast(&self, msg: OutboundMsg, layer: Option<crate::entity::Layer>) -> Vec<Uuid> {
    self.touch().await;
    let players = self.players.lock().await;
    let clients = self.clients.lock().await;
    let mut to_disconnect = Vec::new();

    for handle in clients.values() {
      let can_view_dm = players
        .get(&handle.user_id)
        .map(|p| crate::permission::has_permission(p.role, &p.custom_permissions, Permission::ViewDmLayer))
        .unwrap_or(false);
      if let Some(layer) = layer {
        if layer.requires_dm_visibility() && !can_view_dm {
          continue;
        }
      }
      match handle.outbound.push(msg.clone()).await {
        PushOutcome::Queued | PushOutcome::DroppedOlderNonCritical => {}
        PushOutcome::QueueFullDisconnect => {
          warn!("(session) slow consumer {}, disconnecting", handle.client_id);
          to_disconnect.push(handle.client_id);
        }
      }
    }
    to_disconnect
  }

  pub async fn unicast(&self, client_id: Uuid, msg: OutboundMsg) {
    if let Some(handle) = self.clients.lock().await.get(&client_id) {
      handle.outbound.push(msg).await;
    }
  }
}

/// Process-wide map from session code to `LiveSession`, lazily populated
/// on first access (§4.E).
pub struct SessionManager {
  sessions: AsyncMutex<HashMap<String, Arc<LiveSession>>>,
  persistence: Arc<Persistence>,
  idle_timeout: Duration,
}

impl SessionManager {
  #[must_use]
  pub fn new(persistence: Arc<Persistence>, idle_timeout: Duration) -> Self {
    SessionManager { sessions: AsyncMutex::new(HashMap::new()), persistence, idle_timeout }
  }

  /// Get the live session for `code`, instantiating it from storage on
  /// first access (§4.E's nascent -> live transition). `players` seeds
  /// the connecting caller's own membership; on a cache hit this still
  /// merges that membership in, since a session already live for one
  /// user (e.g. its owner) otherwise has no record of a second, distinct
  /// user connecting afterward.
  pub async fn get_or_create(&self, code: &str, players: Vec<PlayerContext>) -> AppResult<Arc<LiveSession>> {
    let mut sessions = self.sessions.lock().await;
    if let Some(session) = sessions.get(code) {
      let session = Arc::clone(session);
      drop(sessions);
      for player in players {
        session.ensure_player(player).await;
      }
      return Ok(session);
    }
    let tables = self.persistence.load_tables(code).await?;
    let characters = self.persistence.load_characters(code).await?;
    let session = Arc::new(LiveSession::new(code.to_string(), tables, characters, players));
    sessions.insert(code.to_string(), Arc::clone(&session));
    event!(target: LOG_SESSION_ACTIVITY, Level::INFO, session = code, action = "instantiate");
    Ok(session)
  }

  pub async fn get(&self, code: &str) -> Option<Arc<LiveSession>> {
    self.sessions.lock().await.get(code).cloned()
  }

  /// Evict sessions with no connected clients that have been idle longer
  /// than the configured timeout, after flushing their pending writes
  /// (§4.E's live<->idle->evicted state machine).
  pub async fn sweep_idle(&self) {
    let mut sessions = self.sessions.lock().await;
    let mut to_evict = Vec::new();
    for (code, session) in sessions.iter() {
      if session.clients.lock().await.is_empty() && session.idle_for().await > self.idle_timeout {
        to_evict.push(code.clone());
      }
    }
    for code in to_evict {
      if let Some(session) = sessions.remove(&code) {
        let pending = session.take_pending().await;
        if let Err(e) = self.persistence.flush(pending).await {
          warn!("(session) failed to checkpoint {code} before eviction: {e}");
          continue;
        }
        info!("(session) evicted idle session {code}");
        event!(target: LOG_SESSION_ACTIVITY, Level::INFO, session = %code, action = "evict");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entity::Tables;

  fn test_player(user_id: Uuid, role: Role) -> PlayerContext {
    PlayerContext { user_id, username: "alice".to_string(), role, custom_permissions: vec![], is_connected: false, active_table: None }
  }

  #[test_log::test(tokio::test)]
  async fn attach_rejects_non_member() {
    let session = LiveSession::new("ABCDEF".to_string(), Tables::new(), vec![], vec![]);
    let outbound = Arc::new(OutboundQueue::new(8));
    let result = session.attach(Uuid::new_v4(), Uuid::new_v4(), outbound).await;
    assert!(result.is_err());
  }

  #[test_log::test(tokio::test)]
  async fn attach_marks_player_connected_and_returns_snapshot() {
    let user_id = Uuid::new_v4();
    let session = LiveSession::new("ABCDEF".to_string(), Tables::new(), vec![], vec![test_player(user_id, Role::Player)]);
    let outbound = Arc::new(OutboundQueue::new(8));
    let snapshot = session.attach(user_id, Uuid::new_v4(), outbound).await.unwrap();
    assert_eq!(snapshot.your_role, Role::Player);
    let player = session.player(user_id).await.unwrap();
    assert!(player.is_connected);
  }

  #[test_log::test(tokio::test)]
  async fn detach_last_client_marks_disconnected() {
    let user_id = Uuid::new_v4();
    let session = LiveSession::new("ABCDEF".to_string(), Tables::new(), vec![], vec![test_player(user_id, Role::Player)]);
    let client_id = Uuid::new_v4();
    let outbound = Arc::new(OutboundQueue::new(8));
    session.attach(user_id, client_id, outbound).await.unwrap();
    session.detach(client_id).await;
    let player = session.player(user_id).await.unwrap();
    assert!(!player.is_connected);
  }
}
