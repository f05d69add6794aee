//! Per-connection client context (§5): authorizes and dispatches one
//! connected client's inbound frames against its `LiveSession`, staging
//! persistence writes and recording audit entries as it goes.
//!
//! Grounded on the teacher's `PlayerManager`: a thin wrapper holding a
//! connection's identity and a shared handle to the server it's attached
//! to, exposing one method per inbound message kind that validates then
//! mutates shared state. The role/ship fields become a cached
//! `PlayerContext`; `Entities`/`Ship` mutation becomes `Tables`/`Entity`
//! mutation; Google OAuth login becomes JWT credential verification.
use std::sync::Arc;

use uuid::Uuid;

use crate::audit::{AuditContext, AuditEvent, AuditSink};
use crate::character::Character;
use crate::entity::{EntityPatch, Layer};
use crate::error::{AppError, AppResult};
use crate::payloads::{
  CharacterLoadMsg, CharacterSaveMsg, ChatMsg, CreateEntityMsg, CreateTableMsg, DeleteEntityMsg, DeleteTableMsg,
  DiceRollMsg, EntityAddedMsg, EntityMovedMsg, EntityRemovedMsg, EntityUpdatedMsg, FogUpdateMsg, InboundMsg,
  MoveEntityMsg, OutboundMsg, TableDeletedMsg, UpdateEntityMsg,
};
use crate::permission::Permission;
use crate::persistence::PendingWrite;
use crate::info;
use crate::server::LiveSession;

/// One connected client's authorization context and dispatch table.
/// Owned by the session's serialized read loop (§5): nothing here is
/// shared across clients, so no locking is needed internally.
pub struct ClientContext {
  pub client_id: Uuid,
  pub user_id: Uuid,
  pub session: Arc<LiveSession>,
  pub audit: Arc<AuditSink>,
}

impl ClientContext {
  #[must_use]
  pub fn new(client_id: Uuid, user_id: Uuid, session: Arc<LiveSession>, audit: Arc<AuditSink>) -> Self {
    ClientContext { client_id, user_id, session, audit }
  }

  fn audit_ctx(&self) -> AuditContext {
    AuditContext {
      session_code: Some(self.session.session_code.clone()),
      actor_user_id: Some(self.user_id),
      target_user_id: None,
      ip_address: None,
      user_agent: None,
    }
  }

  async fn require(&self, permission: Permission) -> AppResult<()> {
    let player = self.session.player(self.user_id).await.ok_or_else(|| AppError::forbidden("not a session member"))?;
    if player.has_permission(permission) {
      return Ok(());
    }
    self
      .audit
      .record(AuditEvent::AuthorizationDenied, &self.audit_ctx(), serde_json::json!({"permission": permission}))
      .await?;
    Err(AppError::forbidden(format!("missing permission {permission}")))
  }

  /// Dispatch one inbound frame, returning the outbound frame to unicast
  /// back to the sender (if any) — broadcasts to other clients happen
  /// inside each handler via `self.session.broadcast`.
  pub async fn dispatch(&self, message: InboundMsg) -> AppResult<Option<OutboundMsg>> {
    match message {
      InboundMsg::Register(_) => Err(AppError::validation("register is only valid as the first frame")),
      InboundMsg::Ping => Ok(Some(OutboundMsg::Pong)),
      InboundMsg::TableRequest(msg) => self.table_request(msg).await,
      InboundMsg::CreateTable(msg) => self.create_table(msg).await,
      InboundMsg::DeleteTable(msg) => self.delete_table(msg).await,
      InboundMsg::SpriteUpdate(msg) => self.move_entity(MoveEntityMsg { table_id: msg.table_id, entity_id: msg.entity_id, position: msg.position }).await,
      InboundMsg::CreateEntity(msg) => self.create_entity(msg).await,
      InboundMsg::MoveEntity(msg) => self.move_entity(msg).await,
      InboundMsg::DeleteEntity(msg) => self.delete_entity(msg).await,
      InboundMsg::UpdateEntity(msg) => self.update_entity(msg).await,
      InboundMsg::CharacterSave(msg) => self.character_save(msg).await,
      InboundMsg::CharacterLoad(msg) => self.character_load(msg).await,
      InboundMsg::FogUpdate(msg) => self.fog_update(msg).await,
      InboundMsg::Chat(msg) => self.chat(msg).await,
      InboundMsg::DiceRoll(msg) => self.dice_roll(msg).await,
    }
  }

  /// Switch this client's active table (§4.E's per-user active-table
  /// pointer) and return its current state.
  async fn table_request(&self, msg: crate::payloads::TableRequestMsg) -> AppResult<Option<OutboundMsg>> {
    let tables = self.session.tables().await;
    let table = tables.table(msg.table_id).ok_or_else(|| AppError::not_found("table"))?.clone();
    drop(tables);

    self.session.set_active_table(self.user_id, Some(msg.table_id)).await;
    self
      .session
      .stage(PendingWrite::SetActiveTable { session_code: self.session.session_code.clone(), user_id: self.user_id, table_id: Some(msg.table_id) })
      .await;
    Ok(Some(OutboundMsg::TableData(table)))
  }

  /// Create a table on this session (§4.C), gated the same as other
  /// session-shape changes rather than per-token mutation.
  async fn create_table(&self, msg: CreateTableMsg) -> AppResult<Option<OutboundMsg>> {
    self.require(Permission::ModifySession).await?;
    let mut tables = self.session.tables().await;
    let table_snapshot = tables.create_table(msg.name, msg.width, msg.height)?.clone();
    drop(tables);

    self.session.stage(PendingWrite::UpsertTable { session_code: self.session.session_code.clone(), table: table_snapshot.clone() }).await;
    self.session.broadcast(OutboundMsg::TableCreated(table_snapshot.clone()), None).await;
    info!("(player) {} created table {} ({})", self.user_id, table_snapshot.table_id, table_snapshot.name);
    Ok(Some(OutboundMsg::TableCreated(table_snapshot)))
  }

  async fn delete_table(&self, msg: DeleteTableMsg) -> AppResult<Option<OutboundMsg>> {
    self.require(Permission::ModifySession).await?;
    let mut tables = self.session.tables().await;
    tables.delete_table(msg.table_id)?;
    drop(tables);

    self.session.stage(PendingWrite::DeleteTable { table_id: msg.table_id }).await;
    self.session.broadcast(OutboundMsg::TableDeleted(TableDeletedMsg { table_id: msg.table_id }), None).await;
    Ok(None)
  }

  async fn create_entity(&self, msg: CreateEntityMsg) -> AppResult<Option<OutboundMsg>> {
    if msg.layer == Layer::DungeonMaster {
      self.require(Permission::ModifyDmLayer).await?;
    } else {
      self.require(Permission::CreateTokens).await?;
    }

    let mut tables = self.session.tables().await;
    let table = tables.table_mut(msg.table_id).ok_or_else(|| AppError::not_found("table"))?;
    let entity_id = table.add_entity(msg.name, msg.position, msg.layer, msg.kind, msg.texture).entity_id;
    let entity = table.entity_mut(entity_id).expect("just inserted");
    entity.controlled_by.push(self.user_id);
    let entity = entity.clone();
    let table_snapshot = table.clone();
    drop(tables);

    self.session.stage(PendingWrite::UpsertTable { session_code: self.session.session_code.clone(), table: table_snapshot }).await;
    self
      .session
      .broadcast(OutboundMsg::EntityAdded(EntityAddedMsg { table_id: msg.table_id, entity: entity.clone() }), Some(msg.layer))
      .await;
    info!("(player) {} created entity {} on table {}", self.user_id, entity.entity_id, msg.table_id);
    Ok(None)
  }

  async fn move_entity(&self, msg: MoveEntityMsg) -> AppResult<Option<OutboundMsg>> {
    let (layer, character_id) = {
      let tables = self.session.tables().await;
      let table = tables.table(msg.table_id).ok_or_else(|| AppError::not_found("table"))?;
      let entity = table.entity(msg.entity_id).ok_or_else(|| AppError::not_found("entity"))?;
      (entity.layer, entity.character_id)
    };
    let character_owner = match character_id {
      Some(id) => self.session.characters().await.get(&id).map(|c| c.owner),
      None => None,
    };

    let controls_it = {
      let tables = self.session.tables().await;
      let table = tables.table(msg.table_id).ok_or_else(|| AppError::not_found("table"))?;
      let entity = table.entity(msg.entity_id).ok_or_else(|| AppError::not_found("entity"))?;
      entity.is_controlled_by(self.user_id, character_owner)
    };
    if !controls_it {
      self.require(Permission::ModifyAllTokens).await?;
    } else {
      self.require(Permission::ModifyOwnTokens).await?;
    }

    let mut tables = self.session.tables().await;
    let table = tables.table_mut(msg.table_id).ok_or_else(|| AppError::not_found("table"))?;
    let final_position = table.move_entity(msg.entity_id, msg.position)?;
    let table_snapshot = table.clone();
    drop(tables);

    self.session.stage(PendingWrite::UpsertTable { session_code: self.session.session_code.clone(), table: table_snapshot }).await;
    self
      .session
      .broadcast(
        OutboundMsg::EntityMoved(EntityMovedMsg { table_id: msg.table_id, entity_id: msg.entity_id, position: final_position }),
        Some(layer),
      )
      .await;
    Ok(None)
  }

  async fn delete_entity(&self, msg: DeleteEntityMsg) -> AppResult<Option<OutboundMsg>> {
    self.require(Permission::DeleteTokens).await?;
    let mut tables = self.session.tables().await;
    let table = tables.table_mut(msg.table_id).ok_or_else(|| AppError::not_found("table"))?;
    table.delete_entity(msg.entity_id)?;
    let table_snapshot = table.clone();
    drop(tables);

    self.session.stage(PendingWrite::UpsertTable { session_code: self.session.session_code.clone(), table: table_snapshot }).await;
    self
      .session
      .broadcast(OutboundMsg::EntityRemoved(EntityRemovedMsg { table_id: msg.table_id, entity_id: msg.entity_id }), None)
      .await;
    Ok(None)
  }

  async fn update_entity(&self, msg: UpdateEntityMsg) -> AppResult<Option<OutboundMsg>> {
    if let Some(required) = EntityPatch::required_permission(&msg.patch) {
      self.require(required).await?;
    } else {
      self.require(Permission::ModifyAllTokens).await?;
    }

    let mut tables = self.session.tables().await;
    let table = tables.table_mut(msg.table_id).ok_or_else(|| AppError::not_found("table"))?;
    let entity = table.entity_mut(msg.entity_id).ok_or_else(|| AppError::not_found("entity"))?;
    msg.patch.apply(entity);
    let updated = entity.clone();
    let layer = entity.layer;
    let table_snapshot = table.clone();
    drop(tables);

    self.session.stage(PendingWrite::UpsertTable { session_code: self.session.session_code.clone(), table: table_snapshot }).await;
    self
      .session
      .broadcast(OutboundMsg::EntityUpdated(EntityUpdatedMsg { table_id: msg.table_id, entity: updated }), Some(layer))
      .await;
    Ok(None)
  }

  async fn character_save(&self, msg: CharacterSaveMsg) -> AppResult<Option<OutboundMsg>> {
    let mut characters = self.session.characters().await;
    let character = match msg.character_id {
      Some(id) => {
        let character = characters.get_mut(&id).ok_or_else(|| AppError::not_found("character"))?;
        let is_owner = character.owner == self.user_id;
        drop(characters);
        if is_owner {
          self.require(Permission::EditOwnCharacters).await?;
        } else {
          self.require(Permission::EditAllCharacters).await?;
        }
        let mut characters = self.session.characters().await;
        let character = characters.get_mut(&id).expect("checked above");
        character.save(msg.data, self.user_id, msg.expected_version)?;
        character.clone()
      }
      None => {
        self.require(Permission::CreateCharacters).await?;
        let character = Character::new(msg.name, msg.data, self.user_id);
        characters.insert(character.character_id, character.clone());
        character
      }
    };

    self
      .session
      .stage(PendingWrite::UpsertCharacter { session_code: self.session.session_code.clone(), character: character.clone() })
      .await;
    self.session.broadcast(OutboundMsg::CharacterUpdated(crate::payloads::CharacterUpdatedMsg { character: character.clone() }), None).await;
    Ok(Some(OutboundMsg::CharacterUpdated(crate::payloads::CharacterUpdatedMsg { character })))
  }

  async fn character_load(&self, msg: CharacterLoadMsg) -> AppResult<Option<OutboundMsg>> {
    let characters = self.session.characters().await;
    let character = characters.get(&msg.character_id).ok_or_else(|| AppError::not_found("character"))?.clone();
    Ok(Some(OutboundMsg::CharacterUpdated(crate::payloads::CharacterUpdatedMsg { character })))
  }

  async fn fog_update(&self, msg: FogUpdateMsg) -> AppResult<Option<OutboundMsg>> {
    self.require(Permission::ModifyFogOfWar).await?;
    let mut tables = self.session.tables().await;
    let table = tables.table_mut(msg.table_id).ok_or_else(|| AppError::not_found("table"))?;
    table.layer_visibility.insert(msg.layer.clone(), msg.visible);
    let table_snapshot = table.clone();
    drop(tables);

    self.session.stage(PendingWrite::UpsertTable { session_code: self.session.session_code.clone(), table: table_snapshot }).await;
    self.session.broadcast(OutboundMsg::FogUpdated(msg), None).await;
    Ok(None)
  }

  async fn chat(&self, msg: ChatMsg) -> AppResult<Option<OutboundMsg>> {
    if let Some(recipient) = msg.private_to {
      self.session.unicast(recipient, OutboundMsg::Chat(msg.clone())).await;
      Ok(Some(OutboundMsg::Chat(msg)))
    } else {
      self.session.broadcast(OutboundMsg::Chat(msg), None).await;
      Ok(None)
    }
  }

  async fn dice_roll(&self, msg: DiceRollMsg) -> AppResult<Option<OutboundMsg>> {
    if msg.private {
      self.require(Permission::RollDicePrivate).await?;
      Ok(Some(OutboundMsg::DiceResult(msg)))
    } else {
      self.require(Permission::RollDicePublic).await?;
      self.session.broadcast(OutboundMsg::DiceResult(msg), None).await;
      Ok(None)
    }
  }

  /// Change another player's role, staging the audit entry and
  /// broadcasting the gained/lost permission diff (§4.B).
  pub async fn change_role(&self, target: Uuid, new_role: crate::permission::Role) -> AppResult<()> {
    self.require(Permission::ChangeRoles).await?;
    let previous = self.session.player(target).await.ok_or_else(|| AppError::not_found("player"))?.role;
    let diff = crate::permission::diff_roles(previous, new_role);
    self.session.set_role(target, new_role).await;

    self
      .audit
      .record(
        AuditEvent::RoleChanged,
        &AuditContext { target_user_id: Some(target), ..self.audit_ctx() },
        serde_json::json!({"from": previous, "to": new_role}),
      )
      .await?;

    self
      .session
      .broadcast(
        OutboundMsg::PlayerRoleChanged(crate::payloads::PlayerRoleChangedMsg::from_diff(target, new_role, diff)),
        None,
      )
      .await;
    Ok(())
  }

  /// Kick a player out of the session (§4.B): removes membership and
  /// disconnects every one of their connections.
  pub async fn kick(&self, target: Uuid) -> AppResult<()> {
    self.require(Permission::KickPlayers).await?;
    self.session.kick(target).await;
    self
      .audit
      .record(AuditEvent::PlayerKicked, &AuditContext { target_user_id: Some(target), ..self.audit_ctx() }, serde_json::json!({}))
      .await?;
    self.session.broadcast(OutboundMsg::PlayerKicked(crate::payloads::PlayerKickedMsg { user_id: target }), None).await;
    Ok(())
  }

  pub async fn grant_permission(&self, target: Uuid, permission: Permission) -> AppResult<()> {
    self.require(Permission::ChangeRoles).await?;
    self.session.grant_permission(target, permission).await;
    self
      .audit
      .record(
        AuditEvent::PermissionGranted,
        &AuditContext { target_user_id: Some(target), ..self.audit_ctx() },
        serde_json::json!({"permission": permission}),
      )
      .await?;
    self
      .session
      .broadcast(
        OutboundMsg::PermissionGranted(crate::payloads::PermissionGrantedMsg { user_id: target, permission }),
        None,
      )
      .await;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entity::{EntityKind, GridPos, Tables};
  use crate::persistence::{connect, run_migrations};
  use crate::server::PlayerContext;

  async fn test_context(role: crate::permission::Role) -> (ClientContext, Uuid) {
    let pool = connect("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    let audit = Arc::new(AuditSink::new(pool));

    let user_id = Uuid::new_v4();
    let mut tables = Tables::new();
    tables.create_table("dungeon", 10, 10).unwrap();
    let session = Arc::new(LiveSession::new(
      "ABCDEF".to_string(),
      tables,
      vec![],
      vec![PlayerContext { user_id, username: "alice".to_string(), role, custom_permissions: vec![], is_connected: false, active_table: None }],
    ));
    let client_id = Uuid::new_v4();
    let outbound = Arc::new(crate::transport::OutboundQueue::new(8));
    session.attach(user_id, client_id, outbound).await.unwrap();

    (ClientContext::new(client_id, user_id, session, audit), user_id)
  }

  #[test_log::test(tokio::test)]
  async fn spectator_cannot_create_entity() {
    let (ctx, _) = test_context(crate::permission::Role::Spectator).await;
    let table_id = ctx.session.tables().await.iter().next().unwrap().table_id;
    let result = ctx
      .dispatch(InboundMsg::CreateEntity(CreateEntityMsg {
        table_id,
        name: "goblin".to_string(),
        position: GridPos { x: 0, y: 0 },
        layer: Layer::Tokens,
        kind: EntityKind::Npc,
        texture: "goblin.png".to_string(),
      }))
      .await;
    assert!(result.is_err());
  }

  #[test_log::test(tokio::test)]
  async fn player_can_create_token_and_move_it() {
    let (ctx, _) = test_context(crate::permission::Role::Player).await;
    let table_id = ctx.session.tables().await.iter().next().unwrap().table_id;
    ctx
      .dispatch(InboundMsg::CreateEntity(CreateEntityMsg {
        table_id,
        name: "pc".to_string(),
        position: GridPos { x: 0, y: 0 },
        layer: Layer::Tokens,
        kind: EntityKind::PlayerToken,
        texture: "pc.png".to_string(),
      }))
      .await
      .unwrap();

    let entity_id = { ctx.session.tables().await.table(table_id).unwrap().entities().next().unwrap().entity_id };
    let result = ctx
      .dispatch(InboundMsg::MoveEntity(MoveEntityMsg { table_id, entity_id, position: GridPos { x: 3, y: 3 } }))
      .await;
    assert!(result.is_ok());
  }

  #[test_log::test(tokio::test)]
  async fn ping_replies_with_pong() {
    let (ctx, _) = test_context(crate::permission::Role::Player).await;
    let result = ctx.dispatch(InboundMsg::Ping).await.unwrap();
    assert!(matches!(result, Some(OutboundMsg::Pong)));
  }
}
