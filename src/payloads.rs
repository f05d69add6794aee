//! Real-time message DTOs (§6): the closed set of inbound and outbound
//! frame kinds exchanged over `/ws/game/{session_code}`.
//!
//! Grounded on the teacher's `payloads.rs`: a tagged `RequestMsg`/
//! `ResponseMsg` enum-of-message-kinds, `#[skip_serializing_none]` DTOs,
//! and a custom `Debug` redacting secret fields (`LoginMsg`).
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::fmt::Debug;
use uuid::Uuid;

use crate::character::Character;
use crate::entity::{Entity, EntityKind, EntityPatch, GridPos, Layer, Table};
use crate::permission::{Permission, Role, RoleDiff};

#[derive(Serialize, Deserialize)]
pub struct RegisterMsg {
  pub token: String,
}

impl Debug for RegisterMsg {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "RegisterMsg {{ token: [REDACTED] }}")
  }
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize)]
pub struct TableRequestMsg {
  pub table_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTableMsg {
  pub name: String,
  pub width: i32,
  pub height: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteTableMsg {
  pub table_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpriteUpdateMsg {
  pub table_id: Uuid,
  pub entity_id: i64,
  pub position: GridPos,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateEntityMsg {
  pub table_id: Uuid,
  pub name: String,
  pub position: GridPos,
  pub layer: Layer,
  pub kind: EntityKind,
  pub texture: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MoveEntityMsg {
  pub table_id: Uuid,
  pub entity_id: i64,
  pub position: GridPos,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteEntityMsg {
  pub table_id: Uuid,
  pub entity_id: i64,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateEntityMsg {
  pub table_id: Uuid,
  pub entity_id: i64,
  pub patch: EntityPatch,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize)]
pub struct CharacterSaveMsg {
  pub character_id: Option<Uuid>,
  pub name: String,
  pub data: Value,
  pub expected_version: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CharacterLoadMsg {
  pub character_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FogUpdateMsg {
  pub table_id: Uuid,
  pub layer: String,
  pub visible: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMsg {
  pub content: String,
  pub private_to: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiceRollMsg {
  pub expression: String,
  pub result: i64,
  pub private: bool,
}

/// Inbound frame kinds a client may send (§6).
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundMsg {
  Register(RegisterMsg),
  Ping,
  TableRequest(TableRequestMsg),
  CreateTable(CreateTableMsg),
  DeleteTable(DeleteTableMsg),
  SpriteUpdate(SpriteUpdateMsg),
  CreateEntity(CreateEntityMsg),
  MoveEntity(MoveEntityMsg),
  DeleteEntity(DeleteEntityMsg),
  UpdateEntity(UpdateEntityMsg),
  CharacterSave(CharacterSaveMsg),
  CharacterLoad(CharacterLoadMsg),
  FogUpdate(FogUpdateMsg),
  Chat(ChatMsg),
  DiceRoll(DiceRollMsg),
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotMsg {
  pub session_code: String,
  pub tables: Vec<Table>,
  pub characters: Vec<Character>,
  pub players: Vec<PlayerSummary>,
  pub your_role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerSummary {
  pub user_id: Uuid,
  pub username: String,
  pub role: Role,
  pub is_connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableDeletedMsg {
  pub table_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityAddedMsg {
  pub table_id: Uuid,
  pub entity: Entity,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityMovedMsg {
  pub table_id: Uuid,
  pub entity_id: i64,
  pub position: GridPos,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityUpdatedMsg {
  pub table_id: Uuid,
  pub entity: Entity,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityRemovedMsg {
  pub table_id: Uuid,
  pub entity_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CharacterUpdatedMsg {
  pub character: Character,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerRoleChangedMsg {
  pub user_id: Uuid,
  pub new_role: Role,
  pub permissions_gained: Vec<Permission>,
  pub permissions_lost: Vec<Permission>,
}

impl PlayerRoleChangedMsg {
  #[must_use]
  pub fn from_diff(user_id: Uuid, new_role: Role, diff: RoleDiff) -> Self {
    PlayerRoleChangedMsg { user_id, new_role, permissions_gained: diff.gained, permissions_lost: diff.lost }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerKickedMsg {
  pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionGrantedMsg {
  pub user_id: Uuid,
  pub permission: Permission,
}

/// Outbound frame kinds the server may send (§6). `critical` controls
/// backpressure handling in the transport layer: role change, kick, and
/// snapshot frames are never dropped before movement/cursor noise.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMsg {
  Snapshot(SnapshotMsg),
  TableData(Table),
  TableCreated(Table),
  TableDeleted(TableDeletedMsg),
  EntityAdded(EntityAddedMsg),
  EntityMoved(EntityMovedMsg),
  EntityUpdated(EntityUpdatedMsg),
  EntityRemoved(EntityRemovedMsg),
  CharacterUpdated(CharacterUpdatedMsg),
  FogUpdated(FogUpdateMsg),
  Chat(ChatMsg),
  DiceResult(DiceRollMsg),
  PlayerJoined(PlayerSummary),
  PlayerLeft { user_id: Uuid },
  PlayerRoleChanged(PlayerRoleChangedMsg),
  PlayerKicked(PlayerKickedMsg),
  PermissionGranted(PermissionGrantedMsg),
  Pong,
  Error(crate::error::ErrorBody),
}

impl OutboundMsg {
  /// §4.F backpressure policy: everything except movement/cursor noise is
  /// critical and must survive a full outbound queue.
  #[must_use]
  pub fn is_critical(&self) -> bool {
    !matches!(self, OutboundMsg::EntityMoved(_) | OutboundMsg::Chat(_) | OutboundMsg::DiceResult(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn inbound_ping_round_trips() {
    let json_str = r#"{"type":"ping"}"#;
    let msg: InboundMsg = serde_json::from_str(json_str).unwrap();
    assert!(matches!(msg, InboundMsg::Ping));
  }

  #[test]
  fn register_debug_redacts_token() {
    let msg = RegisterMsg { token: "super-secret".to_string() };
    assert_eq!(format!("{msg:?}"), "RegisterMsg { token: [REDACTED] }");
  }

  #[test]
  fn entity_moved_is_not_critical() {
    let msg = OutboundMsg::EntityMoved(EntityMovedMsg { table_id: Uuid::nil(), entity_id: 1, position: GridPos { x: 0, y: 0 } });
    assert!(!msg.is_critical());
  }

  #[test]
  fn player_kicked_is_critical() {
    let msg = OutboundMsg::PlayerKicked(PlayerKickedMsg { user_id: Uuid::nil() });
    assert!(msg.is_critical());
  }

  #[test]
  fn create_entity_msg_deserializes_from_client_json() {
    let json_str = json!({
      "type": "create_entity",
      "data": {
        "table_id": "00000000-0000-0000-0000-000000000000",
        "name": "goblin",
        "position": {"x": 1, "y": 2},
        "layer": "tokens",
        "kind": "npc",
        "texture": "goblin.png"
      }
    })
    .to_string();
    let msg: InboundMsg = serde_json::from_str(&json_str).unwrap();
    assert!(matches!(msg, InboundMsg::CreateEntity(_)));
  }
}
