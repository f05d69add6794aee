//! Table/entity state engine: the authoritative in-memory representation
//! of a session's tables and the entities positioned on them.
//!
//! Mirrors the teacher's `Entities` container shape (a struct owning
//! typed collections, with `derivative`-derived selective equality and
//! `serde_with` DTO annotations) but the domain is grids of positioned
//! tabletop objects rather than ships/planets/missiles.
use std::collections::BTreeMap;

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::permission::Permission;

/// Closed set of layers a table can have. `DungeonMaster` entities are
/// filtered out of any broadcast to a recipient lacking `view_dm_layer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
  Map,
  Tokens,
  DungeonMaster,
  Obstacles,
  Light,
}

impl Layer {
  #[must_use]
  pub fn requires_dm_visibility(self) -> bool {
    matches!(self, Layer::DungeonMaster)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridPos {
  pub x: i32,
  pub y: i32,
}

impl GridPos {
  #[must_use]
  pub fn clamp_to(self, width: i32, height: i32) -> Self {
    GridPos {
      x: self.x.clamp(0, width.saturating_sub(1).max(0)),
      y: self.y.clamp(0, height.saturating_sub(1).max(0)),
    }
  }

  #[must_use]
  pub fn in_bounds(self, width: i32, height: i32) -> bool {
    self.x >= 0 && self.y >= 0 && self.x < width && self.y < height
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenPos {
  pub x: f64,
  pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scale {
  pub x: f64,
  pub y: f64,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObstacleData {
  pub shape_kind: String,
  pub shape: serde_json::Value,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStats {
  pub hp: Option<i32>,
  pub max_hp: Option<i32>,
  pub ac: Option<i32>,
  pub aura_radius: Option<f64>,
}

/// Tagged-variant collapse of the source's polymorphic player/NPC
/// hierarchy (§9 redesign note): no base-class semantics, just a kind tag
/// plus per-kind optional fields folded into `Entity` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  PlayerToken,
  Npc,
  Object,
  Light,
  Obstacle,
}

#[skip_serializing_none]
#[derive(Derivative, Clone, Serialize, Deserialize)]
#[derivative(Debug, PartialEq)]
pub struct Entity {
  pub sprite_id: Uuid,
  pub entity_id: i64,
  pub name: String,
  pub kind: EntityKind,
  pub position: GridPos,
  pub layer: Layer,
  pub texture: String,
  pub scale: Scale,
  pub rotation: f64,
  pub obstacle_data: Option<ObstacleData>,
  pub metadata: Option<serde_json::Value>,
  pub stats: Option<EntityStats>,
  pub character_id: Option<Uuid>,
  /// Explicit extra controllers beyond the binding Character's owner.
  pub controlled_by: Vec<Uuid>,
}

impl Entity {
  #[must_use]
  pub fn is_controlled_by(&self, user_id: Uuid, character_owner: Option<Uuid>) -> bool {
    character_owner == Some(user_id) || self.controlled_by.contains(&user_id)
  }
}

/// A bounded 2D grid within a session. Entities are kept in a `BTreeMap`
/// keyed by the numeric per-table id so iteration order is deterministic
/// insertion order, matching §4.C's "numeric per-table id ascending"
/// ordering rule; deleted ids leave a hole and are never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
  pub table_id: Uuid,
  pub name: String,
  pub width: i32,
  pub height: i32,
  pub screen_position: ScreenPos,
  pub scale: Scale,
  pub layer_visibility: BTreeMap<String, bool>,
  entities: BTreeMap<i64, Entity>,
  next_entity_id: i64,
}

impl Table {
  #[must_use]
  pub fn new(name: impl Into<String>, width: i32, height: i32) -> AppResult<Self> {
    if width <= 0 || height <= 0 {
      return Err(AppError::validation("table dimensions must be positive"));
    }
    Ok(Table {
      table_id: Uuid::new_v4(),
      name: name.into(),
      width,
      height,
      screen_position: ScreenPos { x: 0.0, y: 0.0 },
      scale: Scale { x: 1.0, y: 1.0 },
      layer_visibility: BTreeMap::new(),
      entities: BTreeMap::new(),
      next_entity_id: 1,
    })
  }

  #[must_use]
  pub fn entities(&self) -> impl Iterator<Item = &Entity> {
    self.entities.values()
  }

  #[must_use]
  pub fn entity(&self, entity_id: i64) -> Option<&Entity> {
    self.entities.get(&entity_id)
  }

  pub fn entity_mut(&mut self, entity_id: i64) -> Option<&mut Entity> {
    self.entities.get_mut(&entity_id)
  }

  /// Entities visible to a recipient with the given effective permission
  /// set, per §4.C's layer-filtering rule: DM-layer entities never reach
  /// a recipient lacking `view_dm_layer`.
  #[must_use]
  pub fn visible_entities(&self, can_view_dm_layer: bool) -> Vec<&Entity> {
    self
      .entities
      .values()
      .filter(|e| !e.layer.requires_dm_visibility() || can_view_dm_layer)
      .collect()
  }

  /// Add a new entity, clamping out-of-bounds positions rather than
  /// dropping them (§4.C: "never silently drop").
  pub fn add_entity(
    &mut self,
    name: impl Into<String>,
    position: GridPos,
    layer: Layer,
    kind: EntityKind,
    texture: impl Into<String>,
  ) -> &Entity {
    let clamped = position.clamp_to(self.width, self.height);
    let entity_id = self.next_entity_id;
    self.next_entity_id += 1;
    let entity = Entity {
      sprite_id: Uuid::new_v4(),
      entity_id,
      name: name.into(),
      kind,
      position: clamped,
      layer,
      texture: texture.into(),
      scale: Scale { x: 1.0, y: 1.0 },
      rotation: 0.0,
      obstacle_data: None,
      metadata: None,
      stats: None,
      character_id: None,
      controlled_by: Vec::new(),
    };
    self.entities.insert(entity_id, entity);
    self.entities.get(&entity_id).expect("just inserted")
  }

  pub fn move_entity(&mut self, entity_id: i64, new_position: GridPos) -> AppResult<GridPos> {
    let (width, height) = (self.width, self.height);
    let entity = self
      .entities
      .get_mut(&entity_id)
      .ok_or_else(|| AppError::not_found(format!("entity {entity_id}")))?;
    let clamped = new_position.clamp_to(width, height);
    entity.position = clamped;
    Ok(clamped)
  }

  pub fn delete_entity(&mut self, entity_id: i64) -> AppResult<Entity> {
    self
      .entities
      .remove(&entity_id)
      .ok_or_else(|| AppError::not_found(format!("entity {entity_id}")))
  }

  /// Replace this table's entity set wholesale, e.g. with a
  /// permission-filtered subset built for one recipient's snapshot.
  pub fn replace_entities(&mut self, entities: Vec<Entity>) {
    self.entities = entities.into_iter().map(|e| (e.entity_id, e)).collect();
  }

  /// Reinsert an entity with its stored `entity_id`/`sprite_id` intact,
  /// e.g. when restoring from persistence. `next_entity_id` advances past
  /// it so freshly-created entities never collide with a reloaded one.
  pub fn insert_loaded_entity(&mut self, entity: Entity) {
    self.next_entity_id = self.next_entity_id.max(entity.entity_id + 1);
    self.entities.insert(entity.entity_id, entity);
  }
}

/// Field-level patch applied by `update_entity`; `None` means "leave
/// unchanged". Field-level permission gating lives in `session.rs`/
/// `player.rs`, not here — this struct is pure data.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityPatch {
  pub name: Option<String>,
  pub texture: Option<String>,
  pub scale: Option<Scale>,
  pub rotation: Option<f64>,
  pub obstacle_data: Option<ObstacleData>,
  pub metadata: Option<serde_json::Value>,
  pub stats: Option<EntityStats>,
  pub character_id: Option<Uuid>,
  pub controlled_by: Option<Vec<Uuid>>,
}

impl EntityPatch {
  /// Which permission is required to apply this patch, per §4.C:
  /// obstacle/fog fields require `modify_fog_of_war`; everything else
  /// follows ownership or `modify_all_tokens`.
  #[must_use]
  pub fn required_permission(&self) -> Option<Permission> {
    if self.obstacle_data.is_some() {
      return Some(Permission::ModifyFogOfWar);
    }
    if let Some(metadata) = &self.metadata {
      if metadata.get("light").is_some() {
        return Some(Permission::ModifyFogOfWar);
      }
    }
    None
  }

  pub fn apply(self, entity: &mut Entity) {
    if let Some(v) = self.name {
      entity.name = v;
    }
    if let Some(v) = self.texture {
      entity.texture = v;
    }
    if let Some(v) = self.scale {
      entity.scale = v;
    }
    if let Some(v) = self.rotation {
      entity.rotation = v;
    }
    if let Some(v) = self.obstacle_data {
      entity.obstacle_data = Some(v);
    }
    if let Some(v) = self.metadata {
      entity.metadata = Some(v);
    }
    if let Some(v) = self.stats {
      entity.stats = Some(v);
    }
    if let Some(v) = self.character_id {
      entity.character_id = Some(v);
    }
    if let Some(v) = self.controlled_by {
      entity.controlled_by = v;
    }
  }
}

/// In-memory tables for one live session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
  tables: BTreeMap<Uuid, Table>,
}

impl Tables {
  #[must_use]
  pub fn new() -> Self {
    Tables::default()
  }

  /// Insert a fully-built `Table` (already carrying its own id) as-is,
  /// used when reconstructing a session from storage on load (§4.D) where
  /// the duplicate-name check has no meaning.
  pub fn adopt(&mut self, table: Table) {
    self.tables.insert(table.table_id, table);
  }

  pub fn create_table(&mut self, name: impl Into<String>, width: i32, height: i32) -> AppResult<&Table> {
    let name = name.into();
    if self.tables.values().any(|t| t.name == name) {
      return Err(AppError::conflict(format!("table named {name} already exists")));
    }
    let table = Table::new(name, width, height)?;
    let id = table.table_id;
    self.tables.insert(id, table);
    Ok(self.tables.get(&id).expect("just inserted"))
  }

  #[must_use]
  pub fn table(&self, table_id: Uuid) -> Option<&Table> {
    self.tables.get(&table_id)
  }

  pub fn table_mut(&mut self, table_id: Uuid) -> Option<&mut Table> {
    self.tables.get_mut(&table_id)
  }

  pub fn delete_table(&mut self, table_id: Uuid) -> AppResult<Table> {
    self.tables.remove(&table_id).ok_or_else(|| AppError::not_found("table"))
  }

  #[must_use]
  pub fn iter(&self) -> impl Iterator<Item = &Table> {
    self.tables.values()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn table_rejects_non_positive_dimensions() {
    assert!(Table::new("dungeon", 0, 10).is_err());
    assert!(Table::new("dungeon", 10, -1).is_err());
  }

  #[test]
  fn entity_position_clamps_to_bounds() {
    let mut table = Table::new("dungeon", 10, 10).unwrap();
    let entity = table.add_entity("goblin", GridPos { x: 50, y: -5 }, Layer::Tokens, EntityKind::Npc, "goblin.png");
    assert!(entity.position.in_bounds(10, 10));
    assert_eq!(entity.position, GridPos { x: 9, y: 0 });
  }

  #[test]
  fn dm_layer_entity_is_filtered_from_non_dm_viewers() {
    let mut table = Table::new("dungeon", 10, 10).unwrap();
    table.add_entity("note", GridPos { x: 1, y: 1 }, Layer::DungeonMaster, EntityKind::Object, "note.png");
    table.add_entity("token", GridPos { x: 2, y: 2 }, Layer::Tokens, EntityKind::PlayerToken, "pc.png");

    let visible_to_player = table.visible_entities(false);
    assert_eq!(visible_to_player.len(), 1);
    assert_eq!(visible_to_player[0].name, "token");

    let visible_to_dm = table.visible_entities(true);
    assert_eq!(visible_to_dm.len(), 2);
  }

  #[test]
  fn move_entity_clamps_and_updates_position() {
    let mut table = Table::new("dungeon", 5, 5).unwrap();
    let id = table.add_entity("pc", GridPos { x: 0, y: 0 }, Layer::Tokens, EntityKind::PlayerToken, "pc.png").entity_id;
    let result = table.move_entity(id, GridPos { x: 100, y: 2 }).unwrap();
    assert_eq!(result, GridPos { x: 4, y: 2 });
  }

  #[test]
  fn delete_entity_leaves_a_hole_in_ids() {
    let mut table = Table::new("dungeon", 5, 5).unwrap();
    let first = table.add_entity("a", GridPos { x: 0, y: 0 }, Layer::Tokens, EntityKind::PlayerToken, "a.png").entity_id;
    let _second = table.add_entity("b", GridPos { x: 1, y: 1 }, Layer::Tokens, EntityKind::PlayerToken, "b.png").entity_id;
    table.delete_entity(first).unwrap();
    let third = table.add_entity("c", GridPos { x: 2, y: 2 }, Layer::Tokens, EntityKind::PlayerToken, "c.png").entity_id;
    assert_ne!(third, first);
    assert!(third > _second);
  }

  #[test]
  fn create_table_rejects_duplicate_names() {
    let mut tables = Tables::new();
    tables.create_table("dungeon", 10, 10).unwrap();
    assert!(tables.create_table("dungeon", 5, 5).is_err());
  }
}
