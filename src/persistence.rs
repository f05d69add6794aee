//! Durable persistence (§4.D): schema, forward-only migrations, and
//! write-through save/load of sessions, tables, entities, and characters.
//!
//! Grounded on `other_examples/..._persistence-mod.rs`'s trait-over-backend
//! shape (a `Persistence`-like facade around a pooled connection) and on
//! `original_source/server_host/database/migrations/run_migrations.py`'s
//! `MigrationRunner` (schema_migrations table, lexical ordering, skip
//! already-applied, one transaction per migration).
use std::collections::BTreeMap;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::character::Character;
use crate::entity::{EntityKind, GridPos, Layer, Scale, ScreenPos, Table, Tables};
use crate::error::AppResult;
use crate::{debug, info};

/// Embedded, lexically-ordered migrations, mirroring the source's
/// numbered-file scheme (`001_...py`, `002_...py`, ...) but expressed as
/// Rust string constants rather than a directory scan, since the set is
/// fixed at build time for this crate.
const MIGRATIONS: &[(&str, &str)] = &[
  ("0001_users", include_str!("../migrations/0001_users.sql")),
  ("0002_sessions", include_str!("../migrations/0002_sessions.sql")),
  ("0003_tables_entities", include_str!("../migrations/0003_tables_entities.sql")),
  ("0004_characters", include_str!("../migrations/0004_characters.sql")),
  ("0005_permissions_invitations", include_str!("../migrations/0005_permissions_invitations.sql")),
  ("0006_audit_log", include_str!("../migrations/0006_audit_log.sql")),
  ("0007_tokens", include_str!("../migrations/0007_tokens.sql")),
  ("0008_registration_flood", include_str!("../migrations/0008_registration_flood.sql")),
];

pub async fn connect(database_url: &str) -> AppResult<SqlitePool> {
  let pool = SqlitePoolOptions::new().max_connections(5).connect(database_url).await?;
  Ok(pool)
}

/// Applies every migration not yet recorded in `schema_migrations`, each
/// inside its own transaction, in lexical id order. Re-running over a
/// fully-migrated database is a no-op (§8 idempotence law).
pub async fn run_migrations(pool: &SqlitePool) -> AppResult<()> {
  sqlx::query(
    "CREATE TABLE IF NOT EXISTS schema_migrations (\
       id INTEGER PRIMARY KEY AUTOINCREMENT,\
       migration_name TEXT NOT NULL UNIQUE,\
       applied_at TEXT NOT NULL DEFAULT (datetime('now'))\
     )",
  )
  .execute(pool)
  .await?;

  let applied: Vec<String> = sqlx::query_scalar("SELECT migration_name FROM schema_migrations")
    .fetch_all(pool)
    .await?;

  for (name, sql) in MIGRATIONS {
    if applied.iter().any(|a| a == name) {
      debug!("(persistence) migration {name} already applied, skipping");
      continue;
    }
    info!("(persistence) applying migration {name}");
    let mut tx = pool.begin().await?;
    for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
      sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query("INSERT INTO schema_migrations (migration_name) VALUES (?1)")
      .bind(*name)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;
  }
  Ok(())
}

/// One batched mutation waiting to be flushed. The session loop
/// (`server.rs`) stages these and the writer flushes them as a single
/// transaction on the boundaries named in §4.D.
#[derive(Debug, Clone)]
pub enum PendingWrite {
  UpsertTable { session_code: String, table: Table },
  DeleteTable { table_id: Uuid },
  UpsertCharacter { session_code: String, character: Character },
  SetActiveTable { session_code: String, user_id: Uuid, table_id: Option<Uuid> },
}

pub struct Persistence {
  pool: SqlitePool,
}

impl Persistence {
  #[must_use]
  pub fn new(pool: SqlitePool) -> Self {
    Persistence { pool }
  }

  #[must_use]
  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }

  /// Flush a batch of staged mutations as a single transaction: all
  /// commit or none do (§4.D).
  pub async fn flush(&self, writes: Vec<PendingWrite>) -> AppResult<()> {
    if writes.is_empty() {
      return Ok(());
    }
    let mut tx = self.pool.begin().await?;
    for write in writes {
      match write {
        PendingWrite::UpsertTable { session_code, table } => {
          sqlx::query(
            "INSERT INTO tables (table_id, session_code, name, width, height, screen_x, screen_y, scale_x, scale_y, layer_visibility) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(table_id) DO UPDATE SET name=excluded.name, width=excluded.width, height=excluded.height, \
               screen_x=excluded.screen_x, screen_y=excluded.screen_y, scale_x=excluded.scale_x, scale_y=excluded.scale_y, \
               layer_visibility=excluded.layer_visibility",
          )
          .bind(table.table_id.to_string())
          .bind(&session_code)
          .bind(&table.name)
          .bind(table.width)
          .bind(table.height)
          .bind(table.screen_position.x)
          .bind(table.screen_position.y)
          .bind(table.scale.x)
          .bind(table.scale.y)
          .bind(serde_json::to_string(&table.layer_visibility)?)
          .execute(&mut *tx)
          .await?;

          sqlx::query("DELETE FROM entities WHERE table_id = ?1").bind(table.table_id.to_string()).execute(&mut *tx).await?;
          for entity in table.entities() {
            sqlx::query(
              "INSERT INTO entities (sprite_id, table_id, entity_id, name, kind, pos_x, pos_y, layer, texture, \
                 scale_x, scale_y, rotation, obstacle_data, metadata, stats, character_id, controlled_by) \
               VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            )
            .bind(entity.sprite_id.to_string())
            .bind(table.table_id.to_string())
            .bind(entity.entity_id)
            .bind(&entity.name)
            .bind(serde_json::to_string(&entity.kind)?)
            .bind(entity.position.x)
            .bind(entity.position.y)
            .bind(serde_json::to_string(&entity.layer)?)
            .bind(&entity.texture)
            .bind(entity.scale.x)
            .bind(entity.scale.y)
            .bind(entity.rotation)
            .bind(entity.obstacle_data.as_ref().map(serde_json::to_string).transpose()?)
            .bind(entity.metadata.as_ref().map(serde_json::to_string).transpose()?)
            .bind(entity.stats.as_ref().map(serde_json::to_string).transpose()?)
            .bind(entity.character_id.map(|id| id.to_string()))
            .bind(serde_json::to_string(&entity.controlled_by)?)
            .execute(&mut *tx)
            .await?;
          }
        }
        PendingWrite::DeleteTable { table_id } => {
          sqlx::query("DELETE FROM entities WHERE table_id = ?1").bind(table_id.to_string()).execute(&mut *tx).await?;
          sqlx::query("DELETE FROM tables WHERE table_id = ?1").bind(table_id.to_string()).execute(&mut *tx).await?;
        }
        PendingWrite::UpsertCharacter { session_code, character } => {
          sqlx::query(
            "INSERT INTO characters (character_id, session_code, name, data, owner, version, last_modified_by) \
             VALUES (?1,?2,?3,?4,?5,?6,?7) \
             ON CONFLICT(character_id) DO UPDATE SET name=excluded.name, data=excluded.data, version=excluded.version, \
               last_modified_by=excluded.last_modified_by",
          )
          .bind(character.character_id.to_string())
          .bind(&session_code)
          .bind(&character.name)
          .bind(serde_json::to_string(&character.data)?)
          .bind(character.owner.to_string())
          .bind(character.version)
          .bind(character.last_modified_by.to_string())
          .execute(&mut *tx)
          .await?;
        }
        PendingWrite::SetActiveTable { session_code, user_id, table_id } => {
          sqlx::query("UPDATE game_players SET active_table_id = ?1 WHERE session_code = ?2 AND user_id = ?3")
            .bind(table_id.map(|id| id.to_string()))
            .bind(&session_code)
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await?;
        }
      }
    }
    tx.commit().await?;
    Ok(())
  }

  /// Reconstruct a session's tables/entities from storage, per §4.D's
  /// "bulk-load tables, then all entities for those tables in one joined
  /// query" recipe.
  pub async fn load_tables(&self, session_code: &str) -> AppResult<Tables> {
    let table_rows = sqlx::query("SELECT * FROM tables WHERE session_code = ?1").bind(session_code).fetch_all(&self.pool).await?;

    let mut tables = Tables::new();
    let mut by_id: BTreeMap<Uuid, Table> = BTreeMap::new();
    for row in &table_rows {
      let table_id: String = row.try_get("table_id")?;
      let table_id = Uuid::parse_str(&table_id).unwrap_or_else(|_| Uuid::nil());
      let layer_visibility: String = row.try_get("layer_visibility")?;
      let mut table = Table::new(row.try_get::<String, _>("name")?, row.try_get("width")?, row.try_get("height")?)?;
      table.table_id = table_id;
      table.screen_position = ScreenPos { x: row.try_get("screen_x")?, y: row.try_get("screen_y")? };
      table.scale = Scale { x: row.try_get("scale_x")?, y: row.try_get("scale_y")? };
      table.layer_visibility = serde_json::from_str(&layer_visibility)?;
      by_id.insert(table_id, table);
    }

    if !by_id.is_empty() {
      let ids: Vec<String> = by_id.keys().map(ToString::to_string).collect();
      let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
      let query = format!("SELECT * FROM entities WHERE table_id IN ({placeholders})");
      let mut q = sqlx::query(&query);
      for id in &ids {
        q = q.bind(id);
      }
      let entity_rows = q.fetch_all(&self.pool).await?;
      for row in entity_rows {
        let table_id: String = row.try_get("table_id")?;
        let table_id = Uuid::parse_str(&table_id).unwrap_or_else(|_| Uuid::nil());
        if let Some(table) = by_id.get_mut(&table_id) {
          let kind: String = row.try_get("kind")?;
          let layer: String = row.try_get("layer")?;
          let position = GridPos { x: row.try_get("pos_x")?, y: row.try_get("pos_y")? };
          let sprite_id: String = row.try_get("sprite_id")?;
          let obstacle_data: Option<String> = row.try_get("obstacle_data")?;
          let metadata: Option<String> = row.try_get("metadata")?;
          let stats: Option<String> = row.try_get("stats")?;
          let character_id: Option<String> = row.try_get("character_id")?;
          let controlled_by: String = row.try_get("controlled_by")?;

          let entity = crate::entity::Entity {
            sprite_id: Uuid::parse_str(&sprite_id).unwrap_or_else(|_| Uuid::nil()),
            entity_id: row.try_get("entity_id")?,
            name: row.try_get("name")?,
            kind: serde_json::from_str::<EntityKind>(&kind)?,
            position,
            layer: serde_json::from_str::<Layer>(&layer)?,
            texture: row.try_get("texture")?,
            scale: Scale { x: row.try_get("scale_x")?, y: row.try_get("scale_y")? },
            rotation: row.try_get("rotation")?,
            obstacle_data: obstacle_data.map(|s| serde_json::from_str(&s)).transpose()?,
            metadata: metadata.map(|s| serde_json::from_str(&s)).transpose()?,
            stats: stats.map(|s| serde_json::from_str(&s)).transpose()?,
            character_id: character_id.and_then(|s| Uuid::parse_str(&s).ok()),
            controlled_by: serde_json::from_str(&controlled_by)?,
          };
          table.insert_loaded_entity(entity);
        }
      }
    }

    for table in by_id.into_values() {
      tables.adopt(table);
    }
    Ok(tables)
  }

  pub async fn load_characters(&self, session_code: &str) -> AppResult<Vec<Character>> {
    let rows = sqlx::query("SELECT * FROM characters WHERE session_code = ?1").bind(session_code).fetch_all(&self.pool).await?;
    let mut characters = Vec::with_capacity(rows.len());
    for row in rows {
      let data: String = row.try_get("data")?;
      characters.push(Character {
        character_id: Uuid::parse_str(&row.try_get::<String, _>("character_id")?).unwrap_or_else(|_| Uuid::nil()),
        name: row.try_get("name")?,
        data: serde_json::from_str(&data)?,
        owner: Uuid::parse_str(&row.try_get::<String, _>("owner")?).unwrap_or_else(|_| Uuid::nil()),
        version: row.try_get("version")?,
        last_modified_by: Uuid::parse_str(&row.try_get::<String, _>("last_modified_by")?).unwrap_or_else(|_| Uuid::nil()),
      });
    }
    Ok(characters)
  }
}

/// Rolling-window registration flood check (§4.A / §11): counts recent
/// registrations globally and per client IP, mirroring
/// `crud.py::check_registration_flood_protection`.
pub async fn check_registration_flood(pool: &SqlitePool, ip: Option<&str>, limit: i64, window_secs: i64) -> AppResult<bool> {
  let window = format!("-{window_secs} seconds");
  let global_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM registration_attempts WHERE created_at > datetime('now', ?1)")
    .bind(&window)
    .fetch_one(pool)
    .await?;
  if global_count >= limit {
    return Ok(false);
  }
  if let Some(ip) = ip {
    let ip_count: i64 = sqlx::query_scalar(
      "SELECT COUNT(*) FROM registration_attempts WHERE ip_address = ?1 AND created_at > datetime('now', ?2)",
    )
    .bind(ip)
    .bind(&window)
    .fetch_one(pool)
    .await?;
    if ip_count >= limit {
      return Ok(false);
    }
  }
  Ok(true)
}

pub async fn record_registration_attempt(pool: &SqlitePool, ip: Option<&str>) -> AppResult<()> {
  sqlx::query("INSERT INTO registration_attempts (ip_address) VALUES (?1)").bind(ip).execute(pool).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn test_pool() -> SqlitePool {
    let pool = connect("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
  }

  #[test_log::test(tokio::test)]
  async fn migrations_are_idempotent() {
    let pool = test_pool().await;
    run_migrations(&pool).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations").fetch_one(&pool).await.unwrap();
    assert_eq!(count, MIGRATIONS.len() as i64);
  }

  #[test_log::test(tokio::test)]
  async fn save_and_load_table_round_trips() {
    let pool = test_pool().await;
    sqlx::query("INSERT INTO users (user_id, username, session_version) VALUES ('u1','alice',0)").execute(&pool).await.unwrap();
    sqlx::query("INSERT INTO game_sessions (session_code, name, owner_user_id) VALUES ('ABCDEF','Epic','u1')")
      .execute(&pool)
      .await
      .unwrap();

    let persistence = Persistence::new(pool);
    let mut table = Table::new("dungeon", 10, 10).unwrap();
    table.add_entity("pc", GridPos { x: 1, y: 1 }, Layer::Tokens, EntityKind::PlayerToken, "pc.png");
    persistence.flush(vec![PendingWrite::UpsertTable { session_code: "ABCDEF".to_string(), table: table.clone() }]).await.unwrap();

    let loaded = persistence.load_tables("ABCDEF").await.unwrap();
    let reloaded = loaded.table(table.table_id).expect("table present after reload");
    assert_eq!(reloaded.width, 10);
    assert_eq!(reloaded.entities().count(), 1);
  }
}
