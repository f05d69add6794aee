//! Session-scoped character records with optimistic-concurrency versioning
//! and deep-merge patch semantics (§4.D).
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Character {
  pub character_id: Uuid,
  pub name: String,
  pub data: Value,
  pub owner: Uuid,
  pub version: i64,
  pub last_modified_by: Uuid,
}

impl Character {
  #[must_use]
  pub fn new(name: impl Into<String>, data: Value, owner: Uuid) -> Self {
    Character {
      character_id: Uuid::new_v4(),
      name: name.into(),
      data,
      owner,
      version: 1,
      last_modified_by: owner,
    }
  }

  /// Apply a save per §4.D's character versioning protocol. On a version
  /// mismatch this is a no-op that returns `VERSION_CONFLICT`; the caller
  /// already has the current stored state (`self`) to hand back.
  pub fn save(&mut self, patch: Value, actor: Uuid, expected_version: Option<i64>) -> AppResult<()> {
    if let Some(expected) = expected_version {
      if expected != self.version {
        return Err(AppError::conflict("VERSION_CONFLICT"));
      }
    }
    deep_merge(&mut self.data, patch);
    self.version += 1;
    self.last_modified_by = actor;
    Ok(())
  }
}

/// Top-level keys overwrite; nested objects recursively merge; arrays
/// replace wholesale. Mirrors the merge-queue idiom in the teacher's
/// `action::merge` (new values replace/extend existing ones keyed by
/// identity) generalized to arbitrary JSON.
pub fn deep_merge(base: &mut Value, patch: Value) {
  match (base, patch) {
    (Value::Object(base_map), Value::Object(patch_map)) => {
      for (key, patch_value) in patch_map {
        match base_map.get_mut(&key) {
          Some(existing) if existing.is_object() && patch_value.is_object() => {
            deep_merge(existing, patch_value);
          }
          _ => {
            base_map.insert(key, patch_value);
          }
        }
      }
    }
    (base_slot, patch_value) => *base_slot = patch_value,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn save_bumps_version_and_merges_nested_objects() {
    let owner = Uuid::new_v4();
    let mut character = Character::new("Elora", json!({"hp": 10, "stats": {"str": 12, "dex": 14}}), owner);
    character.save(json!({"hp": 12, "stats": {"str": 13}}), owner, Some(1)).unwrap();
    assert_eq!(character.version, 2);
    assert_eq!(character.data["hp"], 12);
    assert_eq!(character.data["stats"]["str"], 13);
    assert_eq!(character.data["stats"]["dex"], 14);
  }

  #[test]
  fn mismatched_expected_version_is_a_conflict_no_op() {
    let owner = Uuid::new_v4();
    let mut character = Character::new("Elora", json!({"hp": 10}), owner);
    let other = Uuid::new_v4();

    character.save(json!({"hp": 12}), owner, Some(1)).unwrap();
    assert_eq!(character.version, 2);

    // `other` still thinks the version is 1 - stale save must be rejected and leave state untouched.
    let stale_result = character.save(json!({"hp": 99}), other, Some(1));
    assert!(stale_result.is_err());
    assert_eq!(character.data["hp"], 12);
    assert_eq!(character.version, 2);
  }

  #[test]
  fn arrays_are_replaced_wholesale() {
    let owner = Uuid::new_v4();
    let mut character = Character::new("Elora", json!({"inventory": ["sword", "shield"]}), owner);
    character.save(json!({"inventory": ["bow"]}), owner, None).unwrap();
    assert_eq!(character.data["inventory"], json!(["bow"]));
  }
}
