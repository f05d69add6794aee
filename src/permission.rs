//! Role-based access control: roles, the fixed permission enumeration, the
//! role -> permission-set table, and effective-permission computation with
//! custom per-user grant overlay.
use std::collections::HashSet;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
  Spectator,
  Player,
  TrustedPlayer,
  CoDm,
  Owner,
}

impl Role {
  /// Numeric strength for `>=` comparisons, matching the source's `role_hierarchy`.
  #[must_use]
  pub fn level(self) -> u8 {
    match self {
      Role::Spectator => 0,
      Role::Player => 1,
      Role::TrustedPlayer => 2,
      Role::CoDm => 3,
      Role::Owner => 4,
    }
  }

  #[must_use]
  pub fn at_least(self, required: Role) -> bool {
    self.level() >= required.level()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Permission {
  CreateTokens,
  DeleteTokens,
  ModifyOwnTokens,
  ModifyAllTokens,
  ViewDmLayer,
  ModifyDmLayer,
  ViewFogOfWar,
  ModifyFogOfWar,
  UploadAssets,
  DeleteAssets,
  ManageAssets,
  UseDrawingTools,
  UseMeasurementTools,
  DeleteDrawings,
  ModifyTurnOrder,
  RollDicePublic,
  RollDicePrivate,
  ViewPrivateRolls,
  InvitePlayers,
  KickPlayers,
  BanPlayers,
  ChangeRoles,
  ModifySession,
  DeleteSession,
  CreateCharacters,
  EditOwnCharacters,
  EditAllCharacters,
  DeleteCharacters,
}

type PermSet = HashSet<Permission>;

fn player_permissions() -> PermSet {
  use Permission::{
    CreateCharacters, EditOwnCharacters, ModifyOwnTokens, RollDicePrivate, RollDicePublic, UseDrawingTools,
    UseMeasurementTools,
  };
  [
    ModifyOwnTokens,
    UseDrawingTools,
    UseMeasurementTools,
    RollDicePublic,
    RollDicePrivate,
    CreateCharacters,
    EditOwnCharacters,
  ]
  .into_iter()
  .collect()
}

fn trusted_player_permissions() -> PermSet {
  use Permission::{DeleteDrawings, UploadAssets};
  let mut set = player_permissions();
  set.extend([UploadAssets, DeleteDrawings]);
  set
}

fn co_dm_permissions() -> PermSet {
  use Permission::{
    CreateTokens, DeleteAssets, DeleteTokens, EditAllCharacters, InvitePlayers, KickPlayers, ManageAssets,
    ModifyAllTokens, ModifyDmLayer, ModifyFogOfWar, ModifyTurnOrder, ViewDmLayer, ViewFogOfWar, ViewPrivateRolls,
  };
  let mut set = trusted_player_permissions();
  set.extend([
    CreateTokens,
    DeleteTokens,
    ModifyAllTokens,
    ViewDmLayer,
    ModifyDmLayer,
    ViewFogOfWar,
    ModifyFogOfWar,
    DeleteAssets,
    ManageAssets,
    ModifyTurnOrder,
    ViewPrivateRolls,
    InvitePlayers,
    KickPlayers,
    EditAllCharacters,
  ]);
  set
}

fn owner_permissions() -> PermSet {
  use Permission::{BanPlayers, ChangeRoles, DeleteCharacters, DeleteSession, ModifySession};
  let mut set = co_dm_permissions();
  set.extend([BanPlayers, ChangeRoles, ModifySession, DeleteSession, DeleteCharacters]);
  set
}

static ROLE_PERMISSIONS: Lazy<[(Role, PermSet); 5]> = Lazy::new(|| {
  [
    (Role::Spectator, PermSet::new()),
    (Role::Player, player_permissions()),
    (Role::TrustedPlayer, trusted_player_permissions()),
    (Role::CoDm, co_dm_permissions()),
    (Role::Owner, owner_permissions()),
  ]
});

#[must_use]
pub fn role_permissions(role: Role) -> &'static PermSet {
  ROLE_PERMISSIONS.iter().find(|(r, _)| *r == role).map(|(_, set)| set).expect("all roles have a permission entry")
}

/// `effective = role_permissions(role) | active_custom_grants`, per §4.B.
#[must_use]
pub fn effective_permissions(role: Role, custom_grants: &[Permission]) -> PermSet {
  let mut set = role_permissions(role).clone();
  set.extend(custom_grants.iter().copied());
  set
}

#[must_use]
pub fn has_permission(role: Role, custom_grants: &[Permission], permission: Permission) -> bool {
  role_permissions(role).contains(&permission) || custom_grants.contains(&permission)
}

/// Permissions gained and lost moving from `from` to `to`, emitted in the
/// audit entry and role-change broadcast per §4.B.
#[derive(Debug, Clone, Serialize)]
pub struct RoleDiff {
  pub gained: Vec<Permission>,
  pub lost: Vec<Permission>,
}

#[must_use]
pub fn diff_roles(from: Role, to: Role) -> RoleDiff {
  let from_set = role_permissions(from);
  let to_set = role_permissions(to);
  let mut gained: Vec<Permission> = to_set.difference(from_set).copied().collect();
  let mut lost: Vec<Permission> = from_set.difference(to_set).copied().collect();
  gained.sort_by_key(std::string::ToString::to_string);
  lost.sort_by_key(std::string::ToString::to_string);
  RoleDiff { gained, lost }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn spectator_has_no_permissions() {
    assert!(role_permissions(Role::Spectator).is_empty());
  }

  #[test]
  fn roles_are_strictly_additive() {
    let roles = [Role::Spectator, Role::Player, Role::TrustedPlayer, Role::CoDm, Role::Owner];
    for pair in roles.windows(2) {
      let (lower, higher) = (pair[0], pair[1]);
      assert!(
        role_permissions(lower).is_subset(role_permissions(higher)),
        "{lower} should be a subset of {higher}"
      );
    }
  }

  #[test]
  fn role_hierarchy_orders_as_spec() {
    assert!(Role::Owner.at_least(Role::CoDm));
    assert!(!Role::Player.at_least(Role::CoDm));
    assert!(Role::Player.at_least(Role::Player));
  }

  #[test]
  fn diff_player_to_co_dm_matches_spec_example() {
    let diff = diff_roles(Role::Player, Role::CoDm);
    assert!(diff.gained.contains(&Permission::CreateTokens));
    assert!(diff.gained.contains(&Permission::InvitePlayers));
    assert!(diff.gained.contains(&Permission::KickPlayers));
    assert!(diff.lost.is_empty());
  }

  #[test]
  fn custom_grant_extends_role_permissions() {
    let grants = [Permission::ViewDmLayer];
    assert!(has_permission(Role::Player, &grants, Permission::ViewDmLayer));
    assert!(!has_permission(Role::Player, &[], Permission::ViewDmLayer));
  }
}
