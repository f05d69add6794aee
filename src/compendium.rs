//! Read-only game-content catalog (§1, §6): spells, classes, backgrounds,
//! equipment, monsters, races. Loaded once at startup, immutable
//! afterwards, freely readable without synchronization (§5).
//!
//! Grounded on the teacher's `read_local_or_cloud_file` (local-file load
//! of a JSON/scenario asset at startup) trimmed to the local-file-only
//! path per DESIGN.md's dropped-`google-cloud-storage` entry.
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_json::Value;

pub const CATEGORIES: &[&str] = &["races", "classes", "backgrounds", "spells", "equipment", "monsters"];

/// One category's entries, keyed by name, loaded from `{dir}/{category}.json`
/// (a JSON object mapping entry name to its data). A missing file yields an
/// empty category rather than a startup failure, since not every
/// deployment ships every category.
#[derive(Debug, Default)]
pub struct Compendium {
  categories: HashMap<String, HashMap<String, Value>>,
}

impl Compendium {
  /// Load every known category from `dir`, skipping files that don't exist.
  #[must_use]
  pub fn load(dir: &Path) -> Self {
    let mut categories = HashMap::new();
    for category in CATEGORIES {
      let path = dir.join(format!("{category}.json"));
      let Ok(bytes) = fs::read(&path) else { continue };
      let Ok(Value::Object(entries)) = serde_json::from_slice::<Value>(&bytes) else { continue };
      categories.insert((*category).to_string(), entries.into_iter().collect());
    }
    Compendium { categories }
  }

  #[must_use]
  pub fn category(&self, category: &str) -> Option<Vec<&Value>> {
    self.categories.get(category).map(|entries| entries.values().collect())
  }

  #[must_use]
  pub fn entry(&self, category: &str, name: &str) -> Option<&Value> {
    self.categories.get(category)?.get(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_directory_yields_empty_categories() {
    let compendium = Compendium::load(Path::new("/nonexistent/path/for/tests"));
    assert!(compendium.category("spells").is_none());
  }
}
