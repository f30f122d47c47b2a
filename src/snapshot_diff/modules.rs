// Module list diff between two snapshots

use crate::address::Address;
use crate::model::Module;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A module loaded in both snapshots whose version or base address differs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleChange {
    pub name: String,
    pub version_before: Option<String>,
    pub version_after: Option<String>,
    pub base_before: Option<Address>,
    pub base_after: Option<Address>,
}

impl ModuleChange {
    /// Both versions known and different
    pub fn version_changed(&self) -> bool {
        matches!(
            (&self.version_before, &self.version_after),
            (Some(a), Some(b)) if a != b
        )
    }

    /// Both base addresses known and different
    pub fn rebased(&self) -> bool {
        matches!(
            (self.base_before, self.base_after),
            (Some(a), Some(b)) if a != b
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleDiff {
    pub loaded: Vec<Module>,
    pub unloaded: Vec<Module>,
    pub changed: Vec<ModuleChange>,
}

/// First module per normalized name
fn index(modules: &[Module]) -> HashMap<String, &Module> {
    let mut map = HashMap::new();
    for module in modules {
        map.entry(module.normalized_name()).or_insert(module);
    }
    map
}

/// Diff module lists by normalized file name
pub fn diff_modules(baseline: &[Module], comparison: &[Module]) -> ModuleDiff {
    let before = index(baseline);
    let after = index(comparison);
    let mut diff = ModuleDiff::default();
    let mut seen = HashSet::new();

    for module in comparison {
        let key = module.normalized_name();
        if !seen.insert(key.clone()) {
            continue;
        }
        match before.get(&key) {
            None => diff.loaded.push(module.clone()),
            Some(old) => {
                let change = ModuleChange {
                    name: module.name.clone(),
                    version_before: old.version.clone(),
                    version_after: module.version.clone(),
                    base_before: old.base_address,
                    base_after: module.base_address,
                };
                if change.version_changed() || change.rebased() {
                    diff.changed.push(change);
                }
            }
        }
    }

    let mut seen = HashSet::new();
    for module in baseline {
        let key = module.normalized_name();
        if seen.insert(key.clone()) && !after.contains_key(&key) {
            diff.unloaded.push(module.clone());
        }
    }

    diff
}
