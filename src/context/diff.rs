//! Structural diffs between JSON key-value maps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JsonMap;

/// Old and new value of a modified key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedValue {
    pub old: Value,
    pub new: Value,
}

/// Keys added, modified and removed between two maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DictDiff {
    pub added: JsonMap,
    pub modified: BTreeMap<String, ModifiedValue>,
    pub removed: JsonMap,
}

impl DictDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Number of keys touched.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    /// Replay this diff onto `target`.
    ///
    /// Added and modified keys take their new value, removed keys are
    /// dropped. Keys the diff does not mention are left alone.
    pub fn apply(&self, target: &mut JsonMap) {
        for (key, value) in &self.added {
            target.insert(key.clone(), value.clone());
        }
        for (key, change) in &self.modified {
            target.insert(key.clone(), change.new.clone());
        }
        for key in self.removed.keys() {
            target.remove(key);
        }
    }
}

/// Compare two maps by value.
///
/// A key only in `new` is added, a key in both with unequal values is
/// modified, a key only in `old` is removed.
pub fn diff_maps(old: &JsonMap, new: &JsonMap) -> DictDiff {
    let mut diff = DictDiff::default();
    for (key, value) in new {
        match old.get(key) {
            None => {
                diff.added.insert(key.clone(), value.clone());
            }
            Some(previous) if previous != value => {
                diff.modified.insert(
                    key.clone(),
                    ModifiedValue {
                        old: previous.clone(),
                        new: value.clone(),
                    },
                );
            }
            Some(_) => {}
        }
    }
    for (key, value) in old {
        if !new.contains_key(key) {
            diff.removed.insert(key.clone(), value.clone());
        }
    }
    diff
}
