use std::collections::BTreeSet;

use crate::resolver::{self, PropertySource, PLACEHOLDER_PREFIX};
use crate::snapshot::Snapshot;

/// Logical keys (literal and/or wildcard patterns) whose effective value
/// changed between two snapshots. Empty means "no observable change" and
/// short-circuits all downstream delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    keys: BTreeSet<String>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>) {
        self.keys.insert(key.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.keys.iter()
    }
}

impl FromIterator<String> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

/// Computes the set of keys whose effective value differs between the two
/// snapshots: textual changes, indirect changes through placeholder
/// references, deletions, and any registered wildcard pattern matching a
/// changed literal key. Either snapshot being empty reports no changes,
/// which guards the very first bootstrap merge.
pub fn compute_changes(
    old: &Snapshot,
    new: &Snapshot,
    patterns: &BTreeSet<String>,
    fallback: &dyn PropertySource,
) -> ChangeSet {
    let mut changes = ChangeSet::new();
    if old.is_empty() || new.is_empty() {
        return changes;
    }

    for (key, value) in new.iter() {
        match old.get(key) {
            Some(old_value) if old_value == value => {
                // Same raw text; a referenced key may still have moved.
                if value.contains(PLACEHOLDER_PREFIX) {
                    let resolved_new = resolver::resolve_lenient(value, new, fallback);
                    let resolved_old = resolver::resolve_lenient(old_value, old, fallback);
                    if resolved_new != resolved_old {
                        changes.insert(key.clone());
                    }
                }
            }
            _ => changes.insert(key.clone()),
        }
    }

    for key in old.keys() {
        if !new.contains_key(key) {
            changes.insert(key.clone());
        }
    }

    if !changes.is_empty() {
        let literals: Vec<String> = changes.iter().cloned().collect();
        for pattern in patterns {
            let Ok(matcher) = resolver::compile_pattern(pattern) else {
                continue;
            };
            if literals.iter().any(|key| matcher.is_match(key)) {
                changes.insert(pattern.clone());
            }
        }
    }

    changes
}
