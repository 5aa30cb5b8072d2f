use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Bidirectional path <-> id map. Only live ids are present; an id missing
/// from the map is a tombstone. Ids are never reused.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    path_to_id: BTreeMap<String, u64>,
    id_to_path: BTreeMap<u64, String>,
    next_id: u64,
}

impl IdMap {
    /// Give `path` a fresh id, returning it and the id it replaces, if any.
    pub fn assign(&mut self, path: &str) -> (u64, Option<u64>) {
        let id = self.next_id;
        self.next_id += 1;
        let old = self.path_to_id.insert(path.to_string(), id);
        if let Some(old) = old {
            self.id_to_path.remove(&old);
        }
        self.id_to_path.insert(id, path.to_string());
        (id, old)
    }

    pub fn remove(&mut self, path: &str) -> Option<u64> {
        let id = self.path_to_id.remove(path)?;
        self.id_to_path.remove(&id);
        Some(id)
    }

    pub fn id_of(&self, path: &str) -> Option<u64> {
        self.path_to_id.get(path).copied()
    }

    pub fn path_of(&self, id: u64) -> Option<&str> {
        self.id_to_path.get(&id).map(String::as_str)
    }

    pub fn is_live(&self, id: u64) -> bool {
        self.id_to_path.contains_key(&id)
    }

    pub fn live_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.id_to_path.keys().copied()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.path_to_id.keys().map(String::as_str)
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.path_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path_to_id.is_empty()
    }

    /// Both directions agree and no id reaches `next_id`.
    pub fn is_consistent(&self) -> bool {
        self.path_to_id.len() == self.id_to_path.len()
            && self
                .path_to_id
                .iter()
                .all(|(p, id)| {
                    *id < self.next_id && self.id_to_path.get(id).is_some_and(|q| q == p)
                })
    }
}
