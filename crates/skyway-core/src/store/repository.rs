//! Generic keyed repository.

use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::domain::Entity;

/// Ordered map of entities keyed by [`Entity::id`].
#[derive(Debug, Clone)]
pub struct Repository<T> {
    items: BTreeMap<String, T>,
}

impl<T> Default for Repository<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<T: Entity> Repository<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Insert or replace; returns the previous value.
    pub fn upsert(&mut self, item: T) -> Option<T> {
        self.items.insert(item.id(), item)
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.items.remove(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.items.get_mut(id)
    }

    /// Items in ascending id order.
    pub fn items(&self) -> btree_map::Values<'_, String, T> {
        self.items.values()
    }

    pub fn ids(&self) -> btree_map::Keys<'_, String, T> {
        self.items.keys()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::System;

    fn system(id: &str, name: &str) -> System {
        System {
            id: id.into(),
            workspace_id: "ws".into(),
            name: name.into(),
            description: None,
        }
    }

    #[test]
    fn upsert_get_delete_count() {
        let mut repo = Repository::new();
        assert!(repo.upsert(system("b", "one")).is_none());
        assert!(repo.upsert(system("a", "two")).is_none());
        let previous = repo.upsert(system("b", "three")).unwrap();
        assert_eq!(previous.name, "one");
        assert_eq!(repo.count(), 2);
        assert_eq!(repo.ids().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(repo.get("b").unwrap().name, "three");
        assert!(repo.remove("a").is_some());
        assert!(repo.remove("a").is_none());
        assert_eq!(repo.count(), 1);
    }
}
