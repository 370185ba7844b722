//! Tag Index: pool name <-> prefix id.
//!
//! Both directions are kept so `find` can resolve a pool in one lookup and
//! a deleted prefix can drop its tags without scanning every pool.

use crate::types::{PrefixId, PrefixTag};
use dashmap::DashMap;
use std::collections::BTreeSet;

#[derive(Default)]
pub struct TagIndex {
    by_tag: DashMap<String, BTreeSet<PrefixId>>,
    by_prefix: DashMap<PrefixId, BTreeSet<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the pair already existed.
    pub fn add(&self, prefix: PrefixId, tag: &str) -> bool {
        let fresh = self
            .by_tag
            .entry(tag.to_string())
            .or_default()
            .insert(prefix);
        self.by_prefix
            .entry(prefix)
            .or_default()
            .insert(tag.to_string());
        fresh
    }

    pub fn remove(&self, prefix: PrefixId, tag: &str) -> bool {
        let removed = self
            .by_tag
            .get_mut(tag)
            .map(|mut ids| ids.remove(&prefix))
            .unwrap_or(false);
        self.by_tag.remove_if(tag, |_, ids| ids.is_empty());
        if let Some(mut tags) = self.by_prefix.get_mut(&prefix) {
            tags.remove(tag);
        }
        self.by_prefix.remove_if(&prefix, |_, tags| tags.is_empty());
        removed
    }

    /// Prefix ids in the pool, in id order.
    pub fn id_tags(&self, tag: &str) -> Vec<PrefixId> {
        self.by_tag
            .get(tag)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn tags_of(&self, prefix: PrefixId) -> Vec<String> {
        self.by_prefix
            .get(&prefix)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget every tag of a prefix whose row is gone.
    pub fn drop_prefix(&self, prefix: PrefixId) {
        let Some((_, tags)) = self.by_prefix.remove(&prefix) else {
            return;
        };
        for tag in tags {
            if let Some(mut ids) = self.by_tag.get_mut(&tag) {
                ids.remove(&prefix);
            }
            self.by_tag.remove_if(&tag, |_, ids| ids.is_empty());
        }
    }

    pub fn entries(&self) -> Vec<PrefixTag> {
        let mut out: Vec<PrefixTag> = self
            .by_prefix
            .iter()
            .flat_map(|e| {
                let prefix = *e.key();
                e.value()
                    .iter()
                    .map(|tag| PrefixTag {
                        prefix,
                        tag: tag.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort();
        out
    }

    pub fn from_entries(entries: impl IntoIterator<Item = PrefixTag>) -> Self {
        let index = Self::new();
        for e in entries {
            index.add(e.prefix, &e.tag);
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_per_pair() {
        let idx = TagIndex::new();
        let a = PrefixId::new();
        assert!(idx.add(a, "pool"));
        assert!(!idx.add(a, "pool"));
        assert_eq!(idx.id_tags("pool"), vec![a]);
        assert_eq!(idx.entries().len(), 1);
    }

    #[test]
    fn many_to_many() {
        let idx = TagIndex::new();
        let (a, b) = (PrefixId::new(), PrefixId::new());
        idx.add(a, "x");
        idx.add(b, "x");
        idx.add(a, "y");
        assert_eq!(idx.id_tags("x").len(), 2);
        assert_eq!(idx.tags_of(a), vec!["x".to_string(), "y".to_string()]);
        assert!(idx.remove(a, "x"));
        assert!(!idx.remove(a, "x"));
        assert_eq!(idx.id_tags("x"), vec![b]);
        assert!(idx.id_tags("missing").is_empty());
    }

    #[test]
    fn dropping_a_prefix_clears_its_pools() {
        let idx = TagIndex::new();
        let a = PrefixId::new();
        idx.add(a, "x");
        idx.add(a, "y");
        idx.drop_prefix(a);
        assert!(idx.id_tags("x").is_empty());
        assert!(idx.tags_of(a).is_empty());
        assert!(idx.entries().is_empty());
        let restored = TagIndex::from_entries(vec![PrefixTag { prefix: a, tag: "z".into() }]);
        assert_eq!(restored.id_tags("z"), vec![a]);
    }
}
