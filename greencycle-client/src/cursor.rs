//! Per-entity-type catch-up cursors.

use std::collections::BTreeMap;

use greencycle_core::EntityType;

/// High-water marks for the next catch-up pull.
///
/// A cursor moves only after a pull response has been fully merged, and
/// never moves backwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorBook {
    cursors: BTreeMap<EntityType, i64>,
}

impl CursorBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(cursors: BTreeMap<EntityType, i64>) -> Self {
        Self { cursors }
    }

    /// Lower bound for the next pull; zero when never synced.
    pub fn get(&self, entity_type: EntityType) -> i64 {
        self.cursors.get(&entity_type).copied().unwrap_or(0)
    }

    /// Move the cursor forward. Returns `false` if `timestamp` is not newer.
    pub fn advance(&mut self, entity_type: EntityType, timestamp: i64) -> bool {
        let current = self.cursors.entry(entity_type).or_insert(0);
        if timestamp > *current {
            *current = timestamp;
            true
        } else {
            false
        }
    }

    /// Oldest cursor across `entity_types`, if all have synced at least once.
    pub fn oldest(&self, entity_types: &[EntityType]) -> Option<i64> {
        entity_types
            .iter()
            .map(|t| self.cursors.get(t).copied())
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_defaults_to_zero() {
        let book = CursorBook::new();
        assert_eq!(book.get(EntityType::Users), 0);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut book = CursorBook::new();
        assert!(book.advance(EntityType::Collections, 100));
        assert!(!book.advance(EntityType::Collections, 90));
        assert!(!book.advance(EntityType::Collections, 100));
        assert_eq!(book.get(EntityType::Collections), 100);
    }

    #[test]
    fn test_oldest_requires_all_synced() {
        let mut book = CursorBook::new();
        let types = [EntityType::Users, EntityType::Collections];
        book.advance(EntityType::Users, 50);
        assert_eq!(book.oldest(&types), None);
        book.advance(EntityType::Collections, 20);
        assert_eq!(book.oldest(&types), Some(20));
    }
}
