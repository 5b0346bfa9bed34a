//! The entity index: where does an entity's data live right now.

use std::collections::HashMap;

use crate::{entity::Entity, family::FamilyId};

/// A packed (family, row) pair.
///
/// The family id occupies the high 32 bits and the row index the low 32, so a
/// location is a single `u64` that 64-bit hosts load and store atomically.
/// Row 0 is a valid index; "not stored anywhere" is expressed by the entity
/// being absent from the [`EntityIndex`], never by a sentinel row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location(u64);

impl Location {
    /// Pack a family id and row index into one location.
    #[inline]
    pub fn new(family: FamilyId, row: u32) -> Self {
        Self(((family.raw() as u64) << 32) | row as u64)
    }

    /// The family this entity currently belongs to.
    #[inline]
    pub fn family(&self) -> FamilyId {
        FamilyId::from_raw((self.0 >> 32) as u32)
    }

    /// The row index inside the family's table.
    #[inline]
    pub fn row(&self) -> u32 {
        self.0 as u32
    }

    /// The packed 64-bit value.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Rebuild a location from its packed value.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Maps live entities to their packed storage location.
///
/// If an entity is present, `table(location.family()).row(location.row())`
/// holds its data and is the sole row doing so.
#[derive(Debug, Default)]
pub struct EntityIndex {
    map: HashMap<Entity, Location>,
}

impl EntityIndex {
    /// Create an empty index.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or overwrite an entity's location.
    #[inline]
    pub fn insert(&mut self, entity: Entity, location: Location) {
        debug_assert!(entity.is_some(), "the none handle cannot be indexed");
        self.map.insert(entity, location);
    }

    /// Look up where an entity lives, if it is alive.
    #[inline]
    pub fn get(&self, entity: Entity) -> Option<Location> {
        self.map.get(&entity).copied()
    }

    /// Forget an entity, returning its last location.
    #[inline]
    pub fn remove(&mut self, entity: Entity) -> Option<Location> {
        self.map.remove(&entity)
    }

    /// Whether the entity is alive in this world.
    #[inline]
    pub fn contains(&self, entity: Entity) -> bool {
        self.map.contains_key(&entity)
    }

    /// The number of live entities.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no entity is alive.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate all live entities and their locations, in no particular
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = (Entity, Location)> + '_ {
        self.map.iter().map(|(entity, location)| (*entity, *location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_packs_and_unpacks() {
        // Given
        let family = FamilyId::from_raw(0xABCD);

        // When
        let loc = Location::new(family, 42);

        // Then
        assert_eq!(loc.family(), family);
        assert_eq!(loc.row(), 42);
        assert_eq!(Location::from_raw(loc.raw()), loc);
    }

    #[test]
    fn location_row_zero_is_valid() {
        // Given
        let loc = Location::new(FamilyId::from_raw(1), 0);

        // Then
        assert_eq!(loc.row(), 0);
        assert_eq!(loc.family().raw(), 1);
    }

    #[test]
    fn index_insert_get_remove() {
        // Given
        let mut index = EntityIndex::new();
        let e1 = Entity::from_raw(10);
        let e2 = Entity::from_raw(11);

        // When
        index.insert(e1, Location::new(FamilyId::from_raw(1), 0));
        index.insert(e2, Location::new(FamilyId::from_raw(1), 1));

        // Then
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(e1).unwrap().row(), 0);
        assert!(index.contains(e2));
        assert!(!index.contains(Entity::from_raw(12)));

        // When - rewrite e2 after a swap-remove moved it
        index.insert(e2, Location::new(FamilyId::from_raw(1), 0));

        // Then
        assert_eq!(index.get(e2).unwrap().row(), 0);
        assert_eq!(index.len(), 2);

        // When
        let removed = index.remove(e1);

        // Then
        assert!(removed.is_some());
        assert!(!index.contains(e1));
    }
}
