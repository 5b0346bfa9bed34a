//! Dense row storage: buffers, tables, and the table store.
//!
//! A [`Table`] owns the rows of exactly one family; the [`Tables`] store
//! materializes tables lazily (first entity of a family, or bootstrap) and
//! keeps them for the life of the world. Everything here refers to tables by
//! [`TableId`] so descriptors and back-references survive reallocation of the
//! backing arena.

mod rows;
mod table;

pub use rows::RowBuffer;
pub use table::{Table, TableId};

use std::collections::HashMap;

use crate::{component::ComponentInfo, entity::Entity, family::FamilyId};

/// The table store: one table per materialized family.
#[derive(Default)]
pub struct Tables {
    /// Tables by id. Ids are dense and stable.
    tables: Vec<Table>,

    /// The table bound to each materialized family.
    by_family: HashMap<FamilyId, TableId>,
}

impl Tables {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of tables.
    #[inline]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether no table has been materialized.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// The table bound to a family, if it was materialized.
    #[inline]
    pub fn find(&self, family: FamilyId) -> Option<TableId> {
        self.by_family.get(&family).copied()
    }

    /// Materialize the table for a family.
    ///
    /// `infos` is parallel to `members`. The caller (the world) is
    /// responsible for announcing the new table to registered systems.
    ///
    /// # Panics
    /// Panics if the family already has a table.
    pub(crate) fn create(
        &mut self,
        family: FamilyId,
        members: Vec<Entity>,
        infos: &[ComponentInfo],
    ) -> TableId {
        assert!(
            !self.by_family.contains_key(&family),
            "family {family:?} already has a table"
        );
        let id = TableId::new(self.tables.len() as u32);
        log::debug!(
            "created table {:?} for family {:?} ({} members)",
            id,
            family,
            members.len()
        );
        self.tables.push(Table::new(id, family, members, infos));
        self.by_family.insert(family, id);
        id
    }

    /// The table with the given id.
    ///
    /// # Panics
    /// An unknown id is a programmer error and panics.
    #[inline]
    pub fn get(&self, id: TableId) -> &Table {
        &self.tables[id.index()]
    }

    /// The table with the given id, mutably.
    #[inline]
    pub(crate) fn get_mut(&mut self, id: TableId) -> &mut Table {
        &mut self.tables[id.index()]
    }

    /// Iterate all tables in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(raw: u64) -> Entity {
        Entity::from_raw(raw)
    }

    #[test]
    fn create_and_find() {
        // Given
        let mut tables = Tables::new();
        let family = FamilyId::from_raw(1);

        // When
        let id = tables.create(family, vec![handle(10)], &[ComponentInfo::sized(4)]);

        // Then
        assert_eq!(tables.find(family), Some(id));
        assert_eq!(tables.find(FamilyId::from_raw(2)), None);
        assert_eq!(tables.get(id).family(), family);
        assert_eq!(tables.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already has a table")]
    fn double_create_panics() {
        let mut tables = Tables::new();
        let family = FamilyId::from_raw(1);
        tables.create(family, vec![handle(10)], &[ComponentInfo::sized(4)]);
        tables.create(family, vec![handle(10)], &[ComponentInfo::sized(4)]);
    }
}
