//! Families: interned, canonical sets of component handles.
//!
//! A family (archetype) is a sorted, duplicate-free sequence of entity
//! handles. Two entities share a family exactly when their handle sets are
//! equal, which is what the registry's interning guarantees: any permutation
//! of the same set resolves to the same [`FamilyId`].
//!
//! Family members are usually components, but any handle is admissible; in
//! particular an entity "links" a prefab by carrying the prefab's handle in
//! its family. The registry records that link so membership tests can opt in
//! to searching the prefab's own family transitively.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::{
    component::PREFAB,
    entity::{Entity, EntityIndex},
};

/// An interned family identifier.
///
/// Small, dense, and stable for the life of the world. Id 0 is the empty
/// family.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FamilyId(u32);

impl FamilyId {
    /// The interned empty family.
    pub const EMPTY: Self = FamilyId(0);

    /// Rebuild an id from its raw value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        FamilyId(raw)
    }

    /// The raw id value.
    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// The id as an index into the registry's arena.
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Whether this is the empty family.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// One interned family: its canonical member sequence.
#[derive(Debug)]
struct Family {
    /// Sorted, duplicate-free member handles.
    members: Vec<Entity>,
}

/// The family registry.
///
/// Interns canonical member sequences to dense [`FamilyId`]s and keeps the
/// per-family prefab link. Families live for the life of the world; interning
/// the same set twice returns the existing id.
pub struct Families {
    /// Families by id. Index 0 is the empty family.
    families: Vec<Family>,

    /// Interning map from canonical members to id.
    by_members: HashMap<Vec<Entity>, FamilyId>,

    /// Families that contain a prefab handle, mapped to that prefab.
    prefab_links: HashMap<FamilyId, Entity>,
}

impl Default for Families {
    fn default() -> Self {
        Self::new()
    }
}

impl Families {
    /// Create a registry holding only the empty family.
    pub fn new() -> Self {
        let mut by_members = HashMap::new();
        by_members.insert(Vec::new(), FamilyId::EMPTY);
        Self {
            families: vec![Family {
                members: Vec::new(),
            }],
            by_members,
            prefab_links: HashMap::new(),
        }
    }

    /// The number of interned families, including the empty one.
    #[inline]
    pub fn len(&self) -> usize {
        self.families.len()
    }

    /// Whether only the empty family exists.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.families.len() == 1
    }

    /// The canonical member sequence of a family.
    ///
    /// # Panics
    /// An unknown id is a programmer error and panics.
    #[inline]
    pub fn members(&self, id: FamilyId) -> &[Entity] {
        &self.families[id.index()].members
    }

    /// The prefab linked into a family, if any member is a prefab.
    #[inline]
    pub fn prefab_of(&self, id: FamilyId) -> Option<Entity> {
        self.prefab_links.get(&id).copied()
    }

    /// Intern `sort(set ∪ {add})`, deduplicated. Returns the existing id when
    /// the canonical sequence was seen before.
    ///
    /// The entity index is consulted to detect prefab members (a member whose
    /// own family carries the `Prefab` marker) and record the link.
    pub fn register(&mut self, add: Entity, set: &[Entity], index: &EntityIndex) -> FamilyId {
        let mut members = Vec::with_capacity(set.len() + 1);
        members.extend_from_slice(set);
        if add.is_some() {
            members.push(add);
        }
        self.intern(members, index)
    }

    /// The family of `family ∪ {handle}`.
    pub fn add(&mut self, family: FamilyId, handle: Entity, index: &EntityIndex) -> FamilyId {
        if handle.is_none() {
            return family;
        }
        if self.has_direct(family, handle) {
            return family;
        }
        let mut members = self.members(family).to_vec();
        members.push(handle);
        self.intern(members, index)
    }

    /// Set arithmetic `(cur ∪ to_add) \ to_remove`.
    pub fn merge(
        &mut self,
        cur: FamilyId,
        to_add: FamilyId,
        to_remove: FamilyId,
        index: &EntityIndex,
    ) -> FamilyId {
        if to_add.is_empty() && to_remove.is_empty() {
            return cur;
        }
        let removed = self.members(to_remove);
        let mut members: Vec<Entity> = self
            .members(cur)
            .iter()
            .copied()
            .filter(|m| removed.binary_search(m).is_err())
            .collect();
        let again: Vec<Entity> = self
            .members(to_add)
            .iter()
            .copied()
            .filter(|m| removed.binary_search(m).is_err())
            .collect();
        members.extend(again);
        self.intern(members, index)
    }

    /// Membership test between two families.
    ///
    /// With `match_all`, returns an element of `b` (the first) when every
    /// member of `b` is reachable from `a`, otherwise none. Without it,
    /// returns the first member of `b` reachable from `a`, otherwise none.
    /// `match_prefab` extends reachability through `a`'s linked prefab
    /// family, transitively.
    pub fn contains(
        &self,
        a: FamilyId,
        b: FamilyId,
        match_all: bool,
        match_prefab: bool,
        index: &EntityIndex,
    ) -> Entity {
        let wanted = self.members(b);
        if match_all {
            for member in wanted {
                if !self.has_member(a, *member, match_prefab, index) {
                    return Entity::NONE;
                }
            }
            wanted.first().copied().unwrap_or(Entity::NONE)
        } else {
            for member in wanted {
                if self.has_member(a, *member, match_prefab, index) {
                    return *member;
                }
            }
            Entity::NONE
        }
    }

    /// Whether a family reaches a single handle.
    pub fn contains_component(
        &self,
        family: FamilyId,
        component: Entity,
        match_prefab: bool,
        index: &EntityIndex,
    ) -> bool {
        self.has_member(family, component, match_prefab, index)
    }

    /// Render a family through a name lookup, for diagnostics.
    pub fn describe(&self, id: FamilyId, mut name_of: impl FnMut(Entity) -> String) -> String {
        let mut out = String::new();
        for (i, member) in self.members(id).iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{}", name_of(*member));
        }
        out
    }

    fn has_direct(&self, family: FamilyId, handle: Entity) -> bool {
        self.members(family).binary_search(&handle).is_ok()
    }

    fn has_member(
        &self,
        family: FamilyId,
        handle: Entity,
        match_prefab: bool,
        index: &EntityIndex,
    ) -> bool {
        if self.has_direct(family, handle) {
            return true;
        }
        if !match_prefab {
            return false;
        }
        let Some(prefab) = self.prefab_of(family) else {
            return false;
        };
        let Some(location) = index.get(prefab) else {
            return false;
        };
        self.has_member(location.family(), handle, true, index)
    }

    fn intern(&mut self, mut members: Vec<Entity>, index: &EntityIndex) -> FamilyId {
        members.sort();
        members.dedup();
        if let Some(id) = self.by_members.get(&members) {
            return *id;
        }

        assert!(
            self.families.len() < u32::MAX as usize,
            "family id space exhausted"
        );
        let id = FamilyId(self.families.len() as u32);

        // A member is a prefab if its own family carries the Prefab marker.
        for member in &members {
            if let Some(location) = index.get(*member) {
                if self.has_direct(location.family(), PREFAB) {
                    self.prefab_links.insert(id, *member);
                    break;
                }
            }
        }

        log::debug!("interned family {:?} with {} members", id, members.len());
        self.by_members.insert(members.clone(), id);
        self.families.push(Family { members });
        id
    }
}
