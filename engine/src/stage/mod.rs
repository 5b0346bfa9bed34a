//! Deferred structural mutation.
//!
//! Systems must not reshape the world mid-iteration: creating tables or
//! moving entities would invalidate the rows the runner is walking. Instead,
//! every structural write issued from inside a system lands in a [`Stage`]
//! and is replayed against the world at the next phase barrier (or an
//! explicit merge).
//!
//! Replay order is deterministic: stages drain in thread order, ops group
//! per entity and replay entities-ascending, preserving arrival order within
//! an entity. Calls made outside a running system bypass staging entirely
//! and mutate the world directly.

use crossbeam::queue::SegQueue;

use crate::entity::Entity;

/// One deferred structural operation.
///
/// Component and family references are raw handles; they are resolved when
/// the op replays, so a staged op can name a family declared in the same
/// phase.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedOp {
    /// Insert a pre-allocated entity with the family behind `family`.
    New {
        /// A declared family handle, or a component handle.
        family: Entity,
    },

    /// Remove the entity and all its components.
    Delete,

    /// Extend the entity's family with the components behind `component`.
    Add {
        /// A component handle, or a declared family handle (adds all of it).
        component: Entity,
    },

    /// Shrink the entity's family by the components behind `component`.
    Remove {
        /// A component handle, or a declared family handle.
        component: Entity,
    },

    /// Write a component value, adding the component first if absent.
    Set {
        /// The component to write.
        component: Entity,
        /// The element bytes; must match the component's registered size.
        data: Vec<u8>,
    },
}

/// A per-thread buffer of deferred ops.
///
/// Pushing is lock-free so a system action can stage from whatever worker it
/// runs on; draining happens on the main thread at a barrier.
#[derive(Default)]
pub struct Stage {
    ops: SegQueue<(Entity, StagedOp)>,
}

impl Stage {
    /// Create an empty stage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an op against an entity. Lock-free.
    pub fn push(&self, entity: Entity, op: StagedOp) {
        self.ops.push((entity, op));
    }

    /// Whether the stage holds no pending ops.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drain all pending ops in arrival order.
    pub fn drain(&self) -> Vec<(Entity, StagedOp)> {
        let mut out = Vec::new();
        while let Some(op) = self.ops.pop() {
            out.push(op);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_drain_in_arrival_order() {
        // Given
        let stage = Stage::new();
        let e1 = Entity::from_raw(10);
        let e2 = Entity::from_raw(11);
        let c = Entity::from_raw(3);

        // When
        stage.push(e1, StagedOp::Add { component: c });
        stage.push(e2, StagedOp::Delete);
        stage.push(e1, StagedOp::Remove { component: c });

        // Then
        let drained = stage.drain();
        assert_eq!(
            drained,
            vec![
                (e1, StagedOp::Add { component: c }),
                (e2, StagedOp::Delete),
                (e1, StagedOp::Remove { component: c }),
            ]
        );
        assert!(stage.is_empty());
    }

    #[test]
    fn drained_stage_is_reusable() {
        // Given
        let stage = Stage::new();
        stage.push(Entity::from_raw(10), StagedOp::Delete);
        let _ = stage.drain();

        // When
        stage.push(
            Entity::from_raw(11),
            StagedOp::Set {
                component: Entity::from_raw(3),
                data: vec![1, 2, 3, 4],
            },
        );

        // Then
        assert_eq!(stage.drain().len(), 1);
    }
}
