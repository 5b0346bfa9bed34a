//! Parallel system execution: row-range partitioning across a worker pool.
//!
//! A parallel run splits a system's total active row count into contiguous
//! ranges, one per worker. Every worker walks the shared descriptor memory
//! read-only, starting at its range's descriptor and advancing to the next
//! when its remaining range exceeds the current table's rows. Structural
//! writes land in a per-job stage; the stages drain into the world's main
//! stage in job order, so visibility still waits for the next barrier.

mod pool;

pub use pool::WorkerPool;

use crossbeam::queue::SegQueue;

use crate::{
    entity::Entity,
    error::Error,
    stage::Stage,
    system::{self, runner},
    world::World,
};

/// One contiguous range of a system's matched rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    /// Index into the system's active descriptor array where the range
    /// starts.
    pub start_table: usize,
    /// First row inside the starting table.
    pub start_row: u32,
    /// Total rows in the range, possibly spanning several tables.
    pub row_count: u32,
}

/// Split `total` rows across up to `workers` contiguous jobs.
pub(crate) fn partition(row_counts: &[usize], workers: usize) -> Vec<Job> {
    let total: usize = row_counts.iter().sum();
    if total == 0 || workers == 0 {
        return Vec::new();
    }
    let worker_count = workers.min(total);
    let chunk = total.div_ceil(worker_count);

    let mut jobs = Vec::with_capacity(worker_count);
    let mut table = 0usize;
    let mut row = 0usize;
    let mut produced = 0usize;
    while produced < total {
        let take = chunk.min(total - produced);
        jobs.push(Job {
            start_table: table,
            start_row: row as u32,
            row_count: take as u32,
        });
        let mut remaining = take;
        while remaining > 0 {
            let available = row_counts[table] - row;
            if remaining >= available {
                remaining -= available;
                table += 1;
                row = 0;
            } else {
                row += remaining;
                remaining = 0;
            }
        }
        produced += take;
    }
    jobs
}

/// One descriptor's iteration state, resolved once on the main thread and
/// shared read-only with every worker.
struct ResolvedTable<'a> {
    rows: *mut u8,
    stride: usize,
    row_count: usize,
    entities: *const Entity,
    offsets: &'a [i32],
    sizes: &'a [u32],
    components: &'a [Entity],
    refs_entity: Vec<Entity>,
    refs_data: Vec<*const u8>,
}

// SAFETY: workers receive disjoint row ranges by construction of
// `partition`, so no two threads touch the same bytes through `rows`;
// everything else is read-only for the duration of the scope, and the scope
// joins all workers before the borrowed tables can change.
unsafe impl Send for ResolvedTable<'_> {}
unsafe impl Sync for ResolvedTable<'_> {}

/// Run a system's matched rows across the world's worker pool.
///
/// Falls back to the serial runner when no pool is configured. The filter
/// and param channels are main-thread-only features and are not available to
/// parallel runs.
pub(crate) fn run_parallel(world: &mut World, system: Entity, delta: f32) -> Result<Entity, Error> {
    if world.pool.is_none() {
        return runner::run(world, system, delta, None, None);
    }

    let sys_index = world
        .systems
        .index_of(system)
        .ok_or(Error::InvalidEntity(system))?;

    {
        let record = world.systems.at(sys_index);
        if !record.enabled {
            return Ok(Entity::NONE);
        }
        if !record.kind.is_row_kind() && !record.has_tables() {
            return Err(Error::NoMatch(system));
        }
    }

    let Some(delta_for_action) = periodic_gate(world, sys_index, delta) else {
        return Ok(Entity::NONE);
    };

    let started = world.measure_system_time.then(std::time::Instant::now);
    let interrupted;

    {
        let World {
            systems,
            tables,
            index,
            allocator,
            pool,
            stage: world_stage,
            ..
        } = world;
        let pool = pool.as_ref().expect("pool presence checked above");
        let allocator = &*allocator;
        let record = systems.at(sys_index);

        let mut resolved = Vec::with_capacity(record.active_tables.len());
        for descriptor in &record.active_tables {
            let (refs_entity, refs_data) = if descriptor.refs_index != 0 {
                runner::resolve_refs(index, tables, &record.refs[descriptor.refs_index - 1])
            } else {
                (Vec::new(), Vec::new())
            };
            let table = tables.get_mut(descriptor.table);
            let row_count = table.len();
            let stride = table.stride();
            let entities = table.entities().as_ptr();
            let rows = table.rows_mut().as_mut_ptr();
            resolved.push(ResolvedTable {
                rows,
                stride,
                row_count,
                entities,
                offsets: &descriptor.offsets,
                sizes: &descriptor.sizes,
                components: &record.components[descriptor.components_index],
                refs_entity,
                refs_data,
            });
        }

        let row_counts: Vec<usize> = resolved.iter().map(|r| r.row_count).collect();
        let jobs = partition(&row_counts, pool.size());
        let stages: Vec<Stage> = jobs.iter().map(|_| Stage::new()).collect();
        let results: SegQueue<(usize, Entity)> = SegQueue::new();

        pool.scope(|scope| {
            for (job_index, job) in jobs.iter().copied().enumerate() {
                let resolved = &resolved;
                let results = &results;
                let stage = &stages[job_index];
                let action = &record.action;
                let handle = record.handle;
                scope.spawn(move || {
                    let outcome =
                        run_job(job, resolved, action, handle, delta_for_action, stage, allocator);
                    results.push((job_index, outcome));
                });
            }
        });

        let mut outcomes: Vec<(usize, Entity)> = Vec::with_capacity(jobs.len());
        while let Some(entry) = results.pop() {
            outcomes.push(entry);
        }
        outcomes.sort_by_key(|(job_index, _)| *job_index);
        interrupted = outcomes
            .iter()
            .map(|(_, outcome)| *outcome)
            .find(Entity::is_some)
            .unwrap_or(Entity::NONE);

        // Per-job stages feed the world's stage in job order so replay stays
        // deterministic and visibility still waits for the next barrier.
        for stage in &stages {
            for (entity, op) in stage.drain() {
                world_stage.push(entity, op);
            }
        }
    }

    if let Some(start) = started {
        world.systems.at_mut(sys_index).time_spent += start.elapsed().as_secs_f32();
    }

    Ok(interrupted)
}

fn periodic_gate(world: &mut World, sys_index: usize, delta: f32) -> Option<f32> {
    let record = world.systems.at_mut(sys_index);
    if record.period <= 0.0 {
        return Some(delta);
    }
    let accumulated = record.time_passed + delta;
    if accumulated < record.period {
        record.time_passed = accumulated;
        return None;
    }
    record.time_passed = accumulated - record.period;
    if record.time_passed > record.period {
        record.time_passed = 0.0;
    }
    Some(accumulated)
}

fn run_job(
    job: Job,
    resolved: &[ResolvedTable<'_>],
    action: &system::Action,
    system: Entity,
    delta: f32,
    stage: &Stage,
    allocator: &crate::entity::Allocator,
) -> Entity {
    let mut table = job.start_table;
    let mut row = job.start_row as usize;
    let mut remaining = job.row_count as usize;

    while remaining > 0 {
        let current = &resolved[table];
        let available = current.row_count - row;
        let take = available.min(remaining);

        // SAFETY: the partitioner hands every job a disjoint row range, so
        // this sub-slice of rows and entities is touched by exactly one
        // worker; the scope keeps the backing tables alive and unmoved.
        let rows = unsafe { current.rows.add(row * current.stride) };
        let entities = unsafe { std::slice::from_raw_parts(current.entities.add(row), take) };

        let mut batch = runner::Batch::new(
            system,
            delta,
            None,
            entities,
            rows,
            take,
            current.stride,
            current.offsets,
            current.sizes,
            current.components,
            &current.refs_entity,
            &current.refs_data,
            stage,
            allocator,
        );
        action(&mut batch);
        if batch.interrupted_by.is_some() {
            return batch.interrupted_by;
        }

        remaining -= take;
        row = 0;
        table += 1;
    }
    Entity::NONE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_splits_evenly() {
        // Given - three tables of 4, 2, and 6 rows
        let jobs = partition(&[4, 2, 6], 3);

        // Then - 12 rows split into chunks of 4
        assert_eq!(
            jobs,
            vec![
                Job {
                    start_table: 0,
                    start_row: 0,
                    row_count: 4
                },
                Job {
                    start_table: 1,
                    start_row: 0,
                    row_count: 4
                },
                Job {
                    start_table: 2,
                    start_row: 2,
                    row_count: 4
                },
            ]
        );
    }

    #[test]
    fn partition_ranges_span_tables() {
        // Given - 5 rows over two tables, two workers
        let jobs = partition(&[3, 2], 2);

        // Then - the first range spans into the second table
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].row_count, 3);
        assert_eq!(jobs[1], Job {
            start_table: 1,
            start_row: 0,
            row_count: 2
        });
    }

    #[test]
    fn partition_caps_workers_at_rows() {
        // Given - more workers than rows
        let jobs = partition(&[2], 8);

        // Then - one job per row, no empty jobs
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.row_count == 1));
    }

    #[test]
    fn partition_of_nothing_is_empty() {
        assert!(partition(&[], 4).is_empty());
        assert!(partition(&[0, 0], 4).is_empty());
    }
}
