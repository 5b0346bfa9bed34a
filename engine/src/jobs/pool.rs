//! A fixed-size worker pool for job dispatch.

use crossbeam::channel::{Receiver, Sender, unbounded};
use std::cell::Cell;
use std::marker::PhantomData;
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Task(Task),
    Shutdown,
}

/// A fixed-size pool of worker threads consuming jobs in FIFO order.
///
/// The pool is created once per world and reused for every parallel system
/// run; workers shut down when the pool drops.
pub struct WorkerPool {
    sender: Sender<Message>,
    workers: Vec<Worker>,
}

struct Worker {
    handle: Option<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a pool with the given number of worker threads.
    ///
    /// # Panics
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "worker pool size must be greater than 0");

        let (sender, receiver) = unbounded();
        let workers = (0..size).map(|_| Worker::new(receiver.clone())).collect();
        Self { sender, workers }
    }

    /// The number of worker threads.
    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run a closure that may spawn borrowed tasks; every spawned task is
    /// guaranteed to finish before this returns.
    pub fn scope<'env, R>(&'env self, f: impl FnOnce(&Scope<'env>) -> R) -> R {
        let (done_tx, done_rx) = unbounded();
        let scope = Scope {
            pool: self,
            pending: Cell::new(0),
            done_tx,
            done_rx,
            _env: PhantomData,
        };
        f(&scope)
        // Scope's Drop waits for all pending tasks.
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(Message::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Worker {
    fn new(receiver: Receiver<Message>) -> Self {
        let handle = thread::spawn(move || {
            loop {
                match receiver.recv() {
                    Ok(Message::Task(task)) => task(),
                    Ok(Message::Shutdown) | Err(_) => break,
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }
}

/// A scope for dispatching tasks that borrow the environment.
///
/// Dropping the scope blocks until every spawned task has completed, which
/// is what makes the borrowed data sound.
pub struct Scope<'env> {
    pool: &'env WorkerPool,
    pending: Cell<usize>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
    _env: PhantomData<std::cell::Cell<&'env ()>>,
}

impl<'env> Scope<'env> {
    /// Dispatch a task to the pool.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'env) {
        let done = self.done_tx.clone();
        let task: Box<dyn FnOnce() + Send + 'env> = Box::new(move || {
            f();
            let _ = done.send(());
        });
        // SAFETY: the task borrows 'env data, but Scope::drop blocks until
        // every spawned task has acknowledged completion, so nothing
        // borrowed outlives its referent. The pool itself outlives the
        // scope by the 'env bound.
        let task: Task = unsafe { std::mem::transmute(task) };
        self.pending.set(self.pending.get() + 1);
        self.pool
            .sender
            .send(Message::Task(task))
            .expect("worker pool is shut down");
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        for _ in 0..self.pending.get() {
            let _ = self.done_rx.recv();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn scope_waits_for_all_tasks() {
        // Given
        let pool = WorkerPool::new(4);
        let counter = AtomicUsize::new(0);

        // When
        pool.scope(|scope| {
            for _ in 0..32 {
                scope.spawn(|| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        // Then - every task ran before scope returned
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn tasks_can_borrow_the_environment() {
        // Given
        let pool = WorkerPool::new(2);
        let data: Vec<AtomicUsize> = (0..8).map(|_| AtomicUsize::new(0)).collect();

        // When
        pool.scope(|scope| {
            for slot in &data {
                scope.spawn(move || {
                    slot.store(7, Ordering::SeqCst);
                });
            }
        });

        // Then
        assert!(data.iter().all(|s| s.load(Ordering::SeqCst) == 7));
    }

    #[test]
    #[should_panic(expected = "greater than 0")]
    fn zero_sized_pool_panics() {
        let _ = WorkerPool::new(0);
    }
}
