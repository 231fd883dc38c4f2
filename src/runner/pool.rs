//! The set of live workers owned by one runner.
//!
//! Workers leave the pool when they drain, crash, or are replaced after a
//! framework switch. The pool only shrinks on its own; a replacement is an
//! explicit [`add`](WorkerPool::add) into the slot the old worker held.

use crate::channel::Channel;
use crate::process::{ProcessHandle, Spawned};

/// One worker process and the channel to it.
#[derive(Debug)]
pub struct Worker {
    /// Unique within the runner; never reused.
    pub id: usize,

    /// Pool slot, reused by replacements. Slot `n` runs with `TEST_ENV_NUMBER=n+1`.
    pub slot: usize,

    /// Framework the worker has loaded.
    pub framework: String,

    pub channel: Channel,
    pub handle: ProcessHandle,

    /// File the worker is currently running.
    pub current: Option<String>,
}

impl Worker {
    pub fn label(&self) -> &str {
        self.handle.label()
    }
}

/// Live workers of a runner.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: Vec<Worker>,
    next_id: usize,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly spawned worker and returns its id.
    pub fn add(&mut self, slot: usize, framework: impl Into<String>, spawned: Spawned) -> usize {
        let id = self.next_id;
        self.next_id += 1;

        self.workers.push(Worker {
            id,
            slot,
            framework: framework.into(),
            channel: spawned.channel,
            handle: spawned.handle,
            current: None,
        });
        id
    }

    /// Takes a worker out of the pool.
    pub fn remove(&mut self, id: usize) -> Option<Worker> {
        let index = self.workers.iter().position(|w| w.id == id)?;
        Some(self.workers.remove(index))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Worker> {
        self.workers.iter_mut().find(|w| w.id == id)
    }

    /// Ids of every live worker, in the same order as [`channels_mut`](Self::channels_mut).
    pub fn ids(&self) -> Vec<usize> {
        self.workers.iter().map(|w| w.id).collect()
    }

    /// Ids of workers not currently running a file.
    pub fn idle_ids(&self) -> Vec<usize> {
        self.workers
            .iter()
            .filter(|w| w.current.is_none())
            .map(|w| w.id)
            .collect()
    }

    /// Channels of every live worker, for [`wait_any`](crate::channel::wait_any).
    pub fn channels_mut(&mut self) -> Vec<&mut Channel> {
        self.workers.iter_mut().map(|w| &mut w.channel).collect()
    }

    /// Empties the pool.
    pub fn take_all(&mut self) -> Vec<Worker> {
        std::mem::take(&mut self.workers)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::spawn_task;

    fn idle() -> Spawned {
        spawn_task("idle", |_channel| async {})
    }

    #[tokio::test]
    async fn test_ids_are_never_reused() {
        let mut pool = WorkerPool::new();
        let first = pool.add(0, "rspec", idle());
        let second = pool.add(1, "rspec", idle());

        let removed = pool.remove(first).unwrap();
        assert_eq!(removed.slot, 0);

        let replacement = pool.add(removed.slot, "cucumber", idle());
        assert_ne!(replacement, first);
        assert_eq!(pool.ids(), vec![second, replacement]);
        assert_eq!(pool.get_mut(replacement).unwrap().slot, 0);
        assert!(pool.remove(first).is_none());
    }

    #[tokio::test]
    async fn test_take_all_empties_pool() {
        let mut pool = WorkerPool::new();
        pool.add(0, "rspec", idle());
        pool.add(1, "rspec", idle());

        assert_eq!(pool.channels_mut().len(), 2);
        assert_eq!(pool.take_all().len(), 2);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_idle_ids_skip_busy_workers() {
        let mut pool = WorkerPool::new();
        let busy = pool.add(0, "rspec", idle());
        let free = pool.add(1, "rspec", idle());
        pool.get_mut(busy).unwrap().current = Some("a_spec.rb".to_string());

        assert_eq!(pool.idle_ids(), vec![free]);
        assert_eq!(pool.get_mut(busy).unwrap().framework, "rspec");
    }
}
