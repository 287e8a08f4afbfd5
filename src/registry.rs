//! Registry of live connection workers.
//!
//! Workers are inserted on accept and removed either by their own task on
//! exit or by the idle reaper. Both may race; removal is keyed by slot and
//! checked by identity so a slot reused by a newer worker is left alone.
//! Once `stop_all` has run the registry is closed and refuses new workers.

use crate::worker::Worker;
use slab::Slab;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Default)]
struct Workers {
    live: Slab<Arc<Worker>>,
    closed: bool,
}

/// Thread-safe set of running workers, backed by slab allocation.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Mutex<Workers>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. Returns its slot, or `None` once the registry
    /// has been closed by `stop_all`.
    pub fn insert(&self, worker: Arc<Worker>) -> Option<usize> {
        let mut workers = self.lock();
        if workers.closed {
            return None;
        }
        Some(workers.live.insert(worker))
    }

    /// Remove the worker in `slot` if it is still `worker`.
    pub fn remove(&self, slot: usize, worker: &Arc<Worker>) -> bool {
        let mut workers = self.lock();
        match workers.live.get(slot) {
            Some(current) if Arc::ptr_eq(current, worker) => {
                workers.live.remove(slot);
                true
            }
            _ => false,
        }
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }

    /// Check if `stop_all` has closed the registry.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Copy of the current workers, for iterating without holding the lock.
    pub fn snapshot(&self) -> Vec<(usize, Arc<Worker>)> {
        self.lock()
            .live
            .iter()
            .map(|(slot, worker)| (slot, Arc::clone(worker)))
            .collect()
    }

    /// Stop and evict every worker idle for longer than `max_idle` as of `now`.
    ///
    /// Returns the number of workers reaped.
    pub fn reap_idle(&self, now: Instant, max_idle: Duration) -> usize {
        let mut reaped = 0;
        for (slot, worker) in self.snapshot() {
            let idle = worker.idle_for(now);
            if idle > max_idle {
                worker.request_stop();
                if self.remove(slot, &worker) {
                    info!(
                        peer = %worker.peer(),
                        device = worker.device(),
                        idle_ms = idle.as_millis() as u64,
                        "Reaped idle connection"
                    );
                    reaped += 1;
                }
            }
        }
        reaped
    }

    /// Close the registry and ask every live worker to stop.
    ///
    /// Closing and stopping happen under one lock, so no worker can slip in
    /// between. Returns how many were asked.
    pub fn stop_all(&self) -> usize {
        let mut workers = self.lock();
        workers.closed = true;
        for (_, worker) in workers.live.iter() {
            worker.request_stop();
        }
        workers.live.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(port: u16) -> Arc<Worker> {
        Arc::new(Worker::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            9000,
        ))
    }

    #[test]
    fn test_insert_remove() {
        let registry = WorkerRegistry::new();
        let w1 = worker(1);
        let w2 = worker(2);

        let s1 = registry.insert(Arc::clone(&w1)).unwrap();
        let s2 = registry.insert(Arc::clone(&w2)).unwrap();
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(s1, &w1));
        assert!(!registry.remove(s1, &w1));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(s2, &w2));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reused_slot_not_removed() {
        let registry = WorkerRegistry::new();
        let old = worker(1);
        let slot = registry.insert(Arc::clone(&old)).unwrap();
        registry.remove(slot, &old);

        let new = worker(2);
        let reused = registry.insert(Arc::clone(&new)).unwrap();
        assert_eq!(reused, slot);

        assert!(!registry.remove(slot, &old));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reap_only_idle_workers() {
        let registry = WorkerRegistry::new();
        let w = worker(1);
        registry.insert(Arc::clone(&w));

        let max_idle = Duration::from_secs(5);

        // Below the threshold: untouched
        assert_eq!(registry.reap_idle(Instant::now(), max_idle), 0);
        assert!(!w.stop_requested());
        assert_eq!(registry.len(), 1);

        // Past the threshold: stopped and evicted
        let later = Instant::now() + Duration::from_secs(6);
        assert_eq!(registry.reap_idle(later, max_idle), 1);
        assert!(w.stop_requested());
        assert_eq!(w.device(), 9000);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stop_all() {
        let registry = WorkerRegistry::new();
        let workers: Vec<_> = (0..3).map(worker).collect();
        for w in &workers {
            registry.insert(Arc::clone(w));
        }

        assert_eq!(registry.stop_all(), 3);
        assert!(workers.iter().all(|w| w.stop_requested()));
    }

    #[test]
    fn test_closed_registry_refuses_workers() {
        let registry = WorkerRegistry::new();
        assert!(!registry.is_closed());
        assert_eq!(registry.stop_all(), 0);
        assert!(registry.is_closed());

        let late = worker(1);
        assert!(registry.insert(Arc::clone(&late)).is_none());
        assert!(registry.is_empty());
        assert!(!late.stop_requested());
    }

    #[test]
    fn test_no_worker_escapes_stop_all() {
        let registry = Arc::new(WorkerRegistry::new());
        let inserter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let mut admitted = Vec::new();
                for port in 0..1000 {
                    let w = worker(port);
                    if registry.insert(Arc::clone(&w)).is_some() {
                        admitted.push(w);
                    }
                }
                admitted
            })
        };

        std::thread::yield_now();
        registry.stop_all();
        let admitted = inserter.join().unwrap();

        assert!(admitted.iter().all(|w| w.stop_requested()));
        assert_eq!(admitted.len(), registry.len());
    }

    #[test]
    fn test_concurrent_insert_and_reap() {
        let registry = Arc::new(WorkerRegistry::new());
        let inserter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for port in 0..500 {
                    registry.insert(worker(port));
                }
            })
        };

        let far_future = Instant::now() + Duration::from_secs(3600);
        let mut reaped = 0;
        while !inserter.is_finished() {
            reaped += registry.reap_idle(far_future, Duration::from_secs(1));
        }
        inserter.join().unwrap();
        reaped += registry.reap_idle(far_future, Duration::from_secs(1));

        assert_eq!(reaped, 500);
        assert!(registry.is_empty());
    }
}
