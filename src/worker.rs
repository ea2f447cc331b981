//! Proof workers
//!
//! `process_one` is a single worker step: take one task, prove it, report
//! the result to the queue. `WorkerPool` runs that step on OS threads for
//! every open collection, plus an optional thread driving the rollup
//! processors.

use crate::collection::Collection;
use crate::config::Config;
use crate::database::Database;
use crate::model::{FailureReason, Task, TaskStatus};
use crate::prover::{Prover, Witness};
use crate::rollup::RollupOutcome;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Take the next eligible task, prove it and record the result
///
/// Returns the task as it stands afterwards, or `None` when nothing was
/// eligible within `timeout`.
pub fn process_one(
    collection: &Collection,
    prover: &dyn Prover,
    timeout: Option<Duration>,
) -> Result<Option<Task>> {
    let queue = collection.queue();
    let Some(task) = queue.dequeue_next(timeout) else {
        return Ok(None);
    };

    match prover.prove(&Witness::Action(task.witness.clone())) {
        Ok(proof) => {
            queue.mark_proved(task.id, proof)?;
            debug!(collection = %collection.name(), task = %task.id, sequence = task.sequence(), "task proved");
        }
        Err(e) => {
            let status = queue.mark_failed(task.id, FailureReason::from(&e))?;
            if status == TaskStatus::Queued {
                debug!(collection = %collection.name(), task = %task.id, error = %e, "proof attempt failed, will retry");
            }
        }
    }
    Ok(queue.get(task.id))
}

/// Worker pool settings
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Proving threads
    pub workers: usize,
    /// Sleep when a full pass over the collections found nothing to do
    pub idle_wait: Duration,
    /// Step every rollup processor at this interval; `None` disables it
    pub rollup_interval: Option<Duration>,
}

impl PoolOptions {
    pub fn new(workers: usize) -> Self {
        PoolOptions {
            workers,
            idle_wait: Duration::from_millis(20),
            rollup_interval: None,
        }
    }

    pub fn with_rollups(mut self, interval: Duration) -> Self {
        self.rollup_interval = Some(interval);
        self
    }
}

impl From<&Config> for PoolOptions {
    fn from(config: &Config) -> Self {
        PoolOptions::new(config.workers)
    }
}

/// Background threads proving tasks (and optionally driving rollups) for
/// a shared database
pub struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(db: Arc<Database>, options: PoolOptions) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(options.workers + 1);

        for id in 0..options.workers {
            let db = db.clone();
            let shutdown = shutdown.clone();
            let idle_wait = options.idle_wait;
            handles.push(thread::spawn(move || prove_loop(id, &db, &shutdown, idle_wait)));
        }
        if let Some(interval) = options.rollup_interval {
            let shutdown = shutdown.clone();
            handles.push(thread::spawn(move || rollup_loop(&db, &shutdown, interval)));
        }

        info!(workers = options.workers, rollups = options.rollup_interval.is_some(), "worker pool started");
        WorkerPool { shutdown, handles }
    }

    /// Number of running threads
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every thread and wait for them to finish their current step
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn prove_loop(id: usize, db: &Database, shutdown: &AtomicBool, idle_wait: Duration) {
    debug!(worker = id, "worker started");
    while !shutdown.load(Ordering::SeqCst) {
        let mut busy = false;
        for name in db.collections() {
            match db.prove_next(&name, None) {
                Ok(Some(_)) => busy = true,
                Ok(None) | Err(Error::CollectionNotFound(_)) => {}
                Err(e) => warn!(worker = id, collection = %name, error = %e, "worker step failed"),
            }
        }
        if !busy {
            thread::sleep(idle_wait);
        }
    }
    debug!(worker = id, "worker stopped");
}

fn rollup_loop(db: &Database, shutdown: &AtomicBool, interval: Duration) {
    while !shutdown.load(Ordering::SeqCst) {
        for name in db.collections() {
            match db.rollup_step(&name) {
                Ok(RollupOutcome::Idle) | Ok(RollupOutcome::Waiting(_)) => {}
                Ok(outcome) => debug!(collection = %name, ?outcome, "rollup step"),
                Err(Error::RollupAlreadyInFlight(_)) | Err(Error::CollectionNotFound(_)) => {}
                Err(e) => warn!(collection = %name, error = %e, "rollup step failed"),
            }
        }
        thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionKind;
    use crate::prover::MockProver;

    #[test]
    fn test_process_one_proves_and_retries() {
        let collection = Collection::new("docs", 4, &Config::in_memory()).unwrap();
        let prover = MockProver::new();
        assert!(process_one(&collection, &prover, None).unwrap().is_none());

        collection.mutate(0, ActionKind::Insert, b"a").unwrap();
        prover.fail_next(1);
        let failed = process_one(&collection, &prover, None).unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Queued);
        assert_eq!(failed.attempts, 1);

        let proved = process_one(&collection, &prover, None).unwrap().unwrap();
        assert_eq!(proved.status, TaskStatus::Proved);
        assert!(proved.proof.is_some());
    }

    #[test]
    fn test_unavailable_prover_exhausts_budget() {
        let collection = Collection::new("docs", 4, &Config::in_memory()).unwrap();
        let prover = MockProver::new();
        prover.set_available(false);
        collection.mutate(0, ActionKind::Insert, b"a").unwrap();

        let mut last = None;
        while let Some(task) = process_one(&collection, &prover, None).unwrap() {
            last = Some(task);
        }
        let task = last.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure, Some(FailureReason::ProverUnavailable));
        assert_eq!(collection.queue().failed_tasks().len(), 1);
    }

    #[test]
    fn test_pool_drains_all_collections() {
        let db = Arc::new(Database::in_memory().unwrap());
        db.create_collection("a", Some(6)).unwrap();
        db.create_collection("b", Some(6)).unwrap();
        for i in 0..10 {
            db.insert("a", i, &[i as u8]).unwrap();
            db.insert("b", i, &[i as u8]).unwrap();
        }

        let config = Config {
            workers: 3,
            ..Config::in_memory()
        };
        let pool = WorkerPool::start(
            db.clone(),
            PoolOptions::from(&config).with_rollups(Duration::from_millis(5)),
        );
        assert_eq!(pool.len(), 4);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let settled = |name: &str| db.status(name).unwrap().pending_action_count == 0;
        while !(settled("a") && settled("b")) {
            assert!(std::time::Instant::now() < deadline, "pipeline did not settle");
            thread::sleep(Duration::from_millis(10));
        }
        pool.shutdown();

        for name in ["a", "b"] {
            let status = db.status(name).unwrap();
            assert_eq!(status.confirmed_root, status.current_root);
            assert_eq!(status.failed_task_count, 0);
        }
    }
}
