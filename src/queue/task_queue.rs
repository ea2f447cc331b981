//! Per-collection proof task queue

use crate::config::RetryPolicy;
use crate::model::{now_millis, Action, FailureReason, Task, TaskId, TaskStatus};
use crate::prover::{ActionWitness, Proof};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Queue contents
#[derive(Clone, Debug, Default)]
pub struct QueueState {
    tasks: BTreeMap<TaskId, Task>,
    by_sequence: BTreeMap<u64, TaskId>,
    next_id: u64,
    /// Tasks written or removed since the last save
    unsaved: BTreeSet<TaskId>,
}

impl QueueState {
    /// Rebuild queue contents from stored task records
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let tasks: BTreeMap<TaskId, Task> = tasks.into_iter().map(|t| (t.id, t)).collect();
        let by_sequence = tasks.values().map(|t| (t.sequence(), t.id)).collect();
        let next_id = tasks.keys().next_back().map_or(0, |id| id.0 + 1);
        QueueState {
            tasks,
            by_sequence,
            next_id,
            unsaved: BTreeSet::new(),
        }
    }
}

/// Task records to write and ids to delete on the next save
#[derive(Clone, Debug, Default)]
pub struct TaskChanges {
    pub written: Vec<Task>,
    pub removed: Vec<TaskId>,
}

impl TaskChanges {
    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.removed.is_empty()
    }

    /// Every id this change set touches
    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.written.iter().map(|t| t.id).chain(self.removed.iter().copied())
    }
}

/// Task counts by status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub queued: usize,
    pub proving: usize,
    pub proved: usize,
    pub failed: usize,
}

/// Consecutive proved tasks starting at a sequence number
#[derive(Clone, Debug, Default)]
pub struct ProvedRun {
    pub tasks: Vec<Task>,
    /// First task after the run that is not proved, if any
    pub blocked_by: Option<Task>,
}

/// Hands proof work to workers one task at a time
///
/// `dequeue_next` is the only blocking call. A task is given to at most
/// one caller: the `Queued -> Proving` transition happens under the lock.
pub struct TaskQueue {
    collection: String,
    retry: RetryPolicy,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl TaskQueue {
    pub fn new(collection: impl Into<String>, retry: RetryPolicy) -> Self {
        Self::restore(collection, retry, QueueState::default())
    }

    /// Rebuild a queue from persisted state
    pub fn restore(collection: impl Into<String>, retry: RetryPolicy, state: QueueState) -> Self {
        TaskQueue {
            collection: collection.into(),
            retry,
            state: Mutex::new(state),
            available: Condvar::new(),
        }
    }

    /// Create a `Queued` task for an appended action
    pub fn enqueue(&self, action: Action, witness: ActionWitness) -> Task {
        let mut state = self.state.lock();
        let id = TaskId(state.next_id);
        state.next_id += 1;

        let task = Task::new(id, action, witness);
        state.by_sequence.insert(task.sequence(), id);
        state.tasks.insert(id, task.clone());
        state.unsaved.insert(id);
        drop(state);

        debug!(collection = %self.collection, task = %id, sequence = task.sequence(), "task enqueued");
        self.available.notify_one();
        task
    }

    /// Take the oldest eligible task and mark it `Proving`
    ///
    /// With `timeout = None` this is a non-blocking poll. Otherwise it waits
    /// until a task becomes eligible or the timeout elapses.
    pub fn dequeue_next(&self, timeout: Option<Duration>) -> Option<Task> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            let now = now_millis();
            let eligible = state
                .tasks
                .values()
                .find(|t| t.is_eligible(now))
                .map(|t| t.id);

            // `Proving` is not worth a write; a restart requeues it anyway
            if let Some(id) = eligible {
                let task = state.tasks.get_mut(&id)?;
                task.status = TaskStatus::Proving;
                debug!(collection = %self.collection, task = %id, "task dequeued");
                return Some(task.clone());
            }

            let deadline = deadline?;
            let now_instant = Instant::now();
            if now_instant >= deadline {
                return None;
            }

            // Wake for the earliest backoff expiry, if it comes before the deadline
            let wake = state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Queued)
                .map(|t| t.not_before.saturating_sub(now))
                .min()
                .map(|ms| now_instant + Duration::from_millis(ms.max(1)))
                .map_or(deadline, |backoff| backoff.min(deadline));
            self.available.wait_until(&mut state, wake);
        }
    }

    /// `Proving -> Proved`
    pub fn mark_proved(&self, id: TaskId, proof: Proof) -> Result<()> {
        let mut state = self.state.lock();
        let task = state.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id.0))?;
        if task.status != TaskStatus::Proving {
            return Err(Error::InvalidTransition {
                task: id.0,
                from: task.status.as_str(),
                to: TaskStatus::Proved.as_str(),
            });
        }
        task.status = TaskStatus::Proved;
        task.proof = Some(proof);
        task.failure = None;
        state.unsaved.insert(id);
        debug!(collection = %self.collection, task = %id, "task proved");
        Ok(())
    }

    /// `Proving -> Queued` while the retry budget lasts, else `Proving ->
    /// Failed`. Returns the resulting status.
    pub fn mark_failed(&self, id: TaskId, reason: FailureReason) -> Result<TaskStatus> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let task = state.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id.0))?;
        if task.status != TaskStatus::Proving {
            return Err(Error::InvalidTransition {
                task: id.0,
                from: task.status.as_str(),
                to: TaskStatus::Failed.as_str(),
            });
        }
        state.unsaved.insert(id);

        task.attempts += 1;
        if reason.is_retryable() && self.retry.allows_retry(task.attempts) {
            let delay = self.retry.delay_ms(task.attempts);
            task.status = TaskStatus::Queued;
            task.not_before = now_millis() + delay;
            warn!(
                collection = %self.collection,
                task = %id,
                attempt = task.attempts,
                delay_ms = delay,
                %reason,
                "proof attempt failed, retrying"
            );
            task.failure = Some(reason);
            drop(guard);
            self.available.notify_one();
            return Ok(TaskStatus::Queued);
        }

        task.status = TaskStatus::Failed;
        error!(
            collection = %self.collection,
            task = %id,
            sequence = task.action.sequence,
            attempts = task.attempts,
            %reason,
            "task failed terminally; later actions are blocked until an operator retries it"
        );
        task.failure = Some(reason);
        Ok(TaskStatus::Failed)
    }

    /// Cancel a task that has not been proved yet
    pub fn cancel(&self, id: TaskId) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let task = state.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id.0))?;
        if task.status.is_terminal() {
            return Err(Error::InvalidTransition {
                task: id.0,
                from: task.status.as_str(),
                to: TaskStatus::Failed.as_str(),
            });
        }
        task.status = TaskStatus::Failed;
        task.failure = Some(FailureReason::Cancelled);
        state.unsaved.insert(id);
        info!(collection = %self.collection, task = %id, "task cancelled");
        Ok(())
    }

    /// Cancel every task not yet proved; returns how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut cancelled = 0;
        for task in state.tasks.values_mut().filter(|t| !t.status.is_terminal()) {
            task.status = TaskStatus::Failed;
            task.failure = Some(FailureReason::Cancelled);
            state.unsaved.insert(task.id);
            cancelled += 1;
        }
        if cancelled > 0 {
            info!(collection = %self.collection, cancelled, "cancelled pending tasks");
        }
        cancelled
    }

    /// Operator action: `Failed -> Queued` with a fresh retry budget
    pub fn retry_failed(&self, id: TaskId) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let task = state.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id.0))?;
        if task.status != TaskStatus::Failed {
            return Err(Error::InvalidTransition {
                task: id.0,
                from: task.status.as_str(),
                to: TaskStatus::Queued.as_str(),
            });
        }
        task.status = TaskStatus::Queued;
        task.attempts = 0;
        task.failure = None;
        task.not_before = now_millis();
        state.unsaved.insert(id);
        drop(guard);

        info!(collection = %self.collection, task = %id, "failed task re-queued");
        self.available.notify_one();
        Ok(())
    }

    /// After a restart no worker owns a `Proving` task; put them back
    pub fn recover_in_flight(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut recovered = 0;
        for task in state.tasks.values_mut() {
            if task.status == TaskStatus::Proving {
                task.status = TaskStatus::Queued;
                state.unsaved.insert(task.id);
                recovered += 1;
            }
        }
        recovered
    }

    /// Drop tasks for sequences at or after `sequence`; they belong to
    /// actions that never reached durable storage
    pub fn discard_from(&self, sequence: u64) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let stale = state.by_sequence.split_off(&sequence);
        for id in stale.values() {
            state.tasks.remove(id);
            state.unsaved.insert(*id);
        }
        stale.len()
    }

    /// Everything written or removed since the last call, for an
    /// incremental save
    pub fn take_changes(&self) -> TaskChanges {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut changes = TaskChanges::default();
        for id in std::mem::take(&mut state.unsaved) {
            match state.tasks.get(&id) {
                Some(task) => changes.written.push(task.clone()),
                None => changes.removed.push(id),
            }
        }
        changes
    }

    /// Put ids back after a save that did not complete
    pub fn mark_unsaved(&self, ids: impl IntoIterator<Item = TaskId>) {
        self.state.lock().unsaved.extend(ids);
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.state.lock().tasks.get(&id).cloned()
    }

    pub fn task_for_sequence(&self, sequence: u64) -> Option<Task> {
        let state = self.state.lock();
        let id = state.by_sequence.get(&sequence)?;
        state.tasks.get(id).cloned()
    }

    /// Consecutive `Proved` tasks starting at `sequence`, at most `max`
    pub fn proved_run(&self, sequence: u64, max: usize) -> ProvedRun {
        let state = self.state.lock();
        let mut run = ProvedRun::default();
        for (_, id) in state.by_sequence.range(sequence..) {
            if run.tasks.len() >= max {
                break;
            }
            let Some(task) = state.tasks.get(id) else {
                break;
            };
            if task.sequence() != sequence + run.tasks.len() as u64 {
                break;
            }
            if task.status != TaskStatus::Proved {
                run.blocked_by = Some(task.clone());
                break;
            }
            run.tasks.push(task.clone());
        }
        run
    }

    /// Oldest task that is not yet proved
    pub fn oldest_pending(&self) -> Option<Task> {
        self.state
            .lock()
            .tasks
            .values()
            .find(|t| t.status != TaskStatus::Proved)
            .cloned()
    }

    /// Terminally failed tasks awaiting an operator
    pub fn failed_tasks(&self) -> Vec<Task> {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> TaskCounts {
        let state = self.state.lock();
        let mut counts = TaskCounts::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Proving => counts.proving += 1,
                TaskStatus::Proved => counts.proved += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every task, in id order
    pub fn tasks(&self) -> Vec<Task> {
        self.state.lock().tasks.values().cloned().collect()
    }
}
