//! One collection: its tree, log and documents behind a writer lock, plus
//! the proof queue and rollup processor that consume them

use crate::chain::ChainClient;
use crate::config::Config;
use crate::log::{ActionLog, Checkpoint, LogEntry};
use crate::merkle::{MerkleStore, MerkleWitness, TreeSnapshot};
use crate::model::{Action, ActionKind, Hash, RollupStatus, Task, TaskId};
use crate::prover::{ActionWitness, Prover};
use crate::queue::{QueueState, TaskChanges, TaskQueue};
use crate::rollup::{
    LocalHistory, RollupEnv, RollupOutcome, RollupPhase, RollupProcessor, RollupSettings,
    RollupState,
};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// The state a mutation changes atomically
#[derive(Clone, Debug)]
pub struct Ledger {
    tree: MerkleStore,
    log: ActionLog,
    documents: BTreeMap<u64, Vec<u8>>,
}

impl Ledger {
    /// Empty ledger over a tree of `height`
    pub fn new(height: u8, max_height: u8) -> Result<Self> {
        let tree = MerkleStore::create(height, max_height)?;
        let log = ActionLog::new(tree.root());
        Ok(Ledger {
            tree,
            log,
            documents: BTreeMap::new(),
        })
    }

    /// Reassemble a ledger and check that its parts agree
    pub fn restore(
        tree: TreeSnapshot,
        log: ActionLog,
        documents: BTreeMap<u64, Vec<u8>>,
        max_height: u8,
    ) -> Result<Self> {
        let tree = MerkleStore::restore(tree, max_height)?;
        log.verify()?;
        if log.root_at(log.next_sequence().checked_sub(1))? != tree.root() {
            return Err(Error::Corruption(
                "tree root does not match the last logged root".into(),
            ));
        }
        for (&index, payload) in &documents {
            if tree.leaf(index)? != Hash::digest(payload) {
                return Err(Error::Corruption(format!(
                    "document {} does not match its leaf",
                    index
                )));
            }
        }
        if tree.len() != documents.len() {
            return Err(Error::Corruption(format!(
                "{} leaves but {} documents",
                tree.len(),
                documents.len()
            )));
        }
        Ok(Ledger {
            tree,
            log,
            documents,
        })
    }

    pub fn tree(&self) -> &MerkleStore {
        &self.tree
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    pub fn document(&self, index: u64) -> Option<&[u8]> {
        self.documents.get(&index).map(Vec::as_slice)
    }

    pub fn documents(&self) -> &BTreeMap<u64, Vec<u8>> {
        &self.documents
    }

    /// Apply a mutation: update the leaf, append the action and capture
    /// the witness of the leaf's pre-state
    pub fn apply(
        &mut self,
        collection: &str,
        index: u64,
        kind: ActionKind,
        payload: &[u8],
    ) -> Result<(Action, ActionWitness)> {
        self.apply_at(None, collection, index, kind, payload)
    }

    /// Like [`apply`](Self::apply), but only if the action would receive
    /// sequence number `expected`
    pub fn apply_expecting(
        &mut self,
        expected: u64,
        collection: &str,
        index: u64,
        kind: ActionKind,
        payload: &[u8],
    ) -> Result<(Action, ActionWitness)> {
        self.apply_at(Some(expected), collection, index, kind, payload)
    }

    fn apply_at(
        &mut self,
        expected: Option<u64>,
        collection: &str,
        index: u64,
        kind: ActionKind,
        payload: &[u8],
    ) -> Result<(Action, ActionWitness)> {
        let previous_leaf = self.tree.leaf(index)?;
        match kind {
            ActionKind::Insert if !previous_leaf.is_zero() => {
                return Err(Error::DocumentExists(index))
            }
            ActionKind::Update | ActionKind::Delete if previous_leaf.is_zero() => {
                return Err(Error::DocumentNotFound(index))
            }
            _ => {}
        }
        if let Some(expected) = expected {
            let actual = self.log.next_sequence();
            if expected != actual {
                return Err(Error::ConcurrentAppendConflict { expected, actual });
            }
        }

        let payload_hash = match kind {
            ActionKind::Delete => Hash::ZERO,
            ActionKind::Insert | ActionKind::Update => Hash::digest(payload),
        };
        let path = self.tree.witness(index)?;
        let previous_root = self.tree.root();
        let previous_action_state = self.log.head_action_state();

        let new_root = self.tree.set_leaf(index, payload_hash)?;
        let action = self.log.append(kind, index, payload_hash, new_root);
        match kind {
            ActionKind::Delete => {
                self.documents.remove(&index);
            }
            ActionKind::Insert | ActionKind::Update => {
                self.documents.insert(index, payload.to_vec());
            }
        }

        let witness = ActionWitness {
            collection: collection.to_string(),
            action: action.clone(),
            previous_leaf,
            path,
            previous_root,
            new_root,
            previous_action_state,
            new_action_state: self.log.head_action_state(),
        };
        Ok((action, witness))
    }
}

/// Persisted per-collection metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    pub height: u8,
    /// Chain contract this incarnation of the collection settles to
    pub contract: String,
}

/// Operator view of a collection
#[derive(Clone, Debug, Serialize)]
pub struct CollectionStatus {
    pub name: String,
    pub height: u8,
    pub current_root: Hash,
    pub confirmed_root: Hash,
    pub confirmed_action_state: Hash,
    /// Actions after the confirmed checkpoint
    pub pending_action_count: u64,
    pub oldest_pending_task: Option<TaskId>,
    pub failed_task_count: usize,
    pub last_rollup_status: Option<RollupStatus>,
    pub phase: RollupPhase,
    pub blocked_reason: Option<String>,
}

/// Everything stored for one collection, as read back on open
#[derive(Clone, Debug)]
pub struct CollectionSnapshot {
    pub meta: CollectionMeta,
    /// Non-empty tree nodes
    pub nodes: Vec<(u8, u64, Hash)>,
    /// Log entries in any order
    pub entries: Vec<LogEntry>,
    pub documents: BTreeMap<u64, Vec<u8>>,
    pub tasks: Vec<Task>,
    pub rollup: RollupState,
}

/// What changed since the last successful save
///
/// `None` in `nodes` or `documents` means the item is now empty and its
/// stored copy should be removed.
#[derive(Clone, Debug, Default)]
pub struct CollectionChanges {
    pub meta: Option<CollectionMeta>,
    pub nodes: Vec<(u8, u64, Option<Hash>)>,
    pub entries: Vec<LogEntry>,
    pub documents: Vec<(u64, Option<Vec<u8>>)>,
    pub tasks: TaskChanges,
    pub rollup: Option<RollupState>,
}

impl CollectionChanges {
    pub fn is_empty(&self) -> bool {
        self.meta.is_none()
            && self.nodes.is_empty()
            && self.entries.is_empty()
            && self.documents.is_empty()
            && self.tasks.is_empty()
            && self.rollup.is_none()
    }
}

/// Save watermark, guarded by the persist lock
#[derive(Debug)]
struct Saved {
    meta: bool,
    /// Log length at the last successful save
    through: u64,
}

/// A collection and its pipeline
pub struct Collection {
    name: String,
    height: u8,
    contract: String,
    ledger: RwLock<Ledger>,
    queue: TaskQueue,
    processor: RollupProcessor,
    /// Serializes saves so a later one is never overwritten by an earlier
    /// one
    persist: Mutex<Saved>,
    rollup_dirty: AtomicBool,
    /// Set once the collection is dropped; saves are refused after that
    dropped: AtomicBool,
}

impl Collection {
    /// Empty collection of `height` settling to a contract of its own name
    pub fn new(name: impl Into<String>, height: u8, config: &Config) -> Result<Self> {
        let name = name.into();
        Self::with_contract(name.clone(), name, height, config)
    }

    /// Empty collection of `height` settling to `contract`
    pub fn with_contract(
        name: impl Into<String>,
        contract: impl Into<String>,
        height: u8,
        config: &Config,
    ) -> Result<Self> {
        let (name, contract) = (name.into(), contract.into());
        let ledger = Ledger::new(height, config.max_height)?;
        let genesis = ledger.log().checkpoint_at(None)?;
        Ok(Collection {
            queue: TaskQueue::new(name.clone(), config.task_retry.clone()),
            processor: RollupProcessor::new(contract.clone(), RollupSettings::from(config), genesis),
            ledger: RwLock::new(ledger),
            height,
            name,
            contract,
            persist: Mutex::new(Saved {
                meta: false,
                through: 0,
            }),
            rollup_dirty: AtomicBool::new(true),
            dropped: AtomicBool::new(false),
        })
    }

    /// Rebuild from stored state, rejecting anything inconsistent
    pub fn restore(snapshot: CollectionSnapshot, config: &Config) -> Result<Self> {
        let CollectionSnapshot {
            meta,
            nodes,
            mut entries,
            documents,
            tasks,
            rollup,
        } = snapshot;

        let empty_root = MerkleStore::create(meta.height, config.max_height)?.empty_root();
        let root = nodes
            .iter()
            .find(|(level, index, _)| *level == meta.height && *index == 0)
            .map_or(empty_root, |(_, _, hash)| *hash);
        let tree = TreeSnapshot {
            height: meta.height,
            leaves: documents
                .iter()
                .map(|(index, payload)| (*index, Hash::digest(payload)))
                .collect(),
            nodes,
            root,
        };
        entries.sort_by_key(|e| e.action.sequence);
        let log = ActionLog::from_entries(empty_root, entries);
        let ledger = Ledger::restore(tree, log, documents, config.max_height)?;

        let checkpoint = rollup.checkpoint();
        if ledger.log().checkpoint_at(checkpoint.sequence).ok() != Some(checkpoint) {
            return Err(Error::Corruption(format!(
                "{}: confirmed checkpoint is not in the log",
                meta.name
            )));
        }

        let queue = TaskQueue::restore(
            meta.name.clone(),
            config.task_retry.clone(),
            QueueState::from_tasks(tasks),
        );
        let discarded = queue.discard_from(ledger.log().next_sequence());
        if discarded > 0 {
            debug!(collection = %meta.name, discarded, "dropped tasks beyond the persisted log");
        }
        for action in ledger.log().unconfirmed_since(None) {
            if queue.task_for_sequence(action.sequence).is_none() {
                return Err(Error::Corruption(format!(
                    "{}: no task for action {}",
                    meta.name, action.sequence
                )));
            }
        }

        let recovered = queue.recover_in_flight();
        if recovered > 0 {
            info!(collection = %meta.name, recovered, "requeued tasks interrupted mid-proof");
        }

        let through = ledger.log().next_sequence();
        Ok(Collection {
            processor: RollupProcessor::restore(
                meta.contract.clone(),
                RollupSettings::from(config),
                rollup,
            ),
            queue,
            ledger: RwLock::new(ledger),
            height: meta.height,
            name: meta.name,
            contract: meta.contract,
            persist: Mutex::new(Saved {
                meta: true,
                through,
            }),
            rollup_dirty: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    /// Chain contract this collection settles to
    pub fn contract(&self) -> &str {
        &self.contract
    }

    pub fn meta(&self) -> CollectionMeta {
        CollectionMeta {
            name: self.name.clone(),
            height: self.height,
            contract: self.contract.clone(),
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn processor(&self) -> &RollupProcessor {
        &self.processor
    }

    /// Apply a mutation and enqueue its proof task
    pub fn mutate(&self, index: u64, kind: ActionKind, payload: &[u8]) -> Result<Task> {
        let mut ledger = self.ledger.write();
        let (action, witness) = ledger.apply(&self.contract, index, kind, payload)?;
        Ok(self.enqueue(action, witness))
    }

    /// Compare-and-swap form of [`mutate`](Self::mutate)
    pub fn mutate_expecting(
        &self,
        expected: u64,
        index: u64,
        kind: ActionKind,
        payload: &[u8],
    ) -> Result<Task> {
        let mut ledger = self.ledger.write();
        let (action, witness) =
            ledger.apply_expecting(expected, &self.contract, index, kind, payload)?;
        Ok(self.enqueue(action, witness))
    }

    // Called with the writer lock held so task ids follow sequence order
    fn enqueue(&self, action: Action, witness: ActionWitness) -> Task {
        debug!(collection = %self.name, sequence = action.sequence, kind = %action.kind, index = action.index, "action appended");
        self.queue.enqueue(action, witness)
    }

    pub fn root(&self) -> Hash {
        self.ledger.read().tree().root()
    }

    pub fn document(&self, index: u64) -> Result<Option<Vec<u8>>> {
        let ledger = self.ledger.read();
        ledger.tree().leaf(index)?;
        Ok(ledger.document(index).map(<[u8]>::to_vec))
    }

    /// Current leaf value and its witness against the current root
    pub fn witness(&self, index: u64) -> Result<(Hash, MerkleWitness)> {
        let ledger = self.ledger.read();
        Ok((ledger.tree().leaf(index)?, ledger.tree().witness(index)?))
    }

    /// Full recompute of the root, for audits
    pub fn recompute_root(&self) -> Hash {
        self.ledger.read().tree().recompute_root()
    }

    pub fn action_count(&self) -> u64 {
        self.ledger.read().log().next_sequence()
    }

    /// Run `f` with read access to the ledger
    pub fn with_ledger<T>(&self, f: impl FnOnce(&Ledger) -> T) -> T {
        f(&self.ledger.read())
    }

    /// One rollup processor step
    pub fn rollup_step(&self, prover: &dyn Prover, chain: &dyn ChainClient) -> Result<RollupOutcome> {
        let outcome = self.processor.step(&self.env(prover, chain));
        self.rollup_dirty.store(true, Ordering::Release);
        outcome
    }

    pub fn aggregate(&self, prover: &dyn Prover, chain: &dyn ChainClient) -> Result<RollupOutcome> {
        let outcome = self.processor.aggregate(&self.env(prover, chain));
        self.rollup_dirty.store(true, Ordering::Release);
        outcome
    }

    pub fn poll(&self, prover: &dyn Prover, chain: &dyn ChainClient) -> Result<RollupOutcome> {
        let outcome = self.processor.poll(&self.env(prover, chain));
        self.rollup_dirty.store(true, Ordering::Release);
        outcome
    }

    fn env<'a>(&'a self, prover: &'a dyn Prover, chain: &'a dyn ChainClient) -> RollupEnv<'a> {
        RollupEnv {
            history: self,
            queue: &self.queue,
            prover,
            chain,
        }
    }

    pub fn status(&self) -> CollectionStatus {
        let (current_root, head) = {
            let ledger = self.ledger.read();
            (ledger.tree().root(), ledger.log().next_sequence())
        };
        let checkpoint = self.processor.checkpoint();
        CollectionStatus {
            name: self.name.clone(),
            height: self.height,
            current_root,
            confirmed_root: checkpoint.root,
            confirmed_action_state: checkpoint.action_state,
            pending_action_count: head.saturating_sub(checkpoint.next_sequence()),
            oldest_pending_task: self.queue.oldest_pending().map(|t| t.id),
            failed_task_count: self.queue.counts().failed,
            last_rollup_status: self.processor.last_status(),
            phase: self.processor.phase(),
            blocked_reason: self.processor.blocked_reason(),
        }
    }

    /// Collect everything changed since the last save and hand it to
    /// `write` under the persist lock. On success the changes count as
    /// saved; on failure they are kept for the next attempt.
    pub fn persist_with(&self, write: impl FnOnce(&CollectionChanges) -> Result<()>) -> Result<()> {
        let mut saved = self.persist.lock();
        if self.is_dropped() {
            return Err(Error::CollectionNotFound(self.name.clone()));
        }

        // Ledger before tasks: every logged action's task is already queued
        let mut changes = CollectionChanges {
            meta: (!saved.meta).then(|| self.meta()),
            ..CollectionChanges::default()
        };
        let through = {
            let ledger = self.ledger.read();
            let log = ledger.log();
            let head = log.next_sequence();
            let mut touched = BTreeSet::new();
            for sequence in saved.through..head {
                let entry = log.entry(sequence)?;
                touched.insert(entry.action.index);
                changes.entries.push(entry.clone());
            }
            for index in touched {
                changes.nodes.extend(ledger.tree().path_nodes(index)?);
                changes
                    .documents
                    .push((index, ledger.document(index).map(<[u8]>::to_vec)));
            }
            head
        };
        changes.tasks = self.queue.take_changes();
        if self.rollup_dirty.swap(false, Ordering::AcqRel) {
            changes.rollup = Some(self.processor.snapshot());
        }

        if changes.is_empty() {
            return Ok(());
        }
        if let Err(e) = write(&changes) {
            self.queue.mark_unsaved(changes.tasks.ids());
            if changes.rollup.is_some() {
                self.rollup_dirty.store(true, Ordering::Release);
            }
            return Err(e);
        }
        saved.meta = true;
        saved.through = through;
        Ok(())
    }

    /// Mark the collection dropped and run `remove` under the persist lock,
    /// so no save started earlier can write after it
    pub fn retire(&self, remove: impl FnOnce() -> Result<()>) -> Result<()> {
        let _saved = self.persist.lock();
        self.dropped.store(true, Ordering::Release);
        remove()
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

impl LocalHistory for Collection {
    fn locate(&self, root: &Hash, action_state: &Hash) -> Option<Checkpoint> {
        self.ledger.read().log().position_of(root, action_state)
    }
}
