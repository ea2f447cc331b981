//! Rollup processor: batches proved actions after the confirmed
//! checkpoint into one aggregate proof, submits it and reconciles the
//! result with the settlement chain.

use crate::chain::{ChainClient, Confirmation, OnChainState, SubmissionHandle};
use crate::config::{Config, RetryPolicy};
use crate::log::{ActionLog, Checkpoint};
use crate::model::{now_millis, Hash, RollupRecord, RollupStatus, Task};
use crate::prover::{BatchWitness, Prover, Witness};
use crate::queue::TaskQueue;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Where a collection's rollup pipeline is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollupPhase {
    Idle,
    Aggregating,
    Submitting,
    WaitingConfirmation,
}

impl RollupPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollupPhase::Idle => "idle",
            RollupPhase::Aggregating => "aggregating",
            RollupPhase::Submitting => "submitting",
            RollupPhase::WaitingConfirmation => "waiting_confirmation",
        }
    }
}

impl fmt::Display for RollupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read access to local history, used to place the chain's state
pub trait LocalHistory {
    /// Checkpoint at which the log reached `(root, action_state)`, if ever
    fn locate(&self, root: &Hash, action_state: &Hash) -> Option<Checkpoint>;
}

impl LocalHistory for ActionLog {
    fn locate(&self, root: &Hash, action_state: &Hash) -> Option<Checkpoint> {
        self.position_of(root, action_state)
    }
}

/// Collaborators a processor step needs
pub struct RollupEnv<'a> {
    pub history: &'a dyn LocalHistory,
    pub queue: &'a TaskQueue,
    pub prover: &'a dyn Prover,
    pub chain: &'a dyn ChainClient,
}

/// Operational knobs, taken from [`Config`]
#[derive(Clone, Debug, PartialEq)]
pub struct RollupSettings {
    pub max_batch_size: usize,
    pub confirmation_timeout_ms: u64,
    pub history_limit: usize,
    /// Backoff after a failed aggregate proof or submission
    pub retry: RetryPolicy,
}

impl From<&Config> for RollupSettings {
    fn from(config: &Config) -> Self {
        RollupSettings {
            max_batch_size: config.max_batch_size,
            confirmation_timeout_ms: config.confirmation_timeout_ms,
            history_limit: config.history_limit,
            retry: config.rollup_retry.clone(),
        }
    }
}

impl Default for RollupSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// What a call into the processor did
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollupOutcome {
    /// No proved action directly after the checkpoint
    Idle,
    /// A previous aggregate failed; nothing is attempted before `until`
    BackingOff { until: u64 },
    Submitted(RollupRecord),
    /// The in-flight record is still unconfirmed
    Waiting(RollupRecord),
    Confirmed(RollupRecord),
    /// The checkpoint was reconciled with the chain and, when possible, a
    /// corrected batch submitted
    Repaired {
        checkpoint: Checkpoint,
        resubmitted: Option<RollupRecord>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct InFlight {
    record: RollupRecord,
    /// `None` until the chain accepted the submission
    handle: Option<SubmissionHandle>,
}

/// Persisted processor state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RollupState {
    checkpoint: Checkpoint,
    phase: RollupPhase,
    in_flight: Option<InFlight>,
    /// Archived records, oldest first
    history: VecDeque<RollupRecord>,
    next_record_id: u64,
    failed_attempts: u32,
    retry_after: Option<u64>,
    /// Chain state that is not in local history
    blocked: Option<OnChainState>,
}

impl RollupState {
    pub fn new(checkpoint: Checkpoint) -> Self {
        RollupState {
            checkpoint,
            phase: RollupPhase::Idle,
            in_flight: None,
            history: VecDeque::new(),
            next_record_id: 0,
            failed_attempts: 0,
            retry_after: None,
            blocked: None,
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    /// Whether the collection's single rollup slot is taken
    fn is_busy(&self) -> bool {
        self.phase != RollupPhase::Idle
            || self
                .in_flight
                .as_ref()
                .is_some_and(|f| f.record.status.is_in_flight())
    }
}

/// What the chain said about the in-flight record, gathered without the
/// processor lock
enum Verdict {
    Confirmed,
    Waiting,
    Rejected { reason: String, chain: OnChainState },
    TimedOut { chain: OnChainState },
}

/// Single-flight rollup state machine for one collection
///
/// The mutex guards phase transitions only. Proving an aggregate and every
/// chain call happen outside it; the phase marks the slot as taken, so
/// concurrent callers get `RollupAlreadyInFlight` instead of waiting.
pub struct RollupProcessor {
    /// Chain contract the collection settles to
    contract: String,
    settings: RollupSettings,
    state: Mutex<RollupState>,
}

impl RollupProcessor {
    /// Processor whose confirmed checkpoint is `checkpoint`
    pub fn new(contract: impl Into<String>, settings: RollupSettings, checkpoint: Checkpoint) -> Self {
        Self::restore(contract, settings, RollupState::new(checkpoint))
    }

    /// Rebuild from persisted state. Work interrupted before the chain
    /// accepted it is abandoned; a submitted record keeps waiting.
    pub fn restore(contract: impl Into<String>, settings: RollupSettings, mut state: RollupState) -> Self {
        let contract = contract.into();
        match state.phase {
            RollupPhase::Idle | RollupPhase::Aggregating => {
                state.phase = RollupPhase::Idle;
                state.in_flight = None;
            }
            RollupPhase::Submitting | RollupPhase::WaitingConfirmation => {
                match state.in_flight.take() {
                    Some(flight) if flight.handle.is_some() => {
                        state.phase = RollupPhase::WaitingConfirmation;
                        state.in_flight = Some(flight);
                    }
                    Some(mut flight) => {
                        warn!(collection = %contract, record = flight.record.id, "abandoning rollup interrupted before submission");
                        flight.record.status = RollupStatus::Rejected;
                        flight.record.rejection = Some("interrupted before submission".into());
                        state.history.push_back(flight.record);
                        state.phase = RollupPhase::Idle;
                    }
                    None => state.phase = RollupPhase::Idle,
                }
            }
        }
        RollupProcessor {
            contract,
            settings,
            state: Mutex::new(state),
        }
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// Last confirmed position
    pub fn checkpoint(&self) -> Checkpoint {
        self.state.lock().checkpoint
    }

    pub fn phase(&self) -> RollupPhase {
        self.state.lock().phase
    }

    /// The record currently `Pending` or `Submitted`, if any
    pub fn in_flight(&self) -> Option<RollupRecord> {
        self.state.lock().in_flight.as_ref().map(|f| f.record.clone())
    }

    /// Archived records followed by the in-flight one
    pub fn history(&self) -> Vec<RollupRecord> {
        let state = self.state.lock();
        state
            .history
            .iter()
            .chain(state.in_flight.as_ref().map(|f| &f.record))
            .cloned()
            .collect()
    }

    pub fn last_status(&self) -> Option<RollupStatus> {
        let state = self.state.lock();
        state
            .in_flight
            .as_ref()
            .map(|f| f.record.status)
            .or_else(|| state.history.back().map(|r| r.status))
    }

    /// Why the processor refuses to aggregate, if it does
    pub fn blocked_reason(&self) -> Option<String> {
        self.state.lock().blocked.map(|chain| {
            format!(
                "on-chain state (root {}, action state {}) is not in local history",
                chain.root.short(),
                chain.action_state.short()
            )
        })
    }

    pub fn snapshot(&self) -> RollupState {
        self.state.lock().clone()
    }

    /// Poll when a record is in flight, otherwise try to aggregate. A
    /// blocked processor first re-checks whether the chain has come back
    /// into local history.
    pub fn step(&self, env: &RollupEnv<'_>) -> Result<RollupOutcome> {
        let (phase, blocked) = {
            let state = self.state.lock();
            (state.phase, state.blocked.is_some())
        };
        match phase {
            RollupPhase::WaitingConfirmation => self.poll(env),
            RollupPhase::Idle => {
                if blocked {
                    let chain = env.chain.current_state(&self.contract)?;
                    let mut state = self.state.lock();
                    if state.is_busy() {
                        return Err(Error::RollupAlreadyInFlight(self.contract.clone()));
                    }
                    self.repair(&mut state, env.history, chain, false)?;
                }
                self.aggregate(env)
            }
            RollupPhase::Aggregating | RollupPhase::Submitting => {
                Err(Error::RollupAlreadyInFlight(self.contract.clone()))
            }
        }
    }

    /// Prove and submit the proved run after the checkpoint
    pub fn aggregate(&self, env: &RollupEnv<'_>) -> Result<RollupOutcome> {
        let (checkpoint, tasks) = {
            let mut state = self.state.lock();
            if state.is_busy() {
                return Err(Error::RollupAlreadyInFlight(self.contract.clone()));
            }
            if let Some(chain) = state.blocked {
                return Err(divergence(&chain));
            }
            if let Some(until) = state.retry_after {
                if now_millis() < until {
                    return Ok(RollupOutcome::BackingOff { until });
                }
            }

            let run = env
                .queue
                .proved_run(state.checkpoint.next_sequence(), self.settings.max_batch_size);
            if run.tasks.is_empty() {
                if let Some(task) = run.blocked_by {
                    debug!(collection = %self.contract, sequence = task.sequence(), status = %task.status, "next action not proved yet");
                }
                return Ok(RollupOutcome::Idle);
            }
            state.phase = RollupPhase::Aggregating;
            (state.checkpoint, run.tasks)
        };

        let witness = match self.batch_witness(&checkpoint, &tasks) {
            Ok(witness) => witness,
            Err(e) => {
                self.state.lock().phase = RollupPhase::Idle;
                return Err(e);
            }
        };
        let first = witness.first_sequence().unwrap_or_default();
        let last = witness.last_sequence().unwrap_or_default();
        let (new_root, new_action_state) = (witness.new_root, witness.new_action_state);
        info!(collection = %self.contract, first, last, "aggregating rollup");

        let proof = match env.prover.prove(&Witness::Batch(witness)) {
            Ok(proof) => proof,
            Err(e) => {
                let mut state = self.state.lock();
                state.phase = RollupPhase::Idle;
                let until = self.back_off(&mut state);
                warn!(collection = %self.contract, error = %e, retry_after = until, "aggregate proof failed");
                return Err(e);
            }
        };

        let record = {
            let mut state = self.state.lock();
            let id = state.next_record_id;
            state.next_record_id += 1;
            let record = RollupRecord::new(
                id,
                &self.contract,
                checkpoint.root,
                new_root,
                checkpoint.action_state,
                new_action_state,
                first,
                last,
                proof,
            );
            state.phase = RollupPhase::Submitting;
            state.in_flight = Some(InFlight {
                record: record.clone(),
                handle: None,
            });
            record
        };

        let submitted = env.chain.submit(&record);
        let mut state = self.state.lock();
        match submitted {
            Ok(handle) => {
                let mut record = record;
                record.status = RollupStatus::Submitted;
                record.submitted_at = Some(now_millis());
                state.in_flight = Some(InFlight {
                    record: record.clone(),
                    handle: Some(handle),
                });
                state.phase = RollupPhase::WaitingConfirmation;
                state.failed_attempts = 0;
                state.retry_after = None;
                info!(collection = %self.contract, record = record.id, first, last, previous_root = %record.previous_root.short(), new_root = %record.new_root.short(), "rollup submitted");
                Ok(RollupOutcome::Submitted(record))
            }
            Err(e) => {
                state.in_flight = None;
                self.archive(&mut state, record, RollupStatus::Rejected, Some(format!("submission failed: {}", e)));
                state.phase = RollupPhase::Idle;
                let until = self.back_off(&mut state);
                warn!(collection = %self.contract, error = %e, retry_after = until, "rollup submission failed");
                Err(e)
            }
        }
    }

    /// Reconcile the in-flight record with the chain
    pub fn poll(&self, env: &RollupEnv<'_>) -> Result<RollupOutcome> {
        let (record, handle) = {
            let mut state = self.state.lock();
            match state.phase {
                RollupPhase::Idle => return Ok(RollupOutcome::Idle),
                RollupPhase::Aggregating | RollupPhase::Submitting => {
                    return Err(Error::RollupAlreadyInFlight(self.contract.clone()))
                }
                RollupPhase::WaitingConfirmation => {}
            }
            let Some(InFlight {
                record,
                handle: Some(handle),
            }) = state.in_flight.clone()
            else {
                state.phase = RollupPhase::Idle;
                state.in_flight = None;
                return Err(Error::Corruption(format!(
                    "{}: waiting for confirmation without a submission",
                    self.contract
                )));
            };
            (record, handle)
        };

        let verdict = self.query(env, &record, &handle)?;

        let checkpoint = {
            let mut state = self.state.lock();
            // Another caller may have settled this record meanwhile
            let same_flight = state.phase == RollupPhase::WaitingConfirmation
                && state.in_flight.as_ref().map(|f| f.record.id) == Some(record.id);
            if !same_flight {
                return Err(Error::RollupAlreadyInFlight(self.contract.clone()));
            }

            match verdict {
                Verdict::Confirmed => {
                    return Ok(RollupOutcome::Confirmed(self.confirm(&mut state, record)));
                }
                Verdict::Waiting => return Ok(RollupOutcome::Waiting(record)),
                Verdict::Rejected { reason, chain } => {
                    self.reject(&mut state, record, reason);
                    self.repair(&mut state, env.history, chain, true)?
                }
                Verdict::TimedOut { chain } => {
                    if chain.root == record.new_root && chain.action_state == record.new_action_state {
                        info!(collection = %self.contract, record = record.id, "timed-out rollup found on chain");
                        return Ok(RollupOutcome::Confirmed(self.confirm(&mut state, record)));
                    }

                    warn!(collection = %self.contract, record = record.id, "rollup confirmation timed out");
                    let unchanged = chain.root == record.previous_root
                        && chain.action_state == record.previous_action_state;
                    self.reject(&mut state, record, "confirmation timeout".into());
                    if unchanged {
                        state.checkpoint
                    } else {
                        self.repair(&mut state, env.history, chain, true)?
                    }
                }
            }
        };

        let resubmitted = match self.aggregate(env) {
            Ok(RollupOutcome::Submitted(record)) => Some(record),
            Ok(_) | Err(Error::RollupAlreadyInFlight(_)) => None,
            Err(e) => {
                warn!(collection = %self.contract, error = %e, "resubmission after repair failed");
                None
            }
        };
        Ok(RollupOutcome::Repaired {
            checkpoint,
            resubmitted,
        })
    }

    fn query(
        &self,
        env: &RollupEnv<'_>,
        record: &RollupRecord,
        handle: &SubmissionHandle,
    ) -> Result<Verdict> {
        Ok(match env.chain.query_confirmation(handle)? {
            Confirmation::Confirmed { root, action_state }
                if root == record.new_root && action_state == record.new_action_state =>
            {
                Verdict::Confirmed
            }
            Confirmation::Confirmed { root, .. } => {
                warn!(collection = %self.contract, record = record.id, root = %root.short(), "confirmation does not match the submitted state");
                Verdict::Rejected {
                    reason: format!("confirmed unexpected root {}", root.short()),
                    chain: env.chain.current_state(&self.contract)?,
                }
            }
            Confirmation::Rejected(reason) => {
                warn!(collection = %self.contract, record = record.id, reason = %reason, "rollup rejected");
                Verdict::Rejected {
                    reason,
                    chain: env.chain.current_state(&self.contract)?,
                }
            }
            Confirmation::Pending => {
                let since = record.submitted_at.unwrap_or(record.created_at);
                if now_millis().saturating_sub(since) < self.settings.confirmation_timeout_ms {
                    Verdict::Waiting
                } else {
                    Verdict::TimedOut {
                        chain: env.chain.current_state(&self.contract)?,
                    }
                }
            }
        })
    }

    /// Move the checkpoint to the chain's actual state. Refuses, and blocks
    /// the processor, when that state is not in local history.
    ///
    /// A rejection that leaves the checkpoint where it was counts as a
    /// failed attempt and backs off.
    fn repair(
        &self,
        state: &mut RollupState,
        history: &dyn LocalHistory,
        chain: OnChainState,
        after_rejection: bool,
    ) -> Result<Checkpoint> {
        match history.locate(&chain.root, &chain.action_state) {
            Some(checkpoint) if checkpoint == state.checkpoint => {
                state.blocked = None;
                if after_rejection {
                    let until = self.back_off(state);
                    warn!(collection = %self.contract, sequence = ?checkpoint.sequence, retry_after = until, "chain still at the confirmed checkpoint");
                }
                Ok(checkpoint)
            }
            Some(checkpoint) => {
                warn!(
                    collection = %self.contract,
                    from = ?state.checkpoint.sequence,
                    to = ?checkpoint.sequence,
                    "checkpoint repaired against chain state"
                );
                state.checkpoint = checkpoint;
                state.blocked = None;
                state.failed_attempts = 0;
                state.retry_after = None;
                Ok(checkpoint)
            }
            None => {
                error!(collection = %self.contract, root = %chain.root, action_state = %chain.action_state, "chain state diverged from local history");
                state.blocked = Some(chain);
                Err(divergence(&chain))
            }
        }
    }

    fn batch_witness(&self, checkpoint: &Checkpoint, tasks: &[Task]) -> Result<BatchWitness> {
        let (Some(first), Some(last)) = (tasks.first(), tasks.last()) else {
            return Err(Error::Corruption("empty proved run".into()));
        };
        if first.witness.previous_root != checkpoint.root
            || first.witness.previous_action_state != checkpoint.action_state
        {
            return Err(Error::Corruption(format!(
                "{}: action {} does not start at the checkpoint",
                self.contract,
                first.sequence()
            )));
        }

        let proofs = tasks
            .iter()
            .map(|t| {
                t.proof
                    .clone()
                    .ok_or_else(|| Error::Corruption(format!("proved task {} has no proof", t.id)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(BatchWitness {
            collection: self.contract.clone(),
            previous_root: checkpoint.root,
            new_root: last.witness.new_root,
            previous_action_state: checkpoint.action_state,
            new_action_state: last.witness.new_action_state,
            actions: tasks.iter().map(|t| t.witness.clone()).collect(),
            proofs,
        })
    }

    fn confirm(&self, state: &mut RollupState, record: RollupRecord) -> RollupRecord {
        state.checkpoint = Checkpoint {
            sequence: Some(record.last_sequence),
            root: record.new_root,
            action_state: record.new_action_state,
        };
        state.in_flight = None;
        state.phase = RollupPhase::Idle;
        state.blocked = None;
        info!(collection = %self.contract, record = record.id, sequence = record.last_sequence, root = %record.new_root.short(), "rollup confirmed");
        self.archive(state, record, RollupStatus::Confirmed, None)
    }

    fn reject(&self, state: &mut RollupState, record: RollupRecord, reason: String) {
        state.in_flight = None;
        state.phase = RollupPhase::Idle;
        self.archive(state, record, RollupStatus::Rejected, Some(reason));
    }

    fn archive(
        &self,
        state: &mut RollupState,
        mut record: RollupRecord,
        status: RollupStatus,
        rejection: Option<String>,
    ) -> RollupRecord {
        record.status = status;
        record.rejection = rejection;
        state.history.push_back(record.clone());
        while state.history.len() > self.settings.history_limit {
            state.history.pop_front();
        }
        record
    }

    fn back_off(&self, state: &mut RollupState) -> u64 {
        state.failed_attempts = state.failed_attempts.saturating_add(1);
        let until = now_millis() + self.settings.retry.delay_ms(state.failed_attempts);
        state.retry_after = Some(until);
        until
    }
}

fn divergence(chain: &OnChainState) -> Error {
    Error::ChainDivergence {
        root: chain.root.to_hex(),
        action_state: chain.action_state.to_hex(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LocalChain;
    use crate::collection::Ledger;
    use crate::model::ActionKind;
    use crate::prover::MockProver;

    struct Fixture {
        ledger: Ledger,
        queue: TaskQueue,
        prover: MockProver,
        chain: LocalChain,
    }

    impl Fixture {
        fn new() -> Self {
            let ledger = Ledger::new(8, 32).unwrap();
            let chain = LocalChain::new();
            chain.deploy("docs", ledger.tree().root()).unwrap();
            Fixture {
                ledger,
                queue: TaskQueue::new("docs", RetryPolicy::immediate(3)),
                prover: MockProver::new(),
                chain,
            }
        }

        fn insert(&mut self, index: u64, payload: &[u8]) {
            let (action, witness) = self
                .ledger
                .apply("docs", index, ActionKind::Insert, payload)
                .unwrap();
            self.queue.enqueue(action, witness);
        }

        fn prove_all(&self) {
            while let Some(task) = self.queue.dequeue_next(None) {
                let proof = self
                    .prover
                    .prove(&Witness::Action(task.witness.clone()))
                    .unwrap();
                self.queue.mark_proved(task.id, proof).unwrap();
            }
        }

        fn env(&self) -> RollupEnv<'_> {
            RollupEnv {
                history: self.ledger.log(),
                queue: &self.queue,
                prover: &self.prover,
                chain: &self.chain,
            }
        }

        fn processor(&self, settings: RollupSettings) -> RollupProcessor {
            let genesis = self.ledger.log().checkpoint_at(None).unwrap();
            RollupProcessor::new("docs", settings, genesis)
        }
    }

    fn settings() -> RollupSettings {
        RollupSettings {
            retry: RetryPolicy::immediate(3),
            ..RollupSettings::default()
        }
    }

    #[test]
    fn test_submit_then_confirm() {
        let mut fx = Fixture::new();
        fx.insert(1, b"a");
        fx.insert(2, b"b");
        fx.insert(3, b"c");
        fx.prove_all();
        let processor = fx.processor(settings());

        let RollupOutcome::Submitted(record) = processor.aggregate(&fx.env()).unwrap() else {
            panic!("expected a submission");
        };
        assert_eq!((record.first_sequence, record.last_sequence), (0, 2));
        assert_eq!(record.new_root, fx.ledger.tree().root());
        assert_eq!(processor.phase(), RollupPhase::WaitingConfirmation);
        assert_eq!(processor.last_status(), Some(RollupStatus::Submitted));

        assert!(matches!(
            processor.poll(&fx.env()).unwrap(),
            RollupOutcome::Waiting(_)
        ));

        fx.chain.settle();
        assert!(matches!(
            processor.poll(&fx.env()).unwrap(),
            RollupOutcome::Confirmed(_)
        ));
        let checkpoint = processor.checkpoint();
        assert_eq!(checkpoint.sequence, Some(2));
        assert_eq!(checkpoint.root, fx.ledger.tree().root());
        assert_eq!(processor.phase(), RollupPhase::Idle);
        assert_eq!(
            fx.chain.current_state("docs").unwrap().action_state,
            fx.ledger.log().head_action_state()
        );
    }

    #[test]
    fn test_waits_for_proof_of_next_action() {
        let mut fx = Fixture::new();
        let processor = fx.processor(settings());
        assert!(matches!(
            processor.aggregate(&fx.env()).unwrap(),
            RollupOutcome::Idle
        ));

        fx.insert(0, b"a");
        assert!(matches!(
            processor.step(&fx.env()).unwrap(),
            RollupOutcome::Idle
        ));
        assert_eq!(processor.phase(), RollupPhase::Idle);
    }

    #[test]
    fn test_batch_size_is_capped() {
        let mut fx = Fixture::new();
        for i in 0..5 {
            fx.insert(i, &[i as u8]);
        }
        fx.prove_all();
        let processor = fx.processor(RollupSettings {
            max_batch_size: 2,
            ..settings()
        });

        let RollupOutcome::Submitted(record) = processor.aggregate(&fx.env()).unwrap() else {
            panic!("expected a submission");
        };
        assert_eq!(record.action_count(), 2);
    }

    #[test]
    fn test_second_aggregate_is_rejected_while_in_flight() {
        let mut fx = Fixture::new();
        fx.insert(0, b"a");
        fx.prove_all();
        let processor = fx.processor(settings());

        processor.aggregate(&fx.env()).unwrap();
        assert!(matches!(
            processor.aggregate(&fx.env()),
            Err(Error::RollupAlreadyInFlight(_))
        ));
    }

    #[test]
    fn test_concurrent_aggregate_single_flight() {
        let mut fx = Fixture::new();
        for i in 0..4 {
            fx.insert(i, &[i as u8]);
        }
        fx.prove_all();
        let processor = fx.processor(settings());

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| processor.aggregate(&fx.env())))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let submitted = results
            .iter()
            .filter(|r| matches!(r, Ok(RollupOutcome::Submitted(_))))
            .count();
        let in_flight = results
            .iter()
            .filter(|r| matches!(r, Err(Error::RollupAlreadyInFlight(_))))
            .count();
        assert_eq!(submitted, 1);
        assert_eq!(in_flight, 7);
        assert_eq!(processor.history().len(), 1);
    }

    #[test]
    fn test_rejection_repairs_against_chain_state() {
        let mut fx = Fixture::new();
        let r0 = fx.ledger.tree().root();
        fx.insert(1, b"first");
        let r1 = fx.ledger.tree().root();
        fx.insert(2, b"second");
        let r2 = fx.ledger.tree().root();
        fx.prove_all();

        // Believes the chain already holds R1; it is still at R0
        let believed = fx.ledger.log().checkpoint_at(Some(0)).unwrap();
        let processor = RollupProcessor::new("docs", settings(), believed);

        let RollupOutcome::Submitted(stale) = processor.aggregate(&fx.env()).unwrap() else {
            panic!("expected a submission");
        };
        assert_eq!(stale.previous_root, r1);
        fx.chain.settle();

        let RollupOutcome::Repaired {
            checkpoint,
            resubmitted: Some(corrected),
        } = processor.poll(&fx.env()).unwrap()
        else {
            panic!("expected a repaired resubmission");
        };
        assert_eq!(checkpoint.sequence, None);
        assert_eq!(corrected.previous_root, r0);
        assert_eq!(corrected.first_sequence, 0);

        fx.chain.settle();
        assert!(matches!(
            processor.poll(&fx.env()).unwrap(),
            RollupOutcome::Confirmed(_)
        ));
        assert!(matches!(
            processor.poll(&fx.env()).unwrap(),
            RollupOutcome::Idle
        ));

        assert_eq!(processor.checkpoint().sequence, Some(1));
        assert_eq!(processor.checkpoint().root, r2);
        let history = processor.history();
        let statuses: Vec<_> = history.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![RollupStatus::Rejected, RollupStatus::Confirmed]);
    }

    #[test]
    fn test_unknown_chain_state_blocks() {
        let mut fx = Fixture::new();
        fx.insert(0, b"a");
        fx.prove_all();
        let genesis = fx.chain.current_state("docs").unwrap();
        let processor = fx.processor(settings());

        processor.aggregate(&fx.env()).unwrap();
        fx.chain.override_state(
            "docs",
            OnChainState {
                root: Hash::digest(b"someone else"),
                action_state: Hash::digest(b"someone else's actions"),
            },
        );
        fx.chain.settle();

        assert!(matches!(
            processor.poll(&fx.env()),
            Err(Error::ChainDivergence { .. })
        ));
        assert!(processor.blocked_reason().is_some());
        assert!(matches!(
            processor.aggregate(&fx.env()),
            Err(Error::ChainDivergence { .. })
        ));
        assert!(matches!(
            processor.step(&fx.env()),
            Err(Error::ChainDivergence { .. })
        ));

        // The chain comes back to a state we know
        fx.chain.override_state("docs", genesis);
        assert!(matches!(
            processor.step(&fx.env()).unwrap(),
            RollupOutcome::Submitted(_)
        ));
        assert!(processor.blocked_reason().is_none());
    }

    #[test]
    fn test_prover_failure_backs_off() {
        let mut fx = Fixture::new();
        fx.insert(0, b"a");
        fx.prove_all();
        let processor = fx.processor(RollupSettings {
            retry: RetryPolicy {
                max_attempts: 5,
                base_delay_ms: 60_000,
                max_delay_ms: 60_000,
                multiplier: 2.0,
            },
            ..RollupSettings::default()
        });

        fx.prover.fail_next(1);
        assert!(matches!(
            processor.aggregate(&fx.env()),
            Err(Error::ProofGenerationFailed(_))
        ));
        assert_eq!(processor.phase(), RollupPhase::Idle);
        assert!(matches!(
            processor.aggregate(&fx.env()).unwrap(),
            RollupOutcome::BackingOff { .. }
        ));
    }

    #[test]
    fn test_timed_out_resubmission_lands_once() {
        let mut fx = Fixture::new();
        fx.insert(0, b"a");
        fx.insert(1, b"b");
        fx.prove_all();
        let processor = fx.processor(RollupSettings {
            confirmation_timeout_ms: 0,
            ..settings()
        });

        processor.aggregate(&fx.env()).unwrap();
        let RollupOutcome::Repaired {
            resubmitted: Some(_),
            ..
        } = processor.poll(&fx.env()).unwrap()
        else {
            panic!("expected a resubmission after timeout");
        };

        // Both submissions reach the chain; only the first can apply
        fx.chain.settle();
        let RollupOutcome::Repaired {
            checkpoint,
            resubmitted: None,
        } = processor.poll(&fx.env()).unwrap()
        else {
            panic!("expected the rejected duplicate to be repaired");
        };
        assert_eq!(checkpoint.sequence, Some(1));
        assert_eq!(processor.checkpoint().root, fx.ledger.tree().root());
        assert_eq!(processor.phase(), RollupPhase::Idle);
    }

    #[test]
    fn test_restore_keeps_submitted_record() {
        let mut fx = Fixture::new();
        fx.insert(0, b"a");
        fx.prove_all();
        let processor = fx.processor(settings());
        processor.aggregate(&fx.env()).unwrap();

        let restored = RollupProcessor::restore("docs", settings(), processor.snapshot());
        assert_eq!(restored.phase(), RollupPhase::WaitingConfirmation);

        fx.chain.settle();
        assert!(matches!(
            restored.poll(&fx.env()).unwrap(),
            RollupOutcome::Confirmed(_)
        ));
        assert_eq!(restored.checkpoint().sequence, Some(0));
    }

    #[test]
    fn test_timed_out_record_already_on_chain_confirms_once() {
        let mut fx = Fixture::new();
        fx.insert(0, b"a");
        fx.insert(1, b"b");
        fx.prove_all();
        let processor = fx.processor(RollupSettings {
            confirmation_timeout_ms: 0,
            ..settings()
        });

        let RollupOutcome::Submitted(record) = processor.aggregate(&fx.env()).unwrap() else {
            panic!("expected a submission");
        };
        // The transition lands by another route; our submission is still pending
        fx.chain.override_state(
            "docs",
            OnChainState {
                root: record.new_root,
                action_state: record.new_action_state,
            },
        );

        let RollupOutcome::Confirmed(confirmed) = processor.poll(&fx.env()).unwrap() else {
            panic!("expected the timed-out record to confirm");
        };
        assert_eq!(confirmed.id, record.id);
        assert_eq!(processor.checkpoint().sequence, Some(1));
        assert_eq!(processor.phase(), RollupPhase::Idle);

        // The pending submission now fails as stale and changes nothing
        fx.chain.settle();
        assert!(matches!(
            processor.step(&fx.env()).unwrap(),
            RollupOutcome::Idle
        ));
        assert_eq!(processor.checkpoint().sequence, Some(1));
        let statuses: Vec<_> = processor.history().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![RollupStatus::Confirmed]);
    }

    #[test]
    fn test_rejection_at_unchanged_checkpoint_backs_off() {
        let mut fx = Fixture::new();
        fx.insert(0, b"a");
        fx.insert(1, b"b");
        fx.prove_all();
        let genesis = fx.chain.current_state("docs").unwrap();
        let processor = fx.processor(RollupSettings {
            retry: RetryPolicy {
                max_attempts: 5,
                base_delay_ms: 60_000,
                max_delay_ms: 60_000,
                multiplier: 2.0,
            },
            ..RollupSettings::default()
        });
        processor.aggregate(&fx.env()).unwrap();

        // The contract moves while the batch is pending, so the batch is
        // rejected as stale, then the contract moves back
        let elsewhere = fx.ledger.log().checkpoint_at(Some(0)).unwrap();
        fx.chain.override_state(
            "docs",
            OnChainState {
                root: elsewhere.root,
                action_state: elsewhere.action_state,
            },
        );
        fx.chain.settle();
        fx.chain.override_state("docs", genesis);

        let RollupOutcome::Repaired {
            checkpoint,
            resubmitted: None,
        } = processor.poll(&fx.env()).unwrap()
        else {
            panic!("expected a repair that does not resubmit");
        };
        assert_eq!(checkpoint.sequence, None);
        assert!(matches!(
            processor.step(&fx.env()).unwrap(),
            RollupOutcome::BackingOff { .. }
        ));
        assert_eq!(processor.phase(), RollupPhase::Idle);
    }

    /// Records, at every chain call, whether the processor lock was free
    struct WatchingChain<'a> {
        inner: &'a LocalChain,
        processor: &'a RollupProcessor,
        lock_free: Mutex<Vec<bool>>,
    }

    impl WatchingChain<'_> {
        fn note(&self) {
            let free = self.processor.state.try_lock().is_some();
            self.lock_free.lock().push(free);
        }
    }

    impl ChainClient for WatchingChain<'_> {
        fn deploy(&self, collection: &str, genesis_root: Hash) -> Result<()> {
            self.inner.deploy(collection, genesis_root)
        }

        fn submit(&self, record: &RollupRecord) -> Result<SubmissionHandle> {
            self.note();
            self.inner.submit(record)
        }

        fn query_confirmation(&self, handle: &SubmissionHandle) -> Result<Confirmation> {
            self.note();
            self.inner.query_confirmation(handle)
        }

        fn current_state(&self, collection: &str) -> Result<OnChainState> {
            self.note();
            self.inner.current_state(collection)
        }
    }

    #[test]
    fn test_chain_calls_run_without_processor_lock() {
        let mut fx = Fixture::new();
        fx.insert(0, b"a");
        fx.prove_all();
        let processor = fx.processor(RollupSettings {
            confirmation_timeout_ms: 0,
            ..settings()
        });
        let chain = WatchingChain {
            inner: &fx.chain,
            processor: &processor,
            lock_free: Mutex::new(Vec::new()),
        };
        let env = RollupEnv {
            history: fx.ledger.log(),
            queue: &fx.queue,
            prover: &fx.prover,
            chain: &chain,
        };

        processor.aggregate(&env).unwrap();
        // Timed out with the chain unchanged: query, state read, resubmit
        assert!(matches!(
            processor.poll(&env).unwrap(),
            RollupOutcome::Repaired {
                resubmitted: Some(_),
                ..
            }
        ));
        // The duplicate is rejected: query, state read
        fx.chain.settle();
        processor.poll(&env).unwrap();

        let calls = chain.lock_free.lock().clone();
        assert!(calls.len() >= 5, "only {} chain calls seen", calls.len());
        assert!(calls.iter().all(|free| *free));
    }
}
