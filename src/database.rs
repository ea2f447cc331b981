//! High-level Database API
//!
//! The database owns the storage backend, the configuration and the
//! prover/chain handles, and keeps a registry of open collections. Every
//! state change is written back to the backend before the call returns.
//!
//! Each collection is stored as one key per item, so a save writes only
//! what changed:
//! ```text
//! {name}/meta
//! {name}/rollup
//! {name}/nodes/{level}/{index}
//! {name}/log/{sequence}
//! {name}/documents/{index}
//! {name}/tasks/{id}
//! __contracts__/{name}          next contract generation for the name
//! ```

use crate::chain::{ChainClient, LocalChain, OnChainState};
use crate::collection::{Collection, CollectionChanges, CollectionMeta, CollectionSnapshot, CollectionStatus};
use crate::config::Config;
use crate::log::LogEntry;
use crate::merkle::{MerkleStore, MerkleWitness};
use crate::model::{genesis_action_state, ActionKind, Hash, Task, TaskId};
use crate::prover::{MockProver, Prover};
use crate::rollup::{RollupOutcome, RollupPhase};
use crate::store::{open_backend, Backend, Blob, BlobType, MemoryBackend};
use crate::worker::process_one;
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const META: &str = "meta";
const NODES: &str = "nodes";
const LOG: &str = "log";
const DOCUMENTS: &str = "documents";
const TASKS: &str = "tasks";
const ROLLUP: &str = "rollup";
const CONTRACTS: &str = "__contracts__";

/// Key prefix reserved for non-collection state
pub const RESERVED_PREFIX: &str = "__";

fn key(collection: &str, part: &str) -> String {
    format!("{}/{}", collection, part)
}

fn item_key(collection: &str, part: &str, item: u64) -> String {
    format!("{}/{}/{}", collection, part, item)
}

fn node_key(collection: &str, level: u8, index: u64) -> String {
    format!("{}/{}/{}/{}", collection, NODES, level, index)
}

/// Contract of the `generation`-th collection created under `name`
fn contract_id(name: &str, generation: u64) -> String {
    if generation == 0 {
        name.to_string()
    } else {
        format!("{}#{}", name, generation)
    }
}

fn parse_part<T: FromStr>(key: &str, part: &str) -> Result<T> {
    part.parse()
        .map_err(|_| Error::Corruption(format!("malformed key {}", key)))
}

/// The main database interface
pub struct Database {
    config: Config,
    backend: Box<dyn Backend>,
    prover: Arc<dyn Prover>,
    chain: Arc<dyn ChainClient>,
    collections: RwLock<BTreeMap<String, Arc<Collection>>>,
    /// Collections whose persisted state failed to load, with the reason
    quarantined: RwLock<BTreeMap<String, String>>,
}

impl Database {
    /// Open the backend named by `config` and load every collection in it
    pub fn open(config: Config, prover: Arc<dyn Prover>, chain: Arc<dyn ChainClient>) -> Result<Self> {
        config.validate()?;
        let backend = open_backend(&config)?;
        Self::with_backend(config, backend, prover, chain)
    }

    /// In-memory database with the mock prover and an auto-settling chain
    pub fn in_memory() -> Result<Self> {
        Self::with_backend(
            Config::in_memory(),
            Box::new(MemoryBackend::new()),
            Arc::new(MockProver::new()),
            Arc::new(LocalChain::auto_settling()),
        )
    }

    /// Load every collection found in `backend`
    ///
    /// A collection whose state cannot be trusted is quarantined and
    /// logged; the others open normally. Only I/O failures abort.
    pub fn with_backend(
        config: Config,
        backend: Box<dyn Backend>,
        prover: Arc<dyn Prover>,
        chain: Arc<dyn ChainClient>,
    ) -> Result<Self> {
        let db = Database {
            config,
            backend,
            prover,
            chain,
            collections: RwLock::new(BTreeMap::new()),
            quarantined: RwLock::new(BTreeMap::new()),
        };

        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in db.backend.keys() {
            if let Some((name, _)) = key.split_once('/') {
                if !name.starts_with(RESERVED_PREFIX) {
                    grouped.entry(name.to_string()).or_default().push(key);
                }
            }
        }

        for (name, keys) in grouped {
            match db.load_collection(&name, &keys) {
                Ok(collection) => {
                    let genesis = collection.with_ledger(|l| l.log().root_at(None))?;
                    db.chain.deploy(collection.contract(), genesis)?;
                    // Tasks requeued or discarded on load
                    db.save(&collection)?;
                    info!(collection = %name, actions = collection.action_count(), "collection loaded");
                    db.collections.write().insert(name, Arc::new(collection));
                }
                Err(Error::Io(e)) => return Err(Error::Io(e)),
                Err(e) => {
                    error!(collection = %name, error = %e, "collection quarantined");
                    db.quarantined.write().insert(name, e.to_string());
                }
            }
        }
        Ok(db)
    }

    fn load_collection(&self, name: &str, keys: &[String]) -> Result<Collection> {
        let meta: CollectionMeta = self.read(&key(name, META), BlobType::Meta)?;
        if meta.name != name {
            return Err(Error::Corruption(format!(
                "metadata under {} names collection {}",
                name, meta.name
            )));
        }
        if meta.height > self.config.max_height {
            return Err(Error::HeightMismatch {
                persisted: meta.height,
                expected: self.config.max_height,
            });
        }

        let mut nodes = Vec::new();
        let mut entries = Vec::new();
        let mut documents = BTreeMap::new();
        let mut tasks = Vec::new();
        for key in keys {
            let parts: Vec<&str> = key.split('/').skip(1).collect();
            match parts.as_slice() {
                [META] | [ROLLUP] => {}
                [NODES, level, index] => {
                    let hash: Hash = self.read(key, BlobType::Nodes)?;
                    nodes.push((parse_part(key, level)?, parse_part(key, index)?, hash));
                }
                [LOG, sequence] => {
                    let entry: LogEntry = self.read(key, BlobType::Log)?;
                    if entry.action.sequence != parse_part::<u64>(key, sequence)? {
                        return Err(Error::Corruption(format!("{} holds another action", key)));
                    }
                    entries.push(entry);
                }
                [DOCUMENTS, index] => {
                    let payload: Vec<u8> = self.read(key, BlobType::Documents)?;
                    documents.insert(parse_part(key, index)?, payload);
                }
                [TASKS, id] => {
                    let task: Task = self.read(key, BlobType::Tasks)?;
                    if task.id.0 != parse_part::<u64>(key, id)? {
                        return Err(Error::Corruption(format!("{} holds another task", key)));
                    }
                    tasks.push(task);
                }
                _ => return Err(Error::Corruption(format!("unexpected key {}", key))),
            }
        }

        let snapshot = CollectionSnapshot {
            meta,
            nodes,
            entries,
            documents,
            tasks,
            rollup: self.read(&key(name, ROLLUP), BlobType::Rollup)?,
        };
        Collection::restore(snapshot, &self.config)
    }

    fn read<T: DeserializeOwned>(&self, key: &str, blob_type: BlobType) -> Result<T> {
        self.backend
            .get(key)?
            .ok_or_else(|| Error::Corruption(format!("missing {}", key)))?
            .decode(blob_type)
    }

    fn put<T: serde::Serialize>(&self, key: &str, blob_type: BlobType, value: &T) -> Result<()> {
        self.backend.put(key, &Blob::encode(blob_type, value)?)
    }

    /// Write what changed in a collection since its last save
    fn save(&self, collection: &Collection) -> Result<()> {
        collection.persist_with(|changes| self.write_changes(collection.name(), changes))
    }

    fn write_changes(&self, name: &str, changes: &CollectionChanges) -> Result<()> {
        if let Some(meta) = &changes.meta {
            self.put(&key(name, META), BlobType::Meta, meta)?;
        }
        for (level, index, hash) in &changes.nodes {
            let key = node_key(name, *level, *index);
            match hash {
                Some(hash) => self.put(&key, BlobType::Nodes, hash)?,
                None => {
                    self.backend.remove(&key)?;
                }
            }
        }
        for entry in &changes.entries {
            self.put(&item_key(name, LOG, entry.action.sequence), BlobType::Log, entry)?;
        }
        for (index, payload) in &changes.documents {
            let key = item_key(name, DOCUMENTS, *index);
            match payload {
                Some(payload) => self.put(&key, BlobType::Documents, payload)?,
                None => {
                    self.backend.remove(&key)?;
                }
            }
        }
        for task in &changes.tasks.written {
            self.put(&item_key(name, TASKS, task.id.0), BlobType::Tasks, task)?;
        }
        for id in &changes.tasks.removed {
            self.backend.remove(&item_key(name, TASKS, id.0))?;
        }
        if let Some(rollup) = &changes.rollup {
            self.put(&key(name, ROLLUP), BlobType::Rollup, rollup)?;
        }
        Ok(())
    }

    /// Save after a change the caller already made in memory
    fn save_applied(&self, collection: &Collection, sequence: u64) -> Result<()> {
        self.save(collection).map_err(|e| {
            warn!(collection = %collection.name(), sequence, error = %e, "action applied but not saved");
            Error::NotPersisted {
                sequence,
                source: Box::new(e),
            }
        })
    }

    /// Pick the contract for a new collection named `name`: the next
    /// generation whose contract is new or still at genesis. A dropped
    /// collection's contract keeps its settled state, so it is never
    /// reused.
    fn claim_contract(&self, name: &str, genesis_root: Hash) -> Result<String> {
        let counter = key(CONTRACTS, name);
        let mut generation: u64 = match self.backend.get(&counter)? {
            Some(blob) => blob.decode(BlobType::Meta)?,
            None => 0,
        };
        let genesis = OnChainState {
            root: genesis_root,
            action_state: genesis_action_state(),
        };
        loop {
            let contract = contract_id(name, generation);
            self.chain.deploy(&contract, genesis_root)?;
            if self.chain.current_state(&contract)? == genesis {
                self.put(&counter, BlobType::Meta, &(generation + 1))?;
                return Ok(contract);
            }
            debug!(collection = %name, %contract, "contract already advanced, trying the next generation");
            generation += 1;
        }
    }

    /// Remove every stored key of a collection
    fn remove_keys(&self, name: &str) -> Result<()> {
        let prefix = format!("{}/", name);
        for key in self.backend.keys() {
            if key.starts_with(&prefix) {
                self.backend.remove(&key)?;
            }
        }
        Ok(())
    }

    // === Collections ===

    /// Create a collection; `height` defaults to the configured one
    pub fn create_collection(&self, name: &str, height: Option<u8>) -> Result<Arc<Collection>> {
        if name.is_empty()
            || name.contains(['/', '#'])
            || name.starts_with(RESERVED_PREFIX)
        {
            return Err(Error::Config(format!("invalid collection name: {:?}", name)));
        }
        let height = height.unwrap_or(self.config.default_height);

        let mut collections = self.collections.write();
        if collections.contains_key(name) || self.quarantined.read().contains_key(name) {
            return Err(Error::CollectionExists(name.to_string()));
        }

        // Validates the height before a contract is claimed
        let genesis_root = MerkleStore::create(height, self.config.max_height)?.empty_root();
        let contract = self.claim_contract(name, genesis_root)?;
        let collection = Arc::new(Collection::with_contract(
            name,
            contract.clone(),
            height,
            &self.config,
        )?);
        self.save(&collection)?;
        collections.insert(name.to_string(), collection.clone());

        info!(collection = %name, height, %contract, "collection created");
        Ok(collection)
    }

    /// Drop a collection and its persisted state, cancelling its tasks.
    /// Refused while a rollup is in flight.
    ///
    /// Holders of the collection's handle can still read it, but nothing
    /// they change is saved afterwards.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let mut collections = self.collections.write();
        if let Some(collection) = collections.get(name).cloned() {
            if collection.processor().phase() != RollupPhase::Idle {
                return Err(Error::RollupAlreadyInFlight(name.to_string()));
            }
            collection.queue().cancel_all();
            collections.remove(name);
            collection.retire(|| self.remove_keys(name))?;
        } else if self.quarantined.write().remove(name).is_some() {
            self.remove_keys(name)?;
        } else {
            return Err(Error::CollectionNotFound(name.to_string()));
        }

        info!(collection = %name, "collection dropped");
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Names of open collections
    pub fn collections(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Collections that failed to load, with the reason
    pub fn quarantined(&self) -> Vec<(String, String)> {
        self.quarantined
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // === Documents ===

    /// Insert, update or delete the document at `index`
    ///
    /// The mutation is applied in memory first and then saved. When the
    /// save fails the call returns [`Error::NotPersisted`]: the action keeps
    /// its sequence number and proof task, and the next successful save of
    /// the collection writes it. A mutation rejected by validation changes
    /// nothing.
    pub fn mutate(&self, name: &str, index: u64, kind: ActionKind, payload: &[u8]) -> Result<Task> {
        let collection = self.collection(name)?;
        let task = collection.mutate(index, kind, payload)?;
        self.save_applied(&collection, task.sequence())?;
        Ok(task)
    }

    /// Mutate only if the action would receive sequence `expected`; saving
    /// behaves as in [`mutate`](Self::mutate)
    pub fn mutate_expecting(
        &self,
        name: &str,
        expected: u64,
        index: u64,
        kind: ActionKind,
        payload: &[u8],
    ) -> Result<Task> {
        let collection = self.collection(name)?;
        let task = collection.mutate_expecting(expected, index, kind, payload)?;
        self.save_applied(&collection, task.sequence())?;
        Ok(task)
    }

    pub fn insert(&self, name: &str, index: u64, payload: &[u8]) -> Result<Task> {
        self.mutate(name, index, ActionKind::Insert, payload)
    }

    pub fn update(&self, name: &str, index: u64, payload: &[u8]) -> Result<Task> {
        self.mutate(name, index, ActionKind::Update, payload)
    }

    pub fn delete(&self, name: &str, index: u64) -> Result<Task> {
        self.mutate(name, index, ActionKind::Delete, &[])
    }

    pub fn get(&self, name: &str, index: u64) -> Result<Option<Vec<u8>>> {
        self.collection(name)?.document(index)
    }

    pub fn root(&self, name: &str) -> Result<Hash> {
        Ok(self.collection(name)?.root())
    }

    /// Leaf value at `index` and its witness against the current root
    pub fn witness(&self, name: &str, index: u64) -> Result<(Hash, MerkleWitness)> {
        self.collection(name)?.witness(index)
    }

    // === Pipeline ===

    /// Prove the next eligible task of a collection, if any
    pub fn prove_next(&self, name: &str, timeout: Option<Duration>) -> Result<Option<Task>> {
        let collection = self.collection(name)?;
        let task = process_one(&collection, self.prover.as_ref(), timeout)?;
        if task.is_some() {
            self.save(&collection)?;
        }
        Ok(task)
    }

    /// Prove every currently eligible task; returns how many were handled
    pub fn prove_pending(&self, name: &str) -> Result<usize> {
        let mut handled = 0;
        while self.prove_next(name, None)?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    /// One rollup processor step. State is saved even when the step fails.
    pub fn rollup_step(&self, name: &str) -> Result<RollupOutcome> {
        let collection = self.collection(name)?;
        let outcome = collection.rollup_step(self.prover.as_ref(), self.chain.as_ref());
        if let Err(e) = self.save(&collection) {
            warn!(collection = %name, error = %e, "failed to save rollup state");
            outcome?;
            return Err(e);
        }
        outcome
    }

    /// Operator action: give a failed task a fresh retry budget
    pub fn retry_task(&self, name: &str, task: TaskId) -> Result<()> {
        let collection = self.collection(name)?;
        collection.queue().retry_failed(task)?;
        self.save(&collection)
    }

    pub fn cancel_task(&self, name: &str, task: TaskId) -> Result<()> {
        let collection = self.collection(name)?;
        collection.queue().cancel(task)?;
        self.save(&collection)
    }

    pub fn status(&self, name: &str) -> Result<CollectionStatus> {
        Ok(self.collection(name)?.status())
    }

    pub fn statuses(&self) -> Vec<CollectionStatus> {
        self.collections
            .read()
            .values()
            .map(|c| c.status())
            .collect()
    }

    // === Handles ===

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn prover(&self) -> &Arc<dyn Prover> {
        &self.prover
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    /// Make all saved state durable
    pub fn sync(&self) -> Result<()> {
        self.backend.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::verify_witness;
    use crate::model::TaskStatus;
    use crate::store::FileBackend;
    use tempfile::tempdir;

    fn file_db(path: &std::path::Path, chain: Arc<LocalChain>) -> Database {
        Database::with_backend(
            Config::in_memory(),
            Box::new(FileBackend::open_or_create(path).unwrap()),
            Arc::new(MockProver::new()),
            chain,
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_drop() {
        let db = Database::in_memory().unwrap();
        db.create_collection("docs", Some(8)).unwrap();
        assert!(matches!(
            db.create_collection("docs", None),
            Err(Error::CollectionExists(_))
        ));
        assert!(matches!(
            db.create_collection("a/b", None),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            db.create_collection("__chain__", None),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            db.create_collection("tall", Some(60)),
            Err(Error::InvalidHeight { .. })
        ));
        assert_eq!(db.collections(), vec!["docs"]);
        assert_eq!(db.collection("docs").unwrap().height(), 8);

        db.insert("docs", 0, b"x").unwrap();
        db.drop_collection("docs").unwrap();
        assert!(db.collections().is_empty());
        assert_eq!(db.backend().keys(), vec!["__contracts__/docs"]);
        assert!(matches!(
            db.drop_collection("docs"),
            Err(Error::CollectionNotFound(_))
        ));
    }

    #[test]
    fn test_drop_refused_while_in_flight() {
        let chain = Arc::new(LocalChain::new());
        let db = Database::with_backend(
            Config::in_memory(),
            Box::new(MemoryBackend::new()),
            Arc::new(MockProver::new()),
            chain.clone(),
        )
        .unwrap();
        db.create_collection("docs", Some(4)).unwrap();
        db.insert("docs", 1, b"a").unwrap();
        db.prove_pending("docs").unwrap();
        assert!(matches!(
            db.rollup_step("docs").unwrap(),
            RollupOutcome::Submitted(_)
        ));

        assert!(matches!(
            db.drop_collection("docs"),
            Err(Error::RollupAlreadyInFlight(_))
        ));
        chain.settle();
        db.rollup_step("docs").unwrap();
        db.drop_collection("docs").unwrap();
    }

    #[test]
    fn test_documents_and_witnesses() {
        let db = Database::in_memory().unwrap();
        db.create_collection("docs", Some(4)).unwrap();

        db.insert("docs", 3, b"hello").unwrap();
        db.update("docs", 3, b"world").unwrap();
        assert_eq!(db.get("docs", 3).unwrap(), Some(b"world".to_vec()));
        assert!(matches!(
            db.insert("docs", 3, b"again"),
            Err(Error::DocumentExists(3))
        ));

        let (leaf, witness) = db.witness("docs", 3).unwrap();
        assert!(verify_witness(&db.root("docs").unwrap(), &leaf, &witness));

        db.delete("docs", 3).unwrap();
        assert_eq!(db.get("docs", 3).unwrap(), None);
        assert!(matches!(
            db.delete("docs", 3),
            Err(Error::DocumentNotFound(3))
        ));
        assert!(matches!(
            db.get("missing", 0),
            Err(Error::CollectionNotFound(_))
        ));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.rollup");
        let chain = Arc::new(LocalChain::auto_settling());

        let root;
        {
            let db = file_db(&path, chain.clone());
            db.create_collection("docs", Some(6)).unwrap();
            db.insert("docs", 1, b"a").unwrap();
            db.insert("docs", 2, b"b").unwrap();
            db.prove_next("docs", None).unwrap();
            db.rollup_step("docs").unwrap();
            root = db.root("docs").unwrap();
            db.sync().unwrap();
        }

        let db = file_db(&path, chain);
        assert!(db.quarantined().is_empty());
        assert_eq!(db.root("docs").unwrap(), root);
        assert_eq!(db.get("docs", 2).unwrap(), Some(b"b".to_vec()));

        let status = db.status("docs").unwrap();
        assert_eq!(status.height, 6);
        assert_eq!(status.pending_action_count, 2);
        let collection = db.collection("docs").unwrap();
        assert_eq!(
            collection.queue().task_for_sequence(0).unwrap().status,
            TaskStatus::Proved
        );
        assert!(matches!(
            db.rollup_step("docs").unwrap(),
            RollupOutcome::Confirmed(_)
        ));
    }

    #[test]
    fn test_corrupt_collection_is_quarantined() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.rollup");
        let chain = Arc::new(LocalChain::auto_settling());

        {
            let db = file_db(&path, chain.clone());
            db.create_collection("good", Some(4)).unwrap();
            db.create_collection("bad", Some(4)).unwrap();
            db.insert("good", 0, b"a").unwrap();
            db.insert("bad", 0, b"a").unwrap();
            // A stored document that no longer matches the stored tree
            let forged = b"forged".to_vec();
            db.backend()
                .put("bad/documents/0", &Blob::encode(BlobType::Documents, &forged).unwrap())
                .unwrap();
            db.sync().unwrap();
        }

        let db = file_db(&path, chain);
        assert_eq!(db.collections(), vec!["good"]);
        let quarantined = db.quarantined();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].0, "bad");
        assert!(matches!(
            db.create_collection("bad", None),
            Err(Error::CollectionExists(_))
        ));
        db.drop_collection("bad").unwrap();
        assert!(db.quarantined().is_empty());
    }

    #[test]
    fn test_height_above_configured_maximum_is_quarantined() {
        let backend = MemoryBackend::new();
        let meta = CollectionMeta {
            name: "docs".into(),
            height: 40,
            contract: "docs".into(),
        };
        backend
            .put("docs/meta", &Blob::encode(BlobType::Meta, &meta).unwrap())
            .unwrap();

        let db = Database::with_backend(
            Config::in_memory(),
            Box::new(backend),
            Arc::new(MockProver::new()),
            Arc::new(LocalChain::new()),
        )
        .unwrap();
        assert!(db.collections().is_empty());
        assert!(db.quarantined()[0].1.contains("Height mismatch"));
    }

    #[test]
    fn test_interrupted_proof_is_requeued_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.rollup");
        let chain = Arc::new(LocalChain::new());

        {
            let db = file_db(&path, chain.clone());
            db.create_collection("docs", Some(4)).unwrap();
            db.insert("docs", 0, b"a").unwrap();
            // A worker takes the task and the process dies before it reports
            db.collection("docs").unwrap().queue().dequeue_next(None).unwrap();
            let collection = db.collection("docs").unwrap();
            db.save(&collection).unwrap();
        }

        let db = file_db(&path, chain);
        let task = db
            .collection("docs")
            .unwrap()
            .queue()
            .task_for_sequence(0)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(db.prove_pending("docs").unwrap(), 1);
    }

    #[test]
    fn test_gap_in_stored_log_is_quarantined() {
        let backend = MemoryBackend::new();
        let db = Database::with_backend(
            Config::in_memory(),
            Box::new(backend),
            Arc::new(MockProver::new()),
            Arc::new(LocalChain::new()),
        )
        .unwrap();
        db.create_collection("docs", Some(4)).unwrap();
        for i in 0..3 {
            db.insert("docs", i, b"x").unwrap();
        }
        db.backend().remove("docs/log/1").unwrap();

        let keys = db.backend().keys();
        let backend = MemoryBackend::new();
        for key in keys {
            backend.put(&key, &db.backend().get(&key).unwrap().unwrap()).unwrap();
        }
        let reopened = Database::with_backend(
            Config::in_memory(),
            Box::new(backend),
            Arc::new(MockProver::new()),
            Arc::new(LocalChain::new()),
        )
        .unwrap();
        assert!(reopened.collections().is_empty());
        assert_eq!(reopened.quarantined()[0].0, "docs");
    }

    #[test]
    fn test_per_mutation_writes_stay_bounded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.rollup");
        let db = file_db(&path, Arc::new(LocalChain::new()));
        db.create_collection("docs", Some(20)).unwrap();
        let file_len = || std::fs::metadata(&path).unwrap().len();

        let mut growth = Vec::new();
        for i in 0..400u64 {
            let before = file_len();
            db.insert("docs", i * 2477 % (1 << 20), &i.to_le_bytes()).unwrap();
            growth.push(file_len() - before);
        }

        // One path of 21 nodes, one entry, one document and one task,
        // however long the history already is
        let early = growth[..10].iter().max().copied().unwrap();
        let late = growth[390..].iter().max().copied().unwrap();
        assert!(late < 16 * 1024, "one insert wrote {} bytes", late);
        assert!(late <= early + 1024, "writes grew from {} to {} bytes", early, late);
    }

    #[test]
    fn test_incremental_state_survives_reopen_with_deletes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.rollup");
        let chain = Arc::new(LocalChain::auto_settling());

        let root;
        {
            let db = file_db(&path, chain.clone());
            db.create_collection("docs", Some(8)).unwrap();
            for i in 0..20 {
                db.insert("docs", i, format!("doc {}", i).as_bytes()).unwrap();
            }
            for i in (0..20).step_by(3) {
                db.delete("docs", i).unwrap();
            }
            db.update("docs", 1, b"new").unwrap();
            db.prove_pending("docs").unwrap();
            db.rollup_step("docs").unwrap();
            root = db.root("docs").unwrap();
            db.sync().unwrap();
        }

        let db = file_db(&path, chain);
        assert!(db.quarantined().is_empty());
        assert_eq!(db.root("docs").unwrap(), root);
        assert_eq!(db.get("docs", 3).unwrap(), None);
        assert_eq!(db.get("docs", 1).unwrap(), Some(b"new".to_vec()));
        let collection = db.collection("docs").unwrap();
        assert_eq!(collection.recompute_root(), root);
        assert_eq!(collection.action_count(), 28);
        assert!(db
            .backend()
            .keys()
            .iter()
            .all(|k| !k.starts_with("docs/documents/3")));
    }

    #[test]
    fn test_recreated_collection_settles_to_a_fresh_contract() {
        let chain = Arc::new(LocalChain::new());
        let db = Database::with_backend(
            Config::in_memory(),
            Box::new(MemoryBackend::new()),
            Arc::new(MockProver::new()),
            chain.clone(),
        )
        .unwrap();

        let settle_one = |payload: &[u8]| {
            db.insert("docs", 1, payload).unwrap();
            db.prove_pending("docs").unwrap();
            assert!(matches!(
                db.rollup_step("docs").unwrap(),
                RollupOutcome::Submitted(_)
            ));
            chain.settle();
            assert!(matches!(
                db.rollup_step("docs").unwrap(),
                RollupOutcome::Confirmed(_)
            ));
        };

        db.create_collection("docs", Some(4)).unwrap();
        settle_one(b"first life");
        let first = chain.current_state("docs").unwrap();
        db.drop_collection("docs").unwrap();

        let again = db.create_collection("docs", Some(4)).unwrap();
        assert_eq!(again.contract(), "docs#1");
        settle_one(b"second life");

        // The old contract keeps what it settled
        assert_eq!(chain.current_state("docs").unwrap(), first);
        assert_eq!(
            chain.current_state("docs#1").unwrap().root,
            db.root("docs").unwrap()
        );
        assert!(matches!(
            db.create_collection("a#1", None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_save_after_drop_does_not_resurrect() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.rollup");
        let chain = Arc::new(LocalChain::new());

        {
            let db = file_db(&path, chain.clone());
            db.create_collection("docs", Some(4)).unwrap();
            db.insert("docs", 0, b"a").unwrap();

            // Another thread still holds the handle when the collection goes
            let held = db.collection("docs").unwrap();
            db.drop_collection("docs").unwrap();
            held.mutate(1, ActionKind::Insert, b"late").unwrap();
            assert!(matches!(
                db.save(&held),
                Err(Error::CollectionNotFound(_))
            ));
            assert!(db.backend().keys().iter().all(|k| !k.starts_with("docs/")));
            db.sync().unwrap();
        }

        let db = file_db(&path, chain);
        assert!(db.collections().is_empty());
        assert!(db.quarantined().is_empty());
    }

    /// Memory backend whose writes can be switched off
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyBackend {
        fn check(&self) -> Result<()> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk unavailable",
                )));
            }
            Ok(())
        }
    }

    impl Backend for Arc<FlakyBackend> {
        fn put(&self, key: &str, blob: &Blob) -> Result<()> {
            self.check()?;
            self.inner.put(key, blob)
        }

        fn get(&self, key: &str) -> Result<Option<Blob>> {
            self.inner.get(key)
        }

        fn exists(&self, key: &str) -> bool {
            self.inner.exists(key)
        }

        fn keys(&self) -> Vec<String> {
            self.inner.keys()
        }

        fn remove(&self, key: &str) -> Result<bool> {
            self.check()?;
            self.inner.remove(key)
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unsaved_mutation_is_reported_and_written_later() {
        use std::sync::atomic::Ordering;

        let backend = Arc::new(FlakyBackend::default());
        let db = Database::with_backend(
            Config::in_memory(),
            Box::new(backend.clone()),
            Arc::new(MockProver::new()),
            Arc::new(LocalChain::new()),
        )
        .unwrap();
        db.create_collection("docs", Some(4)).unwrap();

        backend.failing.store(true, Ordering::SeqCst);
        let err = db.insert("docs", 2, b"kept").unwrap_err();
        assert!(matches!(err, Error::NotPersisted { sequence: 0, .. }));
        // Applied in memory regardless
        assert_eq!(db.get("docs", 2).unwrap(), Some(b"kept".to_vec()));
        assert!(!backend.exists("docs/log/0"));

        backend.failing.store(false, Ordering::SeqCst);
        db.insert("docs", 3, b"next").unwrap();
        assert!(backend.exists("docs/log/0"));
        assert!(backend.exists("docs/documents/2"));
        assert!(backend.exists("docs/tasks/0"));
    }
}
