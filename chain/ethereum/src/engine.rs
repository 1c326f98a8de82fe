use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use slog::Logger;
use tokio::task::JoinHandle;

use seine::prelude::{
    ChainHead, EngineFlags, Error, MetaEntity, Store, StoreError, SyncOp, ENV_VARS,
};

/// Tunables the engine is built with. Defaults come from the environment.
pub struct EngineOptions {
    pub flags: EngineFlags,
    pub syncs: Vec<SyncOp>,
    /// First block each chain ingests; earlier listener events are no-ops.
    pub start_blocks: HashMap<u64, u64>,
    pub concurrency: usize,
    pub block_timeout: Duration,
    pub queue_poll_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            flags: EngineFlags::default(),
            syncs: Vec::new(),
            start_blocks: HashMap::new(),
            concurrency: ENV_VARS.concurrency,
            block_timeout: ENV_VARS.block_timeout,
            queue_poll_interval: ENV_VARS.queue_poll_interval,
        }
    }
}

/// Process-wide coordination state: the last-processed block per chain, the
/// persisted `__meta__` cursors, the handle of the in-flight per-block
/// process, and the listening/in-sync toggles.
///
/// `latest_blocks`, `latest_entity` and `current_process` are only ever
/// mutated by the dispatcher; listeners just read the toggles.
pub struct Engine {
    pub db: std::sync::Arc<dyn Store>,
    pub flags: EngineFlags,
    pub syncs: Vec<SyncOp>,
    pub start_blocks: HashMap<u64, u64>,
    pub concurrency: usize,
    pub block_timeout: Duration,
    pub queue_poll_interval: Duration,
    pub current_process: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    latest_blocks: Mutex<HashMap<u64, ChainHead>>,
    latest_entity: Mutex<HashMap<u64, MetaEntity>>,
    listening: AtomicBool,
    in_sync: AtomicBool,
    logger: Logger,
}

impl Engine {
    pub fn new(logger: Logger, db: std::sync::Arc<dyn Store>, options: EngineOptions) -> Self {
        Engine {
            db,
            flags: options.flags,
            syncs: options.syncs,
            start_blocks: options.start_blocks,
            concurrency: options.concurrency,
            block_timeout: options.block_timeout,
            queue_poll_interval: options.queue_poll_interval,
            current_process: tokio::sync::Mutex::new(None),
            latest_blocks: Mutex::new(HashMap::new()),
            latest_entity: Mutex::new(HashMap::new()),
            listening: AtomicBool::new(false),
            in_sync: AtomicBool::new(true),
            logger,
        }
    }

    pub fn latest_block(&self, chain_id: u64) -> Option<u64> {
        self.latest_blocks
            .lock()
            .unwrap()
            .get(&chain_id)
            .map(|head| head.number)
    }

    pub fn start_block(&self, chain_id: u64) -> u64 {
        self.start_blocks.get(&chain_id).copied().unwrap_or(0)
    }

    /// The sync ops that apply to this block.
    pub fn valid_syncs(&self, chain_id: u64, number: u64) -> Vec<SyncOp> {
        self.syncs
            .iter()
            .filter(|sync| sync.is_valid_at(chain_id, number))
            .cloned()
            .collect()
    }

    /// Record a successfully processed block and persist the chain cursor.
    pub async fn advance(&self, chain_id: u64, number: u64) -> Result<(), StoreError> {
        self.latest_blocks
            .lock()
            .unwrap()
            .insert(chain_id, ChainHead { number });

        let meta = {
            let mut cursors = self.latest_entity.lock().unwrap();
            let meta = cursors
                .entry(chain_id)
                .or_insert_with(|| MetaEntity::new(chain_id, number));
            meta.number = number;
            meta.clone()
        };

        self.db
            .put(&MetaEntity::key(chain_id), meta.to_entity())
            .await
    }

    /// Take the persistent per-chain lock: read the `__meta__` cursor,
    /// refuse when another ingestor holds it, write it back locked, and seed
    /// the in-memory head from it.
    pub async fn acquire_chain_lock(&self, chain_id: u64) -> Result<(), Error> {
        let start = self.start_block(chain_id);
        let key = MetaEntity::key(chain_id);

        let cursor = match self.db.get(&key).await {
            Ok(value) => match value.into_one() {
                Some(entity) => Some(MetaEntity::from_entity(&entity)?),
                None => None,
            },
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let mut meta = cursor.unwrap_or_else(|| MetaEntity::new(chain_id, start.saturating_sub(1)));
        if meta.locked {
            bail!(
                "chain {} is locked by another ingestor; release the \
                 `__meta__` cursor before starting a second process",
                chain_id
            );
        }
        meta.locked = true;

        self.db.put(&key, meta.to_entity()).await?;

        self.latest_blocks.lock().unwrap().insert(
            chain_id,
            ChainHead {
                number: meta.number.max(start.saturating_sub(1)),
            },
        );
        self.latest_entity.lock().unwrap().insert(chain_id, meta);
        Ok(())
    }

    /// Release the persistent lock with a final save.
    pub async fn release_chain_lock(&self, chain_id: u64) -> Result<(), StoreError> {
        let meta = {
            let mut cursors = self.latest_entity.lock().unwrap();
            match cursors.get_mut(&chain_id) {
                Some(meta) => {
                    meta.locked = false;
                    meta.clone()
                }
                None => return Ok(()),
            }
        };

        slog::debug!(self.logger, "Releasing chain lock"; "chain_id" => chain_id);
        self.db
            .put(&MetaEntity::key(chain_id), meta.to_entity())
            .await
    }

    pub fn start_listening(&self) {
        self.listening.store(true, Ordering::SeqCst);
    }

    pub fn stop_listening(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn set_in_sync(&self, in_sync: bool) {
        self.in_sync.store(in_sync, Ordering::SeqCst);
    }

    pub fn is_in_sync(&self) -> bool {
        self.in_sync.load(Ordering::SeqCst)
    }
}
