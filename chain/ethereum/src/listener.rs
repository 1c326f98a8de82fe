use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use slog::{debug, warn, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use seine::prelude::{
    BlockParts, Entity, Error, EthereumAdapter, ProviderError, StoreError, StoreKey,
};
use seine::util::queue::PendingQueue;

use crate::engine::Engine;
use crate::migrations::MigrationsIndex;
use crate::staging::StagingCache;

/// Reads the staged parts of one block back from disk. Handed to the
/// dispatcher through a deferred channel that resolves only once the staging
/// write completed, so the data is written-before-read.
pub struct StagedReader {
    staging: Arc<StagingCache>,
    chain_id: u64,
    number: u64,
}

impl StagedReader {
    pub async fn read(&self) -> Result<BlockParts, Error> {
        self.staging
            .read_block_and_receipts(self.chain_id, self.number)
            .await
    }
}

/// Entity snapshots pre-fetched for migrations scheduled at a block, keyed
/// by entity ref and block number. The fetches run alongside staging; the
/// dispatcher resolves them right before the handlers run.
pub type EntityPrefetch = HashMap<String, HashMap<u64, JoinHandle<Result<Vec<Entity>, StoreError>>>>;

/// One enqueued block. Enqueueing is cheap: the entry carries futures of
/// the staged data, never the data itself.
pub struct QueueEntry {
    pub chain_id: u64,
    pub number: u64,
    pub parts_rx: oneshot::Receiver<StagedReader>,
    pub async_entities: EntityPrefetch,
}

/// Per-chain subscription to new block numbers. Every observed number
/// becomes a queue entry with freshly spawned staging and migration
/// prefetch futures.
pub struct BlockListener {
    engine: Arc<Engine>,
    adapter: Arc<dyn EthereumAdapter>,
    staging: Arc<StagingCache>,
    migrations: Arc<MigrationsIndex>,
    queue: Arc<PendingQueue<QueueEntry>>,
    chain_id: u64,
    logger: Logger,
}

impl BlockListener {
    pub fn new(
        logger: Logger,
        engine: Arc<Engine>,
        adapter: Arc<dyn EthereumAdapter>,
        staging: Arc<StagingCache>,
        migrations: Arc<MigrationsIndex>,
        queue: Arc<PendingQueue<QueueEntry>>,
    ) -> Self {
        let chain_id = adapter.chain_id();
        BlockListener {
            engine,
            adapter,
            staging,
            migrations,
            queue,
            chain_id,
            logger,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// The subscription callback: ignored unless the engine is listening.
    pub fn on_block(&self, number: u64) {
        if !self.engine.is_listening() {
            return;
        }
        self.record_listener_block(number);
    }

    /// Enqueue a block: kick off the migration entity prefetch and the
    /// staging write, then append the entry.
    pub fn record_listener_block(&self, number: u64) {
        self.queue.push_back(self.make_entry(number));
    }

    /// Re-enqueue a block at the head of the queue with freshly issued
    /// staging futures, so it is retried before any successor.
    pub fn restack_entry(&self, number: u64) {
        self.queue.push_front(self.make_entry(number));
    }

    fn make_entry(&self, number: u64) -> QueueEntry {
        let mut async_entities: EntityPrefetch = HashMap::new();
        for migration in self.migrations.at(self.chain_id, number) {
            let db = self.engine.db.clone();
            let entity_ref = migration.entity.clone();
            let handle = tokio::spawn(async move {
                match db.get(&StoreKey::collection(entity_ref)).await {
                    Ok(value) => Ok(value.entities()),
                    Err(e) if e.is_not_found() => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            });
            async_entities
                .entry(migration.entity.clone())
                .or_default()
                .insert(number, handle);
        }

        let (parts_tx, parts_rx) = oneshot::channel();
        let staging = self.staging.clone();
        let adapter = self.adapter.clone();
        let logger = self.logger.clone();
        let chain_id = self.chain_id;
        let concurrency = self.engine.concurrency;
        tokio::spawn(async move {
            match staging
                .save_block_and_receipts(&adapter, chain_id, number, concurrency)
                .await
            {
                Ok(_) => {
                    // The artefact is on disk before the reader resolves.
                    let _ = parts_tx.send(StagedReader {
                        staging,
                        chain_id,
                        number,
                    });
                }
                // Dropping the sender tells the dispatcher the block is
                // incomplete; it restacks.
                Err(e) => {
                    warn!(logger, "Failed to stage block";
                        "chain_id" => chain_id, "number" => number, "error" => %e);
                }
            }
        });

        QueueEntry {
            chain_id,
            number,
            parts_rx,
            async_entities,
        }
    }

    /// Consume the provider's block subscription. Fatal error classes are
    /// forwarded to `reject` exactly once; timeouts are swallowed; anything
    /// else is logged and ignored.
    pub fn spawn_subscription(
        self: &Arc<Self>,
        reject: mpsc::Sender<ProviderError>,
    ) -> JoinHandle<()> {
        let listener = self.clone();
        tokio::spawn(async move {
            let mut stream = match listener.adapter.subscribe_new_blocks().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = reject.try_send(e);
                    return;
                }
            };

            while let Some(item) = stream.next().await {
                match item {
                    Ok(number) => listener.on_block(number),
                    Err(e) if e.is_fatal() => {
                        let _ = reject.try_send(e);
                        return;
                    }
                    Err(ProviderError::Timeout) => {
                        debug!(listener.logger, "Swallowing provider timeout");
                    }
                    Err(e) => {
                        warn!(listener.logger, "Ignoring provider error"; "error" => %e);
                    }
                }
            }
        })
    }
}
