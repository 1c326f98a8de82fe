use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Error};
use slog::{debug, error, info, warn, Logger};

use seine::prelude::{BlockProcessor, Entity, PartsHandle};
use seine::util::queue::PendingQueue;

use crate::engine::Engine;
use crate::listener::{BlockListener, QueueEntry};
use crate::staging::StagingCache;

/// The timeout arm of the per-block race: after `timeout`, set the
/// cancelled flag and release the staged data. The in-flight handler is
/// never aborted; it completes or throws naturally and the restack decides
/// the next attempt.
pub async fn cancel_listener_block_after_timeout(handle: Arc<PartsHandle>, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    handle.cancel();
}

/// The single consumer of the block queue. One block is in flight at a
/// time per engine; per chain, consumption is strictly ascending with gap
/// filling and restack-on-failure.
pub struct BlockDispatcher {
    engine: Arc<Engine>,
    queue: Arc<PendingQueue<QueueEntry>>,
    staging: Arc<StagingCache>,
    listeners: HashMap<u64, Arc<BlockListener>>,
    processor: Arc<dyn BlockProcessor>,
    logger: Logger,
}

impl BlockDispatcher {
    pub fn new(
        logger: Logger,
        engine: Arc<Engine>,
        queue: Arc<PendingQueue<QueueEntry>>,
        staging: Arc<StagingCache>,
        listeners: HashMap<u64, Arc<BlockListener>>,
        processor: Arc<dyn BlockProcessor>,
    ) -> Self {
        BlockDispatcher {
            engine,
            queue,
            staging,
            listeners,
            processor,
            logger,
        }
    }

    /// Run until the engine stops listening: consume the queue while it has
    /// entries and the engine is in sync, otherwise sleep and recheck.
    pub async fn run(self: Arc<Self>) {
        while self.engine.is_listening() {
            if self.engine.is_in_sync() && !self.queue.is_empty() {
                self.attempt_next_block().await;
            } else {
                tokio::time::sleep(self.engine.queue_poll_interval).await;
            }
        }
        debug!(self.logger, "Dispatcher stopped");
    }

    /// Take the head of the queue. A head that runs ahead of the chain
    /// cursor first gets the missing numbers synthesized through the same
    /// staging machinery and is retried behind them, so per-chain
    /// consumption never skips a number.
    pub async fn attempt_next_block(self: &Arc<Self>) {
        let entry = match self.queue.try_pop() {
            Some(entry) => entry,
            None => return,
        };

        if let Some(latest) = self.engine.latest_block(entry.chain_id) {
            if entry.number > latest + 1 {
                if let Some(listener) = self.listeners.get(&entry.chain_id) {
                    info!(self.logger, "Filling a block gap";
                        "chain_id" => entry.chain_id,
                        "from" => latest + 1,
                        "to" => entry.number - 1,
                    );
                    // The premature head goes back first; the missing
                    // numbers are then stacked in front of it in ascending
                    // order.
                    let chain_id = entry.chain_id;
                    let number = entry.number;
                    drop(entry);
                    listener.restack_entry(number);
                    for missing in (latest + 1..number).rev() {
                        listener.restack_entry(missing);
                    }
                    debug!(self.logger, "Gap fill enqueued"; "chain_id" => chain_id);
                    return;
                }
            }
        }

        let dispatcher = self.clone();
        let task = tokio::spawn(async move { dispatcher.process_block(entry).await });

        // The in-flight process is visible on the engine so a detach can
        // await it; holding the lock while awaiting is what serialises the
        // two.
        let mut current = self.engine.current_process.lock().await;
        *current = Some(task);
        if let Some(task) = current.as_mut() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(self.logger, "Block processing task failed"; "error" => %e);
                }
            }
        }
        *current = None;
    }

    async fn process_block(self: Arc<Self>, entry: QueueEntry) {
        let QueueEntry {
            chain_id,
            number,
            parts_rx,
            async_entities,
        } = entry;

        // Catchup replay belongs to the historical back-fill path, not the
        // listener.
        if number < self.engine.start_block(chain_id) {
            debug!(self.logger, "Skipping block before the start block";
                "chain_id" => chain_id, "number" => number);
            return;
        }
        if let Some(latest) = self.engine.latest_block(chain_id) {
            if number < latest {
                debug!(self.logger, "Skipping already-processed block";
                    "chain_id" => chain_id, "number" => number);
                return;
            }
        }

        let handle = Arc::new(PartsHandle::new());
        let timeout_arm = tokio::spawn(cancel_listener_block_after_timeout(
            handle.clone(),
            self.engine.block_timeout,
        ));

        let result = self
            .start_processing_block(chain_id, number, parts_rx, async_entities, &handle)
            .await;
        timeout_arm.abort();

        match result {
            Ok(()) if !handle.cancelled() => {
                if let Err(e) = self.engine.advance(chain_id, number).await {
                    error!(self.logger, "Failed to persist the chain cursor";
                        "chain_id" => chain_id, "number" => number, "error" => %e);
                }
                if self.engine.flags.cleanup {
                    self.staging.remove(chain_id, number).await;
                }
                debug!(self.logger, "Processed block"; "chain_id" => chain_id, "number" => number);
            }
            Ok(()) => {
                warn!(self.logger, "Restacking block after timeout";
                    "chain_id" => chain_id, "number" => number);
                self.restack(chain_id, number);
            }
            Err(e) => {
                warn!(self.logger, "Restacking block after processing failure";
                    "chain_id" => chain_id, "number" => number, "error" => %e);
                self.restack(chain_id, number);
            }
        }
    }

    /// The processing arm: await the staged reader, load the parts, resolve
    /// the migration snapshots, and hand everything to the processor with
    /// the sync ops valid at this block.
    async fn start_processing_block(
        &self,
        chain_id: u64,
        number: u64,
        parts_rx: tokio::sync::oneshot::Receiver<crate::listener::StagedReader>,
        async_entities: crate::listener::EntityPrefetch,
        handle: &Arc<PartsHandle>,
    ) -> Result<(), Error> {
        let reader = parts_rx
            .await
            .map_err(|_| anyhow!("staging for block {} did not complete", number))?;
        let parts = reader
            .read()
            .await
            .with_context(|| format!("block {} staged incompletely", number))?;
        let parts = Arc::new(parts);
        handle.fill(parts.clone());

        let mut migration_entities: HashMap<String, Vec<Entity>> = HashMap::new();
        for (entity_ref, by_block) in async_entities {
            for (_, prefetch) in by_block {
                let entities = prefetch
                    .await
                    .map_err(|e| anyhow!("migration entity prefetch panicked: {}", e))??;
                migration_entities
                    .entry(entity_ref.clone())
                    .or_default()
                    .extend(entities);
            }
        }

        // The timeout may have won while we were still waiting on staging;
        // do not run the handlers against released data.
        if handle.cancelled() {
            return Ok(());
        }

        let syncs = self.engine.valid_syncs(chain_id, number);
        self.processor
            .process_listener_block(
                &self.logger,
                chain_id,
                number,
                parts,
                &syncs,
                migration_entities,
            )
            .await
    }

    fn restack(&self, chain_id: u64, number: u64) {
        match self.listeners.get(&chain_id) {
            Some(listener) => listener.restack_entry(number),
            None => error!(self.logger, "No listener to restack onto"; "chain_id" => chain_id),
        }
    }
}
