use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Error;
use slog::{error, info, Logger};
use tokio::sync::mpsc;

use seine::prelude::{BlockProcessor, EthereumAdapter, LoggerFactory};
use seine::util::queue::PendingQueue;

use crate::dispatcher::BlockDispatcher;
use crate::engine::Engine;
use crate::listener::{BlockListener, QueueEntry};
use crate::migrations::MigrationsIndex;
use crate::staging::StagingCache;

/// Wires the ingestion core together: one listener per chain feeding the
/// shared queue, one dispatcher consuming it, and the reject channel that
/// unwinds everything on a fatal provider error.
pub struct BlockIngestor {
    engine: Arc<Engine>,
    staging: Arc<StagingCache>,
    queue: Arc<PendingQueue<QueueEntry>>,
    listeners: HashMap<u64, Arc<BlockListener>>,
    processor: Arc<dyn BlockProcessor>,
    logger: Logger,
}

impl BlockIngestor {
    pub fn new(
        logger_factory: &LoggerFactory,
        engine: Arc<Engine>,
        staging: Arc<StagingCache>,
        migrations: Arc<MigrationsIndex>,
        processor: Arc<dyn BlockProcessor>,
        adapters: Vec<Arc<dyn EthereumAdapter>>,
    ) -> Self {
        let queue = Arc::new(PendingQueue::new());

        let mut listeners = HashMap::new();
        for adapter in adapters {
            let chain_id = adapter.chain_id();
            let listener = BlockListener::new(
                logger_factory.chain_logger("BlockListener", chain_id),
                engine.clone(),
                adapter,
                staging.clone(),
                migrations.clone(),
                queue.clone(),
            );
            listeners.insert(chain_id, Arc::new(listener));
        }

        BlockIngestor {
            engine,
            staging,
            queue,
            listeners,
            processor,
            logger: logger_factory.component_logger("BlockIngestor"),
        }
    }

    /// Listen until every subscription ends or a provider error of a fatal
    /// class surfaces through the reject channel. Either way each listener
    /// detaches cleanly: the in-flight block finishes, subscriptions stop,
    /// and every chain lock is released with a final save.
    pub async fn run(&self) -> Result<(), Error> {
        for &chain_id in self.listeners.keys() {
            self.engine.acquire_chain_lock(chain_id).await?;
        }
        self.engine.start_listening();

        let (reject, mut rejected) = mpsc::channel(1);
        let mut subscriptions = Vec::new();
        for listener in self.listeners.values() {
            subscriptions.push(listener.spawn_subscription(reject.clone()));
        }
        drop(reject);

        let dispatcher = Arc::new(BlockDispatcher::new(
            self.logger.clone(),
            self.engine.clone(),
            self.queue.clone(),
            self.staging.clone(),
            self.listeners.clone(),
            self.processor.clone(),
        ));
        let dispatch_task = tokio::spawn(dispatcher.run());

        info!(self.logger, "Listening for new blocks"; "chains" => self.listeners.len());

        // `None` means every subscription stream ended on its own.
        let cause = rejected.recv().await;
        if let Some(e) = &cause {
            error!(self.logger, "Detaching listeners after a fatal provider error"; "error" => %e);
        }

        self.detach(subscriptions, dispatch_task).await;

        match cause {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn detach(
        &self,
        subscriptions: Vec<tokio::task::JoinHandle<()>>,
        dispatch_task: tokio::task::JoinHandle<()>,
    ) {
        self.engine.stop_listening();

        // No block is processed twice and none is lost mid-flight: the
        // in-flight process finishes before anything is torn down.
        if let Some(task) = self.engine.current_process.lock().await.take() {
            let _ = task.await;
        }

        for subscription in subscriptions {
            subscription.abort();
        }
        let _ = dispatch_task.await;

        for &chain_id in self.listeners.keys() {
            if let Err(e) = self.engine.release_chain_lock(chain_id).await {
                error!(self.logger, "Failed to release the chain lock";
                    "chain_id" => chain_id, "error" => %e);
            }
        }
    }
}
