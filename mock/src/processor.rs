use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use slog::Logger;

use seine::prelude::{BlockParts, BlockProcessor, Entity, SyncOp};

/// A `BlockProcessor` that records every successfully processed
/// `(chain_id, number)` pair. Per-block delays and one-shot error
/// injections drive the timeout and restack paths in tests.
#[derive(Default)]
pub struct RecordingProcessor {
    processed: Arc<Mutex<Vec<(u64, u64)>>>,
    seen_syncs: Mutex<HashMap<u64, usize>>,
    seen_migration_entities: Mutex<HashMap<u64, HashMap<String, usize>>>,
    delays: Mutex<HashMap<u64, Duration>>,
    failures: Mutex<HashMap<u64, u32>>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        RecordingProcessor::default()
    }

    /// Blocks processed so far, in completion order.
    pub fn processed(&self) -> Vec<(u64, u64)> {
        self.processed.lock().unwrap().clone()
    }

    pub fn processed_numbers(&self, chain_id: u64) -> Vec<u64> {
        self.processed
            .lock()
            .unwrap()
            .iter()
            .filter(|(chain, _)| *chain == chain_id)
            .map(|(_, number)| *number)
            .collect()
    }

    /// The number of valid sync ops handed in for `number`, once processed.
    pub fn syncs_seen(&self, number: u64) -> Option<usize> {
        self.seen_syncs.lock().unwrap().get(&number).copied()
    }

    /// Entity counts per migration ref handed in for `number`.
    pub fn migration_entities_seen(&self, number: u64) -> HashMap<String, usize> {
        self.seen_migration_entities
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default()
    }

    /// Delay the next processing run of `number`. One-shot.
    pub fn delay_block(&self, number: u64, delay: Duration) {
        self.delays.lock().unwrap().insert(number, delay);
    }

    /// The next `count` processing runs of `number` fail.
    pub fn fail_block(&self, number: u64, count: u32) {
        self.failures.lock().unwrap().insert(number, count);
    }
}

#[async_trait]
impl BlockProcessor for RecordingProcessor {
    async fn process_listener_block(
        &self,
        _logger: &Logger,
        chain_id: u64,
        number: u64,
        parts: Arc<BlockParts>,
        syncs: &[SyncOp],
        migration_entities: HashMap<String, Vec<Entity>>,
    ) -> Result<(), anyhow::Error> {
        if parts.number() != Some(number) {
            bail!("staged parts carry block {:?}, expected {}", parts.number(), number);
        }

        let delay = self.delays.lock().unwrap().remove(&number);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    bail!("injected handler failure for block {}", number);
                }
            }
        }

        self.seen_syncs.lock().unwrap().insert(number, syncs.len());
        self.seen_migration_entities.lock().unwrap().insert(
            number,
            migration_entities
                .iter()
                .map(|(entity_ref, entities)| (entity_ref.clone(), entities.len()))
                .collect(),
        );
        self.processed.lock().unwrap().push((chain_id, number));
        Ok(())
    }
}
