use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use slog::Logger;

use crate::components::engine::SyncOp;
use crate::components::ethereum::BlockParts;
use crate::components::store::Entity;

/// The processing stage the dispatcher hands each block to.
///
/// Implementations replay the block's events through user-registered
/// handlers in transaction-index-then-log-index order (see
/// `BlockParts::ordered_logs`) and apply the resulting mutations through the
/// store. An error restacks the block at the head of its queue.
#[async_trait]
pub trait BlockProcessor: Send + Sync + 'static {
    async fn process_listener_block(
        &self,
        logger: &Logger,
        chain_id: u64,
        number: u64,
        parts: Arc<BlockParts>,
        syncs: &[SyncOp],
        migration_entities: HashMap<String, Vec<Entity>>,
    ) -> Result<(), anyhow::Error>;
}
