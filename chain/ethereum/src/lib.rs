//! The live ingestion core for EVM chains: a per-chain block listener feeds
//! a FIFO queue, a single dispatcher consumes it in strict ascending order,
//! staging decouples fetch from handler execution, and timeouts or failures
//! restack the block at the head of the queue.

mod dispatcher;
mod engine;
mod fetcher;
mod ingestor;
mod listener;
mod migrations;
mod staging;

#[cfg(test)]
mod tests;

pub use dispatcher::{cancel_listener_block_after_timeout, BlockDispatcher};
pub use engine::{Engine, EngineOptions};
pub use fetcher::{
    create_block_ranges, fetch_block_parts, fetch_range, fetch_transaction_receipt,
    txs_from_range, BlockRequest, FetchContext, FetchedBlock, RANGE_COUNT,
};
pub use ingestor::BlockIngestor;
pub use listener::{BlockListener, QueueEntry, StagedReader};
pub use migrations::{Migration, MigrationsIndex};
pub use staging::StagingCache;
