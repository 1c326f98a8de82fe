use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use web3::types::{Block, Log, Transaction, TransactionReceipt, H256};

/// A staged block: the block with full transaction objects plus the receipt
/// of each transaction, keyed by transaction hash. This is also the schema
/// of the combined staging artefact on disk (not a stable external format).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockParts {
    pub block: Block<Transaction>,
    pub receipts: HashMap<H256, TransactionReceipt>,
}

impl BlockParts {
    pub fn new(block: Block<Transaction>, receipts: HashMap<H256, TransactionReceipt>) -> Self {
        BlockParts { block, receipts }
    }

    pub fn number(&self) -> Option<u64> {
        self.block.number.map(|n| n.as_u64())
    }

    pub fn transaction_for_log(&self, log: &Log) -> Option<&Transaction> {
        log.transaction_hash
            .and_then(|hash| self.block.transactions.iter().find(|tx| tx.hash == hash))
    }

    /// All receipt logs in dispatch order: transaction index, then log index.
    /// This is the order handlers observe events in.
    pub fn ordered_logs(&self) -> Vec<&Log> {
        let mut logs: Vec<&Log> = self
            .receipts
            .values()
            .flat_map(|receipt| receipt.logs.iter())
            .collect();
        logs.sort_by_key(|log| {
            (
                log.transaction_index.map(|i| i.as_u64()).unwrap_or(u64::MAX),
                log.log_index.map(|i| i.as_u64()).unwrap_or(u64::MAX),
            )
        });
        logs
    }
}

/// The record raced over by the per-block timeout arm and the processing arm.
///
/// The timeout arm never aborts the in-flight handler; it sets the cancelled
/// flag and drops its reference to the staged data. The processing arm checks
/// the flag and restacks the block when the timeout won the race.
#[derive(Debug, Default)]
pub struct PartsHandle {
    cancelled: AtomicBool,
    parts: Mutex<Option<Arc<BlockParts>>>,
}

impl PartsHandle {
    pub fn new() -> Self {
        PartsHandle::default()
    }

    pub fn fill(&self, parts: Arc<BlockParts>) {
        *self.parts.lock().unwrap() = Some(parts);
    }

    /// Set the cancelled flag and release the staged block and receipts.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.parts.lock().unwrap().take();
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn parts(&self) -> Option<Arc<BlockParts>> {
        self.parts.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use web3::types::{Bytes, H160, U256, U64};

    fn log(tx_index: u64, log_index: u64) -> Log {
        Log {
            address: H160::zero(),
            topics: vec![],
            data: Bytes(vec![]),
            block_hash: Some(H256::zero()),
            block_number: Some(U64::from(1)),
            transaction_hash: Some(H256::from_low_u64_be(tx_index)),
            transaction_index: Some(U64::from(tx_index)),
            log_index: Some(U256::from(log_index)),
            transaction_log_index: None,
            log_type: None,
            removed: Some(false),
        }
    }

    fn receipt_with_logs(tx_index: u64, logs: Vec<Log>) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: H256::from_low_u64_be(tx_index),
            transaction_index: U64::from(tx_index),
            block_hash: Some(H256::zero()),
            block_number: Some(U64::from(1)),
            from: H160::zero(),
            to: None,
            cumulative_gas_used: U256::zero(),
            gas_used: Some(U256::zero()),
            contract_address: None,
            logs,
            status: Some(U64::from(1)),
            root: None,
            logs_bloom: Default::default(),
            transaction_type: None,
            effective_gas_price: None,
        }
    }

    #[test]
    fn logs_are_ordered_by_transaction_then_log_index() {
        let mut receipts = HashMap::new();
        receipts.insert(
            H256::from_low_u64_be(2),
            receipt_with_logs(2, vec![log(2, 5), log(2, 3)]),
        );
        receipts.insert(
            H256::from_low_u64_be(1),
            receipt_with_logs(1, vec![log(1, 1), log(1, 0)]),
        );

        let parts = BlockParts {
            block: Default::default(),
            receipts,
        };

        let order: Vec<(u64, u64)> = parts
            .ordered_logs()
            .iter()
            .map(|l| {
                (
                    l.transaction_index.unwrap().as_u64(),
                    l.log_index.unwrap().as_u64(),
                )
            })
            .collect();

        assert_eq!(order, vec![(1, 0), (1, 1), (2, 3), (2, 5)]);
    }

    #[test]
    fn cancel_releases_the_parts_and_sets_the_flag() {
        let handle = PartsHandle::new();
        handle.fill(Arc::new(BlockParts {
            block: Default::default(),
            receipts: HashMap::new(),
        }));

        assert!(!handle.cancelled());
        assert!(handle.parts().is_some());

        handle.cancel();

        assert!(handle.cancelled());
        assert!(handle.parts().is_none());
    }
}
