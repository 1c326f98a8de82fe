use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::stream;
use tokio::sync::mpsc;
use web3::types::{
    Block, Bytes, Transaction, TransactionReceipt, H160, H256, H64, U256, U64,
};

use seine::prelude::{BlockNumberStream, EthereumAdapter, ProviderError};

/// A canned `Block<Transaction>` with the given transactions.
pub fn block(number: u64, transactions: Vec<Transaction>) -> Block<Transaction> {
    Block {
        hash: Some(H256::from_low_u64_be(number)),
        parent_hash: H256::from_low_u64_be(number.saturating_sub(1)),
        uncles_hash: H256::zero(),
        author: H160::zero(),
        state_root: H256::zero(),
        transactions_root: H256::zero(),
        receipts_root: H256::zero(),
        number: Some(U64::from(number)),
        gas_used: U256::zero(),
        gas_limit: U256::zero(),
        base_fee_per_gas: None,
        extra_data: Bytes(vec![]),
        logs_bloom: None,
        timestamp: U256::from(number * 12),
        difficulty: U256::zero(),
        total_difficulty: None,
        seal_fields: vec![],
        uncles: vec![],
        transactions,
        size: None,
        mix_hash: Some(H256::zero()),
        nonce: Some(H64::zero()),
    }
}

/// A canned transaction with a hash derived from `(block_number, index)`.
pub fn transaction(block_number: u64, index: u64) -> Transaction {
    Transaction {
        hash: H256::from_low_u64_be(block_number * 1000 + index),
        nonce: U256::from(index),
        block_hash: Some(H256::from_low_u64_be(block_number)),
        block_number: Some(U64::from(block_number)),
        transaction_index: Some(U64::from(index)),
        from: Some(H160::zero()),
        to: Some(H160::zero()),
        value: U256::zero(),
        gas_price: Some(U256::zero()),
        gas: U256::zero(),
        input: Bytes(vec![]),
        v: None,
        r: None,
        s: None,
        raw: None,
        transaction_type: None,
        access_list: None,
        max_fee_per_gas: None,
        max_priority_fee_per_gas: None,
    }
}

/// The receipt matching a canned transaction.
pub fn receipt(tx: &Transaction) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx.hash,
        transaction_index: tx.transaction_index.unwrap_or_default(),
        block_hash: tx.block_hash,
        block_number: tx.block_number,
        from: tx.from.unwrap_or_default(),
        to: tx.to,
        cumulative_gas_used: U256::zero(),
        gas_used: Some(U256::zero()),
        contract_address: None,
        logs: vec![],
        status: Some(U64::from(1)),
        root: None,
        logs_bloom: Default::default(),
        transaction_type: None,
        effective_gas_price: None,
    }
}

/// A scripted `EthereumAdapter`. Blocks, transactions and receipts are
/// registered up front; block announcements and provider errors are pushed
/// into the subscription by the test.
pub struct MockEthereumAdapter {
    chain_id: u64,
    blocks: Mutex<HashMap<u64, Block<Transaction>>>,
    transactions: Mutex<HashMap<H256, Transaction>>,
    receipts: Mutex<HashMap<H256, TransactionReceipt>>,
    /// Remaining injected failures per block number.
    block_failures: Mutex<HashMap<u64, u32>>,
    subscription: Mutex<Option<mpsc::UnboundedReceiver<Result<u64, ProviderError>>>>,
    announcer: Mutex<Option<mpsc::UnboundedSender<Result<u64, ProviderError>>>>,
    block_fetches: AtomicU64,
}

impl MockEthereumAdapter {
    pub fn new(chain_id: u64) -> Self {
        let (announcer, subscription) = mpsc::unbounded_channel();
        MockEthereumAdapter {
            chain_id,
            blocks: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            block_failures: Mutex::new(HashMap::new()),
            subscription: Mutex::new(Some(subscription)),
            announcer: Mutex::new(Some(announcer)),
            block_fetches: AtomicU64::new(0),
        }
    }

    /// Register a block with `tx_count` canned transactions and matching
    /// receipts.
    pub fn add_block(&self, number: u64, tx_count: u64) {
        let transactions: Vec<Transaction> =
            (0..tx_count).map(|i| transaction(number, i)).collect();
        for tx in &transactions {
            self.transactions.lock().unwrap().insert(tx.hash, tx.clone());
            self.receipts.lock().unwrap().insert(tx.hash, receipt(tx));
        }
        self.blocks
            .lock()
            .unwrap()
            .insert(number, block(number, transactions));
    }

    /// The next `count` fetches of block `number` fail with a transport
    /// error.
    pub fn fail_block_fetches(&self, number: u64, count: u32) {
        self.block_failures.lock().unwrap().insert(number, count);
    }

    /// Announce a new chain head to the subscription.
    pub fn announce_block(&self, number: u64) {
        if let Some(announcer) = self.announcer.lock().unwrap().as_ref() {
            let _ = announcer.send(Ok(number));
        }
    }

    /// Emit a provider error into the subscription.
    pub fn announce_error(&self, error: ProviderError) {
        if let Some(announcer) = self.announcer.lock().unwrap().as_ref() {
            let _ = announcer.send(Err(error));
        }
    }

    /// Drop the announcing side, ending the subscription stream.
    pub fn end_subscription(&self) {
        self.announcer.lock().unwrap().take();
    }

    pub fn block_fetch_count(&self) -> u64 {
        self.block_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EthereumAdapter for MockEthereumAdapter {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn subscribe_new_blocks(&self) -> Result<BlockNumberStream, ProviderError> {
        let receiver = self
            .subscription
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ProviderError::Transport(anyhow!("already subscribed")))?;
        Ok(Box::pin(stream::unfold(receiver, |mut receiver| async {
            receiver.recv().await.map(|item| (item, receiver))
        })))
    }

    async fn block_with_transactions(
        &self,
        number: u64,
    ) -> Result<Option<Block<Transaction>>, ProviderError> {
        self.block_fetches.fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.block_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProviderError::Transport(anyhow!(
                        "injected failure for block {}",
                        number
                    )));
                }
            }
        }

        Ok(self.blocks.lock().unwrap().get(&number).cloned())
    }

    async fn transaction_by_hash(&self, hash: H256) -> Result<Option<Transaction>, ProviderError> {
        Ok(self.transactions.lock().unwrap().get(&hash).cloned())
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ProviderError> {
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }
}
