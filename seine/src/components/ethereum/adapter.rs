use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use web3::types::{Block, Transaction, TransactionReceipt, H256};

/// New block numbers as the provider announces them, interleaved with
/// provider errors for the listener's error handler to classify.
pub type BlockNumberStream = Pin<Box<dyn Stream<Item = Result<u64, ProviderError>> + Send>>;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("provider request timed out")]
    Timeout,

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ProviderError {
    /// Whether this error class stops the ingestor. Fatal errors surface
    /// once through the reject handler and detach every listener; timeouts
    /// are swallowed; everything else is logged and retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::Server(_)
                | ProviderError::UnsupportedOperation(_)
        )
    }
}

/// The narrow provider surface the ingestion core consumes. The RPC client
/// itself lives behind this trait.
#[async_trait]
pub trait EthereumAdapter: Send + Sync + 'static {
    fn chain_id(&self) -> u64;

    /// Subscribe to newly observed block numbers.
    async fn subscribe_new_blocks(&self) -> Result<BlockNumberStream, ProviderError>;

    /// The block at `number` with full transaction objects, or `None` when
    /// the provider does not know it yet.
    async fn block_with_transactions(
        &self,
        number: u64,
    ) -> Result<Option<Block<Transaction>>, ProviderError>;

    async fn transaction_by_hash(&self, hash: H256) -> Result<Option<Transaction>, ProviderError>;

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ProviderError>;
}
