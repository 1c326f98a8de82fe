use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Error};
use futures::stream::{self, StreamExt, TryStreamExt};
use slog::{debug, warn, Logger};
use web3::types::{Block, Transaction, TransactionReceipt, H256};

use seine::prelude::{retry, BlockParts, EthereumAdapter, ENV_VARS};
use seine::util::queue::PendingQueue;

use crate::staging::StagingCache;

/// How many sub-ranges a historical interval is split into before the
/// sub-ranges run concurrently through the bounded queue.
pub const RANGE_COUNT: u64 = 10;

/// Fetch the receipt of one transaction, retrying forever. The transaction
/// response is fetched alongside and merged in: it cross-checks the receipt
/// hash and backfills block coordinates the receipt may lack. A receipt
/// without its transaction hash is integrity-broken and retried like any
/// transport fault.
pub fn fetch_transaction_receipt<'a>(
    logger: &'a Logger,
    adapter: &'a Arc<dyn EthereumAdapter>,
    hash: H256,
) -> Pin<Box<dyn Future<Output = Result<TransactionReceipt, Error>> + Send + 'a>> {
    Box::pin(async move {
        let retry_log_message = format!("eth_getTransactionReceipt RPC call for tx {:?}", hash);

        retry(retry_log_message, logger)
            .no_limit()
            .timeout(ENV_VARS.json_rpc_timeout)
            .run(move || {
                let adapter = adapter.clone();
                async move {
                    let transaction =
                        adapter.transaction_by_hash(hash).await.map_err(Error::from)?;
                    let receipt = adapter
                        .transaction_receipt(hash)
                        .await
                        .map_err(Error::from)?
                        .ok_or_else(|| anyhow!("no receipt for transaction {:?}", hash))?;
                    merge_receipt(hash, transaction, receipt)
                }
            })
            .await
            .map_err(|e| {
                e.into_inner()
                    .unwrap_or_else(|| anyhow!("Ethereum node took too long to return a receipt"))
            })
    })
}

fn merge_receipt(
    hash: H256,
    transaction: Option<Transaction>,
    mut receipt: TransactionReceipt,
) -> Result<TransactionReceipt, Error> {
    if receipt.transaction_hash.is_zero() {
        return Err(anyhow!("receipt for {:?} is missing its transaction hash", hash));
    }
    if receipt.transaction_hash != hash {
        return Err(anyhow!(
            "receipt hash {:?} does not match requested transaction {:?}",
            receipt.transaction_hash,
            hash
        ));
    }

    if let Some(transaction) = transaction {
        if receipt.block_hash.is_none() {
            receipt.block_hash = transaction.block_hash;
        }
        if receipt.block_number.is_none() {
            receipt.block_number = transaction.block_number;
        }
    }
    Ok(receipt)
}

/// Fetch a block with full transactions plus, when requested, every
/// transaction receipt. Receipt fetches run concurrently, bounded by
/// `concurrency`. Retries forever on transport faults.
pub fn fetch_block_parts<'a>(
    logger: &'a Logger,
    adapter: &'a Arc<dyn EthereumAdapter>,
    number: u64,
    collect_receipts: bool,
    concurrency: usize,
) -> Pin<Box<dyn Future<Output = Result<BlockParts, Error>> + Send + 'a>> {
    Box::pin(async move {
        let retry_log_message = format!("eth_getBlockByNumber({}, full) RPC call", number);

        let block = retry(retry_log_message, logger)
            .no_limit()
            .timeout(ENV_VARS.json_rpc_timeout)
            .run(move || {
                let adapter = adapter.clone();
                async move {
                    adapter
                        .block_with_transactions(number)
                        .await
                        .map_err(Error::from)?
                        .ok_or_else(|| anyhow!("block {} unavailable", number))
                }
            })
            .await
            .map_err(|e| {
                e.into_inner().unwrap_or_else(|| {
                    anyhow!("Ethereum node took too long to return block {}", number)
                })
            })?;

        let receipts = if collect_receipts {
            fetch_receipts(logger, adapter, &block, concurrency).await?
        } else {
            HashMap::new()
        };

        Ok(BlockParts::new(block, receipts))
    })
}

fn fetch_receipts<'a>(
    logger: &'a Logger,
    adapter: &'a Arc<dyn EthereumAdapter>,
    block: &'a Block<Transaction>,
    concurrency: usize,
) -> Pin<Box<dyn Future<Output = Result<HashMap<H256, TransactionReceipt>, Error>> + Send + 'a>> {
    Box::pin(async move {
        let hashes: Vec<H256> = block.transactions.iter().map(|tx| tx.hash).collect();
        stream::iter(hashes)
            .map(|hash| {
                let logger = logger.clone();
                let adapter = adapter.clone();
                async move {
                    fetch_transaction_receipt(&logger, &adapter, hash)
                        .await
                        .map(|receipt| (hash, receipt))
                }
            })
            .buffer_unordered(concurrency.max(1))
            .try_collect()
            .await
    })
}

/// A pending block fetch on the shared request stack. Failed requests are
/// re-pushed with the attempt counter bumped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRequest {
    pub number: u64,
    pub attempts: u64,
}

/// A fetched block with whatever receipts were requested.
#[derive(Clone, Debug)]
pub struct FetchedBlock {
    pub hash: H256,
    pub block: Block<Transaction>,
    pub receipts: HashMap<H256, TransactionReceipt>,
}

/// Everything a range fetch needs. Shared with the historical back-fill
/// path.
pub struct FetchContext {
    pub logger: Logger,
    pub adapter: Arc<dyn EthereumAdapter>,
    pub staging: Arc<StagingCache>,
    pub chain_id: u64,
    pub silent: bool,
    /// Warm the disk cache with blocks fetched over the network.
    pub collect_blocks: bool,
}

/// Work through `[from, to]`, trying the staging area on disk before the
/// network. A staged block that already embeds its transaction objects
/// satisfies the request without the network as long as receipts are not
/// required. Failures go back onto `req_stack` with their attempt count;
/// every few attempts a progress line is logged unless `silent`.
pub async fn txs_from_range(
    ctx: &FetchContext,
    from: u64,
    to: u64,
    collect_receipts: bool,
    req_stack: &PendingQueue<BlockRequest>,
    results: &tokio::sync::Mutex<BTreeMap<u64, FetchedBlock>>,
) {
    for number in from..=to {
        req_stack.push_back(BlockRequest {
            number,
            attempts: 0,
        });
    }

    while let Some(request) = req_stack.try_pop() {
        match fetch_one(ctx, request.number, collect_receipts).await {
            Ok(fetched) => {
                results.lock().await.insert(request.number, fetched);
            }
            Err(e) => {
                let attempts = request.attempts + 1;
                if attempts % ENV_VARS.retry_log_after.max(1) == 0 && !ctx.silent {
                    warn!(ctx.logger, "Retrying block fetch";
                        "block" => request.number,
                        "attempts" => attempts,
                        "error" => %e,
                    );
                }
                req_stack.push_back(BlockRequest {
                    number: request.number,
                    attempts,
                });
            }
        }
    }
}

async fn fetch_one(
    ctx: &FetchContext,
    number: u64,
    collect_receipts: bool,
) -> Result<FetchedBlock, Error> {
    if let Some(staged) = ctx.staging.cached_block(ctx.chain_id, number).await {
        if !collect_receipts && !staged.block.transactions.is_empty() {
            debug!(ctx.logger, "Serving block from the staging area"; "block" => number);
            let hash = staged.block.hash.unwrap_or_default();
            return Ok(FetchedBlock {
                hash,
                block: staged.block,
                receipts: staged.receipts,
            });
        }
    }

    // Single attempt per call; the request stack is the retry loop here.
    let block = ctx
        .adapter
        .block_with_transactions(number)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| anyhow!("block {} unavailable", number))?;

    let mut receipts = HashMap::new();
    if collect_receipts {
        for tx in &block.transactions {
            let receipt = ctx
                .adapter
                .transaction_receipt(tx.hash)
                .await
                .map_err(Error::from)?
                .ok_or_else(|| anyhow!("no receipt for transaction {:?}", tx.hash))?;
            let receipt = merge_receipt(tx.hash, Some(tx.clone()), receipt)?;
            receipts.insert(tx.hash, receipt);
        }
    }

    if ctx.collect_blocks {
        let parts = BlockParts::new(block.clone(), receipts.clone());
        if let Err(e) = ctx.staging.stage_parts(ctx.chain_id, number, &parts).await {
            debug!(ctx.logger, "Could not warm the staging area"; "block" => number, "error" => %e);
        }
    }

    let hash = block.hash.unwrap_or_default();
    Ok(FetchedBlock {
        hash,
        block,
        receipts,
    })
}

/// Fetch a whole interval: split into [`RANGE_COUNT`] sub-ranges and run
/// them concurrently over a shared request stack, bounded by `concurrency`.
/// Shared with the historical back-fill path.
pub async fn fetch_range(
    ctx: &FetchContext,
    from: u64,
    to: u64,
    collect_receipts: bool,
    concurrency: usize,
) -> BTreeMap<u64, FetchedBlock> {
    let req_stack = PendingQueue::new();
    let results = tokio::sync::Mutex::new(BTreeMap::new());

    {
        let req_stack = &req_stack;
        let results = &results;
        stream::iter(create_block_ranges(from, to, RANGE_COUNT))
            .map(|(range_from, range_to)| async move {
                txs_from_range(ctx, range_from, range_to, collect_receipts, req_stack, results)
                    .await
            })
            .buffer_unordered(concurrency.max(1))
            .collect::<Vec<()>>()
            .await;
    }

    results.into_inner()
}

/// Partition the inclusive interval `[from, to]` into at most `count`
/// contiguous sub-ranges. The caller runs them concurrently through a
/// bounded queue whose width is the engine concurrency.
pub fn create_block_ranges(from: u64, to: u64, count: u64) -> Vec<(u64, u64)> {
    if from > to || count == 0 {
        return Vec::new();
    }

    let total = to - from + 1;
    let size = total.div_ceil(count);

    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = (start + size - 1).min(to);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}
