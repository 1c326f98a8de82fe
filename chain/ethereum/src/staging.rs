use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Error};
use serde::Serialize;
use slog::{debug, Logger};
use web3::types::H256;

use seine::prelude::{BlockParts, EngineFlags, EthereumAdapter};

use crate::fetcher::fetch_block_parts;

const BLOCKS_DIR: &str = "blocks";
const TRANSACTIONS_DIR: &str = "transactions";
const COMBINED_DIR: &str = "blockAndReceipts";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The staging area: blocks and receipts persisted to a scratch directory,
/// keyed by `(chain_id, block_number)`, so handler execution is decoupled
/// from fetching. With the `cleanup` flag only the combined artefact is
/// written and it is deleted once the block is processed.
pub struct StagingCache {
    root: PathBuf,
    flags: EngineFlags,
    logger: Logger,
}

impl StagingCache {
    pub fn new(logger: Logger, root: PathBuf, flags: EngineFlags) -> Result<Self, Error> {
        for dir in [BLOCKS_DIR, TRANSACTIONS_DIR, COMBINED_DIR] {
            std::fs::create_dir_all(root.join(dir))
                .with_context(|| format!("creating staging directory `{}`", dir))?;
        }
        Ok(StagingCache {
            root,
            flags,
            logger,
        })
    }

    fn block_path(&self, chain_id: u64, number: u64) -> PathBuf {
        self.root
            .join(BLOCKS_DIR)
            .join(format!("{}-{}.json", chain_id, number))
    }

    fn transaction_path(&self, chain_id: u64, hash: H256) -> PathBuf {
        self.root
            .join(TRANSACTIONS_DIR)
            .join(format!("{}-{:#x}.json", chain_id, hash))
    }

    fn combined_path(&self, chain_id: u64, number: u64) -> PathBuf {
        self.root
            .join(COMBINED_DIR)
            .join(format!("{}-{}.json", chain_id, number))
    }

    /// Fetch the block with its receipts and persist the artefacts. The
    /// queue entry's deferred reader resolves only after this returns, so a
    /// reader never races the write.
    pub fn save_block_and_receipts<'a>(
        &'a self,
        adapter: &'a Arc<dyn EthereumAdapter>,
        chain_id: u64,
        number: u64,
        concurrency: usize,
    ) -> Pin<Box<dyn Future<Output = Result<BlockParts, Error>> + Send + 'a>> {
        Box::pin(async move {
            let parts = fetch_block_parts(
                &self.logger,
                adapter,
                number,
                self.flags.collect_tx_receipts,
                concurrency,
            )
            .await?;

            if !self.flags.cleanup {
                self.write_json(self.block_path(chain_id, number), &parts.block)
                    .await?;
                for (hash, receipt) in &parts.receipts {
                    self.write_json(self.transaction_path(chain_id, *hash), receipt)
                        .await?;
                }
            }

            self.write_json(self.combined_path(chain_id, number), &parts)
                .await?;

            debug!(self.logger, "Staged block"; "chain_id" => chain_id, "number" => number);
            Ok(parts)
        })
    }

    /// Persist already-fetched parts as a combined artefact. The back-fill
    /// path uses this to warm the disk cache when `collect_blocks` is set.
    pub async fn stage_parts(
        &self,
        chain_id: u64,
        number: u64,
        parts: &BlockParts,
    ) -> Result<(), Error> {
        self.write_json(self.combined_path(chain_id, number), parts)
            .await
    }

    /// Read the combined artefact back. Any failure means the block is
    /// incomplete and the caller restacks it.
    pub async fn read_block_and_receipts(
        &self,
        chain_id: u64,
        number: u64,
    ) -> Result<BlockParts, Error> {
        let path = self.combined_path(chain_id, number);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading staged block {}-{}", chain_id, number))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing staged block {}-{}", chain_id, number))
    }

    /// Disk-first lookup for the range fetcher.
    pub async fn cached_block(&self, chain_id: u64, number: u64) -> Option<BlockParts> {
        self.read_block_and_receipts(chain_id, number).await.ok()
    }

    /// Drop the combined artefact after a block was processed.
    pub async fn remove(&self, chain_id: u64, number: u64) {
        let path = self.combined_path(chain_id, number);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(self.logger, "Could not remove staged block";
                "chain_id" => chain_id, "number" => number, "error" => %e);
        }
    }

    /// Write to a unique temp file, then rename: a concurrent reader sees
    /// either the old artefact or the new one, never a torn write.
    async fn write_json<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<(), Error> {
        let bytes = serde_json::to_vec(value).context("serializing staging artefact")?;
        let tmp = path.with_extension(format!(
            "tmp.{}",
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing staging artefact {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("publishing staging artefact {}", path.display()))?;
        Ok(())
    }
}
