use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::components::store::{Entity, StoreError, StoreKey, META_COLLECTION};

/// Process-wide behaviour toggles. These arrive with the engine options, not
/// the environment.
#[derive(Clone, Debug, Default)]
pub struct EngineFlags {
    /// No durable writes; the hot cache still updates.
    pub read_only: bool,
    /// The database is known fresh: skip all durable reads.
    pub new_db: bool,
    /// Serve all non-meta reads from the hot cache. `__meta__` always reads
    /// through.
    pub warm_db: bool,
    /// Stage only the combined block artefact and delete it after the block
    /// is processed.
    pub cleanup: bool,
    /// Suppress retry progress logs.
    pub silent: bool,
    /// Persist standalone block artefacts while staging.
    pub collect_blocks: bool,
    /// Fetch transaction receipts while staging.
    pub collect_tx_receipts: bool,
}

/// Last-processed block of a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub number: u64,
}

/// A registered subscription: which handler set runs for blocks of a chain,
/// valid from `start_block` on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncOp {
    pub id: String,
    pub chain_id: u64,
    pub start_block: u64,
}

impl SyncOp {
    pub fn is_valid_at(&self, chain_id: u64, number: u64) -> bool {
        self.chain_id == chain_id && self.start_block <= number
    }
}

/// The per-chain cursor persisted under `__meta__`. `locked` is a persistent
/// mutex: a second ingestor refuses to start on a chain whose cursor it finds
/// locked, and detach releases it with a final save.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaEntity {
    pub id: String,
    pub chain_id: u64,
    pub number: u64,
    pub locked: bool,
}

impl MetaEntity {
    pub fn new(chain_id: u64, number: u64) -> Self {
        MetaEntity {
            id: Self::entity_id(chain_id),
            chain_id,
            number,
            locked: false,
        }
    }

    pub fn entity_id(chain_id: u64) -> String {
        format!("chain_{}", chain_id)
    }

    pub fn key(chain_id: u64) -> StoreKey {
        StoreKey::entity(META_COLLECTION, Self::entity_id(chain_id))
    }

    pub fn to_entity(&self) -> Entity {
        let mut entity = Entity::new();
        entity.insert("id", json!(self.id));
        entity.insert("chain_id", json!(self.chain_id));
        entity.insert("number", json!(self.number));
        entity.insert("locked", json!(self.locked));
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self, StoreError> {
        serde_json::from_value(entity.to_value())
            .map_err(|e| StoreError::Database(anyhow::anyhow!("malformed chain cursor: {}", e)))
    }
}
