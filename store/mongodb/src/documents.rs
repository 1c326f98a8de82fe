use async_trait::async_trait;

use seine::prelude::{Entity, StoreError};

/// Page size for the latest-per-id materialised view of an immutable
/// collection. Reads page in fixed-size batches to bound driver memory.
pub const VIEW_PAGE_SIZE: i64 = 5000;

/// One entry of a per-collection bulk write.
#[derive(Clone, Debug, PartialEq)]
pub enum BulkOp {
    /// Upsert. `versioned` selects the filter: `{id}` for mutable
    /// collections, the full `(id, _block_ts, _block_num, _chain_id)` key
    /// for immutable ones.
    Replace { doc: Entity, versioned: bool },
    /// Delete every document with this `id`.
    Delete { id: String },
}

/// The document-database surface the store adapter drives. The MongoDB
/// backend is the canonical implementation; the in-memory backend computes
/// the same views application-side.
#[async_trait]
pub trait DocumentDatabase: Send + Sync + 'static {
    /// The newest document with this `id`, ordered by `_block_ts`
    /// descending.
    async fn find_newest(&self, collection: &str, id: &str) -> Result<Option<Entity>, StoreError>;

    /// Every document of the collection.
    async fn find_all(&self, collection: &str) -> Result<Vec<Entity>, StoreError>;

    /// One page of the latest-per-id view: group by `id`, take the highest
    /// `_block_ts` per group, in a deterministic page order. Returns fewer
    /// than [`VIEW_PAGE_SIZE`] entities only on the last page.
    async fn latest_versions_page(
        &self,
        collection: &str,
        skip: u64,
    ) -> Result<Vec<Entity>, StoreError>;

    /// Replace the document whose `id` matches, inserting it if absent.
    async fn replace_mutable(
        &self,
        collection: &str,
        id: &str,
        doc: &Entity,
    ) -> Result<(), StoreError>;

    /// Replace the document whose `(id, _block_ts, _block_num, _chain_id)`
    /// matches, else insert a new version.
    async fn replace_version(&self, collection: &str, doc: &Entity) -> Result<(), StoreError>;

    /// Delete the newest document for this `id` (ordered by `_block_ts`
    /// descending). The lookup is awaited and the delete targets the found
    /// document's `_id`, so history is never deleted wholesale.
    async fn delete_newest(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Issue the collection's assembled operations as one unordered bulk
    /// write. Object ids are server-assigned.
    async fn bulk(&self, collection: &str, ops: &[BulkOp]) -> Result<(), StoreError>;
}
