use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use seine::prelude::{Entity, StoreError};

use crate::documents::{BulkOp, DocumentDatabase, VIEW_PAGE_SIZE};

/// A document database held entirely in memory. Without native aggregation
/// the latest-per-id view is computed application-side with a sort and fold
/// over each collection.
///
/// Every operation is journalled, which the adapter tests use to assert the
/// shape of the writes the adapter issues.
#[derive(Default)]
pub struct MemoryDocuments {
    collections: RwLock<HashMap<String, Vec<Entity>>>,
    journal: Mutex<Vec<String>>,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        MemoryDocuments::default()
    }

    /// The operations issued so far, in order.
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .unwrap()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn record(&self, line: String) {
        self.journal.lock().unwrap().push(line);
    }

    /// Index of the newest version of `id`: highest `_block_ts`, later
    /// insertions winning ties.
    fn newest_index(docs: &[Entity], id: &str) -> Option<usize> {
        let mut newest: Option<usize> = None;
        for (index, doc) in docs.iter().enumerate() {
            if doc.id() != Some(id) {
                continue;
            }
            match newest {
                Some(best) if docs[best].block_ts() > doc.block_ts() => {}
                _ => newest = Some(index),
            }
        }
        newest
    }

    fn apply_replace(docs: &mut Vec<Entity>, doc: &Entity, versioned: bool) {
        let position = if versioned {
            docs.iter().position(|existing| existing.same_version(doc))
        } else {
            docs.iter().position(|existing| existing.id() == doc.id())
        };
        match position {
            Some(index) => docs[index] = doc.clone(),
            None => docs.push(doc.clone()),
        }
    }
}

#[async_trait]
impl DocumentDatabase for MemoryDocuments {
    async fn find_newest(&self, collection: &str, id: &str) -> Result<Option<Entity>, StoreError> {
        self.record(format!("find_newest {} id={}", collection, id));
        let collections = self.collections.read().unwrap();
        let docs = match collections.get(collection) {
            Some(docs) => docs,
            None => return Ok(None),
        };
        Ok(Self::newest_index(docs, id).map(|index| docs[index].clone()))
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<Entity>, StoreError> {
        self.record(format!("find_all {}", collection));
        Ok(self
            .collections
            .read()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_versions_page(
        &self,
        collection: &str,
        skip: u64,
    ) -> Result<Vec<Entity>, StoreError> {
        self.record(format!("latest_versions {} skip={}", collection, skip));
        let collections = self.collections.read().unwrap();
        let docs = match collections.get(collection) {
            Some(docs) => docs,
            None => return Ok(Vec::new()),
        };

        // Sort and fold: newest version per id, then a stable id order for
        // paging.
        let mut newest: HashMap<&str, usize> = HashMap::new();
        for (index, doc) in docs.iter().enumerate() {
            let id = match doc.id() {
                Some(id) => id,
                None => continue,
            };
            match newest.get(id) {
                Some(&best) if docs[best].block_ts() > doc.block_ts() => {}
                _ => {
                    newest.insert(id, index);
                }
            }
        }

        let mut view: Vec<(&str, usize)> = newest.into_iter().collect();
        view.sort_by_key(|(id, _)| id.to_owned());

        Ok(view
            .into_iter()
            .skip(skip as usize)
            .take(VIEW_PAGE_SIZE as usize)
            .map(|(_, index)| docs[index].clone())
            .collect())
    }

    async fn replace_mutable(
        &self,
        collection: &str,
        id: &str,
        doc: &Entity,
    ) -> Result<(), StoreError> {
        self.record(format!("replace_mutable {} id={}", collection, id));
        let mut collections = self.collections.write().unwrap();
        Self::apply_replace(collections.entry(collection.to_owned()).or_default(), doc, false);
        Ok(())
    }

    async fn replace_version(&self, collection: &str, doc: &Entity) -> Result<(), StoreError> {
        self.record(format!(
            "replace_version {} id={} ts={}",
            collection,
            doc.id().unwrap_or(""),
            doc.block_ts()
        ));
        let mut collections = self.collections.write().unwrap();
        Self::apply_replace(collections.entry(collection.to_owned()).or_default(), doc, true);
        Ok(())
    }

    async fn delete_newest(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.record(format!("delete_newest {} id={}", collection, id));
        let mut collections = self.collections.write().unwrap();
        if let Some(docs) = collections.get_mut(collection) {
            if let Some(index) = Self::newest_index(docs, id) {
                docs.remove(index);
            }
        }
        Ok(())
    }

    async fn bulk(&self, collection: &str, ops: &[BulkOp]) -> Result<(), StoreError> {
        let shape: Vec<String> = ops
            .iter()
            .map(|op| match op {
                BulkOp::Replace { doc, versioned: true } => {
                    format!("replace_version:{}", doc.id().unwrap_or(""))
                }
                BulkOp::Replace { doc, versioned: false } => {
                    format!("replace:{}", doc.id().unwrap_or(""))
                }
                BulkOp::Delete { id } => format!("delete_many:{}", id),
            })
            .collect();
        self.record(format!("bulk {} unordered [{}]", collection, shape.join(" ")));

        let mut collections = self.collections.write().unwrap();
        let docs = collections.entry(collection.to_owned()).or_default();
        for op in ops {
            match op {
                BulkOp::Replace { doc, versioned } => Self::apply_replace(docs, doc, *versioned),
                BulkOp::Delete { id } => docs.retain(|existing| existing.id() != Some(id.as_str())),
            }
        }
        Ok(())
    }
}
