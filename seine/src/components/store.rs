use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Field every entity is addressed by within its collection.
pub const ID: &str = "id";

/// Server-assigned document id. Stripped from every value on write; the
/// engine never round-trips it.
pub const OBJECT_ID: &str = "_id";

/// Block timestamp of the version. Part of the uniqueness key of immutable
/// collections; the newest `_block_ts` per id is the current view.
pub const BLOCK_TS: &str = "_block_ts";

/// Block number of the version.
pub const BLOCK_NUM: &str = "_block_num";

/// Chain the version was written from.
pub const CHAIN_ID: &str = "_chain_id";

/// Distinguished collection holding the per-chain cursor state. Always
/// mutable, always read through to the database.
pub const META_COLLECTION: &str = "__meta__";

/// A store record: a named bag of JSON attributes. Entities are unique by
/// `id` within a mutable collection and by `(id, _block_ts, _block_num,
/// _chain_id)` within an immutable one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(BTreeMap<String, Value>);

impl Entity {
    pub fn new() -> Self {
        Entity(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The entity id, when present and a string.
    pub fn id(&self) -> Option<&str> {
        self.get(ID).and_then(Value::as_str)
    }

    /// The `_block_ts` attribute as an integer; versions missing it sort first.
    pub fn block_ts(&self) -> i64 {
        self.get(BLOCK_TS).and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn block_num(&self) -> i64 {
        self.get(BLOCK_NUM).and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn chain_id_field(&self) -> i64 {
        self.get(CHAIN_ID).and_then(Value::as_i64).unwrap_or(0)
    }

    /// Drop the reserved server-assigned document id.
    pub fn strip_object_id(&mut self) {
        self.0.remove(OBJECT_ID);
    }

    /// Whether `other` carries the same `(id, _block_ts, _block_num,
    /// _chain_id)` version key as `self`.
    pub fn same_version(&self, other: &Entity) -> bool {
        self.id() == other.id()
            && self.block_ts() == other.block_ts()
            && self.block_num() == other.block_num()
            && self.chain_id_field() == other.chain_id_field()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }
}

impl FromIterator<(String, Value)> for Entity {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Entity(iter.into_iter().collect())
    }
}

impl TryFrom<Value> for Entity {
    type Error = StoreError;

    fn try_from(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(StoreError::Database(anyhow::anyhow!(
                "expected a JSON object for an entity, got {}",
                other
            ))),
        }
    }
}

/// A parsed store key. `"<ref>.<id>"` addresses one entity, a bare `"<ref>"`
/// addresses the whole collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub collection: String,
    pub id: Option<String>,
}

impl StoreKey {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw.split_once('.') {
            Some((collection, id)) if !collection.is_empty() && !id.is_empty() => Ok(StoreKey {
                collection: collection.to_owned(),
                id: Some(id.to_owned()),
            }),
            Some(_) => Err(StoreError::BadKey(raw.to_owned())),
            None if raw.is_empty() => Err(StoreError::BadKey(raw.to_owned())),
            None => Ok(StoreKey {
                collection: raw.to_owned(),
                id: None,
            }),
        }
    }

    pub fn entity(collection: impl Into<String>, id: impl Into<String>) -> Self {
        StoreKey {
            collection: collection.into(),
            id: Some(id.into()),
        }
    }

    pub fn collection(collection: impl Into<String>) -> Self {
        StoreKey {
            collection: collection.into(),
            id: None,
        }
    }

    pub fn is_meta(&self) -> bool {
        self.collection == META_COLLECTION
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}.{}", self.collection, id),
            None => write!(f, "{}", self.collection),
        }
    }
}

/// What a `get` resolved to: one entity for `"<ref>.<id>"` keys, the
/// collection (or its materialised view) for bare `"<ref>"` keys.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreValue {
    One(Entity),
    Many(Vec<Entity>),
}

impl StoreValue {
    pub fn into_one(self) -> Option<Entity> {
        match self {
            StoreValue::One(entity) => Some(entity),
            StoreValue::Many(_) => None,
        }
    }

    pub fn entities(self) -> Vec<Entity> {
        match self {
            StoreValue::One(entity) => vec![entity],
            StoreValue::Many(entities) => entities,
        }
    }
}

/// One operation inside a `batch`.
#[derive(Clone, Debug)]
pub enum BatchOp {
    Put { key: StoreKey, value: Entity },
    Del { key: StoreKey },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("malformed store key: `{0}`")]
    BadKey(String),

    #[error("value id `{value}` does not match key `{key}`")]
    IdMismatch { key: String, value: String },

    /// A per-collection bulk write failed. Writes commit independently per
    /// collection, so the caller retries this collection's ops as a unit.
    #[error("bulk write to collection `{collection}` failed: {source}")]
    Bulk {
        collection: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// The durable store contract the engine and user handlers consume.
///
/// Keys take the form `"<ref>.<id>"`; a bare `"<ref>"` is permitted on `get`
/// for collection scans. Mutable collections upsert by `id`; immutable ones
/// insert a new version per `(id, _block_ts, _block_num, _chain_id)` and
/// serve the newest `_block_ts` per id as the current view.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &StoreKey) -> Result<StoreValue, StoreError>;

    async fn put(&self, key: &StoreKey, value: Entity) -> Result<(), StoreError>;

    async fn del(&self, key: &StoreKey) -> Result<(), StoreError>;

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Multi-put sugar: every `"<ref>.<id>" => value` pair becomes a put in
    /// a single batch.
    async fn update(&self, entries: HashMap<String, Entity>) -> Result<(), StoreError> {
        let ops = entries
            .into_iter()
            .map(|(raw, value)| {
                Ok(BatchOp::Put {
                    key: StoreKey::parse(&raw)?,
                    value,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.batch(ops).await
    }
}
