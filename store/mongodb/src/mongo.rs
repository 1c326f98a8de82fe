use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::{ClientOptions, FindOneOptions, ReplaceOptions, ServerApi, ServerApiVersion};
use mongodb::{Client, Collection};

use seine::prelude::{anyhow, Context as _, Entity, StoreError};

use crate::documents::{BulkOp, DocumentDatabase, VIEW_PAGE_SIZE};

/// Document database over a MongoDB deployment.
pub struct MongoDocuments {
    client: Client,
    database_name: String,
}

impl MongoDocuments {
    pub async fn connect(connection_url: &str, database_name: &str) -> Result<Self, StoreError> {
        let mut client_options = ClientOptions::parse(connection_url)
            .await
            .context("parsing MongoDB connection url")?;
        let server_api = ServerApi::builder().version(ServerApiVersion::V1).build();
        client_options.server_api = Some(server_api);

        let client = Client::with_options(client_options).context("creating MongoDB client")?;
        client
            .database(database_name)
            .run_command(doc! { "ping": 1 }, None)
            .await
            .context("pinging MongoDB deployment")?;

        Ok(MongoDocuments {
            client,
            database_name: database_name.to_owned(),
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.client.database(&self.database_name).collection(name)
    }

    fn to_document(entity: &Entity) -> Result<Document, StoreError> {
        bson::to_document(entity)
            .map_err(|e| StoreError::Database(anyhow!("serializing entity: {}", e)))
    }

    fn from_document(mut doc: Document) -> Result<Entity, StoreError> {
        // The server-assigned object id never crosses back into the engine.
        doc.remove("_id");
        bson::from_document(doc)
            .map_err(|e| StoreError::Database(anyhow!("deserializing entity: {}", e)))
    }

    fn version_filter(doc: &Entity) -> Result<Document, StoreError> {
        let id = doc
            .id()
            .ok_or_else(|| StoreError::Database(anyhow!("entity without an id")))?;
        Ok(doc! {
            "id": id,
            "_block_ts": doc.block_ts(),
            "_block_num": doc.block_num(),
            "_chain_id": doc.chain_id_field(),
        })
    }
}

#[async_trait]
impl DocumentDatabase for MongoDocuments {
    async fn find_newest(&self, collection: &str, id: &str) -> Result<Option<Entity>, StoreError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "_block_ts": -1 })
            .build();
        let found = self
            .collection(collection)
            .find_one(doc! { "id": id }, options)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        found.map(Self::from_document).transpose()
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<Entity>, StoreError> {
        let cursor = self
            .collection(collection)
            .find(doc! {}, None)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        let docs: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        docs.into_iter().map(Self::from_document).collect()
    }

    async fn latest_versions_page(
        &self,
        collection: &str,
        skip: u64,
    ) -> Result<Vec<Entity>, StoreError> {
        let pipeline = vec![
            doc! { "$sort": { "_block_ts": -1 } },
            doc! { "$group": { "_id": "$id", "doc": { "$first": "$$ROOT" } } },
            doc! { "$replaceRoot": { "newRoot": "$doc" } },
            // A stable order so paging never skips or repeats ids.
            doc! { "$sort": { "id": 1 } },
            doc! { "$skip": skip as i64 },
            doc! { "$limit": VIEW_PAGE_SIZE },
        ];

        let mut cursor = self
            .collection(collection)
            .aggregate(pipeline, None)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;

        let mut page = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|e| StoreError::Database(e.into()))?
        {
            page.push(Self::from_document(doc)?);
        }
        Ok(page)
    }

    async fn replace_mutable(
        &self,
        collection: &str,
        id: &str,
        doc: &Entity,
    ) -> Result<(), StoreError> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.collection(collection)
            .replace_one(doc! { "id": id }, Self::to_document(doc)?, options)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        Ok(())
    }

    async fn replace_version(&self, collection: &str, doc: &Entity) -> Result<(), StoreError> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.collection(collection)
            .replace_one(Self::version_filter(doc)?, Self::to_document(doc)?, options)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        Ok(())
    }

    async fn delete_newest(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "_block_ts": -1 })
            .build();
        let found = self
            .collection(collection)
            .find_one(doc! { "id": id }, options)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;

        // The lookup is awaited and the delete filters on the found
        // document's `_id`, so concurrent inserts of newer versions are
        // never swept up.
        if let Some(found) = found {
            if let Some(object_id) = found.get("_id") {
                self.collection(collection)
                    .delete_one(doc! { "_id": object_id.clone() }, None)
                    .await
                    .map_err(|e| StoreError::Database(e.into()))?;
            }
        }
        Ok(())
    }

    async fn bulk(&self, collection: &str, ops: &[BulkOp]) -> Result<(), StoreError> {
        let mut updates: Vec<Bson> = Vec::new();
        let mut deletes: Vec<Bson> = Vec::new();

        for op in ops {
            match op {
                BulkOp::Replace { doc: entity, versioned } => {
                    let filter = if *versioned {
                        Self::version_filter(entity)?
                    } else {
                        let id = entity.id().ok_or_else(|| {
                            StoreError::Database(anyhow!("entity without an id"))
                        })?;
                        doc! { "id": id }
                    };
                    updates.push(Bson::Document(doc! {
                        "q": filter,
                        "u": Self::to_document(entity)?,
                        "upsert": true,
                        "multi": false,
                    }));
                }
                BulkOp::Delete { id } => {
                    deletes.push(Bson::Document(doc! {
                        "q": { "id": id.as_str() },
                        "limit": 0,
                    }));
                }
            }
        }

        // The driver has no mixed-model bulk; the update and delete wire
        // commands take the per-collection operation arrays directly.
        let database = self.client.database(&self.database_name);
        if !updates.is_empty() {
            database
                .run_command(
                    doc! { "update": collection, "updates": updates, "ordered": false },
                    None,
                )
                .await
                .map_err(|e| StoreError::Database(e.into()))?;
        }
        if !deletes.is_empty() {
            database
                .run_command(
                    doc! { "delete": collection, "deletes": deletes, "ordered": false },
                    None,
                )
                .await
                .map_err(|e| StoreError::Database(e.into()))?;
        }
        Ok(())
    }
}
