//! The `Collection` handle: thin typed wrappers over `Database::command` for CRUD, bulk
//! write, indexes, and aggregation, grounded on the distilled driver's `Collection` class.

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::client::session::Transaction;
use crate::client::Client;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::index::IndexModel;
use crate::results::{
    BulkWriteResult, CreateIndexesResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult,
};

/// One write or delete operation compiled into a single ordered `bulk_write` call.
///
/// Grouped into per-kind batches in the order supplied, matching the server's own
/// `insert`/`update`/`delete` command shapes rather than a single heterogeneous command
/// (the server has no combined "bulkWrite" opcode for this driver's command set).
#[derive(Clone, Debug)]
pub enum WriteModel {
    InsertOne(Document),
    UpdateOne { filter: Document, update: Document, upsert: bool },
    UpdateMany { filter: Document, update: Document, upsert: bool },
    DeleteOne(Document),
    DeleteMany { filter: Document, limit: i64 },
}

/// A handle to one collection in one database. Borrows the `Client` it came from; carries
/// no state of its own beyond the namespace (db name + collection name).
pub struct Collection<'a, S> {
    client: &'a Client<S>,
    db_name: String,
    name: String,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static> Collection<'a, S> {
    pub(crate) fn new(client: &'a Client<S>, db_name: String, name: String) -> Self {
        Self { client, db_name, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db_name, self.name)
    }

    async fn command(&self, cmd: Document, transaction: Option<&mut Transaction>) -> Result<Document> {
        self.client.request(cmd, &self.db_name, transaction).await
    }

    /// Insert `doc`, assigning a fresh `ObjectId` `_id` if the caller didn't set one.
    /// Returns the `_id` that was actually inserted.
    pub async fn insert_one(
        &self,
        mut doc: Document,
        transaction: Option<&mut Transaction>,
    ) -> Result<InsertOneResult> {
        doc.entry("_id".to_string())
            .or_insert_with(|| Bson::ObjectId(ObjectId::new()));
        let inserted_id = doc.get("_id").cloned().expect("just inserted above");
        let cmd = doc! {
            "insert": self.name.clone(),
            "ordered": true,
            "documents": [doc],
        };
        self.command(cmd, transaction).await?;
        Ok(InsertOneResult { inserted_id })
    }

    /// Insert every document in `docs`, assigning a fresh `_id` to any that lack one.
    /// Empty input is a usage error per the contract (there is nothing meaningful to
    /// report back as "inserted in order").
    pub async fn insert_many(
        &self,
        docs: Vec<Document>,
        transaction: Option<&mut Transaction>,
    ) -> Result<InsertManyResult> {
        if docs.is_empty() {
            return Err(Error::usage("insert_many requires at least one document"));
        }
        let mut prepared = docs;
        for doc in prepared.iter_mut() {
            doc.entry("_id".to_string())
                .or_insert_with(|| Bson::ObjectId(ObjectId::new()));
        }
        let inserted_ids = prepared
            .iter()
            .enumerate()
            .map(|(i, doc)| (i, doc.get("_id").cloned().expect("just inserted above")))
            .collect();
        let cmd = doc! {
            "insert": self.name.clone(),
            "ordered": true,
            "documents": prepared,
        };
        self.command(cmd, transaction).await?;
        Ok(InsertManyResult { inserted_ids })
    }

    async fn run_update(
        &self,
        filter: Document,
        update: Document,
        multi: bool,
        upsert: bool,
        transaction: Option<&mut Transaction>,
    ) -> Result<UpdateResult> {
        let cmd = doc! {
            "update": self.name.clone(),
            "ordered": true,
            "updates": [ { "q": filter, "u": update, "multi": multi, "upsert": upsert } ],
        };
        let reply = self.command(cmd, transaction).await?;
        let matched_count = reply.get_i32("n").unwrap_or(0) as u64;
        let modified_count = reply.get_i32("nModified").unwrap_or(0) as u64;
        let upserted_id = reply
            .get_array("upserted")
            .ok()
            .and_then(|u| u.first())
            .and_then(Bson::as_document)
            .and_then(|d| d.get("_id"))
            .cloned();
        Ok(UpdateResult {
            matched_count,
            modified_count,
            upserted_id,
        })
    }

    /// `update` is passed verbatim: callers supply `{$set: ...}` etc. themselves.
    pub async fn update_one(
        &self,
        filter: Document,
        update: Document,
        upsert: bool,
        transaction: Option<&mut Transaction>,
    ) -> Result<UpdateResult> {
        self.run_update(filter, update, false, upsert, transaction).await
    }

    pub async fn update_many(
        &self,
        filter: Document,
        update: Document,
        upsert: bool,
        transaction: Option<&mut Transaction>,
    ) -> Result<UpdateResult> {
        self.run_update(filter, update, true, upsert, transaction).await
    }

    async fn run_delete(
        &self,
        filter: Document,
        limit: i64,
        transaction: Option<&mut Transaction>,
    ) -> Result<DeleteResult> {
        let cmd = doc! {
            "delete": self.name.clone(),
            "ordered": true,
            "deletes": [ { "q": filter, "limit": limit } ],
        };
        let reply = self.command(cmd, transaction).await?;
        let deleted_count = reply.get_i32("n").unwrap_or(0) as u64;
        Ok(DeleteResult { deleted_count })
    }

    /// Returns whether a document was actually removed (`n == 1`).
    pub async fn delete_one(&self, filter: Document, transaction: Option<&mut Transaction>) -> Result<bool> {
        Ok(self.run_delete(filter, 1, transaction).await?.deleted_count > 0)
    }

    pub async fn delete_many(
        &self,
        filter: Document,
        transaction: Option<&mut Transaction>,
    ) -> Result<DeleteResult> {
        self.run_delete(filter, 0, transaction).await
    }

    /// Open a lazy cursor over `filter`. `projection`/`sort`/`skip`/`limit`/`batch_size` are
    /// applied only if set; an unset `batch_size` lets the server pick its own default.
    #[allow(clippy::too_many_arguments)]
    pub async fn find(
        &self,
        filter: Document,
        projection: Option<Document>,
        sort: Option<Document>,
        skip: Option<i64>,
        limit: Option<i64>,
        batch_size: Option<i32>,
    ) -> Result<Cursor<Document>> {
        let mut cmd = doc! { "find": self.name.clone(), "filter": filter };
        if let Some(projection) = projection {
            cmd.insert("projection", projection);
        }
        if let Some(sort) = sort {
            cmd.insert("sort", sort);
        }
        if let Some(skip) = skip {
            cmd.insert("skip", skip);
        }
        let limit = limit.unwrap_or(0);
        if limit != 0 {
            cmd.insert("limit", limit);
        }
        if let Some(batch_size) = batch_size {
            cmd.insert("batchSize", batch_size);
        }
        let reply = self.command(cmd, None).await?;
        self.cursor_from_reply::<Document>(reply, batch_size, limit)
    }

    /// `find` with an implicit `limit(1)`, returning the single matching document if any.
    pub async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        let mut cursor = self.find(filter, None, None, None, Some(1), None).await?;
        let item = cursor.try_next().await?;
        cursor.close().await?;
        Ok(item)
    }

    fn cursor_from_reply<T>(
        &self,
        reply: Document,
        batch_size: Option<i32>,
        limit: i64,
    ) -> Result<Cursor<T>> {
        let cursor_doc = reply
            .get_document("cursor")
            .map_err(|_| Error::protocol("reply missing cursor document"))?;
        let first_batch = cursor_doc
            .get_array("firstBatch")
            .map_err(|_| Error::protocol("reply missing cursor.firstBatch"))?
            .iter()
            .filter_map(Bson::as_document)
            .cloned()
            .collect();
        let id = cursor_doc.get_i64("id").unwrap_or(0);
        Ok(Cursor::new(
            self.client.connection_handle(),
            self.db_name.clone(),
            self.name.clone(),
            first_batch,
            id,
            batch_size,
            limit,
        ))
    }

    /// Fetch only the first batch of an aggregation; caller-advanced pagination via the
    /// returned cursor is left to the caller rather than auto-draining.
    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Cursor<Document>> {
        let cmd = doc! {
            "aggregate": self.name.clone(),
            "pipeline": pipeline,
            "cursor": {},
        };
        let reply = self.command(cmd, None).await?;
        self.cursor_from_reply::<Document>(reply, None, -1)
    }

    pub async fn count(&self, query: Document) -> Result<u64> {
        let cmd = doc! { "count": self.name.clone(), "query": query };
        let reply = self.command(cmd, None).await?;
        Ok(reply.get_i32("n").unwrap_or(0) as u64)
    }

    pub async fn distinct(&self, key: &str, query: Document) -> Result<Vec<Bson>> {
        let cmd = doc! { "distinct": self.name.clone(), "key": key, "query": query };
        let reply = self.command(cmd, None).await?;
        Ok(reply
            .get_array("values")
            .map_err(|_| Error::protocol("distinct reply missing values array"))?
            .clone())
    }

    pub async fn create_indexes(&self, mut indexes: Vec<IndexModel>) -> Result<CreateIndexesResult> {
        for index in indexes.iter_mut() {
            index.update_name();
        }
        let documents: Vec<Document> = indexes.iter().map(IndexModel::to_document).collect();
        let index_names: Vec<String> = indexes.into_iter().filter_map(|i| i.name).collect();
        self.command(
            doc! { "createIndexes": self.name.clone(), "indexes": documents },
            None,
        )
        .await?;
        Ok(CreateIndexesResult { index_names })
    }

    pub async fn list_indexes(&self) -> Result<Vec<IndexModel>> {
        let reply = self
            .command(doc! { "listIndexes": self.name.clone() }, None)
            .await?;
        let batch = reply
            .get_document("cursor")
            .and_then(|c| c.get_array("firstBatch"))
            .map_err(|_| Error::protocol("listIndexes reply missing cursor.firstBatch"))?;
        batch
            .iter()
            .filter_map(Bson::as_document)
            .map(|d| bson::from_document(d.clone()).map_err(Error::from))
            .collect()
    }

    /// `names` of `"*"` drops every index (except `_id_`, which the server itself refuses
    /// to drop); otherwise the named subset is dropped.
    pub async fn drop_indexes(&self, names: &[&str]) -> Result<()> {
        let index: Bson = if names == ["*"] {
            Bson::String("*".to_string())
        } else {
            Bson::Array(names.iter().map(|n| Bson::String(n.to_string())).collect())
        };
        self.command(doc! { "dropIndexes": self.name.clone(), "index": index }, None)
            .await?;
        Ok(())
    }

    /// Compile an ordered list of write models into per-kind `insert`/`update`/`delete`
    /// commands, issued in input order, and aggregate their counts. Mixed-kind input
    /// issues one command per contiguous run rather than per-op, matching the server's own
    /// per-namespace command shape (there is no single combined bulk opcode here).
    pub async fn bulk_write(
        &self,
        ops: Vec<WriteModel>,
        transaction: Option<&mut Transaction>,
    ) -> Result<BulkWriteResult> {
        if ops.is_empty() {
            return Err(Error::usage("bulk_write requires at least one operation"));
        }
        let mut result = BulkWriteResult::default();
        let mut transaction = transaction;
        for (index, op) in ops.into_iter().enumerate() {
            match op {
                WriteModel::InsertOne(mut doc) => {
                    doc.entry("_id".to_string())
                        .or_insert_with(|| Bson::ObjectId(ObjectId::new()));
                    let cmd = doc! { "insert": self.name.clone(), "ordered": true, "documents": [doc] };
                    self.command(cmd, transaction.as_deref_mut()).await?;
                    result.inserted_count += 1;
                }
                WriteModel::UpdateOne { filter, update, upsert } => {
                    let r = self.run_update(filter, update, false, upsert, transaction.as_deref_mut()).await?;
                    result.matched_count += r.matched_count;
                    result.modified_count += r.modified_count;
                    if let Some(id) = r.upserted_id {
                        result.upserted_ids.insert(index, id);
                    }
                }
                WriteModel::UpdateMany { filter, update, upsert } => {
                    let r = self.run_update(filter, update, true, upsert, transaction.as_deref_mut()).await?;
                    result.matched_count += r.matched_count;
                    result.modified_count += r.modified_count;
                }
                WriteModel::DeleteOne(filter) => {
                    let r = self.run_delete(filter, 1, transaction.as_deref_mut()).await?;
                    result.deleted_count += r.deleted_count;
                }
                WriteModel::DeleteMany { filter, limit } => {
                    let r = self.run_delete(filter, limit, transaction.as_deref_mut()).await?;
                    result.deleted_count += r.deleted_count;
                }
            }
        }
        Ok(result)
    }

    /// Like [`find`](Self::find), but decodes each yielded document via `T`'s `Deserialize`
    /// impl at collection time rather than leaving raw `Document`s to the caller.
    #[allow(clippy::too_many_arguments)]
    pub async fn typed_find<T: DeserializeOwned>(
        &self,
        filter: Document,
        projection: Option<Document>,
        sort: Option<Document>,
        skip: Option<i64>,
        limit: Option<i64>,
        batch_size: Option<i32>,
    ) -> Result<Cursor<T>> {
        let mut cmd = doc! { "find": self.name.clone(), "filter": filter };
        if let Some(projection) = projection {
            cmd.insert("projection", projection);
        }
        if let Some(sort) = sort {
            cmd.insert("sort", sort);
        }
        if let Some(skip) = skip {
            cmd.insert("skip", skip);
        }
        let limit = limit.unwrap_or(0);
        if limit != 0 {
            cmd.insert("limit", limit);
        }
        if let Some(batch_size) = batch_size {
            cmd.insert("batchSize", batch_size);
        }
        let reply = self.command(cmd, None).await?;
        self.cursor_from_reply::<T>(reply, batch_size, limit)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::Client;
    use crate::transport::Connection;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn connected_client() -> (Client<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (client_side, server_side) = tokio::io::duplex(65536);
        let connection = Connection::from_stream(client_side);
        (Client::for_testing(connection, test_hello()), server_side)
    }

    fn test_hello() -> crate::hello::HelloResult {
        bson::from_document(doc! {
            "ok": 1.0,
            "maxBsonObjectSize": 16_777_216i64,
            "maxMessageSizeBytes": 48_000_000i32,
        })
        .unwrap()
    }

    async fn respond(server_side: &mut tokio::io::DuplexStream, reply_body: Document) {
        let header = crate::wire::Header::read_from(server_side).await.unwrap();
        let body_len = header.body_length().unwrap();
        let mut body = vec![0u8; body_len];
        server_side.read_exact(&mut body).await.unwrap();
        let mut bytes = crate::wire::encode_request(reply_body, "testdb", 0, None).unwrap();
        bytes[8..12].copy_from_slice(&header.request_id.to_le_bytes());
        server_side.write_all(&bytes).await.unwrap();
        server_side.flush().await.unwrap();
    }

    #[tokio::test]
    async fn insert_one_assigns_an_object_id_when_absent() {
        let (client, mut server_side) = connected_client().await;
        let coll = client.get_collection("testdb", "things");

        let server = tokio::spawn(async move {
            respond(&mut server_side, doc! { "ok": 1.0, "n": 1 }).await;
        });

        let result = coll.insert_one(doc! { "name": "dima" }, None).await.unwrap();
        assert!(matches!(result.inserted_id, Bson::ObjectId(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn insert_many_rejects_empty_input() {
        let (client, _server_side) = connected_client().await;
        let coll = client.get_collection("testdb", "things");
        let err = coll.insert_many(vec![], None).await.unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::Usage { .. }));
    }

    #[tokio::test]
    async fn delete_one_reports_whether_a_row_was_removed() {
        let (client, mut server_side) = connected_client().await;
        let coll = client.get_collection("testdb", "things");

        let server = tokio::spawn(async move {
            respond(&mut server_side, doc! { "ok": 1.0, "n": 0 }).await;
        });
        let removed = coll.delete_one(doc! { "name": "drake" }, None).await.unwrap();
        assert!(!removed);
        server.await.unwrap();
    }
}
