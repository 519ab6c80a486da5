//! Server-side cursor iteration: buffer documents locally, fetch the next batch with
//! `getMore` when the buffer runs dry, and best-effort `killCursors` on close.

use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bson::{doc, Bson, Document};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::client::dispatch;
use crate::error::{Error, Result};
use crate::transport::Connection;

type DispatchFuture<'a> = Pin<Box<dyn Future<Output = Result<Document>> + Send + 'a>>;

/// A type-erased handle a `Cursor` uses to issue `getMore`/`killCursors`. Hiding the
/// connection's stream type behind this trait lets `Cursor` (and its `Drop` impl) drop
/// the `S` type parameter entirely, so cleanup on drop needs no bounds on a generic type
/// the struct definition doesn't otherwise carry.
trait CursorConnection: Send + Sync {
    fn dispatch<'a>(&'a self, cmd: Document, db_name: &'a str) -> DispatchFuture<'a>;
}

impl<S> CursorConnection for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn dispatch<'a>(&'a self, cmd: Document, db_name: &'a str) -> DispatchFuture<'a> {
        Box::pin(dispatch(self, cmd, db_name))
    }
}

/// A cursor over the results of a `find` or `aggregate`. Owns a type-erased handle to the
/// connection (not a borrow of the `Client`) so it can close itself in `Drop` regardless of
/// how long the caller keeps the `Client` around.
pub struct Cursor<T = Document> {
    connection: Arc<dyn CursorConnection>,
    db_name: String,
    collection: String,
    buffer: VecDeque<Document>,
    id: i64,
    batch_size: Option<i32>,
    /// Mirrors the find/aggregate `limit`; per the close contract, a cursor opened with a
    /// nonzero limit is never explicitly killed (the server already knows to exhaust it).
    limit: i64,
    _marker: PhantomData<T>,
}

impl<T> Cursor<T> {
    pub(crate) fn new<S>(
        connection: Arc<Connection<S>>,
        db_name: impl Into<String>,
        collection: impl Into<String>,
        first_batch: Vec<Document>,
        id: i64,
        batch_size: Option<i32>,
        limit: i64,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self {
            connection,
            db_name: db_name.into(),
            collection: collection.into(),
            buffer: first_batch.into(),
            id,
            batch_size,
            limit,
            _marker: PhantomData,
        }
    }

    /// True once the server reports the cursor exhausted and the local buffer has drained.
    pub fn is_exhausted(&self) -> bool {
        self.id == 0 && self.buffer.is_empty()
    }

    async fn fetch_more(&mut self) -> Result<()> {
        let mut cmd = doc! {
            "getMore": self.id,
            "collection": self.collection.clone(),
        };
        if let Some(batch_size) = self.batch_size {
            cmd.insert("batchSize", batch_size);
        }
        let reply = self.connection.dispatch(cmd, &self.db_name).await?;
        let cursor = reply
            .get_document("cursor")
            .map_err(|_| Error::protocol("getMore reply missing cursor"))?;
        let next_batch = cursor
            .get_array("nextBatch")
            .map_err(|_| Error::protocol("getMore reply missing cursor.nextBatch"))?;
        self.buffer
            .extend(next_batch.iter().filter_map(Bson::as_document).cloned());
        self.id = cursor.get_i64("id").unwrap_or(0);
        Ok(())
    }

    /// Best-effort `killCursors`, idempotent. Safe to call more than once; a second call is
    /// a no-op once `id` has been zeroed.
    pub async fn close(&mut self) -> Result<()> {
        if self.id > 0 && self.limit != 0 {
            let id = self.id;
            let collection = self.collection.clone();
            let db_name = self.db_name.clone();
            let _ = self
                .connection
                .dispatch(doc! { "killCursors": collection, "cursors": [id] }, &db_name)
                .await;
        }
        self.id = 0;
        Ok(())
    }
}

impl<T> Cursor<T>
where
    T: DeserializeOwned,
{
    /// Pull the next document from the buffer, fetching another batch first if it's empty
    /// and the server side isn't exhausted.
    pub async fn try_next(&mut self) -> Result<Option<T>> {
        if self.buffer.is_empty() {
            if self.id == 0 {
                return Ok(None);
            }
            self.fetch_more().await?;
            if self.buffer.is_empty() {
                return Ok(None);
            }
        }
        let doc = self.buffer.pop_front().expect("checked non-empty above");
        Ok(Some(bson::from_document(doc)?))
    }

    /// Drain the cursor into a `Vec`, fetching as many batches as needed.
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.try_next().await? {
            out.push(item);
        }
        self.close().await?;
        Ok(out)
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        if self.id <= 0 || self.limit == 0 {
            return;
        }
        // Best-effort cleanup: fire-and-forget since `Drop` can't be `async`. If there is
        // no runtime to spawn onto (e.g. the cursor outlives the tokio runtime it was
        // created on), the cursor is simply left to the server's own idle-cursor reaper.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let id = self.id;
            let collection = self.collection.clone();
            let db_name = self.db_name.clone();
            let connection = Arc::clone(&self.connection);
            handle.spawn(async move {
                let _ = connection
                    .dispatch(doc! { "killCursors": collection, "cursors": [id] }, &db_name)
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::Connection;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn make_cursor(
        connection: Arc<Connection<tokio::io::DuplexStream>>,
        first_batch: Vec<Document>,
        id: i64,
    ) -> Cursor<Document> {
        Cursor::new(connection, "testdb", "things", first_batch, id, None, -1)
    }

    #[tokio::test]
    async fn drains_the_local_buffer_before_fetching() {
        let (client_side, _server_side) = tokio::io::duplex(4096);
        let connection = Arc::new(Connection::from_stream(client_side));
        let mut cursor = make_cursor(connection, vec![doc! { "a": 1 }, doc! { "a": 2 }], 0);

        let first: Option<Document> = cursor.try_next().await.unwrap();
        let second: Option<Document> = cursor.try_next().await.unwrap();
        let third: Option<Document> = cursor.try_next().await.unwrap();
        assert_eq!(first.unwrap().get_i32("a").unwrap(), 1);
        assert_eq!(second.unwrap().get_i32("a").unwrap(), 2);
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn fetches_the_next_batch_via_get_more() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let connection = Arc::new(Connection::from_stream(client_side));
        let mut cursor = make_cursor(connection, vec![doc! { "a": 1 }], 42);

        let server = tokio::spawn(async move {
            let header = crate::wire::Header::read_from(&mut server_side).await.unwrap();
            let body_len = header.body_length().unwrap();
            let mut body = vec![0u8; body_len];
            server_side.read_exact(&mut body).await.unwrap();

            let reply_body = doc! {
                "ok": 1.0,
                "cursor": { "id": 0i64, "nextBatch": [ { "a": 2 } ] },
            };
            let bytes = crate::wire::encode_request(reply_body, "testdb", 0, None).unwrap();
            let mut bytes = bytes;
            bytes[8..12].copy_from_slice(&header.request_id.to_le_bytes());
            server_side.write_all(&bytes).await.unwrap();
            server_side.flush().await.unwrap();
        });

        let first: Document = cursor.try_next().await.unwrap().unwrap();
        let second: Document = cursor.try_next().await.unwrap().unwrap();
        let third: Option<Document> = cursor.try_next().await.unwrap();
        assert_eq!(first.get_i32("a").unwrap(), 1);
        assert_eq!(second.get_i32("a").unwrap(), 2);
        assert!(third.is_none());
        assert!(cursor.is_exhausted());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_only_sends_kill_cursors_once() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let connection = Arc::new(Connection::from_stream(client_side));
        let mut cursor = make_cursor(connection, vec![], 7);

        let server = tokio::spawn(async move {
            let header = crate::wire::Header::read_from(&mut server_side).await.unwrap();
            let body_len = header.body_length().unwrap();
            let mut body = vec![0u8; body_len];
            server_side.read_exact(&mut body).await.unwrap();
            let reply_body = doc! { "ok": 1.0 };
            let mut bytes = crate::wire::encode_request(reply_body, "testdb", 0, None).unwrap();
            bytes[8..12].copy_from_slice(&header.request_id.to_le_bytes());
            server_side.write_all(&bytes).await.unwrap();
            server_side.flush().await.unwrap();
        });

        cursor.close().await.unwrap();
        server.await.unwrap();
        assert_eq!(cursor.id, 0);
        // A second close should not attempt to touch the (by now dropped) server side.
        cursor.close().await.unwrap();
    }
}
