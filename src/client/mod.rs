//! The top-level `Client`: owns the connection, drives the handshake, and dispatches
//! commands with the transaction/error-classification envelope every operation shares.

pub mod auth;
pub mod options;
pub mod session;

use std::sync::Arc;

use bson::{doc, Bson, Document};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::coll::Collection;
use crate::db::Database;
use crate::error::{Error, OperationFailure, Result};
use crate::hello::{self, HelloResult};
use crate::transport::{Connection, Stream};
use crate::wire::CompressorId;

use self::auth::authenticate;
use self::options::ConnectionString;
use self::session::{Session, Transaction};

/// A connected MongoDB client. Generic over the stream type so tests can drive the whole
/// handshake + dispatch stack over an in-memory duplex pair instead of a live server.
///
/// The connection is held behind an `Arc` so a `Cursor` can outlive the borrow that produced
/// it and close itself from a `Drop` impl without needing the `Client` to stay in scope.
pub struct Client<S = Stream> {
    connection: Arc<Connection<S>>,
    hello: HelloResult,
}

impl Client<Stream> {
    /// Parse `uri`, open a TCP connection, run the handshake, and authenticate if the URI
    /// carries credentials.
    pub async fn connect(uri: &str) -> Result<Self> {
        let parsed = ConnectionString::parse(uri)?;
        let connection = Connection::connect_with_tls(&parsed.host, parsed.port, parsed.tls).await?;
        Self::handshake(connection, &parsed).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    /// Run the `hello` handshake and (if credentials are present) SCRAM authentication over
    /// an already-open stream. Split out from `connect` so tests can hand in a duplex pair.
    pub async fn handshake(mut connection: Connection<S>, parsed: &ConnectionString) -> Result<Self> {
        let hello = hello::run_hello(&connection).await?;

        let negotiated = negotiate_compressor(&parsed.supported_compressors(), &hello.compression);
        connection.set_compressor(negotiated);

        if let Some(credentials) = parsed.credentials() {
            authenticate(&connection, &credentials, &hello.sasl_supported_mechs).await?;
        }

        Ok(Self {
            connection: Arc::new(connection),
            hello,
        })
    }

    /// A cheaply-cloneable handle to the underlying connection, for components (like
    /// `Cursor`) that must outlive the borrow which created them.
    pub(crate) fn connection_handle(&self) -> Arc<Connection<S>> {
        Arc::clone(&self.connection)
    }

    /// Assemble a `Client` directly from an already-handshaken connection, bypassing
    /// `connect`/`handshake`. Used by other modules' unit tests that need a `Client` wired
    /// to an in-memory duplex pair without performing a real `hello`.
    #[cfg(test)]
    pub(crate) fn for_testing(connection: Connection<S>, hello: HelloResult) -> Self {
        Self {
            connection: Arc::new(connection),
            hello,
        }
    }

    pub fn hello(&self) -> &HelloResult {
        &self.hello
    }

    pub fn get_database(&self, name: impl Into<String>) -> Database<'_, S> {
        Database::new(self, name.into())
    }

    pub fn get_collection(
        &self,
        db_name: impl Into<String>,
        coll_name: impl Into<String>,
    ) -> Collection<'_, S> {
        self.get_database(db_name).collection(coll_name)
    }

    /// A GridFS bucket over `db_name`, using `prefix` (default convention: `"fs"`) for its
    /// two backing collections (`<prefix>.files`/`<prefix>.chunks`).
    pub fn gridfs_bucket(&self, db_name: impl Into<String>, prefix: &str) -> crate::gridfs::GridFsBucket<'_, S> {
        crate::gridfs::GridFsBucket::new(self, db_name, prefix)
    }

    /// Dispatch `body` against `db_name`, stamping it with `transaction`'s metadata if one is
    /// attached and active, and classifying the reply into `Ok`/`OperationFailure`. On
    /// failure, an attached transaction is marked ABORTED with the captured error before the
    /// error is surfaced to the caller.
    pub async fn request(
        &self,
        body: Document,
        db_name: &str,
        transaction: Option<&mut Transaction>,
    ) -> Result<Document> {
        let mut cmd = body;
        cmd.entry("$db".to_string()).or_insert_with(|| Bson::String(db_name.to_string()));

        if let Some(txn) = transaction.as_deref() {
            if txn.is_active() {
                txn.apply_to(&mut cmd);
            }
        }

        let command_name = command_name(&cmd).to_string();
        tracing::trace!(command = %command_name, db = %db_name, "dispatching command");
        let reply = self.connection.exchange(cmd, db_name).await?;

        match classify_reply(&reply) {
            None => {
                tracing::trace!(command = %command_name, db = %db_name, "command succeeded");
                if let Some(txn) = transaction {
                    if txn.is_active() {
                        txn.record_success();
                    }
                }
                Ok(reply)
            }
            Some(failure) => {
                tracing::debug!(command = %command_name, db = %db_name, code = failure.code, "command failed");
                if let Some(txn) = transaction {
                    txn.record_failure(Error::operation(failure.clone()));
                }
                Err(Error::operation(failure))
            }
        }
    }

    pub async fn start_session(&self) -> Result<Session> {
        let reply = self.request(doc! { "startSession": 1 }, "admin", None).await?;
        let id = reply
            .get_document("id")
            .map_err(|_| Error::protocol("startSession reply missing id"))?
            .clone();
        Ok(Session::new(id))
    }

    pub async fn refresh_sessions(&self, sessions: &[&Session]) -> Result<()> {
        let lsids: Vec<Bson> = sessions.iter().map(|s| Bson::Document(s.id().clone())).collect();
        self.request(doc! { "refreshSessions": lsids }, "admin", None).await?;
        Ok(())
    }

    pub async fn end_sessions(&self, sessions: &[&Session]) -> Result<()> {
        let lsids: Vec<Bson> = sessions.iter().map(|s| Bson::Document(s.id().clone())).collect();
        self.request(doc! { "endSessions": lsids }, "admin", None).await?;
        Ok(())
    }

    pub async fn build_info(&self) -> Result<Document> {
        self.request(doc! { "buildInfo": 1 }, "admin", None).await
    }

    pub async fn logout(&self, db_name: &str) -> Result<()> {
        self.request(doc! { "logout": 1 }, db_name, None).await?;
        Ok(())
    }

    pub async fn list_database_names(&self) -> Result<Vec<String>> {
        let reply = self
            .request(doc! { "listDatabases": 1, "nameOnly": true }, "admin", None)
            .await?;
        let databases = reply
            .get_array("databases")
            .map_err(|_| Error::protocol("listDatabases reply missing databases array"))?;
        Ok(databases
            .iter()
            .filter_map(|entry| entry.as_document()?.get_str("name").ok().map(str::to_string))
            .collect())
    }

    pub async fn drop_database(&self, db_name: &str) -> Result<()> {
        self.request(doc! { "dropDatabase": 1 }, db_name, None).await?;
        Ok(())
    }

    /// `find` over `system.users` in `db_name`, per the database's user collection.
    pub async fn list_users(&self, db_name: &str) -> Result<Vec<Document>> {
        let reply = self
            .request(doc! { "find": "system.users", "filter": {} }, db_name, None)
            .await?;
        let batch = reply
            .get_document("cursor")
            .and_then(|c| c.get_array("firstBatch"))
            .map_err(|_| Error::protocol("find reply missing cursor.firstBatch"))?;
        Ok(batch.iter().filter_map(Bson::as_document).cloned().collect())
    }

    pub async fn get_log(&self, name: &str) -> Result<Vec<String>> {
        let reply = self.request(doc! { "getLog": name }, "admin", None).await?;
        let log = reply
            .get_array("log")
            .map_err(|_| Error::protocol("getLog reply missing log array"))?;
        Ok(log.iter().filter_map(|l| l.as_str().map(str::to_string)).collect())
    }

    pub async fn fsync(&self, lock: bool) -> Result<()> {
        self.request(doc! { "fsync": 1, "lock": lock }, "admin", None).await?;
        Ok(())
    }

    pub async fn fsync_unlock(&self) -> Result<()> {
        self.request(doc! { "fsyncUnlock": 1 }, "admin", None).await?;
        Ok(())
    }

    pub async fn rename_collection(
        &self,
        from_namespace: &str,
        to_namespace: &str,
        drop_target: bool,
    ) -> Result<()> {
        self.request(
            doc! {
                "renameCollection": from_namespace,
                "to": to_namespace,
                "dropTarget": drop_target,
            },
            "admin",
            None,
        )
        .await?;
        Ok(())
    }

    /// Sends `shutdown` without waiting for a reply: the server tears the connection down
    /// as part of shutting down rather than replying to it.
    pub async fn shutdown(&self) -> Result<()> {
        self.connection.send_no_reply(doc! { "shutdown": 1 }, "admin").await
    }

    pub async fn repl_set_initiate(&self, config: Option<Document>) -> Result<()> {
        let cmd = match config {
            Some(config) => doc! { "replSetInitiate": config },
            None => doc! { "replSetInitiate": Bson::Null },
        };
        self.request(cmd, "admin", None).await?;
        Ok(())
    }

    pub async fn repl_set_reconfig(&self, config: Document, force: bool) -> Result<()> {
        self.request(
            doc! { "replSetReconfig": config, "force": force },
            "admin",
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn repl_set_get_status(&self) -> Result<Document> {
        self.request(doc! { "replSetGetStatus": 1 }, "admin", None).await
    }

    pub async fn set_user_write_block_mode(&self, block: bool) -> Result<()> {
        self.request(
            doc! { "setUserWriteBlockMode": 1, "global": block },
            "admin",
            None,
        )
        .await?;
        Ok(())
    }
}

fn negotiate_compressor(requested: &[CompressorId], server_offered: &[String]) -> Option<CompressorId> {
    requested
        .iter()
        .find(|candidate| {
            server_offered
                .iter()
                .any(|name| CompressorId::from_name(name) == Some(**candidate))
        })
        .copied()
}

/// Send `cmd` over `connection` against `db_name` and classify the reply, without any
/// transaction bookkeeping. Shared by `Client::request` and by `Cursor`'s `getMore`/
/// `killCursors` calls, which hold a connection handle but not a `Client` borrow.
pub(crate) async fn dispatch<S: AsyncRead + AsyncWrite + Unpin>(
    connection: &Connection<S>,
    mut cmd: Document,
    db_name: &str,
) -> Result<Document> {
    cmd.entry("$db".to_string()).or_insert_with(|| Bson::String(db_name.to_string()));
    tracing::trace!(command = %command_name(&cmd), db = %db_name, "dispatching command");
    let reply = connection.exchange(cmd, db_name).await?;
    match classify_reply(&reply) {
        None => Ok(reply),
        Some(failure) => {
            tracing::debug!(db = %db_name, code = failure.code, "command failed");
            Err(Error::operation(failure))
        }
    }
}

/// The command's name is its first key once `$db` (inserted above) is accounted for —
/// BSON document iteration order is insertion order, so this is always the caller's
/// original leading key (e.g. `"insert"`, `"find"`, `"hello"`).
fn command_name(cmd: &Document) -> &str {
    cmd.keys().next().map(String::as_str).unwrap_or("unknown")
}

/// Classify a command reply per the dispatcher's precedence: `writeErrors` first, then
/// `writeConcernError`, then the bare top-level `code`. Returns `None` on success.
pub(crate) fn classify_reply(reply: &Document) -> Option<OperationFailure> {
    let labels: Vec<String> = reply
        .get_array("errorLabels")
        .ok()
        .map(|labels| labels.iter().filter_map(|l| l.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    if let Ok(write_errors) = reply.get_array("writeErrors") {
        if let Some(first) = write_errors.first().and_then(Bson::as_document) {
            let code = first.get_i32("code").unwrap_or(-1);
            let message = first.get_str("errmsg").unwrap_or("write error").to_string();
            return Some(OperationFailure::new(code, message, labels));
        }
    }

    if let Ok(write_concern_error) = reply.get_document("writeConcernError") {
        let code = write_concern_error.get_i32("code").unwrap_or(-1);
        let message = write_concern_error
            .get_str("errmsg")
            .unwrap_or("write concern error")
            .to_string();
        return Some(OperationFailure::new(code, message, labels));
    }

    if reply.get_f64("ok").unwrap_or(0.0) != 1.0 {
        let code = reply.get_i32("code").unwrap_or(-1);
        let message = reply.get_str("errmsg").unwrap_or("command failed").to_string();
        return Some(OperationFailure::new(code, message, labels));
    }

    None
}
