//! An asynchronous MongoDB client driver core: wire-protocol codec, SCRAM authentication,
//! session/transaction state machine, cursor pagination, and GridFS chunked-blob storage.
//!
//! Out of scope (by design — see the crate's design notes): connection pooling, replica-set
//! topology discovery/failover, retryable writes, and change streams. A single connection
//! with serialized request/response is the whole transport model.

pub mod client;
pub mod coll;
pub mod cursor;
pub mod db;
pub mod error;
pub mod gridfs;
pub mod hello;
pub mod index;
pub mod results;
pub mod schema;
pub mod transport;
pub mod wire;

pub use client::auth::AuthCredentials;
pub use client::options::ConnectionString;
pub use client::session::{Session, Transaction, TransactionState};
pub use client::Client;
pub use coll::{Collection, WriteModel};
pub use cursor::Cursor;
pub use db::Database;
pub use error::{Error, ErrorKind, OperationFailure, Result};
pub use gridfs::{GridFsBucket, GridFsFile, GridFsInput};
pub use index::IndexModel;
pub use schema::{Field, FieldType, SchemaGenerator};
