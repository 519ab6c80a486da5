//! Result types returned by collection CRUD operations.

use std::collections::HashMap;

use bson::Bson;

/// The result of [`Collection::insert_one`](crate::coll::Collection::insert_one).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InsertOneResult {
    pub inserted_id: Bson,
}

/// The result of [`Collection::insert_many`](crate::coll::Collection::insert_many).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct InsertManyResult {
    /// The inserted `_id`s, keyed by their position in the input batch.
    pub inserted_ids: HashMap<usize, Bson>,
}

/// The result of [`Collection::update_one`](crate::coll::Collection::update_one) or
/// [`Collection::update_many`](crate::coll::Collection::update_many).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

/// The result of [`Collection::delete_one`](crate::coll::Collection::delete_one) or
/// [`Collection::delete_many`](crate::coll::Collection::delete_many).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// The result of [`Collection::create_indexes`](crate::coll::Collection::create_indexes).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CreateIndexesResult {
    pub index_names: Vec<String>,
}

/// Aggregated counters produced by [`Collection::bulk_write`](crate::coll::Collection::bulk_write).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BulkWriteResult {
    pub inserted_count: u64,
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    /// Upserted `_id`s, keyed by the upserting operation's position in the input op list.
    pub upserted_ids: HashMap<usize, Bson>,
}
