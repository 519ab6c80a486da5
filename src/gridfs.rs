//! GridFS: chunked large-object storage over two plain collections (`<prefix>.files` and
//! `<prefix>.chunks`), grounded on the distilled driver's `GridFS` class.

use std::path::Path;

use bson::oid::ObjectId;
use bson::{doc, Binary, Bson, DateTime, Document};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::client::Client;
use crate::coll::Collection;
use crate::error::{GridFsErrorKind, Result};
use crate::index::IndexModel;

/// Anything `put` can normalize into a byte buffer before chunking: raw bytes, UTF-8 text,
/// a filesystem path (whose basename becomes the default filename), or an arbitrary
/// readable stream consumed to completion.
pub enum GridFsInput<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
    Path(&'a Path),
    Reader(Box<dyn AsyncRead + Unpin + Send + 'a>),
}

impl<'a> From<&'a [u8]> for GridFsInput<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        GridFsInput::Bytes(bytes)
    }
}

impl<'a> From<&'a str> for GridFsInput<'a> {
    fn from(text: &'a str) -> Self {
        GridFsInput::Text(text)
    }
}

impl<'a> From<&'a Path> for GridFsInput<'a> {
    fn from(path: &'a Path) -> Self {
        GridFsInput::Path(path)
    }
}

impl GridFsInput<'_> {
    /// Normalize into an owned byte buffer plus a filename captured along the way (only
    /// the `Path` variant implies one; the caller's explicit `filename` argument still
    /// takes precedence over it).
    async fn into_bytes(self) -> Result<(Vec<u8>, Option<String>)> {
        match self {
            GridFsInput::Bytes(b) => Ok((b.to_vec(), None)),
            GridFsInput::Text(s) => Ok((s.as_bytes().to_vec(), None)),
            GridFsInput::Path(path) => {
                let bytes = tokio::fs::read(path).await?;
                let basename = path_basename(path);
                Ok((bytes, basename))
            }
            GridFsInput::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok((buf, None))
            }
        }
    }
}

fn path_basename(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

/// Chunks larger than this are never produced by `put`; the server's own 16 MiB document
/// limit caps what a single chunk document can carry, but this default is far under that
/// to keep chunk documents small and numerous instead of a few huge ones.
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

/// The metadata record `fs.files` carries for one uploaded blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GridFsFile {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub length: i64,
    #[serde(rename = "chunkSize")]
    pub chunk_size: i32,
    #[serde(rename = "uploadDate")]
    pub upload_date: DateTime,
    pub filename: Option<String>,
    #[serde(default)]
    pub metadata: Document,
}

impl GridFsFile {
    /// The hex-encoded SHA-1 this file was uploaded with, if `add_sha1` was set at `put`
    /// time.
    pub fn sha1(&self) -> Option<&str> {
        self.metadata.get_str("sha1").ok()
    }
}

/// A bucket of GridFS files under one collection prefix (default `"fs"`, giving
/// `fs.files`/`fs.chunks`).
pub struct GridFsBucket<'a, S> {
    files: Collection<'a, S>,
    chunks: Collection<'a, S>,
    indexes_ensured: std::sync::atomic::AtomicBool,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> GridFsBucket<'a, S> {
    pub fn new(client: &'a Client<S>, db_name: impl Into<String>, prefix: &str) -> Self {
        let db_name = db_name.into();
        Self {
            files: client.get_collection(db_name.clone(), format!("{prefix}.files")),
            chunks: client.get_collection(db_name, format!("{prefix}.chunks")),
            indexes_ensured: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Create the `fs.files`/`fs.chunks` indexes this bucket relies on, once. Idempotent:
    /// the server itself no-ops a `createIndexes` call for an index that already exists
    /// with the same spec, and this bucket additionally only attempts it once per process.
    async fn ensure_indexes(&self) -> Result<()> {
        if self
            .indexes_ensured
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return Ok(());
        }
        self.files
            .create_indexes(vec![IndexModel::builder()
                .keys(doc! { "filename": 1, "uploadDate": 1 })
                .build()])
            .await?;
        self.chunks
            .create_indexes(vec![IndexModel::builder()
                .keys(doc! { "files_id": 1, "n": 1 })
                .unique(Some(true))
                .build()])
            .await?;
        Ok(())
    }

    /// Normalize `input` (raw bytes, UTF-8 text, a filesystem path, or a readable stream) to
    /// a byte buffer, split it into `chunk_size`-byte chunks, insert them, then insert the
    /// file metadata record. Chunks are written before the file record so that a concurrent
    /// reader that observes the file record is guaranteed to also observe every chunk.
    ///
    /// `filename` takes precedence over the basename a `GridFsInput::Path` captures; pass
    /// `None` to fall back to that captured basename, if any.
    pub async fn put<'b>(
        &self,
        input: impl Into<GridFsInput<'b>>,
        filename: Option<&str>,
        chunk_size: Option<usize>,
        add_sha1: bool,
        metadata: Option<Document>,
    ) -> Result<ObjectId> {
        self.ensure_indexes().await?;

        let (data, captured_filename) = input.into().into_bytes().await?;
        let filename = filename.map(str::to_string).or(captured_filename);

        let chunk_size = chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        let file_id = ObjectId::new();

        let chunk_docs: Vec<Document> = data
            .chunks(chunk_size)
            .enumerate()
            .map(|(n, slice)| {
                doc! {
                    "_id": ObjectId::new(),
                    "files_id": file_id,
                    "n": n as i32,
                    "data": Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: slice.to_vec() },
                }
            })
            .collect();
        if !chunk_docs.is_empty() {
            self.chunks.insert_many(chunk_docs, None).await?;
        }

        let mut file_metadata = Document::new();
        if add_sha1 {
            let mut hasher = Sha1::new();
            hasher.update(&data);
            file_metadata.insert("sha1", hex::encode(hasher.finalize()));
        }
        if let Some(user_metadata) = metadata {
            for (k, v) in user_metadata {
                file_metadata.insert(k, v);
            }
        }

        let mut file_doc = doc! {
            "_id": file_id,
            "length": data.len() as i64,
            "chunkSize": chunk_size as i32,
            "uploadDate": DateTime::now(),
            "metadata": file_metadata,
        };
        if let Some(filename) = filename {
            file_doc.insert("filename", filename);
        }
        self.files.insert_one(file_doc, None).await?;

        Ok(file_id)
    }

    /// Fetch the file record and its chunks (in `n` order), concatenated into one buffer.
    /// If `check_sha1` and the file carries a stored `sha1`, the recomputed hash is
    /// compared and a mismatch is reported as [`GridFsErrorKind::IntegrityMismatch`].
    pub async fn get_by_file_id(&self, file_id: ObjectId, check_sha1: bool) -> Result<(GridFsFile, Vec<u8>)> {
        let file_doc = self
            .files
            .find_one(doc! { "_id": file_id })
            .await?
            .ok_or(GridFsErrorKind::FileNotFound)?;
        let file: GridFsFile = bson::from_document(file_doc)?;

        let mut cursor = self
            .chunks
            .aggregate(vec![
                doc! { "$match": { "files_id": file_id } },
                doc! { "$sort": { "n": 1 } },
            ])
            .await?;
        let mut buffer = Vec::with_capacity(file.length.max(0) as usize);
        while let Some(chunk) = cursor.try_next().await? {
            if let Some(Bson::Binary(binary)) = chunk.get("data") {
                buffer.extend_from_slice(&binary.bytes);
            }
        }

        if check_sha1 {
            if let Some(expected) = file.sha1() {
                let mut hasher = Sha1::new();
                hasher.update(&buffer);
                let actual = hex::encode(hasher.finalize());
                if actual != expected {
                    return Err(GridFsErrorKind::IntegrityMismatch {
                        expected: expected.to_string(),
                        actual,
                    }
                    .into());
                }
            }
        }

        Ok((file, buffer))
    }

    pub async fn get_by_filename(&self, filename: &str, check_sha1: bool) -> Result<(GridFsFile, Vec<u8>)> {
        let file_doc = self
            .files
            .find_one(doc! { "filename": filename })
            .await?
            .ok_or(GridFsErrorKind::FileNotFound)?;
        let id = file_doc
            .get_object_id("_id")
            .map_err(|_| GridFsErrorKind::FileNotFound)?;
        self.get_by_file_id(id, check_sha1).await
    }

    /// Delete the file record and, only if that actually removed a row, its chunks.
    pub async fn delete(&self, file_id: ObjectId) -> Result<bool> {
        let removed = self.files.delete_one(doc! { "_id": file_id }, None).await?;
        if removed {
            self.chunks.delete_many(doc! { "files_id": file_id }, None).await?;
        }
        Ok(removed)
    }

    pub async fn exists(&self, file_id: ObjectId) -> Result<bool> {
        Ok(self.files.find_one(doc! { "_id": file_id }).await?.is_some())
    }

    pub async fn list(&self) -> Result<Vec<GridFsFile>> {
        let mut cursor = self.files.find(Document::new(), None, None, None, None, None).await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            out.push(bson::from_document(doc)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunk_count_matches_ceiling_division() {
        let data = vec![0u8; 18 * 1024 * 1024];
        let n_chunks = data.chunks(DEFAULT_CHUNK_SIZE).count();
        assert_eq!(n_chunks, (18 * 1024 * 1024usize).div_ceil(DEFAULT_CHUNK_SIZE));
        assert_eq!(n_chunks, 73);
    }

    #[test]
    fn sha1_matches_known_vector() {
        let mut hasher = Sha1::new();
        hasher.update(b"");
        assert_eq!(hex::encode(hasher.finalize()), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[tokio::test]
    async fn text_input_normalizes_to_its_utf8_bytes_with_no_captured_filename() {
        let (bytes, filename) = GridFsInput::Text("hello gridfs").into_bytes().await.unwrap();
        assert_eq!(bytes, b"hello gridfs");
        assert!(filename.is_none());
    }

    #[tokio::test]
    async fn path_input_captures_its_basename_as_a_filename() {
        let dir = std::env::temp_dir();
        let path = dir.join("gridfs_input_test.txt");
        tokio::fs::write(&path, b"blob contents").await.unwrap();

        let (bytes, filename) = GridFsInput::Path(&path).into_bytes().await.unwrap();
        assert_eq!(bytes, b"blob contents");
        assert_eq!(filename.as_deref(), Some("gridfs_input_test.txt"));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn reader_input_is_consumed_to_completion() {
        let cursor = std::io::Cursor::new(b"streamed bytes".to_vec());
        let input = GridFsInput::Reader(Box::new(cursor));
        let (bytes, filename) = input.into_bytes().await.unwrap();
        assert_eq!(bytes, b"streamed bytes");
        assert!(filename.is_none());
    }
}
