//! Remote Object Store
//!
//! Capability consumed by the worker: single PUT, multipart upload, ranged
//! GET. The client handle is injected into the worker as
//! `Arc<dyn RemoteStore>`; timeouts and retries belong to the client.

pub mod local;
#[cfg(test)]
pub mod mock;

pub use local::LocalObjectStore;
#[cfg(test)]
pub use mock::MockRemoteStore;

use std::io;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use super::error::TransferError;
use super::types::Metadata;

/// Chunked request/response body
pub type ByteStream = BoxStream<'static, io::Result<Vec<u8>>>;

/// Failures reported by a remote store client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("remote rejected request: {0}")]
    Permanent(String),

    #[error("multipart upload not found: {0}")]
    NoSuchUpload(String),

    #[error("object not found: {bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },

    /// The request body stopped at a pause/cancel checkpoint
    #[error("transfer interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for RemoteError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::Interrupted => RemoteError::Interrupted,
            _ => RemoteError::Io(e.to_string()),
        }
    }
}

impl From<RemoteError> for TransferError {
    fn from(e: RemoteError) -> Self {
        TransferError::RemoteOperationFailed(e.to_string())
    }
}

/// Part reference passed to [`RemoteStore::complete_multipart`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Part as reported by [`RemoteStore::list_parts`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Response of [`RemoteStore::get_object`]
pub struct ObjectBody {
    /// Bytes the stream will yield (object length minus the range offset)
    pub content_length: u64,
    pub stream: ByteStream,
}

/// Remote store client
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Client name for logging
    fn name(&self) -> &'static str;

    /// Upload a whole object; returns its eTag
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        content_length: u64,
        metadata: &Metadata,
    ) -> Result<String, RemoteError>;

    /// Start a multipart upload; returns the upload id
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        metadata: &Metadata,
    ) -> Result<String, RemoteError>;

    /// Upload one part; returns its eTag
    ///
    /// Re-uploading a part number replaces the previous data.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: ByteStream,
        content_length: u64,
    ) -> Result<String, RemoteError>;

    /// Assemble the listed parts into the final object; returns its eTag
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String, RemoteError>;

    /// Discard a multipart upload and its parts
    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), RemoteError>;

    /// Parts already stored for an upload, ordered by part number
    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<RemotePart>, RemoteError>;

    /// Read an object, optionally from a byte offset
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range_offset: Option<u64>,
    ) -> Result<ObjectBody, RemoteError>;
}

/// Hex MD5 of a part or single-PUT body
pub fn content_etag(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Multipart object eTag: MD5 over the binary part digests, suffixed with the part count
pub fn multipart_etag(part_etags: &[String]) -> String {
    let mut context = md5::Context::new();
    for etag in part_etags {
        match decode_hex(etag) {
            Some(raw) => context.consume(&raw),
            None => context.consume(etag.as_bytes()),
        }
    }
    format!("{:x}-{}", context.compute(), part_etags.len())
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_etag_is_md5_hex() {
        assert_eq!(content_etag(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(content_etag(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_multipart_etag_has_part_count() {
        let etag = multipart_etag(&[content_etag(b"a"), content_etag(b"b")]);
        assert!(etag.ends_with("-2"));
        assert_eq!(etag.len(), 32 + 2);
    }

    #[test]
    fn test_interrupted_io_maps_to_interrupted() {
        let err: RemoteError = io::Error::new(io::ErrorKind::Interrupted, "paused").into();
        assert_eq!(err, RemoteError::Interrupted);

        let err: RemoteError = io::Error::other("disk").into();
        assert!(matches!(err, RemoteError::Io(_)));

        let err: TransferError = RemoteError::Transient("503".into()).into();
        assert_eq!(err.code(), "REMOTE_OPERATION_FAILED");
    }
}
