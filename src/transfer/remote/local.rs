//! Directory-backed object store
//!
//! Layout under `root`:
//!
//! ```text
//! <bucket>/<key>                      object data
//! .metadata/<bucket>/<key>.json       object metadata
//! .uploads/<upload_id>/upload.json    multipart manifest
//! .uploads/<upload_id>/part-00001     staged part data
//! .uploads/tmp/<uuid>                 in-flight writes, renamed into place
//! ```

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use super::{
    ByteStream, CompletedPart, ObjectBody, RemoteError, RemotePart, RemoteStore, multipart_etag,
};
use crate::transfer::types::Metadata;

const DEFAULT_READ_CHUNK: usize = 64 * 1024;
const UPLOADS_DIR: &str = ".uploads";
const METADATA_DIR: &str = ".metadata";
const MANIFEST_FILE: &str = "upload.json";

#[derive(Debug, Serialize, Deserialize)]
struct UploadManifest {
    bucket: String,
    key: String,
    #[serde(default)]
    metadata: Metadata,
}

/// Object store keeping buckets as directories on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    read_chunk_size: usize,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }

    /// Chunk size of `get_object` streams
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Metadata stored with an object (empty if none was given)
    pub async fn object_metadata(&self, bucket: &str, key: &str) -> Result<Metadata, RemoteError> {
        let path = self.metadata_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| RemoteError::Permanent(format!("corrupt metadata: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, RemoteError> {
        check_bucket(bucket)?;
        Ok(self.root.join(bucket).join(check_key(key)?))
    }

    fn metadata_path(&self, bucket: &str, key: &str) -> Result<PathBuf, RemoteError> {
        check_bucket(bucket)?;
        let mut path = self.root.join(METADATA_DIR).join(bucket).join(check_key(key)?);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".json");
        path.set_file_name(name);
        Ok(path)
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf, RemoteError> {
        if Uuid::parse_str(upload_id).is_err() {
            return Err(RemoteError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(self.root.join(UPLOADS_DIR).join(upload_id))
    }

    fn staging_path(&self) -> PathBuf {
        self.root
            .join(UPLOADS_DIR)
            .join("tmp")
            .join(Uuid::new_v4().to_string())
    }

    async fn read_manifest(&self, upload_id: &str) -> Result<UploadManifest, RemoteError> {
        let path = self.upload_dir(upload_id)?.join(MANIFEST_FILE);
        match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| RemoteError::Permanent(format!("corrupt upload manifest: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RemoteError::NoSuchUpload(upload_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_metadata(
        &self,
        bucket: &str,
        key: &str,
        metadata: &Metadata,
    ) -> Result<(), RemoteError> {
        let path = self.metadata_path(bucket, key)?;
        if metadata.is_empty() {
            return match fs::remove_file(&path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        let raw = serde_json::to_vec(metadata)
            .map_err(|e| RemoteError::Permanent(format!("metadata encoding: {}", e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, raw).await?;
        Ok(())
    }

    /// Write `body` to a staging file, then rename it to `target`
    async fn store_body(
        &self,
        target: &Path,
        body: ByteStream,
        content_length: u64,
    ) -> Result<String, RemoteError> {
        let staging = self.staging_path();
        match write_body(&staging, body, content_length).await {
            Ok(etag) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::rename(&staging, target).await?;
                Ok(etag)
            }
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl RemoteStore for LocalObjectStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        content_length: u64,
        metadata: &Metadata,
    ) -> Result<String, RemoteError> {
        let target = self.object_path(bucket, key)?;
        let etag = self.store_body(&target, body, content_length).await?;
        self.write_metadata(bucket, key, metadata).await?;
        debug!(bucket, key, bytes = content_length, "Object stored");
        Ok(etag)
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        metadata: &Metadata,
    ) -> Result<String, RemoteError> {
        self.object_path(bucket, key)?;

        let upload_id = Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;

        let manifest = UploadManifest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            metadata: metadata.clone(),
        };
        let raw = serde_json::to_vec(&manifest)
            .map_err(|e| RemoteError::Permanent(format!("manifest encoding: {}", e)))?;
        fs::write(dir.join(MANIFEST_FILE), raw).await?;

        debug!(bucket, key, upload_id = %upload_id, "Multipart upload initiated");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: ByteStream,
        content_length: u64,
    ) -> Result<String, RemoteError> {
        if part_number == 0 {
            return Err(RemoteError::Permanent("part numbers start at 1".into()));
        }
        self.read_manifest(upload_id).await?;

        let target = self.upload_dir(upload_id)?.join(part_file_name(part_number));
        self.store_body(&target, body, content_length).await
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String, RemoteError> {
        let manifest = self.read_manifest(upload_id).await?;
        if manifest.bucket != bucket || manifest.key != key {
            return Err(RemoteError::NoSuchUpload(upload_id.to_string()));
        }
        if parts.is_empty() {
            return Err(RemoteError::Permanent("no parts to complete".into()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(RemoteError::Permanent("parts must be in ascending order".into()));
        }

        let dir = self.upload_dir(upload_id)?;
        let staging = self.staging_path();
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent).await?;
        }

        let assembled = async {
            let mut out = fs::File::create(&staging).await?;
            for part in parts {
                let path = dir.join(part_file_name(part.part_number));
                let (etag, _) = file_etag(&path).await.map_err(|_| {
                    RemoteError::Permanent(format!("part {} was never uploaded", part.part_number))
                })?;
                if etag != part.etag {
                    return Err(RemoteError::Permanent(format!(
                        "eTag mismatch on part {}",
                        part.part_number
                    )));
                }
                let mut input = fs::File::open(&path).await?;
                tokio::io::copy(&mut input, &mut out).await?;
            }
            out.flush().await?;
            Ok::<_, RemoteError>(())
        }
        .await;

        if let Err(e) = assembled {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }

        let target = self.object_path(bucket, key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&staging, &target).await?;
        self.write_metadata(bucket, key, &manifest.metadata).await?;
        fs::remove_dir_all(&dir).await?;

        let etags: Vec<String> = parts.iter().map(|p| p.etag.clone()).collect();
        debug!(bucket, key, upload_id, parts = parts.len(), "Multipart upload completed");
        Ok(multipart_etag(&etags))
    }

    async fn abort_multipart(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), RemoteError> {
        let dir = self.upload_dir(upload_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RemoteError::NoSuchUpload(upload_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_parts(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<Vec<RemotePart>, RemoteError> {
        self.read_manifest(upload_id).await?;

        let mut entries = fs::read_dir(self.upload_dir(upload_id)?).await?;
        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(part_number) = name
                .to_str()
                .and_then(|n| n.strip_prefix("part-"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let (etag, size) = file_etag(&entry.path()).await?;
            parts.push(RemotePart {
                part_number,
                etag,
                size,
            });
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range_offset: Option<u64>,
    ) -> Result<ObjectBody, RemoteError> {
        let path = self.object_path(bucket, key)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RemoteError::NoSuchKey {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let length = file.metadata().await?.len();
        let offset = range_offset.unwrap_or(0);
        if offset > length {
            return Err(RemoteError::Permanent(format!(
                "range offset {} beyond object length {}",
                offset, length
            )));
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let chunk_size = self.read_chunk_size;
        let stream = stream::try_unfold(file, move |mut file| async move {
            let mut buf = vec![0u8; chunk_size];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok(Some((buf, file)))
        })
        .boxed();

        Ok(ObjectBody {
            content_length: length - offset,
            stream,
        })
    }
}

fn part_file_name(part_number: u32) -> String {
    format!("part-{:05}", part_number)
}

fn check_bucket(bucket: &str) -> Result<(), RemoteError> {
    if bucket.is_empty() || bucket.starts_with('.') || bucket.contains(['/', '\\']) {
        return Err(RemoteError::Permanent(format!("invalid bucket name: {:?}", bucket)));
    }
    Ok(())
}

fn check_key(key: &str) -> Result<&Path, RemoteError> {
    let path = Path::new(key);
    let normal = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if key.is_empty() || !normal {
        return Err(RemoteError::Permanent(format!("invalid object key: {:?}", key)));
    }
    Ok(path)
}

async fn write_body(
    path: &Path,
    mut body: ByteStream,
    content_length: u64,
) -> Result<String, RemoteError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(path).await?;
    let mut context = md5::Context::new();
    let mut written = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        context.consume(&chunk);
        written += chunk.len() as u64;
    }
    file.flush().await?;

    if written != content_length {
        return Err(RemoteError::Permanent(format!(
            "declared {} bytes, received {}",
            content_length, written
        )));
    }
    Ok(format!("{:x}", context.compute()))
}

async fn file_etag(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; DEFAULT_READ_CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", context.compute()), size))
}
