//! In-memory remote store for tests
//!
//! Records every call, can fail selected operations, and can hold body
//! chunks behind a gate so a test controls exactly how far a transfer gets.
//! `list_parts` and `abort_multipart` can be held as a whole with
//! [`MockRemoteStore::hold`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;

use super::{
    ByteStream, CompletedPart, ObjectBody, RemoteError, RemotePart, RemoteStore, content_etag,
    multipart_etag,
};
use crate::transfer::types::Metadata;

struct MockUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

pub struct MockRemoteStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    uploads: Mutex<HashMap<String, MockUpload>>,
    calls: Mutex<Vec<String>>,
    next_upload: AtomicUsize,
    /// Chunk size of `get_object` streams
    read_chunk: usize,
    /// When set, each body chunk needs one permit
    gate: Mutex<Option<Arc<Semaphore>>>,
    fail_put: Mutex<bool>,
    fail_get: Mutex<bool>,
    fail_complete: Mutex<bool>,
    fail_parts: Mutex<HashSet<u32>>,
    /// Held operations wait here after recording their call
    holds: Mutex<HashMap<&'static str, Arc<Semaphore>>>,
    /// Bytes `get_object` streams beyond the length it announces
    overlong: Mutex<usize>,
}

impl MockRemoteStore {
    pub fn new() -> Self {
        Self::with_read_chunk(4)
    }

    pub fn with_read_chunk(read_chunk: usize) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            next_upload: AtomicUsize::new(1),
            read_chunk: read_chunk.max(1),
            gate: Mutex::new(None),
            fail_put: Mutex::new(false),
            fail_get: Mutex::new(false),
            fail_complete: Mutex::new(false),
            fail_parts: Mutex::new(HashSet::new()),
            holds: Mutex::new(HashMap::new()),
            overlong: Mutex::new(0),
        }
    }

    /// Hold every body chunk until [`release`](Self::release) grants it
    pub fn close_gate(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `chunks` more body chunks through the gate
    pub fn release(&self, chunks: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(chunks);
        }
    }

    /// Remove the gate and let everything through
    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn set_fail_put(&self, fail: bool) {
        *self.fail_put.lock().unwrap() = fail;
    }

    pub fn set_fail_get(&self, fail: bool) {
        *self.fail_get.lock().unwrap() = fail;
    }

    pub fn set_fail_complete(&self, fail: bool) {
        *self.fail_complete.lock().unwrap() = fail;
    }

    pub fn set_fail_part(&self, part_number: u32, fail: bool) {
        let mut parts = self.fail_parts.lock().unwrap();
        if fail {
            parts.insert(part_number);
        } else {
            parts.remove(&part_number);
        }
    }

    /// Make `op` ("list_parts" or "abort_multipart") wait until released
    pub fn hold(&self, op: &'static str) {
        self.holds
            .lock()
            .unwrap()
            .insert(op, Arc::new(Semaphore::new(0)));
    }

    pub fn release_hold(&self, op: &'static str) {
        if let Some(hold) = self.holds.lock().unwrap().remove(op) {
            hold.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Stream `extra` bytes past the announced length of every object
    pub fn set_overlong_body(&self, extra: usize) {
        *self.overlong.lock().unwrap() = extra;
    }

    pub fn insert_object(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), data);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Forget a multipart upload, as a store does when one expires
    pub fn expire_upload(&self, upload_id: &str) {
        self.uploads.lock().unwrap().remove(upload_id);
    }

    pub fn active_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn current_gate(&self) -> Option<Arc<Semaphore>> {
        self.gate.lock().unwrap().clone()
    }

    async fn wait_hold(&self, op: &'static str) {
        let hold = self.holds.lock().unwrap().get(op).cloned();
        if let Some(hold) = hold {
            let _ = hold.acquire().await;
        }
    }

    async fn drain(&self, mut body: ByteStream, content_length: u64) -> Result<Vec<u8>, RemoteError> {
        let gate = self.current_gate();
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if let Some(gate) = &gate {
                gate.acquire()
                    .await
                    .map_err(|_| RemoteError::Transient("gate closed".into()))?
                    .forget();
            }
            data.extend_from_slice(&chunk);
        }
        if data.len() as u64 != content_length {
            return Err(RemoteError::Permanent(format!(
                "declared {} bytes, received {}",
                content_length,
                data.len()
            )));
        }
        Ok(data)
    }
}

impl Default for MockRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MockRemoteStore {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        content_length: u64,
        _metadata: &Metadata,
    ) -> Result<String, RemoteError> {
        self.record(format!("put_object:{}/{}", bucket, key));
        if *self.fail_put.lock().unwrap() {
            return Err(RemoteError::Transient("mock put failure".into()));
        }
        let data = self.drain(body, content_length).await?;
        let etag = content_etag(&data);
        self.insert_object(bucket, key, data);
        Ok(etag)
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        _metadata: &Metadata,
    ) -> Result<String, RemoteError> {
        let upload_id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.record(format!("initiate_multipart:{}", upload_id));
        self.uploads.lock().unwrap().insert(
            upload_id.clone(),
            MockUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
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
        self.record(format!("upload_part:{}", part_number));
        if self.fail_parts.lock().unwrap().contains(&part_number) {
            return Err(RemoteError::Transient(format!(
                "mock failure on part {}",
                part_number
            )));
        }
        if !self.uploads.lock().unwrap().contains_key(upload_id) {
            return Err(RemoteError::NoSuchUpload(upload_id.to_string()));
        }

        let data = self.drain(body, content_length).await?;
        let etag = content_etag(&data);

        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| RemoteError::NoSuchUpload(upload_id.to_string()))?;
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String, RemoteError> {
        self.record(format!("complete_multipart:{}", upload_id));
        if *self.fail_complete.lock().unwrap() {
            return Err(RemoteError::Transient("mock complete failure".into()));
        }

        let upload = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| RemoteError::NoSuchUpload(upload_id.to_string()))?;

        let mut data = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
                _ => {
                    return Err(RemoteError::Permanent(format!(
                        "invalid part {}",
                        part.part_number
                    )));
                }
            }
        }

        self.insert_object(&upload.bucket, &upload.key, data);
        let etags: Vec<String> = parts.iter().map(|p| p.etag.clone()).collect();
        Ok(multipart_etag(&etags))
    }

    async fn abort_multipart(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), RemoteError> {
        self.record(format!("abort_multipart:{}", upload_id));
        self.wait_hold("abort_multipart").await;
        self.uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NoSuchUpload(upload_id.to_string()))
    }

    async fn list_parts(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<Vec<RemotePart>, RemoteError> {
        self.record(format!("list_parts:{}", upload_id));
        self.wait_hold("list_parts").await;
        let uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| RemoteError::NoSuchUpload(upload_id.to_string()))?;
        Ok(upload
            .parts
            .iter()
            .map(|(n, (etag, data))| RemotePart {
                part_number: *n,
                etag: etag.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range_offset: Option<u64>,
    ) -> Result<ObjectBody, RemoteError> {
        let offset = range_offset.unwrap_or(0);
        self.record(format!("get_object:{}", offset));
        if *self.fail_get.lock().unwrap() {
            return Err(RemoteError::Transient("mock get failure".into()));
        }

        let data = self.object(bucket, key).ok_or_else(|| RemoteError::NoSuchKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        let offset = usize::try_from(offset)
            .ok()
            .filter(|o| *o <= data.len())
            .ok_or_else(|| RemoteError::Permanent("range not satisfiable".into()))?;

        let content_length = (data.len() - offset) as u64;
        let mut sent = data[offset..].to_vec();
        sent.resize(sent.len() + *self.overlong.lock().unwrap(), b'!');
        let remaining: Vec<Vec<u8>> = sent
            .chunks(self.read_chunk)
            .map(|c| c.to_vec())
            .collect();
        let gate = self.current_gate();

        let stream = stream::iter(remaining)
            .then(move |chunk| {
                let gate = gate.clone();
                async move {
                    if let Some(gate) = gate {
                        gate.acquire()
                            .await
                            .map_err(|_| std::io::Error::other("gate closed"))?
                            .forget();
                    }
                    Ok::<_, std::io::Error>(chunk)
                }
            })
            .boxed();

        Ok(ObjectBody {
            content_length,
            stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn body(data: &[u8]) -> ByteStream {
        stream::iter(vec![Ok(data.to_vec())]).boxed()
    }

    #[tokio::test]
    async fn test_mock_multipart_roundtrip() {
        let store = MockRemoteStore::new();
        let id = store
            .initiate_multipart("b", "k", &Metadata::new())
            .await
            .unwrap();
        let e1 = store.upload_part("b", "k", &id, 1, body(b"ab"), 2).await.unwrap();
        let e2 = store.upload_part("b", "k", &id, 2, body(b"c"), 1).await.unwrap();

        store
            .complete_multipart(
                "b",
                "k",
                &id,
                &[
                    CompletedPart { part_number: 1, etag: e1 },
                    CompletedPart { part_number: 2, etag: e2 },
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.object("b", "k").unwrap(), b"abc".to_vec());
        assert_eq!(store.active_uploads(), 0);
        assert_eq!(store.count("upload_part"), 2);
    }

    #[tokio::test]
    async fn test_mock_gate_holds_chunks() {
        let store = MockRemoteStore::with_read_chunk(2);
        store.insert_object("b", "k", b"abcdef".to_vec());
        store.close_gate();

        let mut object = store.get_object("b", "k", Some(2)).await.unwrap();
        assert_eq!(object.content_length, 4);

        store.release(1);
        assert_eq!(object.stream.try_next().await.unwrap().unwrap(), b"cd".to_vec());

        store.open_gate();
        assert_eq!(object.stream.try_next().await.unwrap().unwrap(), b"ef".to_vec());
        assert!(object.stream.try_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_hold_blocks_until_released() {
        let store = Arc::new(MockRemoteStore::new());
        let id = store
            .initiate_multipart("b", "k", &Metadata::new())
            .await
            .unwrap();
        store.hold("abort_multipart");

        let task = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.abort_multipart("b", "k", &id).await })
        };
        while store.count("abort_multipart") == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());
        assert_eq!(store.active_uploads(), 1);

        store.release_hold("abort_multipart");
        task.await.unwrap().unwrap();
        assert_eq!(store.active_uploads(), 0);
    }

    #[tokio::test]
    async fn test_mock_overlong_body() {
        let store = MockRemoteStore::with_read_chunk(4);
        store.insert_object("b", "k", b"abcd".to_vec());
        store.set_overlong_body(2);

        let object = store.get_object("b", "k", None).await.unwrap();
        assert_eq!(object.content_length, 4);
        let chunks: Vec<Vec<u8>> = object.stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"abcd!!".to_vec());
    }
}
