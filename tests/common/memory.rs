//! In-memory object store with call counters and failure injection.

use async_trait::async_trait;
use blobstore_migrate::models::object::{Metadata, ObjectStat};
use blobstore_migrate::stores::{ByteStream, ObjectStore, StoreError, StoreResult};
use bytes::Bytes;
use futures::{TryStreamExt, stream};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct StoredEntry {
    stat: ObjectStat,
    data: Bytes,
}

#[allow(dead_code)]
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredEntry>>,
    failing_puts: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    pub heads: AtomicUsize,
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
    pub multipart_puts: AtomicUsize,
}

#[allow(dead_code)]
impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed an object directly, bypassing the counters.
    pub fn insert(&self, key: &str, data: &[u8], metadata: Metadata) {
        let data = Bytes::copy_from_slice(data);
        let stat = ObjectStat {
            size: data.len() as u64,
            etag: format!("\"{:x}\"", md5::compute(&data)),
            metadata,
        };
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), StoredEntry { stat, data });
    }

    /// Seed an object with an explicit tag.
    pub fn insert_with_tag(&self, key: &str, data: &[u8], etag: &str) {
        let data = Bytes::copy_from_slice(data);
        let stat = ObjectStat {
            size: data.len() as u64,
            etag: etag.to_string(),
            metadata: Metadata::new(),
        };
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), StoredEntry { stat, data });
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn data(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).map(|e| e.data.clone())
    }

    pub fn stat(&self, key: &str) -> Option<ObjectStat> {
        self.objects.lock().unwrap().get(key).map(|e| e.stat.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Make every write to `key` fail until [`heal`](Self::heal) is called.
    pub fn fail_puts_for(&self, key: &str) {
        self.failing_puts.lock().unwrap().insert(key.to_string());
    }

    pub fn heal(&self, key: &str) {
        self.failing_puts.lock().unwrap().remove(key);
    }

    /// Make every call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }

    fn check_writable(&self, key: &str) -> StoreResult<()> {
        self.check_available()?;
        if self.failing_puts.lock().unwrap().contains(key) {
            return Err(StoreError::Unavailable(format!("injected write failure for {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head(&self, key: &str) -> StoreResult<Option<ObjectStat>> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.stat(key))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<(ObjectStat, ByteStream)>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let entry = self.objects.lock().unwrap().get(key).cloned();
        Ok(entry.map(|entry| {
            let body: ByteStream = Box::pin(stream::iter(vec![Ok(entry.data)]));
            (entry.stat, body)
        }))
    }

    async fn put(
        &self,
        key: &str,
        metadata: &Metadata,
        body: ByteStream,
    ) -> StoreResult<ObjectStat> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.check_writable(key)?;
        let chunks: Vec<Bytes> = body.try_collect().await?;
        let data = Bytes::from(chunks.concat());
        self.insert(key, &data, metadata.clone());
        Ok(self.stat(key).unwrap())
    }

    async fn put_multipart(
        &self,
        key: &str,
        metadata: &Metadata,
        parts: ByteStream,
    ) -> StoreResult<ObjectStat> {
        self.multipart_puts.fetch_add(1, Ordering::SeqCst);
        self.check_writable(key)?;
        let parts: Vec<Bytes> = parts.try_collect().await?;
        let mut digests = Vec::new();
        for part in &parts {
            digests.extend_from_slice(&md5::compute(part).0);
        }
        let data = Bytes::from(parts.concat());
        let stat = ObjectStat {
            size: data.len() as u64,
            etag: format!("\"{:x}-{}\"", md5::compute(&digests), parts.len()),
            metadata: metadata.clone(),
        };
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredEntry {
                stat: stat.clone(),
                data,
            },
        );
        Ok(stat)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
