use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client;
use futures_util::stream::StreamExt;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::S3Config;
use crate::error::{MediaError, MediaResult};

pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 5;

/// One file of an upload batch.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: String,
}

impl StoredObject {
    pub fn new(key: impl Into<String>, body: Vec<u8>, content_type: impl Into<String>) -> Self {
        StoredObject {
            key: key.into(),
            body,
            content_type: content_type.into(),
        }
    }
}

/// Keys never carry a leading slash in the store.
pub fn normalize_key(key: &str) -> &str {
    key.strip_prefix('/').unwrap_or(key)
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> MediaResult<()>;

    /// Idempotent delete; a missing key is not an error.
    async fn delete(&self, key: &str) -> MediaResult<()>;

    fn public_url(&self, key: &str) -> String;

    /// All-or-nothing batch upload with bounded parallelism. On the first
    /// failure the batch aborts, every key of the batch is deleted
    /// best-effort, and the caller sees one `ObjectStoreBatchFailed` naming
    /// the index of the first failing file.
    async fn put_multiple(&self, files: Vec<StoredObject>, concurrency: usize) -> MediaResult<()> {
        if files.is_empty() {
            return Ok(());
        }
        let concurrency = concurrency.max(1);
        let keys: Vec<String> = files.iter().map(|f| f.key.clone()).collect();

        let mut uploads = futures_util::stream::iter(files.into_iter().enumerate().map(
            |(index, file)| async move {
                let result = self.put(&file.key, file.body, &file.content_type).await;
                (index, result)
            },
        ))
        .buffer_unordered(concurrency);

        let mut failure: Option<(usize, MediaError)> = None;
        while let Some((index, result)) = uploads.next().await {
            if let Err(cause) = result {
                failure = Some((index, cause));
                break;
            }
        }
        drop(uploads);

        if let Some((index, cause)) = failure {
            // Roll back whatever may have landed, including results not yet
            // drained from the stream when the failure surfaced.
            for key in &keys {
                if let Err(e) = self.delete(key).await {
                    warn!("batch rollback: failed to delete {key}: {e}");
                }
            }
            return Err(MediaError::ObjectStoreBatchFailed {
                index,
                reason: cause.to_string(),
            });
        }

        debug!("uploaded batch of {} objects", keys.len());
        Ok(())
    }
}

/// S3-compatible backend. Works against AWS proper or anything speaking the
/// S3 API behind `endpoint` (path-style addressing for the latter).
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    cache_seconds: u64,
    public_base_url: Option<String>,
}

impl S3ObjectStore {
    pub fn from_config(cfg: &S3Config) -> Self {
        let credentials = aws_credential_types::Credentials::new(
            cfg.access_key.clone(),
            cfg.secret_key.clone(),
            None,
            None,
            "media-pipeline",
        );
        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .endpoint_url(&cfg.endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        S3ObjectStore {
            client: Client::from_conf(sdk_config),
            bucket: cfg.bucket.clone(),
            cache_seconds: cfg.cache_seconds,
            public_base_url: cfg.public_base_url.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> MediaResult<()> {
        let key = normalize_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .cache_control(format!("public, max-age={}", self.cache_seconds))
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| MediaError::ObjectStoreFailed {
                reason: format!("put {key}: {e}"),
            })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> MediaResult<()> {
        let key = normalize_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| MediaError::ObjectStoreFailed {
                reason: format!("delete {key}: {e}"),
            })?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        public_url_for(self.public_base_url.as_deref(), key)
    }
}

fn public_url_for(base: Option<&str>, key: &str) -> String {
    let key = normalize_key(key);
    match base {
        Some(base) => format!("{}/{key}", base.trim_end_matches('/')),
        None => key.to_string(),
    }
}

/// In-memory backend for tests and embedders that do not need durability.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    fail_keys: Mutex<Vec<String>>,
    public_base_url: Option<String>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_public_base_url(base: impl Into<String>) -> Self {
        MemoryObjectStore {
            public_base_url: Some(base.into()),
            ..Default::default()
        }
    }

    /// Make the next `put` of `key` fail, for batch-atomicity tests.
    pub fn fail_on(&self, key: impl Into<String>) {
        self.fail_keys.lock().unwrap().push(key.into());
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(normalize_key(key))
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(normalize_key(key))
            .map(|(body, _)| body.clone())
    }

    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        let prefix = normalize_key(prefix);
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> MediaResult<()> {
        let key = normalize_key(key);
        if self.fail_keys.lock().unwrap().iter().any(|k| k == key) {
            return Err(MediaError::ObjectStoreFailed {
                reason: format!("injected failure for {key}"),
            });
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (body, content_type.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> MediaResult<()> {
        self.objects.lock().unwrap().remove(normalize_key(key));
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        public_url_for(self.public_base_url.as_deref(), key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(keys: &[&str]) -> Vec<StoredObject> {
        keys.iter()
            .map(|k| StoredObject::new(*k, vec![1, 2, 3], "image/jpeg"))
            .collect()
    }

    #[tokio::test]
    async fn empty_batch_returns_immediately() {
        let store = MemoryObjectStore::new();
        store.put_multiple(Vec::new(), 5).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn successful_batch_stores_every_file() {
        let store = MemoryObjectStore::new();
        store
            .put_multiple(batch(&["a/1.jpg", "a/2.jpg", "a/3.webp"]), 2)
            .await
            .unwrap();
        assert_eq!(store.len(), 3);
        assert!(store.contains("a/3.webp"));
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_objects_behind() {
        let store = MemoryObjectStore::new();
        store.fail_on("a/3.jpg");
        let result = store
            .put_multiple(batch(&["a/1.jpg", "a/2.jpg", "a/3.jpg", "a/4.jpg", "a/5.jpg"]), 5)
            .await;
        match result {
            Err(MediaError::ObjectStoreBatchFailed { index, .. }) => assert_eq!(index, 2),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(store.is_empty(), "rollback must remove every uploaded object");
    }

    #[tokio::test]
    async fn leading_slash_is_stripped() {
        let store = MemoryObjectStore::new();
        store.put("/a/b.jpg", vec![0], "image/jpeg").await.unwrap();
        assert!(store.contains("a/b.jpg"));
        assert!(store.contains("/a/b.jpg"));
    }

    #[test]
    fn public_url_normalizes_slashes() {
        assert_eq!(
            public_url_for(Some("https://cdn.example.com/"), "/a/b.jpg"),
            "https://cdn.example.com/a/b.jpg"
        );
        assert_eq!(
            public_url_for(Some("https://cdn.example.com"), "a/b.jpg"),
            "https://cdn.example.com/a/b.jpg"
        );
        assert_eq!(public_url_for(None, "/a/b.jpg"), "a/b.jpg");
    }
}
