//! Typed, versioned documents on top of [`Storage`].
//!
//! Every document is persisted as `{ "version": N, "data": ... }`. Reading a
//! document written by an older schema goes through [`Versioned::migrate`];
//! a version this build does not know is reported, never guessed at.

use crate::core::io::Storage;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("'{key}' has schema version {found}, this build understands up to {expected}")]
    UnknownVersion { key: String, found: u32, expected: u32 },
    #[error("'{key}' is malformed: {cause}")]
    Malformed { key: String, cause: serde_json::Error },
    #[error("storage failure on '{key}': {cause:#}")]
    Storage { key: String, cause: anyhow::Error },
}

pub trait Versioned: Serialize + DeserializeOwned {
    const VERSION: u32;

    /// Upgrades a document from an older schema. `None` rejects it.
    fn migrate(_version: u32, _data: serde_json::Value) -> Option<Self> {
        None
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct RawEnvelope {
    version: u32,
    data: serde_json::Value,
}

pub struct TypedStore<T> {
    storage: Arc<dyn Storage>,
    namespace: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Versioned> TypedStore<T> {
    pub fn new(storage: Arc<dyn Storage>, namespace: &str) -> Self {
        Self {
            storage,
            namespace: namespace.trim_end_matches('/').to_string(),
            _marker: PhantomData,
        }
    }

    fn path(&self, key: &str) -> String {
        format!("{}/{}.json", self.namespace, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, StoreError> {
        let path = self.path(key);
        let exists = self.storage.exists(&path).await.map_err(|cause| StoreError::Storage {
            key: path.clone(),
            cause,
        })?;
        if !exists {
            return Ok(None);
        }

        let bytes = self.storage.read(&path).await.map_err(|cause| StoreError::Storage {
            key: path.clone(),
            cause,
        })?;
        let raw: RawEnvelope = serde_json::from_slice(&bytes).map_err(|cause| StoreError::Malformed {
            key: path.clone(),
            cause,
        })?;

        if raw.version == T::VERSION {
            let value = serde_json::from_value(raw.data)
                .map_err(|cause| StoreError::Malformed { key: path, cause })?;
            return Ok(Some(value));
        }

        if raw.version < T::VERSION {
            if let Some(migrated) = T::migrate(raw.version, raw.data) {
                log::info!("Migrated {} from schema v{} to v{}", path, raw.version, T::VERSION);
                return Ok(Some(migrated));
            }
        }

        Err(StoreError::UnknownVersion {
            key: path,
            found: raw.version,
            expected: T::VERSION,
        })
    }

    pub async fn put(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let path = self.path(key);
        let bytes = serde_json::to_vec(&EnvelopeRef {
            version: T::VERSION,
            data: value,
        })
        .map_err(|cause| StoreError::Malformed {
            key: path.clone(),
            cause,
        })?;
        self.storage
            .write(&path, &bytes)
            .await
            .map_err(|cause| StoreError::Storage { key: path, cause })
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path(key);
        self.storage
            .delete(&path)
            .await
            .map_err(|cause| StoreError::Storage { key: path, cause })
    }

    pub async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path(key);
        self.storage
            .exists(&path)
            .await
            .map_err(|cause| StoreError::Storage { key: path, cause })
    }
}

// --- Image cache ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedImage {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Versioned for CachedImage {
    const VERSION: u32 = 1;
}

impl CachedImage {
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.data)
        )
    }
}

/// Generated page illustrations keyed by `(story_id, page_index)`.
pub struct ImageCache {
    store: TypedStore<CachedImage>,
}

impl ImageCache {
    pub const NAMESPACE: &'static str = "image_cache";

    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            store: TypedStore::new(storage, Self::NAMESPACE),
        }
    }

    fn key(story_id: &str, page_index: usize) -> String {
        format!("{}/page_{}", story_id, page_index)
    }

    pub async fn get(&self, story_id: &str, page_index: usize) -> Result<Option<CachedImage>, StoreError> {
        self.store.get(&Self::key(story_id, page_index)).await
    }

    pub async fn contains(&self, story_id: &str, page_index: usize) -> Result<bool, StoreError> {
        self.store.contains(&Self::key(story_id, page_index)).await
    }

    pub async fn put(&self, story_id: &str, page_index: usize, image: &CachedImage) -> Result<(), StoreError> {
        self.store.put(&Self::key(story_id, page_index), image).await
    }

    pub async fn remove(&self, story_id: &str, page_index: usize) -> Result<(), StoreError> {
        self.store.remove(&Self::key(story_id, page_index)).await
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
