use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key/value byte storage. Keys are `/`-separated relative paths.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
    async fn write(&self, key: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

// --- Native Implementation ---

pub struct NativeStorage {
    root: PathBuf,
}

impl NativeStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.path(key)).await?)
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.path(key);
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await?;

        // Each writer gets its own temp file; the rename publishes it whole.
        let content = content.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&content)?;
            tmp.persist(&path)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        if tokio::fs::try_exists(&path).await? {
            if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path(key)).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path(prefix);
        let mut entries = Vec::new();

        if dir.is_dir() {
            let mut rd = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = rd.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(".tmp") {
                    continue;
                }
                let prefix = prefix.trim_end_matches('/');
                entries.push(if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                });
            }
        }

        entries.sort();
        Ok(entries)
    }
}

// --- In-memory Implementation ---

#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("MemoryStorage lock poisoned"))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.entries()?
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Entry not found: {}", key))
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<()> {
        self.entries()?.insert(key.to_string(), content.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let prefix = format!("{}/", key.trim_end_matches('/'));
        self.entries()?
            .retain(|k, _| k != key && !k.starts_with(&prefix));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries()?.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_end_matches('/');
        let dir = format!("{}/", prefix);
        let mut children: Vec<String> = self
            .entries()?
            .keys()
            .filter_map(|k| {
                let rest = if prefix.is_empty() { Some(k.as_str()) } else { k.strip_prefix(&dir) }?;
                let child = rest.split('/').next()?;
                Some(if prefix.is_empty() {
                    child.to_string()
                } else {
                    format!("{}{}", dir, child)
                })
            })
            .collect();
        children.dedup();
        Ok(children)
    }
}
