//! The content store: one object per queued message body, keyed by the
//! queue uuid shared by all the per-recipient records.

/// Key-value contract the queue ingestion relies on.
#[async_trait::async_trait]
pub trait Storer: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;
    /// deleting a missing object returns an error the caller may treat as
    /// already satisfied (see [`is_not_found`])
    async fn del(&self, key: &str) -> anyhow::Result<()>;
}

/// true when the error is a missing-object error, benign on delete
pub fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<std::io::Error>()
        .map_or(false, |e| e.kind() == std::io::ErrorKind::NotFound)
}

/// Instantiate the configured store driver.
pub fn new_store(
    driver: &str,
    source: &std::path::Path,
) -> anyhow::Result<std::sync::Arc<dyn Storer>> {
    match driver {
        "disk" => Ok(std::sync::Arc::new(DiskStore::open(source)?)),
        other => anyhow::bail!("unknown store driver '{}'", other),
    }
}

/// Flat on-disk store; writes go through a temporary file and a rename so
/// a crash cannot leave a partially written body under its final key.
pub struct DiskStore {
    base: std::path::PathBuf,
}

impl DiskStore {
    pub fn open(base: &std::path::Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base)?;
        Ok(Self {
            base: base.to_path_buf(),
        })
    }

    fn path(&self, key: &str) -> std::path::PathBuf {
        self.base.join(key)
    }
}

#[async_trait::async_trait]
impl Storer for DiskStore {
    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        let tmp = self.base.join(format!(".tmp-{}", key));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, self.path(key)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        Ok(tokio::fs::read(self.path(key)).await?)
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        Ok(tokio::fs::remove_file(self.path(key)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disk_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("oxmail-store-{}", uuid::Uuid::new_v4()));
        let store = DiskStore::open(&dir).unwrap();

        store.put("some-key", b"raw mail").await.unwrap();
        assert_eq!(store.get("some-key").await.unwrap(), b"raw mail");

        store.del("some-key").await.unwrap();
        let missing = store.get("some-key").await.unwrap_err();
        assert!(is_not_found(&missing));

        let already_gone = store.del("some-key").await.unwrap_err();
        assert!(is_not_found(&already_gone));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unknown_driver_is_refused() {
        assert!(new_store("s3", std::path::Path::new("x")).is_err());
    }
}
