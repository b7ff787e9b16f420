//! Bulk removal of blob data

use super::driver::StorageDriver;
use super::paths;
use crate::digest::Digest;
use crate::error::{ProxyError, Result};
use std::sync::Arc;

/// Removes content from the global blob store, bypassing repository links
#[derive(Clone)]
pub struct Vacuum {
    driver: Arc<dyn StorageDriver>,
}

impl Vacuum {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self { driver }
    }

    /// Delete the data for `digest`. Links still pointing at it become dangling
    /// and stat as unknown.
    pub async fn remove_blob(&self, digest: &str) -> Result<()> {
        let digest = Digest::parse(digest)?;
        tracing::info!(digest = %digest, "vacuum: deleting blob");
        self.driver
            .delete(&paths::blob_dir(&digest))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    ProxyError::BlobUnknown(digest.clone())
                } else {
                    e
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryDriver;
    use bytes::Bytes;

    #[tokio::test]
    async fn removes_blob_data() {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        let digest = Digest::from_bytes(b"data");
        driver
            .put_content(&paths::blob_data(&digest), Bytes::from_static(b"data"))
            .await
            .unwrap();

        let vacuum = Vacuum::new(driver.clone());
        vacuum.remove_blob(digest.as_str()).await.unwrap();
        assert!(driver.stat(&paths::blob_data(&digest)).await.is_err());
        assert!(matches!(
            vacuum.remove_blob(digest.as_str()).await,
            Err(ProxyError::BlobUnknown(_))
        ));
        assert!(matches!(
            vacuum.remove_blob("sha256:nope").await,
            Err(ProxyError::InvalidDigest(_))
        ));
    }
}
