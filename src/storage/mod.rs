pub mod s3;
pub mod traits;

use std::sync::Arc;

use crate::config::S3Config;
use crate::error::Result;

pub use s3::S3ImageStorage;
pub use traits::ImageStorage;

/// Owns the configured storage backend. Construction fails when the
/// config is incomplete; callers that can live without storage check
/// `S3Config::is_complete` first.
pub struct ImageStorageManager {
    backend: Arc<dyn ImageStorage>,
}

impl ImageStorageManager {
    pub async fn new(config: S3Config) -> Result<Self> {
        let backend: Arc<dyn ImageStorage> = Arc::new(S3ImageStorage::new(config).await?);
        Ok(Self { backend })
    }

    pub fn from_backend(backend: Arc<dyn ImageStorage>) -> Self {
        Self { backend }
    }

    pub async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        self.backend.upload(key, bytes).await
    }

    pub async fn upload_batch(&self, prefix: &str, images: Vec<Vec<u8>>) -> Result<Vec<String>> {
        self.backend.upload_batch(prefix, images).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await
    }

    pub async fn delete_batch(&self, prefix: &str, num_images: usize) -> Result<()> {
        self.backend.delete_batch(prefix, num_images).await
    }

    pub async fn health_check(&self) -> Result<bool> {
        self.backend.health_check().await
    }
}
