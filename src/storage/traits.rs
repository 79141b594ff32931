use async_trait::async_trait;

use crate::error::Result;

/// Object storage for generated images. Uploads take the already-decoded
/// bytes; keys and URLs are the backend's concern.
#[async_trait]
pub trait ImageStorage: Send + Sync {
    /// Upload one image and return its public URL.
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<String>;

    /// Upload a batch under a shared prefix, preserving order. Keys are
    /// `{prefix}/{index+1}.jpeg`.
    async fn upload_batch(&self, prefix: &str, images: Vec<Vec<u8>>) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete the `num_images` objects previously uploaded under `prefix`.
    async fn delete_batch(&self, prefix: &str, num_images: usize) -> Result<()>;

    async fn health_check(&self) -> Result<bool>;
}
