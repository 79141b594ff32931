pub mod remote;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::models::{GenerationForm, GenerationMode, UploadedImage};

pub use remote::RemoteDiffusionBackend;

/// What the AI server handed back: either the finished images (base64
/// PNGs) or, for queued work, a task id.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamReply {
    #[serde(default)]
    pub image_list: Vec<String>,
    #[serde(default)]
    pub task_id: Option<String>,
}

/// The seam in front of the diffusion computation. The only production
/// implementation proxies to the remote AI server; an in-process pipeline
/// would slot in behind the same trait.
#[async_trait]
pub trait DiffusionBackend: Send + Sync {
    async fn generate(
        &self,
        mode: GenerationMode,
        form: &GenerationForm,
        images: &[UploadedImage],
    ) -> Result<UpstreamReply>;

    async fn health_check(&self) -> Result<bool>;
}
