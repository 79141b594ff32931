pub mod config;
pub mod error;
pub mod logger;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod storage;
pub mod tokens;
pub mod worker;

pub use config::{AiServerConfig, Config, S3Config, TrainingConfig};
pub use error::{GatewayError, Result};
pub use models::{
    GenerationForm, GenerationMode, GenerationResponse, GpuEnvironment, SchedulerType,
    TaskRecord, TaskResponse, TaskState, TrainingForm, UploadedImage,
};
pub use pipeline::{DiffusionBackend, RemoteDiffusionBackend, UpstreamReply};
pub use storage::{ImageStorage, ImageStorageManager, S3ImageStorage};
pub use tokens::{token_cost, TokenLedger};
pub use worker::{spawn_worker, TaskRegistry, TrainingQueue};
