use std::sync::Arc;

use sdgate::server::{AppState, DEFAULT_PORT};
use sdgate::{
    logger, spawn_worker, Config, DiffusionBackend, ImageStorageManager, RemoteDiffusionBackend,
    TaskRegistry, TokenLedger,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    match dotenv::dotenv() {
        Ok(_) => log::info!("✅ .env file loaded successfully"),
        Err(_) => log::warn!("⚠️  No .env file found, using system environment variables"),
    }

    logger::init_with_config(logger::LoggerConfig::development())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let config = Config::from_env();
    logger::log_startup_info("sdgate", env!("CARGO_PKG_VERSION"), config.port.unwrap_or(DEFAULT_PORT));
    logger::log_config_info(&config);

    let ai_server = config.ai_server.clone().unwrap_or_default();
    let backend = match RemoteDiffusionBackend::new(ai_server) {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("❌ {}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };
    if !backend.health_check().await.unwrap_or(false) {
        log::warn!("⚠️  AI server did not answer the health check; requests will fail until it is up");
    }

    let storage = match config.s3.clone() {
        Some(s3) if s3.is_complete() => match ImageStorageManager::new(s3).await {
            Ok(manager) => {
                log::info!("✅ S3 storage ready");
                Some(Arc::new(manager))
            }
            Err(e) => {
                log::warn!("⚠️  S3 storage unavailable, responses stay base64-only: {}", e);
                None
            }
        },
        _ => {
            log::warn!("⚠️  S3 not configured, responses stay base64-only");
            None
        }
    };

    let ledger = Arc::new(TokenLedger::new(config.default_token_grant));
    let registry = Arc::new(TaskRegistry::new());
    let queue = spawn_worker(config.training.clone(), registry.clone(), ledger.clone());

    sdgate::server::run(AppState {
        config,
        ledger,
        backend: Arc::new(backend),
        storage,
        queue,
        registry,
    })
    .await
}
