pub mod generation;
pub mod multipart;
pub mod training;

use std::sync::Arc;

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::pipeline::DiffusionBackend;
use crate::storage::ImageStorageManager;
use crate::tokens::TokenLedger;
use crate::worker::{TaskRegistry, TrainingQueue};

pub const DEFAULT_PORT: u16 = 8000;

/// Everything the handlers share.
pub struct AppState {
    pub config: Config,
    pub ledger: Arc<TokenLedger>,
    pub backend: Arc<dyn DiffusionBackend>,
    pub storage: Option<Arc<ImageStorageManager>>,
    pub queue: TrainingQueue,
    pub registry: Arc<TaskRegistry>,
}

/// Caller identity. Authentication proper is out of scope; the upstream
/// proxy or API gateway is expected to set this header.
pub fn member_id(req: &HttpRequest) -> Result<String> {
    req.headers()
        .get("X-Member-Id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| GatewayError::ValidationError("X-Member-Id header is required".into()))
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .service(
            web::scope("/generation")
                .route("/txt2img/{gpu_env}", web::post().to(generation::txt2img))
                .route("/img2img/{gpu_env}", web::post().to(generation::img2img))
                .route(
                    "/inpainting/{gpu_env}",
                    web::post().to(generation::inpainting),
                ),
        )
        .service(
            web::scope("/training")
                .route("/tasks/{task_id}", web::get().to(training::task_status))
                .route("/{gpu_env}", web::post().to(training::start_training)),
        );
}

pub async fn run(state: AppState) -> std::io::Result<()> {
    let port = state.config.port.unwrap_or(DEFAULT_PORT);
    let state = web::Data::new(state);

    log::info!("Starting gateway on 0.0.0.0:{}", port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(configure_routes)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
