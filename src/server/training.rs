use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};

use crate::error::{GatewayError, Result};
use crate::models::{GpuEnvironment, TaskResponse, TrainingForm};
use crate::server::multipart::drain;
use crate::server::{member_id, AppState};

/// Enqueue a fine-tuning run. The flat per-run cost is charged up front
/// and refunded by the worker if the subprocess fails.
pub async fn start_training(
    state: web::Data<AppState>,
    path: web::Path<GpuEnvironment>,
    req: HttpRequest,
    payload: Multipart,
) -> Result<HttpResponse> {
    if path.into_inner() == GpuEnvironment::Local {
        return Err(GatewayError::ValidationError(
            "the local version is not yet supported".into(),
        ));
    }
    if state.config.training.launcher.is_none() {
        return Err(GatewayError::ConfigError(
            "no training launcher configured".into(),
        ));
    }

    let member = member_id(&req)?;
    let form_data = drain(payload).await?;
    let form = TrainingForm::from_fields(&form_data.fields)?;

    let cost = state.config.training.token_cost;
    let remaining = state.ledger.charge(&member, cost)?;
    log::info!(
        "Member {} charged {} tokens for training '{}' ({} remaining)",
        member,
        cost,
        form.model,
        remaining
    );

    let task_id = match state.queue.enqueue(&member, form, cost, &state.registry).await {
        Ok(task_id) => task_id,
        Err(e) => {
            state.ledger.refund(&member, cost);
            return Err(e);
        }
    };

    Ok(HttpResponse::Ok().json(TaskResponse { task_id }))
}

pub async fn task_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let task_id = path.into_inner();
    match state.registry.get(&task_id) {
        Some(record) => Ok(HttpResponse::Ok().json(record)),
        None => Ok(HttpResponse::NotFound()
            .json(serde_json::json!({ "detail": format!("unknown task '{}'", task_id) }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TrainingConfig};
    use crate::models::{GenerationForm, GenerationMode, TaskState, UploadedImage};
    use crate::pipeline::{DiffusionBackend, UpstreamReply};
    use crate::server::configure_routes;
    use crate::tokens::TokenLedger;
    use crate::worker::{spawn_worker, TaskRegistry};
    use actix_web::{test, App};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct NoBackend;

    #[async_trait]
    impl DiffusionBackend for NoBackend {
        async fn generate(
            &self,
            _mode: GenerationMode,
            _form: &GenerationForm,
            _images: &[UploadedImage],
        ) -> Result<UpstreamReply> {
            Err(GatewayError::UpstreamError("not under test".into()))
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(false)
        }
    }

    fn state(launcher: &str) -> web::Data<AppState> {
        let training = TrainingConfig::new().with_launcher(launcher);
        let ledger = Arc::new(TokenLedger::new(500));
        let registry = Arc::new(TaskRegistry::new());
        let queue = spawn_worker(training.clone(), registry.clone(), ledger.clone());
        web::Data::new(AppState {
            config: Config::new().with_training(training),
            ledger,
            backend: Arc::new(NoBackend),
            storage: None,
            queue,
            registry,
        })
    }

    const BOUNDARY: &str = "----sdgate-test-boundary";

    fn training_body() -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in [
            ("model", "my-style"),
            ("train_data_dir", "/data/member-7"),
            ("gpu_device", "0"),
        ] {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn post_training() -> test::TestRequest {
        test::TestRequest::post()
            .uri("/training/remote")
            .insert_header(("X-Member-Id", "member-7"))
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(training_body())
    }

    #[actix_web::test]
    async fn training_charges_and_reports_completion() {
        let state = state("true");
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;

        let resp = test::call_service(&app, post_training().to_request()).await;
        assert!(resp.status().is_success());
        let reply: TaskResponse = test::read_body_json(resp).await;
        assert_eq!(state.ledger.balance("member-7"), 400);

        // Poll the status endpoint until the worker finishes the run.
        for _ in 0..100 {
            let status = test::call_service(
                &app,
                test::TestRequest::get()
                    .uri(&format!("/training/tasks/{}", reply.task_id))
                    .to_request(),
            )
            .await;
            assert!(status.status().is_success());
            let record: crate::models::TaskRecord = test::read_body_json(status).await;
            if record.state == TaskState::Succeeded {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("training task never succeeded");
    }

    #[actix_web::test]
    async fn unknown_task_is_a_404() {
        let state = state("true");
        let app =
            test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/training/tasks/not-a-task")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 404);
    }
}
