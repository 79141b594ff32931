use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use base64::Engine as _;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::models::{
    GenerationForm, GenerationMode, GenerationResponse, GpuEnvironment, TaskResponse,
    UploadedImage,
};
use crate::server::multipart::{drain, FormData};
use crate::server::{member_id, AppState};
use crate::tokens::token_cost;

pub async fn txt2img(
    state: web::Data<AppState>,
    path: web::Path<GpuEnvironment>,
    req: HttpRequest,
    payload: Multipart,
) -> Result<HttpResponse> {
    handle(GenerationMode::Txt2Img, state, path.into_inner(), req, payload).await
}

pub async fn img2img(
    state: web::Data<AppState>,
    path: web::Path<GpuEnvironment>,
    req: HttpRequest,
    payload: Multipart,
) -> Result<HttpResponse> {
    handle(GenerationMode::Img2Img, state, path.into_inner(), req, payload).await
}

pub async fn inpainting(
    state: web::Data<AppState>,
    path: web::Path<GpuEnvironment>,
    req: HttpRequest,
    payload: Multipart,
) -> Result<HttpResponse> {
    handle(
        GenerationMode::Inpainting,
        state,
        path.into_inner(),
        req,
        payload,
    )
    .await
}

/// Files to forward upstream and the image count entering the cost rule.
fn collect_images(mode: GenerationMode, form_data: &FormData) -> Result<(Vec<UploadedImage>, u64)> {
    match mode {
        GenerationMode::Txt2Img => Ok((Vec::new(), 1)),
        GenerationMode::Img2Img => {
            let images = form_data.files_named("images");
            if images.is_empty() {
                return Err(GatewayError::ValidationError(
                    "at least one source image is required".into(),
                ));
            }
            let count = images.len() as u64;
            Ok((images.into_iter().cloned().collect(), count))
        }
        GenerationMode::Inpainting => {
            let init = form_data.files_named("init_image");
            let mask = form_data.files_named("mask_image");
            if init.is_empty() {
                return Err(GatewayError::ValidationError(
                    "at least one init image is required".into(),
                ));
            }
            if init.len() != mask.len() {
                return Err(GatewayError::ValidationError(
                    "the number of init images and mask images must match".into(),
                ));
            }
            let count = init.len() as u64;
            let files = init.into_iter().chain(mask).cloned().collect();
            Ok((files, count))
        }
    }
}

fn default_model(mode: GenerationMode, base_models: &[String]) -> &str {
    // Inpainting defaults to the dedicated inpainting checkpoint, which is
    // configured last in BASE_MODEL_NAME.
    match mode {
        GenerationMode::Inpainting => base_models.last(),
        _ => base_models.first(),
    }
    .map(|s| s.as_str())
    .unwrap_or("CompVis/stable-diffusion-v1-4")
}

async fn handle(
    mode: GenerationMode,
    state: web::Data<AppState>,
    gpu_env: GpuEnvironment,
    req: HttpRequest,
    payload: Multipart,
) -> Result<HttpResponse> {
    if gpu_env == GpuEnvironment::Local {
        return Err(GatewayError::ValidationError(
            "the local version is not yet supported".into(),
        ));
    }

    let member = member_id(&req)?;
    let form_data = drain(payload).await?;

    let mut form = GenerationForm::from_fields(
        mode,
        &form_data.fields,
        default_model(mode, &state.config.base_models),
    )?;
    let (images, num_images) = collect_images(mode, &form_data)?;

    let cost = token_cost(num_images, form.batch_count, form.batch_size);
    let remaining = state.ledger.charge(&member, cost)?;
    log::info!(
        "Member {} charged {} tokens for {} ({} remaining)",
        member,
        cost,
        mode,
        remaining
    );

    form.resolve_seed();
    form.resolve_model_path(&member, &state.config.base_models);

    let _timer = crate::logger::timer(&format!("{} generation", mode));
    let reply = match state.backend.generate(mode, &form, &images).await {
        Ok(reply) => reply,
        Err(e) => {
            // The images were never produced; give the tokens back.
            state.ledger.refund(&member, cost);
            return Err(e);
        }
    };

    if let Some(task_id) = reply.task_id {
        return Ok(HttpResponse::Ok().json(TaskResponse { task_id }));
    }

    let image_urls = persist_images(&state, &member, &form, &reply.image_list).await;

    Ok(HttpResponse::Ok().json(GenerationResponse {
        image_list: reply.image_list,
        image_urls,
        seed: form.seed,
    }))
}

/// Upload the decoded images when storage is configured. The generation
/// already succeeded and was paid for, so failures here degrade to a
/// base64-only response. The returned URLs correspond one-to-one, in
/// order, with `image_list`; a single undecodable image therefore aborts
/// the whole upload instead of shifting the list.
async fn persist_images(
    state: &AppState,
    member: &str,
    form: &GenerationForm,
    image_list: &[String],
) -> Option<Vec<String>> {
    let storage = state.storage.as_ref()?;

    let mut decoded = Vec::with_capacity(image_list.len());
    for encoded in image_list {
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(bytes) => decoded.push(bytes),
            Err(e) => {
                log::error!("Undecodable image in AI server reply, skipping upload: {}", e);
                return None;
            }
        }
    }
    if decoded.is_empty() {
        return None;
    }

    let prefix = form
        .output_path
        .clone()
        .unwrap_or_else(|| format!("{}/{}", member, Uuid::new_v4()));

    let expected = decoded.len();
    match storage.upload_batch(&prefix, decoded).await {
        Ok(urls) if urls.len() == expected => Some(urls),
        Ok(_) => None,
        Err(e) => {
            log::error!("Image upload failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TrainingConfig};
    use crate::pipeline::{DiffusionBackend, UpstreamReply};
    use crate::server::configure_routes;
    use crate::storage::s3::object_key;
    use crate::storage::{ImageStorage, ImageStorageManager};
    use crate::tokens::TokenLedger;
    use crate::worker::{spawn_worker, TaskRegistry};
    use actix_web::{test, App};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StubBackend {
        reply: Option<UpstreamReply>,
    }

    #[async_trait]
    impl DiffusionBackend for StubBackend {
        async fn generate(
            &self,
            _mode: GenerationMode,
            _form: &GenerationForm,
            _images: &[UploadedImage],
        ) -> Result<UpstreamReply> {
            self.reply
                .clone()
                .ok_or_else(|| GatewayError::UpstreamError("AI server is down".into()))
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(self.reply.is_some())
        }
    }

    /// In-memory storage that mints predictable URLs, or fails outright.
    struct MemoryStorage {
        fail: bool,
    }

    impl MemoryStorage {
        fn url(key: &str) -> String {
            format!("https://cdn.test/{}", key)
        }
    }

    #[async_trait]
    impl ImageStorage for MemoryStorage {
        async fn upload(&self, key: &str, _bytes: Vec<u8>) -> Result<String> {
            if self.fail {
                return Err(GatewayError::StorageError("bucket is gone".into()));
            }
            Ok(Self::url(key))
        }

        async fn upload_batch(&self, prefix: &str, images: Vec<Vec<u8>>) -> Result<Vec<String>> {
            if self.fail {
                return Err(GatewayError::StorageError("bucket is gone".into()));
            }
            Ok((0..images.len())
                .map(|index| Self::url(&object_key(prefix, index)))
                .collect())
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_batch(&self, _prefix: &str, _num_images: usize) -> Result<()> {
            Ok(())
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(!self.fail)
        }
    }

    fn build_state(
        grant: u64,
        reply: Option<UpstreamReply>,
        storage: Option<Arc<ImageStorageManager>>,
    ) -> web::Data<AppState> {
        let ledger = Arc::new(TokenLedger::new(grant));
        let registry = Arc::new(TaskRegistry::new());
        let queue = spawn_worker(
            TrainingConfig::new().with_launcher("true"),
            registry.clone(),
            ledger.clone(),
        );
        web::Data::new(AppState {
            config: Config::new(),
            ledger,
            backend: Arc::new(StubBackend { reply }),
            storage,
            queue,
            registry,
        })
    }

    fn state(grant: u64, reply: Option<UpstreamReply>) -> web::Data<AppState> {
        build_state(grant, reply, None)
    }

    fn state_with_storage(
        grant: u64,
        reply: Option<UpstreamReply>,
        fail: bool,
    ) -> web::Data<AppState> {
        let manager = ImageStorageManager::from_backend(Arc::new(MemoryStorage { fail }));
        build_state(grant, reply, Some(Arc::new(manager)))
    }

    const BOUNDARY: &str = "----sdgate-test-boundary";

    fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (name, file_name, data) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn post(uri: &str, body: Vec<u8>) -> test::TestRequest {
        test::TestRequest::post()
            .uri(uri)
            .insert_header(("X-Member-Id", "member-7"))
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(body)
    }

    fn minimal_fields<'a>() -> Vec<(&'a str, &'a str)> {
        vec![("prompt", "a watercolor fox"), ("gpu_device", "0")]
    }

    #[actix_web::test]
    async fn txt2img_returns_the_generated_images() {
        let state = state(
            100,
            Some(UpstreamReply {
                image_list: vec!["aGVsbG8=".to_string()],
                task_id: None,
            }),
        );
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;

        let body = multipart_body(&minimal_fields(), &[]);
        let resp = test::call_service(&app, post("/generation/txt2img/remote", body).to_request())
            .await;
        assert!(resp.status().is_success());

        let reply: GenerationResponse = test::read_body_json(resp).await;
        assert_eq!(reply.image_list, vec!["aGVsbG8=".to_string()]);
        assert!(reply.image_urls.is_none());
        assert!(reply.seed >= 0);
        // One image, batch 1x1.
        assert_eq!(state.ledger.balance("member-7"), 99);
    }

    #[actix_web::test]
    async fn insufficient_tokens_is_a_400_before_any_upstream_call() {
        let state = state(
            5,
            Some(UpstreamReply {
                image_list: vec!["aGVsbG8=".to_string()],
                task_id: None,
            }),
        );
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;

        let mut fields = minimal_fields();
        fields.push(("batch_count", "3"));
        fields.push(("batch_size", "2"));
        let body = multipart_body(&fields, &[]);
        let resp = test::call_service(&app, post("/generation/txt2img/remote", body).to_request())
            .await;
        assert_eq!(resp.status(), 400);
        assert_eq!(state.ledger.balance("member-7"), 5);
    }

    #[actix_web::test]
    async fn upstream_failure_refunds_the_charge() {
        let state = state(100, None);
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;

        let body = multipart_body(&minimal_fields(), &[]);
        let resp = test::call_service(&app, post("/generation/txt2img/remote", body).to_request())
            .await;
        assert_eq!(resp.status(), 502);
        assert_eq!(state.ledger.balance("member-7"), 100);
    }

    #[actix_web::test]
    async fn inpainting_rejects_mismatched_image_pairs() {
        let state = state(
            100,
            Some(UpstreamReply {
                image_list: vec!["aGVsbG8=".to_string()],
                task_id: None,
            }),
        );
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;

        let body = multipart_body(
            &minimal_fields(),
            &[
                ("init_image", "a.png", b"fake-png"),
                ("init_image", "b.png", b"fake-png"),
                ("mask_image", "a-mask.png", b"fake-png"),
            ],
        );
        let resp =
            test::call_service(&app, post("/generation/inpainting/remote", body).to_request())
                .await;
        assert_eq!(resp.status(), 400);
        // The charge happens after file validation.
        assert_eq!(state.ledger.balance("member-7"), 100);
    }

    #[actix_web::test]
    async fn inpainting_cost_scales_with_the_image_count() {
        let state = state(
            100,
            Some(UpstreamReply {
                image_list: vec!["aGVsbG8=".to_string()],
                task_id: None,
            }),
        );
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;

        let mut fields = minimal_fields();
        fields.push(("batch_count", "2"));
        fields.push(("batch_size", "3"));
        let body = multipart_body(
            &fields,
            &[
                ("init_image", "a.png", b"fake-png"),
                ("init_image", "b.png", b"fake-png"),
                ("mask_image", "a-mask.png", b"fake-png"),
                ("mask_image", "b-mask.png", b"fake-png"),
            ],
        );
        let resp =
            test::call_service(&app, post("/generation/inpainting/remote", body).to_request())
                .await;
        assert!(resp.status().is_success());
        // 2 images x 2 batch_count x 3 batch_size = 12 tokens.
        assert_eq!(state.ledger.balance("member-7"), 88);
    }

    #[actix_web::test]
    async fn img2img_requires_a_source_image() {
        let state = state(
            100,
            Some(UpstreamReply {
                image_list: vec!["aGVsbG8=".to_string()],
                task_id: None,
            }),
        );
        let app =
            test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let body = multipart_body(&minimal_fields(), &[]);
        let resp = test::call_service(&app, post("/generation/img2img/remote", body).to_request())
            .await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn local_gpu_environment_is_not_available() {
        let state = state(
            100,
            Some(UpstreamReply {
                image_list: vec![],
                task_id: Some("t-1".to_string()),
            }),
        );
        let app =
            test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let body = multipart_body(&minimal_fields(), &[]);
        let resp = test::call_service(&app, post("/generation/txt2img/local", body).to_request())
            .await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn missing_member_header_is_rejected() {
        let state = state(
            100,
            Some(UpstreamReply {
                image_list: vec!["aGVsbG8=".to_string()],
                task_id: None,
            }),
        );
        let app =
            test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let body = multipart_body(&minimal_fields(), &[]);
        let req = test::TestRequest::post()
            .uri("/generation/txt2img/remote")
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn stored_image_urls_follow_the_reply_order() {
        let state = state_with_storage(
            100,
            Some(UpstreamReply {
                image_list: vec!["aGVsbG8=".to_string(), "d29ybGQ=".to_string()],
                task_id: None,
            }),
            false,
        );
        let app =
            test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let mut fields = minimal_fields();
        fields.push(("output_path", "member-7/run-1"));
        let body = multipart_body(&fields, &[]);
        let resp = test::call_service(&app, post("/generation/txt2img/remote", body).to_request())
            .await;
        assert!(resp.status().is_success());

        let reply: GenerationResponse = test::read_body_json(resp).await;
        assert_eq!(reply.image_list.len(), 2);
        assert_eq!(
            reply.image_urls,
            Some(vec![
                "https://cdn.test/member-7/run-1/1.jpeg".to_string(),
                "https://cdn.test/member-7/run-1/2.jpeg".to_string(),
            ])
        );
    }

    #[actix_web::test]
    async fn storage_failure_degrades_to_base64_only() {
        let state = state_with_storage(
            100,
            Some(UpstreamReply {
                image_list: vec!["aGVsbG8=".to_string()],
                task_id: None,
            }),
            true,
        );
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;

        let body = multipart_body(&minimal_fields(), &[]);
        let resp = test::call_service(&app, post("/generation/txt2img/remote", body).to_request())
            .await;
        // The images were generated and paid for; the reply stays a 200.
        assert!(resp.status().is_success());

        let reply: GenerationResponse = test::read_body_json(resp).await;
        assert_eq!(reply.image_list, vec!["aGVsbG8=".to_string()]);
        assert!(reply.image_urls.is_none());
        assert_eq!(state.ledger.balance("member-7"), 99);
    }

    #[actix_web::test]
    async fn undecodable_reply_image_skips_the_upload_entirely() {
        let state = state_with_storage(
            100,
            Some(UpstreamReply {
                image_list: vec!["aGVsbG8=".to_string(), "%%not-base64%%".to_string()],
                task_id: None,
            }),
            false,
        );
        let app =
            test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let body = multipart_body(&minimal_fields(), &[]);
        let resp = test::call_service(&app, post("/generation/txt2img/remote", body).to_request())
            .await;
        assert!(resp.status().is_success());

        // No partial URL list that would no longer line up with image_list.
        let reply: GenerationResponse = test::read_body_json(resp).await;
        assert_eq!(reply.image_list.len(), 2);
        assert!(reply.image_urls.is_none());
    }

    #[actix_web::test]
    async fn queued_upstream_work_returns_the_task_id() {
        let state = state(
            100,
            Some(UpstreamReply {
                image_list: vec![],
                task_id: Some("task-42".to_string()),
            }),
        );
        let app =
            test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let body = multipart_body(&minimal_fields(), &[]);
        let resp = test::call_service(&app, post("/generation/txt2img/remote", body).to_request())
            .await;
        assert!(resp.status().is_success());
        let reply: TaskResponse = test::read_body_json(resp).await;
        assert_eq!(reply.task_id, "task-42");
    }
}
