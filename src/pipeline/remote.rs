use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;

use crate::config::AiServerConfig;
use crate::error::{GatewayError, Result};
use crate::models::{GenerationForm, GenerationMode, UploadedImage};
use crate::pipeline::{DiffusionBackend, UpstreamReply};

const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Proxies generation requests to the AI server as multipart POSTs. Field
/// names on the wire are the ones the server's form parser expects.
#[derive(Debug)]
pub struct RemoteDiffusionBackend {
    client: Client,
    base_url: String,
}

impl RemoteDiffusionBackend {
    pub fn new(config: AiServerConfig) -> Result<Self> {
        let base_url = config
            .url
            .ok_or_else(|| GatewayError::ConfigError("AI server URL is required".into()))?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let timeout = Duration::from_secs(
            config.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
        );
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::InternalError(format!("HTTP client build failed: {}", e)))?;

        Ok(Self { client, base_url })
    }

    fn build_form(form: &GenerationForm, images: &[UploadedImage]) -> Result<Form> {
        let mut multipart = Form::new()
            .text("model", form.model.clone())
            .text("prompt", form.prompt.clone())
            .text("width", form.width.to_string())
            .text("height", form.height.to_string())
            .text("num_inference_steps", form.num_inference_steps.to_string())
            .text("guidance_scale", form.guidance_scale.to_string())
            .text("seed", form.seed.to_string())
            .text("batch_count", form.batch_count.to_string())
            .text("batch_size", form.batch_size.to_string())
            .text("gpu_device", form.gpu_device.to_string());

        if let Some(scheduler) = form.scheduler {
            multipart = multipart.text("scheduler", scheduler.as_str());
        }
        if let Some(negative_prompt) = &form.negative_prompt {
            multipart = multipart.text("negative_prompt", negative_prompt.clone());
        }
        if let Some(strength) = form.strength {
            multipart = multipart.text("strength", strength.to_string());
        }
        if let Some(output_path) = &form.output_path {
            multipart = multipart.text("output_path", output_path.clone());
        }

        for image in images {
            let part = Part::bytes(image.data.clone())
                .file_name(image.file_name.clone())
                .mime_str(&image.content_type)
                .map_err(|e| {
                    GatewayError::ValidationError(format!(
                        "invalid content type '{}': {}",
                        image.content_type, e
                    ))
                })?;
            multipart = multipart.part(image.field_name.clone(), part);
        }

        Ok(multipart)
    }
}

#[async_trait]
impl DiffusionBackend for RemoteDiffusionBackend {
    async fn generate(
        &self,
        mode: GenerationMode,
        form: &GenerationForm,
        images: &[UploadedImage],
    ) -> Result<UpstreamReply> {
        let url = format!("{}/generation/{}", self.base_url, mode.as_str());
        let multipart = Self::build_form(form, images)?;

        log::info!(
            "Forwarding {} request to {} (model: {}, batches: {}x{})",
            mode,
            url,
            form.model,
            form.batch_count,
            form.batch_size
        );

        let response = self
            .client
            .post(&url)
            .multipart(multipart)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamError(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamError(format!(
                "AI server returned {}: {}",
                status, body
            )));
        }

        let reply: UpstreamReply = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamError(format!("unreadable reply: {}", e)))?;

        if reply.image_list.is_empty() && reply.task_id.is_none() {
            return Err(GatewayError::UpstreamError(
                "AI server returned neither images nor a task id".into(),
            ));
        }

        Ok(reply)
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                log::warn!("AI server health check failed: {}", e);
                Ok(false)
            }
        }
    }
}
