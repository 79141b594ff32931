use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

pub const MIN_INFERENCE_STEPS: u32 = 1;
pub const MAX_INFERENCE_STEPS: u32 = 100;
pub const MIN_GUIDANCE_SCALE: f32 = 1.0;
pub const MAX_GUIDANCE_SCALE: f32 = 20.0;
pub const MIN_BATCH: u32 = 1;
pub const MAX_BATCH: u32 = 10;

/// Which pipeline the request is for. Decides the upstream route and the
/// default base model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    Txt2Img,
    Img2Img,
    Inpainting,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Txt2Img => "txt2img",
            GenerationMode::Img2Img => "img2img",
            GenerationMode::Inpainting => "inpainting",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the diffusion pipeline runs. `local` is accepted in the route so
/// the URL shape matches the clients, but the in-process pipeline is not
/// available yet and the handlers reject it with a 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuEnvironment {
    Local,
    Remote,
}

/// Sampling method controlling the noise level at each denoising step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerType {
    #[serde(rename = "DDIM")]
    Ddim,
    #[serde(rename = "PNDM")]
    Pndm,
    #[serde(rename = "LMSDiscrete")]
    LmsDiscrete,
    #[serde(rename = "EulerDiscrete")]
    EulerDiscrete,
    #[serde(rename = "EulerAncestralDiscrete")]
    EulerAncestralDiscrete,
    #[serde(rename = "DPMSolverMultistep")]
    DpmSolverMultistep,
    #[serde(rename = "UniPCMultistep")]
    UniPcMultistep,
}

impl SchedulerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerType::Ddim => "DDIM",
            SchedulerType::Pndm => "PNDM",
            SchedulerType::LmsDiscrete => "LMSDiscrete",
            SchedulerType::EulerDiscrete => "EulerDiscrete",
            SchedulerType::EulerAncestralDiscrete => "EulerAncestralDiscrete",
            SchedulerType::DpmSolverMultistep => "DPMSolverMultistep",
            SchedulerType::UniPcMultistep => "UniPCMultistep",
        }
    }
}

impl FromStr for SchedulerType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DDIM" => Ok(SchedulerType::Ddim),
            "PNDM" => Ok(SchedulerType::Pndm),
            "LMSDiscrete" => Ok(SchedulerType::LmsDiscrete),
            "EulerDiscrete" => Ok(SchedulerType::EulerDiscrete),
            "EulerAncestralDiscrete" => Ok(SchedulerType::EulerAncestralDiscrete),
            "DPMSolverMultistep" => Ok(SchedulerType::DpmSolverMultistep),
            "UniPCMultistep" => Ok(SchedulerType::UniPcMultistep),
            other => Err(GatewayError::ValidationError(format!(
                "unknown scheduler '{}'",
                other
            ))),
        }
    }
}

/// One uploaded image file from a multipart request.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub field_name: String,
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// The validated generation parameters shared by all three modes.
/// `strength` is only forwarded for img2img and inpainting.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationForm {
    pub model: String,
    pub scheduler: Option<SchedulerType>,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub strength: Option<f32>,
    pub seed: i64,
    pub batch_count: u32,
    pub batch_size: u32,
    pub gpu_device: u32,
    pub output_path: Option<String>,
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::ValidationError(format!("field '{}' is required", name)))
}

fn parse_field<T: FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<Option<T>> {
    match fields.get(name).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            GatewayError::ValidationError(format!("field '{}' has an invalid value", name))
        }),
        None => Ok(None),
    }
}

fn check_range<T: PartialOrd + fmt::Display>(name: &str, value: T, min: T, max: T) -> Result<T> {
    if value < min || value > max {
        return Err(GatewayError::ValidationError(format!(
            "field '{}' must be between {} and {}",
            name, min, max
        )));
    }
    Ok(value)
}

impl GenerationForm {
    /// Build a form from the text fields of a multipart request, applying
    /// the documented defaults and range checks.
    pub fn from_fields(
        mode: GenerationMode,
        fields: &HashMap<String, String>,
        default_model: &str,
    ) -> Result<Self> {
        let prompt = required(fields, "prompt")?.to_string();
        let gpu_device = parse_field::<u32>(fields, "gpu_device")?
            .ok_or_else(|| GatewayError::ValidationError("field 'gpu_device' is required".into()))?;

        let model = fields
            .get("model")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(default_model)
            .to_string();

        let scheduler = match fields.get("scheduler").map(|s| s.trim()).filter(|s| !s.is_empty()) {
            Some(raw) => Some(raw.parse::<SchedulerType>()?),
            None => None,
        };

        let negative_prompt = fields
            .get("negative_prompt")
            .filter(|s| !s.is_empty())
            .cloned();
        let output_path = fields.get("output_path").filter(|s| !s.is_empty()).cloned();

        let width = parse_field::<u32>(fields, "width")?.unwrap_or(512);
        let height = parse_field::<u32>(fields, "height")?.unwrap_or(512);
        if width == 0 || height == 0 {
            return Err(GatewayError::ValidationError(
                "image dimensions must be positive".into(),
            ));
        }

        let num_inference_steps = check_range(
            "num_inference_steps",
            parse_field::<u32>(fields, "num_inference_steps")?.unwrap_or(50),
            MIN_INFERENCE_STEPS,
            MAX_INFERENCE_STEPS,
        )?;
        let guidance_scale = check_range(
            "guidance_scale",
            parse_field::<f32>(fields, "guidance_scale")?.unwrap_or(7.5),
            MIN_GUIDANCE_SCALE,
            MAX_GUIDANCE_SCALE,
        )?;

        let strength = match mode {
            GenerationMode::Txt2Img => None,
            _ => Some(check_range(
                "strength",
                parse_field::<f32>(fields, "strength")?.unwrap_or(0.5),
                0.0,
                1.0,
            )?),
        };

        let seed = parse_field::<i64>(fields, "seed")?.unwrap_or(-1);
        if seed < -1 || seed > u32::MAX as i64 {
            return Err(GatewayError::ValidationError(
                "field 'seed' must be -1 or a 32-bit unsigned value".into(),
            ));
        }

        let batch_count = check_range(
            "batch_count",
            parse_field::<u32>(fields, "batch_count")?.unwrap_or(1),
            MIN_BATCH,
            MAX_BATCH,
        )?;
        let batch_size = check_range(
            "batch_size",
            parse_field::<u32>(fields, "batch_size")?.unwrap_or(1),
            MIN_BATCH,
            MAX_BATCH,
        )?;

        Ok(GenerationForm {
            model,
            scheduler,
            prompt,
            negative_prompt,
            width,
            height,
            num_inference_steps,
            guidance_scale,
            strength,
            seed,
            batch_count,
            batch_size,
            gpu_device,
            output_path,
        })
    }

    /// Replace a `-1` seed with a concrete random one so every image in the
    /// batch is reproducible from the response.
    pub fn resolve_seed(&mut self) {
        if self.seed == -1 {
            self.seed = rand::thread_rng().gen_range(0..=u32::MAX as i64);
        }
    }

    /// Base models are addressed by name; fine-tuned models live under the
    /// owning member's directory on the AI server.
    pub fn resolve_model_path(&mut self, member_id: &str, base_models: &[String]) {
        if !base_models.iter().any(|m| m == &self.model) {
            self.model = format!("{}/{}", member_id, self.model);
        }
    }
}

/// JSON reply for the generation endpoints. `image_list` carries the
/// base64-encoded PNGs from the AI server; `image_urls` is filled when the
/// outputs were persisted to object storage.
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub image_list: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_urls: Option<Vec<String>>,
    pub seed: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
}
