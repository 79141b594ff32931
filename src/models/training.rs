use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Parameters for a fine-tuning run. The gateway only marshals these into
/// the launcher's command line; the training loop itself is the
/// subprocess's business.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingForm {
    pub model: String,
    pub train_data_dir: String,
    pub resolution: u32,
    pub num_train_epochs: u32,
    pub train_batch_size: u32,
    pub learning_rate: f64,
    pub gpu_device: u32,
}

impl TrainingForm {
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| -> Result<&str> {
            fields
                .get(name)
                .map(|s| s.as_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    GatewayError::ValidationError(format!("field '{}' is required", name))
                })
        };

        let model = get("model")?.to_string();
        let train_data_dir = get("train_data_dir")?.to_string();
        let gpu_device = get("gpu_device")?.parse::<u32>().map_err(|_| {
            GatewayError::ValidationError("field 'gpu_device' has an invalid value".into())
        })?;

        let parse_or = |name: &str, default: u32| -> Result<u32> {
            match fields.get(name).filter(|s| !s.is_empty()) {
                Some(raw) => raw.parse::<u32>().map_err(|_| {
                    GatewayError::ValidationError(format!(
                        "field '{}' has an invalid value",
                        name
                    ))
                }),
                None => Ok(default),
            }
        };

        let resolution = parse_or("resolution", 512)?;
        let num_train_epochs = parse_or("num_train_epochs", 10)?;
        let train_batch_size = parse_or("train_batch_size", 1)?;
        if num_train_epochs == 0 || train_batch_size == 0 {
            return Err(GatewayError::ValidationError(
                "epochs and batch size must be positive".into(),
            ));
        }

        let learning_rate = match fields.get("learning_rate").filter(|s| !s.is_empty()) {
            Some(raw) => raw.parse::<f64>().map_err(|_| {
                GatewayError::ValidationError("field 'learning_rate' has an invalid value".into())
            })?,
            None => 1e-4,
        };
        if learning_rate <= 0.0 {
            return Err(GatewayError::ValidationError(
                "field 'learning_rate' must be positive".into(),
            ));
        }

        Ok(TrainingForm {
            model,
            train_data_dir,
            resolution,
            num_train_epochs,
            train_batch_size,
            learning_rate,
            gpu_device,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "detail")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub member_id: String,
    pub model: String,
    pub cost: u64,
    #[serde(flatten)]
    pub state: TaskState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
