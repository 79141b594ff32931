use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::TrainingConfig;
use crate::error::{GatewayError, Result};
use crate::models::{TaskRecord, TaskState, TrainingForm};
use crate::tokens::TokenLedger;

/// One queued fine-tuning run.
#[derive(Debug)]
pub struct TrainingJob {
    pub task_id: String,
    pub member_id: String,
    pub form: TrainingForm,
    pub cost: u64,
}

/// Shared view of task states, written by the worker and read by the
/// status endpoint.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: TaskRecord) {
        self.tasks
            .lock()
            .unwrap()
            .insert(record.task_id.clone(), record);
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.lock().unwrap().get(task_id).cloned()
    }

    pub fn set_state(&self, task_id: &str, state: TaskState) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(record) = tasks.get_mut(task_id) {
            let finished = matches!(state, TaskState::Succeeded | TaskState::Failed(_));
            record.state = state;
            if finished {
                record.finished_at = Some(Utc::now());
            }
        }
    }
}

/// Sender half of the single training queue. The worker drains jobs one at
/// a time and runs each launcher subprocess to completion.
#[derive(Clone)]
pub struct TrainingQueue {
    tx: mpsc::Sender<TrainingJob>,
}

impl TrainingQueue {
    pub async fn enqueue(
        &self,
        member_id: &str,
        form: TrainingForm,
        cost: u64,
        registry: &TaskRegistry,
    ) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        registry.insert(TaskRecord {
            task_id: task_id.clone(),
            member_id: member_id.to_string(),
            model: form.model.clone(),
            cost,
            state: TaskState::Queued,
            enqueued_at: Utc::now(),
            finished_at: None,
        });

        self.tx
            .send(TrainingJob {
                task_id: task_id.clone(),
                member_id: member_id.to_string(),
                form,
                cost,
            })
            .await
            .map_err(|_| GatewayError::InternalError("training worker is gone".into()))?;

        Ok(task_id)
    }
}

/// Arguments handed to the launcher, in the order the training script
/// parses them.
pub fn launcher_args(form: &TrainingForm, output_dir: &str, member_id: &str) -> Vec<String> {
    vec![
        "--pretrained_model".to_string(),
        form.model.clone(),
        "--train_data_dir".to_string(),
        form.train_data_dir.clone(),
        "--resolution".to_string(),
        form.resolution.to_string(),
        "--num_train_epochs".to_string(),
        form.num_train_epochs.to_string(),
        "--train_batch_size".to_string(),
        form.train_batch_size.to_string(),
        "--learning_rate".to_string(),
        form.learning_rate.to_string(),
        "--output_dir".to_string(),
        format!("{}/{}/{}", output_dir, member_id, form.model),
    ]
}

/// Spawn the worker task. Returns the queue handle; the registry is shared
/// with the HTTP layer.
pub fn spawn_worker(
    config: TrainingConfig,
    registry: Arc<TaskRegistry>,
    ledger: Arc<TokenLedger>,
) -> TrainingQueue {
    let (tx, mut rx) = mpsc::channel::<TrainingJob>(config.queue_depth);
    let launcher = config.launcher.clone();
    let output_dir = config
        .output_dir
        .clone()
        .unwrap_or_else(|| "output".to_string());

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let Some(launcher) = launcher.as_deref() else {
                registry.set_state(
                    &job.task_id,
                    TaskState::Failed("no training launcher configured".into()),
                );
                ledger.refund(&job.member_id, job.cost);
                continue;
            };

            log::info!(
                "Starting training task {} (model: {}, member: {})",
                job.task_id,
                job.form.model,
                job.member_id
            );
            registry.set_state(&job.task_id, TaskState::Running);

            let status = Command::new(launcher)
                .args(launcher_args(&job.form, &output_dir, &job.member_id))
                .env("CUDA_VISIBLE_DEVICES", job.form.gpu_device.to_string())
                .status()
                .await;

            match status {
                Ok(status) if status.success() => {
                    log::info!("Training task {} completed successfully", job.task_id);
                    registry.set_state(&job.task_id, TaskState::Succeeded);
                }
                Ok(status) => {
                    let message = format!(
                        "process exited with code {}",
                        status.code().unwrap_or(-1)
                    );
                    log::error!("Training task {} failed: {}", job.task_id, message);
                    registry.set_state(&job.task_id, TaskState::Failed(message));
                    ledger.refund(&job.member_id, job.cost);
                }
                Err(e) => {
                    let message = format!("failed to spawn launcher: {}", e);
                    log::error!("Training task {} failed: {}", job.task_id, message);
                    registry.set_state(&job.task_id, TaskState::Failed(message));
                    ledger.refund(&job.member_id, job.cost);
                }
            }
        }
    });

    TrainingQueue { tx }
}
