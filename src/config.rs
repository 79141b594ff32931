use std::env;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AiServerConfig {
    pub url: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub launcher: Option<String>,
    pub output_dir: Option<String>,
    pub token_cost: u64,
    pub queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: Option<u16>,
    pub base_models: Vec<String>,
    pub default_token_grant: u64,
    pub s3: Option<S3Config>,
    pub ai_server: Option<AiServerConfig>,
    pub training: TrainingConfig,
}

impl Default for S3Config {
    fn default() -> Self {
        S3Config {
            bucket: None,
            region: None,
            access_key: None,
            secret_key: None,
        }
    }
}

impl S3Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let bucket = env::var("AWS_S3_BUCKET").ok();
        let region = env::var("AWS_S3_REGION").ok();
        let access_key = env::var("AWS_S3_ACCESS_KEY").ok();
        let secret_key = env::var("AWS_S3_SECRET_KEY").ok();

        S3Config {
            bucket,
            region,
            access_key,
            secret_key,
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>, region: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self.region = Some(region.into());
        self
    }

    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self
    }

    pub fn is_complete(&self) -> bool {
        self.bucket.is_some() && self.region.is_some()
    }
}

impl Default for AiServerConfig {
    fn default() -> Self {
        AiServerConfig {
            url: None,
            request_timeout_secs: None,
        }
    }
}

impl AiServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let url = env::var("AI_SERVER_URL").ok();
        let request_timeout_secs = env::var("AI_SERVER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok());

        AiServerConfig {
            url,
            request_timeout_secs,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            launcher: None,
            output_dir: None,
            token_cost: 100,
            queue_depth: 16,
        }
    }
}

impl TrainingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let launcher = env::var("TRAINING_LAUNCHER").ok();
        let output_dir = env::var("TRAINING_OUTPUT_DIR").ok();
        let token_cost = env::var("TRAINING_TOKEN_COST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);
        let queue_depth = env::var("TRAINING_QUEUE_DEPTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(16);

        TrainingConfig {
            launcher,
            output_dir,
            token_cost,
            queue_depth,
        }
    }

    pub fn with_launcher(mut self, launcher: impl Into<String>) -> Self {
        self.launcher = Some(launcher.into());
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<String>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: None,
            base_models: vec!["CompVis/stable-diffusion-v1-4".to_string()],
            default_token_grant: 1000,
            s3: None,
            ai_server: None,
            training: TrainingConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let port = env::var("PORT").ok().and_then(|port| port.parse().ok());
        // BASE_MODEL_NAME is a `|`-separated list; the last entry is the
        // default for inpainting, the first for txt2img and img2img.
        let base_models = env::var("BASE_MODEL_NAME")
            .ok()
            .map(|raw| {
                raw.split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|models| !models.is_empty())
            .unwrap_or_else(|| Config::default().base_models);
        let default_token_grant = env::var("DEFAULT_TOKEN_GRANT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);

        Config {
            port,
            base_models,
            default_token_grant,
            s3: Some(S3Config::from_env()),
            ai_server: Some(AiServerConfig::from_env()),
            training: TrainingConfig::from_env(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_base_models(mut self, models: Vec<String>) -> Self {
        if !models.is_empty() {
            self.base_models = models;
        }
        self
    }

    pub fn with_s3(mut self, config: S3Config) -> Self {
        self.s3 = Some(config);
        self
    }

    pub fn with_ai_server(mut self, config: AiServerConfig) -> Self {
        self.ai_server = Some(config);
        self
    }

    pub fn with_training(mut self, config: TrainingConfig) -> Self {
        self.training = config;
        self
    }

    pub fn is_base_model(&self, name: &str) -> bool {
        self.base_models.iter().any(|m| m == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_model_list_splits_on_pipe() {
        std::env::set_var(
            "BASE_MODEL_NAME",
            "CompVis/stable-diffusion-v1-4|diffusers/stable-diffusion-xl-1.0-inpainting-0.1",
        );
        let config = Config::from_env();
        assert_eq!(config.base_models.len(), 2);
        assert!(config.is_base_model("CompVis/stable-diffusion-v1-4"));
        assert!(!config.is_base_model("someone/fine-tune"));
        std::env::remove_var("BASE_MODEL_NAME");
    }

    #[test]
    fn builders_compose() {
        let config = Config::new()
            .with_port(9000)
            .with_ai_server(AiServerConfig::new().with_url("http://ai:8001"))
            .with_s3(S3Config::new().with_bucket("images", "ap-northeast-2"));
        assert_eq!(config.port, Some(9000));
        assert!(config.s3.unwrap().is_complete());
    }
}
