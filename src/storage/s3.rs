use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::config::S3Config;
use crate::error::{GatewayError, Result};
use crate::storage::traits::ImageStorage;

const CONTENT_TYPE: &str = "image/jpeg";

/// S3-backed image storage. Keys are `{prefix}/{index+1}.jpeg` and the
/// returned URLs use the bucket's virtual-hosted style.
pub struct S3ImageStorage {
    client: Client,
    bucket: String,
    region: String,
}

pub fn object_key(prefix: &str, index: usize) -> String {
    format!("{}/{}.jpeg", prefix, index + 1)
}

impl S3ImageStorage {
    pub async fn new(config: S3Config) -> Result<Self> {
        let bucket = config
            .bucket
            .ok_or_else(|| GatewayError::ConfigError("S3 bucket is required".into()))?;
        let region = config
            .region
            .ok_or_else(|| GatewayError::ConfigError("S3 region is required".into()))?;

        let aws_config = if let (Some(access_key), Some(secret_key)) =
            (&config.access_key, &config.secret_key)
        {
            aws_config::defaults(BehaviorVersion::latest())
                .credentials_provider(aws_sdk_s3::config::Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "sdgate",
                ))
                .region(aws_sdk_s3::config::Region::new(region.clone()))
                .load()
                .await
        } else {
            aws_config::defaults(BehaviorVersion::latest())
                .region(aws_sdk_s3::config::Region::new(region.clone()))
                .load()
                .await
        };

        Ok(Self {
            client: Client::new(&aws_config),
            bucket,
            region,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            self.bucket, self.region, key
        )
    }
}

#[async_trait]
impl ImageStorage for S3ImageStorage {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(CONTENT_TYPE)
            .content_disposition("inline")
            .send()
            .await
            .map_err(|e| GatewayError::StorageError(format!("upload of '{}' failed: {}", key, e)))?;

        Ok(self.object_url(key))
    }

    async fn upload_batch(&self, prefix: &str, images: Vec<Vec<u8>>) -> Result<Vec<String>> {
        let mut urls = Vec::with_capacity(images.len());
        for (index, bytes) in images.into_iter().enumerate() {
            let key = object_key(prefix, index);
            match self.upload(&key, bytes).await {
                Ok(url) => urls.push(url),
                Err(e) => log::error!("{}", e),
            }
        }
        Ok(urls)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| GatewayError::StorageError(format!("delete of '{}' failed: {}", key, e)))?;

        log::info!("Deleted object: {}", key);
        Ok(())
    }

    async fn delete_batch(&self, prefix: &str, num_images: usize) -> Result<()> {
        for index in 0..num_images {
            let key = object_key(prefix, index);
            if let Err(e) = self.delete(&key).await {
                log::error!("{}", e);
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                log::warn!("S3 health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_one_indexed_jpegs() {
        assert_eq!(object_key("temp", 0), "temp/1.jpeg");
        assert_eq!(object_key("member-7/abc", 9), "member-7/abc/10.jpeg");
    }
}
