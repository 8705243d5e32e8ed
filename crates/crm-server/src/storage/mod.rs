use anyhow::{Context, Result};
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use crm_common::checksum::sha256_hex;
use tracing::{debug, info, instrument};

pub mod config;

/// Thin wrapper over an S3-compatible bucket
#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        debug!("Initializing storage with config: {:?}", config);

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "crm-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(bucket = %config.bucket, "Storage client initialized");

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Upload a new object, recording its SHA-256 as object metadata.
    ///
    /// The put is conditional on the key being absent; an existing object is
    /// never replaced.
    #[instrument(skip(self, data))]
    pub async fn upload(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<UploadResult> {
        let key = self.full_key(key);
        let checksum = sha256_hex(&data);
        let size = data.len() as i64;

        debug!("Uploading {} bytes to s3://{}/{}", size, self.bucket, key);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .metadata("sha256", &checksum)
            .if_none_match("*")
            .body(ByteStream::from(data));

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request.send().await.context("Failed to upload to S3")?;

        info!("Successfully uploaded to s3://{}/{}", self.bucket, key);

        Ok(UploadResult {
            key,
            checksum,
            size,
        })
    }

    /// List every object key under a prefix (relative to the configured key prefix)
    #[instrument(skip(self))]
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = self.full_key(prefix);
        debug!("Listing objects in s3://{}/{}", self.bucket, prefix);

        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .context("Failed to list S3 objects")?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(|k| k.to_string())),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }

        Ok(keys)
    }
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub key: String,
    pub checksum: String,
    pub size: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(prefix: Option<&str>) -> Storage {
        Storage {
            client: Client::from_conf(aws_sdk_s3::Config::builder().build()),
            bucket: "test-bucket".to_string(),
            prefix: prefix.map(str::to_string),
        }
    }

    #[test]
    fn test_full_key_without_prefix() {
        assert_eq!(
            storage(None).full_key("accounts/raw/accounts_20240301_120000.json"),
            "accounts/raw/accounts_20240301_120000.json"
        );
    }

    #[test]
    fn test_full_key_with_prefix() {
        assert_eq!(
            storage(Some("crm")).full_key("accounts/raw/a.json"),
            "crm/accounts/raw/a.json"
        );
    }
}
