//! Object storage collaborator
//!
//! The pipeline only needs two operations from the bucket: a full listing
//! and a per-object download. They sit behind [`ObjectStore`] so the
//! orchestrator can be exercised against an in-memory store in tests; the
//! production implementation speaks the S3 API (AWS, MinIO, or a
//! GCS-interop endpoint).

use adp_common::{AdpError, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    Client,
};
use tracing::{debug, info};

use crate::config::StorageConfig;

/// Listing and download operations the pipeline consumes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List every object name in the bucket.
    async fn list(&self) -> Result<Vec<String>>;

    /// Download one object's bytes.
    async fn download(&self, name: &str) -> Result<Vec<u8>>;
}

/// S3-compatible implementation of [`ObjectStore`].
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        debug!("Initializing object store with config: {:?}", config);

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "adp-storage",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        info!("Object store client initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| {
                AdpError::Storage(format!("listing bucket {}: {}", self.bucket, e))
            })?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    names.push(key.to_string());
                }
            }

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        debug!(bucket = %self.bucket, objects = names.len(), "Listed bucket");
        Ok(names)
    }

    async fn download(&self, name: &str) -> Result<Vec<u8>> {
        debug!("Downloading s3://{}/{}", self.bucket, name);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| AdpError::Storage(format!("downloading {}: {}", name, e)))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| AdpError::Storage(format!("reading body of {}: {}", name, e)))?
            .into_bytes()
            .to_vec();

        debug!(
            "Downloaded {} bytes from s3://{}/{}",
            data.len(),
            self.bucket,
            name
        );
        Ok(data)
    }
}
