//! Object storage: the capability pair the backup pipeline needs, and its
//! S3 wire-protocol implementation.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    primitives::ByteStream,
    Client,
};

use crate::config::S3Settings;

/// Upload/download capability against a bucket provider.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Streaming PUT of a local file.
    async fn upload(
        &self,
        bucket: &str,
        object: &str,
        source: &Path,
        content_type: &str,
    ) -> Result<()>;
    /// Streaming GET into a local file, for restore.
    async fn download(&self, bucket: &str, object: &str, dest: &Path) -> Result<()>;
}

/// S3 wire protocol provider with configurable endpoint, region,
/// credentials, and TLS.
pub struct S3Provider {
    client: Client,
}

impl S3Provider {
    pub fn new(settings: &S3Settings) -> Self {
        let scheme = if settings.secure { "https" } else { "http" };
        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.clone(),
            None,
            None,
            "haven-env",
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .endpoint_url(format!("{scheme}://{}", settings.endpoint))
            .credentials_provider(credentials)
            // Third-party S3 endpoints rarely speak virtual-host addressing.
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
        }
    }
}

#[async_trait]
impl ObjectStorage for S3Provider {
    async fn upload(
        &self,
        bucket: &str,
        object: &str,
        source: &Path,
        content_type: &str,
    ) -> Result<()> {
        let body = ByteStream::from_path(source)
            .await
            .with_context(|| format!("reading {}", source.display()))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(object)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .with_context(|| format!("uploading {object} to {bucket}"))?;
        Ok(())
    }

    async fn download(&self, bucket: &str, object: &str, dest: &Path) -> Result<()> {
        let out = self
            .client
            .get_object()
            .bucket(bucket)
            .key(object)
            .send()
            .await
            .with_context(|| format!("downloading {object} from {bucket}"))?;
        let bytes = out
            .body
            .collect()
            .await
            .context("reading object body")?
            .into_bytes();
        std::fs::write(dest, &bytes).with_context(|| format!("writing {}", dest.display()))?;
        Ok(())
    }
}
