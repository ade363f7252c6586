//! S3-backed `BlobStore`.
//!
//! Small files go up in a single `PutObject`; anything above
//! `MULTIPART_THRESHOLD` is sent as a multipart upload so progress can be
//! reported part by part.
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{BlobHandle, BlobStore, BlobStoreError, ProgressCallback};

/// S3 requires every part but the last to be at least 5 MiB.
pub const PART_SIZE: usize = 5 * 1024 * 1024;
pub const MULTIPART_THRESHOLD: usize = PART_SIZE;

/// S3 configuration for the photo bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket_name: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>,
    /// Base for public URLs (CDN or website endpoint). Defaults to the
    /// bucket's own URL when unset.
    pub public_base_url: Option<String>,
}

impl S3Config {
    pub fn validate(&self) -> Result<(), BlobStoreError> {
        if self.bucket_name.trim().is_empty() {
            return Err(BlobStoreError::Config(
                "Bucket name cannot be empty".to_string(),
            ));
        }
        if self.region.trim().is_empty() {
            return Err(BlobStoreError::Config("Region cannot be empty".to_string()));
        }
        if self.access_key_id.trim().is_empty() {
            return Err(BlobStoreError::Config(
                "Access key ID cannot be empty".to_string(),
            ));
        }
        if self.secret_access_key.trim().is_empty() {
            return Err(BlobStoreError::Config(
                "Secret access key cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Public URL of an object key.
    pub fn public_url(&self, key: &str) -> String {
        let encoded_key = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        if let Some(base) = &self.public_base_url {
            format!("{}/{}", base.trim_end_matches('/'), encoded_key)
        } else if let Some(endpoint) = &self.endpoint_url {
            format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.bucket_name,
                encoded_key
            )
        } else {
            format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket_name, self.region, encoded_key
            )
        }
    }
}

pub struct S3BlobStore {
    client: Client,
    config: S3Config,
}

impl S3BlobStore {
    pub async fn new(config: S3Config) -> Result<Self, BlobStoreError> {
        config.validate()?;

        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "club-s3-config",
        );
        let mut builder = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);

        if let Some(endpoint) = &config.endpoint_url {
            let normalized_endpoint = endpoint.trim_end_matches('/').to_string();
            info!("Using custom S3 endpoint: {}", normalized_endpoint);
            builder = builder.endpoint_url(normalized_endpoint);
        } else {
            info!("Using default AWS S3 endpoint");
        }

        let aws_config = builder.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            config,
        })
    }

    async fn put_single(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobStoreError> {
        self.client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .content_type(content_type)
            .body(data.into())
            .send()
            .await
            .map_err(|e| BlobStoreError::Storage(format!("put {key}: {e}")))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
        on_progress: &ProgressCallback,
    ) -> Result<(), BlobStoreError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BlobStoreError::Storage(format!("create multipart {key}: {e}")))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| BlobStoreError::Storage(format!("no upload id for {key}")))?
            .to_string();

        match self
            .upload_parts(key, &upload_id, data, on_progress)
            .await
        {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.config.bucket_name)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| {
                        BlobStoreError::Storage(format!("complete multipart {key}: {e}"))
                    })?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.config.bucket_name)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("Failed to abort multipart upload for {}: {}", key, abort_err);
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        data: &[u8],
        on_progress: &ProgressCallback,
    ) -> Result<Vec<CompletedPart>, BlobStoreError> {
        let total = data.len() as u64;
        let mut sent = 0u64;
        let mut parts = Vec::new();

        for (i, chunk) in data.chunks(PART_SIZE).enumerate() {
            let part_number = (i + 1) as i32;
            let resp = self
                .client
                .upload_part()
                .bucket(&self.config.bucket_name)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| {
                    BlobStoreError::Storage(format!("upload part {part_number} of {key}: {e}"))
                })?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(resp.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );

            sent += chunk.len() as u64;
            debug!("Uploaded part {} of {} ({}/{} bytes)", part_number, key, sent, total);
            on_progress(sent, total);
        }

        Ok(parts)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        on_progress: ProgressCallback,
    ) -> Result<BlobHandle, BlobStoreError> {
        let total = data.len() as u64;
        debug!("Uploading {} ({} bytes)", key, total);

        on_progress(0, total);
        if data.len() > MULTIPART_THRESHOLD {
            self.put_multipart(key, &data, content_type, &on_progress)
                .await?;
        } else {
            self.put_single(key, data, content_type).await?;
            on_progress(total, total);
        }

        debug!("Successfully uploaded {}", key);
        Ok(BlobHandle {
            key: key.to_string(),
        })
    }

    async fn download_url(&self, handle: &BlobHandle) -> Result<String, BlobStoreError> {
        Ok(self.config.public_url(&handle.key))
    }
}
