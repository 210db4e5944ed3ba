use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use thiserror::Error;

use crate::config::S3Settings;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("not ours: {0}")]
    ForeignUrl(String),
    #[error("other: {0}")]
    Other(String),
}

/// Where uploaded images live. `upload` returns the public URL stored on
/// posts; `delete` takes that URL back.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8], mime: &str) -> Result<String, BlobError>;
    async fn delete(&self, url: &str) -> Result<(), BlobError>;
    /// Object key behind `url`, `None` for URLs this store does not serve.
    fn key_of(&self, url: &str) -> Option<String>;
}

/// Key prefix of every image one user uploaded. The id is hex encoded so
/// any user id yields a single path segment.
pub fn image_prefix(owner_id: &str) -> String {
    format!("images/{}/", hex::encode(owner_id.as_bytes()))
}

/// Object key for an image: `images/<owner>/<first two hex chars>/<sha256>.<ext>`.
pub fn image_path(owner_id: &str, hash: &str, ext: &str) -> String {
    let shard = hash.get(0..2).unwrap_or("00");
    format!("{}{shard}/{hash}.{ext}", image_prefix(owner_id))
}

// S3 or MinIO; path-style addressing
pub struct S3BlobStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    public_base_url: String,
}

impl S3BlobStore {
    pub async fn new(cfg: &S3Settings) -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(cfg.region.clone()));
        if let Some(endpoint) = &cfg.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access), Some(secret)) = (&cfg.access_key, &cfg.secret_key) {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf).force_path_style(true).build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("initialized S3 client for bucket '{}'", cfg.bucket);

        if let Err(e) = client.head_bucket().bucket(&cfg.bucket).send().await {
            warn!("head_bucket failed for '{}' (will attempt create): {e:?}", cfg.bucket);
            let max_attempts = 8u32;
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match client.create_bucket().bucket(&cfg.bucket).send().await {
                    Ok(_) => {
                        info!("created bucket '{}' (attempt {attempt})", cfg.bucket);
                        break;
                    }
                    Err(e2) if attempt >= max_attempts => {
                        error!("create_bucket failed for '{}' after {attempt} attempts: {e2:?}", cfg.bucket);
                        return Err(anyhow::anyhow!("failed to ensure bucket '{}': {e2}", cfg.bucket));
                    }
                    Err(e2) => {
                        let backoff_ms = 200 * u64::from(attempt.pow(2));
                        warn!("create_bucket attempt {attempt} failed: {e2:?} (retrying in {backoff_ms}ms)");
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    }
                }
            }
        }

        Ok(Self {
            bucket: cfg.bucket.clone(),
            client,
            public_base_url: cfg.public_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.public_base_url, path)
    }

    fn path_of<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(self.public_base_url.as_str())?.strip_prefix('/')
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(&self, path: &str, bytes: &[u8], mime: &str) -> Result<String, BlobError> {
        use aws_sdk_s3::primitives::ByteStream;
        // content addressed: an existing object already holds these bytes
        if self.client.head_object().bucket(&self.bucket).key(path).send().await.is_ok() {
            return Ok(self.url_for(path));
        }
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(mime);
        if let Err(e) = put.send().await {
            error!("put_object failed key={path} bucket={} err={e:?}", self.bucket);
            let hint = if e.to_string().contains("NoSuchBucket") {
                " (bucket missing or not yet propagated)"
            } else if e.to_string().contains("AccessDenied") {
                " (check S3_ACCESS_KEY/S3_SECRET_KEY permissions)"
            } else {
                ""
            };
            return Err(BlobError::Other(format!("{e}{hint}")));
        }
        Ok(self.url_for(path))
    }

    async fn delete(&self, url: &str) -> Result<(), BlobError> {
        let path = self.path_of(url).ok_or_else(|| BlobError::ForeignUrl(url.to_string()))?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| BlobError::Other(e.to_string()))?;
        Ok(())
    }

    fn key_of(&self, url: &str) -> Option<String> {
        self.path_of(url).map(str::to_string)
    }
}

pub async fn build_blob_store(cfg: &S3Settings) -> anyhow::Result<Arc<dyn BlobStore>> {
    Ok(Arc::new(S3BlobStore::new(cfg).await?))
}

#[cfg(test)]
mod tests {
    use super::{image_path, image_prefix};

    #[test]
    fn image_paths_are_per_owner_and_sharded_by_hash_prefix() {
        assert_eq!(image_path("bo", "abcdef", "png"), "images/626f/ab/abcdef.png");
        assert_eq!(image_path("bo", "a", "png"), "images/626f/00/a.png");
        assert!(image_path("bo", "abcdef", "png").starts_with(&image_prefix("bo")));
        assert_ne!(image_prefix("a/b"), image_prefix("a"));
    }
}
