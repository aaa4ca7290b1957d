//! S3-compatible storage backend.
//!
//! Objects are stored under `{prefix}download/{shard}/{hash}` and
//! `{prefix}measure/{tier}`. Downloads and probes are never proxied: the
//! client is redirected to a presigned GET URL. Compatible with AWS S3,
//! MinIO, R2, etc.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Builder, Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata},
    presigning::PresigningConfig,
    primitives::ByteStream,
    Client,
};
use axum::http::{header, request::Parts, HeaderValue, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::addressing::{belongs_to_shard, hash_to_path, SHARDS};
use super::backend::{
    downcast_options, BlobReader, BlobWriter, HashVisitor, InitContext, Storage, StorageOptions,
};
use super::measure::{self, MeasureMedium};
use super::registry::{parse_options, StorageFactory};
use crate::error::{StorageError, StorageResult};
use crate::transfer::relay::{range_header, redirect_size};
use crate::transfer::ResponseSink;

/// S3 storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct S3StorageOption {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Optional prefix for all keys (e.g., "node-a/")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Force path-style URLs (required for MinIO)
    pub force_path_style: bool,
    /// Static credentials; the SDK's default provider chain is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    pub pre_gen_measures: bool,
    /// Lifetime of presigned redirect URLs.
    pub redirect_expiry_secs: u64,
}

impl Default for S3StorageOption {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            prefix: None,
            force_path_style: false,
            access_key: None,
            secret_key: None,
            pre_gen_measures: false,
            redirect_expiry_secs: 600,
        }
    }
}

/// S3-compatible storage backend
#[derive(Default)]
pub struct S3Storage {
    opt: S3StorageOption,
    client: Option<Client>,
}

pub fn factory() -> StorageFactory {
    StorageFactory {
        new: || -> Box<dyn Storage> { Box::new(S3Storage::default()) },
        new_config: parse_options::<S3StorageOption>,
    }
}

/// Map an SDK error; missing keys become `NotFound`.
fn sdk_error<E>(err: E, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    match err.code() {
        Some("NoSuchKey") | Some("NotFound") => StorageError::NotFound(key.to_string()),
        _ => StorageError::ObjectStore(DisplayErrorContext(&err).to_string()),
    }
}

async fn put_object(client: Client, bucket: String, key: String, data: Bytes) -> StorageResult<()> {
    client
        .put_object()
        .bucket(&bucket)
        .key(&key)
        .body(ByteStream::from(data))
        .send()
        .await
        .map_err(|e| sdk_error(e, &key))?;
    Ok(())
}

impl S3Storage {
    pub fn new(opt: S3StorageOption) -> Self {
        Self { opt, client: None }
    }

    async fn build_client(&self) -> StorageResult<Client> {
        let mut builder = match (&self.opt.access_key, &self.opt.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let creds = Credentials::new(access_key, secret_key, None, None, "static");
                Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(creds)
            }
            (None, None) => {
                // Load credentials from environment or use defaults
                let sdk_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
                Builder::from(&sdk_config)
            }
            _ => {
                return Err(StorageError::Config(
                    "access-key and secret-key must be set together".into(),
                ))
            }
        };
        builder = builder
            .region(Region::new(self.opt.region.clone()))
            .force_path_style(self.opt.force_path_style);
        if let Some(endpoint) = &self.opt.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Ok(Client::from_conf(builder.build()))
    }

    fn client(&self) -> StorageResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| StorageError::Config(format!("{} is not initialised", self)))
    }

    /// Build the full S3 key from a backend-relative path
    fn full_key(&self, path: &str) -> String {
        match &self.opt.prefix {
            Some(prefix) => format!("{}{}", prefix, path),
            None => path.to_string(),
        }
    }

    fn blob_key(&self, hash: &str) -> StorageResult<String> {
        Ok(self.full_key(&format!("download/{}", hash_to_path(hash)?)))
    }

    async fn head(&self, key: &str) -> StorageResult<u64> {
        let result = self
            .client()?
            .head_object()
            .bucket(&self.opt.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error(e, key))?;
        Ok(result.content_length.unwrap_or(0).max(0) as u64)
    }

    fn writer(&self, key: String) -> StorageResult<BlobWriter> {
        let client = self.client()?.clone();
        let bucket = self.opt.bucket.clone();
        Ok(BlobWriter::buffered(move |data| {
            put_object(client, bucket, key, data)
        }))
    }

    /// Presigned GET URL for `key`.
    async fn presign(&self, key: &str) -> StorageResult<String> {
        let config = PresigningConfig::expires_in(Duration::from_secs(self.opt.redirect_expiry_secs))
            .map_err(|e| StorageError::Config(e.to_string()))?;
        let request = self
            .client()?
            .get_object()
            .bucket(&self.opt.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| sdk_error(e, key))?;
        Ok(request.uri().to_string())
    }

    async fn redirect(&self, sink: &mut dyn ResponseSink, key: &str) -> StorageResult<()> {
        let location = self.presign(key).await?;
        let location = HeaderValue::try_from(location)
            .map_err(|e| StorageError::ObjectStore(e.to_string()))?;
        sink.headers_mut().insert(header::LOCATION, location);
        sink.send_head(StatusCode::FOUND).await
    }

    async fn list_shard(&self, shard: &str, visitor: &mut HashVisitor<'_>) -> StorageResult<()> {
        let shard_prefix = self.full_key(&format!("download/{}/", shard));
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client()?
                .list_objects_v2()
                .bucket(&self.opt.bucket)
                .prefix(&shard_prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let result = match request.send().await {
                Ok(result) => result,
                Err(e) => {
                    let e = sdk_error(e, &shard_prefix);
                    tracing::debug!(storage = %self, shard, error = %e, "skipping unreadable shard");
                    return Ok(());
                }
            };

            for obj in result.contents() {
                let Some(name) = obj.key().and_then(|k| k.strip_prefix(&shard_prefix)) else {
                    continue;
                };
                if !name.contains('/') && belongs_to_shard(shard, name) {
                    visitor(name)?;
                }
            }

            if result.is_truncated.unwrap_or(false) {
                continuation_token = result.next_continuation_token;
            } else {
                break;
            }
        }
        Ok(())
    }
}

impl fmt::Display for S3Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<S3Storage bucket={:?} prefix={:?}>",
            self.opt.bucket,
            self.opt.prefix.as_deref().unwrap_or("")
        )
    }
}

#[async_trait]
impl MeasureMedium for S3Storage {
    async fn stat_measure(&self, tier: u32) -> StorageResult<u64> {
        self.head(&self.full_key(&measure::measure_path(tier))).await
    }

    async fn create_measure(&self, tier: u32) -> StorageResult<BlobWriter> {
        self.writer(self.full_key(&measure::measure_path(tier)))
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn options(&self) -> &dyn StorageOptions {
        &self.opt
    }

    fn set_options(&mut self, opts: Box<dyn StorageOptions>) -> StorageResult<()> {
        self.opt = downcast_options(opts)?;
        self.client = None;
        Ok(())
    }

    async fn init(&mut self, ctx: &InitContext) -> StorageResult<()> {
        if self.opt.bucket.is_empty() {
            return Err(StorageError::Config("S3 bucket is not set".into()));
        }
        self.client = Some(self.build_client().await?);
        if self.opt.pre_gen_measures {
            measure::pregenerate(&*self, &ctx.cancel).await?;
        }
        Ok(())
    }

    async fn size(&self, hash: &str) -> StorageResult<u64> {
        let key = self.blob_key(hash)?;
        self.head(&key).await
    }

    async fn open(&self, hash: &str) -> StorageResult<BlobReader> {
        let key = self.blob_key(hash)?;
        let result = self
            .client()?
            .get_object()
            .bucket(&self.opt.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| sdk_error(e, &key))?;
        Ok(Box::pin(result.body.into_async_read()))
    }

    async fn create(&self, hash: &str) -> StorageResult<BlobWriter> {
        let key = self.blob_key(hash)?;
        self.writer(key)
    }

    async fn remove(&self, hash: &str) -> StorageResult<()> {
        let key = self.blob_key(hash)?;
        match self
            .client()?
            .delete_object()
            .bucket(&self.opt.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match sdk_error(e, &key) {
                StorageError::NotFound(_) => Ok(()),
                e => Err(e),
            },
        }
    }

    async fn walk_dir(&self, visitor: &mut HashVisitor<'_>) -> StorageResult<()> {
        for shard in SHARDS.iter() {
            self.list_shard(shard, visitor).await?;
        }
        Ok(())
    }

    async fn serve_download(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn ResponseSink,
        req: &Parts,
        hash: &str,
        size: u64,
    ) -> StorageResult<u64> {
        let key = self.blob_key(hash)?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        self.redirect(sink, &key).await?;
        Ok(redirect_size(range_header(&req.headers), size))
    }

    async fn serve_measure(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn ResponseSink,
        _req: &Parts,
        tier: u32,
    ) -> StorageResult<()> {
        measure::ensure_measure_file(self, tier, cancel).await?;
        self.redirect(sink, &self.full_key(&measure::measure_path(tier)))
            .await
    }
}
