use crate::backend::{Backend, BackendType, BatchOutcome, HealthStatus};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use blobkeep_core::{Error, Result, StorageKey};
use bytes::Bytes;
use futures::FutureExt;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint for S3-compatible stores (MinIO, Ceph, ...).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub path_style: bool,
}

pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: String,
    concurrency: usize,
}

impl S3Backend {
    pub async fn new(name: impl Into<String>, config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(Error::InvalidInput("S3 backend requires a bucket".to_string()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        builder = builder.force_path_style(config.path_style);

        Ok(Self {
            name: name.into(),
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
            prefix: config.prefix.trim_matches('/').to_string(),
            concurrency: DEFAULT_CONCURRENCY,
        })
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn full_key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)
                .and_then(|k| k.strip_prefix('/'))
                .unwrap_or(key)
        }
    }

    /// Timeouts, dispatch failures, 5xx and throttling are transient; other
    /// service errors (auth, quota, bad request) are permanent.
    fn classify<E>(&self, action: &str, key: &StorageKey, err: SdkError<E, HttpResponse>) -> Error
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let throttled = matches!(
            err.code(),
            Some("SlowDown" | "Throttling" | "ThrottlingException" | "RequestTimeout" | "InternalError")
        );
        let message = format!("{action} {}: {}", key.short_string(), DisplayErrorContext(&err));

        let transient = match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
            SdkError::ServiceError(service) => {
                let status = service.raw().status().as_u16();
                throttled || status == 429 || status >= 500
            }
            _ => false,
        };

        if transient {
            Error::transient(&self.name, message)
        } else {
            Error::permanent(&self.name, message)
        }
    }

    async fn put(&self, key: StorageKey, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(&key.to_hex()))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| self.classify("put", &key, e))?;
        Ok(())
    }

    async fn get(&self, key: StorageKey) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(&key.to_hex()))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    Error::NotFound(format!("{} on backend {}", key.to_hex(), self.name))
                } else {
                    self.classify("get", &key, e)
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Error::transient(&self.name, format!("read body of {}: {e}", key.short_string())))?;
        Ok(data.into_bytes())
    }

    async fn delete_one(&self, key: StorageKey) -> (StorageKey, bool) {
        let result = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(&key.to_hex()))
            .send()
            .await;
        match result {
            Ok(_) => (key, true),
            Err(e) => {
                warn!(
                    backend = %self.name,
                    storage_key = %key.short_string(),
                    error = %DisplayErrorContext(&e),
                    "Delete failed"
                );
                (key, false)
            }
        }
    }
}

#[async_trait]
impl Backend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> BackendType {
        BackendType::S3
    }

    async fn store(&self, items: Vec<(StorageKey, Bytes)>) -> Result<BatchOutcome<()>> {
        let outcome: BatchOutcome<()> = stream::iter(items)
            .map(|(key, data)| async move { (key, self.put(key, data).await) }.boxed())
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for (key, result) in &outcome {
            if let Err(e) = result {
                warn!(backend = %self.name, storage_key = %key.short_string(), error = %e, "Store failed");
            }
        }
        Ok(outcome)
    }

    async fn retrieve(&self, keys: &[StorageKey]) -> Result<BatchOutcome<Bytes>> {
        Ok(stream::iter(keys.iter().copied())
            .map(|key| async move { (key, self.get(key).await) }.boxed())
            .buffer_unordered(self.concurrency)
            .collect()
            .await)
    }

    async fn delete(&self, keys: &[StorageKey]) -> Result<HashMap<StorageKey, bool>> {
        Ok(stream::iter(keys.iter().copied())
            .map(|key| self.delete_one(key).boxed())
            .buffer_unordered(self.concurrency)
            .collect()
            .await)
    }

    async fn health_check(&self) -> HealthStatus {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unavailable(format!("bucket {}: {}", self.bucket, DisplayErrorContext(&e))),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<StorageKey>> {
        let full_prefix = self.full_key(prefix.unwrap_or(""));
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(&full_prefix);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| {
                Error::transient(&self.name, format!("list {full_prefix}: {}", DisplayErrorContext(&e)))
            })?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                match self.strip_prefix(key).parse::<StorageKey>() {
                    Ok(parsed) => keys.push(parsed),
                    Err(_) => debug!(backend = %self.name, key, "Skipping foreign object"),
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        keys.sort();
        Ok(keys)
    }
}
