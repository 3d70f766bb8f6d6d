//! S3-compatible backend via aws-sdk-s3: one object per block, with basic
//! retry/backoff and Content-MD5 integrity on uploads.

use crate::backend::ObjectBackend;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use bytes::Bytes;
use log::warn;
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone)]
pub struct S3Config {
    /// Maximum retry attempts per request.
    pub max_retries: u32,
    /// Initial retry delay; doubled on each attempt.
    pub initial_retry_delay_ms: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_retry_delay_ms: 100,
        }
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    config: S3Config,
}

impl S3Backend {
    /// Connect using the ambient AWS configuration (environment credentials,
    /// region and endpoint resolution).
    pub async fn new(bucket: impl Into<String>, config: S3Config) -> Self {
        let conf = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: Client::new(&conf),
            bucket: bucket.into(),
            config,
        }
    }

    pub fn with_client(client: Client, bucket: impl Into<String>, config: S3Config) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            config,
        }
    }

    fn block_key(location: &str, block_index: u64) -> String {
        format!("blocks/{location}/{block_index}")
    }

    fn md5_base64(data: &[u8]) -> String {
        B64.encode(md5::compute(data).0)
    }

    async fn execute_with_retry<T, F, Fut, E>(
        &self,
        operation: F,
        operation_name: &'static str,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt > self.config.max_retries {
                        return Err(StoreError::BackendUnavailable(format!(
                            "{operation_name} failed after {} attempts: {e}",
                            self.config.max_retries
                        )));
                    }
                    warn!("{operation_name} attempt {attempt} failed: {e}");
                    let delay_ms = self.config.initial_retry_delay_ms * 2u64.pow(attempt - 1);
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    async fn list_block_keys(&self, location: &str) -> Result<Vec<String>> {
        let prefix = format!("blocks/{location}/");
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let token = continuation.clone();
            let resp = self
                .execute_with_retry(
                    || async {
                        self.client
                            .list_objects_v2()
                            .bucket(&self.bucket)
                            .prefix(&prefix)
                            .set_continuation_token(token.clone())
                            .send()
                            .await
                    },
                    "list_objects",
                )
                .await?;
            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }
            match resp.next_continuation_token() {
                Some(next) => continuation = Some(next.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.execute_with_retry(
                || async {
                    self.client
                        .delete_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .send()
                        .await
                },
                "delete_object",
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn fetch_block(
        &self,
        location: &str,
        block_index: u64,
        _block_size: u32,
    ) -> Result<Option<Bytes>> {
        let key = Self::block_key(location, block_index);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;
        match resp {
            Ok(out) => {
                let data = out
                    .body
                    .collect()
                    .await
                    .map_err(|e| StoreError::BackendUnavailable(format!("read body: {e}")))?;
                Ok(Some(data.into_bytes()))
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(StoreError::BackendUnavailable(format!(
                        "get {key}: {err}"
                    )))
                }
            }
        }
    }

    async fn write_blocks(&self, location: &str, blocks: &[(u64, Bytes)]) -> Result<usize> {
        // Blocks never exceed the configured block size, so a plain put with
        // Content-MD5 is enough; no multipart path needed.
        let mut acked = 0;
        for (index, data) in blocks {
            let key = Self::block_key(location, *index);
            let checksum = Self::md5_base64(data);
            let result = self
                .execute_with_retry(
                    || async {
                        self.client
                            .put_object()
                            .bucket(&self.bucket)
                            .key(&key)
                            .content_md5(checksum.clone())
                            .body(data.clone().into())
                            .send()
                            .await
                    },
                    "put_block",
                )
                .await;
            match result {
                Ok(_) => acked += 1,
                Err(e) if acked > 0 => {
                    warn!("block write to {key} failed after {acked} acks: {e}");
                    return Ok(acked);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(acked)
    }

    async fn remove_blocks_from(&self, location: &str, from_index: u64) -> Result<()> {
        let prefix = format!("blocks/{location}/");
        let keys: Vec<String> = self
            .list_block_keys(location)
            .await?
            .into_iter()
            .filter(|key| {
                key.strip_prefix(&prefix)
                    .and_then(|s| s.parse::<u64>().ok())
                    .is_some_and(|index| index >= from_index)
            })
            .collect();
        self.delete_keys(&keys).await
    }

    async fn delete_object(&self, location: &str) -> Result<()> {
        let keys = self.list_block_keys(location).await?;
        self.delete_keys(&keys).await
    }
}
