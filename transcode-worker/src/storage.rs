//! Object-store access for source media and transcoded outputs. Uploads
//! are last-writer-wins at a key, which is safe here because output
//! locators are deterministic per (job, rendition).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;

fn operation_failed(command: &str, key: &str, message: impl ToString) -> StorageError {
    StorageError::OperationFailed {
        command: command.to_owned(),
        key: key.to_owned(),
        message: message.to_string(),
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(
        &self,
        key: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>;

    async fn upload(
        &self,
        src: &Path,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(bucket: String, endpoint_url: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;

        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket,
        }
    }

    pub fn from_client(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn download(
        &self,
        key: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let transfer = async {
            let object = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    let message = format!("failed to get object: {e}");
                    if let GetObjectError::NoSuchKey(_) = e.into_service_error() {
                        StorageError::NotFound(key.to_owned())
                    } else {
                        operation_failed("GetObject", key, message)
                    }
                })?;

            let mut file = tokio::fs::File::create(dest).await?;
            let mut body = object.body.into_async_read();
            tokio::io::copy(&mut body, &mut file).await?;
            file.flush().await?;

            Ok(())
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            result = transfer => result,
        }
    }

    async fn upload(
        &self,
        src: &Path,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let transfer = async {
            let body = ByteStream::from_path(src)
                .await
                .map_err(|e| operation_failed("PutObject", key, e))?;

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|e| operation_failed("PutObject", key, e))?;

            Ok(())
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            result = transfer => result,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = format!("failed to head object: {e}");
                if e.into_service_error().is_not_found() {
                    Ok(false)
                } else {
                    Err(operation_failed("HeadObject", key, message))
                }
            }
        }
    }
}

/// In-memory object store for tests.
#[derive(Clone, Default)]
pub struct MockObjectStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, bytes: &[u8]) {
        self.lock().insert(key.to_owned(), bytes.to_vec());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().expect("poisoned MockObjectStore mutex")
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn download(
        &self,
        key: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let bytes = self
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_owned()))?;
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }

    async fn upload(
        &self,
        src: &Path,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let bytes = tokio::fs::read(src).await?;
        self.lock().insert(key.to_owned(), bytes);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.lock().contains_key(key))
    }
}
