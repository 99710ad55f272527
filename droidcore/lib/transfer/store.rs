use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use droidutils::BoxedReader;
use tokio::io::AsyncReadExt;

use crate::{config::S3Config, DroidcoreError, DroidcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Size of one multipart upload part. Smaller objects are sent with a single request.
pub const PART_SIZE: usize = 64 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A flat key-value object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `size` bytes read from `reader` under `key`.
    async fn put_object(&self, key: &str, size: u64, reader: BoxedReader) -> DroidcoreResult<()>;

    /// Opens an object for reading. Returns its length when the store reports one.
    async fn get_object(&self, key: &str) -> DroidcoreResult<(Option<u64>, BoxedReader)>;

    /// Whether an object exists.
    async fn head_object(&self, key: &str) -> DroidcoreResult<bool>;

    /// Every key starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> DroidcoreResult<Vec<String>>;

    /// Deletes an object.
    async fn delete_object(&self, key: &str) -> DroidcoreResult<()>;

    /// A human-readable location of `key`, e.g. `s3://bucket/key`.
    fn location(&self, key: &str) -> String;
}

/// An [`ObjectStore`] backed by an S3 bucket.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl S3Store {
    /// Creates a store from the configured bucket and static credentials.
    ///
    /// A custom endpoint switches the client to path-style addressing.
    pub fn new(config: &S3Config) -> DroidcoreResult<Self> {
        let (Some(bucket), Some(access_key), Some(secret_key)) = (
            config.get_bucket(),
            config.get_access_key(),
            config.get_secret_key(),
        ) else {
            return Err(DroidcoreError::NotConfigured("object store".to_string()));
        };

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.get_region().clone()))
            .credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "droidcore",
            ));

        if let Some(endpoint) = config.get_endpoint() {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }

        tracing::info!(bucket = bucket.as_str(), region = config.get_region().as_str(), endpoint = ?config.get_endpoint(), "object store configured");
        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.clone(),
        })
    }

    /// The bucket objects are stored in.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_multipart(&self, key: &str, mut reader: BoxedReader) -> DroidcoreResult<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error("create multipart upload", key, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                DroidcoreError::ObjectStore(format!("no upload id returned for {key}"))
            })?
            .to_string();

        match self.upload_parts(key, &upload_id, &mut reader).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| store_error("complete multipart upload", key, e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(key, error = %DisplayErrorContext(&abort), "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut BoxedReader,
    ) -> DroidcoreResult<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut part_number = 1;
        loop {
            let chunk = read_chunk(reader, PART_SIZE).await?;
            if chunk.is_empty() {
                break;
            }

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| store_error("upload part", key, e))?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            tracing::debug!(key, part_number, "uploaded part");
            part_number += 1;
        }

        Ok(parts)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads up to `limit` bytes, stopping early only at end of input.
async fn read_chunk(reader: &mut BoxedReader, limit: usize) -> DroidcoreResult<Vec<u8>> {
    let mut chunk = Vec::with_capacity(limit.min(8 * 1024 * 1024));
    reader.take(limit as u64).read_to_end(&mut chunk).await?;
    Ok(chunk)
}

fn store_error<E>(action: &str, key: &str, error: E) -> DroidcoreError
where
    E: std::error::Error,
{
    DroidcoreError::ObjectStore(format!("{action} {key}: {}", DisplayErrorContext(&error)))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(&self, key: &str, size: u64, mut reader: BoxedReader) -> DroidcoreResult<()> {
        if size >= PART_SIZE as u64 {
            return self.put_multipart(key, reader).await;
        }

        let body = read_chunk(&mut reader, PART_SIZE).await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(body.len() as i64)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| store_error("put", key, e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> DroidcoreResult<(Option<u64>, BoxedReader)> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error("get", key, e))?;

        let size = output
            .content_length()
            .and_then(|length| u64::try_from(length).ok());
        Ok((size, Box::pin(output.body.into_async_read())))
    }

    async fn head_object(&self, key: &str) -> DroidcoreResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(e) => Err(store_error("head", key, e)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> DroidcoreResult<Vec<String>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| store_error("list", prefix, e))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
        }

        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> DroidcoreResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error("delete", key, e))?;
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
