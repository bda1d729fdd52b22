//! S3-compatible object-store backend.
//!
//! A [`S3Session`] owns one SDK client and a private tokio runtime. Sessions
//! are expensive, so the registry caches them per credential pair and
//! builds lightweight per-bucket [`S3Backend`]s on top.

use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use tokio::runtime::Runtime;

use super::{CredentialSource, StorageBackend};
use crate::error::{Error, Result};

/// A connected S3 client plus the runtime that drives it.
pub struct S3Session {
    client: Client,
    runtime: Runtime,
}

impl std::fmt::Debug for S3Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Session").finish_non_exhaustive()
    }
}

impl S3Session {
    /// Connects a client for `region`, optionally against a custom endpoint
    /// (MinIO, Ceph and other S3-compatible stores).
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be created.
    pub fn connect(
        region: &str,
        endpoint: Option<&str>,
        credentials: &CredentialSource,
    ) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|e| Error::storage(format!("Failed to create runtime: {e}")))?;

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        match credentials {
            CredentialSource::Environment => {}
            CredentialSource::Static {
                access_key,
                secret_key,
            } => {
                let creds = Credentials::new(access_key, secret_key, None, None, "parcela");
                loader = loader.credentials_provider(creds);
            }
            CredentialSource::Anonymous => {
                loader = loader.no_credentials();
            }
        }

        let sdk_config = runtime.block_on(loader.load());
        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(url) = endpoint {
            s3_config = s3_config.endpoint_url(url).force_path_style(true);
        }

        tracing::debug!(region, endpoint, "connected S3 session");
        Ok(Arc::new(Self {
            client: Client::from_conf(s3_config.build()),
            runtime,
        }))
    }
}

/// A bucket on a shared [`S3Session`].
#[derive(Debug, Clone)]
pub struct S3Backend {
    session: Arc<S3Session>,
    bucket: String,
}

impl S3Backend {
    /// Creates a backend for `bucket` on an existing session.
    pub fn new(session: Arc<S3Session>, bucket: impl Into<String>) -> Self {
        Self {
            session,
            bucket: bucket.into(),
        }
    }

    /// Returns the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.session.runtime.block_on(future)
    }

    fn client(&self) -> &Client {
        &self.session.client
    }
}

impl StorageBackend for S3Backend {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.block_on(async {
            let mut keys = Vec::new();
            let mut pages = self
                .client()
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .into_paginator()
                .send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| {
                    Error::storage(format!("S3 list error for '{}/{prefix}': {e}", self.bucket))
                })?;
                keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));
            }

            keys.sort();
            Ok(keys)
        })
    }

    fn get(&self, key: &str) -> Result<Bytes> {
        self.block_on(async {
            let response = self
                .client()
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Error::storage(format!("S3 get error for '{key}': {e}")))?;

            let body = response
                .body
                .collect()
                .await
                .map_err(|e| Error::storage(format!("S3 body read error for '{key}': {e}")))?;
            Ok(body.into_bytes())
        })
    }

    fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.block_on(async {
            self.client()
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Error::storage(format!("S3 put error for '{key}': {e}")))?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.block_on(async {
            self.client()
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Error::storage(format!("S3 delete error for '{key}': {e}")))?;
            Ok(())
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.block_on(async {
            match self
                .client()
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    let service_error = e.into_service_error();
                    if service_error.is_not_found() {
                        Ok(false)
                    } else {
                        Err(Error::storage(format!(
                            "S3 head error for '{key}': {service_error}"
                        )))
                    }
                }
            }
        })
    }

    fn size(&self, key: &str) -> Result<u64> {
        self.block_on(async {
            let response = self
                .client()
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Error::storage(format!("S3 head error for '{key}': {e}")))?;
            Ok(response
                .content_length()
                .and_then(|l| u64::try_from(l).ok())
                .unwrap_or(0))
        })
    }
}
