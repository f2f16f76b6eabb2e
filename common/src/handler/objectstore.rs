//! Flat object stores (S3, GCS, Azure) reached through the `object_store` crate.
//!
//! A handler is bound to one bucket. The first path segment names the bucket, the rest is the
//! key prefix; keys use `/` as the only delimiter.
//!
//! Presigned urls come from the store's [`Signer`]. Azure destinations can also copy by url
//! ("Put Blob From URL"): the target is signed for writing and the service pulls the source
//! itself.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::ObjectStore;
use object_store::path::Path as StorePath;
use object_store::signer::Signer;
use reqwest::Method;
use tracing::instrument;

use super::{Capabilities, Capability, Handler, Snapshot, send_page, unsupported};
use crate::cache::{self, CacheConfig};
use crate::error::{Result, StorageError};
use crate::namespace::{self, Entry, Location};
use crate::tree::{Blob, ContainerId, Origin, Tree};

/// Payloads above this size are written as a multipart upload.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Lifetime of the write url handed to the destination service for one copy.
const TARGET_URL_TTL: Duration = Duration::from_secs(15 * 60);

const AZURE_API_VERSION: &str = "2021-08-06";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    S3,
    Gcs,
    Azure,
}

impl StoreKind {
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        match self {
            StoreKind::S3 => "s3",
            StoreKind::Gcs => "gs",
            StoreKind::Azure => "az",
        }
    }
}

/// Everything needed to build a store client.
///
/// Credentials come from the environment; `options` override them with backend config keys such
/// as `aws_access_key_id` or `azure_storage_account_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSpec {
    pub kind: StoreKind,
    pub bucket: String,
    /// Storage account, Azure only.
    pub account: Option<String>,
    /// Talk to the local Azure storage emulator.
    pub emulator: bool,
    pub options: Vec<(String, String)>,
}

impl StoreSpec {
    #[must_use]
    pub fn new(kind: StoreKind, bucket: &str) -> Self {
        Self {
            kind,
            bucket: bucket.to_string(),
            account: None,
            emulator: false,
            options: Vec::new(),
        }
    }
}

fn option_error(key: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::AuthFailure(format!("bad store option {key:?}: {err}"))
}

/// A store client together with the signer for its urls.
struct BuiltStore {
    store: Arc<dyn ObjectStore>,
    signer: Arc<dyn Signer>,
}

impl BuiltStore {
    fn new<T: ObjectStore + Signer>(store: T) -> Self {
        let store = Arc::new(store);
        Self {
            store: store.clone(),
            signer: store,
        }
    }
}

fn build_store(spec: &StoreSpec) -> Result<BuiltStore> {
    let built: object_store::Result<BuiltStore> = match spec.kind {
        StoreKind::S3 => {
            let mut builder =
                object_store::aws::AmazonS3Builder::from_env().with_bucket_name(&spec.bucket);
            for (key, value) in &spec.options {
                let config_key: object_store::aws::AmazonS3ConfigKey =
                    key.parse().map_err(|err| option_error(key, err))?;
                builder = builder.with_config(config_key, value);
            }
            builder.build().map(BuiltStore::new)
        }
        StoreKind::Gcs => {
            let mut builder = object_store::gcp::GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(&spec.bucket);
            for (key, value) in &spec.options {
                let config_key: object_store::gcp::GoogleConfigKey =
                    key.parse().map_err(|err| option_error(key, err))?;
                builder = builder.with_config(config_key, value);
            }
            builder.build().map(BuiltStore::new)
        }
        StoreKind::Azure => {
            let mut builder = object_store::azure::MicrosoftAzureBuilder::from_env()
                .with_container_name(&spec.bucket)
                .with_use_emulator(spec.emulator);
            if let Some(account) = &spec.account {
                builder = builder.with_account(account);
            }
            for (key, value) in &spec.options {
                let config_key: object_store::azure::AzureConfigKey =
                    key.parse().map_err(|err| option_error(key, err))?;
                builder = builder.with_config(config_key, value);
            }
            builder.build().map(BuiltStore::new)
        }
    };
    built.map_err(|err| StorageError::AuthFailure(format!("{err}")))
}

fn store_error(object: &str, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(object.to_string()),
        err => StorageError::transfer(object, err),
    }
}

/// Url without its query string, which carries the signature.
fn redacted(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

/// Makes the store behind a signed target url fetch `source_url` by itself.
#[async_trait::async_trait]
pub trait UrlCopier: Send + Sync {
    async fn copy(&self, target_url: &str, source_url: &str) -> Result<()>;
}

/// Azure "Put Blob From URL". The source must be readable without credentials, e.g. a
/// presigned url from any store.
pub struct AzurePutFromUrl {
    client: reqwest::Client,
}

impl AzurePutFromUrl {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| StorageError::transfer("azure http client", err))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl UrlCopier for AzurePutFromUrl {
    #[instrument(skip_all, fields(target = %redacted(target_url)))]
    async fn copy(&self, target_url: &str, source_url: &str) -> Result<()> {
        let target = redacted(target_url);
        let response = self
            .client
            .put(target_url)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-copy-source", source_url)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|err| StorageError::transfer(target, err.without_url()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        tracing::debug!("put blob from url returned {}: {}", status, body);
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(StorageError::NotFound(target.to_string()))
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Err(StorageError::AuthFailure(format!(
                "{status} copying into {target}"
            )))
        } else {
            Err(StorageError::transfer(
                target,
                anyhow::anyhow!("service replied {status}"),
            ))
        }
    }
}

pub struct ObjectStoreHandler {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    /// Base url of the bucket, without a trailing delimiter.
    url: String,
    page_size: usize,
    part_size: usize,
    signer: Option<Arc<dyn Signer>>,
    copier: Option<Arc<dyn UrlCopier>>,
}

impl ObjectStoreHandler {
    pub fn new(bucket: &str, url: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            url: url.trim_end_matches('/').to_string(),
            page_size: super::DEFAULT_PAGE_SIZE,
            part_size: DEFAULT_PART_SIZE,
            signer: None,
            copier: None,
        }
    }

    /// Azure buckets get server-side copy; every store can presign.
    pub fn from_spec(spec: &StoreSpec) -> Result<Self> {
        let built = build_store(spec)?;
        let url = format!("{}://{}", spec.kind.scheme(), spec.bucket);
        let handler = Self::new(&spec.bucket, &url, built.store).with_signer(built.signer);
        match spec.kind {
            StoreKind::Azure => Ok(handler.with_url_copier(Arc::new(AzurePutFromUrl::new()?))),
            StoreKind::S3 | StoreKind::Gcs => Ok(handler),
        }
    }

    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Enables server-side copy; needs a signer for the write urls.
    #[must_use]
    pub fn with_url_copier(mut self, copier: Arc<dyn UrlCopier>) -> Self {
        self.copier = Some(copier);
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    fn check_bucket(&self, collection: &str) -> Result<()> {
        if collection == self.bucket {
            Ok(())
        } else {
            Err(StorageError::NotFound(format!("bucket {collection}")))
        }
    }

    fn blob_url(&self, key: &str) -> String {
        format!("{}/{}", self.url, key)
    }

    async fn signed_url(&self, method: Method, key: &str, ttl: Duration) -> Result<String> {
        let capability = if method == Method::GET {
            Capability::Presign
        } else {
            Capability::ServerSideCopy
        };
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| unsupported(self.origin(), capability))?;
        let url = signer
            .signed_url(method, &StorePath::from(key), ttl)
            .await
            .map_err(|err| store_error(key, err))?;
        Ok(url.to_string())
    }

    async fn put_multipart(&self, key: &str, blob: &Blob) -> Result<u64> {
        let path = StorePath::from(key);
        let upload = self
            .store
            .put_multipart(&path)
            .await
            .map_err(|err| store_error(key, err))?;
        let mut writer = object_store::WriteMultipart::new_with_chunk_size(upload, self.part_size);
        let mut reader = cache::open_payload(blob).await?;
        let mut size = 0u64;
        loop {
            let chunk = match cache::read_chunk(&mut reader, self.part_size).await {
                Ok(chunk) => chunk,
                Err(err) => {
                    if let Err(abort) = writer.abort().await {
                        tracing::warn!("failed aborting upload of {}: {}", key, abort);
                    }
                    return Err(StorageError::transfer(key, err));
                }
            };
            if chunk.is_empty() {
                break;
            }
            size += chunk.len() as u64;
            writer.put(chunk);
        }
        writer.finish().await.map_err(|err| store_error(key, err))?;
        Ok(size)
    }
}

#[async_trait::async_trait]
impl Handler for ObjectStoreHandler {
    fn origin(&self) -> Origin {
        Origin::ObjectStore
    }

    fn capabilities(&self) -> Capabilities {
        let capabilities = Capabilities::TRANSFER.with(Capability::EnumerateRoot);
        match (&self.signer, &self.copier) {
            (Some(_), Some(_)) => capabilities
                .with(Capability::Presign)
                .with(Capability::ServerSideCopy),
            (Some(_), None) => capabilities.with(Capability::Presign),
            (None, _) => capabilities,
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(vec![self.bucket.clone()])
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        // buckets are provisioned outside of the data plane
        if name == self.bucket {
            Ok(())
        } else {
            Err(unsupported(self.origin(), Capability::CreateCollection))
        }
    }

    #[instrument(skip(self))]
    async fn resolve_container(&self, path: &str) -> Result<(Tree, ContainerId)> {
        let (collection, prefix) = namespace::split_container_path(path, self.delimiter())?;
        self.check_bucket(&collection)?;
        let mut tree = Tree::new(Origin::ObjectStore, &collection, &self.url);
        let root = tree.root();
        let target = namespace::ensure_dir(&mut tree, root, &prefix, self.delimiter());
        Ok((tree, target))
    }

    #[instrument(skip(self))]
    async fn resolve_blob(&self, path: &str) -> Result<Blob> {
        let (collection, key) = namespace::split_blob_path(path, self.delimiter())?;
        self.check_bucket(&collection)?;
        let meta = self
            .store
            .head(&StorePath::from(key.as_str()))
            .await
            .map_err(|err| store_error(path, err))?;
        let size = u64::try_from(meta.size).map_err(|err| StorageError::transfer(path, err))?;
        Ok(Blob::new(Origin::ObjectStore, &collection, &key, self.delimiter())
            .with_url(self.blob_url(&key))
            .with_size(Some(size)))
    }

    #[instrument(skip(self, tree, out))]
    async fn list_children_streamed(
        &self,
        tree: Tree,
        target: ContainerId,
        out: async_channel::Sender<Snapshot>,
    ) -> Result<()> {
        let location = namespace::decompose(&tree, target, self.delimiter());
        let prefix = (!location.prefix.is_empty())
            .then(|| StorePath::from(location.prefix.as_str()));
        let mut pages = self.store.list(prefix.as_ref()).chunks(self.page_size);
        loop {
            throttle::get_request_token().await;
            let Some(items) = pages.next().await else {
                return Ok(());
            };
            let (mut snapshot, snapshot_target) = tree.snapshot(target);
            for item in items {
                let meta = item.map_err(|err| store_error(&location.prefix, err))?;
                let key = meta.location.to_string();
                let size = u64::try_from(meta.size).ok();
                let entry = Entry {
                    url: self.blob_url(&key),
                    key,
                    size,
                };
                namespace::reconstruct(&mut snapshot, snapshot_target, entry, self.delimiter());
            }
            snapshot.mark_populated(snapshot_target);
            send_page(&out, snapshot, snapshot_target).await?;
        }
    }

    #[instrument(skip(self, blob, cache), fields(key = %blob.cloud_name))]
    async fn read(&self, blob: &mut Blob, cache: &CacheConfig) -> Result<u64> {
        let result = self
            .store
            .get(&StorePath::from(blob.cloud_name.as_str()))
            .await
            .map_err(|err| store_error(&blob.cloud_name, err))?;
        let stream = result.into_stream().map_err(std::io::Error::other);
        let reader = tokio_util::io::StreamReader::new(stream);
        cache::fill(blob, Box::new(reader), cache).await
    }

    #[instrument(skip(self, blob), fields(name = %blob.dest_name))]
    async fn write(&self, destination: &Location, blob: &Blob) -> Result<u64> {
        self.check_bucket(&destination.collection)?;
        let key = destination.key(&blob.dest_name);
        let size = cache::payload_len(blob).await?;
        if size > self.part_size as u64 {
            return self.put_multipart(&key, blob).await;
        }
        let data: Bytes = cache::payload_bytes(blob).await?;
        self.store
            .put(&StorePath::from(key.as_str()), data.into())
            .await
            .map_err(|err| store_error(&key, err))?;
        Ok(size)
    }

    async fn exists(&self, destination: &Location, name: &str) -> Result<bool> {
        let key = destination.key(name);
        match self.store.head(&StorePath::from(key.as_str())).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(store_error(&key, err)),
        }
    }

    #[instrument(skip(self, blob), fields(key = %blob.cloud_name))]
    async fn presign(&self, blob: &Blob, ttl: Duration) -> Result<String> {
        self.check_bucket(&blob.collection)?;
        self.signed_url(Method::GET, &blob.cloud_name, ttl).await
    }

    #[instrument(skip(self, source_url))]
    async fn copy_from_url(
        &self,
        destination: &Location,
        name: &str,
        source_url: &str,
    ) -> Result<()> {
        self.check_bucket(&destination.collection)?;
        let copier = self
            .copier
            .as_ref()
            .ok_or_else(|| unsupported(self.origin(), Capability::ServerSideCopy))?;
        let key = destination.key(name);
        let target = self.signed_url(Method::PUT, &key, TARGET_URL_TTL).await?;
        copier.copy(&target, source_url).await
    }
}
