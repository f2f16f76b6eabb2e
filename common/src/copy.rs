//! Copy engine.
//!
//! A [`CopyJob`] resolves both ends, streams the source listing page by page, flattens every page
//! into work items and drains them with a fixed pool of workers. Listing, flattening and transfers
//! run at the same time; both queues between them are bounded.
//!
//! Per-blob failures are recorded in the [`Summary`] and the workers move on. Only validation
//! errors, listing errors and cancellation end a job early.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::cache::{self, CacheConfig};
use crate::error::{ErrorKind, StorageError};
use crate::handler::{Capability, Handler, Snapshot, unsupported};
use crate::namespace::{self, Location};
use crate::progress::Progress;
use crate::tree::{Blob, ContainerId, Tree};

pub const MAX_WORKERS: usize = 1000;
pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(60 * 60);

/// Error type for copy jobs that preserves the summary of what was done before the failure.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct Error {
    #[source]
    pub source: StorageError,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: StorageError, summary: Summary) -> Self {
        Error { source, summary }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Read every blob through this process and write it to the destination.
    #[default]
    LocalRelay,
    /// Presign the source blob and let the destination fetch it.
    ServerSideCopy,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Overwrite blobs already present at the destination.
    pub replace: bool,
    pub strategy: Strategy,
    pub workers: usize,
    /// Capacity of both the page queue and the work queue.
    pub queue_capacity: usize,
    /// Cancel the job on the first failed blob.
    pub fail_early: bool,
    pub timeout: Option<Duration>,
    pub presign_ttl: Duration,
    pub cache: CacheConfig,
    /// Chunk size used for chunk throttling, 0 disables it.
    pub chunk_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            replace: true,
            strategy: Strategy::default(),
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            fail_early: false,
            timeout: None,
            presign_ttl: DEFAULT_PRESIGN_TTL,
            cache: CacheConfig::default(),
            chunk_size: 0,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(StorageError::InvalidSettings(format!(
                "worker count must be between 1 and {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.queue_capacity == 0 {
            return Err(StorageError::InvalidSettings(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a [`CopyJob`], published on a watch channel.
///
/// Stages overlap at runtime; a stage is entered once everything upstream of it has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Resolving,
    /// The source listing is in progress.
    Enumerating,
    /// Listing finished, remaining pages are being flattened.
    Flattening,
    /// Every work item has been queued.
    Draining,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Failure {
    /// `collection/key` of the source blob.
    pub blob: String,
    pub dest_name: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    fn new(blob: &Blob, error: &StorageError) -> Self {
        Self {
            blob: format!("{}/{}", blob.collection, blob.cloud_name),
            dest_name: blob.dest_name.clone(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes_copied: u64,
    pub blobs_attempted: usize,
    pub blobs_copied: usize,
    pub blobs_skipped: usize,
    pub blobs_failed: usize,
    pub failures: Vec<Failure>,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(mut self, other: Self) -> Self {
        self.failures.extend(other.failures);
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            blobs_attempted: self.blobs_attempted + other.blobs_attempted,
            blobs_copied: self.blobs_copied + other.blobs_copied,
            blobs_skipped: self.blobs_skipped + other.blobs_skipped,
            blobs_failed: self.blobs_failed + other.blobs_failed,
            failures: self.failures,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            blobs attempted: {}\n\
            blobs copied: {}\n\
            blobs skipped: {}\n\
            blobs failed: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.blobs_attempted,
            self.blobs_copied,
            self.blobs_skipped,
            self.blobs_failed,
        )?;
        if !self.failures.is_empty() {
            write!(f, "\nfailures:")?;
            for failure in &self.failures {
                write!(
                    f,
                    "\n  {} -> {}: {}: {}",
                    failure.blob, failure.dest_name, failure.kind, failure.message
                )?;
            }
        }
        Ok(())
    }
}

/// Every blob under `from` with its `dest_name` set to the path relative to `from`.
///
/// Blobs of a container come before anything in its child containers.
#[must_use]
pub fn flatten(tree: &Tree, from: ContainerId, delimiter: char) -> Vec<Blob> {
    let mut items = Vec::new();
    let mut stack = vec![(from, String::new())];
    while let Some((id, prefix)) = stack.pop() {
        for blob in tree[id].blobs() {
            let mut item = blob.clone();
            item.dest_name = format!("{prefix}{}", blob.name);
            items.push(item);
        }
        for child in tree[id].children().iter().rev() {
            stack.push((*child, format!("{prefix}{}{delimiter}", tree[*child].name)));
        }
    }
    items
}

enum Outcome {
    Copied(u64),
    Skipped,
}

/// Moves single blobs into one destination container.
struct Transfer {
    source: Arc<dyn Handler>,
    destination: Arc<dyn Handler>,
    location: Location,
    settings: Settings,
    progress: Arc<Progress>,
}

impl Transfer {
    async fn run(&self, mut blob: Blob) -> Summary {
        let _ops_guard = self.progress.ops.guard();
        let mut summary = Summary {
            blobs_attempted: 1,
            ..Default::default()
        };
        match self.transfer(&mut blob).await {
            Ok(Outcome::Copied(bytes)) => {
                self.progress.blobs_copied.inc();
                self.progress.bytes_copied.add(bytes);
                summary.blobs_copied = 1;
                summary.bytes_copied = bytes;
            }
            Ok(Outcome::Skipped) => {
                tracing::info!("{:?} already exists, skipping", &blob.dest_name);
                self.progress.blobs_skipped.inc();
                summary.blobs_skipped = 1;
            }
            Err(error) => {
                tracing::error!(
                    "failed copying {}/{} ({}): {}",
                    &blob.collection,
                    &blob.cloud_name,
                    error.kind(),
                    &error
                );
                self.progress.blobs_failed.inc();
                summary.blobs_failed = 1;
                summary.failures.push(Failure::new(&blob, &error));
            }
        }
        summary
    }

    /// Counts a blob whose transfer was dropped on cancellation as failed.
    fn abandoned(&self, failure: Failure) -> Summary {
        self.progress.blobs_failed.inc();
        Summary {
            blobs_attempted: 1,
            blobs_failed: 1,
            failures: vec![failure],
            ..Default::default()
        }
    }

    #[instrument(skip(self, blob), fields(key = %blob.cloud_name, dest = %blob.dest_name))]
    async fn transfer(&self, blob: &mut Blob) -> Result<Outcome, StorageError> {
        if !self.settings.replace {
            throttle::get_request_token().await;
            if self
                .destination
                .exists(&self.location, &blob.dest_name)
                .await?
            {
                return Ok(Outcome::Skipped);
            }
        }
        match self.settings.strategy {
            Strategy::ServerSideCopy => {
                throttle::get_request_token().await;
                let url = self.source.presign(blob, self.settings.presign_ttl).await?;
                self.destination
                    .copy_from_url(&self.location, &blob.dest_name, &url)
                    .await?;
                Ok(Outcome::Copied(blob.size.unwrap_or_default()))
            }
            Strategy::LocalRelay => {
                let _cache_guard = if self.settings.cache.to_disk {
                    Some(throttle::cache_file_permit().await)
                } else {
                    None
                };
                throttle::get_request_token().await;
                let relayed = self.relay(blob).await;
                // payload is dropped on success and on failure alike
                let released = cache::release(blob).await;
                let written = relayed?;
                if let Err(error) = released {
                    tracing::warn!("failed removing cached payload: {}", &error);
                }
                Ok(Outcome::Copied(written))
            }
        }
    }

    async fn relay(&self, blob: &mut Blob) -> Result<u64, StorageError> {
        let size = self.source.read(blob, &self.settings.cache).await?;
        throttle::get_chunk_tokens(self.settings.chunk_size, size).await;
        self.destination.write(&self.location, blob).await
    }
}

/// Pulls work items until the queue closes or the job is cancelled.
async fn drain(
    transfer: Arc<Transfer>,
    work: async_channel::Receiver<Blob>,
    cancel: CancellationToken,
    fail_early: bool,
) -> Summary {
    let mut summary = Summary::default();
    loop {
        let blob = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = work.recv() => match next {
                Ok(blob) => blob,
                Err(_) => break,
            },
        };
        let abandoned = Failure::new(&blob, &StorageError::Cancelled);
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                summary = summary + transfer.abandoned(abandoned);
                break;
            }
            outcome = transfer.run(blob) => outcome,
        };
        if fail_early && outcome.blobs_failed > 0 {
            tracing::error!("a blob failed and --fail-early is set, cancelling the copy");
            cancel.cancel();
        }
        summary = summary + outcome;
    }
    summary
}

/// Turns listing pages into work items.
async fn flatten_pages(
    pages: async_channel::Receiver<Snapshot>,
    work: async_channel::Sender<Blob>,
    delimiter: char,
    progress: Arc<Progress>,
    cancel: CancellationToken,
) {
    loop {
        let page = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            page = pages.recv() => match page {
                Ok(page) => page,
                Err(_) => return,
            },
        };
        progress.pages_listed.inc();
        for blob in flatten(&page.tree, page.target, delimiter) {
            progress.blobs_enumerated.inc();
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                sent = work.send(blob) => sent,
            };
            if sent.is_err() {
                return;
            }
        }
    }
}

fn joined<T>(
    result: Result<T, tokio::task::JoinError>,
    what: &str,
) -> Result<T, StorageError> {
    result.map_err(|error| StorageError::transfer(what, error))
}

/// One copy invocation. Jobs own their queues and workers, several can run side by side.
pub struct CopyJob {
    source: Arc<dyn Handler>,
    destination: Arc<dyn Handler>,
    settings: Settings,
    progress: Arc<Progress>,
    cancel: CancellationToken,
    state: tokio::sync::watch::Sender<JobState>,
}

impl CopyJob {
    pub fn new(
        source: Arc<dyn Handler>,
        destination: Arc<dyn Handler>,
        settings: Settings,
    ) -> Self {
        let (state, _) = tokio::sync::watch::channel(JobState::Resolving);
        Self {
            source,
            destination,
            settings,
            progress: Arc::new(Progress::new()),
            cancel: CancellationToken::new(),
            state,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<Progress>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    /// Cancelling the token stops the job; `run` then fails with [`StorageError::Cancelled`].
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<JobState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: JobState) {
        tracing::debug!("copy job state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Copies `source_path` to `destination_path`.
    ///
    /// A source container (path ending in the delimiter) is copied into the destination
    /// container. A single blob keeps its name when the destination is a container and takes the
    /// last destination segment otherwise. Failed blobs do not fail the job; check
    /// [`Summary::blobs_failed`].
    #[instrument(skip(self))]
    pub async fn run(&self, source_path: &str, destination_path: &str) -> Result<Summary, Error> {
        let timer = self.settings.timeout.map(|timeout| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => {
                        tracing::error!("copy did not finish within {:?}, cancelling", timeout);
                        cancel.cancel();
                    }
                    () = cancel.cancelled() => {}
                }
            })
        });
        let result = self.execute(source_path, destination_path).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        self.set_state(if result.is_ok() {
            JobState::Done
        } else {
            JobState::Failed
        });
        result
    }

    async fn execute(&self, source_path: &str, destination_path: &str) -> Result<Summary, Error> {
        let invalid = |source| Error::new(source, Summary::default());
        self.set_state(JobState::Resolving);
        self.settings.validate().map_err(invalid)?;
        self.check_capabilities().map_err(invalid)?;
        if source_path.ends_with(self.source.delimiter()) {
            self.copy_container(source_path, destination_path).await
        } else {
            self.copy_blob(source_path, destination_path).await
        }
    }

    fn check_capabilities(&self) -> Result<(), StorageError> {
        if !self.settings.replace {
            self.destination.require(Capability::Exists)?;
        }
        match self.settings.strategy {
            Strategy::LocalRelay => {
                self.source.require(Capability::Read)?;
                self.destination.require(Capability::Write)
            }
            Strategy::ServerSideCopy => {
                self.destination.require(Capability::ServerSideCopy)?;
                self.source.require(Capability::Presign)?;
                if self.source.origin() != self.destination.origin() {
                    return Err(unsupported(self.source.origin(), Capability::ServerSideCopy));
                }
                Ok(())
            }
        }
    }

    async fn cancellable<T>(
        &self,
        operation: impl std::future::Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StorageError::Cancelled),
            result = operation => result,
        }
    }

    async fn resolve_destination(&self, path: &str) -> Result<Location, StorageError> {
        let (tree, target) = self
            .cancellable(self.destination.resolve_container(path))
            .await?;
        Ok(namespace::decompose(
            &tree,
            target,
            self.destination.delimiter(),
        ))
    }

    fn transfer(&self, location: Location) -> Arc<Transfer> {
        Arc::new(Transfer {
            source: self.source.clone(),
            destination: self.destination.clone(),
            location,
            settings: self.settings.clone(),
            progress: self.progress.clone(),
        })
    }

    fn finish(&self, summary: Summary) -> Result<Summary, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::new(StorageError::Cancelled, summary));
        }
        Ok(summary)
    }

    async fn copy_container(
        &self,
        source_path: &str,
        destination_path: &str,
    ) -> Result<Summary, Error> {
        let invalid = |source| Error::new(source, Summary::default());
        if !destination_path.ends_with(self.destination.delimiter()) {
            return Err(invalid(StorageError::invalid_path(
                destination_path,
                "a container can only be copied into a container",
            )));
        }
        let (tree, target) = self
            .cancellable(self.source.open_container(source_path))
            .await
            .map_err(invalid)?;
        let location = self
            .resolve_destination(destination_path)
            .await
            .map_err(invalid)?;
        self.set_state(JobState::Enumerating);
        let capacity = self.settings.queue_capacity;
        let (page_tx, page_rx) = async_channel::bounded::<Snapshot>(capacity);
        let (work_tx, work_rx) = async_channel::bounded::<Blob>(capacity);
        let producer = {
            let source = self.source.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(StorageError::Cancelled),
                    listed = source.list_children_streamed(tree, target, page_tx) => listed,
                }
            })
        };
        let flattener = tokio::spawn(flatten_pages(
            page_rx,
            work_tx,
            self.destination.delimiter(),
            self.progress.clone(),
            self.cancel.clone(),
        ));
        let transfer = self.transfer(location);
        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..self.settings.workers {
            workers.spawn(drain(
                transfer.clone(),
                work_rx.clone(),
                self.cancel.clone(),
                self.settings.fail_early,
            ));
        }
        drop(work_rx);
        let listed = joined(producer.await, "source listing").and_then(|listed| listed);
        if listed.is_ok() {
            self.set_state(JobState::Flattening);
        }
        let flattened = joined(flattener.await, "flattening");
        if listed.is_ok() && flattened.is_ok() {
            self.set_state(JobState::Draining);
        }
        let mut summary = Summary::default();
        let mut worker_error = None;
        while let Some(result) = workers.join_next().await {
            match joined(result, "copy worker") {
                Ok(worker_summary) => summary = summary + worker_summary,
                Err(error) => worker_error = Some(error),
            }
        }
        if self.cancel.is_cancelled() {
            return Err(Error::new(StorageError::Cancelled, summary));
        }
        if let Err(error) = listed.and(flattened) {
            tracing::error!("enumerating {:?} failed: {}", source_path, &error);
            return Err(Error::new(error, summary));
        }
        if let Some(error) = worker_error {
            return Err(Error::new(error, summary));
        }
        self.finish(summary)
    }

    async fn copy_blob(&self, source_path: &str, destination_path: &str) -> Result<Summary, Error> {
        let invalid = |source| Error::new(source, Summary::default());
        let delimiter = self.destination.delimiter();
        let mut blob = self
            .cancellable(self.source.resolve_blob(source_path))
            .await
            .map_err(invalid)?;
        let container_path = if destination_path.ends_with(delimiter) {
            destination_path.to_string()
        } else {
            let (dir, name) = destination_path.rsplit_once(delimiter).ok_or_else(|| {
                invalid(StorageError::invalid_path(
                    destination_path,
                    "the destination must name a container",
                ))
            })?;
            blob.dest_name = name.to_string();
            format!("{dir}{delimiter}")
        };
        let location = self
            .resolve_destination(&container_path)
            .await
            .map_err(invalid)?;
        self.set_state(JobState::Draining);
        let (work_tx, work_rx) = async_channel::bounded(1);
        work_tx
            .try_send(blob)
            .map_err(|_| invalid(StorageError::Cancelled))?;
        drop(work_tx);
        let summary = drain(
            self.transfer(location),
            work_rx,
            self.cancel.clone(),
            self.settings.fail_early,
        )
        .await;
        self.finish(summary)
    }
}
