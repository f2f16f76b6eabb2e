//! Process-wide throttles for blob transfers
//!
//! Three independent token buckets are available, each disabled until configured:
//!
//! 1. **Cache files** - caps the number of payloads cached on local disk at the same time
//! 2. **Requests** - caps backend requests (list pages, exists checks, reads) per interval
//! 3. **Chunks** - caps transferred chunks per interval, bounding bandwidth for a known chunk size
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example() {
//! throttle::set_max_cache_files(64);
//! throttle::init_request_tokens(50);
//! tokio::spawn(throttle::run_request_refill(50, Duration::from_millis(100)));
//!
//! throttle::get_request_token().await;
//! let _cache_slot = throttle::cache_file_permit().await;
//! # }
//! ```
//!
//! A blob of `size` bytes transferred in `chunk_size` pieces consumes `⌈size / chunk_size⌉`
//! chunk tokens (at least one).

mod semaphore;

static CACHE_FILES: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);
static REQUESTS: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);
static CHUNKS: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);

pub fn set_max_cache_files(max_cache_files: usize) {
    CACHE_FILES.setup(max_cache_files);
}

/// Held for as long as a payload lives in the local disk cache.
#[derive(Debug)]
pub struct CacheFileGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn cache_file_permit() -> CacheFileGuard {
    CacheFileGuard {
        _permit: CACHE_FILES.acquire().await,
    }
}

pub fn init_request_tokens(tokens: usize) {
    REQUESTS.setup(tokens);
}

pub fn init_chunk_tokens(tokens: usize) {
    CHUNKS.setup(tokens);
}

pub async fn get_request_token() {
    REQUESTS.consume(1).await;
}

/// Number of chunk tokens needed to move `size` bytes in `chunk_size` pieces.
#[must_use]
pub fn chunk_count(chunk_size: u64, size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.max(1).div_ceil(chunk_size)
}

pub async fn get_chunk_tokens(chunk_size: u64, size: u64) {
    let tokens = chunk_count(chunk_size, size);
    if tokens == 0 {
        return;
    }
    match u32::try_from(tokens) {
        Ok(tokens) => CHUNKS.consume(tokens).await,
        Err(_) => tracing::error!(
            "chunk size {} is too small to throttle a blob of {} bytes, not throttling",
            chunk_size,
            size
        ),
    }
}

pub async fn run_request_refill(per_interval: usize, interval: std::time::Duration) {
    REQUESTS.refill_forever(per_interval, interval).await;
}

pub async fn run_chunk_refill(per_interval: usize, interval: std::time::Duration) {
    CHUNKS.refill_forever(per_interval, interval).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 1024), 0);
        assert_eq!(chunk_count(100, 0), 1);
        assert_eq!(chunk_count(100, 100), 1);
        assert_eq!(chunk_count(100, 101), 2);
        assert_eq!(chunk_count(100 * 1024, 350 * 1024), 4);
    }

    #[tokio::test]
    async fn disabled_semaphore_never_blocks() {
        let sem = semaphore::Semaphore::new();
        assert!(sem.acquire().await.is_none());
        sem.consume(1_000).await;
    }

    #[tokio::test(start_paused = true)]
    async fn refill_restores_tokens() {
        let sem = std::sync::Arc::new(semaphore::Semaphore::new());
        sem.setup(2);
        sem.consume(2).await;
        let refill = {
            let sem = sem.clone();
            tokio::spawn(async move {
                sem.refill_forever(2, std::time::Duration::from_millis(100))
                    .await
            })
        };
        tokio::time::timeout(std::time::Duration::from_secs(1), sem.consume(2))
            .await
            .expect("tokens should be refilled");
        refill.abort();
    }
}
