use std::sync::atomic::{AtomicBool, Ordering};

/// Token bucket that is a no-op until `setup` is called with a non-zero size.
pub struct Semaphore {
    enabled: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    pub fn setup(&self, capacity: usize) {
        self.enabled.store(capacity > 0, Ordering::Release);
        if capacity == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(capacity);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.is_enabled() {
            return None;
        }
        // the semaphore is never closed
        self.sem.acquire().await.ok()
    }

    pub async fn consume(&self, tokens: u32) {
        if !self.is_enabled() {
            return;
        }
        if let Ok(permit) = self.sem.acquire_many(tokens).await {
            permit.forget();
        }
    }

    pub async fn refill_forever(&self, per_interval: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let available = self.sem.available_permits();
            if available < per_interval {
                self.sem.add_permits(per_interval - available);
            }
        }
    }
}
