use std::sync::atomic::{AtomicBool, Ordering};

/// Token semaphore that stays disabled (never blocks) until `setup` is called with a
/// non-zero value.
pub struct Semaphore {
    enabled: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::new(0),
        }
    }

    pub fn setup(&self, value: usize) {
        self.enabled.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    // the semaphore is never closed so a failed acquire is treated like a disabled limit
    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.is_enabled() {
            return None;
        }
        self.sem.acquire().await.ok()
    }

    pub async fn consume(&self) {
        if let Some(permit) = self.acquire().await {
            permit.forget();
        }
    }

    pub async fn consume_many(&self, value: u32) {
        if !self.is_enabled() {
            return;
        }
        if let Ok(permit) = self.sem.acquire_many(value).await {
            permit.forget();
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let curr_permits = self.sem.available_permits();
            if curr_permits >= replenish {
                continue;
            }
            self.sem.add_permits(replenish - curr_permits);
        }
    }
}
