//! # Bulkhead
//!
//! Limits concurrent in-flight `UserService` calls, independent of the
//! circuit breaker's failure-rate gating.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
}

#[derive(Debug)]
pub struct BulkheadPermit<'a> {
    _permit: SemaphorePermit<'a>,
}

impl Bulkhead {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Acquire a permit, waiting if the bulkhead is at capacity. Dropping
    /// the returned permit releases the slot.
    pub async fn acquire(&self) -> BulkheadPermit<'_> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("bulkhead semaphore is never closed");
        BulkheadPermit { _permit: permit }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limits_concurrent_permits() {
        let bulkhead = Bulkhead::new(2);
        assert_eq!(bulkhead.available_permits(), 2);

        let p1 = bulkhead.acquire().await;
        let p2 = bulkhead.acquire().await;
        assert_eq!(bulkhead.available_permits(), 0);

        drop(p1);
        assert_eq!(bulkhead.available_permits(), 1);
        drop(p2);
        assert_eq!(bulkhead.available_permits(), 2);
    }
}
