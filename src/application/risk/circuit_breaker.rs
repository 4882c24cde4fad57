//! Consecutive broker-failure counter.
//!
//! The authoritative count lives in the repository; an atomic cache serves
//! the hot path so risk checks never wait on the store. Writers go through
//! this service, which keeps both in step.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{info, warn};

use crate::domain::errors::StoreError;
use crate::domain::repositories::StateRepository;

/// Consecutive submission failures that hard-stop trading.
pub const TRIP_THRESHOLD: u32 = 5;

pub struct CircuitBreaker {
    repository: Arc<dyn StateRepository>,
    cached: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(repository: Arc<dyn StateRepository>) -> Self {
        Self {
            repository,
            cached: AtomicU32::new(0),
        }
    }

    /// Seed the cache from the store on startup.
    pub async fn hydrate(&self) -> Result<(), StoreError> {
        let count = self.repository.circuit_breaker_count().await?;
        self.cached.store(count, Ordering::SeqCst);
        Ok(())
    }

    pub fn count(&self) -> u32 {
        self.cached.load(Ordering::SeqCst)
    }

    pub fn is_tripped(&self) -> bool {
        self.count() >= TRIP_THRESHOLD
    }

    pub async fn record_failure(&self) -> Result<u32, StoreError> {
        let count = self.cached.fetch_add(1, Ordering::SeqCst) + 1;
        self.repository.save_circuit_breaker_count(count).await?;
        if count >= TRIP_THRESHOLD {
            warn!(count, "circuit breaker tripped");
        }
        Ok(count)
    }

    pub async fn reset(&self) -> Result<(), StoreError> {
        let previous = self.cached.swap(0, Ordering::SeqCst);
        self.repository.save_circuit_breaker_count(0).await?;
        if previous >= TRIP_THRESHOLD {
            info!(previous, "circuit breaker reset");
        }
        Ok(())
    }
}
