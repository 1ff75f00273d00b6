mod ingestor;

#[cfg(test)]
mod tests;

use crate::breaker::CircuitBreaker;
use crate::pipeline::RecordQueue;
use crate::retry::{Jitter, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;

/// Fetch, validate and enqueue one site's readings, guarded by retries and the
/// shared circuit breaker. Cheap to clone; one clone per spawned unit.
pub struct SiteIngestor<P> {
    provider: Arc<P>,
    breaker: Arc<CircuitBreaker>,
    queue: RecordQueue,
    retry: RetryPolicy,
    jitter: Arc<Jitter>,
    api_timeout: Duration,
}

impl<P> Clone for SiteIngestor<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            breaker: self.breaker.clone(),
            queue: self.queue.clone(),
            retry: self.retry,
            jitter: self.jitter.clone(),
            api_timeout: self.api_timeout,
        }
    }
}
