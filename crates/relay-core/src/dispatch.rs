use std::future::Future;

use crate::{
    errors::{DispatchError, Error},
    ratelimit::{RateLimiter, RateStatus},
    Result,
};

/// Throttling + classification façade over every outbound call.
///
/// The dispatcher never retries: callers decide (the ingestion loop backs off,
/// the processor reports).
#[derive(Debug)]
pub struct Dispatcher {
    limiter: RateLimiter,
}

impl Dispatcher {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }

    /// Run `op` through the rate window of `service` and classify its failure.
    pub async fn call<T, F, Fut>(&self, service: &str, op: F) -> std::result::Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.limiter
            .admit(service, op)
            .await
            .map_err(|e| classify(service, e))
    }

    pub async fn status(&self, service: &str) -> Result<RateStatus> {
        self.limiter.status(service).await
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiter.services().map(|s| s.to_string()).collect();
        names.sort();
        names
    }
}

fn classify(service: &str, err: Error) -> DispatchError {
    if let Error::Dispatch(inner) = err {
        return inner;
    }
    DispatchError {
        service: service.to_string(),
        kind: err.kind(),
        retry_after: err.retry_after(),
        message: err.to_string(),
    }
}
