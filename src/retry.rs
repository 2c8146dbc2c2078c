// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exponential backoff around transient broker failures.

use crate::{config::RabbitConfig, errors::AmqpError};
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tracing::{error, warn};

/// Retries an operation while it fails with a transient error.
///
/// The wait before retry `n` (1-based) is `base_delay * 2^n`, so the
/// default one second base gives 2s, 4s, 8s, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> RetryPolicy {
        RetryPolicy {
            retries,
            base_delay,
        }
    }

    pub fn from_config(cfg: &RabbitConfig) -> RetryPolicy {
        RetryPolicy::new(cfg.retry_count, cfg.retry_base_delay())
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Runs `op` once, then up to `retries` more times while it returns a
    /// transient error. The last error is returned on exhaustion.
    pub async fn execute<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, AmqpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        error = err.to_string(),
                        operation = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        error!(
                            error = err.to_string(),
                            operation = op_name,
                            attempts = attempt + 1,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_config(&RabbitConfig::default())
    }
}
