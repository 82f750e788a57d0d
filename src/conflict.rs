//! Optimistic concurrency over the record store.
//!
//! The store has no row lock, so every mutation is read, compute, then a
//! conditional write against the version that was read. A rejected write is
//! re-read and recomputed after an exponential backoff with random jitter,
//! up to a bounded number of attempts.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::spool::{Spool, SpoolId, SpoolPatch, Version};
use crate::store::RecordStore;
use crate::telemetry::metrics;

/// Delay schedule between conflicting attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            max: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based),
    /// without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.base.mul_f64(exp.min(u32::MAX as f64));
        delay.min(self.max)
    }

    /// Jittered delay. Never below the base delay, never above
    /// `base_delay * (1 + jitter)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay.mul_f64(1.0 + factor)
    }
}

/// A write that went through.
#[derive(Debug, Clone)]
pub struct Committed {
    pub version: Version,
    /// The spool as read for the winning attempt.
    pub before: Spool,
    /// `before` with the patch applied.
    pub after: Spool,
    pub patch: SpoolPatch,
    pub attempts: u32,
}

/// Read-compare-write loop with retry.
#[derive(Clone)]
pub struct ConflictService {
    store: Arc<dyn RecordStore>,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl ConflictService {
    pub fn new(store: Arc<dyn RecordStore>, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// [`Self::update_with_retry`] with the service's configured limits.
    pub async fn update<F>(&self, resource_id: &SpoolId, mutate: F) -> Result<Committed>
    where
        F: FnMut(&Spool) -> Result<SpoolPatch> + Send,
    {
        self.update_with_retry(resource_id, mutate, self.max_attempts, &self.backoff)
            .await
    }

    /// Read the spool, let `mutate` compute a patch from it, and write that
    /// patch conditioned on the version read. On a version conflict, back off
    /// and start over from a fresh read.
    ///
    /// Errors returned by `mutate` are business-rule failures and abort
    /// immediately without retry. An empty patch commits nothing and returns
    /// the version that was read.
    pub async fn update_with_retry<F>(
        &self,
        resource_id: &SpoolId,
        mut mutate: F,
        max_attempts: u32,
        backoff: &BackoffPolicy,
    ) -> Result<Committed>
    where
        F: FnMut(&Spool) -> Result<SpoolPatch> + Send,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let before = self.store.read(resource_id).await?;
            let patch = mutate(&before)?;

            if patch.is_empty() {
                return Ok(Committed {
                    version: before.version.clone(),
                    after: before.clone(),
                    before,
                    patch,
                    attempts: attempt,
                });
            }

            let written = if patch.completions.is_empty() {
                self.store
                    .conditional_write(resource_id, &before.version, &patch)
                    .await
            } else {
                self.store
                    .batch_conditional_write(resource_id, &before.version, &patch)
                    .await
            };
            match written {
                Ok(version) => {
                    debug!(%resource_id, %version, attempt, "conditional write accepted");
                    let after = patch.apply_to(&before, version.clone());
                    return Ok(Committed {
                        version,
                        before,
                        after,
                        patch,
                        attempts: attempt,
                    });
                }
                Err(Error::VersionConflict { .. }) => {
                    metrics::version_conflicts().add(
                        1,
                        &[KeyValue::new("exhausted", attempt >= max_attempts)],
                    );
                    if attempt >= max_attempts {
                        warn!(%resource_id, attempts = attempt, "version conflicts exhausted retries");
                        return Err(Error::ConflictExhausted {
                            resource_id: resource_id.clone(),
                            attempts: attempt,
                        });
                    }
                    let delay = backoff.delay(attempt);
                    debug!(
                        %resource_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "version conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
