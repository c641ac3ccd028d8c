//! Worker pool for processing queued events with bounded concurrency.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{ConveyorError, Result};
use crate::event::{AttemptRecord, Disposition, EventData, Lane, WorkerId};
use crate::storage::Storage;

/// Terminal or scheduling decision for one processed event.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The event resolved; record how.
    Succeeded {
        disposition: Disposition,
        attempts: Vec<AttemptRecord>,
    },
    /// The event can never be applied; park it with its attempt history.
    Failed {
        error: String,
        attempts: Vec<AttemptRecord>,
    },
    /// Not processed; return it to the lane and try again after `delay_ms`.
    Release { delay_ms: u64, reason: String },
}

/// Applies one claimed event.
///
/// The worker pool owns the lifecycle bookkeeping; implementations only
/// decide what an event's outcome is.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, event: &EventData) -> Outcome;
}

/// Configuration for one lane's worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Lane this pool claims from
    pub lane: Lane,

    /// Maximum number of events to claim in each iteration
    pub claim_batch_size: usize,

    /// How long to sleep between claim iterations when the lane is empty
    pub claim_interval_ms: u64,

    /// Maximum number of events processed concurrently
    pub concurrency: usize,

    /// Maximum time an event can stay claimed before it is returned to the
    /// lane (milliseconds). This handles workers that crash mid-claim.
    pub visibility_timeout_ms: u64,

    /// Releases allowed before an event is parked in the dead-letter sink
    pub max_redeliveries: u32,

    /// Interval for logging pool status (events in flight) in milliseconds.
    /// Set to None to disable periodic status logging.
    pub status_log_interval_ms: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lane: Lane::Immediate,
            claim_batch_size: 25,
            claim_interval_ms: 500,
            concurrency: 8,
            visibility_timeout_ms: 60_000,
            max_redeliveries: 5,
            status_log_interval_ms: Some(5_000),
        }
    }
}

/// Worker pool that drains one queue lane.
///
/// The pool continuously claims queued events, reaps claims whose workers
/// disappeared, and dispatches events to the `Processor` under a concurrency
/// bound.
pub struct WorkerPool<S, P>
where
    S: Storage,
    P: Processor,
{
    worker_id: WorkerId,
    storage: Arc<S>,
    processor: Arc<P>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    events_in_flight: Arc<AtomicUsize>,
}

impl<S, P> WorkerPool<S, P>
where
    S: Storage + 'static,
    P: Processor + 'static,
{
    /// Create a new worker pool.
    pub fn new(storage: Arc<S>, processor: Arc<P>, config: WorkerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            worker_id: uuid::Uuid::new_v4(),
            storage,
            processor,
            config,
            semaphore,
            events_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run the pool loop until `shutdown` is cancelled.
    ///
    /// In-flight events are drained before this returns; undispatched claims
    /// are handed back to the lane.
    #[tracing::instrument(skip(self, shutdown), fields(worker_id = %self.worker_id, lane = %self.config.lane))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            concurrency = self.config.concurrency,
            claim_batch_size = self.config.claim_batch_size,
            "Worker pool starting main processing loop"
        );

        // Spawn periodic status logging task if configured
        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let events_in_flight = self.events_in_flight.clone();
            let worker_id = self.worker_id;
            let lane = self.config.lane;
            let token = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let count = events_in_flight.load(Ordering::Relaxed);
                            tracing::debug!(
                                worker_id = %worker_id,
                                lane = %lane,
                                events_in_flight = count,
                                "Worker pool status"
                            );
                        }
                        _ = token.cancelled() => break,
                    }
                }
            });
        }

        let mut join_set: JoinSet<Result<()>> = JoinSet::new();

        'claim: loop {
            // Poll for completed tasks (non-blocking)
            while let Some(result) = join_set.try_join_next() {
                match result {
                    Ok(Ok(())) => {
                        tracing::trace!("Task completed successfully");
                    }
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "Task failed");
                    }
                    Err(join_error) => {
                        tracing::error!(error = %join_error, "Task panicked");
                    }
                }
            }

            // Hand back claims whose workers disappeared
            let reaped = self
                .storage
                .reap_expired_claims(self.config.visibility_timeout_ms, self.config.max_redeliveries)
                .await?;
            if reaped.requeued > 0 || reaped.parked > 0 {
                tracing::warn!(
                    requeued = reaped.requeued,
                    parked = reaped.parked,
                    visibility_timeout = %humantime::format_duration(Duration::from_millis(
                        self.config.visibility_timeout_ms
                    )),
                    "Reclaimed expired claims"
                );
            }

            if shutdown.is_cancelled() {
                break;
            }

            // Claim a batch of queued events
            let claimed = self
                .storage
                .claim_events(self.config.lane, self.config.claim_batch_size, self.worker_id)
                .await?;

            if claimed.is_empty() {
                tracing::trace!("Lane empty, sleeping");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.claim_interval_ms)) => continue,
                    _ = shutdown.cancelled() => break,
                }
            }

            tracing::debug!(claimed_count = claimed.len(), "Claimed events from storage");

            // Dispatch events
            let mut undispatched = claimed.into_iter();
            while let Some(event) = undispatched.next() {
                let permit = tokio::select! {
                    permit = self.semaphore.clone().acquire_owned() => permit
                        .map_err(|e| ConveyorError::Internal(format!("semaphore closed: {e}")))?,
                    _ = shutdown.cancelled() => {
                        // Hand back everything that was claimed but not dispatched
                        for event in std::iter::once(event).chain(undispatched) {
                            let delivery_id = event.data.id;
                            if let Err(e) = event.unclaim(self.storage.as_ref()).await {
                                tracing::error!(
                                    delivery_id = %delivery_id,
                                    error = %e,
                                    "Failed to unclaim event during shutdown"
                                );
                            }
                        }
                        break 'claim;
                    }
                };

                let storage = self.storage.clone();
                let processor = self.processor.clone();
                let max_redeliveries = self.config.max_redeliveries;
                let events_in_flight = self.events_in_flight.clone();

                let delivery_id = event.data.id;
                let event_id = event.data.event_id.clone();

                // Increment in-flight counter
                events_in_flight.fetch_add(1, Ordering::Relaxed);

                join_set.spawn(async move {
                    // Permit is held for the duration of this task
                    let _permit = permit;

                    // Ensure we decrement the counter when this task completes
                    let _guard = scopeguard::guard((), |_| {
                        events_in_flight.fetch_sub(1, Ordering::Relaxed);
                    });

                    tracing::info!(
                        delivery_id = %delivery_id,
                        event_id = %event_id,
                        "Processing event"
                    );

                    let applying = event.start(storage.as_ref()).await?;
                    let outcome = processor.process(&applying.data).await;

                    match outcome {
                        Outcome::Succeeded { disposition, attempts } => {
                            let succeeded = applying
                                .succeed(disposition, attempts, storage.as_ref())
                                .await?;
                            tracing::info!(
                                delivery_id = %delivery_id,
                                event_id = %event_id,
                                disposition = ?succeeded.state.disposition,
                                "Event resolved"
                            );
                        }
                        Outcome::Failed { error, attempts } => {
                            let failed = applying
                                .fail(error, attempts, storage.as_ref())
                                .await?;
                            tracing::warn!(
                                delivery_id = %delivery_id,
                                event_id = %event_id,
                                error = %failed.state.error,
                                "Event failed permanently"
                            );
                        }
                        Outcome::Release { delay_ms, reason } => {
                            applying
                                .release(delay_ms, max_redeliveries, &reason, storage.as_ref())
                                .await?;
                        }
                    }

                    Ok(())
                });
            }
        }

        // Drain in-flight tasks before returning
        tracing::info!("Worker pool draining in-flight events");
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Task failed during drain"),
                Err(join_error) => tracing::error!(error = %join_error, "Task panicked during drain"),
            }
        }
        tracing::info!("Worker pool stopped");

        Ok(())
    }
}
