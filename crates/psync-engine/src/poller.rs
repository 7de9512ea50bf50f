use crate::context::SyncContext;
use crate::ingest::split_processed;
use crate::merge::MergeOutcome;
use crate::SyncError;
use chrono::{DateTime, Utc};
use psync_core::bus::BusEvent;
use psync_core::{ChannelId, Delta, OperationStatus, SnapshotDelta};
use psync_storage::OperationRow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Authoritative counters for one operation, as reported by the system of record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthoritativeSnapshot {
    pub processed_count: u64,
    pub successful_count: u64,
    pub failed_count: u64,
    pub total_count: Option<u64>,
    pub status: OperationStatus,
}

impl AuthoritativeSnapshot {
    pub fn into_delta(
        self,
        channel: ChannelId,
        operation_id: &str,
        observed_at: DateTime<Utc>,
    ) -> Delta {
        let (successful, failed) = split_processed(
            self.processed_count,
            self.successful_count,
            self.failed_count,
        );
        Delta::snapshot(
            channel,
            SnapshotDelta {
                operation_id: Some(operation_id.to_string()),
                total: self.total_count.filter(|total| *total > 0),
                successful,
                failed,
                status: self.status,
                meta: None,
            },
            observed_at,
        )
    }
}

impl From<OperationRow> for AuthoritativeSnapshot {
    fn from(row: OperationRow) -> Self {
        Self {
            processed_count: row.processed_count,
            successful_count: row.successful_count,
            failed_count: row.failed_count,
            total_count: row.total_count,
            status: row.status,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("operation {0} not found")]
    NotFound(String),
    #[error("snapshot source unavailable: {0}")]
    Unavailable(String),
}

/// Lookup of the authoritative record for an operation id.
pub trait SnapshotSource: Send + Sync + 'static {
    fn fetch(
        &self,
        channel: ChannelId,
        operation_id: &str,
    ) -> impl Future<Output = Result<AuthoritativeSnapshot, FetchError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Continue,
    Failed,
    Finished,
}

/// Reconciles one channel against the system of record while it is processing.
pub struct ReconciliationPoller<S> {
    ctx: SyncContext,
    source: Arc<S>,
    channel: ChannelId,
    interval: Duration,
}

impl<S: SnapshotSource> ReconciliationPoller<S> {
    pub fn new(ctx: SyncContext, source: Arc<S>, channel: ChannelId) -> Self {
        let interval = ctx.config().poll_interval(channel);
        Self {
            ctx,
            source,
            channel,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn tick(&self) -> PollStatus {
        let record = self.ctx.record(self.channel);
        if !record.is_processing {
            return PollStatus::Finished;
        }

        match self.ctx.expire_if_stale(self.channel, Utc::now()) {
            Ok(true) => return PollStatus::Finished,
            Ok(false) => {}
            Err(err) => {
                warn!(event = "poll_stale_check_error", channel = %self.channel, error = %err);
                return PollStatus::Failed;
            }
        }

        let Some(operation_id) = record.operation_id else {
            debug!(event = "poll_skip_no_operation", channel = %self.channel);
            return PollStatus::Continue;
        };

        let snapshot = match self.source.fetch(self.channel, &operation_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    event = "poll_fetch_error",
                    channel = %self.channel,
                    operation_id = %operation_id,
                    error = %err
                );
                return PollStatus::Failed;
            }
        };

        let delta = snapshot.into_delta(self.channel, &operation_id, Utc::now());
        match self.ctx.apply(&delta) {
            Ok(outcome) if outcome.record.is_processing => PollStatus::Continue,
            Ok(_) => PollStatus::Finished,
            Err(err) => {
                warn!(event = "poll_apply_error", channel = %self.channel, error = %err);
                PollStatus::Failed
            }
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failure_streak: u32 = 0;
        info!(
            event = "poller_started",
            channel = %self.channel,
            interval_ms = self.interval.as_millis() as u64
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        PollStatus::Continue => {
                            if failure_streak > 0 {
                                info!(event = "poller_recovered", channel = %self.channel, failure_streak);
                            }
                            failure_streak = 0;
                        }
                        PollStatus::Finished => break,
                        PollStatus::Failed => {
                            failure_streak = failure_streak.saturating_add(1);
                            let backoff = self
                                .interval
                                .saturating_mul(2u32.saturating_pow(failure_streak.min(4)))
                                .min(MAX_BACKOFF);
                            warn!(
                                event = "poller_backoff",
                                channel = %self.channel,
                                failure_streak,
                                backoff_ms = backoff.as_millis() as u64
                            );
                            tokio::select! {
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow() {
                                        break;
                                    }
                                }
                                _ = tokio::time::sleep(backoff) => {}
                            }
                        }
                    }
                }
            }
        }
        info!(event = "poller_stopped", channel = %self.channel);
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

/// Forced snapshot fetch for the active operation on `channel`.
pub async fn resync<S: SnapshotSource>(
    ctx: &SyncContext,
    source: &S,
    channel: ChannelId,
) -> Result<MergeOutcome, SyncError> {
    let record = ctx.record(channel);
    let Some(operation_id) = record.operation_id else {
        return Err(SyncError::NoOperation(channel));
    };
    let snapshot = source.fetch(channel, &operation_id).await?;
    info!(event = "resync", channel = %channel, operation_id = %operation_id);
    ctx.apply(&snapshot.into_delta(channel, &operation_id, Utc::now()))
}

/// Keeps one poller alive for every channel that is processing.
pub struct ReconciliationSupervisor<S> {
    ctx: SyncContext,
    source: Arc<S>,
    pollers: HashMap<ChannelId, JoinHandle<()>>,
}

impl<S: SnapshotSource> ReconciliationSupervisor<S> {
    pub fn new(ctx: SyncContext, source: Arc<S>) -> Self {
        Self {
            ctx,
            source,
            pollers: HashMap::new(),
        }
    }

    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut events = self.ctx.subscribe();
            for channel in ChannelId::ALL {
                if self.ctx.record(channel).is_processing {
                    self.ensure_poller(channel, &shutdown);
                }
            }

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        if let BusEvent::ProgressUpdated { channel, record } = event {
                            if record.is_processing {
                                self.ensure_poller(channel, &shutdown);
                            }
                        }
                    }
                }
            }

            for (_, handle) in self.pollers.drain() {
                let _ = handle.await;
            }
            info!(event = "supervisor_stopped", context = %self.ctx.context_id());
        })
    }

    fn ensure_poller(&mut self, channel: ChannelId, shutdown: &watch::Receiver<bool>) {
        if self
            .pollers
            .get(&channel)
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        let poller = ReconciliationPoller::new(self.ctx.clone(), self.source.clone(), channel);
        self.pollers.insert(channel, poller.spawn(shutdown.clone()));
    }
}
