use crate::bus::{BusSubscription, CrossContextBus};
use crate::completion::{CompletionDetector, Phase, Transition};
use crate::ingest::PushIngestor;
use crate::merge::{MergeEffect, MergeEngine, MergeOutcome};
use crate::projection::ProgressBoard;
use crate::SyncError;
use chrono::{DateTime, Utc};
use psync_core::bus::BusEvent;
use psync_core::config::SyncConfig;
use psync_core::push::PushEnvelope;
use psync_core::{ChannelId, ChannelMeta, Delta, ProgressRecord};
use psync_storage::ProgressStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ContextInner {
    store: ProgressStore,
    bus: CrossContextBus,
    config: SyncConfig,
    merge: MergeEngine,
    detector: CompletionDetector,
    ingestor: PushIngestor,
}

/// One participant (tab, connection, worker) in progress synchronization. Every write goes
/// store first, bus second.
#[derive(Clone)]
pub struct SyncContext {
    inner: Arc<ContextInner>,
}

impl SyncContext {
    pub fn new(store: ProgressStore, config: SyncConfig) -> Self {
        let bus = CrossContextBus::new(store.clone());
        let merge = MergeEngine::new(config.history_limit());
        let company_id = config.company_id.trim();
        let ingestor = PushIngestor::new((!company_id.is_empty()).then(|| company_id.to_string()));
        Self {
            inner: Arc::new(ContextInner {
                store,
                bus,
                config,
                merge,
                detector: CompletionDetector,
                ingestor,
            }),
        }
    }

    pub fn context_id(&self) -> &str {
        self.inner.store.context_id()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn record(&self, channel: ChannelId) -> ProgressRecord {
        self.inner.store.read(channel)
    }

    pub fn modal_open(&self, channel: ChannelId) -> bool {
        self.inner.store.read_modal(channel)
    }

    pub fn subscribe(&self) -> BusSubscription {
        self.inner.bus.subscribe()
    }

    pub fn board(&self) -> ProgressBoard {
        ProgressBoard::hydrate(&self.inner.store)
    }

    /// Merges `delta` into the persisted record and announces the result.
    pub fn apply(&self, delta: &Delta) -> Result<MergeOutcome, SyncError> {
        let channel = delta.channel;
        let mut merged = None;
        let mut before = Phase::Idle;
        self.inner.store.update(channel, |current| {
            before = Phase::of(&current);
            let outcome = self.inner.merge.apply_delta(&current, delta);
            let write = outcome.changed().then(|| outcome.record.clone());
            merged = Some(outcome);
            write
        })?;
        let outcome = merged.ok_or(SyncError::MergeNotRun(channel))?;

        match &outcome.effect {
            MergeEffect::Applied => {}
            MergeEffect::Ignored(reason) => {
                warn!(event = "delta_ignored", channel = %channel, reason = %reason);
                return Ok(outcome);
            }
            effect => {
                debug!(event = "delta_dropped", channel = %channel, effect = ?effect);
                return Ok(outcome);
            }
        }

        self.inner.bus.publish(BusEvent::updated(outcome.record.clone()));
        match outcome.transition {
            Some(Transition::Started) => {
                info!(
                    event = "operation_started",
                    channel = %channel,
                    operation_id = outcome.record.operation_id.as_deref().unwrap_or_default(),
                    total = outcome.record.total
                );
                self.set_modal(channel, true)?;
            }
            Some(Transition::Completed(status)) => {
                info!(
                    event = "operation_completed",
                    channel = %channel,
                    operation_id = outcome.record.operation_id.as_deref().unwrap_or_default(),
                    outcome = %status,
                    successful = outcome.record.successful,
                    failed = outcome.record.failed,
                    total = outcome.record.total
                );
                if before != Phase::Processing {
                    self.set_modal(channel, true)?;
                }
            }
            None => {}
        }
        Ok(outcome)
    }

    /// Local start of an operation, before the first push or poll arrives.
    pub fn start_operation(
        &self,
        channel: ChannelId,
        operation_id: Option<String>,
        total: u64,
        meta: ChannelMeta,
    ) -> Result<MergeOutcome, SyncError> {
        self.apply(&Delta::started(
            channel,
            operation_id,
            total,
            meta,
            Utc::now(),
        ))
    }

    /// `Ok(None)` when the envelope was addressed to another company.
    pub fn ingest_push(&self, envelope: &PushEnvelope) -> Result<Option<MergeOutcome>, SyncError> {
        let Some(delta) = self.inner.ingestor.translate(envelope, Utc::now())? else {
            return Ok(None);
        };
        self.apply(&delta).map(Some)
    }

    /// Hides progress for `channel` in every context. The backend operation keeps running.
    pub fn dismiss(&self, channel: ChannelId) -> Result<(), SyncError> {
        self.inner.store.clear(channel)?;
        self.inner
            .bus
            .publish(BusEvent::updated(self.inner.detector.reset(channel)));
        self.set_modal(channel, false)?;
        info!(event = "progress_dismissed", channel = %channel, context = %self.context_id());
        Ok(())
    }

    /// Clears a completed record. Returns false while the operation is still running or when
    /// there is nothing to acknowledge.
    pub fn acknowledge(&self, channel: ChannelId) -> Result<bool, SyncError> {
        let record = self.record(channel);
        if record.is_processing || record.is_idle() {
            return Ok(false);
        }
        self.dismiss(channel)?;
        Ok(true)
    }

    pub fn open_modal(&self, channel: ChannelId) -> Result<(), SyncError> {
        self.set_modal(channel, true)
    }

    pub fn close_modal(&self, channel: ChannelId) -> Result<(), SyncError> {
        self.set_modal(channel, false)
    }

    /// Fails a processing record that has gone quiet for longer than the configured timeout.
    pub fn expire_if_stale(&self, channel: ChannelId, now: DateTime<Utc>) -> Result<bool, SyncError> {
        let stale_after = chrono::Duration::from_std(self.inner.config.stale_after())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let detector = self.inner.detector;
        let written = self.inner.store.update(channel, |mut record| {
            detector.expire(&mut record, now, stale_after)?;
            Some(record)
        })?;
        let Some(record) = written else {
            return Ok(false);
        };
        warn!(
            event = "operation_stale",
            channel = %channel,
            operation_id = record.operation_id.as_deref().unwrap_or_default(),
            stale_after_secs = self.inner.config.stale_after_secs
        );
        self.inner.bus.publish(BusEvent::updated(record));
        Ok(true)
    }

    fn set_modal(&self, channel: ChannelId, open: bool) -> Result<(), SyncError> {
        self.inner.store.write_modal(channel, open)?;
        self.inner.bus.publish(BusEvent::modal(channel, open));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psync_core::push::{BULK_DELETE_PROGRESS, CAMPAIGN_STARTED, IMPORT_PROGRESS, MESSAGE_UPDATED};
    use psync_storage::StoreHub;
    use serde_json::json;
    use std::time::Duration;

    fn context(hub: &StoreHub, id: &str) -> SyncContext {
        SyncContext::new(hub.context(id), SyncConfig::default())
    }

    #[test]
    fn start_opens_modal_and_persists() {
        let hub = StoreHub::in_memory();
        let ctx = context(&hub, "tab-a");
        let outcome = ctx
            .start_operation(ChannelId::Import, Some("job-1".to_string()), 3, ChannelMeta::None)
            .expect("start");
        assert_eq!(outcome.transition, Some(Transition::Started));
        assert!(ctx.record(ChannelId::Import).is_processing);
        assert!(ctx.modal_open(ChannelId::Import));
    }

    #[test]
    fn push_messages_drive_campaign_to_completion() {
        let hub = StoreHub::in_memory();
        let ctx = context(&hub, "tab-a");
        ctx.ingest_push(&PushEnvelope::new(
            CAMPAIGN_STARTED,
            json!({"schedule_id": 5, "total": 2}),
        ))
        .expect("start");
        for message_id in ["a", "b"] {
            ctx.ingest_push(&PushEnvelope::new(
                MESSAGE_UPDATED,
                json!({"schedule_id": 5, "message_id": message_id, "status": "sent"}),
            ))
            .expect("item");
        }
        let record = ctx.record(ChannelId::Campaign);
        assert!(!record.is_processing);
        assert_eq!(record.successful, 2);
    }

    #[test]
    fn acknowledge_only_clears_finished_operations() {
        let hub = StoreHub::in_memory();
        let ctx = context(&hub, "tab-a");
        ctx.start_operation(ChannelId::BulkMutation, None, 1, ChannelMeta::None)
            .expect("start");
        assert!(!ctx.acknowledge(ChannelId::BulkMutation).expect("ack"));

        ctx.apply(&Delta::item(
            ChannelId::BulkMutation,
            "contact-1",
            "",
            "success",
            Utc::now(),
        ))
        .expect("item");
        assert!(ctx.acknowledge(ChannelId::BulkMutation).expect("ack"));
        assert!(ctx.record(ChannelId::BulkMutation).is_idle());
        assert!(!ctx.modal_open(ChannelId::BulkMutation));
    }

    #[test]
    fn second_bulk_delete_of_same_size_is_shown() {
        let hub = StoreHub::in_memory();
        let ctx = context(&hub, "tab-a");
        let push = |status: &str, processed: u64| {
            ctx.ingest_push(&PushEnvelope::new(
                BULK_DELETE_PROGRESS,
                json!({"status": status, "total": 20, "processed": processed, "successful": processed, "failed": 0}),
            ))
            .expect("push")
            .expect("outcome")
        };

        push("processing", 5);
        assert!(push("completed", 20).completed());
        let second = push("processing", 3);
        assert_eq!(second.effect, MergeEffect::Applied);
        assert_eq!(second.transition, Some(Transition::Started));

        let record = ctx.record(ChannelId::BulkMutation);
        assert!(record.is_processing);
        assert_eq!(record.successful, 3);
        assert_eq!(record.total, 20);
    }

    #[tokio::test]
    async fn import_reported_complete_on_first_push_is_shown() {
        let hub = StoreHub::in_memory();
        let ctx = context(&hub, "tab-a");
        let mut events = ctx.subscribe();
        let outcome = ctx
            .ingest_push(&PushEnvelope::new(
                IMPORT_PROGRESS,
                json!({"status": "completed", "total": 3, "processed": 3, "successful": 3, "failed": 0}),
            ))
            .expect("push")
            .expect("outcome");
        assert!(outcome.completed());

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event timeout")
            .expect("event");
        let BusEvent::ProgressUpdated { record, .. } = event else {
            panic!("expected progress update")
        };
        assert!(!record.is_processing);
        assert_eq!(record.successful, 3);

        let record = ctx.record(ChannelId::Import);
        assert!(!record.is_processing);
        assert_eq!(record.processed(), 3);
        assert_eq!(record.outcome, Some(psync_core::OperationStatus::Completed));
        assert!(ctx.modal_open(ChannelId::Import));

        let replay = ctx
            .ingest_push(&PushEnvelope::new(
                IMPORT_PROGRESS,
                json!({"status": "completed", "total": 3, "processed": 3, "successful": 3, "failed": 0}),
            ))
            .expect("push")
            .expect("outcome");
        assert_eq!(replay.effect, MergeEffect::Stale);
    }

    #[test]
    fn quiet_operation_expires_as_failed() {
        let hub = StoreHub::in_memory();
        let ctx = context(&hub, "tab-a");
        ctx.start_operation(ChannelId::Import, Some("job-9".to_string()), 10, ChannelMeta::None)
            .expect("start");
        let now = Utc::now();
        assert!(!ctx.expire_if_stale(ChannelId::Import, now).expect("check"));

        let later = now + chrono::Duration::seconds(ctx.config().stale_after_secs as i64 + 5);
        assert!(ctx.expire_if_stale(ChannelId::Import, later).expect("expire"));
        let record = ctx.record(ChannelId::Import);
        assert!(!record.is_processing);
        assert_eq!(record.outcome, Some(psync_core::OperationStatus::Failed));
    }

    #[tokio::test]
    async fn dismissal_reaches_other_context() {
        let hub = StoreHub::in_memory();
        let tab_a = context(&hub, "tab-a");
        let tab_b = context(&hub, "tab-b");
        tab_a
            .start_operation(ChannelId::BulkMutation, None, 50, ChannelMeta::None)
            .expect("start");
        let mut board_b = tab_b.board();
        let mut sub_b = tab_b.subscribe();

        tab_a.dismiss(ChannelId::BulkMutation).expect("dismiss");
        while board_b.record(ChannelId::BulkMutation).total != 0
            || board_b.view(ChannelId::BulkMutation).modal_open
        {
            let event = tokio::time::timeout(Duration::from_secs(1), sub_b.recv())
                .await
                .expect("timeout")
                .expect("event");
            board_b.reduce(&event);
        }
        assert!(tab_b.record(ChannelId::BulkMutation).is_idle());
    }
}
