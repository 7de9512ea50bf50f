use crate::completion::{CompletionDetector, Phase, Transition};
use chrono::{DateTime, Utc};
use psync_core::{
    Delta, DeltaBody, ItemDelta, ItemStatus, OperationStart, OperationStatus, ProgressRecord,
    RecentItem, SnapshotDelta, RECENT_ITEMS_LIMIT,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeEffect {
    Applied,
    /// Already applied; the record is returned untouched.
    Duplicate,
    /// Targets an operation that is no longer (or not yet) processing.
    Stale,
    /// Well-formed but carried nothing new.
    Unchanged,
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub record: ProgressRecord,
    pub effect: MergeEffect,
    pub transition: Option<Transition>,
}

impl MergeOutcome {
    fn untouched(record: &ProgressRecord, effect: MergeEffect) -> Self {
        Self {
            record: record.clone(),
            effect,
            transition: None,
        }
    }

    pub fn changed(&self) -> bool {
        self.effect == MergeEffect::Applied
    }

    pub fn completed(&self) -> bool {
        matches!(self.transition, Some(Transition::Completed(_)))
    }
}

/// Applies deltas to progress records. Pure: the clock is never read, every timestamp comes
/// from the delta itself, so replicas fed the same deltas agree.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    history_limit: usize,
    detector: CompletionDetector,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new(RECENT_ITEMS_LIMIT)
    }
}

impl MergeEngine {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit: history_limit.clamp(1, RECENT_ITEMS_LIMIT),
            detector: CompletionDetector,
        }
    }

    pub fn apply_delta(&self, record: &ProgressRecord, delta: &Delta) -> MergeOutcome {
        if delta.channel != record.channel_id {
            warn!(
                event = "merge_channel_mismatch",
                record_channel = %record.channel_id,
                delta_channel = %delta.channel
            );
            return MergeOutcome::untouched(
                record,
                MergeEffect::Ignored(format!(
                    "delta for {} applied to {} record",
                    delta.channel, record.channel_id
                )),
            );
        }

        let before = Phase::of(record);
        let merged = match &delta.body {
            DeltaBody::Started(start) => self.merge_start(record, start, delta.observed_at),
            DeltaBody::Item(item) => self.merge_item(record, item, delta.observed_at),
            DeltaBody::Snapshot(snapshot) => {
                self.merge_snapshot(record, snapshot, delta.observed_at)
            }
        };

        let (mut next, reported) = match merged {
            Ok(value) => value,
            Err(effect) => {
                debug!(
                    event = "merge_dropped",
                    channel = %record.channel_id,
                    item_id = delta.item_id().unwrap_or_default(),
                    effect = ?effect
                );
                return MergeOutcome::untouched(record, effect);
            }
        };

        let transition = self.detector.evaluate(before, &mut next, reported);
        if next == *record {
            return MergeOutcome::untouched(record, MergeEffect::Unchanged);
        }
        if next.has_diverged() {
            warn!(
                event = "merge_counter_divergence",
                channel = %next.channel_id,
                total = next.total,
                successful = next.successful,
                failed = next.failed
            );
        }

        MergeOutcome {
            record: next,
            effect: MergeEffect::Applied,
            transition,
        }
    }

    fn merge_start(
        &self,
        record: &ProgressRecord,
        start: &OperationStart,
        observed_at: DateTime<Utc>,
    ) -> Result<(ProgressRecord, Option<OperationStatus>), MergeEffect> {
        if start.total == 0 {
            return Err(MergeEffect::Ignored(
                "operation started without items".to_string(),
            ));
        }

        let same_operation = match (&record.operation_id, &start.operation_id) {
            (Some(current), Some(incoming)) => current == incoming,
            (None, None) => record.is_processing,
            _ => false,
        };
        if same_operation {
            return Err(if record.is_processing {
                MergeEffect::Duplicate
            } else {
                MergeEffect::Stale
            });
        }

        if record.is_processing {
            debug!(
                event = "merge_operation_superseded",
                channel = %record.channel_id,
                previous = record.operation_id.as_deref().unwrap_or_default(),
                next = start.operation_id.as_deref().unwrap_or_default()
            );
        }

        let mut next = ProgressRecord::empty(record.channel_id);
        next.operation_id = start.operation_id.clone();
        next.is_processing = true;
        next.total = start.total;
        next.meta = start.meta.clone();
        next.started_at = Some(observed_at);
        next.updated_at = Some(observed_at);
        Ok((next, Some(OperationStatus::Processing)))
    }

    fn merge_item(
        &self,
        record: &ProgressRecord,
        item: &ItemDelta,
        observed_at: DateTime<Utc>,
    ) -> Result<(ProgressRecord, Option<OperationStatus>), MergeEffect> {
        if !record.is_processing {
            return Err(MergeEffect::Stale);
        }
        if let (Some(current), Some(incoming)) = (&record.operation_id, &item.operation_id) {
            if current != incoming {
                return Err(MergeEffect::Stale);
            }
        }
        if record.processed_item_ids.contains(&item.item_id) {
            return Err(MergeEffect::Duplicate);
        }

        let status = match item.status.parse::<ItemStatus>() {
            Ok(status) => status,
            Err(reason) => {
                warn!(
                    event = "merge_unknown_item_status",
                    channel = %record.channel_id,
                    item_id = %item.item_id,
                    status = %item.status
                );
                return Err(MergeEffect::Ignored(reason));
            }
        };

        let mut next = record.clone();
        match status {
            ItemStatus::Success => {
                next.processed_item_ids.insert(item.item_id.clone());
                next.successful = next.successful.saturating_add(1);
            }
            ItemStatus::Failed => {
                next.processed_item_ids.insert(item.item_id.clone());
                next.failed = next.failed.saturating_add(1);
            }
            ItemStatus::Pending => {
                if record
                    .recent_items
                    .iter()
                    .any(|existing| existing.item_id == item.item_id)
                {
                    return Err(MergeEffect::Duplicate);
                }
            }
        }

        let label = if item.label.trim().is_empty() {
            item.item_id.clone()
        } else {
            item.label.clone()
        };
        next.push_recent(
            RecentItem {
                item_id: item.item_id.clone(),
                label,
                status,
                timestamp: observed_at,
            },
            self.history_limit,
        );
        next.updated_at = latest(next.updated_at, observed_at);
        Ok((next, None))
    }

    fn merge_snapshot(
        &self,
        record: &ProgressRecord,
        snapshot: &SnapshotDelta,
        observed_at: DateTime<Utc>,
    ) -> Result<(ProgressRecord, Option<OperationStatus>), MergeEffect> {
        let mut next = if record.is_processing {
            if let (Some(current), Some(incoming)) = (&record.operation_id, &snapshot.operation_id)
            {
                if current != incoming {
                    return Err(MergeEffect::Stale);
                }
            }
            record.clone()
        } else {
            if snapshot.total.unwrap_or(0) == 0 || !self.is_new_operation(record, snapshot) {
                return Err(MergeEffect::Stale);
            }
            let mut fresh = ProgressRecord::empty(record.channel_id);
            fresh.is_processing = true;
            fresh.started_at = Some(observed_at);
            fresh
        };

        if next.operation_id.is_none() {
            next.operation_id = snapshot.operation_id.clone();
        }
        if next.total == 0 {
            next.total = snapshot.total.unwrap_or(0);
        }

        // Last value wins: the authoritative counters replace whatever items were counted
        // locally. Item ids stay recorded so replays still dedup.
        let counters_moved =
            snapshot.successful != next.successful || snapshot.failed != next.failed;
        next.successful = snapshot.successful;
        next.failed = snapshot.failed;

        if let Some(meta) = &snapshot.meta {
            next.meta.absorb(meta);
        }

        if counters_moved || next.meta != record.meta || !record.is_processing {
            next.updated_at = latest(next.updated_at, observed_at);
        }
        Ok((next, Some(snapshot.status)))
    }

    /// Whether a snapshot arriving on a non-processing record belongs to a new operation.
    /// A terminal snapshot may establish and complete an operation in one step.
    fn is_new_operation(&self, record: &ProgressRecord, snapshot: &SnapshotDelta) -> bool {
        if record.is_idle() {
            return true;
        }
        match (&record.operation_id, &snapshot.operation_id) {
            (Some(current), Some(incoming)) => current != incoming,
            // Anonymous operations: a different total, or fresh `processing` progress after
            // the previous one finished, starts over.
            (None, None) => {
                snapshot.total.is_some_and(|total| total != record.total)
                    || snapshot.status == OperationStatus::Processing
            }
            _ => false,
        }
    }
}

fn latest(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(candidate, |current| current.max(candidate)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use psync_core::{CampaignMeta, ChannelId, ChannelMeta, ImportMeta};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0)
            .single()
            .expect("timestamp")
    }

    fn started(channel: ChannelId, total: u64) -> ProgressRecord {
        let engine = MergeEngine::default();
        let delta = Delta::started(
            channel,
            Some("op-1".to_string()),
            total,
            ChannelMeta::None,
            at(0),
        );
        engine
            .apply_delta(&ProgressRecord::empty(channel), &delta)
            .record
    }

    fn snapshot(successful: u64, failed: u64, status: OperationStatus) -> SnapshotDelta {
        SnapshotDelta {
            operation_id: Some("op-1".to_string()),
            total: None,
            successful,
            failed,
            status,
            meta: None,
        }
    }

    #[test]
    fn start_establishes_processing_record() {
        let engine = MergeEngine::default();
        let delta = Delta::started(
            ChannelId::Campaign,
            Some("42".to_string()),
            8,
            ChannelMeta::Campaign(CampaignMeta {
                schedule_id: Some("42".to_string()),
                batch_count: 2,
                ..CampaignMeta::default()
            }),
            at(0),
        );
        let outcome = engine.apply_delta(&ProgressRecord::empty(ChannelId::Campaign), &delta);
        assert_eq!(outcome.effect, MergeEffect::Applied);
        assert_eq!(outcome.transition, Some(Transition::Started));
        assert!(outcome.record.is_processing);
        assert_eq!(outcome.record.total, 8);
        assert_eq!(outcome.record.pending(), 8);

        let again = engine.apply_delta(&outcome.record, &delta);
        assert_eq!(again.effect, MergeEffect::Duplicate);
    }

    #[test]
    fn start_without_items_is_ignored() {
        let engine = MergeEngine::default();
        let delta = Delta::started(ChannelId::Import, None, 0, ChannelMeta::None, at(0));
        let outcome = engine.apply_delta(&ProgressRecord::empty(ChannelId::Import), &delta);
        assert!(matches!(outcome.effect, MergeEffect::Ignored(_)));
        assert!(!outcome.record.is_processing);
    }

    #[test]
    fn duplicate_item_counts_once() {
        let engine = MergeEngine::default();
        let record = started(ChannelId::Campaign, 5);
        let delta = Delta::item(ChannelId::Campaign, "m1", "Ana", "success", at(1));

        let first = engine.apply_delta(&record, &delta);
        assert_eq!(first.record.successful, 1);
        let second = engine.apply_delta(&first.record, &delta);
        assert_eq!(second.effect, MergeEffect::Duplicate);
        assert_eq!(second.record, first.record);
    }

    #[test]
    fn unknown_status_is_ignored_without_touching_counters() {
        let engine = MergeEngine::default();
        let record = started(ChannelId::Campaign, 5);
        let delta = Delta::item(ChannelId::Campaign, "m1", "Ana", "bounced", at(1));
        let outcome = engine.apply_delta(&record, &delta);
        assert!(matches!(outcome.effect, MergeEffect::Ignored(_)));
        assert_eq!(outcome.record, record);
    }

    #[test]
    fn pending_then_success_replaces_recent_entry() {
        let engine = MergeEngine::default();
        let record = started(ChannelId::Campaign, 5);
        let pending = engine.apply_delta(
            &record,
            &Delta::item(ChannelId::Campaign, "m1", "Ana", "queued", at(1)),
        );
        assert_eq!(pending.record.successful, 0);
        assert!(pending.record.processed_item_ids.is_empty());
        assert_eq!(pending.record.recent_items[0].status, ItemStatus::Pending);

        let sent = engine.apply_delta(
            &pending.record,
            &Delta::item(ChannelId::Campaign, "m1", "Ana", "sent", at(2)),
        );
        assert_eq!(sent.record.successful, 1);
        assert_eq!(sent.record.recent_items.len(), 1);
        assert_eq!(sent.record.recent_items[0].status, ItemStatus::Success);
    }

    #[test]
    fn item_for_other_operation_is_stale() {
        let engine = MergeEngine::default();
        let record = started(ChannelId::Campaign, 5);
        let delta =
            Delta::item(ChannelId::Campaign, "m1", "", "sent", at(1)).for_operation("op-2");
        assert_eq!(engine.apply_delta(&record, &delta).effect, MergeEffect::Stale);
    }

    #[test]
    fn item_on_idle_channel_is_stale() {
        let engine = MergeEngine::default();
        let delta = Delta::item(ChannelId::Import, "c1", "", "success", at(1));
        let outcome = engine.apply_delta(&ProgressRecord::empty(ChannelId::Import), &delta);
        assert_eq!(outcome.effect, MergeEffect::Stale);
    }

    #[test]
    fn snapshot_overwrites_counters_and_keeps_recent_items() {
        let engine = MergeEngine::default();
        let mut record = started(ChannelId::Import, 100);
        for idx in 0..10 {
            record = engine
                .apply_delta(
                    &record,
                    &Delta::item(ChannelId::Import, format!("c{idx}"), "", "success", at(idx)),
                )
                .record;
        }
        assert_eq!(record.successful, 10);

        let outcome = engine.apply_delta(
            &record,
            &Delta::snapshot(
                ChannelId::Import,
                snapshot(40, 2, OperationStatus::Processing),
                at(20),
            ),
        );
        assert_eq!(outcome.record.successful, 40);
        assert_eq!(outcome.record.failed, 2);
        assert_eq!(outcome.record.recent_items, record.recent_items);
        assert!(outcome.record.is_processing);
    }

    #[test]
    fn snapshot_pulls_over_counted_record_back_down() {
        let engine = MergeEngine::default();
        let mut record = started(ChannelId::Import, 100);
        for idx in 0..70 {
            record = engine
                .apply_delta(
                    &record,
                    &Delta::item(ChannelId::Import, format!("c{idx}"), "", "success", at(idx)),
                )
                .record;
        }
        assert_eq!(record.successful, 70);

        let outcome = engine.apply_delta(
            &record,
            &Delta::snapshot(
                ChannelId::Import,
                snapshot(50, 0, OperationStatus::Processing),
                at(80),
            ),
        );
        assert_eq!(outcome.effect, MergeEffect::Applied);
        assert_eq!(outcome.record.successful, 50);
        assert_eq!(outcome.record.pending(), 50);
        assert!(outcome.record.is_processing);
        assert_eq!(outcome.record.processed_item_ids, record.processed_item_ids);

        // Items already seen stay deduplicated after the overwrite.
        let replay = engine.apply_delta(
            &outcome.record,
            &Delta::item(ChannelId::Import, "c3", "", "success", at(81)),
        );
        assert_eq!(replay.effect, MergeEffect::Duplicate);
        assert_eq!(replay.record.successful, 50);
    }

    #[test]
    fn terminal_snapshot_completes_once() {
        let engine = MergeEngine::default();
        let record = started(ChannelId::Import, 100);
        let done = engine.apply_delta(
            &record,
            &Delta::snapshot(
                ChannelId::Import,
                snapshot(97, 3, OperationStatus::Completed),
                at(9),
            ),
        );
        assert_eq!(
            done.transition,
            Some(Transition::Completed(OperationStatus::Completed))
        );
        assert!(!done.record.is_processing);

        let replay = engine.apply_delta(
            &done.record,
            &Delta::snapshot(
                ChannelId::Import,
                snapshot(97, 3, OperationStatus::Completed),
                at(10),
            ),
        );
        assert_eq!(replay.effect, MergeEffect::Stale);
        assert_eq!(replay.transition, None);
    }

    #[test]
    fn aggregate_snapshot_establishes_idle_channel() {
        let engine = MergeEngine::default();
        let outcome = engine.apply_delta(
            &ProgressRecord::empty(ChannelId::BulkMutation),
            &Delta::snapshot(
                ChannelId::BulkMutation,
                SnapshotDelta {
                    operation_id: None,
                    total: Some(50),
                    successful: 3,
                    failed: 0,
                    status: OperationStatus::Processing,
                    meta: None,
                },
                at(1),
            ),
        );
        assert_eq!(outcome.transition, Some(Transition::Started));
        assert_eq!(outcome.record.total, 50);
        assert_eq!(outcome.record.successful, 3);
    }

    #[test]
    fn snapshot_meta_is_absorbed() {
        let engine = MergeEngine::default();
        let record = started(ChannelId::Import, 100);
        let mut delta = snapshot(5, 0, OperationStatus::Processing);
        delta.meta = Some(ChannelMeta::Import(ImportMeta {
            duplicates: 2,
            updated: 1,
            no_whatsapp: 0,
        }));
        let outcome =
            engine.apply_delta(&record, &Delta::snapshot(ChannelId::Import, delta, at(3)));
        assert_eq!(
            outcome.record.meta,
            ChannelMeta::Import(ImportMeta {
                duplicates: 2,
                updated: 1,
                no_whatsapp: 0,
            })
        );
    }

    fn bulk(successful: u64, status: OperationStatus) -> Delta {
        Delta::snapshot(
            ChannelId::BulkMutation,
            SnapshotDelta {
                operation_id: None,
                total: Some(20),
                successful,
                failed: 0,
                status,
                meta: None,
            },
            at(successful as i64),
        )
    }

    #[test]
    fn same_size_anonymous_operations_run_back_to_back() {
        let engine = MergeEngine::default();
        let first = engine.apply_delta(
            &ProgressRecord::empty(ChannelId::BulkMutation),
            &bulk(5, OperationStatus::Processing),
        );
        let done = engine.apply_delta(&first.record, &bulk(20, OperationStatus::Completed));
        assert!(done.completed());
        assert!(!done.record.is_processing);

        let replay = engine.apply_delta(&done.record, &bulk(20, OperationStatus::Completed));
        assert_eq!(replay.effect, MergeEffect::Stale);

        let second = engine.apply_delta(&done.record, &bulk(3, OperationStatus::Processing));
        assert_eq!(second.effect, MergeEffect::Applied);
        assert_eq!(second.transition, Some(Transition::Started));
        assert!(second.record.is_processing);
        assert_eq!(second.record.successful, 3);
        assert_eq!(second.record.outcome, None);
    }

    #[test]
    fn terminal_first_report_establishes_and_completes() {
        let engine = MergeEngine::default();
        let outcome = engine.apply_delta(
            &ProgressRecord::empty(ChannelId::Import),
            &Delta::snapshot(
                ChannelId::Import,
                SnapshotDelta {
                    operation_id: None,
                    total: Some(3),
                    successful: 3,
                    failed: 0,
                    status: OperationStatus::Completed,
                    meta: None,
                },
                at(1),
            ),
        );
        assert_eq!(outcome.effect, MergeEffect::Applied);
        assert_eq!(
            outcome.transition,
            Some(Transition::Completed(OperationStatus::Completed))
        );
        assert!(!outcome.record.is_processing);
        assert_eq!(outcome.record.total, 3);
        assert_eq!(outcome.record.processed(), 3);

        let replay = engine.apply_delta(
            &outcome.record,
            &Delta::snapshot(
                ChannelId::Import,
                SnapshotDelta {
                    operation_id: None,
                    total: Some(3),
                    successful: 3,
                    failed: 0,
                    status: OperationStatus::Completed,
                    meta: None,
                },
                at(2),
            ),
        );
        assert_eq!(replay.effect, MergeEffect::Stale);
        assert_eq!(replay.transition, None);
    }

    #[test]
    fn channel_mismatch_is_ignored() {
        let engine = MergeEngine::default();
        let record = started(ChannelId::Import, 3);
        let delta = Delta::item(ChannelId::Campaign, "m1", "", "sent", at(1));
        assert!(matches!(
            engine.apply_delta(&record, &delta).effect,
            MergeEffect::Ignored(_)
        ));
    }
}
