use chrono::{DateTime, Duration, Utc};
use psync_core::{ChannelId, OperationStatus, ProgressRecord};

/// Lifecycle position of one channel: `idle -> processing -> completed -> idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Processing,
    Completed,
}

impl Phase {
    pub fn of(record: &ProgressRecord) -> Self {
        if record.is_processing {
            Phase::Processing
        } else if record.total > 0 || record.outcome.is_some() {
            Phase::Completed
        } else {
            Phase::Idle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Completed(OperationStatus),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionDetector;

impl CompletionDetector {
    /// Runs after every merge. Flips `record` to completed the first time its counters reach
    /// `total`, or when the authoritative source reports a terminal status.
    pub fn evaluate(
        &self,
        before: Phase,
        record: &mut ProgressRecord,
        reported: Option<OperationStatus>,
    ) -> Option<Transition> {
        if !record.is_processing {
            return None;
        }

        let counted_out = record.total > 0 && record.raw_processed() >= record.total;
        let terminal = reported.filter(OperationStatus::is_terminal);
        if counted_out || terminal.is_some() {
            let outcome = terminal.unwrap_or(OperationStatus::Completed);
            record.is_processing = false;
            record.outcome = Some(outcome);
            return Some(Transition::Completed(outcome));
        }

        if before != Phase::Processing {
            return Some(Transition::Started);
        }
        None
    }

    pub fn is_stale(&self, record: &ProgressRecord, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if !record.is_processing {
            return false;
        }
        let Some(last) = record.updated_at.or(record.started_at) else {
            return false;
        };
        now.signed_duration_since(last) > stale_after
    }

    /// Marks a silent operation failed. Returns the transition when the record was flipped.
    pub fn expire(
        &self,
        record: &mut ProgressRecord,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Option<Transition> {
        if !self.is_stale(record, now, stale_after) {
            return None;
        }
        record.is_processing = false;
        record.outcome = Some(OperationStatus::Failed);
        record.updated_at = Some(now);
        Some(Transition::Completed(OperationStatus::Failed))
    }

    /// The zeroed record broadcast on `completed -> idle` (and on dismissal).
    pub fn reset(&self, channel: ChannelId) -> ProgressRecord {
        ProgressRecord::empty(channel)
    }
}
