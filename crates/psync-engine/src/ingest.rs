use crate::context::SyncContext;
use chrono::{DateTime, Utc};
use psync_core::push::{AggregateProgress, PushEnvelope, PushError, PushMessage};
use psync_core::{
    BulkMeta, CampaignMeta, ChannelId, ChannelMeta, Delta, ImportMeta, OperationStatus,
    SnapshotDelta,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Turns push-channel envelopes into deltas for the owning channel.
#[derive(Debug, Clone, Default)]
pub struct PushIngestor {
    company_id: Option<String>,
}

impl PushIngestor {
    pub fn new(company_id: Option<String>) -> Self {
        Self { company_id }
    }

    pub fn company_id(&self) -> Option<&str> {
        self.company_id.as_deref()
    }

    /// `Ok(None)` when the envelope belongs to another company.
    pub fn translate(
        &self,
        envelope: &PushEnvelope,
        received_at: DateTime<Utc>,
    ) -> Result<Option<Delta>, PushError> {
        if let (Some(own), Some(theirs)) = (&self.company_id, &envelope.company_id) {
            if own != theirs {
                debug!(
                    event = "push_other_company",
                    kind = %envelope.kind,
                    company_id = %theirs
                );
                return Ok(None);
            }
        }

        let delta = match PushMessage::from_envelope(envelope)? {
            PushMessage::BulkProgress { action, progress } => Delta::snapshot(
                ChannelId::BulkMutation,
                aggregate_snapshot(
                    &envelope.kind,
                    &progress,
                    ChannelMeta::BulkMutation(BulkMeta { action }),
                )?,
                received_at,
            ),
            PushMessage::ImportProgress(import) => Delta::snapshot(
                ChannelId::Import,
                aggregate_snapshot(
                    &envelope.kind,
                    &import.progress,
                    ChannelMeta::Import(ImportMeta {
                        duplicates: import.duplicates,
                        updated: import.updated,
                        no_whatsapp: import.no_whatsapp,
                    }),
                )?,
                received_at,
            ),
            PushMessage::CampaignStarted(started) => Delta::started(
                ChannelId::Campaign,
                Some(started.schedule_id.clone()),
                started.total,
                ChannelMeta::Campaign(CampaignMeta {
                    schedule_id: Some(started.schedule_id),
                    schedule_name: started.schedule_name,
                    campaign_kind: started.campaign_kind,
                    batch_count: started.batch_count,
                    batches_done: started.batches_done,
                }),
                received_at,
            ),
            PushMessage::MessageUpdated(message) => Delta::item(
                ChannelId::Campaign,
                message.message_id.clone(),
                message.label(),
                message.status.clone(),
                received_at,
            )
            .for_operation(message.schedule_id),
        };
        Ok(Some(delta))
    }
}

fn aggregate_snapshot(
    kind: &str,
    progress: &AggregateProgress,
    meta: ChannelMeta,
) -> Result<SnapshotDelta, PushError> {
    let status = progress
        .status
        .parse::<OperationStatus>()
        .map_err(|reason| PushError::InvalidPayload {
            kind: kind.to_string(),
            reason,
        })?;
    let (successful, failed) =
        split_processed(progress.processed, progress.successful, progress.failed);
    Ok(SnapshotDelta {
        operation_id: progress.operation_id.clone(),
        total: (progress.total > 0).then_some(progress.total),
        successful,
        failed,
        status,
        meta: Some(meta),
    })
}

/// Senders that only report `processed` get the remainder counted as successful.
pub fn split_processed(processed: u64, successful: u64, failed: u64) -> (u64, u64) {
    if successful.saturating_add(failed) < processed {
        (processed - failed.min(processed), failed)
    } else {
        (successful, failed)
    }
}

/// Feeds envelopes from `rx` into `ctx` until shutdown or until every sender is dropped.
pub fn spawn_listener(
    ctx: SyncContext,
    mut rx: mpsc::Receiver<PushEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else {
                        break;
                    };
                    if let Err(err) = ctx.ingest_push(&envelope) {
                        warn!(
                            event = "push_ingest_error",
                            kind = %envelope.kind,
                            error = %err
                        );
                    }
                }
            }
        }
        info!(event = "push_listener_stopped", context = %ctx.context_id());
    })
}
