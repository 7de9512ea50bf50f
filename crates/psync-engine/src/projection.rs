use psync_core::bus::BusEvent;
use psync_core::{ChannelId, ProgressRecord};
use psync_storage::ProgressStore;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelView {
    pub record: ProgressRecord,
    pub modal_open: bool,
}

impl ChannelView {
    fn empty(channel: ChannelId) -> Self {
        Self {
            record: ProgressRecord::empty(channel),
            modal_open: false,
        }
    }
}

/// Compact, render-ready numbers for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSummary {
    pub channel: ChannelId,
    pub is_processing: bool,
    pub total: u64,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub pending: u64,
    pub percent: u8,
    pub modal_open: bool,
}

/// Render-side projection of every channel, driven only by bus events.
#[derive(Debug, Clone)]
pub struct ProgressBoard {
    views: BTreeMap<ChannelId, ChannelView>,
}

impl Default for ProgressBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBoard {
    pub fn new() -> Self {
        let views = ChannelId::ALL
            .into_iter()
            .map(|channel| (channel, ChannelView::empty(channel)))
            .collect();
        Self { views }
    }

    /// Board seeded from persisted state, for a context that starts mid-operation.
    pub fn hydrate(store: &ProgressStore) -> Self {
        let views = ChannelId::ALL
            .into_iter()
            .map(|channel| {
                (
                    channel,
                    ChannelView {
                        record: store.read(channel),
                        modal_open: store.read_modal(channel),
                    },
                )
            })
            .collect();
        Self { views }
    }

    pub fn view(&self, channel: ChannelId) -> &ChannelView {
        // Every channel is inserted at construction and never removed.
        &self.views[&channel]
    }

    pub fn record(&self, channel: ChannelId) -> &ProgressRecord {
        &self.view(channel).record
    }

    /// Applies one event. Returns false when the board did not change, including for records
    /// that trail what is already shown.
    pub fn reduce(&mut self, event: &BusEvent) -> bool {
        let channel = event.channel();
        let Some(view) = self.views.get_mut(&channel) else {
            return false;
        };
        match event {
            BusEvent::ProgressUpdated { record, .. } => {
                if record.channel_id != channel || *record == view.record {
                    return false;
                }
                if is_behind(&view.record, record) {
                    debug!(event = "board_skip_behind", channel = %channel);
                    return false;
                }
                view.record = record.clone();
                true
            }
            BusEvent::ModalOpened { .. } => !std::mem::replace(&mut view.modal_open, true),
            BusEvent::ModalClosed { .. } => std::mem::replace(&mut view.modal_open, false),
        }
    }

    pub fn summary(&self) -> Vec<ChannelSummary> {
        self.views
            .iter()
            .map(|(channel, view)| ChannelSummary {
                channel: *channel,
                is_processing: view.record.is_processing,
                total: view.record.total,
                processed: view.record.processed(),
                successful: view.record.successful,
                failed: view.record.failed,
                pending: view.record.pending(),
                percent: view.record.percent_complete(),
                modal_open: view.modal_open,
            })
            .collect()
    }

    pub fn active_channels(&self) -> Vec<ChannelId> {
        self.views
            .iter()
            .filter(|(_, view)| view.record.is_processing)
            .map(|(channel, _)| *channel)
            .collect()
    }
}

/// Events can reach a board out of order through the two propagation paths; an older state
/// of the operation already shown must not roll the view back. A zeroed record always applies.
fn is_behind(shown: &ProgressRecord, incoming: &ProgressRecord) -> bool {
    if incoming.is_idle() || shown.operation_id != incoming.operation_id {
        return false;
    }
    if shown.is_idle() {
        return false;
    }
    if incoming.is_processing && !shown.is_processing {
        return true;
    }
    incoming.is_processing == shown.is_processing
        && incoming.raw_processed() < shown.raw_processed()
}
