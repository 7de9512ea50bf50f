use crate::{ChannelId, ProgressRecord};
use serde::{Deserialize, Serialize};

pub const PROGRESS_UPDATED: &str = "progress:updated";
pub const MODAL_OPENED: &str = "progress:modalOpened";
pub const MODAL_CLOSED: &str = "progress:modalClosed";

/// Payload contract shared by the same-context and cross-context propagation paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum BusEvent {
    #[serde(rename = "progress:updated")]
    ProgressUpdated {
        channel: ChannelId,
        record: ProgressRecord,
    },
    #[serde(rename = "progress:modalOpened")]
    ModalOpened { channel: ChannelId },
    #[serde(rename = "progress:modalClosed")]
    ModalClosed { channel: ChannelId },
}

impl BusEvent {
    pub fn updated(record: ProgressRecord) -> Self {
        BusEvent::ProgressUpdated {
            channel: record.channel_id,
            record,
        }
    }

    pub fn modal(channel: ChannelId, open: bool) -> Self {
        if open {
            BusEvent::ModalOpened { channel }
        } else {
            BusEvent::ModalClosed { channel }
        }
    }

    pub fn channel(&self) -> ChannelId {
        match self {
            BusEvent::ProgressUpdated { channel, .. }
            | BusEvent::ModalOpened { channel }
            | BusEvent::ModalClosed { channel } => *channel,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::ProgressUpdated { .. } => PROGRESS_UPDATED,
            BusEvent::ModalOpened { .. } => MODAL_OPENED,
            BusEvent::ModalClosed { .. } => MODAL_CLOSED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_serialized_tags() {
        let events = [
            BusEvent::updated(ProgressRecord::empty(ChannelId::Import)),
            BusEvent::modal(ChannelId::Campaign, true),
            BusEvent::modal(ChannelId::Campaign, false),
        ];
        for event in events {
            let value = serde_json::to_value(&event).expect("serialize");
            assert_eq!(value["event"], event.name());
        }
    }

    #[test]
    fn updated_event_carries_record_channel() {
        let event = BusEvent::updated(ProgressRecord::empty(ChannelId::BulkMutation));
        assert_eq!(event.channel(), ChannelId::BulkMutation);
    }
}
