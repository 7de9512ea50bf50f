use psync_core::bus::BusEvent;
use psync_core::ChannelId;
use psync_storage::{decode_record, ChangeFeed, ProgressStore, StorageChange};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const LOCAL_BUS_CAPACITY: usize = 128;

/// Fan-out of progress events: in-process subscribers of this context, plus every write made
/// by other contexts sharing the store.
#[derive(Clone)]
pub struct CrossContextBus {
    local: broadcast::Sender<BusEvent>,
    store: ProgressStore,
}

impl CrossContextBus {
    pub fn new(store: ProgressStore) -> Self {
        let (local, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { local, store }
    }

    /// Called after the store write; other contexts learn of it through the change feed.
    pub fn publish(&self, event: BusEvent) {
        debug!(
            event = "bus_publish",
            name = event.name(),
            channel = %event.channel(),
            context = %self.store.context_id()
        );
        let _ = self.local.send(event);
    }

    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            local: self.local.subscribe(),
            feed: self.store.changes(),
        }
    }
}

pub struct BusSubscription {
    local: broadcast::Receiver<BusEvent>,
    feed: ChangeFeed,
}

impl BusSubscription {
    /// Next event from either path; `None` once the owning context or the store is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            tokio::select! {
                local = self.local.recv() => match local {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "bus_subscriber_lagged", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                change = self.feed.recv() => {
                    let change = change?;
                    if let Some(event) = event_from_change(&change) {
                        return Some(event);
                    }
                }
            }
        }
    }
}

/// Rebuilds the bus event another context would have published for `change`.
pub fn event_from_change(change: &StorageChange) -> Option<BusEvent> {
    if let Some(channel) = ChannelId::from_store_key(&change.key) {
        let record = match change.value.as_deref() {
            Some(raw) => decode_record(channel, raw),
            None => psync_core::ProgressRecord::empty(channel),
        };
        return Some(BusEvent::updated(record));
    }
    if let Some(channel) = ChannelId::from_modal_key(&change.key) {
        let open = change.value.as_deref().map(str::trim) == Some("true");
        return Some(BusEvent::modal(channel, open));
    }
    debug!(event = "bus_unrelated_change", key = %change.key);
    None
}
