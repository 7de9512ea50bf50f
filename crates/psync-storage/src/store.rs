use crate::{KeyValueBackend, MemoryBackend, SqliteBackend, StorageError};
use psync_core::{ChannelId, ProgressRecord};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Notification raised by every write, delivered to the other contexts sharing the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// `None` when the key was removed.
    pub value: Option<String>,
    pub origin: String,
}

struct HubInner {
    backend: Arc<dyn KeyValueBackend>,
    changes: broadcast::Sender<StorageChange>,
}

/// Shared persistence for every context: one backend plus the storage-change feed.
#[derive(Clone)]
pub struct StoreHub {
    inner: Arc<HubInner>,
}

impl StoreHub {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(HubInner { backend, changes }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn sqlite(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(SqliteBackend::open(path)?)))
    }

    /// A store handle for one context; writes made through it are reported to all others.
    pub fn context(&self, context_id: impl Into<String>) -> ProgressStore {
        ProgressStore {
            inner: self.inner.clone(),
            context_id: context_id.into(),
        }
    }
}

#[derive(Clone)]
pub struct ProgressStore {
    inner: Arc<HubInner>,
    context_id: String,
}

impl ProgressStore {
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Current record for `channel`; absent, unreadable or corrupt data yields the empty record.
    pub fn read(&self, channel: ChannelId) -> ProgressRecord {
        match self.inner.backend.get(&channel.store_key()) {
            Ok(Some(raw)) => decode_record(channel, &raw),
            Ok(None) => ProgressRecord::empty(channel),
            Err(err) => {
                warn!(
                    event = "progress_store_read_error",
                    channel = %channel,
                    error = %err
                );
                ProgressRecord::empty(channel)
            }
        }
    }

    pub fn write(&self, channel: ChannelId, record: &ProgressRecord) -> Result<(), StorageError> {
        let key = channel.store_key();
        let encoded = serde_json::to_string(record)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.inner.backend.put(&key, &encoded)?;
        self.notify(key, Some(encoded));
        Ok(())
    }

    pub fn clear(&self, channel: ChannelId) -> Result<(), StorageError> {
        let key = channel.store_key();
        self.inner.backend.delete(&key)?;
        self.notify(key, None);
        Ok(())
    }

    /// Read-modify-write of one channel's record, atomic with respect to the backend.
    ///
    /// `apply` receives the current record (empty when absent) and returns the record to
    /// persist, or `None` to leave the store untouched. Returns what was written.
    pub fn update<F>(
        &self,
        channel: ChannelId,
        apply: F,
    ) -> Result<Option<ProgressRecord>, StorageError>
    where
        F: FnOnce(ProgressRecord) -> Option<ProgressRecord>,
    {
        let key = channel.store_key();
        let mut apply = Some(apply);
        let mut written_record = None;
        let mut encode_error = None;

        let written = self.inner.backend.update(&key, &mut |raw| {
            let current = raw
                .map(|raw| decode_record(channel, raw))
                .unwrap_or_else(|| ProgressRecord::empty(channel));
            let apply = apply.take()?;
            let next = apply(current)?;
            match serde_json::to_string(&next) {
                Ok(encoded) => {
                    written_record = Some(next);
                    Some(encoded)
                }
                Err(err) => {
                    encode_error = Some(err.to_string());
                    None
                }
            }
        })?;

        if let Some(err) = encode_error {
            return Err(StorageError::Serialization(err));
        }
        if let Some(encoded) = written {
            self.notify(key, Some(encoded));
        }
        Ok(written_record)
    }

    pub fn read_modal(&self, channel: ChannelId) -> bool {
        match self.inner.backend.get(&channel.modal_key()) {
            Ok(Some(raw)) => decode_modal(&raw),
            Ok(None) => false,
            Err(err) => {
                warn!(event = "progress_modal_read_error", channel = %channel, error = %err);
                false
            }
        }
    }

    pub fn write_modal(&self, channel: ChannelId, open: bool) -> Result<(), StorageError> {
        let key = channel.modal_key();
        let encoded = if open { "true" } else { "false" }.to_string();
        self.inner.backend.put(&key, &encoded)?;
        self.notify(key, Some(encoded));
        Ok(())
    }

    /// Storage changes written by other contexts.
    pub fn changes(&self) -> ChangeFeed {
        ChangeFeed {
            rx: self.inner.changes.subscribe(),
            context_id: self.context_id.clone(),
        }
    }

    fn notify(&self, key: String, value: Option<String>) {
        let change = StorageChange {
            key,
            value,
            origin: self.context_id.clone(),
        };
        // No receivers is fine: nobody else is listening yet.
        if self.inner.changes.send(change).is_err() {
            debug!(event = "progress_store_no_listeners", context = %self.context_id);
        }
    }
}

pub struct ChangeFeed {
    rx: broadcast::Receiver<StorageChange>,
    context_id: String,
}

impl ChangeFeed {
    /// Next change from another context; `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.origin == self.context_id => continue,
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        event = "progress_change_feed_lagged",
                        context = %self.context_id,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Decodes a persisted record, falling back to the empty record on any defect.
pub fn decode_record(channel: ChannelId, raw: &str) -> ProgressRecord {
    match serde_json::from_str::<ProgressRecord>(raw) {
        Ok(record) if record.channel_id == channel => record,
        Ok(record) => {
            warn!(
                event = "progress_record_channel_mismatch",
                channel = %channel,
                found = %record.channel_id
            );
            ProgressRecord::empty(channel)
        }
        Err(err) => {
            warn!(
                event = "progress_record_decode_error",
                channel = %channel,
                error = %err
            );
            ProgressRecord::empty(channel)
        }
    }
}

fn decode_modal(raw: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(raw),
        Ok(serde_json::Value::Bool(true))
    )
}
