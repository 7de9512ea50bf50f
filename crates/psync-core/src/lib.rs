use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub mod bus;
pub mod config;
pub mod push;
pub mod wire;

/// Upper bound on `ProgressRecord::recent_items`.
pub const RECENT_ITEMS_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelId {
    BulkMutation,
    Import,
    Campaign,
}

impl ChannelId {
    pub const ALL: [ChannelId; 3] = [
        ChannelId::BulkMutation,
        ChannelId::Import,
        ChannelId::Campaign,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelId::BulkMutation => "bulk_mutation",
            ChannelId::Import => "import",
            ChannelId::Campaign => "campaign",
        }
    }

    /// Key of the persisted progress record.
    pub fn store_key(&self) -> String {
        format!("progress:{}", self.as_str())
    }

    /// Key of the persisted modal visibility flag.
    pub fn modal_key(&self) -> String {
        format!("progress_modal:{}", self.as_str())
    }

    pub fn from_store_key(key: &str) -> Option<Self> {
        key.strip_prefix("progress:")
            .and_then(|name| name.parse().ok())
    }

    pub fn from_modal_key(key: &str) -> Option<Self> {
        key.strip_prefix("progress_modal:")
            .and_then(|name| name.parse().ok())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelId {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "bulk_mutation" | "bulk-mutation" | "bulk" => Ok(ChannelId::BulkMutation),
            "import" => Ok(ChannelId::Import),
            "campaign" => Ok(ChannelId::Campaign),
            other => Err(format!("Unknown channel: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Failed,
    Pending,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
            ItemStatus::Pending => "pending",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Success | ItemStatus::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "success" | "successful" | "sent" | "delivered" | "read" | "completed" => {
                Ok(ItemStatus::Success)
            }
            "failed" | "failure" | "error" => Ok(ItemStatus::Failed),
            "pending" | "queued" | "sending" | "processing" => Ok(ItemStatus::Pending),
            other => Err(format!("Unknown item status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Processing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Processing)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "processing" | "in_progress" | "in-progress" | "running" | "started" => {
                Ok(OperationStatus::Processing)
            }
            "completed" | "complete" | "done" | "finished" => Ok(OperationStatus::Completed),
            "failed" | "error" | "cancelled" | "canceled" => Ok(OperationStatus::Failed),
            other => Err(format!("Unknown operation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentItem {
    pub item_id: String,
    #[serde(default)]
    pub label: String,
    pub status: ItemStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    #[default]
    Delete,
    Restore,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkMeta {
    #[serde(default)]
    pub action: BulkAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMeta {
    #[serde(default)]
    pub duplicates: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub no_whatsapp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignMeta {
    #[serde(default)]
    pub schedule_id: Option<String>,
    #[serde(default)]
    pub schedule_name: Option<String>,
    #[serde(default)]
    pub campaign_kind: Option<String>,
    #[serde(default)]
    pub batch_count: u64,
    #[serde(default)]
    pub batches_done: u64,
}

/// Channel-specific metadata carried alongside the shared counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelMeta {
    #[default]
    None,
    BulkMutation(BulkMeta),
    Import(ImportMeta),
    Campaign(CampaignMeta),
}

impl ChannelMeta {
    /// Folds metadata from a newer delta into `self`.
    ///
    /// Cumulative counters (`duplicates`, `batches_done`, ...) only move forward, and campaign
    /// identity fields are kept when the incoming delta leaves them unset.
    pub fn absorb(&mut self, incoming: &ChannelMeta) {
        match (&mut *self, incoming) {
            (_, ChannelMeta::None) => {}
            (ChannelMeta::Import(current), ChannelMeta::Import(next)) => {
                current.duplicates = current.duplicates.max(next.duplicates);
                current.updated = current.updated.max(next.updated);
                current.no_whatsapp = current.no_whatsapp.max(next.no_whatsapp);
            }
            (ChannelMeta::Campaign(current), ChannelMeta::Campaign(next)) => {
                if next.schedule_id.is_some() {
                    current.schedule_id = next.schedule_id.clone();
                }
                if next.schedule_name.is_some() {
                    current.schedule_name = next.schedule_name.clone();
                }
                if next.campaign_kind.is_some() {
                    current.campaign_kind = next.campaign_kind.clone();
                }
                if next.batch_count > 0 {
                    current.batch_count = next.batch_count;
                }
                current.batches_done = current.batches_done.max(next.batches_done);
            }
            (current, next) => *current = next.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub is_processing: bool,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub successful: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub recent_items: Vec<RecentItem>,
    #[serde(default)]
    pub processed_item_ids: BTreeSet<String>,
    #[serde(default)]
    pub meta: ChannelMeta,
    #[serde(default)]
    pub outcome: Option<OperationStatus>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// The zeroed record: what readers see for an absent or unreadable channel.
    pub fn empty(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            operation_id: None,
            is_processing: false,
            total: 0,
            successful: 0,
            failed: 0,
            recent_items: Vec::new(),
            processed_item_ids: BTreeSet::new(),
            meta: ChannelMeta::None,
            outcome: None,
            started_at: None,
            updated_at: None,
        }
    }

    /// `successful + failed` without clamping.
    pub fn raw_processed(&self) -> u64 {
        self.successful.saturating_add(self.failed)
    }

    /// `successful + failed`, clamped to `total` once a total is known.
    pub fn processed(&self) -> u64 {
        let raw = self.raw_processed();
        if self.total > 0 {
            raw.min(self.total)
        } else {
            raw
        }
    }

    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.processed())
    }

    /// True when counters claim more work than `total` allows.
    pub fn has_diverged(&self) -> bool {
        self.total > 0 && self.raw_processed() > self.total
    }

    pub fn is_idle(&self) -> bool {
        !self.is_processing && self.total == 0
    }

    pub fn percent_complete(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = self.processed().saturating_mul(100) / self.total;
        pct.min(100) as u8
    }

    /// Inserts `item` newest-first, replacing any entry with the same id, and keeps at most
    /// `limit` entries ordered by timestamp descending (ties broken by item id).
    pub fn push_recent(&mut self, item: RecentItem, limit: usize) {
        self.recent_items.retain(|existing| existing.item_id != item.item_id);
        self.recent_items.insert(0, item);
        self.recent_items.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        self.recent_items.truncate(limit);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStart {
    #[serde(default)]
    pub operation_id: Option<String>,
    pub total: u64,
    #[serde(default)]
    pub meta: ChannelMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDelta {
    pub item_id: String,
    /// Operation the item belongs to, when the sender knows it.
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub label: String,
    /// Raw status as delivered; parsed by the merge so unknown values can be reported.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDelta {
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    pub successful: u64,
    pub failed: u64,
    pub status: OperationStatus,
    #[serde(default)]
    pub meta: Option<ChannelMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeltaBody {
    Started(OperationStart),
    Item(ItemDelta),
    Snapshot(SnapshotDelta),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub channel: ChannelId,
    pub observed_at: DateTime<Utc>,
    pub body: DeltaBody,
}

impl Delta {
    pub fn started(
        channel: ChannelId,
        operation_id: Option<String>,
        total: u64,
        meta: ChannelMeta,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            channel,
            observed_at,
            body: DeltaBody::Started(OperationStart {
                operation_id,
                total,
                meta,
            }),
        }
    }

    pub fn item(
        channel: ChannelId,
        item_id: impl Into<String>,
        label: impl Into<String>,
        status: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            channel,
            observed_at,
            body: DeltaBody::Item(ItemDelta {
                item_id: item_id.into(),
                operation_id: None,
                label: label.into(),
                status: status.into(),
            }),
        }
    }

    pub fn snapshot(channel: ChannelId, snapshot: SnapshotDelta, observed_at: DateTime<Utc>) -> Self {
        Self {
            channel,
            observed_at,
            body: DeltaBody::Snapshot(snapshot),
        }
    }

    /// Scopes a per-item delta to one operation; other bodies are returned unchanged.
    pub fn for_operation(mut self, operation_id: impl Into<String>) -> Self {
        if let DeltaBody::Item(item) = &mut self.body {
            item.operation_id = Some(operation_id.into());
        }
        self
    }

    pub fn item_id(&self) -> Option<&str> {
        match &self.body {
            DeltaBody::Item(item) => Some(item.item_id.as_str()),
            _ => None,
        }
    }
}
