//! Progress synchronization: merges push, poll and local deltas into one persisted record per
//! channel and fans the result out to every context sharing the store.

use psync_core::push::PushError;
use psync_core::ChannelId;
use psync_storage::StorageError;
use thiserror::Error;

pub mod bus;
pub mod completion;
pub mod context;
pub mod ingest;
pub mod merge;
pub mod poller;
pub mod projection;

pub use bus::{BusSubscription, CrossContextBus};
pub use completion::{CompletionDetector, Phase, Transition};
pub use context::SyncContext;
pub use ingest::PushIngestor;
pub use merge::{MergeEffect, MergeEngine, MergeOutcome};
pub use poller::{
    resync, AuthoritativeSnapshot, FetchError, PollStatus, ReconciliationPoller,
    ReconciliationSupervisor, SnapshotSource,
};
pub use projection::{ChannelSummary, ChannelView, ProgressBoard};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Push(#[from] PushError),
    #[error("no active operation on channel {0}")]
    NoOperation(ChannelId),
    #[error("merge did not run for channel {0}")]
    MergeNotRun(ChannelId),
}
