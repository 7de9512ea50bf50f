use psync_core::ChannelId;
use psync_engine::{AuthoritativeSnapshot, FetchError, SnapshotSource};
use psync_storage::OperationLedger;
use std::sync::Arc;
use tracing::debug;

/// Reads authoritative snapshots from the `operations` table the job runners keep current.
#[derive(Clone)]
pub struct LedgerSource {
    ledger: Arc<OperationLedger>,
}

impl LedgerSource {
    pub fn new(ledger: Arc<OperationLedger>) -> Self {
        Self { ledger }
    }
}

impl SnapshotSource for LedgerSource {
    async fn fetch(
        &self,
        channel: ChannelId,
        operation_id: &str,
    ) -> Result<AuthoritativeSnapshot, FetchError> {
        let ledger = self.ledger.clone();
        let lookup_id = operation_id.to_string();
        let row = tokio::task::spawn_blocking(move || ledger.lookup(&lookup_id))
            .await
            .map_err(|err| FetchError::Unavailable(err.to_string()))?
            .map_err(|err| FetchError::Unavailable(err.to_string()))?;

        match row {
            Some(row) if row.channel == channel => Ok(row.into()),
            Some(row) => {
                debug!(
                    event = "ledger_channel_mismatch",
                    operation_id = %operation_id,
                    expected = %channel,
                    found = %row.channel
                );
                Err(FetchError::NotFound(operation_id.to_string()))
            }
            None => Err(FetchError::NotFound(operation_id.to_string())),
        }
    }
}
