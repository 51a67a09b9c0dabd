//! Swap Coordinator.

use tracing::info;

use crate::error::RefreshError;
use crate::watcher::CommitReceipt;
use crate::TableStore;

pub struct SwapCoordinator<'a> {
    store: &'a dyn TableStore,
}

impl<'a> SwapCoordinator<'a> {
    pub fn new(store: &'a dyn TableStore) -> Self {
        Self { store }
    }

    /// Exchange staging and production in one store-native operation.
    ///
    /// Afterwards `production` holds the freshly loaded rows and `staging`
    /// holds the previous production rows until the next run truncates them.
    pub async fn swap(
        &self,
        production: &str,
        staging: &str,
        receipt: CommitReceipt,
    ) -> Result<(), RefreshError> {
        self.store
            .swap(production, staging)
            .await
            .map_err(|source| RefreshError::Swap {
                production: production.to_string(),
                staging: staging.to_string(),
                source,
            })?;
        info!(
            last_token = ?receipt.last_token(),
            "Swapped {} -> {}", staging, production
        );
        Ok(())
    }
}
