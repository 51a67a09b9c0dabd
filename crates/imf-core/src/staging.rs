//! Staging Area Manager.

use tracing::info;

use crate::error::RefreshError;
use crate::TableStore;

pub struct StagingArea<'a> {
    store: &'a dyn TableStore,
}

impl<'a> StagingArea<'a> {
    pub fn new(store: &'a dyn TableStore) -> Self {
        Self { store }
    }

    /// Make `staging` exist with `production`'s shape and hold no rows.
    ///
    /// Safe to call at the start of every run: a staging table left full by
    /// a previous swap or half-filled by a crashed run is emptied. A missing
    /// production table is created empty first so the first-ever run has a
    /// template to clone.
    pub async fn prepare(&self, production: &str, staging: &str) -> Result<(), RefreshError> {
        let fail = |source| RefreshError::StagingPrepare {
            table: staging.to_string(),
            source,
        };
        self.store.ensure_table(production).await.map_err(fail)?;
        self.store
            .create_table_like(staging, production)
            .await
            .map_err(fail)?;
        self.store.truncate(staging).await.map_err(fail)?;
        info!("Staging table {} ready", staging);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<String>>,
        fail_truncate: bool,
    }

    #[async_trait]
    impl TableStore for RecordingStore {
        async fn ensure_table(&self, name: &str) -> Result<(), StoreError> {
            self.calls.lock().unwrap().push(format!("ensure {name}"));
            Ok(())
        }
        async fn create_table_like(&self, new_name: &str, template: &str) -> Result<(), StoreError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {new_name} like {template}"));
            Ok(())
        }
        async fn truncate(&self, name: &str) -> Result<(), StoreError> {
            if self.fail_truncate {
                return Err(StoreError::Rejected("locked".into()));
            }
            self.calls.lock().unwrap().push(format!("truncate {name}"));
            Ok(())
        }
        async fn swap(&self, _a: &str, _b: &str) -> Result<(), StoreError> {
            unreachable!("staging never swaps")
        }
    }

    #[tokio::test]
    async fn prepare_creates_then_truncates() {
        let store = RecordingStore::default();
        StagingArea::new(&store).prepare("P", "P_STAGING").await.unwrap();
        assert_eq!(
            *store.calls.lock().unwrap(),
            vec!["ensure P", "create P_STAGING like P", "truncate P_STAGING"]
        );
    }

    #[tokio::test]
    async fn truncate_failure_is_staging_error() {
        let store = RecordingStore {
            fail_truncate: true,
            ..Default::default()
        };
        let err = StagingArea::new(&store)
            .prepare("P", "P_STAGING")
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::StagingPrepare { ref table, .. } if table == "P_STAGING"));
    }
}
