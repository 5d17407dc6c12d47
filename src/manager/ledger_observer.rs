//! Scanner observer that applies results to the application ledgers

use async_trait::async_trait;
use std::sync::Weak;
use tracing::{debug, warn};

use super::WalletManager;
use crate::error::Result;
use crate::scanner::{ExtractResult, Observer};

/// Routes each result to the stores named by its source keys, then
/// forwards it to the manager's own observers
pub(crate) struct LedgerObserver {
    manager: Weak<WalletManager>,
}

impl LedgerObserver {
    pub(crate) fn new(manager: Weak<WalletManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Observer for LedgerObserver {
    async fn on_extract_result(&self, result: &ExtractResult) -> Result<()> {
        let Some(manager) = self.manager.upgrade() else {
            debug!("Wallet manager dropped, ignoring {} tx {}", result.symbol, result.tx_id);
            return Ok(());
        };

        let model = manager.adapter(&result.symbol)?.model();

        for app_id in result.source_keys() {
            let applied = match manager.open_db(app_id).await {
                Ok(store) => store.apply_extract_result(result, model).await,
                Err(e) => Err(e),
            };
            if let Err(e) = applied {
                warn!(
                    "[{}] Failed to apply {} tx {}: {}",
                    app_id, result.symbol, result.tx_id, e
                );
            }
        }

        manager.observers().notify(result).await;
        Ok(())
    }
}
