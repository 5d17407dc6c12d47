//! Symbol → adapter registry
//!
//! Built once at startup and shared read-only afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::AssetAdapter;
use crate::error::{Error, Result};

/// Maps chain symbols to their adapters
#[derive(Default, Clone)]
pub struct AssetRegistry {
    adapters: BTreeMap<String, Arc<dyn AssetAdapter>>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own symbol, replacing any previous one
    pub fn register(&mut self, adapter: Arc<dyn AssetAdapter>) {
        let symbol = normalize(adapter.symbol());
        info!("Registered {} adapter ({})", symbol, adapter.model());
        self.adapters.insert(symbol, adapter);
    }

    /// Builder-style registration
    pub fn with(mut self, adapter: Arc<dyn AssetAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Adapter for `symbol` (case-insensitive)
    pub fn get(&self, symbol: &str) -> Result<Arc<dyn AssetAdapter>> {
        self.adapters
            .get(&normalize(symbol))
            .cloned()
            .ok_or_else(|| Error::UnsupportedAsset(symbol.to_string()))
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.adapters.contains_key(&normalize(symbol))
    }

    /// Registered symbols in sorted order
    pub fn symbols(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

fn normalize(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}
