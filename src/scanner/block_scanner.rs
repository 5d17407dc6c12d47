//! Block scanner
//!
//! Polls one chain block by block, matches every transaction against the
//! watched-address set and hands the matches to observers before the scan
//! height advances. Reorgs are detected through the parent hash of each
//! new block and stall the scanner until a rescan height is set.
//!
//! With a checkpoint attached, the scan state is written to disk after every
//! block so a restarted process resumes where it stopped.

use backoff::{future::retry, ExponentialBackoff};
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::observer::{Observer, ObserverHandle, ObserverRegistry};
use super::scan_state::{PendingReorg, ScanState};
use super::task::{ScanTask, TaskState};
use super::types::{CycleReport, ExtractResult, Recharge, SpentInput};
use crate::assets::{Block, BlockSource, ChainTransaction};
use crate::config::ScannerConfig;
use crate::error::{Error, Result};

/// Lifecycle of a [`BlockScanner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerStatus {
    /// No task, or a task that has not been run
    Idle,
    Running,
    Paused,
    /// Terminal until [`BlockScanner::reinitialize`]
    Stopped,
}

/// Scanner for one chain
pub struct BlockScanner {
    symbol: String,
    source: Arc<dyn BlockSource>,
    config: ScannerConfig,
    /// address → source key
    addresses: DashMap<String, String>,
    state: tokio::sync::Mutex<ScanState>,
    observers: ObserverRegistry,
    task: Mutex<Option<Arc<ScanTask>>>,
    checkpoint: Mutex<Option<PathBuf>>,
}

impl BlockScanner {
    pub fn new(symbol: impl Into<String>, source: Arc<dyn BlockSource>, config: ScannerConfig) -> Self {
        Self {
            symbol: symbol.into(),
            source,
            config,
            addresses: DashMap::new(),
            state: tokio::sync::Mutex::new(ScanState::new()),
            observers: ObserverRegistry::new(),
            task: Mutex::new(None),
            checkpoint: Mutex::new(None),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    // ---- task control ----

    /// Install a task. No-op returning false when one is already set.
    pub fn set_task(&self, task: ScanTask) -> bool {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            debug!("{} scanner already has a task", self.symbol);
            return false;
        }
        *slot = Some(Arc::new(task));
        true
    }

    /// Install the standard task: one [`scan_cycle`](Self::scan_cycle) per configured period
    pub fn set_scan_task(self: &Arc<Self>) -> bool {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = ScanTask::new(self.config.period(), move || {
            let weak = weak.clone();
            async move {
                let Some(scanner) = weak.upgrade() else {
                    return;
                };
                match scanner.scan_cycle().await {
                    Ok(report) if !report.scanned.is_empty() => debug!(
                        "{} scanned {:?}, delivered {}",
                        scanner.symbol, report.scanned, report.delivered
                    ),
                    Ok(_) => {}
                    Err(Error::ReorgDetected { .. }) => {}
                    Err(e) => warn!("{} scan cycle failed: {}", scanner.symbol, e),
                }
            }
            .boxed()
        });
        self.set_task(task)
    }

    fn current_task(&self) -> Option<Arc<ScanTask>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> ScannerStatus {
        match self.current_task().map(|t| t.state()) {
            None | Some(TaskState::Ready) => ScannerStatus::Idle,
            Some(TaskState::Running) => ScannerStatus::Running,
            Some(TaskState::Paused) => ScannerStatus::Paused,
            Some(TaskState::Stopped) => ScannerStatus::Stopped,
        }
    }

    /// Start scanning, or resume when paused
    pub fn run(&self) -> Result<()> {
        let task = self
            .current_task()
            .ok_or_else(|| Error::ScannerNotConfigured(self.symbol.clone()))?;

        match task.state() {
            TaskState::Running => {
                warn!("{} scanner is already running", self.symbol);
            }
            TaskState::Ready => {
                task.restart();
                task.start();
                info!("{} scanner started, period {:?}", self.symbol, task.period());
            }
            TaskState::Paused => {
                task.restart();
                info!("{} scanner resumed", self.symbol);
            }
            TaskState::Stopped => return Err(Error::ScannerStopped(self.symbol.clone())),
        }
        Ok(())
    }

    /// Suspend scanning at the next cycle boundary
    pub fn pause(&self) {
        match self.current_task() {
            Some(task) => {
                task.pause();
                info!("{} scanner paused", self.symbol);
            }
            None => warn!("{} scanner has no task to pause", self.symbol),
        }
    }

    /// Resume after [`pause`](Self::pause)
    pub fn restart(&self) {
        match self.current_task() {
            Some(task) => {
                task.restart();
                info!("{} scanner restarted", self.symbol);
            }
            None => warn!("{} scanner has no task to restart", self.symbol),
        }
    }

    /// Stop scanning for good, waiting for an in-flight cycle
    pub async fn stop(&self) {
        if let Some(task) = self.current_task() {
            task.stop().await;
            info!("{} scanner stopped", self.symbol);
        }
    }

    /// Leave the stopped state: drops the task and forgets scan progress.
    ///
    /// Watched addresses and observers are kept. The checkpoint is detached
    /// and left on disk; attaching it again restores the saved progress.
    pub async fn reinitialize(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.stop().await;
        }
        self.checkpoint.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.state.lock().await.clear();
        info!("{} scanner reinitialized", self.symbol);
    }

    // ---- checkpoint ----

    /// Persist scan progress to `path` from now on, restoring it first when the file exists.
    ///
    /// Returns true when progress was restored. A file that cannot be read
    /// leaves the scanner without a checkpoint.
    pub async fn attach_checkpoint(&self, path: impl Into<PathBuf>) -> Result<bool> {
        let path = path.into();
        let mut state = self.state.lock().await;

        let restored = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let saved: ScanState = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Deserialization(format!("{}: {}", path.display(), e)))?;
                info!(
                    "{} scanner resumes after block {:?} ({} recent deliveries)",
                    self.symbol,
                    saved.last_scanned_block,
                    saved.delivered_count()
                );
                *state = saved;
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(Error::Persistence(format!("{}: {}", path.display(), e))),
        };

        *self.checkpoint.lock().unwrap_or_else(|e| e.into_inner()) = Some(path);
        Ok(restored)
    }

    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.checkpoint.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn save_checkpoint(&self, state: &ScanState) {
        let Some(path) = self.checkpoint_path() else {
            return;
        };
        if let Err(e) = write_checkpoint(&path, state).await {
            warn!("{} scan checkpoint not saved: {}", self.symbol, e);
        }
    }

    // ---- watched addresses ----

    /// Watch `address` on behalf of `source_key`. Re-adding overwrites the key.
    pub fn add_address(&self, address: impl Into<String>, source_key: impl Into<String>) {
        self.addresses.insert(address.into(), source_key.into());
    }

    pub fn is_exist_address(&self, address: &str) -> bool {
        self.addresses.contains_key(address)
    }

    pub fn source_key_of(&self, address: &str) -> Option<String> {
        self.addresses.get(address).map(|entry| entry.value().clone())
    }

    pub fn address_count(&self) -> usize {
        self.addresses.len()
    }

    /// Forget all watched addresses; the task keeps running
    pub fn clear(&self) {
        self.addresses.clear();
        debug!("{} scanner address set cleared", self.symbol);
    }

    // ---- observers ----

    pub fn add_observer(&self, observer: Arc<dyn Observer>) -> ObserverHandle {
        self.observers.subscribe(observer)
    }

    pub fn remove_observer(&self, handle: ObserverHandle) -> bool {
        self.observers.unsubscribe(handle)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    // ---- scan height ----

    /// Last fully delivered height, None before the first block
    pub async fn get_scanned_block_height(&self) -> Option<u64> {
        self.state.lock().await.last_scanned_block
    }

    /// Make `height` the next block scanned. Clears a pending reorg.
    pub async fn set_rescan_block_height(&self, height: u64) {
        let mut state = self.state.lock().await;
        state.rewind_to(height);
        self.save_checkpoint(&state).await;
        info!("{} scanner will rescan from block {}", self.symbol, height);
    }

    /// Reorg the scanner is waiting on, if any
    pub async fn pending_reorg(&self) -> Option<PendingReorg> {
        self.state.lock().await.pending_reorg.clone()
    }

    // ---- scanning ----

    /// Run one cycle: scan up to `max_blocks_per_cycle` blocks past the last scanned height
    pub async fn scan_cycle(&self) -> Result<CycleReport> {
        let mut state = self.state.lock().await;

        if let Some(reorg) = &state.pending_reorg {
            warn!(
                "{} scanner waiting on reorg at block {} (fork point {:?})",
                self.symbol, reorg.height, reorg.fork_point
            );
            return Err(reorg_error(reorg));
        }

        let source = self.source.clone();
        let tip = self
            .with_retry("current_height", || {
                let source = source.clone();
                async move { source.current_height().await }
            })
            .await?;

        let mut report = CycleReport {
            tip,
            ..Default::default()
        };
        let start = self.config.start_height.unwrap_or(tip);

        for _ in 0..self.config.max_blocks_per_cycle.max(1) {
            let height = state.next_block_to_scan(start);
            if height > tip {
                break;
            }

            let block = self
                .with_retry("fetch_block", || {
                    let source = source.clone();
                    async move { source.fetch_block(height).await }
                })
                .await?;

            if let Some(expected) = state.expected_parent_hash(height) {
                if expected != block.prev_hash {
                    let reorg = PendingReorg {
                        height,
                        expected: expected.to_string(),
                        actual: block.prev_hash.clone(),
                        fork_point: state.find_fork_point(&block.prev_hash),
                    };
                    warn!(
                        "{} reorg detected at block {}: expected parent {}, got {} (fork point {:?})",
                        self.symbol, height, reorg.expected, reorg.actual, reorg.fork_point
                    );
                    let err = reorg_error(&reorg);
                    state.pending_reorg = Some(reorg);
                    self.save_checkpoint(&state).await;
                    return Err(err);
                }
            }

            for tx in &block.transactions {
                if state.is_delivered(&tx.tx_id) {
                    debug!("{} tx {} already delivered, skipping", self.symbol, tx.tx_id);
                    report.duplicates += 1;
                    continue;
                }
                if let Some(result) = self.extract_transaction(&block, tx) {
                    self.observers.notify(&result).await;
                    state.mark_delivered(&tx.tx_id, height);
                    report.delivered += 1;
                }
            }

            state.add_block(height, block.hash.clone());
            state.prune_delivered(height, self.config.dedup_window);
            self.save_checkpoint(&state).await;
            report.scanned.push(height);
        }

        Ok(report)
    }

    /// Result for `tx` when it touches a watched address
    pub fn extract_transaction(&self, block: &Block, tx: &ChainTransaction) -> Option<ExtractResult> {
        let recharges: Vec<Recharge> = tx
            .outputs
            .iter()
            .filter_map(|output| {
                let address = output.address.as_deref()?;
                let source_key = self.source_key_of(address)?;
                Some(Recharge {
                    symbol: self.symbol.clone(),
                    source_key,
                    address: address.to_string(),
                    tx_id: tx.tx_id.clone(),
                    index: output.index,
                    amount: output.amount,
                    token: output.token.clone(),
                    block_height: block.height,
                    block_hash: block.hash.clone(),
                })
            })
            .collect();

        let spent: Vec<SpentInput> = tx
            .inputs
            .iter()
            .filter_map(|input| {
                let address = input.address.as_deref()?;
                let source_key = self.source_key_of(address)?;
                Some(SpentInput {
                    symbol: self.symbol.clone(),
                    source_key,
                    address: address.to_string(),
                    tx_id: tx.tx_id.clone(),
                    prev_out: input.prev_out.clone(),
                    amount: input.amount,
                    token: input.token.clone(),
                })
            })
            .collect();

        if recharges.is_empty() && spent.is_empty() {
            return None;
        }

        Some(ExtractResult {
            symbol: self.symbol.clone(),
            tx_id: tx.tx_id.clone(),
            block_height: block.height,
            block_hash: block.hash.clone(),
            recharges,
            spent,
            success: tx.failure.is_none(),
            reason: tx.failure.clone(),
        })
    }

    /// Retry transient backend errors with exponential backoff, bounded by `fetch_retries`
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.fetch_retries.max(1);
        let base = Duration::from_millis(self.config.retry_base_delay_ms);
        let policy = ExponentialBackoff {
            initial_interval: base,
            max_interval: base * 8,
            max_elapsed_time: None,
            ..Default::default()
        };

        let symbol = self.symbol.as_str();
        let mut attempt = 0u32;
        retry(policy, || {
            attempt += 1;
            let current = attempt;
            let fut = op();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retryable() && current < max_attempts => {
                        warn!(
                            "{} {} failed, attempt {}/{}: {}",
                            symbol, what, current, max_attempts, e
                        );
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await
    }
}

/// Write through a temporary file and rename over `path`
async fn write_checkpoint(path: &Path, state: &ScanState) -> Result<()> {
    let json = serde_json::to_vec(state)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| Error::Persistence(format!("{}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::Persistence(format!("{}: {}", path.display(), e)))?;
    Ok(())
}

fn reorg_error(reorg: &PendingReorg) -> Error {
    Error::ReorgDetected {
        height: reorg.height,
        expected: reorg.expected.clone(),
        actual: reorg.actual.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{TxInput, TxOutput};
    use crate::error::ErrorCategory;
    use crate::ledger::types::OutPoint;
    use crate::test_utils::{pay, MockBackend};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Collect {
        results: StdMutex<Vec<ExtractResult>>,
    }

    #[async_trait]
    impl Observer for Collect {
        async fn on_extract_result(&self, result: &ExtractResult) -> Result<()> {
            self.results.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    fn scanner_config(start: u64) -> ScannerConfig {
        ScannerConfig {
            start_height: Some(start),
            retry_base_delay_ms: 1,
            ..Default::default()
        }
    }

    fn setup(start: u64) -> (Arc<MockBackend>, Arc<BlockScanner>, Arc<Collect>) {
        let backend = MockBackend::new();
        let scanner = Arc::new(BlockScanner::new("BTC", backend.clone(), scanner_config(start)));
        let collect = Arc::new(Collect::default());
        scanner.add_observer(collect.clone());
        (backend, scanner, collect)
    }

    #[tokio::test]
    async fn test_deposit_to_watched_address() {
        let (backend, scanner, collect) = setup(1);
        scanner.add_address("A1", "app1");
        backend.push_block(vec![pay("t1", "A1", 5)]);

        let report = scanner.scan_cycle().await.unwrap();
        assert_eq!(report.scanned, vec![1]);
        assert_eq!(report.delivered, 1);

        let results = collect.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].recharges.len(), 1);
        assert_eq!(results[0].recharges[0].address, "A1");
        assert_eq!(results[0].recharges[0].amount, 5);
        assert_eq!(results[0].recharges[0].source_key, "app1");
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn test_unwatched_transactions_are_ignored() {
        let (backend, scanner, collect) = setup(1);
        scanner.add_address("A1", "app1");
        backend.push_block(vec![pay("t1", "B9", 5)]);

        let report = scanner.scan_cycle().await.unwrap();
        assert_eq!(report.scanned, vec![1]);
        assert!(collect.results.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_caught_up_cycle_is_noop() {
        let (_backend, scanner, _collect) = setup(1);
        let report = scanner.scan_cycle().await.unwrap();
        assert!(report.scanned.is_empty());
        assert_eq!(scanner.get_scanned_block_height().await, None);
    }

    #[tokio::test]
    async fn test_spent_inputs_are_reported() {
        let (backend, scanner, collect) = setup(1);
        scanner.add_address("A1", "app1");
        backend.push_block(vec![ChainTransaction {
            tx_id: "t2".to_string(),
            inputs: vec![TxInput {
                prev_out: Some(OutPoint::new("t1", 0)),
                address: Some("A1".to_string()),
                amount: 5,
                token: None,
            }],
            outputs: vec![TxOutput {
                index: 0,
                address: Some("B1".to_string()),
                amount: 4,
                token: None,
            }],
            failure: None,
        }]);

        scanner.scan_cycle().await.unwrap();
        let results = collect.results.lock().unwrap();
        assert_eq!(results[0].spent.len(), 1);
        assert_eq!(results[0].spent[0].prev_out, Some(OutPoint::new("t1", 0)));
        assert!(results[0].recharges.is_empty());
    }

    #[tokio::test]
    async fn test_one_block_per_cycle_by_default() {
        let (backend, scanner, _collect) = setup(1);
        backend.push_block(vec![]);
        backend.push_block(vec![]);

        assert_eq!(scanner.scan_cycle().await.unwrap().scanned, vec![1]);
        assert_eq!(scanner.scan_cycle().await.unwrap().scanned, vec![2]);
        assert_eq!(scanner.get_scanned_block_height().await, Some(2));
    }

    #[tokio::test]
    async fn test_reorg_stalls_until_rescan() {
        let (backend, scanner, collect) = setup(1);
        scanner.add_address("A1", "app1");
        backend.push_block(vec![]);
        backend.push_block(vec![pay("t1", "A1", 5)]);
        scanner.scan_cycle().await.unwrap();
        scanner.scan_cycle().await.unwrap();

        // Block 2 is replaced and block 3 builds on the new branch
        backend.replace_block(2, vec![pay("t1", "A1", 5)], "b");
        backend.push_block(vec![pay("t2", "A1", 7)]);

        let err = scanner.scan_cycle().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Reorg);
        assert!(scanner.pending_reorg().await.is_some());
        assert_eq!(scanner.get_scanned_block_height().await, Some(2));

        // Still stalled
        assert!(scanner.scan_cycle().await.is_err());

        scanner.set_rescan_block_height(2).await;
        assert!(scanner.pending_reorg().await.is_none());
        assert_eq!(scanner.scan_cycle().await.unwrap().scanned, vec![2]);
        assert_eq!(scanner.scan_cycle().await.unwrap().scanned, vec![3]);

        // t1 delivered once, t2 once
        let results = collect.results.lock().unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.tx_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_rescan_deduplicates_delivered_transactions() {
        let (backend, scanner, collect) = setup(1);
        scanner.add_address("A1", "app1");
        backend.push_block(vec![pay("t1", "A1", 5)]);
        scanner.scan_cycle().await.unwrap();

        scanner.set_rescan_block_height(1).await;
        let report = scanner.scan_cycle().await.unwrap();
        assert_eq!(report.scanned, vec![1]);
        assert_eq!(report.duplicates, 1);
        assert_eq!(collect.results.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (backend, scanner, collect) = setup(1);
        scanner.add_address("A1", "app1");
        backend.push_block(vec![pay("t1", "A1", 5)]);
        backend.fail_next_fetches(2);

        let report = scanner.scan_cycle().await.unwrap();
        assert_eq!(report.scanned, vec![1]);
        assert_eq!(collect.results.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (backend, scanner, _collect) = setup(1);
        backend.push_block(vec![]);
        backend.fail_next_fetches(10);

        let err = scanner.scan_cycle().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TransientIo);
        assert_eq!(scanner.get_scanned_block_height().await, None);
    }

    #[tokio::test]
    async fn test_failed_transaction_is_flagged() {
        let (backend, scanner, collect) = setup(1);
        scanner.add_address("A1", "app1");
        let mut tx = pay("t1", "A1", 5);
        tx.failure = Some("reverted".to_string());
        backend.push_block(vec![tx]);

        scanner.scan_cycle().await.unwrap();
        let results = collect.results.lock().unwrap();
        assert!(!results[0].success);
        assert_eq!(results[0].reason.as_deref(), Some("reverted"));
    }

    #[tokio::test]
    async fn test_checkpoint_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTC.json");
        let (backend, scanner, collect) = setup(1);
        scanner.add_address("A1", "app1");
        assert!(!scanner.attach_checkpoint(path.clone()).await.unwrap());

        backend.push_block(vec![pay("t1", "A1", 5)]);
        scanner.scan_cycle().await.unwrap();
        assert!(path.exists());

        // A fresh scanner over the same chain picks up after block 1
        let restarted = Arc::new(BlockScanner::new("BTC", backend.clone(), scanner_config(1)));
        restarted.add_address("A1", "app1");
        restarted.add_observer(collect.clone());
        assert!(restarted.attach_checkpoint(path.clone()).await.unwrap());
        assert_eq!(restarted.get_scanned_block_height().await, Some(1));

        backend.push_block(vec![pay("t2", "A1", 6)]);
        assert_eq!(restarted.scan_cycle().await.unwrap().scanned, vec![2]);

        // Rescanning block 1 still sees t1 as delivered
        restarted.set_rescan_block_height(1).await;
        assert_eq!(restarted.scan_cycle().await.unwrap().duplicates, 1);

        let ids: Vec<String> = collect.results.lock().unwrap().iter().map(|r| r.tx_id.clone()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_pending_reorg_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTC.json");
        let (backend, scanner, _collect) = setup(1);
        scanner.attach_checkpoint(path.clone()).await.unwrap();
        backend.push_block(vec![]);
        scanner.scan_cycle().await.unwrap();

        backend.replace_block(1, vec![], "b");
        backend.push_block(vec![]);
        assert!(scanner.scan_cycle().await.is_err());

        let restarted = BlockScanner::new("BTC", backend.clone(), scanner_config(1));
        restarted.attach_checkpoint(path.clone()).await.unwrap();
        assert!(restarted.pending_reorg().await.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_not_attached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTC.json");
        std::fs::write(&path, "{not json").unwrap();

        let scanner = BlockScanner::new("BTC", MockBackend::new(), scanner_config(1));
        let err = scanner.attach_checkpoint(path.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
        assert!(scanner.checkpoint_path().is_none());
    }

    #[test]
    fn test_address_set() {
        let scanner = BlockScanner::new("BTC", MockBackend::new(), ScannerConfig::default());
        scanner.add_address("A1", "app1");
        scanner.add_address("A1", "app2");
        assert!(scanner.is_exist_address("A1"));
        assert_eq!(scanner.source_key_of("A1").as_deref(), Some("app2"));
        assert_eq!(scanner.address_count(), 1);

        scanner.clear();
        assert!(!scanner.is_exist_address("A1"));
    }

    #[tokio::test]
    async fn test_run_without_task() {
        let scanner = BlockScanner::new("BTC", MockBackend::new(), ScannerConfig::default());
        let err = scanner.run().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert_eq!(scanner.status(), ScannerStatus::Idle);
    }

    #[tokio::test]
    async fn test_set_task_twice_is_noop() {
        let (_backend, scanner, _collect) = setup(1);
        assert!(scanner.set_scan_task());
        assert!(!scanner.set_scan_task());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle() {
        let (backend, scanner, collect) = setup(1);
        scanner.add_address("A1", "app1");
        scanner.set_scan_task();

        scanner.run().unwrap();
        assert_eq!(scanner.status(), ScannerStatus::Running);
        // Second run only warns
        scanner.run().unwrap();

        backend.push_block(vec![pay("t1", "A1", 5)]);
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(collect.results.lock().unwrap().len(), 1);

        scanner.pause();
        assert_eq!(scanner.status(), ScannerStatus::Paused);
        backend.push_block(vec![pay("t2", "A1", 6)]);
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(collect.results.lock().unwrap().len(), 1);

        scanner.run().unwrap();
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(collect.results.lock().unwrap().len(), 2);

        scanner.stop().await;
        assert_eq!(scanner.status(), ScannerStatus::Stopped);
        assert!(matches!(scanner.run(), Err(Error::ScannerStopped(_))));

        scanner.reinitialize().await;
        assert_eq!(scanner.status(), ScannerStatus::Idle);
        assert_eq!(scanner.get_scanned_block_height().await, None);
        assert!(scanner.is_exist_address("A1"));
    }
}
