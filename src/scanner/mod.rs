//! Block-scanning engine
//!
//! A [`BlockScanner`] per chain, driven by a periodic [`ScanTask`], turns
//! new blocks into [`ExtractResult`]s for its [`Observer`]s.

pub mod block_scanner;
pub mod observer;
pub mod scan_state;
pub mod task;
pub mod types;

pub use block_scanner::{BlockScanner, ScannerStatus};
pub use observer::{Observer, ObserverHandle, ObserverRegistry};
pub use scan_state::{PendingReorg, ScanState};
pub use task::{ScanTask, TaskState};
pub use types::{CycleReport, ExtractResult, Recharge, SpentInput};
