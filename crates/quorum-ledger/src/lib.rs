pub mod db;
pub mod error;
pub mod index;
pub mod lock;

pub use db::{Ledger, MessageFilter};
pub use error::{LedgerError, LedgerResult};
pub use index::ClusterIndex;
pub use lock::{StateLock, ACQUIRE_BUDGET_MS, STALE_LOCK_MS};
