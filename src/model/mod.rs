//! Value types shared by the store and the sync engine.
//!
//! - `IndexSpec` / `IndexType`: declared soup indices
//! - `QuerySpec`: how to read a soup
//! - `SyncState` / `SyncOptions`: persisted sync jobs

pub mod index_spec;
pub mod query_spec;
pub mod sync_state;

pub use index_spec::{IndexSpec, IndexSpecDiff, IndexType};
pub use query_spec::{Order, QuerySpec, QueryType, DEFAULT_PAGE_SIZE};
pub use sync_state::{
    MergeMode, SyncOptions, SyncState, SyncStatus, SyncType, UNKNOWN_TIME_STAMP,
};
