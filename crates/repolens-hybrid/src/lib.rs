//! Hybrid retrieval over a project's lexical and semantic indexes, plus the
//! manager that keeps their on-disk snapshots fresh.

pub mod cancel;
pub mod fusion;
pub mod lock;
pub mod manager;
pub mod recency;
pub mod state;
pub mod store;

pub use cancel::{BuildProgress, CancelToken, ProgressFn, RebuildOptions};
pub use fusion::FusionRanker;
pub use manager::{IndexManager, QueryOutcome, QueryReason};
pub use recency::RecencyBoost;
pub use state::{IndexState, IndexStatus, StaleReason};
pub use store::{Snapshot, SnapshotStore};
