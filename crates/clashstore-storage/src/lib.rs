//! SQLite-backed persistence core for spatial clash resolution.
//!
//! This crate owns schema bootstrap, clash-zone persistence with
//! deterministic identity and dedup, the individual/cluster/combined
//! resolution lifecycle, bulk transactional mutation with a staging-table
//! strategy, a transactionally-maintained spatial index, and the derived
//! sleeve-snapshot read model.
#![allow(
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::uninlined_format_args
)]

pub mod bulk;
pub mod connection;
pub mod identity;
pub mod metrics;
pub mod query;
pub mod resolution;
pub mod schema;
pub mod snapshot;
pub mod spatial;
pub mod verify;
pub mod zone;

pub use bulk::{BatchOutcome, SkippedCandidate};
pub use connection::{Storage, StorageConfig};
pub use identity::{MatchOutcome, ZoneIdentity, IDENTITY_PRECISION};
pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use query::BoxQueryMode;
pub use resolution::{ResolutionState, ResolutionTier};
pub use schema::{bootstrap, current_version, SCHEMA_VERSION};
pub use snapshot::{SleeveSnapshot, SnapshotSource, SIZE_KEY_ALIASES};
pub use verify::{StalenessVerifier, VerificationConfig, VerificationReport};
pub use zone::{ClashZone, FileCombo, FilterRecord, ZoneCandidate, ZoneFlags};
