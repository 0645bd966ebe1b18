//! Reconciles dated listing snapshots into the persisted listing table.
//!
//! A [`Feeder`] scans the snapshot store for dates newer than the table
//! watermark and hands each one, oldest first, to the
//! [`ReconciliationEngine`] inside a single [`ListingTransaction`].

mod config;
mod engine;
mod error;
mod feeder;
mod memory;
mod postgres;
mod store;

pub use config::{
    DatabaseConfig, FeederConfig, RetryPolicy, DEFAULT_RECHECK_SECS, ENV_FILE_NAME,
};
pub use engine::{diff_fields, ReconciliationEngine, STATS_EVERY};
pub use error::{FailureKind, FeedError};
pub use feeder::{FedSnapshot, Feeder, RunSummary};
pub use memory::MemoryListingStore;
pub use postgres::PgListingStore;
pub use store::{ListingStore, ListingTransaction};

pub const CRATE_NAME: &str = "vacancy-sync";
