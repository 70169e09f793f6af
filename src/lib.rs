//! # Lifeguard Partitioning
//!
//! Sliding-window list partition management for PostgreSQL on the `may` coroutine runtime.
//!
//! - [`partitioning::PartitionConverter`] converts a live table into the first partition
//!   of a new list-partitioned parent, with revert steps.
//! - [`partitioning::SlidingListPolicy`] and [`partitioning::PartitionManager`] open new
//!   partitions, detach old ones and keep the partitioning key's default on the newest.
//!
//! All database access goes through [`schema::SchemaOperations`];
//! [`schema::PgSchemaOperations`] implements it over a [`MayPostgresExecutor`].
//!
//! See [README on GitHub](https://github.com/microscaler/lifeguard) for the rest of Lifeguard.

pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod logger;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod partitioning;
pub mod schema;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
pub mod transaction;

pub use config::{LockRetryConfig, PartitioningConfig};
pub use connection::{connect, connect_executor, ConnectionError};
pub use error::PartitionError;
pub use executor::{MayPostgresExecutor, SqlExecutor};
pub use logger::{AppLogger, LogEntry, PartitionLogger};
pub use partitioning::{
    PartitionConverter, PartitionDescriptor, PartitionManager, PartitioningPolicy,
    SlidingListPolicy, SyncReport, TableModel,
};
pub use schema::{PgSchemaOperations, SchemaOperations};
