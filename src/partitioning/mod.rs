//! Partition lifecycle
//!
//! - [`PartitionConverter`] turns a plain table into the first partition of a new
//!   list-partitioned parent, once per table.
//! - [`SlidingListPolicy`] decides which numbered partitions should exist and keeps the
//!   partitioning key's default on the newest one.
//! - [`PartitionManager`] applies the policy on a schedule.

pub mod converter;
pub mod manager;
pub mod model;
pub mod partition;
pub mod sliding_list;

pub use converter::{PartitionConverter, PARTITIONING_CONSTRAINT_NAME};
pub use manager::{PartitionManager, SyncReport};
pub use model::TableModel;
pub use partition::PartitionDescriptor;
pub use sliding_list::{DefaultValueCheck, PartitioningPolicy, SlidingListPolicy};
