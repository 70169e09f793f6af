//! Periodic partition maintenance for one sliding-window table

use crate::error::PartitionError;
use crate::logger::LogEntry;
use crate::partitioning::partition::PartitionDescriptor;
use crate::partitioning::sliding_list::{DefaultValueCheck, SlidingListPolicy};
use crate::schema::Completion;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// What one [`PartitionManager::sync_partitions`] run changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub table_name: String,
    /// The table does not exist, so nothing was checked
    pub skipped: bool,
    pub default_value: Option<DefaultValueCheck>,
    pub created: Vec<PartitionDescriptor>,
    pub detached: Vec<PartitionDescriptor>,
}

impl SyncReport {
    fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            skipped: false,
            default_value: None,
            created: Vec::new(),
            detached: Vec::new(),
        }
    }

    pub fn changed(&self) -> bool {
        !self.created.is_empty()
            || !self.detached.is_empty()
            || matches!(self.default_value, Some(DefaultValueCheck::Fixed { .. }))
    }
}

/// Creates and detaches partitions as a [`SlidingListPolicy`] dictates
pub struct PartitionManager<'a> {
    policy: SlidingListPolicy<'a>,
}

impl<'a> PartitionManager<'a> {
    pub fn new(policy: SlidingListPolicy<'a>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SlidingListPolicy<'a> {
        &self.policy
    }

    /// Bring the table's partitions in line with its policy
    ///
    /// Repairs the partitioning key's default first, then creates missing partitions and
    /// detaches extra ones. Failures are logged and returned.
    pub fn sync_partitions(&self) -> Result<SyncReport, PartitionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("partitioning.sync", table = self.policy.table_name())
            .entered();

        self.policy.logger().info(
            LogEntry::new("Checking state of dynamic postgres partitions")
                .field("table_name", self.policy.table_name()),
        );

        self.sync().map_err(|e| {
            self.policy.logger().error(
                LogEntry::new("Failed to create / detach partition(s)")
                    .field("table_name", self.policy.table_name())
                    .field("error", e.to_string()),
            );
            e
        })
    }

    fn sync(&self) -> Result<SyncReport, PartitionError> {
        let table_name = self.policy.table_name();
        let mut report = SyncReport::new(table_name);

        if !self.policy.schema().table_exists(table_name)? {
            self.policy.logger().warn(
                LogEntry::new("Skipping synching partitions for table because the table does not exist")
                    .field("table_name", table_name),
            );
            report.skipped = true;
            return Ok(report);
        }

        report.default_value = Some(self.policy.validate_and_fix()?);

        let missing = self.policy.missing_partitions()?;
        let extra = self.policy.extra_partitions()?;

        if !missing.is_empty() {
            self.create(&missing)?;
            report.created = missing;
        }

        for partition in extra {
            self.detach_one(&partition)?;
            report.detached.push(partition);
        }

        Ok(report)
    }

    /// Create partitions and move the column default in one transaction
    fn create(&self, partitions: &[PartitionDescriptor]) -> Result<(), PartitionError> {
        let schema = self.policy.schema();
        let logger = self.policy.logger();

        schema.with_lock_retries(false, &mut || {
            for partition in partitions {
                schema.execute(&partition.to_create_sql())?;
                logger.info(
                    LogEntry::new("Created partition")
                        .field("partition_name", partition.partition_name.as_str())
                        .field("table_name", partition.table.as_str()),
                );
            }
            self.policy.after_adding_partitions()?;
            Ok(Completion::Commit)
        })?;

        #[cfg(feature = "metrics")]
        partitions
            .iter()
            .for_each(|p| METRICS.record_partition_created(&p.table));

        Ok(())
    }

    fn detach_one(&self, partition: &PartitionDescriptor) -> Result<(), PartitionError> {
        self.assert_partition_detachable(partition)?;

        let schema = self.policy.schema();
        schema.with_lock_retries(false, &mut || {
            schema.execute(&partition.to_detach_sql())?;
            Ok(Completion::Commit)
        })?;

        self.policy.logger().info(
            LogEntry::new("Detached partition")
                .field("partition_name", partition.partition_name.as_str())
                .field("table_name", partition.table.as_str()),
        );

        #[cfg(feature = "metrics")]
        METRICS.record_partition_detached(&partition.table);

        Ok(())
    }

    /// A detach re-validates every foreign key pointing at the parent while holding its
    /// lock, which would block writes for the duration of the check.
    fn assert_partition_detachable(&self, partition: &PartitionDescriptor) -> Result<(), PartitionError> {
        let schema = self.policy.schema();
        let parent = format!("{}.{}", schema.current_schema()?, partition.table);

        match schema.referencing_foreign_keys(&parent)?.first() {
            Some(fk) => Err(PartitionError::UnsafeToDetach(format!(
                "Cannot detach {}, it would block while checking foreign key {} on {}",
                partition.partition_name, fk.name, fk.from_table
            ))),
            None => Ok(()),
        }
    }
}
