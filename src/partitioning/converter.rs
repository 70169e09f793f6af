//! Online conversion of a plain table into the first partition of a list-partitioned parent
//!
//! The conversion runs in two operator-driven steps so the expensive part happens
//! without heavy locks:
//!
//! 1. [`PartitionConverter::prepare_for_partitioning`] adds a check constraint
//!    `<column> = <value>`. Validating it scans the table, but only under a
//!    `SHARE UPDATE EXCLUSIVE` lock.
//! 2. [`PartitionConverter::partition`] creates the parent and attaches the table. The
//!    validated constraint lets PostgreSQL skip the scan it would otherwise do while
//!    holding `ACCESS EXCLUSIVE`.
//!
//! Both steps have a revert, and each step checks the catalog before acting so an
//! interrupted run can simply be repeated.

use crate::error::PartitionError;
use crate::schema::{sql, Completion, ConstraintDescriptor, ConstraintScope, SchemaOperations};

/// Name given to the anchoring check constraint
///
/// The constraint is later found by its definition, so any name would work.
pub const PARTITIONING_CONSTRAINT_NAME: &str = "partitioning_constraint";

pub struct PartitionConverter<'a> {
    schema: &'a dyn SchemaOperations,
    table_name: String,
    parent_table_name: String,
    partitioning_column: String,
    zero_partition_value: i64,
}

impl<'a> PartitionConverter<'a> {
    pub fn new(
        schema: &'a dyn SchemaOperations,
        table_name: impl Into<String>,
        parent_table_name: impl Into<String>,
        partitioning_column: impl Into<String>,
        zero_partition_value: i64,
    ) -> Self {
        Self {
            schema,
            table_name: table_name.into(),
            parent_table_name: parent_table_name.into(),
            partitioning_column: partitioning_column.into(),
            zero_partition_value,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn parent_table_name(&self) -> &str {
        &self.parent_table_name
    }

    /// Check that the table can be partitioned and add the anchoring constraint
    ///
    /// # Errors
    ///
    /// `PartitionError::UnableToPartition` when a primary key or unique constraint
    /// leaves out the partitioning column, or when the constraint does not show up in
    /// the catalog after being added.
    pub fn prepare_for_partitioning(&self) -> Result<(), PartitionError> {
        self.assert_existing_constraints_partitionable()?;
        self.add_partitioning_check_constraint()
    }

    /// Drop the anchoring constraint; nothing to do when it is already gone
    pub fn revert_preparation_for_partitioning(&self) -> Result<(), PartitionError> {
        match self.partitioning_constraint()? {
            Some(constraint) => self
                .schema
                .remove_check_constraint(&self.table_name, &constraint.name),
            None => {
                log::debug!(
                    "no partitioning constraint on {}, nothing to revert",
                    self.table_name
                );
                Ok(())
            }
        }
    }

    /// Attach the table to a new list-partitioned parent
    ///
    /// # Errors
    ///
    /// `PartitionError::UnableToPartition` when constraints are incompatible or
    /// [`prepare_for_partitioning`](Self::prepare_for_partitioning) has not run;
    /// `PartitionError::LockRetriesExhausted` when the attach could not get its locks.
    pub fn partition(&self) -> Result<(), PartitionError> {
        self.assert_existing_constraints_partitionable()?;
        self.assert_partitioning_constraint_present()?;
        self.create_parent_table()?;
        self.attach_foreign_keys_to_parent()?;

        // Attach, sequence ownership and constraint removal take the same locks, so they
        // share one transaction.
        self.schema.with_lock_retries(true, &mut || {
            for statement in self.convert_table_statements()? {
                self.schema.execute(&statement)?;
            }
            Ok(Completion::Commit)
        })
    }

    /// Detach the table, hand its sequences back and drop the parent
    ///
    /// Leaves the table prepared: the anchoring constraint is added again.
    pub fn revert_partitioning(&self) -> Result<(), PartitionError> {
        self.schema.with_lock_retries(true, &mut || {
            self.schema
                .execute(&sql::detach_partition(&self.parent_table_name, &self.table_name))?;
            for statement in self.alter_sequence_statements(&self.parent_table_name, &self.table_name)? {
                self.schema.execute(&statement)?;
            }
            // Dropping the parent's foreign keys first would cascade to the partition,
            // so they go with the table.
            self.schema.drop_table(&self.parent_table_name)?;
            Ok(Completion::Commit)
        })?;

        self.add_partitioning_check_constraint()
    }

    fn table_identifier(&self) -> Result<String, PartitionError> {
        Ok(format!("{}.{}", self.schema.current_schema()?, self.table_name))
    }

    fn constraints(&self) -> Result<ConstraintScope, PartitionError> {
        Ok(ConstraintScope::new(
            self.schema.constraints(&self.table_identifier()?)?,
        ))
    }

    fn assert_existing_constraints_partitionable(&self) -> Result<(), PartitionError> {
        let violating = self
            .constraints()?
            .primary_or_unique_constraints()
            .not_including_column(&self.partitioning_column)
            .into_vec();

        if violating.is_empty() {
            return Ok(());
        }

        let violations: Vec<String> = violating
            .iter()
            .map(|c| format!("{} on ({})", c.name, c.column_names.join(", ")))
            .collect();

        Err(PartitionError::UnableToPartition(format!(
            "Constraints on {table} are incompatible with partitioning on {column}\n\n\
             All primary key and unique constraints must include the partitioning column.\n\
             Violations:\n{violations}",
            table = self.table_name,
            column = self.partitioning_column,
            violations = violations.join("\n"),
        )))
    }

    /// The valid check constraint pinning the column to the zero partition value
    fn partitioning_constraint(&self) -> Result<Option<ConstraintDescriptor>, PartitionError> {
        let definition =
            sql::equality_check_definition(&self.partitioning_column, self.zero_partition_value);
        Ok(self
            .constraints()?
            .check_constraints()
            .valid()
            .including_column(&self.partitioning_column)
            .find(|c| c.definition == definition))
    }

    fn assert_partitioning_constraint_present(&self) -> Result<ConstraintDescriptor, PartitionError> {
        self.partitioning_constraint()?.ok_or_else(|| {
            PartitionError::UnableToPartition(format!(
                "Table {} is not ready for partitioning.\n\
                 Before partitioning, a check constraint must enforce that ({} = {})",
                self.table_name, self.partitioning_column, self.zero_partition_value
            ))
        })
    }

    fn add_partitioning_check_constraint(&self) -> Result<(), PartitionError> {
        if self.partitioning_constraint()?.is_some() {
            return Ok(());
        }

        self.schema.add_check_constraint(
            &self.table_name,
            &sql::equality_check(&self.partitioning_column, self.zero_partition_value),
            PARTITIONING_CONSTRAINT_NAME,
        )?;

        if self.partitioning_constraint()?.is_none() {
            return Err(PartitionError::UnableToPartition(
                "Error adding partitioning constraint".to_string(),
            ));
        }
        Ok(())
    }

    fn create_parent_table(&self) -> Result<(), PartitionError> {
        self.schema.execute(&sql::create_partitioned_parent_like(
            &self.parent_table_name,
            &self.table_name,
            &self.partitioning_column,
        ))
    }

    fn attach_foreign_keys_to_parent(&self) -> Result<(), PartitionError> {
        for fk in self.schema.foreign_keys(&self.table_name)? {
            // A rerun after a lock failure may find the key already in place
            let exists = self
                .schema
                .foreign_keys(&self.parent_table_name)?
                .iter()
                .any(|parent_fk| parent_fk.name == fk.name);
            if exists {
                continue;
            }

            // Nothing references the new parent yet; fk.to_table is the only contended lock
            self.schema.with_lock_retries(true, &mut || {
                self.schema.add_foreign_key(&self.parent_table_name, &fk)?;
                Ok(Completion::Commit)
            })?;
        }
        Ok(())
    }

    fn convert_table_statements(&self) -> Result<Vec<String>, PartitionError> {
        let constraint = self.assert_partitioning_constraint_present()?;

        let mut statements = vec![sql::attach_partition(
            &self.parent_table_name,
            &self.table_name,
            self.zero_partition_value,
        )];
        statements.extend(self.alter_sequence_statements(&self.table_name, &self.parent_table_name)?);
        // The attached table inherits the parent's copy of the constraint; dropping it on
        // the parent removes both.
        statements.push(sql::drop_constraint(&self.parent_table_name, &constraint.name));
        Ok(statements)
    }

    fn alter_sequence_statements(
        &self,
        old_table: &str,
        new_table: &str,
    ) -> Result<Vec<String>, PartitionError> {
        Ok(self
            .schema
            .sequences_owned_by(old_table)?
            .iter()
            .map(|sequence| sql::alter_sequence_owned_by(&sequence.name, new_table, &sequence.column_name))
            .collect())
    }
}
