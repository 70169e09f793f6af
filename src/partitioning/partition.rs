//! One numeric list partition of a sliding-window table

use crate::error::PartitionError;
use crate::schema::{sql, PartitionRecord};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;

/// `pg_get_expr(relpartbound)` of a single-value list partition
static LIST_BOUND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^FOR VALUES IN \('?(\d+)'?\)$").unwrap());

/// A partition bound to exactly one partitioning-key value
///
/// Ordered by value. Two descriptors are equal when table, partition name and
/// value all match; the schema is where the partition lives, not part of its identity.
#[derive(Debug, Clone, Eq)]
pub struct PartitionDescriptor {
    pub table: String,
    pub value: i64,
    pub partition_name: String,
    pub schema: String,
}

impl PartitionDescriptor {
    /// Partition named `<table>_<value>`
    pub fn new(table: &str, value: i64, schema: &str) -> Self {
        Self {
            table: table.to_string(),
            value,
            partition_name: format!("{table}_{value}"),
            schema: schema.to_string(),
        }
    }

    /// Build from a catalog row, keeping the catalog's partition name
    ///
    /// # Errors
    ///
    /// Returns `PartitionError::Parse` for any bound other than a single integer value.
    pub fn from_sql(table: &str, record: &PartitionRecord) -> Result<Self, PartitionError> {
        let value = LIST_BOUND
            .captures(record.condition.trim())
            .and_then(|c| c[1].parse::<i64>().ok())
            .ok_or_else(|| {
                PartitionError::Parse(format!(
                    "Unexpected partition bound for {}.{}: {}",
                    record.schema, record.name, record.condition
                ))
            })?;

        Ok(Self {
            table: table.to_string(),
            value,
            partition_name: record.name.clone(),
            schema: record.schema.clone(),
        })
    }

    /// `schema.partition_name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.partition_name)
    }

    pub fn to_create_sql(&self) -> String {
        sql::create_list_partition(&self.schema, &self.partition_name, &self.table, self.value)
    }

    pub fn to_detach_sql(&self) -> String {
        sql::detach_partition(&self.table, &self.qualified_name())
    }
}

impl PartialEq for PartitionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table
            && self.partition_name == other.partition_name
            && self.value == other.value
    }
}

impl PartialOrd for PartitionDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PartitionDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| self.table.cmp(&other.table))
            .then_with(|| self.partition_name.cmp(&other.partition_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, condition: &str) -> PartitionRecord {
        PartitionRecord {
            schema: "partitions_dynamic".to_string(),
            name: name.to_string(),
            condition: condition.to_string(),
        }
    }

    #[test]
    fn test_from_sql_accepts_quoted_and_bare_values() {
        let quoted = PartitionDescriptor::from_sql("events", &record("events_3", "FOR VALUES IN ('3')")).unwrap();
        let bare = PartitionDescriptor::from_sql("events", &record("events_12", "FOR VALUES IN (12)")).unwrap();

        assert_eq!(quoted.value, 3);
        assert_eq!(quoted.partition_name, "events_3");
        assert_eq!(bare.value, 12);
    }

    #[test]
    fn test_from_sql_rejects_other_bounds() {
        for condition in ["DEFAULT", "FOR VALUES IN ('1', '2')", "FOR VALUES FROM (1) TO (2)"] {
            let err = PartitionDescriptor::from_sql("events", &record("events_x", condition)).unwrap_err();
            assert!(matches!(err, PartitionError::Parse(_)), "{condition}");
        }
    }

    #[test]
    fn test_equality_ignores_schema() {
        let a = PartitionDescriptor::new("events", 2, "partitions_dynamic");
        let b = PartitionDescriptor::new("events", 2, "public");
        assert_eq!(a, b);
        assert_ne!(a, PartitionDescriptor::new("events", 3, "partitions_dynamic"));
    }

    #[test]
    fn test_sorts_by_value() {
        let mut partitions: Vec<_> = [10, 2, 7]
            .iter()
            .map(|v| PartitionDescriptor::new("events", *v, "partitions_dynamic"))
            .collect();
        partitions.sort();

        let values: Vec<i64> = partitions.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![2, 7, 10]);
    }

    #[test]
    fn test_ddl() {
        let partition = PartitionDescriptor::new("events", 2, "partitions_dynamic");
        assert_eq!(
            partition.to_create_sql(),
            "CREATE TABLE IF NOT EXISTS \"partitions_dynamic\".\"events_2\" PARTITION OF \"events\" \
             FOR VALUES IN (2)"
        );
        assert_eq!(
            partition.to_detach_sql(),
            "ALTER TABLE \"events\" DETACH PARTITION \"partitions_dynamic\".\"events_2\""
        );
    }
}
