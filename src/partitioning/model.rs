//! Application-side description of a partitioned table

use std::collections::BTreeSet;

/// The model a sliding-window policy governs
///
/// The partitioning key is written only through its column default, so the
/// application must never set it itself: it has to be ignored or read-only here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableModel {
    pub name: String,
    pub table_name: String,
    pub ignored_columns: BTreeSet<String>,
    pub readonly_columns: BTreeSet<String>,
}

impl TableModel {
    pub fn new(name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            ignored_columns: BTreeSet::new(),
            readonly_columns: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn ignore_column(mut self, column: impl Into<String>) -> Self {
        self.ignored_columns.insert(column.into());
        self
    }

    #[must_use]
    pub fn readonly_column(mut self, column: impl Into<String>) -> Self {
        self.readonly_columns.insert(column.into());
        self
    }

    pub fn key_ignored_or_readonly(&self, column: &str) -> bool {
        self.ignored_columns.contains(column) || self.readonly_columns.contains(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ignored_or_readonly() {
        let ignored = TableModel::new("Event", "events").ignore_column("partition_id");
        let readonly = TableModel::new("Event", "events").readonly_column("partition_id");
        let plain = TableModel::new("Event", "events");

        assert!(ignored.key_ignored_or_readonly("partition_id"));
        assert!(readonly.key_ignored_or_readonly("partition_id"));
        assert!(!plain.key_ignored_or_readonly("partition_id"));
    }
}
