//! SQL text for partition DDL
//!
//! sea-query covers foreign keys and `DROP TABLE`; it has no model for list partitions,
//! sequence ownership or column-default changes, so those statements are formatted
//! here. Every statement is a single line with quoted identifiers.

use crate::schema::{ForeignKeyAction, ForeignKeyDescriptor};
use sea_query::{ForeignKey, PostgresQueryBuilder, Table};
use std::time::Duration;

/// Quote a single identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name (`schema.table`)
pub fn quote_table_name(name: &str) -> String {
    match name.split_once('.') {
        Some((schema, table)) => qualified(schema, table),
        None => quote_ident(name),
    }
}

/// `"schema"."name"`
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Predicate body of the anchoring check constraint, e.g. `created_shard = 0`
pub fn equality_check(column: &str, value: i64) -> String {
    format!("{column} = {value}")
}

/// How `pg_get_constraintdef` renders the anchoring check constraint
pub fn equality_check_definition(column: &str, value: i64) -> String {
    format!("CHECK (({}))", equality_check(column, value))
}

pub fn create_partitioned_parent_like(parent: &str, source: &str, column: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING ALL) PARTITION BY LIST ({})",
        quote_table_name(parent),
        quote_table_name(source),
        quote_ident(column)
    )
}

pub fn attach_partition(parent: &str, child: &str, value: i64) -> String {
    format!(
        "ALTER TABLE {} ATTACH PARTITION {} FOR VALUES IN ({value})",
        quote_table_name(parent),
        quote_table_name(child)
    )
}

pub fn detach_partition(parent: &str, child: &str) -> String {
    format!(
        "ALTER TABLE {} DETACH PARTITION {}",
        quote_table_name(parent),
        quote_table_name(child)
    )
}

pub fn create_list_partition(schema: &str, partition_name: &str, parent: &str, value: i64) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES IN ({value})",
        qualified(schema, partition_name),
        quote_table_name(parent)
    )
}

pub fn alter_sequence_owned_by(sequence: &str, table: &str, column: &str) -> String {
    format!(
        "ALTER SEQUENCE {} OWNED BY {}.{}",
        quote_table_name(sequence),
        quote_table_name(table),
        quote_ident(column)
    )
}

pub fn add_check_constraint_not_valid(table: &str, name: &str, check: &str) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({check}) NOT VALID",
        quote_table_name(table),
        quote_ident(name)
    )
}

pub fn validate_constraint(table: &str, name: &str) -> String {
    format!(
        "ALTER TABLE {} VALIDATE CONSTRAINT {}",
        quote_table_name(table),
        quote_ident(name)
    )
}

pub fn drop_constraint(table: &str, name: &str) -> String {
    format!(
        "ALTER TABLE {} DROP CONSTRAINT {}",
        quote_table_name(table),
        quote_ident(name)
    )
}

pub fn drop_constraint_if_exists(table: &str, name: &str) -> String {
    format!(
        "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
        quote_table_name(table),
        quote_ident(name)
    )
}

pub fn lock_table_exclusive(table: &str) -> String {
    format!("LOCK TABLE {} IN ACCESS EXCLUSIVE MODE", quote_table_name(table))
}

pub fn change_column_default(table: &str, column: &str, value: i64) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {value}",
        quote_table_name(table),
        quote_ident(column)
    )
}

/// `SET LOCAL lock_timeout`; a zero duration disables the timeout
pub fn set_local_lock_timeout(timeout: Duration) -> String {
    format!("SET LOCAL lock_timeout TO '{}ms'", timeout.as_millis())
}

pub fn drop_table(table: &str) -> String {
    let statement = match table.split_once('.') {
        Some((schema, name)) => Table::drop()
            .table((schema.to_string(), name.to_string()))
            .to_owned(),
        None => Table::drop().table(table.to_string()).to_owned(),
    };
    statement.build(PostgresQueryBuilder)
}

/// `ALTER TABLE ... ADD CONSTRAINT ... FOREIGN KEY` recreating `fk` on `table`
///
/// Deferrability and validity are carried over: an attached partition only reuses its
/// own key when the parent's matches it exactly.
pub fn add_foreign_key(table: &str, fk: &ForeignKeyDescriptor) -> String {
    let mut statement = ForeignKey::create();
    statement
        .name(fk.name.clone())
        .from_tbl(table.to_string())
        .to_tbl(fk.to_table.clone())
        .on_delete(fk.on_delete.into())
        .on_update(fk.on_update.into());
    for column in &fk.columns {
        statement.from_col(column.clone());
    }
    for column in &fk.referenced_columns {
        statement.to_col(column.clone());
    }
    // sea-query has no model for constraint attributes
    let mut sql = statement.to_owned().build(PostgresQueryBuilder);
    if fk.deferrable {
        sql.push_str(" DEFERRABLE");
        if fk.initially_deferred {
            sql.push_str(" INITIALLY DEFERRED");
        }
    }
    if !fk.valid {
        sql.push_str(" NOT VALID");
    }
    sql
}

impl From<ForeignKeyAction> for sea_query::ForeignKeyAction {
    fn from(action: ForeignKeyAction) -> Self {
        match action {
            ForeignKeyAction::NoAction => sea_query::ForeignKeyAction::NoAction,
            ForeignKeyAction::Restrict => sea_query::ForeignKeyAction::Restrict,
            ForeignKeyAction::Cascade => sea_query::ForeignKeyAction::Cascade,
            ForeignKeyAction::SetNull => sea_query::ForeignKeyAction::SetNull,
            ForeignKeyAction::SetDefault => sea_query::ForeignKeyAction::SetDefault,
        }
    }
}
