//! `SchemaOperations` over a live PostgreSQL session

use crate::config::LockRetryConfig;
use crate::error::PartitionError;
use crate::executor::SqlExecutor;
use crate::logger::{AppLogger, LogEntry, PartitionLogger};
use crate::schema::lock_retries::{Completion, WithLockRetries};
use crate::schema::{
    sql, ConstraintDescriptor, ConstraintKind, ForeignKeyAction, ForeignKeyDescriptor,
    LockRetryBlock, PartitionRecord, SchemaOperations, SequenceOwnership,
};
use may_postgres::Row;
use std::sync::Arc;

const CONSTRAINTS_SQL: &str = r#"
    SELECT pg_constraint.conname::text AS name,
           pg_constraint.contype::text AS constraint_type,
           pg_constraint.convalidated AS valid,
           pg_get_constraintdef(pg_constraint.oid) AS definition,
           ARRAY(
               SELECT pg_attribute.attname::text
               FROM unnest(pg_constraint.conkey) WITH ORDINALITY AS keys(attnum, position)
               INNER JOIN pg_attribute ON pg_attribute.attrelid = pg_constraint.conrelid
                                      AND pg_attribute.attnum = keys.attnum
               ORDER BY keys.position
           ) AS column_names
    FROM pg_constraint
    INNER JOIN pg_class ON pg_class.oid = pg_constraint.conrelid
    INNER JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace
    WHERE pg_namespace.nspname = $1
      AND pg_class.relname = $2
    ORDER BY pg_constraint.conname
"#;

const FOREIGN_KEY_COLUMNS: &str = r#"
           pg_constraint.conname::text AS name,
           source.relname::text AS from_table,
           target.relname::text AS to_table,
           ARRAY(
               SELECT pg_attribute.attname::text
               FROM unnest(pg_constraint.conkey) WITH ORDINALITY AS keys(attnum, position)
               INNER JOIN pg_attribute ON pg_attribute.attrelid = pg_constraint.conrelid
                                      AND pg_attribute.attnum = keys.attnum
               ORDER BY keys.position
           ) AS columns,
           ARRAY(
               SELECT pg_attribute.attname::text
               FROM unnest(pg_constraint.confkey) WITH ORDINALITY AS keys(attnum, position)
               INNER JOIN pg_attribute ON pg_attribute.attrelid = pg_constraint.confrelid
                                      AND pg_attribute.attnum = keys.attnum
               ORDER BY keys.position
           ) AS referenced_columns,
           pg_constraint.confdeltype::text AS on_delete,
           pg_constraint.confupdtype::text AS on_update,
           pg_constraint.condeferrable AS deferrable,
           pg_constraint.condeferred AS initially_deferred,
           pg_constraint.convalidated AS valid
"#;

const SEQUENCES_OWNED_BY_SQL: &str = r#"
    SELECT seq_pg_class.relname::text AS seq_name,
           pg_attribute.attname::text AS col_name
    FROM pg_class seq_pg_class
    INNER JOIN pg_depend ON seq_pg_class.oid = pg_depend.objid
    INNER JOIN pg_class dep_pg_class ON pg_depend.refobjid = dep_pg_class.oid
    INNER JOIN pg_attribute ON dep_pg_class.oid = pg_attribute.attrelid
                           AND pg_depend.refobjsubid = pg_attribute.attnum
    WHERE seq_pg_class.relkind = 'S'
      AND dep_pg_class.relname = $1
    ORDER BY seq_pg_class.relname
"#;

const PARTITIONS_SQL: &str = r#"
    SELECT child_namespace.nspname::text AS schema,
           child.relname::text AS name,
           pg_get_expr(child.relpartbound, child.oid) AS condition
    FROM pg_inherits
    INNER JOIN pg_class parent ON pg_inherits.inhparent = parent.oid
    INNER JOIN pg_namespace parent_namespace ON parent_namespace.oid = parent.relnamespace
    INNER JOIN pg_class child ON pg_inherits.inhrelid = child.oid
    INNER JOIN pg_namespace child_namespace ON child_namespace.oid = child.relnamespace
    WHERE parent_namespace.nspname = current_schema()
      AND parent.relname = $1
      AND parent.relkind = 'p'
    ORDER BY child.relname
"#;

const COLUMN_DEFAULT_SQL: &str = r#"
    SELECT columns.column_default::text AS default_value
    FROM information_schema.columns columns
    WHERE columns.table_schema = current_schema()
      AND columns.table_name = $1
      AND columns.column_name = $2
"#;

const TABLE_EXISTS_SQL: &str = r#"
    SELECT EXISTS (
        SELECT 1
        FROM pg_class
        INNER JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace
        WHERE pg_namespace.nspname = current_schema()
          AND pg_class.relname = $1
          AND pg_class.relkind IN ('r', 'p')
    )
"#;

/// Splits `schema.table`, falling back to `current_schema()` for bare names
fn split_identifier<'t>(
    ops: &PgSchemaOperations<impl SqlExecutor>,
    table_identifier: &'t str,
) -> Result<(String, &'t str), PartitionError> {
    match table_identifier.split_once('.') {
        Some((schema, table)) => Ok((schema.to_string(), table)),
        None => Ok((ops.current_schema()?, table_identifier)),
    }
}

fn foreign_key_from_row(row: &Row) -> Result<ForeignKeyDescriptor, PartitionError> {
    let on_delete: String = row.try_get("on_delete")?;
    let on_update: String = row.try_get("on_update")?;
    Ok(ForeignKeyDescriptor {
        name: row.try_get("name")?,
        from_table: row.try_get("from_table")?,
        to_table: row.try_get("to_table")?,
        columns: row.try_get("columns")?,
        referenced_columns: row.try_get("referenced_columns")?,
        on_delete: ForeignKeyAction::from_catalog_code(&on_delete),
        on_update: ForeignKeyAction::from_catalog_code(&on_update),
        deferrable: row.try_get("deferrable")?,
        initially_deferred: row.try_get("initially_deferred")?,
        valid: row.try_get("valid")?,
    })
}

/// PostgreSQL implementation of [`SchemaOperations`]
///
/// All statements, including those issued from lock-retrying blocks, run on the one
/// session owned by `executor`.
pub struct PgSchemaOperations<E: SqlExecutor> {
    executor: E,
    lock_retries: LockRetryConfig,
    logger: Arc<dyn PartitionLogger + Send + Sync>,
}

impl<E: SqlExecutor> PgSchemaOperations<E> {
    pub fn new(executor: E, lock_retries: LockRetryConfig) -> Self {
        Self::with_logger(executor, lock_retries, Arc::new(AppLogger))
    }

    pub fn with_logger(
        executor: E,
        lock_retries: LockRetryConfig,
        logger: Arc<dyn PartitionLogger + Send + Sync>,
    ) -> Self {
        Self {
            executor,
            lock_retries,
            logger,
        }
    }

    fn constraint_exists(&self, table: &str, name: &str) -> Result<bool, PartitionError> {
        let (schema, table) = split_identifier(self, table)?;
        Ok(self
            .constraints(&format!("{schema}.{table}"))?
            .iter()
            .any(|c| c.name == name))
    }
}

impl<E: SqlExecutor> SchemaOperations for PgSchemaOperations<E> {
    fn current_schema(&self) -> Result<String, PartitionError> {
        let row = self.executor.query_one("SELECT current_schema()::text", &[])?;
        row.try_get(0).map_err(PartitionError::from)
    }

    fn execute(&self, sql: &str) -> Result<(), PartitionError> {
        self.executor.execute(sql, &[]).map(|_| ())
    }

    fn with_lock_retries(
        &self,
        raise_on_exhaustion: bool,
        block: &mut LockRetryBlock<'_>,
    ) -> Result<(), PartitionError> {
        WithLockRetries::new(&self.executor, &self.lock_retries, self.logger.as_ref())
            .run(raise_on_exhaustion, block)
    }

    fn table_exists(&self, table: &str) -> Result<bool, PartitionError> {
        let row = self.executor.query_one(TABLE_EXISTS_SQL, &[&table])?;
        row.try_get(0).map_err(PartitionError::from)
    }

    fn constraints(&self, table_identifier: &str) -> Result<Vec<ConstraintDescriptor>, PartitionError> {
        let (schema, table) = split_identifier(self, table_identifier)?;
        let rows = self.executor.query_all(CONSTRAINTS_SQL, &[&schema, &table])?;

        rows.iter()
            .map(|row| {
                let contype: String = row.try_get("constraint_type")?;
                Ok(ConstraintDescriptor {
                    name: row.try_get("name")?,
                    kind: ConstraintKind::from_contype(&contype),
                    column_names: row.try_get("column_names")?,
                    definition: row.try_get("definition")?,
                    valid: row.try_get("valid")?,
                })
            })
            .collect()
    }

    fn add_check_constraint(&self, table: &str, check: &str, name: &str) -> Result<(), PartitionError> {
        if self.constraint_exists(table, name)? {
            self.logger.warn(
                LogEntry::new("Check constraint was not created because it exists already")
                    .field("table_name", table)
                    .field("constraint_name", name),
            );
            return Ok(());
        }

        // NOT VALID only needs a brief lock; validation then scans without blocking writes
        let add = sql::add_check_constraint_not_valid(table, name, check);
        self.with_lock_retries(true, &mut || {
            self.execute(&add)?;
            Ok(Completion::Commit)
        })?;
        self.execute(&sql::validate_constraint(table, name))
    }

    fn remove_check_constraint(&self, table: &str, name: &str) -> Result<(), PartitionError> {
        let drop = sql::drop_constraint_if_exists(table, name);
        self.with_lock_retries(true, &mut || {
            self.execute(&drop)?;
            Ok(Completion::Commit)
        })
    }

    fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyDescriptor>, PartitionError> {
        let (schema, table) = split_identifier(self, table)?;
        let query = format!(
            r#"
            SELECT {FOREIGN_KEY_COLUMNS}
            FROM pg_constraint
            INNER JOIN pg_class source ON source.oid = pg_constraint.conrelid
            INNER JOIN pg_namespace ON pg_namespace.oid = source.relnamespace
            INNER JOIN pg_class target ON target.oid = pg_constraint.confrelid
            WHERE pg_constraint.contype = 'f'
              AND pg_namespace.nspname = $1
              AND source.relname = $2
            ORDER BY pg_constraint.conname
            "#
        );
        let rows = self.executor.query_all(&query, &[&schema, &table])?;
        rows.iter().map(foreign_key_from_row).collect()
    }

    fn add_foreign_key(&self, table: &str, fk: &ForeignKeyDescriptor) -> Result<(), PartitionError> {
        self.execute(&sql::add_foreign_key(table, fk))
    }

    fn referencing_foreign_keys(
        &self,
        table_identifier: &str,
    ) -> Result<Vec<ForeignKeyDescriptor>, PartitionError> {
        let (schema, table) = split_identifier(self, table_identifier)?;
        // conparentid = 0 filters out the per-partition clones of a partitioned foreign key
        let query = format!(
            r#"
            SELECT {FOREIGN_KEY_COLUMNS}
            FROM pg_constraint
            INNER JOIN pg_class source ON source.oid = pg_constraint.conrelid
            INNER JOIN pg_class target ON target.oid = pg_constraint.confrelid
            INNER JOIN pg_namespace ON pg_namespace.oid = target.relnamespace
            WHERE pg_constraint.contype = 'f'
              AND pg_constraint.conparentid = 0
              AND pg_namespace.nspname = $1
              AND target.relname = $2
            ORDER BY pg_constraint.conname
            "#
        );
        let rows = self.executor.query_all(&query, &[&schema, &table])?;
        rows.iter().map(foreign_key_from_row).collect()
    }

    fn sequences_owned_by(&self, table: &str) -> Result<Vec<SequenceOwnership>, PartitionError> {
        let rows = self.executor.query_all(SEQUENCES_OWNED_BY_SQL, &[&table])?;
        rows.iter()
            .map(|row| {
                Ok(SequenceOwnership {
                    name: row.try_get("seq_name")?,
                    column_name: row.try_get("col_name")?,
                })
            })
            .collect()
    }

    fn drop_table(&self, table: &str) -> Result<(), PartitionError> {
        self.execute(&sql::drop_table(table))
    }

    fn partitions(&self, parent_table: &str) -> Result<Vec<PartitionRecord>, PartitionError> {
        let rows = self.executor.query_all(PARTITIONS_SQL, &[&parent_table])?;
        rows.iter()
            .map(|row| {
                Ok(PartitionRecord {
                    schema: row.try_get("schema")?,
                    name: row.try_get("name")?,
                    condition: row.try_get("condition")?,
                })
            })
            .collect()
    }

    fn column_default(&self, table: &str, column: &str) -> Result<Option<String>, PartitionError> {
        let rows = self.executor.query_all(COLUMN_DEFAULT_SQL, &[&table, &column])?;
        match rows.first() {
            Some(row) => row.try_get("default_value").map_err(PartitionError::from),
            None => Ok(None),
        }
    }
}
