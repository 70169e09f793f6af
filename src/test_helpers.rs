//! Test doubles for the executor, logger and schema seams
//!
//! [`FakeSchema`] is an in-memory catalog. It applies the DDL produced by
//! [`crate::schema::sql`] to its tables, so tests assert on catalog state rather than
//! on statement text.

use crate::error::PartitionError;
use crate::executor::SqlExecutor;
use crate::logger::{LogEntry, PartitionLogger};
use crate::schema::{
    sql, Completion, ConstraintDescriptor, ConstraintKind, ForeignKeyDescriptor, LockRetryBlock,
    PartitionRecord, SchemaOperations, SequenceOwnership,
};
use may_postgres::types::ToSql;
use may_postgres::Row;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Records every statement; fails only on statements registered with [`failing_on`]
///
/// [`failing_on`]: RecordingExecutor::failing_on
#[derive(Default)]
pub struct RecordingExecutor {
    captured_sql: Mutex<Vec<String>>,
    failures: Vec<(String, String)>,
}

impl RecordingExecutor {
    pub fn failing_on(statement: &str, message: &str) -> Self {
        Self {
            captured_sql: Mutex::new(Vec::new()),
            failures: vec![(statement.to_string(), message.to_string())],
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.captured_sql.lock().unwrap().clone()
    }

    pub fn count(&self, statement: &str) -> usize {
        self.statements().iter().filter(|s| *s == statement).count()
    }

    fn capture(&self, query: &str) -> Result<(), PartitionError> {
        self.captured_sql.lock().unwrap().push(query.to_string());
        match self.failures.iter().find(|(statement, _)| statement == query) {
            Some((_, message)) => Err(PartitionError::Query(message.clone())),
            None => Ok(()),
        }
    }
}

impl SqlExecutor for RecordingExecutor {
    fn execute(&self, query: &str, _params: &[&dyn ToSql]) -> Result<u64, PartitionError> {
        self.capture(query).map(|_| 0)
    }

    fn query_one(&self, query: &str, _params: &[&dyn ToSql]) -> Result<Row, PartitionError> {
        self.capture(query)?;
        // Rows can only come from a live session
        Err(PartitionError::Query("RecordingExecutor: no rows available".to_string()))
    }

    fn query_all(&self, query: &str, _params: &[&dyn ToSql]) -> Result<Vec<Row>, PartitionError> {
        self.capture(query)?;
        Err(PartitionError::Query("RecordingExecutor: no rows available".to_string()))
    }
}

/// Keeps log entries by level
#[derive(Default)]
pub struct RecordingLogger {
    infos: Mutex<Vec<LogEntry>>,
    warnings: Mutex<Vec<LogEntry>>,
    errors: Mutex<Vec<LogEntry>>,
}

impl RecordingLogger {
    pub fn infos(&self) -> Vec<LogEntry> {
        self.infos.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> Vec<LogEntry> {
        self.warnings.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<LogEntry> {
        self.errors.lock().unwrap().clone()
    }
}

impl PartitionLogger for RecordingLogger {
    fn info(&self, entry: LogEntry) {
        self.infos.lock().unwrap().push(entry);
    }

    fn warn(&self, entry: LogEntry) {
        self.warnings.lock().unwrap().push(entry);
    }

    fn error(&self, entry: LogEntry) {
        self.errors.lock().unwrap().push(entry);
    }
}

const IDENT: &str = r#"((?:"[^"]+"\.)?"[^"]+")"#;

fn statement_regex(pattern: &str) -> Regex {
    Regex::new(&pattern.replace("{ID}", IDENT)).unwrap()
}

static CREATE_PARENT: Lazy<Regex> = Lazy::new(|| {
    statement_regex(
        r#"^CREATE TABLE IF NOT EXISTS {ID} \(LIKE {ID} INCLUDING ALL\) PARTITION BY LIST \("([^"]+)"\)$"#,
    )
});
static CREATE_PARTITION: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r"^CREATE TABLE IF NOT EXISTS {ID} PARTITION OF {ID} FOR VALUES IN \((-?\d+)\)$")
});
static ATTACH: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r"^ALTER TABLE {ID} ATTACH PARTITION {ID} FOR VALUES IN \((-?\d+)\)$")
});
static DETACH: Lazy<Regex> =
    Lazy::new(|| statement_regex(r"^ALTER TABLE {ID} DETACH PARTITION {ID}$"));
static SEQUENCE_OWNER: Lazy<Regex> =
    Lazy::new(|| statement_regex(r#"^ALTER SEQUENCE {ID} OWNED BY {ID}\."([^"]+)"$"#));
static ADD_CHECK: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r#"^ALTER TABLE {ID} ADD CONSTRAINT "([^"]+)" CHECK \((.+)\) NOT VALID$"#)
});
static VALIDATE: Lazy<Regex> =
    Lazy::new(|| statement_regex(r#"^ALTER TABLE {ID} VALIDATE CONSTRAINT "([^"]+)"$"#));
static DROP_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r#"^ALTER TABLE {ID} DROP CONSTRAINT (IF EXISTS )?"([^"]+)"$"#)
});
static LOCK: Lazy<Regex> =
    Lazy::new(|| statement_regex(r"^LOCK TABLE {ID} IN ACCESS EXCLUSIVE MODE$"));
static SET_DEFAULT: Lazy<Regex> =
    Lazy::new(|| statement_regex(r#"^ALTER TABLE {ID} ALTER COLUMN "([^"]+)" SET DEFAULT (.+)$"#));
static DROP_TABLE: Lazy<Regex> = Lazy::new(|| statement_regex(r"^DROP TABLE {ID}$"));
static EQUALITY_CHECK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+) = (-?\d+)$").unwrap());

/// `"schema"."name"` or `"name"` to `(schema, name)`
fn unquote(identifier: &str) -> (Option<String>, String) {
    let parts: Vec<String> = identifier
        .split("\".\"")
        .map(|part| part.trim_matches('"').replace("\"\"", "\""))
        .collect();
    match parts.as_slice() {
        [schema, name] => (Some(schema.clone()), name.clone()),
        _ => (None, parts.concat()),
    }
}

fn bare(identifier: &str) -> String {
    unquote(identifier).1
}

#[derive(Debug, Clone)]
pub struct FakeTable {
    pub schema: String,
    pub constraints: Vec<ConstraintDescriptor>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    pub column_defaults: BTreeMap<String, String>,
    pub partitioned_by: Option<String>,
    /// Parent table and the bound as `pg_get_expr` renders it
    pub partition_of: Option<(String, String)>,
}

impl FakeTable {
    fn new(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            constraints: Vec::new(),
            foreign_keys: Vec::new(),
            column_defaults: BTreeMap::new(),
            partitioned_by: None,
            partition_of: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    tables: BTreeMap<String, FakeTable>,
    /// Sequence name to owning `(table, column)`
    sequences: BTreeMap<String, (String, String)>,
}

type LockHook = Box<dyn FnOnce(&FakeSchema)>;

/// In-memory catalog implementing [`SchemaOperations`]
///
/// Tables are keyed by their unqualified name; the current schema is `public`.
/// Lock-retrying blocks run once: a block that errors or asks for a rollback has its
/// catalog changes discarded. Changes made by an [`on_lock`](FakeSchema::on_lock) hook
/// count as committed by another session and survive the rollback.
#[derive(Default)]
pub struct FakeSchema {
    catalog: RefCell<Catalog>,
    statements: RefCell<Vec<String>>,
    lock_retry_calls: RefCell<Vec<bool>>,
    lock_hook: RefCell<Option<LockHook>>,
    /// Catalog to restore when the running lock-retrying block is rolled back
    snapshot: RefCell<Option<Catalog>>,
    failures: RefCell<Vec<(String, String)>>,
    exhaust_lock_retries: RefCell<bool>,
}

impl FakeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, name: &str) {
        self.catalog
            .borrow_mut()
            .tables
            .insert(name.to_string(), FakeTable::new("public"));
    }

    pub fn add_partitioned_table(&self, name: &str, column: &str) {
        let mut table = FakeTable::new("public");
        table.partitioned_by = Some(column.to_string());
        self.catalog.borrow_mut().tables.insert(name.to_string(), table);
    }

    /// Attach `<parent>_<value>` in `partitions_dynamic`
    pub fn add_partition(&self, parent: &str, value: i64) {
        self.add_raw_partition(
            parent,
            crate::config::DEFAULT_PARTITION_SCHEMA,
            &format!("{parent}_{value}"),
            &format!("FOR VALUES IN ('{value}')"),
        );
    }

    /// Attach a partition with an arbitrary bound expression
    pub fn add_raw_partition(&self, parent: &str, schema: &str, name: &str, condition: &str) {
        let mut table = FakeTable::new(schema);
        table.partition_of = Some((parent.to_string(), condition.to_string()));
        self.catalog.borrow_mut().tables.insert(name.to_string(), table);
    }

    pub fn add_constraint(&self, table: &str, name: &str, kind: ConstraintKind, columns: &[&str]) {
        let definition = match kind {
            ConstraintKind::PrimaryKey => format!("PRIMARY KEY ({})", columns.join(", ")),
            ConstraintKind::Unique => format!("UNIQUE ({})", columns.join(", ")),
            _ => String::new(),
        };
        self.with_table(table, |t| {
            t.constraints.push(ConstraintDescriptor {
                name: name.to_string(),
                kind,
                column_names: columns.iter().map(|c| c.to_string()).collect(),
                definition,
                valid: true,
            });
        });
    }

    pub fn add_check(&self, table: &str, name: &str, column: &str, definition: &str, valid: bool) {
        self.with_table(table, |t| {
            t.constraints.push(ConstraintDescriptor {
                name: name.to_string(),
                kind: ConstraintKind::Check,
                column_names: vec![column.to_string()],
                definition: definition.to_string(),
                valid,
            });
        });
    }

    pub fn add_table_foreign_key(&self, fk: ForeignKeyDescriptor) {
        let table = fk.from_table.clone();
        self.with_table(&table, |t| t.foreign_keys.push(fk));
    }

    pub fn add_sequence(&self, name: &str, table: &str, column: &str) {
        self.catalog
            .borrow_mut()
            .sequences
            .insert(name.to_string(), (table.to_string(), column.to_string()));
    }

    pub fn set_column_default(&self, table: &str, column: &str, value: &str) {
        self.with_table(table, |t| {
            t.column_defaults.insert(column.to_string(), value.to_string());
        });
    }

    /// Run `hook` once, when the next `LOCK TABLE` statement executes
    pub fn on_lock(&self, hook: impl FnOnce(&FakeSchema) + 'static) {
        *self.lock_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Fail every statement containing `fragment`
    pub fn fail_statements_containing(&self, fragment: &str, message: &str) {
        self.failures
            .borrow_mut()
            .push((fragment.to_string(), message.to_string()));
    }

    /// Make lock-retrying blocks behave as if every attempt timed out
    pub fn exhaust_lock_retries(&self) {
        *self.exhaust_lock_retries.borrow_mut() = true;
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.borrow().clone()
    }

    /// `raise_on_exhaustion` of every `with_lock_retries` call, in order
    pub fn lock_retry_calls(&self) -> Vec<bool> {
        self.lock_retry_calls.borrow().clone()
    }

    pub fn table(&self, name: &str) -> Option<FakeTable> {
        self.catalog.borrow().tables.get(name).cloned()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.catalog.borrow().tables.contains_key(name)
    }

    pub fn sequence_owner(&self, name: &str) -> Option<(String, String)> {
        self.catalog.borrow().sequences.get(name).cloned()
    }

    pub fn constraint_names(&self, table: &str) -> Vec<String> {
        self.table(table)
            .map(|t| t.constraints.into_iter().map(|c| c.name).collect())
            .unwrap_or_default()
    }

    fn with_table(&self, name: &str, f: impl FnOnce(&mut FakeTable)) {
        let mut catalog = self.catalog.borrow_mut();
        let table = catalog
            .tables
            .get_mut(name)
            .unwrap_or_else(|| panic!("FakeSchema: no table {name}"));
        f(table);
    }

    fn apply(&self, statement: &str) -> Result<(), PartitionError> {
        if let Some(captures) = LOCK.captures(statement) {
            let table = bare(&captures[1]);
            if !self.has_table(&table) {
                return Err(missing_relation(&table));
            }
            let hook = self.lock_hook.borrow_mut().take();
            if let Some(hook) = hook {
                hook(self);
                // The hook stands in for another session that committed first
                if self.snapshot.borrow().is_some() {
                    let committed = self.catalog.borrow().clone();
                    *self.snapshot.borrow_mut() = Some(committed);
                }
            }
            return Ok(());
        }

        let mut catalog = self.catalog.borrow_mut();
        if let Some(c) = CREATE_PARENT.captures(statement) {
            let (parent, source, column) = (bare(&c[1]), bare(&c[2]), c[3].to_string());
            if catalog.tables.contains_key(&parent) {
                return Ok(());
            }
            let source_table = catalog
                .tables
                .get(&source)
                .cloned()
                .ok_or_else(|| missing_relation(&source))?;
            let mut table = FakeTable::new(&source_table.schema);
            table.partitioned_by = Some(column);
            table.column_defaults = source_table.column_defaults;
            table.constraints = source_table
                .constraints
                .into_iter()
                .filter(|c| c.kind != ConstraintKind::ForeignKey)
                .map(|mut c| {
                    match c.kind {
                        ConstraintKind::PrimaryKey => c.name = format!("{parent}_pkey"),
                        ConstraintKind::Unique => {
                            c.name = format!("{parent}_{}_key", c.column_names.join("_"))
                        }
                        _ => {}
                    }
                    c
                })
                .collect();
            catalog.tables.insert(parent, table);
        } else if let Some(c) = CREATE_PARTITION.captures(statement) {
            let (schema, name) = unquote(&c[1]);
            let (parent, value) = (bare(&c[2]), c[3].to_string());
            if catalog.tables.contains_key(&name) {
                return Ok(());
            }
            let condition = format!("FOR VALUES IN ('{value}')");
            ensure_partitioned(&catalog, &parent)?;
            if catalog
                .tables
                .values()
                .any(|t| t.partition_of == Some((parent.clone(), condition.clone())))
            {
                return Err(PartitionError::Query(format!(
                    "partition of \"{parent}\" for value {value} already exists"
                )));
            }
            let mut table = FakeTable::new(schema.as_deref().unwrap_or("public"));
            table.partition_of = Some((parent, condition));
            catalog.tables.insert(name, table);
        } else if let Some(c) = ATTACH.captures(statement) {
            let (parent, child, value) = (bare(&c[1]), bare(&c[2]), c[3].to_string());
            ensure_partitioned(&catalog, &parent)?;
            let table = catalog
                .tables
                .get_mut(&child)
                .ok_or_else(|| missing_relation(&child))?;
            if table.partition_of.is_some() {
                return Err(PartitionError::Query(format!("\"{child}\" is already a partition")));
            }
            table.partition_of = Some((parent, format!("FOR VALUES IN ('{value}')")));
        } else if let Some(c) = DETACH.captures(statement) {
            let (parent, child) = (bare(&c[1]), bare(&c[2]));
            let table = catalog
                .tables
                .get_mut(&child)
                .ok_or_else(|| missing_relation(&child))?;
            match &table.partition_of {
                Some((owner, _)) if *owner == parent => table.partition_of = None,
                _ => {
                    return Err(PartitionError::Query(format!(
                        "relation \"{child}\" is not a partition of relation \"{parent}\""
                    )))
                }
            }
        } else if let Some(c) = SEQUENCE_OWNER.captures(statement) {
            let (sequence, table, column) = (bare(&c[1]), bare(&c[2]), c[3].to_string());
            if !catalog.tables.contains_key(&table) {
                return Err(missing_relation(&table));
            }
            let owner = catalog
                .sequences
                .get_mut(&sequence)
                .ok_or_else(|| missing_relation(&sequence))?;
            *owner = (table, column);
        } else if let Some(c) = ADD_CHECK.captures(statement) {
            let (table, name, check) = (bare(&c[1]), c[2].to_string(), c[3].to_string());
            let column_names = EQUALITY_CHECK
                .captures(&check)
                .map(|e| vec![e[1].to_string()])
                .unwrap_or_default();
            let table = catalog
                .tables
                .get_mut(&table)
                .ok_or_else(|| missing_relation(&table))?;
            if table.constraints.iter().any(|c| c.name == name) {
                return Err(PartitionError::Query(format!("constraint \"{name}\" already exists")));
            }
            table.constraints.push(ConstraintDescriptor {
                name,
                kind: ConstraintKind::Check,
                column_names,
                definition: format!("CHECK (({check}))"),
                valid: false,
            });
        } else if let Some(c) = VALIDATE.captures(statement) {
            let (table, name) = (bare(&c[1]), c[2].to_string());
            let constraint = catalog
                .tables
                .get_mut(&table)
                .and_then(|t| t.constraints.iter_mut().find(|c| c.name == name))
                .ok_or_else(|| missing_constraint(&table, &name))?;
            constraint.valid = true;
        } else if let Some(c) = DROP_CONSTRAINT.captures(statement) {
            let (table, if_exists, name) = (bare(&c[1]), c.get(2).is_some(), c[3].to_string());
            let exists = catalog
                .tables
                .get(&table)
                .map(|t| t.constraints.iter().any(|c| c.name == name))
                .unwrap_or(false);
            if !exists {
                return if if_exists {
                    Ok(())
                } else {
                    Err(missing_constraint(&table, &name))
                };
            }
            // Attached partitions inherit the parent's constraints
            for (child_name, child) in catalog.tables.iter_mut() {
                let inherits = matches!(&child.partition_of, Some((parent, _)) if *parent == table);
                if *child_name == table || inherits {
                    child.constraints.retain(|c| c.name != name);
                }
            }
        } else if let Some(c) = SET_DEFAULT.captures(statement) {
            let (table, column, value) = (bare(&c[1]), c[2].to_string(), c[3].to_string());
            catalog
                .tables
                .get_mut(&table)
                .ok_or_else(|| missing_relation(&table))?
                .column_defaults
                .insert(column, value);
        } else if let Some(c) = DROP_TABLE.captures(statement) {
            let table = bare(&c[1]);
            if catalog.tables.remove(&table).is_none() {
                return Err(missing_relation(&table));
            }
            catalog
                .tables
                .retain(|_, t| !matches!(&t.partition_of, Some((parent, _)) if *parent == table));
            catalog.sequences.retain(|_, (owner, _)| *owner != table);
        } else {
            return Err(PartitionError::Query(format!(
                "FakeSchema: unsupported statement: {statement}"
            )));
        }
        Ok(())
    }
}

fn missing_relation(name: &str) -> PartitionError {
    PartitionError::Query(format!("relation \"{name}\" does not exist"))
}

fn missing_constraint(table: &str, name: &str) -> PartitionError {
    PartitionError::Query(format!(
        "constraint \"{name}\" of relation \"{table}\" does not exist"
    ))
}

fn ensure_partitioned(catalog: &Catalog, parent: &str) -> Result<(), PartitionError> {
    match catalog.tables.get(parent) {
        Some(t) if t.partitioned_by.is_some() => Ok(()),
        Some(_) => Err(PartitionError::Query(format!(
            "table \"{parent}\" is not partitioned"
        ))),
        None => Err(missing_relation(parent)),
    }
}

impl SchemaOperations for FakeSchema {
    fn current_schema(&self) -> Result<String, PartitionError> {
        Ok("public".to_string())
    }

    fn execute(&self, statement: &str) -> Result<(), PartitionError> {
        self.statements.borrow_mut().push(statement.to_string());
        let failure = self
            .failures
            .borrow()
            .iter()
            .find(|(fragment, _)| statement.contains(fragment.as_str()))
            .map(|(_, message)| message.clone());
        if let Some(message) = failure {
            return Err(PartitionError::Query(message));
        }
        self.apply(statement)
    }

    fn with_lock_retries(
        &self,
        raise_on_exhaustion: bool,
        block: &mut LockRetryBlock<'_>,
    ) -> Result<(), PartitionError> {
        self.lock_retry_calls.borrow_mut().push(raise_on_exhaustion);
        if *self.exhaust_lock_retries.borrow() && raise_on_exhaustion {
            return Err(PartitionError::LockRetriesExhausted {
                attempts: 10,
                message: "canceling statement due to lock timeout".to_string(),
            });
        }

        let outer = self.snapshot.replace(Some(self.catalog.borrow().clone()));
        let result = block();
        let snapshot = self.snapshot.replace(outer);
        match result {
            Ok(Completion::Commit) => Ok(()),
            Ok(Completion::Rollback) => {
                if let Some(snapshot) = snapshot {
                    *self.catalog.borrow_mut() = snapshot;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(snapshot) = snapshot {
                    *self.catalog.borrow_mut() = snapshot;
                }
                Err(e)
            }
        }
    }

    fn table_exists(&self, table: &str) -> Result<bool, PartitionError> {
        Ok(self.has_table(table))
    }

    fn constraints(&self, table_identifier: &str) -> Result<Vec<ConstraintDescriptor>, PartitionError> {
        let table = table_identifier
            .split_once('.')
            .map(|(_, t)| t)
            .unwrap_or(table_identifier);
        Ok(self.table(table).map(|t| t.constraints).unwrap_or_default())
    }

    fn add_check_constraint(&self, table: &str, check: &str, name: &str) -> Result<(), PartitionError> {
        if self.constraint_names(table).iter().any(|c| c == name) {
            return Ok(());
        }
        self.execute(&sql::add_check_constraint_not_valid(table, name, check))?;
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
        Ok(self.table(table).map(|t| t.foreign_keys).unwrap_or_default())
    }

    fn add_foreign_key(&self, table: &str, fk: &ForeignKeyDescriptor) -> Result<(), PartitionError> {
        self.statements.borrow_mut().push(sql::add_foreign_key(table, fk));
        let mut copy = fk.clone();
        copy.from_table = table.to_string();
        let mut catalog = self.catalog.borrow_mut();
        let target = catalog
            .tables
            .get_mut(table)
            .ok_or_else(|| missing_relation(table))?;
        if target.foreign_keys.iter().any(|existing| existing.name == fk.name) {
            return Err(PartitionError::Query(format!(
                "constraint \"{}\" for relation \"{table}\" already exists",
                fk.name
            )));
        }
        target.foreign_keys.push(copy);
        Ok(())
    }

    fn referencing_foreign_keys(
        &self,
        table_identifier: &str,
    ) -> Result<Vec<ForeignKeyDescriptor>, PartitionError> {
        let table = table_identifier
            .split_once('.')
            .map(|(_, t)| t)
            .unwrap_or(table_identifier);
        Ok(self
            .catalog
            .borrow()
            .tables
            .values()
            .flat_map(|t| t.foreign_keys.iter())
            .filter(|fk| fk.to_table == table)
            .cloned()
            .collect())
    }

    fn sequences_owned_by(&self, table: &str) -> Result<Vec<SequenceOwnership>, PartitionError> {
        Ok(self
            .catalog
            .borrow()
            .sequences
            .iter()
            .filter(|(_, (owner, _))| owner == table)
            .map(|(name, (_, column))| SequenceOwnership {
                name: name.clone(),
                column_name: column.clone(),
            })
            .collect())
    }

    fn drop_table(&self, table: &str) -> Result<(), PartitionError> {
        self.execute(&sql::drop_table(table))
    }

    fn partitions(&self, parent_table: &str) -> Result<Vec<PartitionRecord>, PartitionError> {
        Ok(self
            .catalog
            .borrow()
            .tables
            .iter()
            .filter_map(|(name, t)| match &t.partition_of {
                Some((parent, condition)) if parent == parent_table => Some(PartitionRecord {
                    schema: t.schema.clone(),
                    name: name.clone(),
                    condition: condition.clone(),
                }),
                _ => None,
            })
            .collect())
    }

    fn column_default(&self, table: &str, column: &str) -> Result<Option<String>, PartitionError> {
        Ok(self
            .table(table)
            .and_then(|t| t.column_defaults.get(column).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unquote_identifiers() {
        assert_eq!(unquote("\"events\""), (None, "events".to_string()));
        assert_eq!(
            unquote("\"partitions_dynamic\".\"events_1\""),
            (Some("partitions_dynamic".to_string()), "events_1".to_string())
        );
    }

    #[test]
    fn test_unknown_statement_is_rejected() {
        let schema = FakeSchema::new();
        assert!(schema.execute("VACUUM events").is_err());
    }

    #[test]
    fn test_rolled_back_block_discards_changes() {
        let schema = FakeSchema::new();
        schema.add_table("events");

        schema
            .with_lock_retries(true, &mut || {
                schema.execute(&sql::change_column_default("events", "created_shard", 4))?;
                Ok(Completion::Rollback)
            })
            .unwrap();

        assert_eq!(schema.column_default("events", "created_shard").unwrap(), None);
        assert_eq!(schema.lock_retry_calls(), vec![true]);
    }

    #[test]
    fn test_create_partition_rejects_duplicate_bound() {
        let schema = FakeSchema::new();
        schema.add_partitioned_table("events", "created_shard");
        schema.add_partition("events", 1);

        let err = schema
            .execute(&sql::create_list_partition("partitions_dynamic", "other_1", "events", 1))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
