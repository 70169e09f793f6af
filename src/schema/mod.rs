//! Schema operations consumed by the partitioning components
//!
//! [`SchemaOperations`] is the seam between partitioning decisions and the database:
//! DDL execution, lock-retrying transactions and catalog introspection.
//! [`PgSchemaOperations`] implements it against a live PostgreSQL session.
//!
//! Nothing returned from these methods is cached. Callers re-read the catalog each
//! time they need to decide something.

pub mod lock_retries;
pub mod postgres;
pub mod sql;

pub use lock_retries::{Completion, WithLockRetries};
pub use postgres::PgSchemaOperations;

use crate::error::PartitionError;

/// Block run inside a lock-retrying transaction
///
/// Returning [`Completion::Rollback`] discards the block's work without raising an error.
pub type LockRetryBlock<'b> = dyn FnMut() -> Result<Completion, PartitionError> + 'b;

/// Kind of a table constraint (`pg_constraint.contype`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    Check,
    ForeignKey,
    Exclusion,
    Other,
}

impl ConstraintKind {
    pub fn from_contype(contype: &str) -> Self {
        match contype {
            "p" => ConstraintKind::PrimaryKey,
            "u" => ConstraintKind::Unique,
            "c" => ConstraintKind::Check,
            "f" => ConstraintKind::ForeignKey,
            "x" => ConstraintKind::Exclusion,
            _ => ConstraintKind::Other,
        }
    }
}

/// A constraint as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintDescriptor {
    pub name: String,
    pub kind: ConstraintKind,
    pub column_names: Vec<String>,
    /// `pg_get_constraintdef` output, e.g. `CHECK ((created_shard = 0))`
    pub definition: String,
    /// False for constraints added `NOT VALID` and never validated
    pub valid: bool,
}

impl ConstraintDescriptor {
    pub fn is_primary_or_unique(&self) -> bool {
        matches!(self.kind, ConstraintKind::PrimaryKey | ConstraintKind::Unique)
    }

    pub fn includes_column(&self, column: &str) -> bool {
        self.column_names.iter().any(|c| c == column)
    }
}

/// Chainable filters over the constraints of one table
#[derive(Debug, Clone)]
pub struct ConstraintScope {
    constraints: Vec<ConstraintDescriptor>,
}

impl ConstraintScope {
    pub fn new(constraints: Vec<ConstraintDescriptor>) -> Self {
        Self { constraints }
    }

    fn retain(mut self, keep: impl Fn(&ConstraintDescriptor) -> bool) -> Self {
        self.constraints.retain(|c| keep(c));
        self
    }

    #[must_use]
    pub fn primary_or_unique_constraints(self) -> Self {
        self.retain(ConstraintDescriptor::is_primary_or_unique)
    }

    #[must_use]
    pub fn check_constraints(self) -> Self {
        self.retain(|c| c.kind == ConstraintKind::Check)
    }

    #[must_use]
    pub fn valid(self) -> Self {
        self.retain(|c| c.valid)
    }

    #[must_use]
    pub fn including_column(self, column: &str) -> Self {
        self.retain(|c| c.includes_column(column))
    }

    #[must_use]
    pub fn not_including_column(self, column: &str) -> Self {
        self.retain(|c| !c.includes_column(column))
    }

    pub fn find(self, predicate: impl Fn(&ConstraintDescriptor) -> bool) -> Option<ConstraintDescriptor> {
        self.constraints.into_iter().find(|c| predicate(c))
    }

    pub fn into_vec(self) -> Vec<ConstraintDescriptor> {
        self.constraints
    }
}

/// Referential action of a foreign key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForeignKeyAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ForeignKeyAction {
    /// From `pg_constraint.confdeltype` / `confupdtype`
    pub fn from_catalog_code(code: &str) -> Self {
        match code {
            "r" => ForeignKeyAction::Restrict,
            "c" => ForeignKeyAction::Cascade,
            "n" => ForeignKeyAction::SetNull,
            "d" => ForeignKeyAction::SetDefault,
            _ => ForeignKeyAction::NoAction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDescriptor {
    pub name: String,
    pub from_table: String,
    pub to_table: String,
    pub columns: Vec<String>,
    pub referenced_columns: Vec<String>,
    pub on_delete: ForeignKeyAction,
    pub on_update: ForeignKeyAction,
    pub deferrable: bool,
    pub initially_deferred: bool,
    /// `false` for a key added `NOT VALID` and never validated
    pub valid: bool,
}

/// A sequence owned by a table column (serial / identity backing sequence)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceOwnership {
    pub name: String,
    pub column_name: String,
}

/// A partition as listed by the catalog, before its bound is parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub schema: String,
    pub name: String,
    /// `pg_get_expr(relpartbound, oid)`, e.g. `FOR VALUES IN ('3')`
    pub condition: String,
}

/// DDL execution and catalog introspection
pub trait SchemaOperations {
    /// Schema that unqualified table names resolve to
    fn current_schema(&self) -> Result<String, PartitionError>;

    /// Execute one statement without parameters
    fn execute(&self, sql: &str) -> Result<(), PartitionError>;

    /// Run `block` inside a transaction, retrying it when it times out waiting for locks
    ///
    /// With `raise_on_exhaustion`, running out of attempts is an error; without it, a final
    /// attempt is made with no lock timeout at all.
    fn with_lock_retries(
        &self,
        raise_on_exhaustion: bool,
        block: &mut LockRetryBlock<'_>,
    ) -> Result<(), PartitionError>;

    fn table_exists(&self, table: &str) -> Result<bool, PartitionError>;

    /// Every constraint on `schema.table`
    fn constraints(&self, table_identifier: &str) -> Result<Vec<ConstraintDescriptor>, PartitionError>;

    /// Add and validate a check constraint
    fn add_check_constraint(&self, table: &str, check: &str, name: &str) -> Result<(), PartitionError>;

    fn remove_check_constraint(&self, table: &str, name: &str) -> Result<(), PartitionError>;

    /// Foreign keys declared on `table`
    fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyDescriptor>, PartitionError>;

    fn add_foreign_key(&self, table: &str, fk: &ForeignKeyDescriptor) -> Result<(), PartitionError>;

    /// Non-inherited foreign keys on other tables that reference `schema.table`
    fn referencing_foreign_keys(
        &self,
        table_identifier: &str,
    ) -> Result<Vec<ForeignKeyDescriptor>, PartitionError>;

    fn sequences_owned_by(&self, table: &str) -> Result<Vec<SequenceOwnership>, PartitionError>;

    fn drop_table(&self, table: &str) -> Result<(), PartitionError>;

    /// Partitions attached to `parent_table`
    fn partitions(&self, parent_table: &str) -> Result<Vec<PartitionRecord>, PartitionError>;

    /// Raw `column_default` text, `None` when the column has no default
    fn column_default(&self, table: &str, column: &str) -> Result<Option<String>, PartitionError>;
}
