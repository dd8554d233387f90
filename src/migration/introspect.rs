//! Live schema introspection

use crate::executor::{DbError, SqlExecutor};
use crate::migration::model::extract_foreign_key_table;
use crate::migration::MigrationError;
use std::collections::BTreeMap;

/// A column as the database reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    /// `format_type()` output, e.g. `character varying(255)`
    pub data_type: String,
    pub nullable: bool,
}

/// A primary key, unique or foreign key constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConstraint {
    pub name: String,
    /// `pg_get_constraintdef()` output, e.g. `FOREIGN KEY (company_id) REFERENCES companies(id)`
    pub definition: String,
}

impl LiveConstraint {
    /// Table named after `REFERENCES`, if this is a foreign key
    pub fn referenced_table(&self) -> Option<String> {
        let upper = self.definition.to_ascii_uppercase();
        let start = upper.find("REFERENCES ")? + "REFERENCES ".len();
        Some(extract_foreign_key_table(&self.definition[start..]))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveTable {
    /// Columns keyed by name, in attribute order via `ordinal`
    pub columns: BTreeMap<String, LiveColumn>,
    /// Column names in attribute order
    pub ordinal: Vec<String>,
    /// Key constraints, primary key first
    pub constraints: Vec<LiveConstraint>,
}

impl LiveTable {
    pub fn with_constraint(mut self, name: &str, definition: &str) -> Self {
        self.constraints.push(LiveConstraint {
            name: name.to_string(),
            definition: definition.to_string(),
        });
        self
    }

    /// Other tables this one references through foreign keys
    pub fn dependencies(&self, own_name: &str) -> Vec<String> {
        let mut deps: Vec<String> = self
            .constraints
            .iter()
            .filter_map(LiveConstraint::referenced_table)
            .filter(|t| t != own_name)
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    pub fn with_column(mut self, name: &str, data_type: &str, nullable: bool) -> Self {
        self.add_column(name, data_type, nullable);
        self
    }

    pub fn add_column(&mut self, name: &str, data_type: &str, nullable: bool) {
        if self
            .columns
            .insert(
                name.to_string(),
                LiveColumn {
                    data_type: data_type.to_string(),
                    nullable,
                },
            )
            .is_none()
        {
            self.ordinal.push(name.to_string());
        }
    }

    /// `(name, data_type, nullable)` in attribute order
    pub fn columns_in_order(&self) -> impl Iterator<Item = (&str, &str, bool)> {
        self.ordinal.iter().filter_map(|name| {
            self.columns
                .get(name)
                .map(|c| (name.as_str(), c.data_type.as_str(), c.nullable))
        })
    }
}

/// Snapshot of the tables in one schema
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSchema {
    pub tables: BTreeMap<String, LiveTable>,
}

impl LiveSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, table: LiveTable) -> Self {
        self.tables.insert(name.to_string(), table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&LiveTable> {
        self.tables.get(name)
    }
}

/// Source of the live schema
pub trait SchemaIntrospector {
    /// Read the current tables and columns
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if the catalog cannot be read.
    fn introspect(&self) -> Result<LiveSchema, MigrationError>;
}

/// A snapshot is its own introspector
impl SchemaIntrospector for LiveSchema {
    fn introspect(&self) -> Result<LiveSchema, MigrationError> {
        Ok(self.clone())
    }
}

/// Reads ordinary tables of one schema from `pg_catalog`
pub struct PostgresIntrospector<'a> {
    executor: &'a dyn SqlExecutor,
    schema: String,
}

impl<'a> PostgresIntrospector<'a> {
    pub fn new(executor: &'a dyn SqlExecutor, schema: impl Into<String>) -> Self {
        Self {
            executor,
            schema: schema.into(),
        }
    }
}

impl SchemaIntrospector for PostgresIntrospector<'_> {
    fn introspect(&self) -> Result<LiveSchema, MigrationError> {
        let rows = self.executor.query_all(
            r#"
            SELECT c.relname::text,
                   a.attname::text,
                   format_type(a.atttypid, a.atttypmod),
                   NOT a.attnotnull
            FROM pg_catalog.pg_attribute a
            JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1
              AND c.relkind = 'r'
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY c.relname, a.attnum
            "#,
            &[&self.schema],
        )?;

        let mut schema = LiveSchema::new();
        for row in rows {
            let table: String = row.try_get(0).map_err(DbError::from)?;
            let column: String = row.try_get(1).map_err(DbError::from)?;
            let data_type: String = row.try_get(2).map_err(DbError::from)?;
            let nullable: bool = row.try_get(3).map_err(DbError::from)?;

            schema
                .tables
                .entry(table)
                .or_default()
                .add_column(&column, &data_type, nullable);
        }

        let rows = self.executor.query_all(
            r#"
            SELECT c.relname::text,
                   con.conname::text,
                   pg_get_constraintdef(con.oid)
            FROM pg_catalog.pg_constraint con
            JOIN pg_catalog.pg_class c ON c.oid = con.conrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1
              AND c.relkind = 'r'
              AND con.contype IN ('p', 'u', 'f')
            ORDER BY c.relname, con.contype <> 'p', con.conname
            "#,
            &[&self.schema],
        )?;

        for row in rows {
            let table: String = row.try_get(0).map_err(DbError::from)?;
            let name: String = row.try_get(1).map_err(DbError::from)?;
            let definition: String = row.try_get(2).map_err(DbError::from)?;

            if let Some(live_table) = schema.tables.get_mut(&table) {
                live_table.constraints.push(LiveConstraint { name, definition });
            }
        }

        log::debug!(
            "introspected {} table(s) in schema '{}'",
            schema.tables.len(),
            self.schema
        );
        Ok(schema)
    }
}
