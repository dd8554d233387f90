//! Diff engine: declared model vs live schema

use crate::migration::history::{HISTORY_TABLE, VERSION_TABLE};
use crate::migration::model::{
    add_live_column_sql, create_live_table_sql, creation_order, dependency_order, drop_column_sql,
    drop_table_sql, set_not_null_sql,
};
use crate::migration::{
    LiveSchema, LiveTable, MigrationError, SchemaIntrospector, SchemaModel, TableModel,
};
use std::collections::HashSet;

/// Statements that move the live schema to the declared one, and back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    pub upgrade: Vec<String>,
    pub downgrade: Vec<String>,
}

impl SchemaDiff {
    /// `true` when the live schema already matches
    pub fn is_empty(&self) -> bool {
        self.upgrade.is_empty()
    }

    pub fn upgrade_sql(&self) -> String {
        join_statements(&self.upgrade)
    }

    pub fn downgrade_sql(&self) -> String {
        join_statements(&self.downgrade)
    }
}

fn join_statements(statements: &[String]) -> String {
    statements
        .iter()
        .map(|s| format!("{};", s.trim_end_matches(';')))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Produces the schema changes a new migration script should contain
pub trait DiffEngine {
    /// Compare the target schema with the live one
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::DiffUnavailable` if the live schema cannot be read.
    fn diff(&self) -> Result<SchemaDiff, MigrationError>;
}

/// [`DiffEngine`] comparing a [`SchemaModel`] with an introspected schema
///
/// Bookkeeping tables (`schemagate_*`) and the configured ignore list are never touched.
pub struct ModelDiffEngine<I> {
    model: SchemaModel,
    introspector: I,
    ignored: HashSet<String>,
}

impl<I: SchemaIntrospector> ModelDiffEngine<I> {
    pub fn new(model: SchemaModel, introspector: I) -> Self {
        let ignored = [VERSION_TABLE, HISTORY_TABLE]
            .iter()
            .map(|t| (*t).to_string())
            .collect();
        Self {
            model,
            introspector,
            ignored,
        }
    }

    /// Leave these live tables alone
    #[must_use]
    pub fn with_ignored<S: Into<String>>(mut self, tables: impl IntoIterator<Item = S>) -> Self {
        self.ignored.extend(tables.into_iter().map(Into::into));
        self
    }

    fn is_ignored(&self, table: &str) -> bool {
        table.starts_with("schemagate_") || self.ignored.contains(table)
    }

    fn compare(&self, live: &LiveSchema) -> Result<Vec<(String, String)>, MigrationError> {
        // (upgrade, downgrade) pairs; downgrade runs them in reverse
        let mut steps = Vec::new();

        let missing: Vec<&TableModel> = self
            .model
            .tables
            .iter()
            .filter(|t| !self.is_ignored(&t.name) && live.table(&t.name).is_none())
            .collect();
        for table in creation_order(&missing)? {
            steps.push((table.create_table_sql(), drop_table_sql(&table.name)));
        }

        for table in &self.model.tables {
            if self.is_ignored(&table.name) {
                continue;
            }
            let Some(live_table) = live.table(&table.name) else {
                continue;
            };

            for column in &table.columns {
                match live_table.columns.get(&column.name) {
                    None => steps.push((
                        column.add_column_sql(&table.name),
                        drop_column_sql(&table.name, &column.name),
                    )),
                    Some(live_column) => {
                        let declared_nullable = column.nullable && !column.primary_key;
                        if declared_nullable != live_column.nullable {
                            steps.push((
                                set_not_null_sql(&table.name, &column.name, !declared_nullable),
                                set_not_null_sql(&table.name, &column.name, !live_column.nullable),
                            ));
                        }
                    }
                }
            }

            for (name, data_type, nullable) in live_table.columns_in_order() {
                if table.column(name).is_none() {
                    steps.push((
                        drop_column_sql(&table.name, name),
                        add_live_column_sql(&table.name, name, data_type, nullable),
                    ));
                }
            }
        }

        for (name, live_table) in self.extra_tables_drop_order(live)? {
            steps.push((drop_table_sql(name), create_live_table_sql(name, live_table)));
        }

        Ok(steps)
    }

    /// Live tables missing from the model, referencing tables before the ones they reference
    fn extra_tables_drop_order<'l>(
        &self,
        live: &'l LiveSchema,
    ) -> Result<Vec<(&'l str, &'l LiveTable)>, MigrationError> {
        let extra: Vec<(&str, &LiveTable)> = live
            .tables
            .iter()
            .filter(|(name, _)| !self.is_ignored(name) && self.model.table(name).is_none())
            .map(|(name, table)| (name.as_str(), table))
            .collect();

        let names: Vec<&str> = extra.iter().map(|(name, _)| *name).collect();
        let dependencies: Vec<Vec<String>> = extra
            .iter()
            .map(|(name, table)| table.dependencies(name))
            .collect();

        let order = dependency_order(&names, &dependencies).map_err(|stuck| {
            MigrationError::DiffUnavailable(format!(
                "tables {} reference each other in a cycle; drop them by hand",
                stuck.join(", ")
            ))
        })?;
        Ok(order.into_iter().rev().map(|i| extra[i]).collect())
    }
}

impl<I: SchemaIntrospector> DiffEngine for ModelDiffEngine<I> {
    fn diff(&self) -> Result<SchemaDiff, MigrationError> {
        let live = self.introspector.introspect().map_err(|e| match e {
            MigrationError::DiffUnavailable(_) => e,
            other => MigrationError::DiffUnavailable(other.to_string()),
        })?;

        let steps = self.compare(&live)?;
        log::debug!("schema diff produced {} change(s)", steps.len());

        let mut diff = SchemaDiff::default();
        for (upgrade, _) in &steps {
            diff.upgrade.push(upgrade.clone());
        }
        for (_, downgrade) in steps.into_iter().rev() {
            diff.downgrade.push(downgrade);
        }
        Ok(diff)
    }
}
