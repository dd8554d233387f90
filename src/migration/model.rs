//! Declared schema model
//!
//! The tables a service expects, declared in TOML:
//!
//! ```toml
//! [[tables]]
//! name = "users"
//!
//! [[tables.columns]]
//! name = "id"
//! type = "uuid"
//! primary_key = true
//! default = "gen_random_uuid()"
//!
//! [[tables.columns]]
//! name = "company_id"
//! type = "uuid"
//! nullable = true
//! references = "companies(id) ON DELETE CASCADE"
//! ```
//!
//! The diff engine compares this model with the live catalog and renders DDL with
//! `sea-query`.

use crate::migration::{LiveTable, MigrationError};
use sea_query::{Alias, ColumnDef, Expr, PostgresQueryBuilder, Table};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

/// Every table the service expects
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct SchemaModel {
    #[serde(default)]
    pub tables: Vec<TableModel>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TableModel {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnModel>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ColumnModel {
    pub name: String,

    /// PostgreSQL type, rendered verbatim (`uuid`, `VARCHAR(255)`, `jsonb`, ...)
    #[serde(rename = "type")]
    pub sql_type: String,

    #[serde(default)]
    pub nullable: bool,

    #[serde(default)]
    pub primary_key: bool,

    #[serde(default)]
    pub unique: bool,

    /// Default expression, rendered verbatim (`now()`, `'{}'::jsonb`, ...)
    #[serde(default)]
    pub default: Option<String>,

    /// Foreign key target: `table(column)` with an optional `ON DELETE` action
    #[serde(default)]
    pub references: Option<String>,
}

impl SchemaModel {
    /// Load and validate a model file
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the file cannot be read, or
    /// `MigrationError::InvalidSchemaModel` if it does not parse or validate.
    pub fn load(path: &Path) -> Result<Self, MigrationError> {
        let content = std::fs::read_to_string(path).map_err(|e| MigrationError::io(path, e))?;
        Self::from_toml_str(&content).map_err(|e| match e {
            MigrationError::InvalidSchemaModel(msg) => {
                MigrationError::InvalidSchemaModel(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Parse and validate a model from TOML text
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidSchemaModel` if the text does not parse or validate.
    pub fn from_toml_str(content: &str) -> Result<Self, MigrationError> {
        let model: SchemaModel = toml::from_str(content)
            .map_err(|e| MigrationError::InvalidSchemaModel(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    pub fn table(&self, name: &str) -> Option<&TableModel> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Check names, column counts and foreign key targets
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidSchemaModel` listing every problem found.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let mut errors = Vec::new();
        let mut table_names = HashSet::new();

        for table in &self.tables {
            if table.name.trim().is_empty() {
                errors.push("table with an empty name".to_string());
            }
            if !table_names.insert(table.name.as_str()) {
                errors.push(format!("table '{}' is declared more than once", table.name));
            }
            if table.columns.is_empty() {
                errors.push(format!("table '{}' has no columns", table.name));
            }

            let mut column_names = HashSet::new();
            for column in &table.columns {
                if !column_names.insert(column.name.as_str()) {
                    errors.push(format!(
                        "column '{}.{}' is declared more than once",
                        table.name, column.name
                    ));
                }
                if column.sql_type.trim().is_empty() {
                    errors.push(format!("column '{}.{}' has no type", table.name, column.name));
                }
            }

            if table.columns.iter().filter(|c| c.primary_key).count() > 1 {
                errors.push(format!(
                    "table '{}' declares more than one primary key column",
                    table.name
                ));
            }
        }

        for table in &self.tables {
            for column in &table.columns {
                if let Some(reference) = &column.references {
                    let target = extract_foreign_key_table(reference);
                    if !table_names.contains(target.as_str()) {
                        errors.push(format!(
                            "column '{}.{}' references '{}' which is not declared",
                            table.name, column.name, target
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::InvalidSchemaModel(errors.join("; ")))
        }
    }
}

impl TableModel {
    pub fn column(&self, name: &str) -> Option<&ColumnModel> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Tables this one references, excluding itself
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self
            .columns
            .iter()
            .filter_map(|c| c.references.as_deref())
            .map(extract_foreign_key_table)
            .filter(|t| *t != self.name)
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    /// `CREATE TABLE` for the declared columns
    pub fn create_table_sql(&self) -> String {
        let mut stmt = Table::create();
        stmt.table(Alias::new(self.name.clone()));
        for column in &self.columns {
            stmt.col(column.column_def());
        }
        stmt.build(PostgresQueryBuilder)
    }
}

impl ColumnModel {
    /// Column definition with type, nullability, keys, default and reference
    pub fn column_def(&self) -> ColumnDef {
        let mut def = ColumnDef::new(Alias::new(self.name.clone()));
        def.custom(Alias::new(self.sql_type.clone()));
        if self.nullable && !self.primary_key {
            def.null();
        } else {
            def.not_null();
        }
        if self.primary_key {
            def.primary_key();
        }
        if self.unique {
            def.unique_key();
        }
        if let Some(default) = &self.default {
            def.default(Expr::cust(default.clone()));
        }
        if let Some(reference) = &self.references {
            def.extra(format!("REFERENCES {reference}"));
        }
        def
    }

    /// `ALTER TABLE .. ADD COLUMN` for this column
    pub fn add_column_sql(&self, table: &str) -> String {
        Table::alter()
            .table(Alias::new(table.to_string()))
            .add_column(self.column_def())
            .to_owned()
            .build(PostgresQueryBuilder)
    }
}

/// `DROP TABLE`
pub fn drop_table_sql(table: &str) -> String {
    Table::drop()
        .table(Alias::new(table.to_string()))
        .to_owned()
        .build(PostgresQueryBuilder)
}

/// `ALTER TABLE .. DROP COLUMN`
pub fn drop_column_sql(table: &str, column: &str) -> String {
    Table::alter()
        .table(Alias::new(table.to_string()))
        .drop_column(Alias::new(column.to_string()))
        .to_owned()
        .build(PostgresQueryBuilder)
}

/// `ALTER TABLE .. ALTER COLUMN .. SET/DROP NOT NULL`
pub fn set_not_null_sql(table: &str, column: &str, not_null: bool) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} {} NOT NULL",
        quote_ident(table),
        quote_ident(column),
        if not_null { "SET" } else { "DROP" }
    )
}

/// Column definition for a column that only exists in the live schema
pub fn live_column_def(name: &str, data_type: &str, nullable: bool) -> ColumnDef {
    let mut def = ColumnDef::new(Alias::new(name.to_string()));
    def.custom(Alias::new(data_type.to_string()));
    if nullable {
        def.null();
    } else {
        def.not_null();
    }
    def
}

/// `ADD COLUMN` re-creating a live column (used in downgrades of drops)
pub fn add_live_column_sql(table: &str, name: &str, data_type: &str, nullable: bool) -> String {
    Table::alter()
        .table(Alias::new(table.to_string()))
        .add_column(live_column_def(name, data_type, nullable))
        .to_owned()
        .build(PostgresQueryBuilder)
}

/// `CREATE TABLE` re-creating a live table, followed by its key and foreign key constraints
///
/// Constraints are restored with `ALTER TABLE .. ADD CONSTRAINT` so the referenced tables
/// only need to exist by the time the statement runs.
pub fn create_live_table_sql(table: &str, live: &LiveTable) -> String {
    let mut stmt = Table::create();
    stmt.table(Alias::new(table.to_string()));
    for (name, data_type, nullable) in live.columns_in_order() {
        stmt.col(live_column_def(name, data_type, nullable));
    }

    let mut statements = vec![stmt.build(PostgresQueryBuilder)];
    statements.extend(
        live.constraints
            .iter()
            .map(|c| add_live_constraint_sql(table, &c.name, &c.definition)),
    );
    statements.join(";\n")
}

/// `ALTER TABLE .. ADD CONSTRAINT` with a `pg_get_constraintdef()` definition
pub fn add_live_constraint_sql(table: &str, name: &str, definition: &str) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {}",
        quote_ident(table),
        quote_ident(name),
        definition
    )
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Extract the referenced table name from a foreign key string
///
/// Format: `table(column) ON DELETE action`, `table(column)` or `schema.table(column)`.
/// The schema prefix is dropped.
pub fn extract_foreign_key_table(fk: &str) -> String {
    let table_ref = match fk.find('(') {
        Some(paren_pos) => fk[..paren_pos].trim(),
        None => fk.trim(),
    };
    let table_ref = match table_ref.rfind('.') {
        Some(dot_pos) => &table_ref[dot_pos + 1..],
        None => table_ref,
    };
    table_ref.trim_matches('"').to_string()
}

/// Order `tables` so that referenced tables come first
///
/// Only references between the given tables count; self references are ignored.
/// Ties keep declaration order.
///
/// # Errors
///
/// Returns `MigrationError::InvalidSchemaModel` if the tables reference each other in a cycle.
pub fn creation_order<'m>(tables: &[&'m TableModel]) -> Result<Vec<&'m TableModel>, MigrationError> {
    let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    let dependencies: Vec<Vec<String>> = tables.iter().map(|t| t.dependencies()).collect();

    match dependency_order(&names, &dependencies) {
        Ok(order) => Ok(order.into_iter().map(|i| tables[i]).collect()),
        Err(stuck) => Err(MigrationError::InvalidSchemaModel(format!(
            "circular foreign key references between tables {}",
            stuck.join(", ")
        ))),
    }
}

/// Kahn ordering of `names` where `dependencies[i]` lists the names `names[i]` references
///
/// Returns indexes into `names`, referenced first. Names outside the set are ignored.
/// On a cycle, returns the names that could not be ordered.
pub(crate) fn dependency_order<'n>(
    names: &[&'n str],
    dependencies: &[Vec<String>],
) -> Result<Vec<usize>, Vec<&'n str>> {
    let position: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    let mut in_degree = vec![0usize; names.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); names.len()];

    for (i, deps) in dependencies.iter().enumerate() {
        for dep in deps {
            if let Some(&j) = position.get(dep.as_str()) {
                if i != j {
                    in_degree[i] += 1;
                    dependents[j].push(i);
                }
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..names.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(names.len());

    while let Some(current) = ready.pop_first() {
        ordered.push(current);
        for &dependent in &dependents[current] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if ordered.len() != names.len() {
        return Err((0..names.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| names[i])
            .collect());
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"
[[tables]]
name = "company_users"

[[tables.columns]]
name = "id"
type = "uuid"
primary_key = true

[[tables.columns]]
name = "user_id"
type = "uuid"
references = "users(id) ON DELETE CASCADE"

[[tables.columns]]
name = "company_id"
type = "uuid"
references = "companies(id) ON DELETE CASCADE"

[[tables]]
name = "users"

[[tables.columns]]
name = "id"
type = "uuid"
primary_key = true

[[tables.columns]]
name = "email"
type = "VARCHAR(255)"
unique = true

[[tables.columns]]
name = "created_at"
type = "timestamp with time zone"
default = "now()"

[[tables]]
name = "companies"

[[tables.columns]]
name = "id"
type = "uuid"
primary_key = true

[[tables.columns]]
name = "name"
type = "VARCHAR(255)"
nullable = true
"#;

    #[test]
    fn test_extract_foreign_key_table() {
        assert_eq!(extract_foreign_key_table("users(id) ON DELETE CASCADE"), "users");
        assert_eq!(extract_foreign_key_table("companies(id)"), "companies");
        assert_eq!(extract_foreign_key_table("public.chats(id)"), "chats");
        assert_eq!(extract_foreign_key_table("reports"), "reports");
    }

    #[test]
    fn test_parse_model() {
        let model = SchemaModel::from_toml_str(MODEL).expect("model");
        assert_eq!(model.tables.len(), 3);

        let users = model.table("users").expect("users");
        let email = users.column("email").expect("email");
        assert_eq!(email.sql_type, "VARCHAR(255)");
        assert!(email.unique);
        assert!(!email.nullable);
        assert_eq!(
            users.column("created_at").and_then(|c| c.default.as_deref()),
            Some("now()")
        );
    }

    #[test]
    fn test_creation_order_follows_foreign_keys() {
        let model = SchemaModel::from_toml_str(MODEL).expect("model");
        let tables: Vec<&TableModel> = model.tables.iter().collect();
        let ordered: Vec<&str> = creation_order(&tables)
            .expect("order")
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(ordered, vec!["users", "companies", "company_users"]);
    }

    #[test]
    fn test_self_reference_is_not_a_dependency() {
        let model = SchemaModel::from_toml_str(
            r#"
[[tables]]
name = "messages"

[[tables.columns]]
name = "id"
type = "uuid"
primary_key = true

[[tables.columns]]
name = "parent_id"
type = "uuid"
nullable = true
references = "messages(id) ON DELETE CASCADE"
"#,
        )
        .expect("model");
        assert!(model.tables[0].dependencies().is_empty());
        let tables: Vec<&TableModel> = model.tables.iter().collect();
        assert_eq!(creation_order(&tables).expect("order").len(), 1);
    }

    #[test]
    fn test_circular_references_are_rejected() {
        let a = TableModel {
            name: "a".to_string(),
            columns: vec![fk_column("b_id", "b(id)")],
        };
        let b = TableModel {
            name: "b".to_string(),
            columns: vec![fk_column("a_id", "a(id)")],
        };
        let err = creation_order(&[&a, &b]).expect_err("cycle");
        assert!(err.to_string().contains("circular"));
    }

    fn fk_column(name: &str, references: &str) -> ColumnModel {
        ColumnModel {
            name: name.to_string(),
            sql_type: "uuid".to_string(),
            nullable: true,
            primary_key: false,
            unique: false,
            default: None,
            references: Some(references.to_string()),
        }
    }

    #[test]
    fn test_validation_errors() {
        let err = SchemaModel::from_toml_str(
            r#"
[[tables]]
name = "chats"

[[tables.columns]]
name = "user_id"
type = "uuid"
references = "users(id)"

[[tables]]
name = "empty"
"#,
        )
        .expect_err("invalid");
        let message = err.to_string();
        assert!(message.contains("'users' which is not declared"));
        assert!(message.contains("'empty' has no columns"));

        let err = SchemaModel::from_toml_str(
            r#"
[[tables]]
name = "t"
[[tables.columns]]
name = "a"
type = "int"
[[tables.columns]]
name = "a"
type = "int"
"#,
        )
        .expect_err("duplicate column");
        assert!(err.to_string().contains("declared more than once"));
    }

    #[test]
    fn test_rendered_ddl() {
        let model = SchemaModel::from_toml_str(MODEL).expect("model");
        let link = model.table("company_users").expect("table");

        let create = link.create_table_sql();
        assert!(create.starts_with(r#"CREATE TABLE "company_users""#), "{create}");
        assert!(create.contains(r#""user_id""#));
        assert!(create.contains("PRIMARY KEY"));
        assert!(create.contains("REFERENCES users(id) ON DELETE CASCADE"));

        assert_eq!(drop_table_sql("users"), r#"DROP TABLE "users""#);
        assert!(drop_column_sql("users", "email").contains(r#"DROP COLUMN "email""#));
        assert_eq!(
            set_not_null_sql("users", "email", true),
            r#"ALTER TABLE "users" ALTER COLUMN "email" SET NOT NULL"#
        );
        assert!(set_not_null_sql("users", "email", false).ends_with("DROP NOT NULL"));

        let add = model
            .table("users")
            .and_then(|t| t.column("email"))
            .expect("email")
            .add_column_sql("users");
        assert!(add.starts_with(r#"ALTER TABLE "users" ADD COLUMN "email""#), "{add}");
    }
}
