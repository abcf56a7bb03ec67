use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: &str, data_type: &str, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Database schema the table lives in (`main` for DuckDB defaults)
    pub schema: String,
    pub name: String,
    /// Alternative names users tend to type for this table, e.g. "orders" for `Order`
    #[serde(default)]
    pub aliases: Vec<String>,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn new(schema: &str, name: &str, columns: Vec<ColumnSchema>) -> Self {
        Self {
            schema: schema.to_string(),
            name: name.to_string(),
            aliases: Vec::new(),
            columns,
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_foreign_key(mut self, columns: &[&str], table: &str, referenced: &[&str]) -> Self {
        self.foreign_keys.push(ForeignKey {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            referenced_table: table.to_string(),
            referenced_columns: referenced.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// True if `word` names this table, either directly or through an alias.
    pub fn answers_to(&self, word: &str) -> bool {
        self.name.eq_ignore_ascii_case(word) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(word))
    }
}

/// Hash of the queryable structure; changes whenever a table, column or key changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaVersion(pub u64);

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Versioned, read-only description of the queryable tables.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    tables: Vec<TableSchema>,
    version: SchemaVersion,
    /// Load counter; later loads carry higher generations
    generation: u64,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        let version = Self::compute_version(&tables);
        Self {
            tables,
            version,
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    fn compute_version(tables: &[TableSchema]) -> SchemaVersion {
        let mut hasher = DefaultHasher::new();
        tables.len().hash(&mut hasher);
        for table in tables {
            table.schema.to_lowercase().hash(&mut hasher);
            table.name.to_lowercase().hash(&mut hasher);
            for column in &table.columns {
                column.name.to_lowercase().hash(&mut hasher);
                column.data_type.to_uppercase().hash(&mut hasher);
                column.nullable.hash(&mut hasher);
            }
            for fk in &table.foreign_keys {
                fk.columns.hash(&mut hasher);
                fk.referenced_table.hash(&mut hasher);
                fk.referenced_columns.hash(&mut hasher);
            }
        }
        SchemaVersion(hasher.finish())
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.column(name).is_some())
    }

    /// Builds the fragment containing only `names` (in snapshot order). Foreign keys
    /// pointing outside the fragment are dropped.
    pub fn subset(&self, names: &HashSet<String>) -> SchemaSnapshot {
        let keep = |name: &str| names.contains(&name.to_lowercase());
        let tables = self
            .tables
            .iter()
            .filter(|t| keep(&t.name))
            .map(|t| {
                let mut table = t.clone();
                table.foreign_keys.retain(|fk| keep(&fk.referenced_table));
                table
            })
            .collect();
        SchemaSnapshot::new(tables).with_generation(self.generation)
    }

    /// Renders the snapshot as the markdown block handed to the model.
    pub fn render_for_prompt(&self) -> String {
        if self.tables.is_empty() {
            return "No tables available.\n".to_string();
        }

        let mut out = String::from("# DATABASE SCHEMA\n\n");
        for table in &self.tables {
            out.push_str(&format!("### Table: \"{}\".\"{}\"\n\n", table.schema, table.name));
            out.push_str("| Column Name | Data Type | Nullable |\n");
            out.push_str("|------------|-----------|----------|\n");
            for column in &table.columns {
                out.push_str(&format!(
                    "| {} | {} | {} |\n",
                    column.name,
                    column.data_type,
                    if column.nullable { "YES" } else { "NO" }
                ));
            }
            if !table.foreign_keys.is_empty() {
                out.push_str("\nForeign Keys:\n");
                for fk in &table.foreign_keys {
                    out.push_str(&format!(
                        "- {} -> {}({})\n",
                        fk.columns.join(", "),
                        fk.referenced_table,
                        fk.referenced_columns.join(", ")
                    ));
                }
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
pub(crate) fn sample_snapshot() -> SchemaSnapshot {
    SchemaSnapshot::new(vec![
        TableSchema::new(
            "main",
            "Product",
            vec![
                ColumnSchema::new("ProductID", "INTEGER", false),
                ColumnSchema::new("ProductName", "VARCHAR", false),
                ColumnSchema::new("Price", "DOUBLE", true),
            ],
        )
        .with_aliases(&["products", "item"]),
        TableSchema::new(
            "main",
            "Order",
            vec![
                ColumnSchema::new("OrderID", "INTEGER", false),
                ColumnSchema::new("ProductID", "INTEGER", false),
                ColumnSchema::new("OrderDate", "DATE", false),
                ColumnSchema::new("Quantity", "INTEGER", true),
                ColumnSchema::new("TotalAmount", "DOUBLE", true),
                ColumnSchema::new("DeliveryStatus", "VARCHAR", true),
            ],
        )
        .with_aliases(&["orders", "sales"])
        .with_foreign_key(&["ProductID"], "Product", &["ProductID"]),
        TableSchema::new(
            "main",
            "Review",
            vec![
                ColumnSchema::new("ReviewID", "INTEGER", false),
                ColumnSchema::new("ProductID", "INTEGER", false),
                ColumnSchema::new("Rating", "INTEGER", true),
            ],
        )
        .with_aliases(&["reviews", "ratings"])
        .with_foreign_key(&["ProductID"], "Product", &["ProductID"]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_stable_for_identical_structure() {
        assert_eq!(sample_snapshot().version(), sample_snapshot().version());
    }

    #[test]
    fn version_changes_when_a_column_is_added() {
        let before = sample_snapshot();
        let mut tables = before.tables().to_vec();
        tables[0].columns.push(ColumnSchema::new("Color", "VARCHAR", true));
        let after = SchemaSnapshot::new(tables);
        assert_ne!(before.version(), after.version());
    }

    #[test]
    fn aliases_do_not_affect_version() {
        let before = sample_snapshot();
        let mut tables = before.tables().to_vec();
        tables[0].aliases.push("goods".to_string());
        assert_eq!(before.version(), SchemaSnapshot::new(tables).version());
    }

    #[test]
    fn subset_drops_dangling_foreign_keys() {
        let snapshot = sample_snapshot();
        let names: HashSet<String> = ["order".to_string()].into_iter().collect();
        let fragment = snapshot.subset(&names);
        assert_eq!(fragment.tables().len(), 1);
        assert!(fragment.tables()[0].foreign_keys.is_empty());
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let snapshot = sample_snapshot();
        assert!(snapshot.table("product").is_some());
        assert!(snapshot.has_column("totalamount"));
        assert!(snapshot.table("product").unwrap().answers_to("ITEM"));
    }

    #[test]
    fn prompt_rendering_lists_columns_and_keys() {
        let rendered = sample_snapshot().render_for_prompt();
        assert!(rendered.contains("### Table: \"main\".\"Order\""));
        assert!(rendered.contains("| TotalAmount | DOUBLE | YES |"));
        assert!(rendered.contains("- ProductID -> Product(ProductID)"));
    }
}
