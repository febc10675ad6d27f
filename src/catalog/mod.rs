// # Schema Catalog
//
// Reflected metadata of one database schema: tables, columns, keys and
// user-defined types. A `Catalog` is an immutable snapshot shared behind
// `Arc`; refresh replaces whole snapshots so readers never observe a
// half-reflected schema.

pub mod cache;
pub mod reflector;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use cache::CatalogCache;
pub use reflector::{PostgresReflector, ReflectorRegistry, SchemaReflector};

/// Relation kind. Views are read-only: no mutation fields are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    Base,
    View,
    MaterializedView,
}

impl TableKind {
    pub fn is_mutable(&self) -> bool {
        matches!(self, TableKind::Base)
    }
}

/// A reflected column. `raw_type` is the database-native type name as
/// printed by `format_type`; semantic classification is derived later by
/// the type mapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub raw_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    /// Number of array dimensions; 0 for non-array columns
    pub array_dimensions: i32,
    /// Element type name for array columns
    pub element_type: Option<String>,
    /// Column has a default or identity; such PK parts may be omitted on insert
    pub has_default: bool,
    pub ordinal: i32,
}

/// A foreign-key constraint. `columns` and `referenced_columns` are paired
/// positionally and their order is significant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

/// A reflected table or view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<Column>,
    /// Primary key column names, in constraint order
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Primary-key columns in constraint order.
    pub fn primary_key_columns(&self) -> Vec<&Column> {
        self.primary_key
            .iter()
            .filter_map(|name| self.column(name))
            .collect()
    }
}

/// A user-defined enum type with its ordered label list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumType {
    pub name: String,
    pub values: Vec<String>,
}

/// One field of a user-defined composite type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeField {
    pub name: String,
    pub raw_type: String,
}

/// A user-defined composite type with its ordered field list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeType {
    pub name: String,
    pub fields: Vec<CompositeField>,
}

/// Immutable snapshot of a reflected schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub schema: String,
    pub tables: Vec<Table>,
    pub enums: Vec<EnumType>,
    pub composites: Vec<CompositeType>,
    #[serde(skip)]
    table_index: HashMap<String, usize>,
}

impl Catalog {
    pub fn new(
        schema: String,
        tables: Vec<Table>,
        enums: Vec<EnumType>,
        composites: Vec<CompositeType>,
    ) -> Self {
        let table_index = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        Self {
            schema,
            tables,
            enums,
            composites,
            table_index,
        }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.table_index.get(name).map(|&i| &self.tables[i])
    }

    pub fn enum_type(&self, name: &str) -> Option<&EnumType> {
        self.enums.iter().find(|e| e.name == name)
    }

    pub fn composite_type(&self, name: &str) -> Option<&CompositeType> {
        self.composites.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    pub fn column(name: &str, raw_type: &str) -> Column {
        Column {
            name: name.to_string(),
            raw_type: raw_type.to_string(),
            is_nullable: true,
            is_primary_key: false,
            array_dimensions: 0,
            element_type: None,
            has_default: false,
            ordinal: 0,
        }
    }

    pub fn pk_column(name: &str, raw_type: &str) -> Column {
        Column {
            is_nullable: false,
            is_primary_key: true,
            has_default: true,
            ..column(name, raw_type)
        }
    }

    /// A two-table fixture: `customer (customer_id pk, name, active, created_at)`
    /// and `orders (order_id pk, customer_id fk, total)`.
    pub fn sample_catalog() -> Catalog {
        let customer = Table {
            name: "customer".to_string(),
            kind: TableKind::Base,
            columns: vec![
                pk_column("customer_id", "integer"),
                column("name", "text"),
                column("active", "boolean"),
                column("created_at", "timestamp with time zone"),
            ],
            primary_key: vec!["customer_id".to_string()],
            foreign_keys: vec![],
        };
        let orders = Table {
            name: "orders".to_string(),
            kind: TableKind::Base,
            columns: vec![
                pk_column("order_id", "integer"),
                column("customer_id", "integer"),
                column("total", "numeric(10,2)"),
            ],
            primary_key: vec!["order_id".to_string()],
            foreign_keys: vec![ForeignKey {
                name: "orders_customer_id_fkey".to_string(),
                columns: vec!["customer_id".to_string()],
                referenced_table: "customer".to_string(),
                referenced_columns: vec!["customer_id".to_string()],
            }],
        };
        let order_items = Table {
            name: "order_items".to_string(),
            kind: TableKind::Base,
            columns: vec![
                pk_column("order_id", "integer"),
                pk_column("product_id", "integer"),
                column("quantity", "integer"),
            ],
            primary_key: vec!["order_id".to_string(), "product_id".to_string()],
            foreign_keys: vec![ForeignKey {
                name: "order_items_order_id_fkey".to_string(),
                columns: vec!["order_id".to_string()],
                referenced_table: "orders".to_string(),
                referenced_columns: vec!["order_id".to_string()],
            }],
        };
        Catalog::new(
            "public".to_string(),
            vec![customer, orders, order_items],
            vec![EnumType {
                name: "mood".to_string(),
                values: vec!["sad".to_string(), "ok".to_string(), "happy".to_string()],
            }],
            vec![],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::sample_catalog;
    use super::*;

    #[test]
    fn test_table_lookup() {
        let catalog = sample_catalog();
        assert!(catalog.table("customer").is_some());
        assert!(catalog.table("missing").is_none());

        let orders = catalog.table("orders").unwrap();
        assert_eq!(orders.foreign_keys.len(), 1);
        assert_eq!(orders.foreign_keys[0].referenced_table, "customer");
    }

    #[test]
    fn test_composite_primary_key_order() {
        let catalog = sample_catalog();
        let items = catalog.table("order_items").unwrap();
        assert_eq!(items.primary_key, vec!["order_id", "product_id"]);
        let pk_cols = items.primary_key_columns();
        assert!(pk_cols.iter().all(|c| !c.is_nullable));
    }
}
