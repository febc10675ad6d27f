// # Catalog Reflector
//
// Introspects a live database schema into a `Catalog` snapshot. Reflectors
// are selected from a registry keyed by dialect tag so the rest of the
// gateway depends only on the trait contract; PostgreSQL is the reference
// dialect and queries `pg_catalog` directly for exact array dimensions,
// enum label order and composite attributes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{debug, info};

use super::{
    Catalog, Column, CompositeField, CompositeType, EnumType, ForeignKey, Table, TableKind,
};
use crate::error::{GatewayError, Result};

/// Dialect-specific schema introspection.
///
/// Any query failure is fatal to the whole reflection call; partial results
/// are never returned. Tables the connecting role cannot select from are
/// omitted rather than failing.
#[async_trait]
pub trait SchemaReflector: Send + Sync {
    async fn reflect(&self, pool: &PgPool, schema: &str) -> Result<Catalog>;
}

/// Registry of reflectors keyed by the `database-type` configuration tag.
pub struct ReflectorRegistry {
    reflectors: HashMap<String, Arc<dyn SchemaReflector>>,
}

impl ReflectorRegistry {
    pub fn new() -> Self {
        Self {
            reflectors: HashMap::new(),
        }
    }

    /// Registry with the built-in dialects registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("postgres", Arc::new(PostgresReflector::new()));
        registry
    }

    pub fn register(&mut self, tag: &str, reflector: Arc<dyn SchemaReflector>) {
        self.reflectors.insert(tag.to_string(), reflector);
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn SchemaReflector>> {
        self.reflectors.get(tag).cloned().ok_or_else(|| {
            GatewayError::Configuration(format!("unsupported database type: {}", tag))
        })
    }
}

impl Default for ReflectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// PostgreSQL reflector over `pg_catalog`.
pub struct PostgresReflector;

impl PostgresReflector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PostgresReflector {
    fn default() -> Self {
        Self::new()
    }
}

const TABLES_SQL: &str = r#"
SELECT c.relname AS table_name, c.relkind::text AS kind
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1
  AND c.relkind IN ('r', 'p', 'v', 'm')
  AND pg_catalog.has_table_privilege(c.oid, 'SELECT')
ORDER BY c.relname
"#;

const COLUMNS_SQL: &str = r#"
SELECT c.relname AS table_name,
       a.attname AS column_name,
       pg_catalog.format_type(a.atttypid, a.atttypmod) AS raw_type,
       NOT a.attnotnull AS is_nullable,
       a.attndims::int4 AS array_dimensions,
       (a.atthasdef OR a.attidentity <> '') AS has_default,
       a.attnum::int4 AS ordinal
FROM pg_catalog.pg_attribute a
JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1
  AND c.relkind IN ('r', 'p', 'v', 'm')
  AND a.attnum > 0
  AND NOT a.attisdropped
ORDER BY c.relname, a.attnum
"#;

const PRIMARY_KEYS_SQL: &str = r#"
SELECT c.relname AS table_name, a.attname AS column_name
FROM pg_catalog.pg_constraint ct
JOIN pg_catalog.pg_class c ON c.oid = ct.conrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN LATERAL unnest(ct.conkey) WITH ORDINALITY AS k(attnum, ord) ON TRUE
JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid AND a.attnum = k.attnum
WHERE n.nspname = $1 AND ct.contype = 'p'
ORDER BY c.relname, k.ord
"#;

const FOREIGN_KEYS_SQL: &str = r#"
SELECT c.relname AS table_name,
       ct.conname AS constraint_name,
       a.attname AS column_name,
       rc.relname AS referenced_table,
       ra.attname AS referenced_column
FROM pg_catalog.pg_constraint ct
JOIN pg_catalog.pg_class c ON c.oid = ct.conrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_class rc ON rc.oid = ct.confrelid
JOIN LATERAL unnest(ct.conkey, ct.confkey) WITH ORDINALITY AS k(attnum, refnum, ord) ON TRUE
JOIN pg_catalog.pg_attribute a ON a.attrelid = ct.conrelid AND a.attnum = k.attnum
JOIN pg_catalog.pg_attribute ra ON ra.attrelid = ct.confrelid AND ra.attnum = k.refnum
WHERE n.nspname = $1 AND ct.contype = 'f'
ORDER BY c.relname, ct.conname, k.ord
"#;

const ENUMS_SQL: &str = r#"
SELECT t.typname AS type_name, e.enumlabel AS label
FROM pg_catalog.pg_type t
JOIN pg_catalog.pg_namespace n ON n.oid = t.typnamespace
JOIN pg_catalog.pg_enum e ON e.enumtypid = t.oid
WHERE n.nspname = $1
ORDER BY t.typname, e.enumsortorder
"#;

const COMPOSITES_SQL: &str = r#"
SELECT t.typname AS type_name,
       a.attname AS field_name,
       pg_catalog.format_type(a.atttypid, a.atttypmod) AS raw_type
FROM pg_catalog.pg_type t
JOIN pg_catalog.pg_namespace n ON n.oid = t.typnamespace
JOIN pg_catalog.pg_class c ON c.oid = t.typrelid AND c.relkind = 'c'
JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
WHERE n.nspname = $1
ORDER BY t.typname, a.attnum
"#;

#[async_trait]
impl SchemaReflector for PostgresReflector {
    async fn reflect(&self, pool: &PgPool, schema: &str) -> Result<Catalog> {
        debug!(schema, "reflecting database schema");

        let mut tables: Vec<Table> = Vec::new();
        let mut table_pos: HashMap<String, usize> = HashMap::new();

        for row in sqlx::query(TABLES_SQL).bind(schema).fetch_all(pool).await? {
            let name: String = row.try_get("table_name")?;
            let kind: String = row.try_get("kind")?;
            let kind = match kind.as_str() {
                "v" => TableKind::View,
                "m" => TableKind::MaterializedView,
                _ => TableKind::Base,
            };
            table_pos.insert(name.clone(), tables.len());
            tables.push(Table {
                name,
                kind,
                columns: Vec::new(),
                primary_key: Vec::new(),
                foreign_keys: Vec::new(),
            });
        }

        for row in sqlx::query(COLUMNS_SQL).bind(schema).fetch_all(pool).await? {
            let table_name: String = row.try_get("table_name")?;
            let Some(&pos) = table_pos.get(&table_name) else {
                // Table filtered out by privilege check above.
                continue;
            };
            let raw_type: String = row.try_get("raw_type")?;
            let array_dimensions: i32 = row.try_get("array_dimensions")?;
            let element_type = if raw_type.ends_with("[]") {
                Some(raw_type.trim_end_matches("[]").to_string())
            } else {
                None
            };
            // attndims can be 0 for array columns of views; recover it from
            // the printed type instead.
            let array_dimensions = if element_type.is_some() {
                array_dimensions.max(raw_type.matches("[]").count() as i32)
            } else {
                0
            };
            tables[pos].columns.push(Column {
                name: row.try_get("column_name")?,
                raw_type,
                is_nullable: row.try_get("is_nullable")?,
                is_primary_key: false,
                array_dimensions,
                element_type,
                has_default: row.try_get("has_default")?,
                ordinal: row.try_get("ordinal")?,
            });
        }

        for row in sqlx::query(PRIMARY_KEYS_SQL)
            .bind(schema)
            .fetch_all(pool)
            .await?
        {
            let table_name: String = row.try_get("table_name")?;
            let column_name: String = row.try_get("column_name")?;
            if let Some(&pos) = table_pos.get(&table_name) {
                let table = &mut tables[pos];
                table.primary_key.push(column_name.clone());
                if let Some(col) = table.columns.iter_mut().find(|c| c.name == column_name) {
                    col.is_primary_key = true;
                    col.is_nullable = false;
                }
            }
        }

        for row in sqlx::query(FOREIGN_KEYS_SQL)
            .bind(schema)
            .fetch_all(pool)
            .await?
        {
            let table_name: String = row.try_get("table_name")?;
            let constraint_name: String = row.try_get("constraint_name")?;
            let Some(&pos) = table_pos.get(&table_name) else {
                continue;
            };
            let table = &mut tables[pos];
            let column_name: String = row.try_get("column_name")?;
            let referenced_table: String = row.try_get("referenced_table")?;
            let referenced_column: String = row.try_get("referenced_column")?;
            match table
                .foreign_keys
                .iter_mut()
                .find(|fk| fk.name == constraint_name)
            {
                // Rows arrive in (constraint, ordinal) order, so pushing
                // keeps the paired column arrays aligned.
                Some(fk) => {
                    fk.columns.push(column_name);
                    fk.referenced_columns.push(referenced_column);
                }
                None => table.foreign_keys.push(ForeignKey {
                    name: constraint_name,
                    columns: vec![column_name],
                    referenced_table,
                    referenced_columns: vec![referenced_column],
                }),
            }
        }

        // Constraints can point at relations outside the reflected schema
        // (or ones the role cannot see); relationship wiring needs both
        // ends, so those are dropped.
        let known: std::collections::HashSet<String> =
            tables.iter().map(|t| t.name.clone()).collect();
        for table in &mut tables {
            table
                .foreign_keys
                .retain(|fk| known.contains(&fk.referenced_table));
        }

        let mut enums: Vec<EnumType> = Vec::new();
        for row in sqlx::query(ENUMS_SQL).bind(schema).fetch_all(pool).await? {
            let type_name: String = row.try_get("type_name")?;
            let label: String = row.try_get("label")?;
            match enums.last_mut() {
                Some(e) if e.name == type_name => e.values.push(label),
                _ => enums.push(EnumType {
                    name: type_name,
                    values: vec![label],
                }),
            }
        }

        let mut composites: Vec<CompositeType> = Vec::new();
        for row in sqlx::query(COMPOSITES_SQL)
            .bind(schema)
            .fetch_all(pool)
            .await?
        {
            let type_name: String = row.try_get("type_name")?;
            let field = CompositeField {
                name: row.try_get("field_name")?,
                raw_type: row.try_get("raw_type")?,
            };
            match composites.last_mut() {
                Some(c) if c.name == type_name => c.fields.push(field),
                _ => composites.push(CompositeType {
                    name: type_name,
                    fields: vec![field],
                }),
            }
        }

        info!(
            schema,
            tables = tables.len(),
            enums = enums.len(),
            composites = composites.len(),
            "schema reflection complete"
        );

        Ok(Catalog::new(schema.to_string(), tables, enums, composites))
    }
}
