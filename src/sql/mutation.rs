// # Mutation SQL
//
// INSERT / UPDATE / DELETE statements with `RETURNING`, one statement per
// mutation so the implicit transaction keeps partial success impossible.
// Primary-key completeness is validated before any SQL is issued.

use serde_json::{Map as JsonMap, Value as Json};

use super::binding::{bind_cast, coerce_bind};
use super::{qualified_table, quote_ident, ParamList};
use crate::catalog::{Catalog, Table};
use crate::error::{GatewayError, Result};
use crate::graphql::type_mapper::{classify_column, relationship_fields};
use crate::sql::builder::SelectQuery;

pub struct MutationBuilder<'a> {
    catalog: &'a Catalog,
    table: &'a Table,
}

impl<'a> MutationBuilder<'a> {
    pub fn new(catalog: &'a Catalog, table: &'a Table) -> Self {
        Self { catalog, table }
    }

    fn target(&self) -> String {
        qualified_table(&self.catalog.schema, &self.table.name)
    }

    /// RETURNING list: every column, projected through to_jsonb like reads.
    fn returning(&self) -> String {
        let parts: Vec<String> = self
            .table
            .columns
            .iter()
            .map(|c| {
                let quoted = quote_ident(&c.name);
                format!("to_jsonb({}) AS {}", quoted, quoted)
            })
            .collect();
        format!(" RETURNING {}", parts.join(", "))
    }

    fn check_known_columns(&self, input: &JsonMap<String, Json>) -> Result<()> {
        for key in input.keys() {
            if !self.table.has_column(key) {
                return Err(GatewayError::Validation(format!(
                    "unknown column {:?} in input for table {:?}",
                    key, self.table.name
                )));
            }
        }
        Ok(())
    }

    /// Single-row INSERT. Absent columns are left to their defaults.
    pub fn build_insert(&self, input: &JsonMap<String, Json>) -> Result<SelectQuery> {
        self.check_known_columns(input)?;

        let mut params = ParamList::new();
        let mut names = Vec::new();
        let mut placeholders = Vec::new();
        for column in &self.table.columns {
            let Some(value) = input.get(&column.name) else {
                continue;
            };
            let mapped = classify_column(column, self.catalog);
            let cast = bind_cast(&mapped, &column.raw_type, &self.catalog.schema);
            let bind = coerce_bind(value, &mapped, self.catalog, &column.name)?;
            names.push(quote_ident(&column.name));
            placeholders.push(params.push_cast(bind, cast.as_deref()));
        }

        let sql = if names.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES{}", self.target(), self.returning())
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}){}",
                self.target(),
                names.join(", "),
                placeholders.join(", "),
                self.returning()
            )
        };
        Ok(SelectQuery {
            sql,
            binds: params.into_binds(),
        })
    }

    /// Multi-row INSERT. The column list is the union of the provided rows'
    /// keys; a row missing a defaulted column gets DEFAULT, otherwise a
    /// typed NULL.
    pub fn build_insert_many(&self, inputs: &[JsonMap<String, Json>]) -> Result<SelectQuery> {
        if inputs.is_empty() {
            return Err(GatewayError::Validation(
                "createMany requires at least one input row".to_string(),
            ));
        }
        for input in inputs {
            self.check_known_columns(input)?;
        }

        let union: Vec<_> = self
            .table
            .columns
            .iter()
            .filter(|c| inputs.iter().any(|input| input.contains_key(&c.name)))
            .collect();
        if union.is_empty() {
            return Err(GatewayError::Validation(
                "createMany inputs contain no columns".to_string(),
            ));
        }

        let mut params = ParamList::new();
        let mut rows = Vec::with_capacity(inputs.len());
        for input in inputs {
            let mut row = Vec::with_capacity(union.len());
            for column in &union {
                match input.get(&column.name) {
                    Some(value) => {
                        let mapped = classify_column(column, self.catalog);
                        let cast = bind_cast(&mapped, &column.raw_type, &self.catalog.schema);
                        let bind = coerce_bind(value, &mapped, self.catalog, &column.name)?;
                        row.push(params.push_cast(bind, cast.as_deref()));
                    }
                    None if column.has_default => row.push("DEFAULT".to_string()),
                    None => {
                        let mapped = classify_column(column, self.catalog);
                        let bind = super::binding::null_bind(&mapped);
                        let cast = bind_cast(&mapped, &column.raw_type, &self.catalog.schema);
                        row.push(params.push_cast(bind, cast.as_deref()));
                    }
                }
            }
            rows.push(format!("({})", row.join(", ")));
        }

        let names: Vec<String> = union.iter().map(|c| quote_ident(&c.name)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}{}",
            self.target(),
            names.join(", "),
            rows.join(", "),
            self.returning()
        );
        Ok(SelectQuery {
            sql,
            binds: params.into_binds(),
        })
    }

    /// Collect the primary-key predicate, validating that every PK part is
    /// present and non-null.
    fn primary_key_predicate(
        &self,
        input: &JsonMap<String, Json>,
        params: &mut ParamList,
    ) -> Result<String> {
        if self.table.primary_key.is_empty() {
            return Err(GatewayError::Validation(format!(
                "table {:?} has no primary key; keyed mutations are unavailable",
                self.table.name
            )));
        }
        let mut conjuncts = Vec::with_capacity(self.table.primary_key.len());
        for name in &self.table.primary_key {
            let value = input.get(name).filter(|v| !v.is_null()).ok_or_else(|| {
                GatewayError::Validation(format!(
                    "missing primary key column {:?} for table {:?}",
                    name, self.table.name
                ))
            })?;
            let column = self.table.column(name).expect("pk column reflected");
            let mapped = classify_column(column, self.catalog);
            let cast = bind_cast(&mapped, &column.raw_type, &self.catalog.schema);
            let bind = coerce_bind(value, &mapped, self.catalog, name)?;
            conjuncts.push(format!(
                "{} = {}",
                quote_ident(name),
                params.push_cast(bind, cast.as_deref())
            ));
        }
        Ok(conjuncts.join(" AND "))
    }

    /// UPDATE by full primary key; non-PK fields present in the input are
    /// set.
    pub fn build_update(&self, input: &JsonMap<String, Json>) -> Result<SelectQuery> {
        self.check_known_columns(input)?;

        let mut params = ParamList::new();
        let mut assignments = Vec::new();
        for column in &self.table.columns {
            if column.is_primary_key {
                continue;
            }
            let Some(value) = input.get(&column.name) else {
                continue;
            };
            let mapped = classify_column(column, self.catalog);
            let cast = bind_cast(&mapped, &column.raw_type, &self.catalog.schema);
            let bind = coerce_bind(value, &mapped, self.catalog, &column.name)?;
            assignments.push(format!(
                "{} = {}",
                quote_ident(&column.name),
                params.push_cast(bind, cast.as_deref())
            ));
        }
        if assignments.is_empty() {
            return Err(GatewayError::Validation(format!(
                "update on {:?} sets no columns",
                self.table.name
            )));
        }
        let predicate = self.primary_key_predicate(input, &mut params)?;

        let sql = format!(
            "UPDATE {} SET {} WHERE {}{}",
            self.target(),
            assignments.join(", "),
            predicate,
            self.returning()
        );
        Ok(SelectQuery {
            sql,
            binds: params.into_binds(),
        })
    }

    /// DELETE by full primary key, returning the deleted row.
    pub fn build_delete(&self, input: &JsonMap<String, Json>) -> Result<SelectQuery> {
        self.check_known_columns(input)?;
        let mut params = ParamList::new();
        let predicate = self.primary_key_predicate(input, &mut params)?;
        let sql = format!(
            "DELETE FROM {} WHERE {}{}",
            self.target(),
            predicate,
            self.returning()
        );
        Ok(SelectQuery {
            sql,
            binds: params.into_binds(),
        })
    }

    /// Create with `_connect` sub-inputs: each names an existing referenced
    /// key tuple whose values are copied into the new row's FK columns, all
    /// within the single INSERT.
    pub fn build_insert_with_relations(
        &self,
        input: &JsonMap<String, Json>,
    ) -> Result<SelectQuery> {
        let mut flat = JsonMap::new();
        let mut connects: Vec<(String, &Json)> = Vec::new();
        for (key, value) in input {
            match key.strip_suffix("_connect") {
                Some(relation) => connects.push((relation.to_string(), value)),
                None => {
                    flat.insert(key.clone(), value.clone());
                }
            }
        }

        let relations = relationship_fields(self.table);
        for (relation, value) in connects {
            let Some((_, fk)) = relations.iter().find(|(name, _)| *name == relation) else {
                return Err(GatewayError::Validation(format!(
                    "unknown relation {:?} in {}_connect input",
                    relation, relation
                )));
            };
            let obj = value.as_object().ok_or_else(|| {
                GatewayError::Validation(format!("{}_connect: expected an object", relation))
            })?;
            for (local, referenced) in fk.columns.iter().zip(&fk.referenced_columns) {
                let referenced_value = obj.get(referenced).filter(|v| !v.is_null()).ok_or_else(
                    || {
                        GatewayError::Validation(format!(
                            "{}_connect is missing key column {:?}",
                            relation, referenced
                        ))
                    },
                )?;
                flat.insert(local.clone(), referenced_value.clone());
            }
        }

        self.build_insert(&flat)
    }
}
