// # Selection Plans
//
// The set of scalar columns and relationship fields requested at each level
// of a GraphQL selection set. Plans narrow SELECT lists: a list query
// projects exactly the requested columns plus the primary key plus the FK
// columns of any requested relationships (needed later by the batch
// loader). Unknown selection fields (aliases resolve by field name;
// `__typename` and the like) are ignored.

use std::collections::BTreeSet;

use async_graphql::context::SelectionField;

use crate::catalog::{Catalog, ForeignKey, Table};
use crate::graphql::type_mapper::relationship_fields;

#[derive(Debug, Clone, Default)]
pub struct SelectionPlan {
    pub columns: Vec<String>,
    pub relationships: Vec<RelationshipSelection>,
}

#[derive(Debug, Clone)]
pub struct RelationshipSelection {
    pub field_name: String,
    pub foreign_key: ForeignKey,
    pub referenced_table: String,
    pub plan: SelectionPlan,
}

impl SelectionPlan {
    /// Build a plan from the sub-selection of a field resolving to `table`.
    pub fn from_fields<'a>(
        table: &Table,
        catalog: &Catalog,
        fields: impl Iterator<Item = SelectionField<'a>>,
    ) -> Self {
        let relations = relationship_fields(table);
        let mut plan = SelectionPlan::default();
        for selected in fields {
            let name = selected.name();
            if table.has_column(name) {
                if !plan.columns.iter().any(|c| c == name) {
                    plan.columns.push(name.to_string());
                }
                continue;
            }
            if let Some((field_name, fk)) = relations.iter().find(|(n, _)| n == name) {
                if plan
                    .relationships
                    .iter()
                    .any(|r| r.field_name == *field_name)
                {
                    continue;
                }
                if let Some(referenced) = catalog.table(&fk.referenced_table) {
                    plan.relationships.push(RelationshipSelection {
                        field_name: field_name.clone(),
                        foreign_key: (*fk).clone(),
                        referenced_table: referenced.name.clone(),
                        plan: SelectionPlan::from_fields(
                            referenced,
                            catalog,
                            selected.selection_set(),
                        ),
                    });
                }
            }
        }
        plan
    }

    /// Plan for a connection field: the row selection lives under
    /// `edges { node { … } }`.
    pub fn from_connection_field<'a>(
        table: &Table,
        catalog: &Catalog,
        field: SelectionField<'a>,
    ) -> Self {
        let mut plan = SelectionPlan::default();
        for child in field.selection_set() {
            if child.name() != "edges" {
                continue;
            }
            for edge_child in child.selection_set() {
                if edge_child.name() != "node" {
                    continue;
                }
                let node_plan =
                    SelectionPlan::from_fields(table, catalog, edge_child.selection_set());
                plan.merge(node_plan);
            }
        }
        plan
    }

    fn merge(&mut self, other: SelectionPlan) {
        for column in other.columns {
            if !self.columns.iter().any(|c| *c == column) {
                self.columns.push(column);
            }
        }
        for relationship in other.relationships {
            if !self
                .relationships
                .iter()
                .any(|r| r.field_name == relationship.field_name)
            {
                self.relationships.push(relationship);
            }
        }
    }

    /// Plan selecting every column (singular fetch paths, RETURNING rows).
    pub fn all_columns(table: &Table) -> Self {
        Self {
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
            relationships: Vec::new(),
        }
    }

    /// Projection for the SELECT list: requested columns ∪ primary key ∪
    /// the FK columns of requested relationships ∪ any extra columns the
    /// caller needs (orderBy keys), in table column order.
    pub fn projection(&self, table: &Table, extra: &[String]) -> Vec<String> {
        let mut wanted: BTreeSet<&str> = BTreeSet::new();
        for column in &self.columns {
            wanted.insert(column.as_str());
        }
        for name in &table.primary_key {
            wanted.insert(name.as_str());
        }
        for relationship in &self.relationships {
            for column in &relationship.foreign_key.columns {
                wanted.insert(column.as_str());
            }
        }
        for column in extra {
            wanted.insert(column.as_str());
        }
        let projection: Vec<String> = table
            .columns
            .iter()
            .filter(|c| wanted.contains(c.name.as_str()))
            .map(|c| c.name.clone())
            .collect();
        if projection.is_empty() {
            // Nothing concrete was selected (e.g. only __typename on a
            // keyless view); fall back to every column.
            return table.columns.iter().map(|c| c.name.clone()).collect();
        }
        projection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::sample_catalog;

    #[test]
    fn test_projection_adds_pk_and_fk_columns() {
        let catalog = sample_catalog();
        let orders = catalog.table("orders").unwrap();
        let customer = catalog.table("customer").unwrap();

        let plan = SelectionPlan {
            columns: vec!["total".to_string()],
            relationships: vec![RelationshipSelection {
                field_name: "customer".to_string(),
                foreign_key: orders.foreign_keys[0].clone(),
                referenced_table: "customer".to_string(),
                plan: SelectionPlan {
                    columns: vec!["name".to_string()],
                    relationships: vec![],
                },
            }],
        };

        // order_id (pk) and customer_id (fk) join the projection, in table
        // column order.
        assert_eq!(
            plan.projection(orders, &[]),
            vec!["order_id", "customer_id", "total"]
        );

        // orderBy keys can be forced into the projection.
        let narrow = SelectionPlan {
            columns: vec!["customer_id".to_string()],
            relationships: vec![],
        };
        assert_eq!(
            narrow.projection(customer, &["name".to_string()]),
            vec!["customer_id", "name"]
        );
    }

    #[test]
    fn test_all_columns() {
        let catalog = sample_catalog();
        let customer = catalog.table("customer").unwrap();
        let plan = SelectionPlan::all_columns(customer);
        assert_eq!(plan.columns.len(), customer.columns.len());
    }
}
