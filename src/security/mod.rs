// # Security Guard
//
// Query-shape limits applied before execution: selection depth, a
// complexity score, and request byte size, plus validation of the database
// role identifier bound per request. Rejections carry the rule, the
// measured value and the configured limit.

use async_graphql::parser::parse_query;
use async_graphql::parser::types::{
    DocumentOperations, ExecutableDocument, Field as ParsedField, OperationDefinition, Selection,
    SelectionSet,
};
use async_graphql::Positioned;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::catalog::{Catalog, Table};
use crate::config::SecurityConfig;
use crate::error::{GatewayError, Result};
use crate::graphql::type_mapper::relationship_fields;

/// Effective limit assumed for list fields that do not bound themselves
/// (or whose bound hides behind a variable the guard cannot see).
const DEFAULT_EFFECTIVE_LIMIT: i64 = 100;

static ROLE_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("role identifier regex"));

/// Measured shape of one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMetrics {
    pub depth: usize,
    pub complexity: usize,
    pub field_count: usize,
}

pub struct SecurityGuard {
    config: SecurityConfig,
}

impl SecurityGuard {
    pub fn new(config: SecurityConfig) -> Self {
        Self { config }
    }

    /// Reject oversized request bodies before parsing anything.
    pub fn check_request_size(&self, size: usize) -> Result<()> {
        if size > self.config.max_request_bytes {
            return Err(GatewayError::ExecutionAborted(format!(
                "request size {} bytes exceeds the limit of {} bytes",
                size, self.config.max_request_bytes
            )));
        }
        Ok(())
    }

    /// Validate a database role identifier from request context.
    pub fn validate_role(&self, role: &str) -> Result<()> {
        if ROLE_IDENT.is_match(role) {
            Ok(())
        } else {
            Err(GatewayError::Validation(format!(
                "invalid database role identifier {:?}",
                role
            )))
        }
    }

    /// Parse and score the query, rejecting it when depth or complexity
    /// exceed their limits. Introspection fields count like any other.
    pub fn check_query(&self, query: &str, catalog: &Catalog) -> Result<QueryMetrics> {
        let document = parse_query(query)
            .map_err(|e| GatewayError::Validation(format!("query parse error: {}", e)))?;

        let mut metrics = QueryMetrics::default();
        match &document.operations {
            DocumentOperations::Single(operation) => {
                self.score_operation(&document, operation, catalog, &mut metrics);
            }
            DocumentOperations::Multiple(operations) => {
                for operation in operations.values() {
                    self.score_operation(&document, operation, catalog, &mut metrics);
                }
            }
        }

        if metrics.depth > self.config.max_depth {
            return Err(GatewayError::ExecutionAborted(format!(
                "maximum query depth exceeded: depth {} is over the limit of {}",
                metrics.depth, self.config.max_depth
            )));
        }
        if metrics.complexity > self.config.max_complexity {
            return Err(GatewayError::ExecutionAborted(format!(
                "maximum query complexity exceeded: score {} is over the limit of {}",
                metrics.complexity, self.config.max_complexity
            )));
        }
        Ok(metrics)
    }

    fn score_operation(
        &self,
        document: &ExecutableDocument,
        operation: &Positioned<OperationDefinition>,
        catalog: &Catalog,
        metrics: &mut QueryMetrics,
    ) {
        self.score_selection_set(
            document,
            &operation.node.selection_set,
            catalog,
            None,
            1,
            true,
            metrics,
        );
    }

    /// Walk one selection set. `table` is the object context for
    /// relationship detection; `root` marks the operation root where list /
    /// connection / aggregate fields live.
    #[allow(clippy::too_many_arguments)]
    fn score_selection_set(
        &self,
        document: &ExecutableDocument,
        selection_set: &Positioned<SelectionSet>,
        catalog: &Catalog,
        table: Option<&Table>,
        depth: usize,
        root: bool,
        metrics: &mut QueryMetrics,
    ) {
        for item in &selection_set.node.items {
            match &item.node {
                Selection::Field(field) => {
                    metrics.depth = metrics.depth.max(depth);
                    metrics.field_count += 1;
                    metrics.complexity += 1;
                    let name = field.node.name.node.as_str();

                    let mut next_table = None;
                    if root {
                        if let Some(found) = root_field_table(catalog, name) {
                            let effective = argument_limit(&field.node)
                                .unwrap_or(DEFAULT_EFFECTIVE_LIMIT)
                                .max(0) as usize;
                            metrics.complexity += effective.div_ceil(10);
                            next_table = Some(found);
                        }
                    } else if let Some(current) = table {
                        if let Some(fk_table) = relationship_target(catalog, current, name) {
                            metrics.complexity += 2;
                            next_table = Some(fk_table);
                        }
                    }

                    if !field.node.selection_set.node.items.is_empty() {
                        // Connection wrappers (edges/node) keep the table
                        // context while descending.
                        let context = if matches!(name, "edges" | "node") {
                            table
                        } else {
                            next_table
                        };
                        self.score_selection_set(
                            document,
                            &field.node.selection_set,
                            catalog,
                            context,
                            depth + 1,
                            false,
                            metrics,
                        );
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if let Some(fragment) = document.fragments.get(&spread.node.fragment_name.node)
                    {
                        self.score_selection_set(
                            document,
                            &fragment.node.selection_set,
                            catalog,
                            table,
                            depth,
                            root,
                            metrics,
                        );
                    }
                }
                Selection::InlineFragment(fragment) => {
                    self.score_selection_set(
                        document,
                        &fragment.node.selection_set,
                        catalog,
                        table,
                        depth,
                        root,
                        metrics,
                    );
                }
            }
        }
    }
}

/// Map a root field name back to its table: `customer`,
/// `customerConnection`, `customer_aggregate` all resolve to `customer`.
fn root_field_table<'a>(catalog: &'a Catalog, field: &str) -> Option<&'a Table> {
    if let Some(table) = catalog.table(field) {
        return Some(table);
    }
    if let Some(base) = field.strip_suffix("Connection") {
        if let Some(table) = catalog.table(base) {
            return Some(table);
        }
    }
    if let Some(base) = field.strip_suffix("_aggregate") {
        if let Some(table) = catalog.table(base) {
            return Some(table);
        }
    }
    None
}

fn relationship_target<'a>(catalog: &'a Catalog, table: &Table, field: &str) -> Option<&'a Table> {
    relationship_fields(table)
        .into_iter()
        .find(|(name, _)| name == field)
        .and_then(|(_, fk)| catalog.table(&fk.referenced_table))
}

fn argument_limit(field: &ParsedField) -> Option<i64> {
    for (name, value) in &field.arguments {
        if matches!(name.node.as_str(), "limit" | "first" | "last") {
            // Variable-bound limits stay invisible here; the caller falls
            // back to the default effective limit.
            if let Some(async_graphql::Value::Number(number)) = value.node.clone().into_const() {
                return number.as_i64();
            }
        }
    }
    None
}
