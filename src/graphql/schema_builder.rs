// # Schema Builder
//
// Assembles the complete GraphQL schema from a catalog snapshot: object
// types with column and relationship fields, filter / order-by / mutation
// inputs, Relay connection types, aggregates, and the Query / Mutation /
// Subscription roots. Every resolver is a closure over the column metadata
// it needs; request-scoped state (the execution context) rides in request
// data, process state (pool, catalog snapshot, CDC engine) in schema data.

use std::sync::Arc;

use async_graphql::dynamic::{
    Enum, EnumItem, Field, FieldFuture, FieldValue, InputObject, InputValue, Object,
    ResolverContext, Schema, Subscription, SubscriptionField,
    SubscriptionFieldFuture, TypeRef,
};
use async_graphql::{Name, Value as GqlValue};
use serde_json::Value as Json;
use sqlx::postgres::PgPool;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::catalog::{Catalog, CatalogCache, Column, Table};
use crate::cdc::{CdcEngine, ChangeEvent};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::executor::{loader, ExecutionContext, JsonRow};
use crate::graphql::scalars::custom_scalars;
use crate::graphql::selection::SelectionPlan;
use crate::graphql::type_mapper::{
    classify_column, classify_raw, enum_value_name, operators_for, relationship_fields, type_name,
    FieldKind, FilterCategory, MappedType,
};
use crate::sql::builder::{AggregateSelection, OrderByEntry, SqlBuilder};
use crate::sql::{decode_cursor, encode_cursor, MutationBuilder, OFFSET_CURSOR_SENTINEL};

/// Default page size when a connection neither bounds itself with
/// first/last nor supplies a limit.
const DEFAULT_PAGE_SIZE: i64 = 100;

/// Process-wide state shared by every resolver through schema data.
#[derive(Clone)]
pub struct GatewayState {
    pub pool: PgPool,
    pub catalog: Arc<Catalog>,
    pub config: Arc<GatewayConfig>,
    pub catalog_cache: Arc<CatalogCache>,
    pub cdc: Option<Arc<CdcEngine>>,
    /// Signalled by `refreshSchema`; the server rebuilds and swaps the
    /// schema when notified.
    pub rebuild: Arc<tokio::sync::Notify>,
}

/// Build the executable schema for the state's catalog snapshot.
pub fn build_schema(state: GatewayState) -> Result<Schema> {
    let catalog = state.catalog.clone();

    let base_tables: Vec<&Table> = catalog
        .tables
        .iter()
        .filter(|t| t.kind.is_mutable())
        .collect();
    let with_subscriptions = state.cdc.is_some() && !base_tables.is_empty();

    let mut builder = Schema::build(
        "Query",
        Some("Mutation"),
        with_subscriptions.then_some("Subscription"),
    );

    for scalar in custom_scalars() {
        builder = builder.register(scalar);
    }
    builder = builder.register(
        Enum::new("OrderDirection")
            .item(EnumItem::new("ASC"))
            .item(EnumItem::new("DESC")),
    );
    builder = builder.register(change_operation_enum());
    builder = builder.register(change_event_object());
    builder = builder.register(page_info_object());
    for filter in scalar_filter_inputs() {
        builder = builder.register(filter);
    }

    for enum_type in &catalog.enums {
        builder = builder.register(user_enum(enum_type));
        builder = builder.register(user_enum_filter(enum_type));
    }
    for composite in &catalog.composites {
        builder = builder.register(composite_object(&catalog, composite));
        builder = builder.register(composite_input(&catalog, composite));
    }

    let mut query = Object::new("Query").field(schema_name_field());
    let mut mutation = Object::new("Mutation").field(refresh_schema_field());
    let mut subscription = Subscription::new("Subscription");

    for table in &catalog.tables {
        builder = builder.register(table_object(&catalog, table));
        builder = builder.register(filter_input(&catalog, table));
        builder = builder.register(order_by_input(table));
        builder = builder.register(edge_object(table));
        builder = builder.register(connection_object(table));
        for aggregate_type in aggregate_objects(&catalog, table) {
            builder = builder.register(aggregate_type);
        }

        query = query
            .field(list_field(table))
            .field(connection_field(table))
            .field(aggregate_field(table));

        if table.kind.is_mutable() {
            builder = builder.register(create_input(&catalog, table));
            builder = builder.register(update_input(&catalog, table));
            builder = builder.register(delete_input(&catalog, table));
            builder = builder.register(key_input(&catalog, table));
            builder = builder.register(create_with_relations_input(&catalog, table));

            mutation = mutation
                .field(create_mutation(table))
                .field(create_many_mutation(table))
                .field(update_mutation(table))
                .field(delete_mutation(table))
                .field(create_with_relations_mutation(table));

            if with_subscriptions {
                subscription = subscription.field(changes_subscription(table));
            }
        }
    }

    builder = builder.register(query).register(mutation);
    if with_subscriptions {
        builder = builder.register(subscription);
    }

    builder
        .data(state)
        .finish()
        .map_err(|e| GatewayError::Configuration(format!("schema build failed: {}", e)))
}

// ============================================================================
// Shared output types
// ============================================================================

fn change_operation_enum() -> Enum {
    Enum::new("ChangeOperation")
        .item(EnumItem::new("INSERT"))
        .item(EnumItem::new("UPDATE"))
        .item(EnumItem::new("DELETE"))
        .item(EnumItem::new("HEARTBEAT"))
        .item(EnumItem::new("ERROR"))
}

fn change_event_object() -> Object {
    Object::new("TableChangeEvent")
        .field(Field::new("table", TypeRef::named_nn(TypeRef::STRING), |ctx| {
            FieldFuture::new(async move {
                let event = downcast_event(&ctx)?;
                Ok(Some(GqlValue::from(event.table.clone())))
            })
        }))
        .field(Field::new("schema", TypeRef::named_nn(TypeRef::STRING), |ctx| {
            FieldFuture::new(async move {
                let event = downcast_event(&ctx)?;
                Ok(Some(GqlValue::from(event.schema.clone())))
            })
        }))
        .field(Field::new(
            "operation",
            TypeRef::named_nn("ChangeOperation"),
            |ctx| {
                FieldFuture::new(async move {
                    let event = downcast_event(&ctx)?;
                    Ok(Some(GqlValue::Enum(Name::new(event.operation.as_str()))))
                })
            },
        ))
        .field(Field::new("timestamp", TypeRef::named_nn("DateTime"), |ctx| {
            FieldFuture::new(async move {
                let event = downcast_event(&ctx)?;
                Ok(Some(GqlValue::from(event.timestamp.to_rfc3339())))
            })
        }))
        .field(Field::new("lsn", TypeRef::named(TypeRef::STRING), |ctx| {
            FieldFuture::new(async move {
                let event = downcast_event(&ctx)?;
                Ok(event.lsn.clone().map(GqlValue::from))
            })
        }))
        .field(Field::new("data", TypeRef::named("JSON"), |ctx| {
            FieldFuture::new(async move {
                let event = downcast_event(&ctx)?;
                match &event.data {
                    Some(data) => Ok(Some(FieldValue::value(json_to_gql(data.clone())))),
                    None => Ok(None),
                }
            })
        }))
        .field(Field::new("error", TypeRef::named(TypeRef::STRING), |ctx| {
            FieldFuture::new(async move {
                let event = downcast_event(&ctx)?;
                Ok(event.error.clone().map(GqlValue::from))
            })
        }))
}

fn downcast_event<'a, 'b>(ctx: &'b ResolverContext<'a>) -> async_graphql::Result<&'b ChangeEvent> {
    ctx.parent_value
        .try_downcast_ref::<ChangeEvent>()
        .map_err(|_| async_graphql::Error::new("internal: change event payload missing"))
}

/// Relay page info, resolved from the connection's computed page state.
#[derive(Debug, Clone)]
struct PageInfoData {
    has_next_page: bool,
    has_previous_page: bool,
    start_cursor: Option<String>,
    end_cursor: Option<String>,
}

#[derive(Debug, Clone)]
struct EdgeData {
    row: JsonRow,
    cursor: String,
}

#[derive(Debug)]
struct ConnectionData {
    edges: Vec<EdgeData>,
    page_info: PageInfoData,
    total_count: i64,
}

fn page_info_object() -> Object {
    Object::new("PageInfo")
        .field(Field::new(
            "hasNextPage",
            TypeRef::named_nn(TypeRef::BOOLEAN),
            |ctx| {
                FieldFuture::new(async move {
                    let info = downcast_page_info(&ctx)?;
                    Ok(Some(GqlValue::from(info.has_next_page)))
                })
            },
        ))
        .field(Field::new(
            "hasPreviousPage",
            TypeRef::named_nn(TypeRef::BOOLEAN),
            |ctx| {
                FieldFuture::new(async move {
                    let info = downcast_page_info(&ctx)?;
                    Ok(Some(GqlValue::from(info.has_previous_page)))
                })
            },
        ))
        .field(Field::new(
            "startCursor",
            TypeRef::named(TypeRef::STRING),
            |ctx| {
                FieldFuture::new(async move {
                    let info = downcast_page_info(&ctx)?;
                    Ok(info.start_cursor.clone().map(GqlValue::from))
                })
            },
        ))
        .field(Field::new(
            "endCursor",
            TypeRef::named(TypeRef::STRING),
            |ctx| {
                FieldFuture::new(async move {
                    let info = downcast_page_info(&ctx)?;
                    Ok(info.end_cursor.clone().map(GqlValue::from))
                })
            },
        ))
}

fn downcast_page_info<'a, 'b>(
    ctx: &'b ResolverContext<'a>,
) -> async_graphql::Result<&'b PageInfoData> {
    ctx.parent_value
        .try_downcast_ref::<PageInfoData>()
        .map_err(|_| async_graphql::Error::new("internal: page info payload missing"))
}

// ============================================================================
// Filter / input type synthesis
// ============================================================================

/// The per-kind filter inputs shared by every table.
fn scalar_filter_inputs() -> Vec<InputObject> {
    let specs: &[(&str, &str, FilterCategory)] = &[
        ("IntFilter", "Int", FilterCategory::Comparable),
        ("BigIntFilter", "BigInt", FilterCategory::Comparable),
        ("FloatFilter", "Float", FilterCategory::Comparable),
        ("DecimalFilter", "Decimal", FilterCategory::Comparable),
        ("DateTimeFilter", "DateTime", FilterCategory::Comparable),
        ("StringFilter", "String", FilterCategory::Stringy),
        ("BooleanFilter", "Boolean", FilterCategory::Boolean),
        ("JSONFilter", "JSON", FilterCategory::Json),
        ("ArrayFilter", "JSON", FilterCategory::Array),
    ];
    specs
        .iter()
        .map(|(name, base, category)| {
            let mut input = InputObject::new(*name);
            for op in operators_for(*category) {
                input = input.field(InputValue::new(*op, operator_type_ref(op, base)));
            }
            input
        })
        .collect()
}

fn operator_type_ref(op: &str, base: &str) -> TypeRef {
    match op {
        "in" | "notIn" => TypeRef::named_list(base),
        "isNull" | "isNotNull" => TypeRef::named(TypeRef::BOOLEAN),
        "contains" | "startsWith" | "endsWith" | "like" | "ilike" if base == "String" => {
            TypeRef::named(TypeRef::STRING)
        }
        "hasKey" => TypeRef::named(TypeRef::STRING),
        _ => TypeRef::named(base),
    }
}

fn user_enum(enum_type: &crate::catalog::EnumType) -> Enum {
    let mut output = Enum::new(type_name(&enum_type.name));
    for label in &enum_type.values {
        output = output.item(EnumItem::new(enum_value_name(label)));
    }
    output
}

fn user_enum_filter(enum_type: &crate::catalog::EnumType) -> InputObject {
    let gql_name = type_name(&enum_type.name);
    let mut input = InputObject::new(format!("{}Filter", gql_name));
    for op in operators_for(FilterCategory::Enum) {
        input = input.field(InputValue::new(*op, operator_type_ref(op, &gql_name)));
    }
    input
}

fn composite_object(catalog: &Catalog, composite: &crate::catalog::CompositeType) -> Object {
    let mut object = Object::new(type_name(&composite.name));
    for field in &composite.fields {
        let mapped = MappedType::scalar(classify_raw(&field.raw_type, catalog));
        let field_name = field.name.clone();
        let mapped_clone = mapped.clone();
        object = object.field(Field::new(
            &field.name,
            TypeRef::named(mapped.graphql_base_type()),
            move |ctx| {
                let field_name = field_name.clone();
                let mapped = mapped_clone.clone();
                FieldFuture::new(async move {
                    let parent = ctx
                        .parent_value
                        .try_downcast_ref::<Json>()
                        .map_err(|_| async_graphql::Error::new("internal: composite payload"))?;
                    let value = parent.get(&field_name).cloned().unwrap_or(Json::Null);
                    resolve_column_value(&ctx, value, &mapped)
                })
            },
        ));
    }
    object
}

fn composite_input(catalog: &Catalog, composite: &crate::catalog::CompositeType) -> InputObject {
    let mut input = InputObject::new(format!("{}Input", type_name(&composite.name)));
    for field in &composite.fields {
        let mapped = MappedType::scalar(classify_raw(&field.raw_type, catalog));
        input = input.field(InputValue::new(
            &field.name,
            TypeRef::named(input_base_type(&mapped)),
        ));
    }
    input
}

/// Base GraphQL input type for a mapped kind (composites use their Input
/// counterpart).
fn input_base_type(mapped: &MappedType) -> String {
    match &mapped.kind {
        FieldKind::Composite(name) => format!("{}Input", type_name(name)),
        _ => mapped.graphql_base_type(),
    }
}

fn column_output_type(column: &Column, mapped: &MappedType) -> TypeRef {
    let base = mapped.graphql_base_type();
    match (mapped.is_array(), column.is_nullable) {
        (true, true) => TypeRef::named_list(base),
        (true, false) => TypeRef::named_list_nn(base),
        (false, true) => TypeRef::named(base),
        (false, false) => TypeRef::named_nn(base),
    }
}

fn column_input_type(mapped: &MappedType, required: bool) -> TypeRef {
    let base = input_base_type(mapped);
    match (mapped.is_array(), required) {
        (true, true) => TypeRef::named_list_nn(base),
        (true, false) => TypeRef::named_list(base),
        (false, true) => TypeRef::named_nn(base),
        (false, false) => TypeRef::named(base),
    }
}

fn filter_input(catalog: &Catalog, table: &Table) -> InputObject {
    let filter_name = format!("{}Filter", type_name(&table.name));
    let mut input = InputObject::new(&filter_name);
    for column in &table.columns {
        let mapped = classify_column(column, catalog);
        if let Some(column_filter) = mapped.filter_input_name() {
            input = input.field(InputValue::new(&column.name, TypeRef::named(column_filter)));
        }
    }
    input.field(InputValue::new("or", TypeRef::named_list(filter_name)))
}

fn order_by_input(table: &Table) -> InputObject {
    let mut input = InputObject::new(format!("{}OrderBy", type_name(&table.name)));
    for column in &table.columns {
        input = input.field(InputValue::new(
            &column.name,
            TypeRef::named("OrderDirection"),
        ));
    }
    input
}

fn create_input(catalog: &Catalog, table: &Table) -> InputObject {
    let mut input = InputObject::new(format!("{}CreateInput", type_name(&table.name)));
    for column in &table.columns {
        let mapped = classify_column(column, catalog);
        let required = !column.is_nullable && !column.has_default;
        input = input.field(InputValue::new(
            &column.name,
            column_input_type(&mapped, required),
        ));
    }
    input
}

fn update_input(catalog: &Catalog, table: &Table) -> InputObject {
    let mut input = InputObject::new(format!("{}UpdateInput", type_name(&table.name)));
    for column in &table.columns {
        let mapped = classify_column(column, catalog);
        input = input.field(InputValue::new(
            &column.name,
            column_input_type(&mapped, column.is_primary_key),
        ));
    }
    input
}

fn delete_input(catalog: &Catalog, table: &Table) -> InputObject {
    let mut input = InputObject::new(format!("{}DeleteInput", type_name(&table.name)));
    for column in table.primary_key_columns() {
        let mapped = classify_column(column, catalog);
        input = input.field(InputValue::new(&column.name, column_input_type(&mapped, true)));
    }
    input
}

/// Key input used by `_connect` sub-inputs: the table's primary key.
fn key_input(catalog: &Catalog, table: &Table) -> InputObject {
    let mut input = InputObject::new(format!("{}KeyInput", type_name(&table.name)));
    for column in table.primary_key_columns() {
        let mapped = classify_column(column, catalog);
        input = input.field(InputValue::new(&column.name, column_input_type(&mapped, true)));
    }
    input
}

fn create_with_relations_input(catalog: &Catalog, table: &Table) -> InputObject {
    let fk_columns: Vec<&str> = table
        .foreign_keys
        .iter()
        .flat_map(|fk| fk.columns.iter().map(String::as_str))
        .collect();
    let mut input = InputObject::new(format!("{}CreateWithRelationsInput", type_name(&table.name)));
    for column in &table.columns {
        let mapped = classify_column(column, catalog);
        // FK columns may instead arrive through a _connect sub-input.
        let required =
            !column.is_nullable && !column.has_default && !fk_columns.contains(&column.name.as_str());
        input = input.field(InputValue::new(
            &column.name,
            column_input_type(&mapped, required),
        ));
    }
    for (field_name, fk) in relationship_fields(table) {
        input = input.field(InputValue::new(
            format!("{}_connect", field_name),
            TypeRef::named(format!("{}KeyInput", type_name(&fk.referenced_table))),
        ));
    }
    input
}

// ============================================================================
// Object type synthesis
// ============================================================================

fn table_object(catalog: &Catalog, table: &Table) -> Object {
    let mut object = Object::new(type_name(&table.name));

    for column in &table.columns {
        let mapped = classify_column(column, catalog);
        let column_name = column.name.clone();
        let mapped_clone = mapped.clone();
        object = object.field(Field::new(
            &column.name,
            column_output_type(column, &mapped),
            move |ctx| {
                let column_name = column_name.clone();
                let mapped = mapped_clone.clone();
                FieldFuture::new(async move {
                    let row = downcast_row(&ctx)?;
                    let value = row.get(&column_name).cloned().unwrap_or(Json::Null);
                    resolve_column_value(&ctx, value, &mapped)
                })
            },
        ));
    }

    for (field_name, fk) in relationship_fields(table) {
        let fk = fk.clone();
        let target_type = type_name(&fk.referenced_table);
        object = object.field(Field::new(
            &field_name,
            TypeRef::named(target_type),
            move |ctx| {
                let fk = fk.clone();
                FieldFuture::new(async move {
                    let state = ctx.ctx.data::<GatewayState>()?;
                    let exec = ctx.ctx.data::<Arc<ExecutionContext>>()?;
                    let row = downcast_row(&ctx)?;

                    let values: Option<Vec<&Json>> = fk
                        .columns
                        .iter()
                        .map(|c| row.get(c).filter(|v| !v.is_null()))
                        .collect();
                    let Some(values) = values else {
                        return Ok(None);
                    };

                    let cache_key = loader::cache_key(&fk);
                    let tuple_key = crate::executor::tuple_key(&values);
                    {
                        let cache = exec.relationship_cache.read().await;
                        if let Some(message) = cache.failed.get(&cache_key) {
                            return Err(async_graphql::Error::new(message.clone()));
                        }
                        if let Some(index) = cache.loaded.get(&cache_key) {
                            return Ok(index
                                .get(&tuple_key)
                                .cloned()
                                .map(FieldValue::owned_any));
                        }
                    }
                    // Singular fetch path without a batch cache.
                    let loaded =
                        loader::load_single(exec, &state.catalog, &fk, row).await?;
                    Ok(loaded.map(FieldValue::owned_any))
                })
            },
        ));
    }

    object
}

fn downcast_row<'a, 'b>(ctx: &'b ResolverContext<'a>) -> async_graphql::Result<&'b JsonRow> {
    ctx.parent_value
        .try_downcast_ref::<JsonRow>()
        .map_err(|_| async_graphql::Error::new("internal: row payload missing"))
}

/// Convert one decoded column value to its GraphQL output form. Enum labels
/// map to their GraphQL value names; composites stay owned objects for
/// their own resolvers.
fn resolve_column_value<'a>(
    ctx: &ResolverContext<'a>,
    value: Json,
    mapped: &MappedType,
) -> async_graphql::Result<Option<FieldValue<'a>>> {
    if value.is_null() {
        return Ok(None);
    }
    if mapped.is_array() {
        let element = MappedType::scalar(mapped.kind.clone());
        if let Json::Array(items) = value {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(
                    resolve_column_value(ctx, item, &element)?.unwrap_or(FieldValue::NULL),
                );
            }
            return Ok(Some(FieldValue::list(out)));
        }
        return Ok(Some(FieldValue::value(json_to_gql(value))));
    }
    match &mapped.kind {
        FieldKind::Composite(_) => Ok(Some(FieldValue::owned_any(value))),
        FieldKind::Enum(name) => {
            let state = ctx.ctx.data::<GatewayState>()?;
            let label = value.as_str().unwrap_or_default().to_string();
            // Preserve round-trip: the label maps to its uppercased value
            // name; an unknown label (e.g. added after reflection) degrades
            // to a plain string value.
            let known = state
                .catalog
                .enum_type(name)
                .map(|e| e.values.iter().any(|l| *l == label))
                .unwrap_or(false);
            if known {
                Ok(Some(FieldValue::value(GqlValue::Enum(Name::new(
                    enum_value_name(&label),
                )))))
            } else {
                Ok(Some(FieldValue::value(GqlValue::from(label))))
            }
        }
        _ => Ok(Some(FieldValue::value(json_to_gql(value)))),
    }
}

fn json_to_gql(value: Json) -> GqlValue {
    GqlValue::from_json(value).unwrap_or(GqlValue::Null)
}

// ============================================================================
// Aggregate types
// ============================================================================

fn aggregate_objects(catalog: &Catalog, table: &Table) -> Vec<Object> {
    let gql_name = type_name(&table.name);
    let summable: Vec<&Column> = table
        .columns
        .iter()
        .filter(|c| classify_column(c, catalog).is_summable())
        .collect();
    let comparable: Vec<&Column> = table
        .columns
        .iter()
        .filter(|c| classify_column(c, catalog).is_comparable_aggregate())
        .collect();

    let mut objects = Vec::new();
    let mut root = Object::new(format!("{}Aggregate", gql_name)).field(Field::new(
        "count",
        TypeRef::named_nn(TypeRef::INT),
        |ctx| {
            FieldFuture::new(async move {
                let row = downcast_row(&ctx)?;
                let count = row.get("count").and_then(Json::as_i64).unwrap_or(0);
                Ok(Some(GqlValue::from(count)))
            })
        },
    ));

    for (function, columns) in [("sum", &summable), ("avg", &summable)] {
        if columns.is_empty() {
            continue;
        }
        let object_name = format!("{}{}Fields", gql_name, capitalize(function));
        objects.push(aggregate_fields_object(catalog, &object_name, function, columns, true));
        root = root.field(aggregate_group_field(function, &object_name));
    }
    for (function, columns) in [("min", &comparable), ("max", &comparable)] {
        if columns.is_empty() {
            continue;
        }
        let object_name = format!("{}{}Fields", gql_name, capitalize(function));
        objects.push(aggregate_fields_object(catalog, &object_name, function, columns, false));
        root = root.field(aggregate_group_field(function, &object_name));
    }

    objects.push(root);
    objects
}

fn capitalize(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// The per-function sub-object passes the aggregate row through to its
/// column leaves.
fn aggregate_group_field(function: &str, object_name: &str) -> Field {
    Field::new(function, TypeRef::named(object_name), |ctx| {
        FieldFuture::new(async move {
            let row = downcast_row(&ctx)?;
            Ok(Some(FieldValue::owned_any(row.clone())))
        })
    })
}

fn aggregate_fields_object(
    catalog: &Catalog,
    object_name: &str,
    function: &str,
    columns: &[&Column],
    numeric_result: bool,
) -> Object {
    let mut object = Object::new(object_name);
    for column in columns {
        let mapped = classify_column(column, catalog);
        let result_type = if numeric_result {
            // SUM/AVG widen: floats stay Float, everything else reports as
            // Decimal.
            if matches!(mapped.kind, FieldKind::Float) {
                "Float".to_string()
            } else {
                "Decimal".to_string()
            }
        } else {
            mapped.graphql_base_type()
        };
        let alias = format!("{}__{}", function, column.name);
        object = object.field(Field::new(
            &column.name,
            TypeRef::named(result_type),
            move |ctx| {
                let alias = alias.clone();
                FieldFuture::new(async move {
                    let row = downcast_row(&ctx)?;
                    let value = row.get(&alias).cloned().unwrap_or(Json::Null);
                    if value.is_null() {
                        // AVG/SUM over zero or all-null rows is null.
                        return Ok(None);
                    }
                    Ok(Some(FieldValue::value(json_to_gql(value))))
                })
            },
        ));
    }
    object
}

// ============================================================================
// Query root fields
// ============================================================================

fn schema_name_field() -> Field {
    Field::new("schemaName", TypeRef::named_nn(TypeRef::STRING), |ctx| {
        FieldFuture::new(async move {
            let state = ctx.ctx.data::<GatewayState>()?;
            Ok(Some(GqlValue::from(state.catalog.schema.clone())))
        })
    })
}

fn list_field(table: &Table) -> Field {
    let table_name = table.name.clone();
    let gql_name = type_name(&table.name);
    Field::new(
        &table.name,
        TypeRef::named_nn_list_nn(gql_name.clone()),
        move |ctx| {
            let table_name = table_name.clone();
            FieldFuture::new(async move { resolve_list(ctx, table_name).await })
        },
    )
    .argument(InputValue::new("where", TypeRef::named(format!("{}Filter", gql_name))))
    .argument(InputValue::new(
        "or",
        TypeRef::named_list(format!("{}Filter", gql_name)),
    ))
    .argument(InputValue::new(
        "orderBy",
        TypeRef::named(format!("{}OrderBy", gql_name)),
    ))
    .argument(InputValue::new("limit", TypeRef::named(TypeRef::INT)))
    .argument(InputValue::new("offset", TypeRef::named(TypeRef::INT)))
}

async fn resolve_list<'a>(
    ctx: ResolverContext<'a>,
    table_name: String,
) -> async_graphql::Result<Option<FieldValue<'a>>> {
    let state = ctx.ctx.data::<GatewayState>()?;
    let exec = ctx.ctx.data::<Arc<ExecutionContext>>()?;
    let catalog = &state.catalog;
    let table = lookup_table(catalog, &table_name)?;

    let where_filter = json_arg(&ctx, "where")?;
    let or_filters = json_arg(&ctx, "or")?;
    let order_by = order_by_arg(&ctx)?;
    let limit = int_arg(&ctx, "limit")?;
    let offset = int_arg(&ctx, "offset")?;

    let plan = SelectionPlan::from_fields(table, catalog, ctx.ctx.field().selection_set());
    let projection = plan.projection(table, &[]);

    let builder = SqlBuilder::new(catalog, table);
    let query = builder.build_list(
        &projection,
        where_filter.as_ref(),
        or_filters.as_ref(),
        &order_by,
        limit,
        offset,
    )?;
    let rows = exec.fetch_all(&query).await?;

    loader::preload_relationships(exec, catalog, &rows, &plan).await;

    Ok(Some(FieldValue::list(
        rows.into_iter().map(FieldValue::owned_any),
    )))
}

fn connection_field(table: &Table) -> Field {
    let table_name = table.name.clone();
    let gql_name = type_name(&table.name);
    Field::new(
        format!("{}Connection", table.name),
        TypeRef::named_nn(format!("{}Connection", gql_name)),
        move |ctx| {
            let table_name = table_name.clone();
            FieldFuture::new(async move { resolve_connection(ctx, table_name).await })
        },
    )
    .argument(InputValue::new("where", TypeRef::named(format!("{}Filter", gql_name))))
    .argument(InputValue::new(
        "or",
        TypeRef::named_list(format!("{}Filter", gql_name)),
    ))
    .argument(InputValue::new(
        "orderBy",
        TypeRef::named(format!("{}OrderBy", gql_name)),
    ))
    .argument(InputValue::new("first", TypeRef::named(TypeRef::INT)))
    .argument(InputValue::new("after", TypeRef::named(TypeRef::STRING)))
    .argument(InputValue::new("last", TypeRef::named(TypeRef::INT)))
    .argument(InputValue::new("before", TypeRef::named(TypeRef::STRING)))
    .argument(InputValue::new("offset", TypeRef::named(TypeRef::INT)))
}

async fn resolve_connection<'a>(
    ctx: ResolverContext<'a>,
    table_name: String,
) -> async_graphql::Result<Option<FieldValue<'a>>> {
    let state = ctx.ctx.data::<GatewayState>()?;
    let exec = ctx.ctx.data::<Arc<ExecutionContext>>()?;
    let catalog = &state.catalog;
    let table = lookup_table(catalog, &table_name)?;

    let where_filter = json_arg(&ctx, "where")?;
    let or_filters = json_arg(&ctx, "or")?;
    let order_by = order_by_arg(&ctx)?;
    let first = int_arg(&ctx, "first")?;
    let last = int_arg(&ctx, "last")?;
    let after = string_arg(&ctx, "after")?;
    let before = string_arg(&ctx, "before")?;
    let offset = int_arg(&ctx, "offset")?;

    let plan = SelectionPlan::from_connection_field(table, catalog, ctx.ctx.field());
    let order_columns: Vec<String> = order_by.iter().map(|e| e.column.clone()).collect();
    let projection = plan.projection(table, &order_columns);
    let builder = SqlBuilder::new(catalog, table);

    // Validation happens before any SQL is issued.
    if order_by.is_empty() && (after.is_some() || before.is_some()) {
        return Err(GatewayError::Validation(
            "cursor pagination requires an orderBy; supply orderBy or use offset".to_string(),
        )
        .into_graphql());
    }
    if after.is_some() && before.is_some() {
        return Err(GatewayError::Validation(
            "after and before cannot be combined".to_string(),
        )
        .into_graphql());
    }
    let backward = last.is_some() || before.is_some();
    let cursor_raw = if backward { before } else { after };
    let cursor_tuple = cursor_raw.as_deref().map(decode_cursor).transpose()?;

    let total_count = exec
        .fetch_count(&builder.build_count(where_filter.as_ref(), or_filters.as_ref())?)
        .await?;

    if order_by.is_empty() {
        // Offset fallback: plain paging with sentinel cursors.
        let limit = first.or(last).unwrap_or(DEFAULT_PAGE_SIZE).max(0);
        let offset_value = offset.unwrap_or(0).max(0);
        let query = builder.build_list(
            &projection,
            where_filter.as_ref(),
            or_filters.as_ref(),
            &[],
            Some(limit),
            Some(offset_value),
        )?;
        let rows = exec.fetch_all(&query).await?;
        loader::preload_relationships(exec, catalog, &rows, &plan).await;

        let has_next_page = offset_value + (rows.len() as i64) < total_count;
        let has_previous_page = offset_value > 0;
        let edges: Vec<EdgeData> = rows
            .into_iter()
            .map(|row| EdgeData {
                row,
                cursor: OFFSET_CURSOR_SENTINEL.to_string(),
            })
            .collect();
        let page_info = PageInfoData {
            has_next_page,
            has_previous_page,
            start_cursor: edges.first().map(|e| e.cursor.clone()),
            end_cursor: edges.last().map(|e| e.cursor.clone()),
        };
        return Ok(Some(FieldValue::owned_any(ConnectionData {
            edges,
            page_info,
            total_count,
        })));
    }

    // Keyset path.
    let limit = if backward {
        last.unwrap_or(DEFAULT_PAGE_SIZE)
    } else {
        first.unwrap_or(DEFAULT_PAGE_SIZE)
    }
    .max(0);

    let query = builder.build_keyset_page(
        &projection,
        where_filter.as_ref(),
        or_filters.as_ref(),
        &order_by,
        cursor_tuple.as_deref(),
        backward,
        limit,
    )?;
    let mut rows = exec.fetch_all(&query).await?;
    if backward {
        rows.reverse();
    }
    loader::preload_relationships(exec, catalog, &rows, &plan).await;

    let edges: Vec<EdgeData> = rows
        .into_iter()
        .map(|row| {
            let tuple: Vec<(String, Json)> = order_by
                .iter()
                .map(|entry| {
                    (
                        entry.column.clone(),
                        row.get(&entry.column).cloned().unwrap_or(Json::Null),
                    )
                })
                .collect();
            EdgeData {
                cursor: encode_cursor(&tuple),
                row,
            }
        })
        .collect();

    // Boundary probes reuse the keyset predicate from the edge tuples.
    let (has_next_page, has_previous_page) = match (edges.first(), edges.last()) {
        (Some(first_edge), Some(last_edge)) => {
            let last_tuple = decode_cursor(&last_edge.cursor)?;
            let next = exec
                .fetch_count(&builder.build_keyset_count(
                    where_filter.as_ref(),
                    or_filters.as_ref(),
                    &order_by,
                    &last_tuple,
                    false,
                )?)
                .await?;
            let first_tuple = decode_cursor(&first_edge.cursor)?;
            let previous = exec
                .fetch_count(&builder.build_keyset_count(
                    where_filter.as_ref(),
                    or_filters.as_ref(),
                    &order_by,
                    &first_tuple,
                    true,
                )?)
                .await?;
            (next > 0, previous > 0)
        }
        _ => (false, false),
    };

    let page_info = PageInfoData {
        has_next_page,
        has_previous_page,
        start_cursor: edges.first().map(|e| e.cursor.clone()),
        end_cursor: edges.last().map(|e| e.cursor.clone()),
    };
    Ok(Some(FieldValue::owned_any(ConnectionData {
        edges,
        page_info,
        total_count,
    })))
}

fn edge_object(table: &Table) -> Object {
    let gql_name = type_name(&table.name);
    Object::new(format!("{}Edge", gql_name))
        .field(Field::new("node", TypeRef::named_nn(gql_name), |ctx| {
            FieldFuture::new(async move {
                let edge = downcast_edge(&ctx)?;
                Ok(Some(FieldValue::owned_any(edge.row.clone())))
            })
        }))
        .field(Field::new("cursor", TypeRef::named_nn(TypeRef::STRING), |ctx| {
            FieldFuture::new(async move {
                let edge = downcast_edge(&ctx)?;
                Ok(Some(GqlValue::from(edge.cursor.clone())))
            })
        }))
}

fn downcast_edge<'a, 'b>(ctx: &'b ResolverContext<'a>) -> async_graphql::Result<&'b EdgeData> {
    ctx.parent_value
        .try_downcast_ref::<EdgeData>()
        .map_err(|_| async_graphql::Error::new("internal: edge payload missing"))
}

fn connection_object(table: &Table) -> Object {
    let gql_name = type_name(&table.name);
    Object::new(format!("{}Connection", gql_name))
        .field(Field::new(
            "edges",
            TypeRef::named_nn_list_nn(format!("{}Edge", gql_name)),
            |ctx| {
                FieldFuture::new(async move {
                    let connection = downcast_connection(&ctx)?;
                    Ok(Some(FieldValue::list(
                        connection
                            .edges
                            .iter()
                            .map(|edge| FieldValue::owned_any(edge.clone())),
                    )))
                })
            },
        ))
        .field(Field::new("pageInfo", TypeRef::named_nn("PageInfo"), |ctx| {
            FieldFuture::new(async move {
                let connection = downcast_connection(&ctx)?;
                Ok(Some(FieldValue::owned_any(connection.page_info.clone())))
            })
        }))
        .field(Field::new(
            "totalCount",
            TypeRef::named_nn(TypeRef::INT),
            |ctx| {
                FieldFuture::new(async move {
                    let connection = downcast_connection(&ctx)?;
                    Ok(Some(GqlValue::from(connection.total_count)))
                })
            },
        ))
}

fn downcast_connection<'a, 'b>(
    ctx: &'b ResolverContext<'a>,
) -> async_graphql::Result<&'b ConnectionData> {
    ctx.parent_value
        .try_downcast_ref::<ConnectionData>()
        .map_err(|_| async_graphql::Error::new("internal: connection payload missing"))
}

fn aggregate_field(table: &Table) -> Field {
    let table_name = table.name.clone();
    let gql_name = type_name(&table.name);
    Field::new(
        format!("{}_aggregate", table.name),
        TypeRef::named_nn(format!("{}Aggregate", gql_name)),
        move |ctx| {
            let table_name = table_name.clone();
            FieldFuture::new(async move { resolve_aggregate(ctx, table_name).await })
        },
    )
    .argument(InputValue::new("where", TypeRef::named(format!("{}Filter", gql_name))))
    .argument(InputValue::new(
        "or",
        TypeRef::named_list(format!("{}Filter", gql_name)),
    ))
}

async fn resolve_aggregate<'a>(
    ctx: ResolverContext<'a>,
    table_name: String,
) -> async_graphql::Result<Option<FieldValue<'a>>> {
    let state = ctx.ctx.data::<GatewayState>()?;
    let exec = ctx.ctx.data::<Arc<ExecutionContext>>()?;
    let catalog = &state.catalog;
    let table = lookup_table(catalog, &table_name)?;

    let where_filter = json_arg(&ctx, "where")?;
    let or_filters = json_arg(&ctx, "or")?;

    // Only aggregate what the selection set references.
    let mut selection = AggregateSelection::default();
    for field in ctx.ctx.field().selection_set() {
        match field.name() {
            "count" => selection.count = true,
            function @ ("sum" | "avg" | "min" | "max") => {
                let columns: Vec<String> =
                    field.selection_set().map(|f| f.name().to_string()).collect();
                match function {
                    "sum" => selection.sum = columns,
                    "avg" => selection.avg = columns,
                    "min" => selection.min = columns,
                    _ => selection.max = columns,
                }
            }
            _ => {}
        }
    }

    let builder = SqlBuilder::new(catalog, table);
    let query = builder.build_aggregate(&selection, where_filter.as_ref(), or_filters.as_ref())?;
    let row = exec
        .fetch_optional(&query)
        .await?
        .unwrap_or_default();
    Ok(Some(FieldValue::owned_any(row)))
}

// ============================================================================
// Mutation root fields
// ============================================================================

fn refresh_schema_field() -> Field {
    Field::new("refreshSchema", TypeRef::named_nn(TypeRef::BOOLEAN), |ctx| {
        FieldFuture::new(async move {
            let state = ctx.ctx.data::<GatewayState>()?;
            state.catalog_cache.invalidate(&state.catalog.schema);
            state.rebuild.notify_one();
            Ok(Some(GqlValue::from(true)))
        })
    })
}

fn create_mutation(table: &Table) -> Field {
    let table_name = table.name.clone();
    let gql_name = type_name(&table.name);
    Field::new(
        format!("create{}", gql_name),
        TypeRef::named(gql_name.clone()),
        move |ctx| {
            let table_name = table_name.clone();
            FieldFuture::new(async move {
                let (state, exec, input) = mutation_parts(&ctx)?;
                let table = lookup_table(&state.catalog, &table_name)?;
                let builder = MutationBuilder::new(&state.catalog, table);
                let query = builder.build_insert(&input)?;
                let row = exec.fetch_optional(&query).await?;
                Ok(row.map(FieldValue::owned_any))
            })
        },
    )
    .argument(InputValue::new(
        "input",
        TypeRef::named_nn(format!("{}CreateInput", gql_name)),
    ))
}

fn create_many_mutation(table: &Table) -> Field {
    let table_name = table.name.clone();
    let gql_name = type_name(&table.name);
    Field::new(
        format!("createMany{}s", gql_name),
        TypeRef::named_nn_list_nn(gql_name.clone()),
        move |ctx| {
            let table_name = table_name.clone();
            FieldFuture::new(async move {
                let state = ctx.ctx.data::<GatewayState>()?;
                let exec = ctx.ctx.data::<Arc<ExecutionContext>>()?;
                let table = lookup_table(&state.catalog, &table_name)?;

                let inputs_value = ctx.args.try_get("inputs")?.deserialize::<Json>()?;
                let inputs: Vec<serde_json::Map<String, Json>> = inputs_value
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_object().cloned())
                            .collect()
                    })
                    .unwrap_or_default();

                let builder = MutationBuilder::new(&state.catalog, table);
                let query = builder.build_insert_many(&inputs)?;
                let rows = exec.fetch_all(&query).await?;
                Ok(Some(FieldValue::list(
                    rows.into_iter().map(FieldValue::owned_any),
                )))
            })
        },
    )
    .argument(InputValue::new(
        "inputs",
        TypeRef::named_nn_list_nn(format!("{}CreateInput", gql_name)),
    ))
}

fn update_mutation(table: &Table) -> Field {
    let table_name = table.name.clone();
    let gql_name = type_name(&table.name);
    Field::new(
        format!("update{}", gql_name),
        TypeRef::named(gql_name.clone()),
        move |ctx| {
            let table_name = table_name.clone();
            FieldFuture::new(async move {
                let (state, exec, input) = mutation_parts(&ctx)?;
                let table = lookup_table(&state.catalog, &table_name)?;
                let builder = MutationBuilder::new(&state.catalog, table);
                let query = builder.build_update(&input)?;
                match exec.fetch_optional(&query).await? {
                    Some(row) => Ok(Some(FieldValue::owned_any(row))),
                    None => Err(GatewayError::NotFound(format!(
                        "no {} row matches the given primary key",
                        table_name
                    ))
                    .into()),
                }
            })
        },
    )
    .argument(InputValue::new(
        "input",
        TypeRef::named_nn(format!("{}UpdateInput", gql_name)),
    ))
}

fn delete_mutation(table: &Table) -> Field {
    let table_name = table.name.clone();
    let gql_name = type_name(&table.name);
    Field::new(
        format!("delete{}", gql_name),
        TypeRef::named(gql_name.clone()),
        move |ctx| {
            let table_name = table_name.clone();
            FieldFuture::new(async move {
                let (state, exec, input) = mutation_parts(&ctx)?;
                let table = lookup_table(&state.catalog, &table_name)?;
                let builder = MutationBuilder::new(&state.catalog, table);
                let query = builder.build_delete(&input)?;
                match exec.fetch_optional(&query).await? {
                    Some(row) => Ok(Some(FieldValue::owned_any(row))),
                    None => Err(GatewayError::NotFound(format!(
                        "no {} row matches the given primary key",
                        table_name
                    ))
                    .into()),
                }
            })
        },
    )
    .argument(InputValue::new(
        "input",
        TypeRef::named_nn(format!("{}DeleteInput", gql_name)),
    ))
}

fn create_with_relations_mutation(table: &Table) -> Field {
    let table_name = table.name.clone();
    let gql_name = type_name(&table.name);
    Field::new(
        format!("create{}WithRelations", gql_name),
        TypeRef::named(gql_name.clone()),
        move |ctx| {
            let table_name = table_name.clone();
            FieldFuture::new(async move {
                let (state, exec, input) = mutation_parts(&ctx)?;
                let table = lookup_table(&state.catalog, &table_name)?;
                let builder = MutationBuilder::new(&state.catalog, table);
                let query = builder.build_insert_with_relations(&input)?;
                let row = exec.fetch_optional(&query).await?;
                Ok(row.map(FieldValue::owned_any))
            })
        },
    )
    .argument(InputValue::new(
        "input",
        TypeRef::named_nn(format!("{}CreateWithRelationsInput", gql_name)),
    ))
}

/// Shared mutation prologue: state, execution context and the `input`
/// object.
fn mutation_parts<'a, 'b>(
    ctx: &'b ResolverContext<'a>,
) -> async_graphql::Result<(
    &'b GatewayState,
    &'b Arc<ExecutionContext>,
    serde_json::Map<String, Json>,
)> {
    let state = ctx.ctx.data::<GatewayState>()?;
    let exec = ctx.ctx.data::<Arc<ExecutionContext>>()?;
    let input = ctx.args.try_get("input")?.deserialize::<Json>()?;
    let input = input
        .as_object()
        .cloned()
        .ok_or_else(|| async_graphql::Error::new("input must be an object"))?;
    Ok((state, exec, input))
}

// ============================================================================
// Subscription root fields
// ============================================================================

fn changes_subscription(table: &Table) -> SubscriptionField {
    let table_name = table.name.clone();
    SubscriptionField::new(
        format!("{}Changes", table.name),
        TypeRef::named_nn("TableChangeEvent"),
        move |ctx| {
            let table_name = table_name.clone();
            SubscriptionFieldFuture::new(async move {
                let state = ctx.ctx.data::<GatewayState>()?;
                let engine = state.cdc.clone().ok_or_else(|| {
                    async_graphql::Error::new("change data capture is not enabled")
                })?;
                let schema_name = state.catalog.schema.clone();
                let receiver = engine.subscribe(&table_name);

                let stream = BroadcastStream::new(receiver).map(move |item| {
                    let event = match item {
                        Ok(event) => event,
                        // The subscriber fell behind the bounded buffer;
                        // intermediate events were dropped. Surface one
                        // ERROR event instead of blocking the producer.
                        Err(BroadcastStreamRecvError::Lagged(count)) => ChangeEvent::error(
                            &schema_name,
                            &table_name,
                            format!("subscriber lagging; dropped {} events", count),
                        ),
                    };
                    Ok(FieldValue::owned_any(event))
                });
                Ok(stream)
            })
        },
    )
}

// ============================================================================
// Argument helpers
// ============================================================================

fn lookup_table<'a>(catalog: &'a Catalog, name: &str) -> async_graphql::Result<&'a Table> {
    catalog
        .table(name)
        .ok_or_else(|| async_graphql::Error::new(format!("unknown table {:?}", name)))
}

fn json_arg(ctx: &ResolverContext<'_>, name: &str) -> async_graphql::Result<Option<Json>> {
    match ctx.args.get(name) {
        Some(accessor) => Ok(Some(accessor.deserialize::<Json>()?)),
        None => Ok(None),
    }
}

fn int_arg(ctx: &ResolverContext<'_>, name: &str) -> async_graphql::Result<Option<i64>> {
    match ctx.args.get(name) {
        Some(accessor) => Ok(Some(accessor.i64()?)),
        None => Ok(None),
    }
}

fn string_arg(ctx: &ResolverContext<'_>, name: &str) -> async_graphql::Result<Option<String>> {
    match ctx.args.get(name) {
        Some(accessor) => Ok(Some(accessor.string()?.to_string())),
        None => Ok(None),
    }
}

/// orderBy entries in the declared field order of the input object.
fn order_by_arg(ctx: &ResolverContext<'_>) -> async_graphql::Result<Vec<OrderByEntry>> {
    let Some(accessor) = ctx.args.get("orderBy") else {
        return Ok(Vec::new());
    };
    let object = accessor.object()?;
    let mut entries = Vec::new();
    for (name, value) in object.iter() {
        let direction = value.enum_name()?;
        entries.push(OrderByEntry {
            column: name.to_string(),
            descending: direction == "DESC",
        });
    }
    Ok(entries)
}
