// GraphQL Schema Generation Tests
// Verifies the schema surface synthesized from a reflected catalog:
// object types, filter/orderBy/mutation inputs, connection and aggregate
// types, and the Query/Mutation/Subscription roots.

use std::sync::Arc;

use postgate::catalog::{
    Catalog, CatalogCache, Column, EnumType, ForeignKey, Table, TableKind,
};
use postgate::cdc::CdcEngine;
use postgate::graphql::{build_schema, GatewayState};
use postgate::GatewayConfig;
use sqlx::postgres::PgPoolOptions;

fn column(name: &str, raw_type: &str, nullable: bool) -> Column {
    Column {
        name: name.to_string(),
        raw_type: raw_type.to_string(),
        is_nullable: nullable,
        is_primary_key: false,
        array_dimensions: 0,
        element_type: None,
        has_default: false,
        ordinal: 0,
    }
}

fn pk(name: &str, raw_type: &str) -> Column {
    Column {
        is_nullable: false,
        is_primary_key: true,
        has_default: true,
        ..column(name, raw_type, false)
    }
}

fn fixture_catalog() -> Catalog {
    let customer = Table {
        name: "customer".to_string(),
        kind: TableKind::Base,
        columns: vec![
            pk("customer_id", "integer"),
            column("name", "text", false),
            column("active", "boolean", true),
            column("mood", "mood", true),
            column("created_at", "timestamp with time zone", true),
        ],
        primary_key: vec!["customer_id".to_string()],
        foreign_keys: vec![],
    };
    let orders = Table {
        name: "orders".to_string(),
        kind: TableKind::Base,
        columns: vec![
            pk("order_id", "integer"),
            column("customer_id", "integer", true),
            column("total", "numeric(10,2)", true),
        ],
        primary_key: vec!["order_id".to_string()],
        foreign_keys: vec![ForeignKey {
            name: "orders_customer_id_fkey".to_string(),
            columns: vec!["customer_id".to_string()],
            referenced_table: "customer".to_string(),
            referenced_columns: vec!["customer_id".to_string()],
        }],
    };
    let report = Table {
        name: "sales_report".to_string(),
        kind: TableKind::View,
        columns: vec![column("region", "text", true), column("total", "numeric", true)],
        primary_key: vec![],
        foreign_keys: vec![],
    };
    Catalog::new(
        "public".to_string(),
        vec![customer, orders, report],
        vec![EnumType {
            name: "mood".to_string(),
            values: vec!["sad".to_string(), "ok".to_string(), "happy".to_string()],
        }],
        vec![],
    )
}

fn fixture_state(catalog: Catalog, with_cdc: bool) -> GatewayState {
    let config = Arc::new(GatewayConfig::default());
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://postgres@localhost/postgres")
        .expect("lazy pool");
    let cdc = with_cdc.then(|| {
        CdcEngine::new(
            "postgres://postgres@localhost/postgres".to_string(),
            "public".to_string(),
            config.cdc.clone(),
        )
    });
    GatewayState {
        pool,
        catalog: Arc::new(catalog),
        config: config.clone(),
        catalog_cache: Arc::new(CatalogCache::new(config.cache.schema_ttl)),
        cdc,
        rebuild: Arc::new(tokio::sync::Notify::new()),
    }
}

#[tokio::test]
async fn test_query_surface() {
    let schema = build_schema(fixture_state(fixture_catalog(), true)).unwrap();
    let sdl = schema.sdl();

    // List, connection and aggregate roots per table.
    assert!(sdl.contains("customer("));
    assert!(sdl.contains("customerConnection("));
    assert!(sdl.contains("customer_aggregate("));
    assert!(sdl.contains("orders("));

    // Relay types.
    assert!(sdl.contains("type CustomerConnection"));
    assert!(sdl.contains("type CustomerEdge"));
    assert!(sdl.contains("type PageInfo"));
    assert!(sdl.contains("hasNextPage"));

    // Filter and order inputs.
    assert!(sdl.contains("input CustomerFilter"));
    assert!(sdl.contains("input CustomerOrderBy"));
    assert!(sdl.contains("input StringFilter"));
    assert!(sdl.contains("enum OrderDirection"));
}

#[tokio::test]
async fn test_mutation_surface_excludes_views() {
    let schema = build_schema(fixture_state(fixture_catalog(), false)).unwrap();
    let sdl = schema.sdl();

    assert!(sdl.contains("createCustomer("));
    assert!(sdl.contains("createManyCustomers("));
    assert!(sdl.contains("updateCustomer("));
    assert!(sdl.contains("deleteCustomer("));
    assert!(sdl.contains("createCustomerWithRelations("));
    assert!(sdl.contains("refreshSchema"));

    // Views are read-only: no mutation fields are generated for them.
    assert!(!sdl.contains("createSales_report"));
    assert!(!sdl.contains("updateSales_report"));
    assert!(sdl.contains("sales_report("));
}

#[tokio::test]
async fn test_subscription_surface_requires_cdc() {
    let with_cdc = build_schema(fixture_state(fixture_catalog(), true)).unwrap();
    let sdl = with_cdc.sdl();
    assert!(sdl.contains("customerChanges"));
    assert!(sdl.contains("ordersChanges"));
    assert!(sdl.contains("type TableChangeEvent"));
    assert!(sdl.contains("enum ChangeOperation"));
    // Views never change through the publication.
    assert!(!sdl.contains("sales_reportChanges"));

    let without_cdc = build_schema(fixture_state(fixture_catalog(), false)).unwrap();
    assert!(!without_cdc.sdl().contains("customerChanges"));
}

#[tokio::test]
async fn test_user_enum_mapping() {
    let schema = build_schema(fixture_state(fixture_catalog(), false)).unwrap();
    let sdl = schema.sdl();
    assert!(sdl.contains("enum Mood"));
    assert!(sdl.contains("SAD"));
    assert!(sdl.contains("HAPPY"));
    assert!(sdl.contains("input MoodFilter"));
}

#[tokio::test]
async fn test_relationship_field_wiring() {
    let schema = build_schema(fixture_state(fixture_catalog(), false)).unwrap();
    let sdl = schema.sdl();
    // orders carries a customer field via its FK.
    assert!(sdl.contains("customer: Customer"));
    // connect sub-input on the relations create path.
    assert!(sdl.contains("customer_connect: CustomerKeyInput"));
}

#[tokio::test]
async fn test_composite_pk_inputs() {
    let mut catalog = fixture_catalog();
    let items = Table {
        name: "order_items".to_string(),
        kind: TableKind::Base,
        columns: vec![
            pk("order_id", "integer"),
            pk("product_id", "integer"),
            column("quantity", "integer", true),
        ],
        primary_key: vec!["order_id".to_string(), "product_id".to_string()],
        foreign_keys: vec![],
    };
    catalog = Catalog::new(
        catalog.schema.clone(),
        {
            let mut tables = catalog.tables.clone();
            tables.push(items);
            tables
        },
        catalog.enums.clone(),
        catalog.composites.clone(),
    );

    let schema = build_schema(fixture_state(catalog, false)).unwrap();
    let sdl = schema.sdl();
    assert!(sdl.contains("updateOrder_items("));
    assert!(sdl.contains("input Order_itemsUpdateInput"));
    assert!(sdl.contains("input Order_itemsDeleteInput"));
}

#[tokio::test]
async fn test_schema_name_resolves_without_database() {
    let schema = build_schema(fixture_state(fixture_catalog(), false)).unwrap();
    let response = schema
        .execute(async_graphql::Request::new("{ schemaName }"))
        .await;
    assert!(response.errors.is_empty());
    let data = response.data.into_json().unwrap();
    assert_eq!(data["schemaName"], "public");
}

#[tokio::test]
async fn test_introspection_executes() {
    let schema = build_schema(fixture_state(fixture_catalog(), true)).unwrap();
    let response = schema
        .execute(async_graphql::Request::new(
            "{ __schema { queryType { name } subscriptionType { name } } }",
        ))
        .await;
    assert!(response.errors.is_empty(), "errors: {:?}", response.errors);
    let data = response.data.into_json().unwrap();
    assert_eq!(data["__schema"]["queryType"]["name"], "Query");
    assert_eq!(data["__schema"]["subscriptionType"]["name"], "Subscription");
}
