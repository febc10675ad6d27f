// SQL Planning Tests
// End-to-end checks of the planning layers against the documented
// scenarios: keyset pagination predicates, where/or combination, and
// composite-key mutation validation.

use postgate::catalog::{Catalog, Column, ForeignKey, Table, TableKind};
use postgate::sql::builder::OrderByEntry;
use postgate::sql::{
    decode_cursor, encode_cursor, FilterCompiler, MutationBuilder, ParamList, SqlBuilder,
    OFFSET_CURSOR_SENTINEL,
};
use serde_json::json;

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
        ],
        primary_key: vec!["customer_id".to_string()],
        foreign_keys: vec![],
    };
    let order_items = Table {
        name: "order_items".to_string(),
        kind: TableKind::Base,
        columns: vec![
            pk("order_id", "integer"),
            pk("product_id", "integer"),
            column("quantity", "integer", true),
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
        vec![customer, order_items],
        vec![],
        vec![],
    )
}

#[test]
fn test_keyset_first_page_then_after() {
    let catalog = fixture_catalog();
    let table = catalog.table("customer").unwrap();
    let builder = SqlBuilder::new(&catalog, table);
    let order_by = vec![OrderByEntry {
        column: "customer_id".to_string(),
        descending: false,
    }];

    // First page: no cursor predicate, ascending scan, LIMIT bound.
    let first_page = builder
        .build_keyset_page(
            &["customer_id".to_string()],
            None,
            None,
            &order_by,
            None,
            false,
            5,
        )
        .unwrap();
    assert_eq!(
        first_page.sql,
        "SELECT to_jsonb(\"customer_id\") AS \"customer_id\" FROM \"public\".\"customer\" \
         ORDER BY \"customer_id\" ASC LIMIT $1"
    );

    // Following page resumes after the last row's cursor tuple.
    let cursor = encode_cursor(&[("customer_id".to_string(), json!(5))]);
    let tuple = decode_cursor(&cursor).unwrap();
    let next_page = builder
        .build_keyset_page(
            &["customer_id".to_string()],
            None,
            None,
            &order_by,
            Some(&tuple),
            false,
            5,
        )
        .unwrap();
    assert!(next_page.sql.contains("WHERE ((\"customer_id\" > $1))"));
    assert!(next_page.sql.ends_with("ORDER BY \"customer_id\" ASC LIMIT $2"));
}

#[test]
fn test_cursor_round_trip_matches_order_by_tuple() {
    let tuple = vec![
        ("name".to_string(), json!("Ada")),
        ("customer_id".to_string(), json!(42)),
    ];
    assert_eq!(decode_cursor(&encode_cursor(&tuple)).unwrap(), tuple);
    assert!(decode_cursor("@@not-a-cursor@@").is_err());
    assert!(decode_cursor(OFFSET_CURSOR_SENTINEL).is_err());
}

#[test]
fn test_where_and_or_scenario() {
    // customer(where: {active: {eq: true}},
    //          or: [{customer_id: {lt: 10}}, {customer_id: {gt: 600}}])
    let catalog = fixture_catalog();
    let table = catalog.table("customer").unwrap();
    let compiler = FilterCompiler::new(&catalog, table);
    let mut params = ParamList::new();
    let clause = compiler
        .compile(
            Some(&json!({"active": {"eq": true}})),
            Some(&json!([
                {"customer_id": {"lt": 10}},
                {"customer_id": {"gt": 600}}
            ])),
            &mut params,
        )
        .unwrap()
        .unwrap();
    assert_eq!(
        clause,
        "\"active\" = $1 AND ((\"customer_id\" < $2) OR (\"customer_id\" > $3))"
    );
    assert_eq!(params.len(), 3);
}

#[test]
fn test_no_user_text_reaches_sql() {
    // Hostile filter values travel as parameters, never as SQL text.
    let catalog = fixture_catalog();
    let table = catalog.table("customer").unwrap();
    let builder = SqlBuilder::new(&catalog, table);
    let query = builder
        .build_list(
            &["customer_id".to_string(), "name".to_string()],
            Some(&json!({"name": {"eq": "'; DROP TABLE customer; --"}})),
            None,
            &[],
            Some(10),
            None,
        )
        .unwrap();
    assert!(!query.sql.contains("DROP TABLE"));
    assert!(query.sql.contains("\"name\" = $1"));
    assert_eq!(query.binds.len(), 2);
}

#[test]
fn test_composite_key_update_scenario() {
    // updateOrder_items(input: {order_id: 1, product_id: 1, quantity: 10})
    let catalog = fixture_catalog();
    let table = catalog.table("order_items").unwrap();
    let builder = MutationBuilder::new(&catalog, table);

    let full = builder
        .build_update(
            json!({"order_id": 1, "product_id": 1, "quantity": 10})
                .as_object()
                .unwrap(),
        )
        .unwrap();
    assert!(full
        .sql
        .contains("WHERE \"order_id\" = $2 AND \"product_id\" = $3"));
    assert!(full.sql.contains("RETURNING"));

    // Omitting one PK part fails validation before SQL generation.
    let err = builder
        .build_update(json!({"order_id": 1, "quantity": 10}).as_object().unwrap())
        .unwrap_err();
    assert_eq!(err.code(), "ValidationError");
    assert!(err.to_string().contains("product_id"));
}

#[test]
fn test_delete_requires_full_key_and_returns_row() {
    let catalog = fixture_catalog();
    let table = catalog.table("order_items").unwrap();
    let builder = MutationBuilder::new(&catalog, table);

    let query = builder
        .build_delete(json!({"order_id": 2, "product_id": 3}).as_object().unwrap())
        .unwrap();
    assert!(query.sql.starts_with("DELETE FROM \"public\".\"order_items\""));
    assert!(query.sql.contains("RETURNING"));

    let err = builder
        .build_delete(json!({"order_id": 2}).as_object().unwrap())
        .unwrap_err();
    assert_eq!(err.code(), "ValidationError");
}

#[test]
fn test_projection_narrowing_keeps_pk_and_fk() {
    use postgate::graphql::selection::{RelationshipSelection, SelectionPlan};

    let catalog = fixture_catalog();
    let items = catalog.table("order_items").unwrap();
    let plan = SelectionPlan {
        columns: vec!["quantity".to_string()],
        relationships: vec![RelationshipSelection {
            field_name: "orders".to_string(),
            foreign_key: items.foreign_keys[0].clone(),
            referenced_table: "orders".to_string(),
            plan: SelectionPlan::default(),
        }],
    };
    // quantity plus both PK parts; order_id doubles as the FK column.
    assert_eq!(
        plan.projection(items, &[]),
        vec!["order_id", "product_id", "quantity"]
    );
}
