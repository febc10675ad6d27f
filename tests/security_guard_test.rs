// Security Guard Integration Tests
// Depth, complexity and request-size enforcement ahead of execution.

use postgate::catalog::{Catalog, Column, ForeignKey, Table, TableKind};
use postgate::config::SecurityConfig;
use postgate::security::SecurityGuard;

fn fixture_catalog() -> Catalog {
    let column = |name: &str, raw: &str| Column {
        name: name.to_string(),
        raw_type: raw.to_string(),
        is_nullable: true,
        is_primary_key: false,
        array_dimensions: 0,
        element_type: None,
        has_default: false,
        ordinal: 0,
    };
    let customer = Table {
        name: "customer".to_string(),
        kind: TableKind::Base,
        columns: vec![column("customer_id", "integer"), column("name", "text")],
        primary_key: vec!["customer_id".to_string()],
        foreign_keys: vec![],
    };
    let orders = Table {
        name: "orders".to_string(),
        kind: TableKind::Base,
        columns: vec![column("order_id", "integer"), column("customer_id", "integer")],
        primary_key: vec!["order_id".to_string()],
        foreign_keys: vec![ForeignKey {
            name: "orders_customer_id_fkey".to_string(),
            columns: vec!["customer_id".to_string()],
            referenced_table: "customer".to_string(),
            referenced_columns: vec!["customer_id".to_string()],
        }],
    };
    Catalog::new("public".to_string(), vec![customer, orders], vec![], vec![])
}

fn default_guard() -> SecurityGuard {
    SecurityGuard::new(SecurityConfig::default())
}

#[test]
fn test_depth_ten_rejected_at_default_limit() {
    let guard = default_guard();
    let query = "{ a { b { c { d { e { f { g { h { i { j } } } } } } } } } }";
    let err = guard.check_query(query, &fixture_catalog()).unwrap_err();
    assert_eq!(err.code(), "ExecutionAborted");
    assert!(err.to_string().contains("maximum query depth exceeded"));
}

#[test]
fn test_depth_eight_passes_at_default_limit() {
    let guard = default_guard();
    let query = "{ a { b { c { d { e { f { g { h } } } } } } } }";
    let metrics = guard.check_query(query, &fixture_catalog()).unwrap();
    assert_eq!(metrics.depth, 8);
}

#[test]
fn test_fragments_count_toward_depth() {
    let guard = SecurityGuard::new(SecurityConfig {
        max_depth: 2,
        ..SecurityConfig::default()
    });
    let query = r#"
        query { customer { ...Deep } }
        fragment Deep on Customer { name }
    "#;
    // The fragment's field sits at depth 2; one more level trips the limit.
    assert!(guard.check_query(query, &fixture_catalog()).is_ok());

    let nested = r#"
        query { orders { ...Rel } }
        fragment Rel on Orders { customer { name } }
    "#;
    let err = guard.check_query(nested, &fixture_catalog()).unwrap_err();
    assert!(err.to_string().contains("maximum query depth exceeded"));
}

#[test]
fn test_complexity_budget_counts_lists_and_relationships() {
    let guard = SecurityGuard::new(SecurityConfig {
        max_complexity: 10,
        ..SecurityConfig::default()
    });
    // customer(limit: 40) = 1 + ceil(40/10) = 5; two scalar fields = 2.
    assert!(guard
        .check_query(
            "{ customer(limit: 40) { customer_id name } }",
            &fixture_catalog()
        )
        .is_ok());
    // Raising the limit argument pushes the score over budget.
    let err = guard
        .check_query(
            "{ customer(limit: 80) { customer_id name } }",
            &fixture_catalog(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("maximum query complexity exceeded"));
}

#[test]
fn test_request_size_limit() {
    let guard = SecurityGuard::new(SecurityConfig {
        max_request_bytes: 100,
        ..SecurityConfig::default()
    });
    assert!(guard.check_request_size(100).is_ok());
    let err = guard.check_request_size(101).unwrap_err();
    assert_eq!(err.code(), "ExecutionAborted");
    assert!(err.to_string().contains("101"));
    assert!(err.to_string().contains("100"));
}

#[test]
fn test_role_identifier_validation() {
    let guard = default_guard();
    assert!(guard.validate_role("reporting_reader").is_ok());
    for hostile in ["role name", "role;drop", "role\"", "ro-le", ""] {
        let err = guard.validate_role(hostile).unwrap_err();
        assert_eq!(err.code(), "ValidationError");
    }
}
