// # SQL Generation
//
// Builds the parameterized statements issued against the database. All
// identifiers are double-quoted with internal quotes escaped and every value
// travels as a bind parameter; user data is never interpolated into SQL
// text.

pub mod binding;
pub mod builder;
pub mod cursor;
pub mod filter;
pub mod mutation;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

pub use binding::{bind_cast, coerce_bind};
pub use builder::{OrderByEntry, SelectQuery, SqlBuilder};
pub use cursor::{decode_cursor, encode_cursor, OFFSET_CURSOR_SENTINEL};
pub use filter::FilterCompiler;
pub use mutation::MutationBuilder;

/// A typed value bound to a statement parameter. Options carry SQL NULL with
/// the right parameter type.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    Text(Option<String>),
    Uuid(Option<uuid::Uuid>),
    Date(Option<NaiveDate>),
    Timestamp(Option<NaiveDateTime>),
    TimestampTz(Option<DateTime<Utc>>),
    Json(Option<serde_json::Value>),
}

impl BindValue {
    pub fn is_null(&self) -> bool {
        match self {
            BindValue::Int(v) => v.is_none(),
            BindValue::Float(v) => v.is_none(),
            BindValue::Bool(v) => v.is_none(),
            BindValue::Text(v) => v.is_none(),
            BindValue::Uuid(v) => v.is_none(),
            BindValue::Date(v) => v.is_none(),
            BindValue::Timestamp(v) => v.is_none(),
            BindValue::TimestampTz(v) => v.is_none(),
            BindValue::Json(v) => v.is_none(),
        }
    }
}

/// Ordered parameter list backing one statement. Placeholders are handed out
/// as `$n` in push order.
#[derive(Debug, Default)]
pub struct ParamList {
    binds: Vec<BindValue>,
}

impl ParamList {
    pub fn new() -> Self {
        Self { binds: Vec::new() }
    }

    /// Register a value and get its placeholder.
    pub fn push(&mut self, value: BindValue) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }

    /// Register a value and get its placeholder with an optional cast
    /// (`$n::numeric`). Cast targets come from the catalog, never from user
    /// input.
    pub fn push_cast(&mut self, value: BindValue, cast: Option<&str>) -> String {
        let placeholder = self.push(value);
        match cast {
            Some(target) => format!("{}::{}", placeholder, target),
            None => placeholder,
        }
    }

    pub fn len(&self) -> usize {
        self.binds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.binds.is_empty()
    }

    pub fn into_binds(self) -> Vec<BindValue> {
        self.binds
    }

    pub fn binds(&self) -> &[BindValue] {
        &self.binds
    }
}

/// Double-quote an identifier, escaping embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `"schema"."table"` qualified relation name.
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}
