use thiserror::Error;

/// Constraint families reported by the database, keyed off SQLSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    Check,
    NotNull,
}

impl ConstraintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintKind::Unique => "unique",
            ConstraintKind::ForeignKey => "foreign key",
            ConstraintKind::Check => "check",
            ConstraintKind::NotNull => "not null",
        }
    }
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Execution aborted: {0}")]
    ExecutionAborted(String),

    #[error("{kind} constraint violated: {message}")]
    ConstraintViolation {
        kind: ConstraintKind,
        constraint: Option<String>,
        message: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Classification tag surfaced to clients in GraphQL error extensions.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "ValidationError",
            GatewayError::ExecutionAborted(_) => "ExecutionAborted",
            GatewayError::ConstraintViolation { .. } => "ConstraintViolation",
            GatewayError::NotFound(_) => "NotFound",
            GatewayError::Database(_) => "DatabaseError",
            GatewayError::Subscription(_) => "SubscriptionError",
            GatewayError::Configuration(_) => "ConfigurationError",
            GatewayError::Replication(_) => "ReplicationError",
            GatewayError::Catalog(_) => "CatalogError",
            GatewayError::Io(_) => "DatabaseError",
        }
    }

    /// Message safe to return to clients. Internal database details are
    /// logged at the call site, never surfaced.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Database(_) => "internal database error".to_string(),
            other => other.to_string(),
        }
    }

    /// Classify a sqlx error by SQLSTATE. Constraint families map to
    /// `ConstraintViolation`; everything unrecognized becomes a generic
    /// database error whose detail stays server-side.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => {
                return GatewayError::NotFound("no row matched the given key".to_string());
            }
            sqlx::Error::Database(db) => {
                let constraint = db.constraint().map(|c| c.to_string());
                let message = match &constraint {
                    Some(name) => format!("{} ({})", db.message(), name),
                    None => db.message().to_string(),
                };
                let kind = match db.code().as_deref() {
                    Some("23505") => Some(ConstraintKind::Unique),
                    Some("23503") => Some(ConstraintKind::ForeignKey),
                    Some("23514") => Some(ConstraintKind::Check),
                    Some("23502") => Some(ConstraintKind::NotNull),
                    _ => None,
                };
                if let Some(kind) = kind {
                    return GatewayError::ConstraintViolation {
                        kind,
                        constraint,
                        message,
                    };
                }
            }
            _ => {}
        }
        GatewayError::Database(err.to_string())
    }

    /// Convert into a GraphQL error carrying the classification tag in
    /// extensions, with internal detail withheld for database errors.
    pub fn into_graphql(self) -> async_graphql::Error {
        use async_graphql::ErrorExtensions;

        let code = self.code();
        if let GatewayError::Database(detail) = &self {
            tracing::error!(code, %detail, "database error during GraphQL execution");
        }
        async_graphql::Error::new(self.client_message())
            .extend_with(|_, e| e.set("code", code))
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::from_sqlx(err)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Validation(format!("invalid JSON: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
