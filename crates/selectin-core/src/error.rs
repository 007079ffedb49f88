//! Error types for selectin loading.

use std::fmt;

/// The primary error type for all loading operations.
#[derive(Debug)]
pub enum Error {
    /// Mapping or load-option misconfiguration, raised before any statement runs
    Config(ConfigError),
    /// Statement execution failed in the row source
    Query(QueryError),
    /// The row source lost or could not reach its backend
    Connection(ConnectionError),
    /// A row was missing a column or carried a value of the wrong shape
    Type(TypeError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    /// Entity the error was detected on, when known
    pub entity: Option<String>,
    /// Relationship the error was detected on, when known
    pub relationship: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Eager loading requested on an attribute that cannot hold loaded values
    NotPopulatable,
    /// Composite key IN on a dialect without row-value IN and fallback disabled
    TupleInUnsupported,
    /// Entity name not present in the mapping registry
    UnknownEntity,
    /// Relationship name not present on the entity
    UnknownRelationship,
    /// Load path does not describe a valid relationship chain
    InvalidPath,
    /// A loader or per-query option is out of range
    InvalidOption,
    /// Mapping metadata is inconsistent
    InvalidMapping,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Statement preview of the failing statement, if available
    pub statement: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Table or column not found
    NotFound,
    /// Statement shape not supported by the row source
    Unsupported,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection pool exhausted
    PoolExhausted,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl ConfigError {
    pub fn new(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: None,
            relationship: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn on_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    #[must_use]
    pub fn on_relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = Some(relationship.into());
        self
    }
}

impl Error {
    /// Shorthand for a configuration error of the given kind.
    pub fn config(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Error::Config(ConfigError::new(kind, message))
    }

    /// Shorthand for a missing or mistyped row column.
    pub fn missing_column(column: impl Into<String>) -> Self {
        Error::Type(TypeError {
            expected: "column present in row",
            actual: "missing".to_string(),
            column: Some(column.into()),
        })
    }

    /// Is this a retryable error (deadlock, serialization, pool exhausted, timeouts)?
    ///
    /// The loading engine never retries on its own; callers use this to decide.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            _ => false,
        }
    }

    /// Was this raised while validating mappings or load options?
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// The configuration error kind, if this is a configuration error.
    pub fn config_kind(&self) -> Option<ConfigErrorKind> {
        match self {
            Error::Config(c) => Some(c.kind),
            _ => None,
        }
    }

    /// Get the statement preview that caused this error, if available
    pub fn statement(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.statement.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.entity, &self.relationship) {
            (Some(entity), Some(rel)) => write!(f, "{}.{}: {}", entity, rel, self.message),
            (Some(entity), None) => write!(f, "{}: {}", entity, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

/// Result type alias for loading operations.
pub type Result<T> = std::result::Result<T, Error>;
