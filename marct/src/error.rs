//! Error types and result definitions for projection runs.
//!
//! [`MarctError`] carries a classification, a static description, optional dynamic detail, the
//! originating error and the callsite that raised it. Several failures can be aggregated into one
//! error, which is how a failed incremental run and a failed fallback rebuild are reported together.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Result type used by every fallible operation of the engine.
pub type MarctResult<T> = Result<T, MarctError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the engine.
#[derive(Debug, Clone)]
pub struct MarctError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Multiple aggregated errors, e.g. an incremental failure followed by a failed rebuild.
    Many {
        errors: Vec<MarctError>,
        location: &'static Location<'static>,
    },
}

/// Categories of failures that can occur during a projection run.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection Errors
    ConnectionFailed,
    AuthenticationError,

    // Query & Execution Errors
    QueryFailed,
    LockTimeout,
    OperationCanceled,
    DatabaseShutdown,
    DatabaseInRecovery,

    // Schema Errors
    SchemaError,
    PermissionDenied,

    // Data Errors
    ConversionError,
    ValidationError,

    // IO Errors
    IoError,
    StagingIoError,

    // Security Errors
    EncryptionError,

    // State & Workflow Errors
    InvalidState,
    IncrementalTimeout,

    // Unknown / Uncategorized
    Unknown,
}

impl MarctError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`] if
    /// the aggregate is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the detail of this error, or of the first aggregated error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error and returns the modified instance.
    ///
    /// Has no effect on aggregated errors, which forward their first error as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        MarctError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for MarctError {
    fn eq(&self, other: &MarctError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for MarctError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_indented("Detail", payload.detail.as_deref(), f)?;

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented("Backtrace", Some(&backtrace), f)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if errors.is_empty() {
                    write!(f, "\n  (no inner errors provided)")?;
                }

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for MarctError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Writes a labelled block with every line indented under the label.
fn write_indented(label: &str, block: Option<&str>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let Some(block) = block else {
        return Ok(());
    };

    if block.trim().is_empty() {
        return write!(f, "\n  {label}: <empty>");
    }

    write!(f, "\n  {label}:")?;
    for line in block.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl From<(ErrorKind, &'static str)> for MarctError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> MarctError {
        MarctError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for MarctError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> MarctError {
        MarctError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned unwrapped.
impl<E> From<Vec<E>> for MarctError
where
    E: Into<MarctError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> MarctError {
        let location = Location::caller();

        let mut errors: Vec<MarctError> = errors.into_iter().map(Into::into).collect();
        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        MarctError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for MarctError {
    #[track_caller]
    fn from(err: std::io::Error) -> MarctError {
        let detail = err.to_string();
        MarctError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<std::string::FromUtf8Error> for MarctError {
    #[track_caller]
    fn from(err: std::string::FromUtf8Error) -> MarctError {
        let detail = err.to_string();
        MarctError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("UTF-8 string conversion failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<rustls::Error> for MarctError {
    #[track_caller]
    fn from(err: rustls::Error) -> MarctError {
        let detail = err.to_string();
        MarctError::from_components(
            ErrorKind::EncryptionError,
            Cow::Borrowed("TLS configuration failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps Postgres SQLSTATE classes onto [`ErrorKind`]s.
impl From<tokio_postgres::Error> for MarctError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> MarctError {
        let (kind, description) = match err.code() {
            Some(sqlstate) => {
                use tokio_postgres::error::SqlState;

                match *sqlstate {
                    // Connection errors (08xxx)
                    SqlState::CONNECTION_EXCEPTION
                    | SqlState::CONNECTION_DOES_NOT_EXIST
                    | SqlState::CONNECTION_FAILURE
                    | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
                    | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION => (
                        ErrorKind::ConnectionFailed,
                        "PostgreSQL connection failed",
                    ),

                    // Authentication errors (28xxx)
                    SqlState::INVALID_AUTHORIZATION_SPECIFICATION | SqlState::INVALID_PASSWORD => (
                        ErrorKind::AuthenticationError,
                        "PostgreSQL authentication failed",
                    ),

                    // Data integrity violations (23xxx)
                    SqlState::INTEGRITY_CONSTRAINT_VIOLATION
                    | SqlState::NOT_NULL_VIOLATION
                    | SqlState::UNIQUE_VIOLATION
                    | SqlState::CHECK_VIOLATION => (
                        ErrorKind::ValidationError,
                        "PostgreSQL constraint violation",
                    ),

                    // Data conversion errors (22xxx)
                    SqlState::DATA_EXCEPTION
                    | SqlState::INVALID_TEXT_REPRESENTATION
                    | SqlState::STRING_DATA_RIGHT_TRUNCATION
                    | SqlState::CHARACTER_NOT_IN_REPERTOIRE
                    | SqlState::UNTRANSLATABLE_CHARACTER
                    | SqlState::INVALID_JSON_TEXT => (
                        ErrorKind::ConversionError,
                        "PostgreSQL data conversion failed",
                    ),

                    // Schema/object errors (42xxx)
                    SqlState::UNDEFINED_TABLE
                    | SqlState::UNDEFINED_COLUMN
                    | SqlState::UNDEFINED_FUNCTION
                    | SqlState::UNDEFINED_SCHEMA
                    | SqlState::UNDEFINED_OBJECT
                    | SqlState::DUPLICATE_TABLE
                    | SqlState::DUPLICATE_OBJECT => (
                        ErrorKind::SchemaError,
                        "PostgreSQL schema object error",
                    ),

                    SqlState::INSUFFICIENT_PRIVILEGE => (
                        ErrorKind::PermissionDenied,
                        "PostgreSQL permission denied",
                    ),

                    SqlState::SYNTAX_ERROR | SqlState::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION => {
                        (ErrorKind::QueryFailed, "PostgreSQL syntax error")
                    }

                    // Resource errors (53xxx)
                    SqlState::INSUFFICIENT_RESOURCES
                    | SqlState::OUT_OF_MEMORY
                    | SqlState::TOO_MANY_CONNECTIONS => (
                        ErrorKind::ConnectionFailed,
                        "PostgreSQL resource limitation",
                    ),
                    SqlState::DISK_FULL => (ErrorKind::IoError, "PostgreSQL disk full"),

                    // Transaction errors (40xxx, 25xxx)
                    SqlState::TRANSACTION_ROLLBACK
                    | SqlState::T_R_SERIALIZATION_FAILURE
                    | SqlState::T_R_DEADLOCK_DETECTED
                    | SqlState::INVALID_TRANSACTION_STATE
                    | SqlState::ACTIVE_SQL_TRANSACTION
                    | SqlState::NO_ACTIVE_SQL_TRANSACTION
                    | SqlState::IN_FAILED_SQL_TRANSACTION
                    | SqlState::READ_ONLY_SQL_TRANSACTION
                    | SqlState::IDLE_IN_TRANSACTION_SESSION_TIMEOUT => (
                        ErrorKind::InvalidState,
                        "PostgreSQL transaction state error",
                    ),

                    // Cursor errors (24xxx, 34xxx)
                    SqlState::INVALID_CURSOR_STATE | SqlState::INVALID_CURSOR_NAME => {
                        (ErrorKind::InvalidState, "PostgreSQL cursor error")
                    }

                    // Operator intervention errors (57xxx)
                    SqlState::QUERY_CANCELED | SqlState::OPERATOR_INTERVENTION => (
                        ErrorKind::OperationCanceled,
                        "PostgreSQL query canceled",
                    ),
                    SqlState::ADMIN_SHUTDOWN | SqlState::CRASH_SHUTDOWN => (
                        ErrorKind::DatabaseShutdown,
                        "PostgreSQL shutdown",
                    ),
                    SqlState::CANNOT_CONNECT_NOW => (
                        ErrorKind::DatabaseInRecovery,
                        "PostgreSQL database in recovery",
                    ),
                    SqlState::IDLE_SESSION_TIMEOUT => (
                        ErrorKind::ConnectionFailed,
                        "PostgreSQL idle session timeout",
                    ),

                    // Object state errors (55xxx)
                    SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE | SqlState::OBJECT_IN_USE => (
                        ErrorKind::InvalidState,
                        "PostgreSQL object not in prerequisite state",
                    ),
                    SqlState::LOCK_NOT_AVAILABLE => {
                        (ErrorKind::LockTimeout, "PostgreSQL lock not available")
                    }

                    // Program limit errors (54xxx)
                    SqlState::PROGRAM_LIMIT_EXCEEDED | SqlState::STATEMENT_TOO_COMPLEX => (
                        ErrorKind::QueryFailed,
                        "PostgreSQL program limit exceeded",
                    ),

                    SqlState::FEATURE_NOT_SUPPORTED => (
                        ErrorKind::SchemaError,
                        "PostgreSQL feature not supported",
                    ),

                    SqlState::DATA_CORRUPTED | SqlState::INDEX_CORRUPTED => {
                        (ErrorKind::IoError, "PostgreSQL data corruption")
                    }

                    _ => (ErrorKind::QueryFailed, "PostgreSQL error"),
                }
            }
            // No SQL state means the failure happened below the protocol level.
            None => (ErrorKind::ConnectionFailed, "PostgreSQL connection failed"),
        };

        let detail = err.to_string();
        MarctError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marct_error;
    use std::error::Error as _;

    #[test]
    fn single_error_exposes_kind_and_detail() {
        let err = marct_error!(ErrorKind::InvalidState, "Staging already finished", "store-1");

        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.detail(), Some("store-1"));
        assert!(err.to_string().contains("Staging already finished"));
    }

    #[test]
    fn aggregate_flattens_kinds() {
        let err = MarctError::from(vec![
            marct_error!(ErrorKind::IncrementalTimeout, "Incremental run timed out"),
            marct_error!(ErrorKind::QueryFailed, "Rebuild failed"),
        ]);

        assert_eq!(err.kind(), ErrorKind::IncrementalTimeout);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::IncrementalTimeout, ErrorKind::QueryFailed]
        );
        assert!(err.to_string().starts_with("[Many] 2 errors aggregated"));
        assert!(err.source().is_some());
    }

    #[test]
    fn aggregate_of_one_is_unwrapped() {
        let err = MarctError::from(vec![marct_error!(
            ErrorKind::StagingIoError,
            "Staged rows could not be decoded"
        )]);

        assert_eq!(err.kinds(), vec![ErrorKind::StagingIoError]);
        assert!(err.to_string().starts_with("[StagingIoError]"));
    }

    #[test]
    fn io_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = MarctError::from(io);

        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(err.detail(), Some("gone"));
        assert!(err.source().is_some());
    }
}
