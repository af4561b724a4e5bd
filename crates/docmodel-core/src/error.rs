//! Error types for docmodel operations.

use std::fmt;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type for all docmodel operations.
#[derive(Debug)]
pub enum Error {
    /// Model registration / relation resolution errors.
    ///
    /// These are fatal at `connect` time; there is no partial registration.
    Registration(RegistrationError),
    /// An illegal primitive operation for the chain's current result shape.
    Transition(TransitionError),
    /// Relation invariant violations raised at assignment time.
    Relation(RelationError),
    /// Type coercion failures while assigning raw data to an instance.
    Coercion(CoercionError),
    /// An operation that requires a persisted instance was called on a
    /// new (id-less) instance.
    NotPersisted {
        /// Model name.
        model: String,
        /// The operation that was attempted (`populate`, `reload`, ...).
        operation: &'static str,
    },
    /// Errors surfaced by the underlying driver, unchanged.
    Driver(DriverError),
    /// A lifecycle hook aborted the operation.
    Hook(String),
    /// Serialization/deserialization errors.
    Serde(String),
    /// Custom error with message.
    Custom(String),
}

/// A registration-time configuration error.
#[derive(Debug)]
pub struct RegistrationError {
    /// The model being registered when the error was detected.
    pub model: String,
    pub kind: RegistrationErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationErrorKind {
    /// A relation names a target model that was never registered.
    MissingTargetModel,
    /// A synthesized relation key collides with an explicit schema property.
    KeyCollision,
    /// An index references a property the schema does not declare.
    UnknownIndexProperty,
    /// A nested or compound index is missing its explicit name.
    UnnamedIndex,
    /// The same model name was registered twice.
    DuplicateModel,
    /// The database was used before `connect` or after `disconnect`.
    NotConnected,
}

/// An illegal `(shape, verb)` transition, raised at chain construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    /// The chain's result shape before the offending verb.
    pub shape: &'static str,
    /// The verb that has no transition from that shape.
    pub verb: &'static str,
}

/// A relation invariant violation on a model instance.
#[derive(Debug)]
pub struct RelationError {
    pub model: String,
    pub property: String,
    pub message: String,
}

/// A schema type coercion failure.
#[derive(Debug)]
pub struct CoercionError {
    pub property: String,
    pub expected: &'static str,
    pub actual: String,
}

/// An error from the driver (DDL, query execution, feed).
#[derive(Debug)]
pub struct DriverError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a registration error.
    pub fn registration(
        model: impl Into<String>,
        kind: RegistrationErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Registration(RegistrationError {
            model: model.into(),
            kind,
            message: message.into(),
        })
    }

    /// Build a relation invariant error.
    pub fn relation(
        model: impl Into<String>,
        property: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Relation(RelationError {
            model: model.into(),
            property: property.into(),
            message: message.into(),
        })
    }

    /// Build a coercion error.
    pub fn coercion(property: impl Into<String>, expected: &'static str, actual: &impl fmt::Debug) -> Self {
        Self::Coercion(CoercionError {
            property: property.into(),
            expected,
            actual: format!("{actual:?}"),
        })
    }

    /// Build a driver error from a message.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver(DriverError {
            message: message.into(),
            source: None,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registration(e) => {
                write!(f, "registration error for '{}': {} ({:?})", e.model, e.message, e.kind)
            }
            Self::Transition(e) => {
                write!(f, "illegal query operation: no transition from '{}' via '{}'", e.shape, e.verb)
            }
            Self::Relation(e) => {
                write!(f, "relation error on {}.{}: {}", e.model, e.property, e.message)
            }
            Self::Coercion(e) => {
                write!(f, "cannot coerce property '{}': expected {}, got {}", e.property, e.expected, e.actual)
            }
            Self::NotPersisted { model, operation } => {
                write!(f, "cannot {operation} an unsaved {model} instance: it has no id yet")
            }
            Self::Driver(e) => write!(f, "driver error: {}", e.message),
            Self::Hook(msg) => write!(f, "hook aborted: {msg}"),
            Self::Serde(msg) => write!(f, "serialization error: {msg}"),
            Self::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Driver(e) => e
                .source
                .as_deref()
                .map(|s| s as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e.to_string())
    }
}
