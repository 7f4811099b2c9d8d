//! Error taxonomy for directory operations.
//!
//! Every failure raised by a backend is translated into an [`Error`] carrying one of a closed set
//! of [`ErrorKind`]s. Backends describe what went wrong natively as a [`NativeFailure`] tagged
//! with a [`NativeCategory`]; [`Error::translate`] maps the category onto the taxonomy and keeps
//! the original message and cause attached.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Shared, cloneable error cause.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Machine-readable classification of a directory failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Credentials were rejected by the server.
    AuthenticationFailed,
    /// The target DN, or one of its ancestors, does not exist.
    NameNotFound,
    /// Transport or connectivity problem.
    CommunicationFailure,
    /// Operation denied by access control.
    NoPermission,
    /// Malformed, duplicate or unsupported attribute value.
    InvalidAttribute,
    /// Structural schema violation.
    InvalidEntry,
    /// DN collision on create or rename.
    NameAlreadyBound,
    /// Delete attempted on a non-leaf entry.
    ContextNotEmpty,
    /// Caller input rejected before reaching the server.
    InvalidInput,
    /// Missing, unsupported or unparsable connection configuration.
    Configuration,
    /// A result cursor was read past its last entry.
    EndOfResults,
    /// Unclassified failure. Always carries the original cause.
    Unknown,
}

impl ErrorKind {
    /// Returns the stable error code for this kind.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::NameNotFound => "NAME_NOT_FOUND",
            Self::CommunicationFailure => "COMMUNICATION_FAILURE",
            Self::NoPermission => "NO_PERMISSION",
            Self::InvalidAttribute => "INVALID_ATTRIBUTE",
            Self::InvalidEntry => "INVALID_ENTRY",
            Self::NameAlreadyBound => "NAME_ALREADY_BOUND",
            Self::ContextNotEmpty => "CONTEXT_NOT_EMPTY",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Configuration => "CONFIGURATION",
            Self::EndOfResults => "END_OF_RESULTS",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Maps a native failure category onto the taxonomy.
    ///
    /// Returns `None` for categories with no dedicated kind; callers degrade those to
    /// [`ErrorKind::Unknown`].
    #[must_use]
    pub const fn for_category(category: NativeCategory) -> Option<Self> {
        match category {
            NativeCategory::Authentication => Some(Self::AuthenticationFailed),
            NativeCategory::NameNotFound => Some(Self::NameNotFound),
            NativeCategory::Communication | NativeCategory::UnknownHost => {
                Some(Self::CommunicationFailure)
            }
            NativeCategory::NoPermission => Some(Self::NoPermission),
            NativeCategory::InvalidName
            | NativeCategory::InvalidAttributeValue
            | NativeCategory::InvalidAttributeIdentifier
            | NativeCategory::AttributeInUse => Some(Self::InvalidAttribute),
            NativeCategory::SchemaViolation | NativeCategory::InvalidAttributes => {
                Some(Self::InvalidEntry)
            }
            NativeCategory::NameAlreadyBound => Some(Self::NameAlreadyBound),
            NativeCategory::ContextNotEmpty => Some(Self::ContextNotEmpty),
            NativeCategory::SizeLimitExceeded
            | NativeCategory::TimeLimitExceeded
            | NativeCategory::Referral
            | NativeCategory::ServiceUnavailable
            | NativeCategory::Timeout
            | NativeCategory::Other => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::AuthenticationFailed => "authentication failed",
            Self::NameNotFound => "name not found",
            Self::CommunicationFailure => "communication failure",
            Self::NoPermission => "no permission",
            Self::InvalidAttribute => "invalid attribute",
            Self::InvalidEntry => "invalid entry",
            Self::NameAlreadyBound => "name already bound",
            Self::ContextNotEmpty => "context not empty",
            Self::InvalidInput => "invalid input",
            Self::Configuration => "configuration error",
            Self::EndOfResults => "end of results",
            Self::Unknown => "directory error",
        };
        f.write_str(text)
    }
}

/// Native failure classes reported by backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeCategory {
    /// Credentials rejected.
    Authentication,
    /// Object does not exist.
    NameNotFound,
    /// Connection could not be established or was lost.
    Communication,
    /// Host name could not be resolved.
    UnknownHost,
    /// Access control denied the request.
    NoPermission,
    /// Syntactically invalid name.
    InvalidName,
    /// Attribute value rejected.
    InvalidAttributeValue,
    /// Entry violates the schema.
    SchemaViolation,
    /// Attribute set is incomplete or inconsistent.
    InvalidAttributes,
    /// Entry already exists.
    NameAlreadyBound,
    /// Attribute type is unknown to the server.
    InvalidAttributeIdentifier,
    /// Attribute or value already present.
    AttributeInUse,
    /// Entry still has children.
    ContextNotEmpty,
    /// Server stopped returning entries because of a size limit.
    SizeLimitExceeded,
    /// Server stopped processing because of a time limit.
    TimeLimitExceeded,
    /// Server answered with a referral.
    Referral,
    /// Server busy or unwilling to perform.
    ServiceUnavailable,
    /// Client-side operation timeout.
    Timeout,
    /// Anything else.
    Other,
}

/// Description of a backend failure prior to translation.
#[derive(Debug, Clone)]
pub struct NativeFailure {
    category: NativeCategory,
    message: String,
    code: Option<String>,
    source: Option<Cause>,
}

impl NativeFailure {
    /// Creates a failure of the given category.
    #[must_use]
    pub fn new(category: NativeCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            code: None,
            source: None,
        }
    }

    /// Attaches the server diagnostic code or explanation.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attaches the underlying cause.
    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Native category of the failure.
    #[must_use]
    pub const fn category(&self) -> NativeCategory {
        self.category
    }
}

/// Outcome of a failed bind, as reported to connection management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindFailure {
    /// The server host name could not be resolved.
    UnknownHost,
    /// The server could not be reached.
    CannotReach,
    /// Unknown principal or wrong password.
    IncorrectCredentials,
    /// Anything else.
    Unknown,
}

/// Domain error returned by every directory operation.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    code: Option<String>,
    category: Option<NativeCategory>,
    #[source]
    source: Option<Cause>,
}

/// Specialized result type for directory operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            category: None,
            source: None,
        }
    }

    /// Creates an error of the given kind with a cause attached.
    #[must_use]
    pub fn with_cause<E>(kind: ErrorKind, message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            source: Some(Arc::new(cause)),
            ..Self::new(kind, message)
        }
    }

    /// Shorthand for [`ErrorKind::InvalidInput`].
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// Shorthand for [`ErrorKind::Configuration`].
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Translates a native failure into the domain taxonomy.
    ///
    /// Categories without a dedicated kind become [`ErrorKind::Unknown`]; the original message,
    /// diagnostic code and cause are preserved either way.
    #[must_use]
    pub fn translate(native: NativeFailure) -> Self {
        let kind = ErrorKind::for_category(native.category).unwrap_or(ErrorKind::Unknown);
        Self {
            kind,
            message: native.message,
            code: native.code,
            category: Some(native.category),
            source: native.source,
        }
    }

    /// Returns a copy of this error re-classified under `kind`, keeping message and cause.
    #[must_use]
    pub fn rekind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Classification of the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable message (without the kind prefix).
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Server diagnostic code or explanation, when one was reported.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Native category this error was translated from.
    #[must_use]
    pub const fn native_category(&self) -> Option<NativeCategory> {
        self.category
    }

    /// Returns the stable error code for the kind of this error.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        self.kind.code()
    }

    /// Returns true when the failure was caused by an unresolvable host name.
    #[must_use]
    pub fn is_unknown_host(&self) -> bool {
        self.category == Some(NativeCategory::UnknownHost)
    }

    /// Classifies this error as the outcome of a bind attempt.
    #[must_use]
    pub fn bind_failure(&self) -> BindFailure {
        match self.kind {
            ErrorKind::CommunicationFailure if self.is_unknown_host() => BindFailure::UnknownHost,
            ErrorKind::CommunicationFailure => BindFailure::CannotReach,
            ErrorKind::AuthenticationFailed | ErrorKind::NameNotFound => {
                BindFailure::IncorrectCredentials
            }
            _ => BindFailure::Unknown,
        }
    }

    /// Returns true if this error should be logged as a serious error.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::CommunicationFailure | ErrorKind::Unknown | ErrorKind::Configuration
        )
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::with_cause(ErrorKind::Configuration, err.to_string(), err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::with_cause(
            ErrorKind::Configuration,
            format!("invalid directory URL: {err}"),
            err,
        )
    }
}
