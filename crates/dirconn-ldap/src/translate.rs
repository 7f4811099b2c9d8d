//! Translation of session failures into the domain taxonomy.

use crate::session::SessionError;
use dirconn_core::{Error, ErrorKind, NativeCategory, NativeFailure};

/// Native category of an LDAP result code (RFC 4511 section 4.1.9).
#[must_use]
pub const fn category_for_code(code: u32) -> NativeCategory {
    match code {
        3 => NativeCategory::TimeLimitExceeded,
        4 => NativeCategory::SizeLimitExceeded,
        10 => NativeCategory::Referral,
        17 => NativeCategory::InvalidAttributeIdentifier,
        19 | 21 => NativeCategory::InvalidAttributeValue,
        20 => NativeCategory::AttributeInUse,
        32 => NativeCategory::NameNotFound,
        34 | 64 => NativeCategory::InvalidName,
        48 | 49 => NativeCategory::Authentication,
        50 => NativeCategory::NoPermission,
        51..=53 => NativeCategory::ServiceUnavailable,
        65 | 67 | 69 => NativeCategory::SchemaViolation,
        66 => NativeCategory::ContextNotEmpty,
        68 => NativeCategory::NameAlreadyBound,
        81 | 91 => NativeCategory::Communication,
        _ => NativeCategory::Other,
    }
}

/// Native category of a session failure.
#[must_use]
pub const fn category_of(err: &SessionError) -> NativeCategory {
    match err {
        SessionError::Result { code, .. } => category_for_code(*code),
        SessionError::UnknownHost { .. } => NativeCategory::UnknownHost,
        SessionError::Transport { .. } => NativeCategory::Communication,
        SessionError::Timeout { .. } => NativeCategory::Timeout,
        SessionError::Protocol(_) => NativeCategory::Other,
    }
}

/// Translates a session failure, keeping it as the error's source.
#[must_use]
pub fn translate(err: SessionError) -> Error {
    let category = category_of(&err);
    let message = match &err {
        SessionError::Result { code, text, .. } if text.is_empty() => {
            format!("LDAP operation failed with result code {code}")
        }
        SessionError::Result { text, .. } => text.clone(),
        other => other.to_string(),
    };
    let mut native = NativeFailure::new(category, message);
    if let Some(code) = err.code() {
        native = native.with_code(code.to_string());
    }
    Error::translate(native.with_source(err))
}

/// Translates a bind failure. An unknown principal is reported as an authentication failure.
#[must_use]
pub fn translate_bind(err: SessionError) -> Error {
    let err = translate(err);
    if err.kind() == ErrorKind::NameNotFound {
        err.rekind(ErrorKind::AuthenticationFailed)
    } else {
        err
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        translate(err)
    }
}
