//! Error taxonomy for key derivation.
//!
//! Validation happens before any work is done, providers only fail on
//! resource exhaustion or backend faults, and [`KdfError`] is what callers of
//! the engine see. A wrong password is never an error here.

use std::fmt;

use thiserror::Error;

/// A named KDF parameter, displayed with its header wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Algorithm,
    Salt,
    Parallelism,
    MemoryCost,
    Iterations,
    SecretKey,
    AssociatedData,
    Version,
    Variant,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Algorithm => "algorithm",
            Field::Salt => "salt",
            Field::Parallelism => "parallelism",
            Field::MemoryCost => "memoryCost",
            Field::Iterations => "iterations",
            Field::SecretKey => "secretKey",
            Field::AssociatedData => "associatedData",
            Field::Version => "version",
            Field::Variant => "variant",
        };
        f.write_str(name)
    }
}

/// Parameter set rejected before derivation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(Field),

    #[error("`{field}` out of range: {reason}")]
    OutOfRange { field: Field, reason: String },

    #[error("unsupported {field} {value}")]
    UnsupportedVersion { field: Field, value: String },
}

impl ValidationError {
    pub(crate) fn out_of_range(field: Field, reason: impl Into<String>) -> Self {
        ValidationError::OutOfRange {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(field: Field, value: impl fmt::Display) -> Self {
        ValidationError::UnsupportedVersion {
            field,
            value: value.to_string(),
        }
    }

    /// The parameter this error is about.
    pub fn field(&self) -> Field {
        match self {
            ValidationError::MissingField(field)
            | ValidationError::OutOfRange { field, .. }
            | ValidationError::UnsupportedVersion { field, .. } => *field,
        }
    }
}

/// Failure inside an algorithm provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DerivationError {
    /// Working memory could not be reserved.
    #[error("cannot reserve {requested_kib} KiB of working memory")]
    AllocationFailure { requested_kib: u64 },

    /// The backend reported something validation should have ruled out.
    #[error("{0}")]
    InternalError(String),
}

/// Flat classification of [`KdfError`] for mapping to user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    UnsupportedVersion,
    Allocation,
    Internal,
    NotInitialized,
}

/// Unified error returned by the derivation engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KdfError {
    #[error("invalid KDF parameters: {0}")]
    Validation(ValidationError),

    #[error("unsupported KDF revision ({field} = {value}); update required")]
    UnsupportedVersion { field: Field, value: String },

    #[error("insufficient memory: cannot reserve {requested_kib} KiB for key derivation")]
    Allocation { requested_kib: u64 },

    #[error("key derivation failed: {0}")]
    Internal(String),

    #[error("derivation engine used before init()")]
    NotInitialized,
}

impl KdfError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KdfError::Validation(_) => ErrorKind::Validation,
            KdfError::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            KdfError::Allocation { .. } => ErrorKind::Allocation,
            KdfError::Internal(_) => ErrorKind::Internal,
            KdfError::NotInitialized => ErrorKind::NotInitialized,
        }
    }
}

impl From<ValidationError> for KdfError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::UnsupportedVersion { field, value } => {
                KdfError::UnsupportedVersion { field, value }
            }
            other => KdfError::Validation(other),
        }
    }
}

impl From<DerivationError> for KdfError {
    fn from(err: DerivationError) -> Self {
        match err {
            DerivationError::AllocationFailure { requested_kib } => {
                KdfError::Allocation { requested_kib }
            }
            DerivationError::InternalError(msg) => KdfError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_uses_wire_names() {
        assert_eq!(Field::MemoryCost.to_string(), "memoryCost");
        assert_eq!(Field::AssociatedData.to_string(), "associatedData");
    }

    #[test]
    fn unsupported_version_keeps_its_kind() {
        let err: KdfError = ValidationError::unsupported(Field::Version, "0x14").into();
        assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
        assert!(err.to_string().contains("update required"));
    }

    #[test]
    fn allocation_failure_is_not_internal() {
        let err: KdfError = DerivationError::AllocationFailure { requested_kib: 65536 }.into();
        assert_eq!(err.kind(), ErrorKind::Allocation);
        assert!(err.to_string().contains("65536 KiB"));
    }

    #[test]
    fn out_of_range_names_field() {
        let err = ValidationError::out_of_range(Field::MemoryCost, "too small");
        assert_eq!(err.field(), Field::MemoryCost);
        assert!(err.to_string().contains("memoryCost"));
    }
}
