//! # Error Types
//!
//! Domain-specific error types for quote-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  quote-core errors (this file)                                         │
//! │  ├── CoreError        - Document encoding / rule failures              │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  quote-store errors                                                    │
//! │  └── StoreError       - Backend, quota, serialization failures         │
//! │                                                                         │
//! │  quote-sync errors                                                     │
//! │  └── SyncError        - Network, config, bus failures                  │
//! │                                                                         │
//! │  None of these cross the public sync boundary: operations report       │
//! │  bool / Option / outcome enums and keep the message in metadata.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Document-level errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The document failed its own validation rules.
    #[error("Invalid {entity_type} document: {reason}")]
    InvalidDocument { entity_type: String, reason: String },

    /// The document could not be encoded or decoded as JSON.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidDocument {
            entity_type: "quotation".into(),
            reason: "currency is required".into(),
        };
        assert!(err.to_string().contains("quotation"));

        let err: CoreError = ValidationError::Required { field: "number".into() }.into();
        assert_eq!(err.to_string(), "Validation error: number is required");
    }
}
