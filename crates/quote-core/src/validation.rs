//! # Validation Module
//!
//! Input validation rules applied before anything is written.
//!
//! ## Usage
//! ```rust
//! use quote_core::validation::{validate_entity_id, validate_namespace};
//!
//! assert!(validate_entity_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
//! assert!(validate_namespace("quote").is_ok());
//! assert!(validate_namespace("has space").is_err());
//! ```

use crate::error::ValidationError;
use crate::MAX_ENTITY_ID_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Identifiers
// =============================================================================

/// Validates an entity id.
///
/// ## Rules
/// - Must not be empty or whitespace
/// - At most [`MAX_ENTITY_ID_LEN`] characters
/// - No whitespace or control characters (ids are embedded in store keys
///   and URL paths)
pub fn validate_entity_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "id".to_string(),
        });
    }

    if id.len() > MAX_ENTITY_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "id".to_string(),
            max: MAX_ENTITY_ID_LEN,
        });
    }

    if id.chars().any(|c| c.is_whitespace() || c.is_control() || c == '/') {
        return Err(ValidationError::InvalidFormat {
            field: "id".to_string(),
            reason: "must not contain whitespace, control characters or '/'".to_string(),
        });
    }

    Ok(())
}

/// Validates a store namespace.
pub fn validate_namespace(namespace: &str) -> ValidationResult<()> {
    if namespace.is_empty() {
        return Err(ValidationError::Required {
            field: "namespace".to_string(),
        });
    }

    if !namespace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ValidationError::InvalidFormat {
            field: "namespace".to_string(),
            reason: "must contain only letters, numbers, '-', '_' and '.'".to_string(),
        });
    }

    Ok(())
}

/// Validates that a required text field is present.
pub fn validate_required(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Quotation Fields
// =============================================================================

/// Validates an ISO 4217 currency code (three uppercase letters).
pub fn validate_currency(code: &str) -> ValidationResult<()> {
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::InvalidFormat {
            field: "currency".to_string(),
            reason: "must be a three-letter ISO 4217 code".to_string(),
        });
    }
    Ok(())
}

/// Validates a line item quantity.
pub fn validate_quantity(quantity: i64) -> ValidationResult<()> {
    if quantity <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }
    Ok(())
}

/// Validates a unit price; zero is allowed for free items.
pub fn validate_price_cents(cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: "unitPriceCents".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }
    Ok(())
}

/// Validates a discount in basis points (0..=10000).
pub fn validate_discount_bps(bps: u32) -> ValidationResult<()> {
    if bps > 10_000 {
        return Err(ValidationError::OutOfRange {
            field: "discountBps".to_string(),
            min: 0,
            max: 10_000,
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_entity_id() {
        assert!(validate_entity_id("q-1").is_ok());
        assert!(validate_entity_id("").is_err());
        assert!(validate_entity_id("   ").is_err());
        assert!(validate_entity_id("has space").is_err());
        assert!(validate_entity_id("a/b").is_err());
        assert!(validate_entity_id(&"x".repeat(MAX_ENTITY_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_currency() {
        assert!(validate_currency("EUR").is_ok());
        assert!(validate_currency("eur").is_err());
        assert!(validate_currency("EURO").is_err());
    }

    #[test]
    fn test_validate_numbers() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(0).is_err());
        assert!(validate_price_cents(0).is_ok());
        assert!(validate_price_cents(-1).is_err());
        assert!(validate_discount_bps(10_000).is_ok());
        assert!(validate_discount_bps(10_001).is_err());
    }
}
