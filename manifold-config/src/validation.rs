//! Shared validation helpers for domain configurations

use crate::error::{ConfigError, ConfigResult};

/// Trait implemented by every domain configuration
pub trait Validatable {
    /// Validate this configuration
    fn validate(&self) -> ConfigResult<()>;
}

/// Validate that a string field is non-empty
pub fn validate_required_string(value: &str, field: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{} cannot be empty",
            field
        )));
    }
    Ok(())
}

/// Validate that a numeric field is positive
pub fn validate_positive(value: u64, field: &str) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{} must be greater than zero",
            field
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_string() {
        assert!(validate_required_string("ok", "field").is_ok());
        assert!(validate_required_string("  ", "field").is_err());
    }

    #[test]
    fn test_positive() {
        assert!(validate_positive(1, "field").is_ok());
        assert!(validate_positive(0, "field").is_err());
    }
}
