use crate::error::AppError;

pub fn require_non_empty(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

/// Run ids end up in URL path segments and storage keys, so whitespace and
/// path separators are rejected.
pub fn require_valid_id(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty()
        || value.len() > 128
        || value.chars().any(|c| c.is_whitespace() || c == '/' || c == '?' || c == '#')
    {
        return Err(AppError::Validation(format!("{field} must be a valid ID")));
    }
    Ok(())
}

pub fn require_positive(field: &str, value: u64) -> Result<(), AppError> {
    if value == 0 {
        return Err(AppError::Validation(format!("{field} must be greater than zero")));
    }
    Ok(())
}
