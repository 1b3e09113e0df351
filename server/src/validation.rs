use uuid::Uuid;

use crate::error::ApiError;

/// Maximum length of a credential scope label
const MAX_SCOPE_LENGTH: usize = 64;

/// Validate a session id taken from the URL path
pub fn validate_session_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::InvalidInput(format!("Invalid session id: {}", raw)))
}

/// Validate the optional `scope` query parameter of the token endpoint.
pub fn validate_token_scope(scope: Option<&str>) -> Result<&str, ApiError> {
    let scope = match scope {
        None => return Ok("speak"),
        Some(s) => s.trim(),
    };
    if scope.is_empty() || scope.len() > MAX_SCOPE_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Scope must be 1 to {} characters",
            MAX_SCOPE_LENGTH
        )));
    }
    if !scope.chars().all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '-' || c == '_') {
        return Err(ApiError::InvalidInput(format!("Invalid scope: {}", scope)));
    }
    Ok(scope)
}
