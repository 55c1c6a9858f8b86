use axum::http::HeaderMap;


/// Header carrying the caller's identity, set by the upstream auth gateway
pub const USER_ID_HEADER: &str = "x-user-id";

/// Longest user id accepted from the header
const MAX_USER_ID_LEN: usize = 128;

/// Extract the pre-validated user id from the request headers
///
/// Expected format: "X-User-Id: <id>"
/// The upstream gateway has already authenticated the caller; this only
/// checks that the header is present and well formed.
pub fn extract_user_id(headers: &HeaderMap) -> Result<String, IdentityError> {
    let value = headers
        .get(USER_ID_HEADER)
        .ok_or(IdentityError::Missing)?
        .to_str()
        .map_err(|_| IdentityError::InvalidFormat)?;

    parse_user_id(value)
}

/// Internal helper for extract_user_id
fn parse_user_id(value: &str) -> Result<String, IdentityError> {
    let user_id = value.trim();

    if user_id.is_empty() {
        return Err(IdentityError::Empty);
    }

    if user_id.len() > MAX_USER_ID_LEN
        || user_id.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(IdentityError::InvalidFormat);
    }

    Ok(user_id.to_string())
}

/// Identity extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum IdentityError {
    /// X-User-Id header not present
    Missing,
    /// Not valid UTF-8, too long, or contains whitespace
    InvalidFormat,
    /// Header present but empty
    Empty,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Missing => write!(f, "Caller identity not provided"),
            IdentityError::InvalidFormat => write!(f, "Invalid caller identity format"),
            IdentityError::Empty => write!(f, "Caller identity is empty"),
        }
    }
}

impl std::error::Error for IdentityError {}
