use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderName};

const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");

/// Model-provider credential the caller forwards with a request, taken from
/// `x-api-key` or a bearer `Authorization` header.
pub fn extract_provider_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get(&API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Some(key.to_string());
    }

    extract_bearer_token(headers)
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}
