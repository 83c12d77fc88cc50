use http::HeaderMap;

use crate::error::ProxyError;

/// §6: inbound `x-api-key` or `Authorization: Bearer` must equal the
/// configured proxy access key. Upstream credentials supplied by the
/// client (if any leaked into these same headers) are never a bypass —
/// this check only ever compares against the operator-configured key.
pub fn authenticate(headers: &HeaderMap, proxy_key: &str) -> Result<(), ProxyError> {
    if proxy_key.is_empty() {
        return Err(ProxyError::Unauthorized);
    }
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if key == proxy_key {
            return Ok(());
        }
    }
    if let Some(auth) = headers.get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if token == proxy_key {
                return Ok(());
            }
        }
    }
    Err(ProxyError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x_api_key_header_authenticates() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret".parse().unwrap());
        assert!(authenticate(&headers, "secret").is_ok());
    }

    #[test]
    fn bearer_token_authenticates() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(authenticate(&headers, "secret").is_ok());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "wrong".parse().unwrap());
        assert!(authenticate(&headers, "secret").is_err());
    }

    #[test]
    fn missing_header_is_rejected() {
        assert!(authenticate(&HeaderMap::new(), "secret").is_err());
    }
}
