//! §4.G / §7 failure classification: given an upstream status and body,
//! decide whether the failover engine should retry the next key/URL/
//! channel, or surface the response to the client verbatim.

const QUOTA_KEYWORDS: &[&str] = &[
    "quota", "rate limit", "rate_limit", "insufficient_quota", "resource_exhausted", "too many requests",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Transport error, 401/403/429/5xx, dialect quota/auth keywords, or
    /// (under fuzzy mode) any non-2xx. Counted as failure; key cooled,
    /// URL demoted, next key/URL/channel tried.
    Retryable { quota_like: bool },
    /// Client-caused 4xx outside the retryable set: counted as failure
    /// but surfaced to the client verbatim.
    NonRetryable,
}

pub fn classify(status: u16, body: &[u8], fuzzy_mode: bool) -> Classification {
    if (200..300).contains(&status) {
        // Callers only classify non-2xx responses; treat as a no-op
        // "non-retryable" so a misuse doesn't accidentally trigger a
        // failover loop.
        return Classification::NonRetryable;
    }

    let quota_like = is_quota_like(body);
    let retryable_status = matches!(status, 401 | 403 | 429) || status >= 500;

    if retryable_status || quota_like || fuzzy_mode {
        Classification::Retryable { quota_like }
    } else {
        Classification::NonRetryable
    }
}

fn is_quota_like(body: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    let lower = text.to_lowercase();
    QUOTA_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_is_retryable() {
        assert_eq!(classify(500, b"", false), Classification::Retryable { quota_like: false });
    }

    #[test]
    fn rate_limited_is_retryable_and_quota_like() {
        assert_eq!(classify(429, b"rate limit exceeded", false), Classification::Retryable { quota_like: true });
    }

    #[test]
    fn plain_400_is_not_retryable_without_fuzzy_mode() {
        assert_eq!(classify(400, b"{\"error\":\"bad model\"}", false), Classification::NonRetryable);
    }

    #[test]
    fn fuzzy_mode_widens_any_non_2xx_to_retryable() {
        assert_eq!(classify(400, b"{\"error\":\"bad model\"}", true), Classification::Retryable { quota_like: false });
    }

    #[test]
    fn quota_keyword_makes_even_a_400_retryable() {
        assert_eq!(
            classify(400, b"{\"error\":\"insufficient_quota\"}", false),
            Classification::Retryable { quota_like: true }
        );
    }
}
