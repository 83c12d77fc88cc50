use bytes::Bytes;

/// An upstream-bound HTTP request, already rewritten to the target
/// dialect: path, auth header, content-type, and body are all final.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn post(url: String, body: Bytes) -> Self {
        Self {
            method: "POST",
            url,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: String) -> Self {
        self.headers.push((name.to_string(), value));
        self
    }
}

/// A base URL ending in `#` carries the full versioned path already; a
/// base URL already ending in `/vN[...]` is left alone too. Every other
/// base URL gets `/v1` prepended before `suffix` is appended.
pub fn join_url(base_url: &str, suffix: &str) -> String {
    if let Some(stripped) = base_url.strip_suffix('#') {
        return stripped.to_string();
    }
    let trimmed = base_url.trim_end_matches('/');
    if ends_with_version_segment(trimmed) {
        return format!("{trimmed}{suffix}");
    }
    format!("{trimmed}/v1{suffix}")
}

fn ends_with_version_segment(url: &str) -> bool {
    let Some(last_segment) = url.rsplit('/').next() else {
        return false;
    };
    let mut chars = last_segment.chars();
    if chars.next() != Some('v') {
        return false;
    }
    let rest = chars.as_str();
    !rest.is_empty() && rest.chars().next().is_some_and(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_suffix_strips_and_skips_v1_prefix() {
        assert_eq!(join_url("https://api.example.com/custom#", "/v1/messages"), "https://api.example.com/custom");
    }

    #[test]
    fn version_suffix_is_left_alone() {
        assert_eq!(join_url("https://api.example.com/v1beta", "/models/gemini:generateContent"), "https://api.example.com/v1beta/models/gemini:generateContent");
    }

    #[test]
    fn plain_base_url_gets_v1_prepended() {
        assert_eq!(join_url("https://api.example.com", "/messages"), "https://api.example.com/v1/messages");
    }
}
