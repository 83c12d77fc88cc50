/// `metricsKey = h(BaseURL "|" APIKey)`, truncated. Two channels that
/// happen to share a `(base_url, key)` pair collapse onto the same
/// metrics entity, which is what lets `delete_by_metrics_keys` leave a
/// still-referenced pair untouched when only one owning channel is
/// removed.
pub fn metrics_key(base_url: &str, key: &str) -> String {
    let mut input = String::with_capacity(base_url.len() + 1 + key.len());
    input.push_str(base_url);
    input.push('|');
    input.push_str(key);
    let hash = blake3::hash(input.as_bytes());
    hash.to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_pair_hashes_identically() {
        assert_eq!(
            metrics_key("https://api.example.com", "k1"),
            metrics_key("https://api.example.com", "k1")
        );
    }

    #[test]
    fn different_pairs_hash_differently() {
        assert_ne!(
            metrics_key("https://api.example.com", "k1"),
            metrics_key("https://api.example.com", "k2")
        );
    }
}
