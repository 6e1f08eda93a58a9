//! Shared key/value store contract. The cluster coordinator, the
//! standalone naming registry and the reference config store all sit
//! on this surface; backends only need TTL'd strings, one NX
//! primitive and FIFO lists.

use std::time::Duration;

use async_trait::async_trait;

use micra_core::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, replacing any previous one. A `ttl` bounds the
    /// key's lifetime; `None` keeps it until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set only when the key does not exist. Returns whether the
    /// write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Renew a key's lifetime. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// List keys matching a pattern; `*` matches any run of
    /// characters.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Append to the list at `key`, creating it when absent. Returns
    /// the new list length.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64>;

    /// Pop up to `count` entries from the front of the list at `key`.
    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>>;
}

/// Compile a `*`-wildcard pattern into a regex.
pub(crate) fn pattern_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        if ch == '*' {
            expr.push_str(".*");
        } else {
            expr.push_str(&regex::escape(&ch.to_string()));
        }
    }
    expr.push('$');
    regex::Regex::new(&expr).map_err(|e| micra_core::MicraError::Store(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_pattern_matches() {
        let re = pattern_to_regex("{$group=cluster_info$}{$ns$}{$*$}").unwrap();
        assert!(re.is_match("{$group=cluster_info$}{$ns$}{$S01$}"));
        assert!(!re.is_match("{$group=cluster_master$}{$ns$}{$S01$}"));
    }

    #[test]
    fn pattern_escapes_regex_metachars() {
        let re = pattern_to_regex("a.b*c").unwrap();
        assert!(re.is_match("a.bXXc"));
        assert!(!re.is_match("aXbXXc"));
    }
}
