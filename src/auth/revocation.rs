//! Revoked token identifiers fed by discovery.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Set of revoked `jti` values with their expiry.
#[derive(Debug, Default)]
pub struct RevokedTokens {
    entries: ArcSwap<HashMap<String, i64>>,
}

impl RevokedTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `jti` is revoked. Entries past their expiry no longer count.
    pub fn is_revoked(&self, jti: &str, now: i64) -> bool {
        self.entries
            .load()
            .get(jti)
            .is_some_and(|expiry| *expiry <= 0 || *expiry > now)
    }

    /// Replace the set, dropping entries that expired before `now`.
    ///
    /// An expiry of zero or less never expires.
    pub fn replace(&self, entries: impl IntoIterator<Item = (String, i64)>, now: i64) {
        let map = entries
            .into_iter()
            .filter(|(_, expiry)| *expiry <= 0 || *expiry > now)
            .collect();
        self.entries.store(Arc::new(map));
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoked_until_expiry() {
        let revoked = RevokedTokens::new();
        revoked.replace(
            vec![("a".to_string(), 200), ("b".to_string(), 50), ("c".to_string(), 0)],
            100,
        );
        assert_eq!(revoked.len(), 2);
        assert!(revoked.is_revoked("a", 150));
        assert!(!revoked.is_revoked("a", 250));
        assert!(!revoked.is_revoked("b", 100));
        assert!(revoked.is_revoked("c", i64::MAX));
    }
}
