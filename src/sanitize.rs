use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use lru_slab::LruSlab;

/// Identifier rewrite policy, applied to metric names and tag keys so they
/// satisfy a backend's allowed character set. Tag values are never sanitized.
///
/// Every policy is a pure function of its input and is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Prometheus-style rules: a leading ASCII digit is prefixed with `_`,
    /// every character outside `[A-Za-z0-9_]` becomes `_`, and runs of `_`
    /// collapse to a single `_`.
    Prometheus,

    /// The TSDB's native rules: Unicode letters, digits, `-`, `.`, `/`, and
    /// `_` pass through, everything else becomes `_`, and runs of `_`
    /// collapse to a single `_`.
    Tsdb,

    /// Identity, for backends without character restrictions.
    Noop,
}

impl Policy {
    /// Applies this policy to `raw`, returning the rewritten identifier.
    #[must_use]
    pub fn apply(self, raw: &str) -> String {
        match self {
            Policy::Prometheus => rewrite(raw, true, valid_prometheus_char),
            Policy::Tsdb => rewrite(raw, false, valid_tsdb_char),
            Policy::Noop => raw.to_owned(),
        }
    }
}

/// Maps disallowed characters to `_` in one pass, collapsing underscore runs
/// as it goes. `prefix_digits` additionally guards against a leading digit.
fn rewrite(raw: &str, prefix_digits: bool, valid: fn(char) -> bool) -> String {
    let mut out = String::with_capacity(raw.len() + 1);
    let mut last_underscore = false;

    if prefix_digits && raw.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.push('_');
        last_underscore = true;
    }

    for c in raw.chars() {
        let mapped = if valid(c) { c } else { '_' };
        if mapped == '_' {
            if !last_underscore {
                out.push('_');
            }
            last_underscore = true;
        } else {
            out.push(mapped);
            last_underscore = false;
        }
    }

    out
}

#[inline]
fn valid_prometheus_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[inline]
fn valid_tsdb_char(c: char) -> bool {
    c.is_alphabetic() || c.is_ascii_digit() || matches!(c, '-' | '.' | '/' | '_')
}

/// A sanitization [`Policy`], optionally memoized.
///
/// The same metric and tag names come back every reporting cycle, so a
/// bounded cache of raw-to-sanitized strings amortizes the rewrite cost:
/// capacity `N`, least-recently-used entry evicted on overflow. The cache is
/// guarded by a lock and safe to share across threads.
///
/// The default sanitizer is the uncached [`Policy::Prometheus`].
pub struct Sanitizer {
    policy: Policy,
    cache: Option<Mutex<MemoCache>>,
}

impl Sanitizer {
    /// Creates an uncached sanitizer for `policy`.
    pub const fn new(policy: Policy) -> Self {
        Sanitizer { policy, cache: None }
    }

    /// Creates a sanitizer that memoizes up to `capacity` rewrites of
    /// `policy`, evicting the least-recently-used entry beyond that.
    pub fn cached(policy: Policy, capacity: usize) -> Self {
        Sanitizer { policy, cache: Some(Mutex::new(MemoCache::with_capacity(capacity))) }
    }

    /// Returns the configured policy.
    pub const fn policy(&self) -> Policy {
        self.policy
    }

    /// Rewrites `raw` under the configured policy, consulting the cache when
    /// one is present.
    pub fn sanitize(&self, raw: &str) -> String {
        match &self.cache {
            None => self.policy.apply(raw),
            Some(cache) => cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert(raw, self.policy),
        }
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Sanitizer::new(Policy::Prometheus)
    }
}

impl fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sanitizer")
            .field("policy", &self.policy)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

/// Slots preallocated in the recency list before it has to grow.
const INITIAL_SLOTS: usize = 256;

struct MemoEntry {
    raw: String,
    sanitized: String,
}

/// Bounded raw-to-sanitized memo: a map from raw string to slot token plus an
/// LRU slab ordering the slots by recency.
struct MemoCache {
    index: HashMap<String, u32>,
    entries: LruSlab<MemoEntry>,
    capacity: usize,
}

impl MemoCache {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let prealloc = capacity.min(INITIAL_SLOTS) as u32;
        MemoCache { index: HashMap::new(), entries: LruSlab::with_capacity(prealloc), capacity }
    }

    fn get_or_insert(&mut self, raw: &str, policy: Policy) -> String {
        if let Some(&slot) = self.index.get(raw) {
            // Marks the slot as most recently used.
            return self.entries.get_mut(slot).sanitized.clone();
        }

        let sanitized = policy.apply(raw);
        let slot =
            self.entries.insert(MemoEntry { raw: raw.to_owned(), sanitized: sanitized.clone() });
        self.index.insert(raw.to_owned(), slot);

        if self.entries.len() as usize > self.capacity {
            if let Some(lru) = self.entries.lru() {
                let evicted = self.entries.remove(lru);
                self.index.remove(&evicted.raw);
            }
        }

        sanitized
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.index.len()
    }

    #[cfg(test)]
    fn contains(&self, raw: &str) -> bool {
        self.index.contains_key(raw)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{valid_prometheus_char, valid_tsdb_char, MemoCache, Policy, Sanitizer};

    #[test]
    fn prometheus_known_cases() {
        let cases = [
            ("proc.stat.cpu", "proc_stat_cpu"),
            ("1proc.stat$cpu", "_1proc_stat_cpu"),
            ("foo_bar", "foo_bar"),
            ("foo__bar", "foo_bar"),
            ("node.cpu{0}", "node_cpu_0_"),
            ("*", "_"),
            ("métric", "m_tric"),
            ("", ""),
        ];

        for (input, expected) in cases {
            assert_eq!(Policy::Prometheus.apply(input), expected, "failed for {input:?}");
        }
    }

    #[test]
    fn tsdb_known_cases() {
        let cases = [
            ("host/web-1.example_com", "host/web-1.example_com"),
            ("a$%b", "a_b"),
            ("λ.count", "λ.count"),
            ("1proc.stat$cpu", "1proc.stat_cpu"),
            ("a b\tc", "a_b_c"),
        ];

        for (input, expected) in cases {
            assert_eq!(Policy::Tsdb.apply(input), expected, "failed for {input:?}");
        }
    }

    #[test]
    fn noop_is_identity() {
        assert_eq!(Policy::Noop.apply("anything goes: évén, this"), "anything goes: évén, this");
    }

    #[test]
    fn cached_matches_uncached() {
        let cached = Sanitizer::cached(Policy::Prometheus, 16);
        let uncached = Sanitizer::new(Policy::Prometheus);

        for input in ["a.b.c", "1xy$z", "a.b.c", "a.b.c"] {
            assert_eq!(cached.sanitize(input), uncached.sanitize(input));
        }
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = MemoCache::with_capacity(2);

        cache.get_or_insert("a", Policy::Prometheus);
        cache.get_or_insert("b", Policy::Prometheus);
        assert_eq!(cache.len(), 2);

        // Refresh "a" so "b" becomes the eviction candidate.
        cache.get_or_insert("a", Policy::Prometheus);
        cache.get_or_insert("c", Policy::Prometheus);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(cache.contains("c"));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn cache_hit_does_not_grow() {
        let mut cache = MemoCache::with_capacity(4);
        for _ in 0..10 {
            cache.get_or_insert("same", Policy::Tsdb);
        }
        assert_eq!(cache.len(), 1);
    }

    proptest! {
        #[test]
        fn prometheus_is_idempotent(input in ".*") {
            let once = Policy::Prometheus.apply(&input);
            prop_assert_eq!(Policy::Prometheus.apply(&once), once.clone());
        }

        #[test]
        fn tsdb_is_idempotent(input in ".*") {
            let once = Policy::Tsdb.apply(&input);
            prop_assert_eq!(Policy::Tsdb.apply(&once), once.clone());
        }

        #[test]
        fn prometheus_output_charset(input in ".*") {
            let result = Policy::Prometheus.apply(&input);
            prop_assert!(result.chars().all(valid_prometheus_char));
            prop_assert!(!result.contains("__"));
            prop_assert!(!result.starts_with(|c: char| c.is_ascii_digit()));
        }

        #[test]
        fn tsdb_output_charset(input in ".*") {
            let result = Policy::Tsdb.apply(&input);
            prop_assert!(result.chars().all(valid_tsdb_char));
            prop_assert!(!result.contains("__"));
        }
    }
}
