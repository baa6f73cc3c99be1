//! Exact-host indexes.
//!
//! Each rule class owns a `HostTable` keyed by lowercased host; every bucket
//! is a `PathIndex` ordered for longest-prefix lookup with rank tie-breaks.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use super::rule::UrlMapping;

/// Rules sharing one host key, kept sorted by from-path length (longest
/// first) and then by rank, so a linear scan returns the best match.
#[derive(Default)]
pub struct PathIndex {
    entries: Vec<Arc<UrlMapping>>,
}

fn sort_key(mapping: &UrlMapping) -> (Reverse<usize>, u32) {
    (Reverse(mapping.from_url.path().len()), mapping.rank)
}

impl PathIndex {
    pub fn insert(&mut self, mapping: Arc<UrlMapping>) {
        let key = sort_key(&mapping);
        let pos = self.entries.partition_point(|e| sort_key(e) <= key);
        self.entries.insert(pos, mapping);
    }

    /// Best rule for a request path: the longest from-path prefix wins, ties
    /// go to the lower rank. From-port 0 matches any request port. Rules
    /// flagged `unique` only match the empty path.
    pub fn search(&self, port: u16, path: &str) -> Option<Arc<UrlMapping>> {
        self.entries
            .iter()
            .find(|m| {
                let from = &m.from_url;
                if from.port() != 0 && from.port() != port {
                    return false;
                }
                if m.unique {
                    path.is_empty()
                } else {
                    path.as_bytes().starts_with(from.path().as_bytes())
                }
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Host hash index for one rule class. Keys are lowercased; the empty key
/// holds the synthetic backdoor and PAC rules and serves requests that carry
/// no host at all.
#[derive(Default)]
pub struct HostTable {
    buckets: HashMap<String, PathIndex>,
}

impl HostTable {
    /// `host_key` must already be lowercased by the compiler.
    pub fn insert(&mut self, host_key: &str, mapping: Arc<UrlMapping>) {
        self.buckets
            .entry(host_key.to_string())
            .or_default()
            .insert(mapping);
    }

    /// `host` must already be lowercased by the caller.
    pub fn lookup(&self, host: &str, port: u16, path: &str) -> Option<Arc<UrlMapping>> {
        self.buckets.get(host).and_then(|ix| ix.search(port, path))
    }

    pub fn rule_count(&self) -> usize {
        self.buckets.values().map(PathIndex::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::url::RewriteUrl;

    fn mapping(from: &str, to: &str, rank: u32) -> Arc<UrlMapping> {
        Arc::new(UrlMapping::new(
            RewriteUrl::parse_no_path_breakdown(from).unwrap(),
            RewriteUrl::parse(to).unwrap(),
            rank,
        ))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut ix = PathIndex::default();
        ix.insert(mapping("http://a.test/x", "http://b.test/", 1));
        ix.insert(mapping("http://a.test/x/y", "http://c.test/", 2));

        let hit = ix.search(80, "x/y/z").unwrap();
        assert_eq!("c.test", hit.to_url.host());

        let hit = ix.search(80, "x/q").unwrap();
        assert_eq!("b.test", hit.to_url.host());
    }

    #[test]
    fn test_rank_breaks_ties() {
        let mut ix = PathIndex::default();
        ix.insert(mapping("http://a.test/x", "http://late.test/", 9));
        ix.insert(mapping("http://a.test/x", "http://early.test/", 3));

        let hit = ix.search(80, "x").unwrap();
        assert_eq!("early.test", hit.to_url.host());
    }

    #[test]
    fn test_port_zero_matches_any() {
        let mut ix = PathIndex::default();
        ix.insert(mapping("http://a.test:8080/", "http://pinned.test/", 1));
        ix.insert(mapping("http://a.test/", "http://any.test/", 2));

        assert_eq!("pinned.test", ix.search(8080, "x").unwrap().to_url.host());
        assert_eq!("any.test", ix.search(80, "x").unwrap().to_url.host());
    }

    #[test]
    fn test_unique_rule_requires_empty_path() {
        let mut ix = PathIndex::default();
        let mut m = UrlMapping::new(
            RewriteUrl::parse_no_path_breakdown("http://a.test/").unwrap(),
            RewriteUrl::parse("http://b.test/").unwrap(),
            1,
        );
        m.unique = true;
        ix.insert(Arc::new(m));

        assert!(ix.search(80, "x").is_none());
        assert!(ix.search(80, "").is_some());
    }

    #[test]
    fn test_host_table_empty_key_bucket() {
        let mut table = HostTable::default();
        table.insert("", mapping("http:///ink/rh", "http://internal.test/", 1));

        assert!(table.lookup("", 80, "ink/rh").is_some());
        assert!(table.lookup("other.test", 80, "ink/rh").is_none());
    }
}
