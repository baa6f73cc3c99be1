//! Regex host index.
//!
//! Each entry compiles the rule's from-host as a pattern and pre-scans the
//! to-host for substitution markers, so per-request work is one regex match
//! plus byte splicing.

use std::sync::Arc;

use regex::{Captures, Regex};

use super::rule::{MappingContainer, UrlMapping};
use super::url::RewriteUrl;
use crate::config_error;
use crate::core::RemapResult;

/// Capture limit per pattern, counting the implicit whole-match capture.
pub const MAX_REGEX_SUBS: usize = 10;

/// Bound on an expanded to-host; hitting it drops the rule from the lookup.
const MAX_SUBSTITUTION_LEN: usize = 1024;

/// Position of one `$N` (or `\N`) marker inside the to-host template.
struct Substitution {
    offset: usize,
    capture: usize,
}

pub struct RegexMapping {
    regex: Regex,
    mapping: Arc<UrlMapping>,
    to_host_template: String,
    subs: Vec<Substitution>,
}

impl RegexMapping {
    pub fn new(mapping: Arc<UrlMapping>) -> RemapResult<Self> {
        let pattern = mapping.from_url.host();
        let regex = Regex::new(pattern)
            .map_err(|e| config_error!("Invalid host regex {pattern}: {e}"))?;
        if regex.captures_len() > MAX_REGEX_SUBS {
            return Err(config_error!(
                "Host regex {pattern} has more than {MAX_REGEX_SUBS} captures"
            ));
        }

        let to_host_template = mapping.to_url.host().to_string();
        let mut subs = Vec::new();
        let bytes = to_host_template.as_bytes();
        let mut i = 0;
        while i + 1 < bytes.len() {
            if (bytes[i] == b'$' || bytes[i] == b'\\') && bytes[i + 1].is_ascii_digit() {
                let capture = (bytes[i + 1] - b'0') as usize;
                if capture >= regex.captures_len() {
                    return Err(config_error!(
                        "Substitution ${capture} in {to_host_template} exceeds the \
                         capture count of {pattern}"
                    ));
                }
                subs.push(Substitution { offset: i, capture });
                i += 2;
            } else {
                i += 1;
            }
        }

        Ok(Self {
            regex,
            mapping,
            to_host_template,
            subs,
        })
    }

    pub fn mapping(&self) -> &Arc<UrlMapping> {
        &self.mapping
    }

    /// Splice capture bytes into the template: literal ranges between markers
    /// are copied, each marker is replaced by its matched substring. Returns
    /// None when the result would exceed the substitution bound.
    fn expand_host(&self, caps: &Captures) -> Option<String> {
        let mut out = String::with_capacity(self.to_host_template.len());
        let mut last = 0;
        for sub in &self.subs {
            out.push_str(&self.to_host_template[last..sub.offset]);
            if let Some(m) = caps.get(sub.capture) {
                out.push_str(m.as_str());
            }
            last = sub.offset + 2;
        }
        out.push_str(&self.to_host_template[last..]);

        if out.len() > MAX_SUBSTITUTION_LEN {
            log::warn!(
                "Expanded host for regex rule at rank {} exceeds {} bytes, dropping the match",
                self.mapping.rank,
                MAX_SUBSTITUTION_LEN
            );
            return None;
        }
        Some(out)
    }
}

/// Ordered lookup over one class's regex entries. Only rules ranked strictly
/// below `rank_ceiling` are considered, so a hash match can never be shadowed
/// by a later regex rule. The first match wins; its expanded host lands in a
/// new to-URL on the returned container.
pub fn regex_mapping_lookup(
    entries: &[RegexMapping],
    request_url: &RewriteUrl,
    host_lower: &str,
    rank_ceiling: u32,
) -> Option<MappingContainer> {
    for entry in entries {
        let mapping = entry.mapping();
        if mapping.rank >= rank_ceiling {
            // Entries are in rank order; nothing past the ceiling can win.
            break;
        }
        if !mapping.wildcard_from_scheme && mapping.from_url.scheme() != request_url.scheme() {
            continue;
        }
        // Wildcard-scheme rules parse as http, so their default port carries
        // no information; an explicit from-port still pins the request.
        let port_matches = if mapping.wildcard_from_scheme {
            mapping.from_url.port() == 0
                || mapping.from_url.port() == request_url.port_or_default()
        } else {
            mapping.from_url.port_or_default() == request_url.port_or_default()
        };
        if !port_matches {
            continue;
        }
        if !request_url
            .path()
            .as_bytes()
            .starts_with(mapping.from_url.path().as_bytes())
        {
            continue;
        }
        if let Some(caps) = entry.regex.captures(host_lower) {
            if let Some(new_host) = entry.expand_host(&caps) {
                let mut to_url = mapping.to_url.clone();
                to_url.set_host(&new_host);
                return Some(MappingContainer::with_expanded(mapping.clone(), to_url));
            }
            // Overflow falls through to "no regex match" for this rule.
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regex_mapping(from: &str, to: &str, rank: u32) -> RemapResult<RegexMapping> {
        let mapping = Arc::new(UrlMapping::new(
            RewriteUrl::parse_no_path_breakdown(from).unwrap(),
            RewriteUrl::parse(to).unwrap(),
            rank,
        ));
        RegexMapping::new(mapping)
    }

    fn request(url: &str) -> RewriteUrl {
        RewriteUrl::parse(url).unwrap()
    }

    #[test]
    fn test_substitution_round_trip() {
        let rm = regex_mapping(r"http://^(.*)\.src$/", "http://$1.example.com/", 1).unwrap();
        let entries = vec![rm];

        let req = request("http://foo.bar.src/x");
        let hit = regex_mapping_lookup(&entries, &req, "foo.bar.src", u32::MAX).unwrap();
        assert_eq!("foo.bar.example.com", hit.to_url().host());
        assert!(hit.is_regex_expanded());
    }

    #[test]
    fn test_backslash_markers_accepted() {
        let rm = regex_mapping(r"http://(.*)\.test/", r"http://\1.proxy/", 2).unwrap();
        let entries = vec![rm];

        let req = request("http://c.test/x");
        let hit = regex_mapping_lookup(&entries, &req, "c.test", u32::MAX).unwrap();
        assert_eq!("c.proxy", hit.to_url().host());
    }

    #[test]
    fn test_rank_ceiling_excludes_later_rules() {
        let rm = regex_mapping(r"http://(.*)\.test/", "http://$1.proxy/", 2).unwrap();
        let entries = vec![rm];

        let req = request("http://a.test/x");
        assert!(regex_mapping_lookup(&entries, &req, "a.test", 2).is_none());
        assert!(regex_mapping_lookup(&entries, &req, "a.test", 3).is_some());
    }

    #[test]
    fn test_scheme_and_port_must_match() {
        let rm = regex_mapping(r"http://(.*)\.test/", "http://$1.proxy/", 1).unwrap();
        let entries = vec![rm];

        let req = request("https://a.test/x");
        assert!(regex_mapping_lookup(&entries, &req, "a.test", u32::MAX).is_none());

        let req = request("http://a.test:8080/x");
        assert!(regex_mapping_lookup(&entries, &req, "a.test", u32::MAX).is_none());
    }

    #[test]
    fn test_from_path_prefix_required() {
        let rm = regex_mapping(r"http://(.*)\.test/api", "http://$1.proxy/", 1).unwrap();
        let entries = vec![rm];

        let req = request("http://a.test/other");
        assert!(regex_mapping_lookup(&entries, &req, "a.test", u32::MAX).is_none());

        let req = request("http://a.test/api/v1");
        assert!(regex_mapping_lookup(&entries, &req, "a.test", u32::MAX).is_some());
    }

    #[test]
    fn test_substitution_id_out_of_range_rejected() {
        let err = regex_mapping(r"http://(.*)\.test/", "http://$2.proxy/", 1);
        assert!(err.is_err());
    }

    #[test]
    fn test_substitution_overflow_drops_match() {
        // Two markers double a ~600-byte capture past the bound; the rule
        // falls back to "no regex match" instead of producing the host.
        let rm = regex_mapping(r"http://(.*)\.test/", "http://$1$1/", 1).unwrap();
        let entries = vec![rm];

        let long_host = format!("{}.test", "a".repeat(600));
        let req = request(&format!("http://{long_host}/x"));
        assert!(regex_mapping_lookup(&entries, &req, &long_host, u32::MAX).is_none());
    }

    #[test]
    fn test_rule_to_url_untouched_by_expansion() {
        let rm = regex_mapping(r"http://(.*)\.test/", "http://$1.proxy/", 1).unwrap();
        let template_host = rm.mapping().to_url.host().to_string();
        let entries = vec![rm];

        let req = request("http://a.test/x");
        let _ = regex_mapping_lookup(&entries, &req, "a.test", u32::MAX).unwrap();
        assert_eq!(template_host, entries[0].mapping().to_url.host());
    }
}
