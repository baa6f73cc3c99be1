//! ACL filter library and evaluator.
//!
//! Filters restrict matched rules by request method and client source IP.
//! `.definefilter` stores its arguments verbatim; they are parsed into
//! concrete method bits and address ranges by `validate_filter_args`, which
//! also runs for the rule-local `@method/@src_ip/@action` options.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnetwork::Ipv4Network;

use super::rule::UrlMapping;
use crate::config_error;
use crate::core::{RemapResult, Transaction};

/// Method index table. Filters keep one allow bit per entry; requests with a
/// method outside this table never match a method-restricted filter.
pub const KNOWN_METHODS: [&str; 10] = [
    "CONNECT", "DELETE", "GET", "HEAD", "OPTIONS", "POST", "PURGE", "PUSH", "PUT", "TRACE",
];

/// Cap on filters attached to a single rule.
pub const MAX_RULE_FILTERS: usize = 8;

pub fn method_index(name: &str) -> Option<usize> {
    KNOWN_METHODS.iter().position(|m| m.eq_ignore_ascii_case(name))
}

/// One source-IPv4 range in host byte order. An inverted range matches
/// exactly the addresses outside it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SrcIpRange {
    start: u32,
    end: u32,
    invert: bool,
}

impl SrcIpRange {
    /// Accepts `a.b.c.d`, `a.b.c.d-e.f.g.h` and CIDR, each with an optional
    /// leading `~` to invert.
    pub fn parse(spec: &str) -> RemapResult<Self> {
        let (invert, body) = match spec.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };

        let (start, end) = if let Some((lo, hi)) = body.split_once('-') {
            let lo: Ipv4Addr = lo
                .trim()
                .parse()
                .map_err(|_| config_error!("Invalid IP range {spec}"))?;
            let hi: Ipv4Addr = hi
                .trim()
                .parse()
                .map_err(|_| config_error!("Invalid IP range {spec}"))?;
            (u32::from(lo), u32::from(hi))
        } else if body.contains('/') {
            let net: Ipv4Network = body
                .parse()
                .map_err(|_| config_error!("Invalid IP network {spec}"))?;
            (u32::from(net.network()), u32::from(net.broadcast()))
        } else {
            let addr: Ipv4Addr = body
                .parse()
                .map_err(|_| config_error!("Invalid IP address {spec}"))?;
            (u32::from(addr), u32::from(addr))
        };

        if start > end {
            return Err(config_error!("Inverted bounds in IP range {spec}"));
        }
        Ok(Self { start, end, invert })
    }

    pub fn matches(&self, addr: u32) -> bool {
        let hit = self.start <= addr && addr <= self.end;
        hit != self.invert
    }
}

/// A named (or rule-local anonymous) ACL filter.
#[derive(Clone, Debug)]
pub struct RemapFilter {
    pub name: String,
    /// Decision applied when the filter matches.
    pub allow: bool,
    pub method_restricted: bool,
    pub method_bits: [bool; KNOWN_METHODS.len()],
    pub src_ip: Vec<SrcIpRange>,
    /// Raw arguments as written in the rule file; parsed lazily.
    pub argv: Vec<String>,
}

impl RemapFilter {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            allow: true,
            method_restricted: false,
            method_bits: [false; KNOWN_METHODS.len()],
            src_ip: Vec::new(),
            argv: Vec::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::named("")
    }

    /// Re-derives the concrete filter state from the stored argv. Called
    /// after every `.definefilter` extension and for rule-local options.
    pub fn validate_filter_args(&mut self) -> RemapResult<()> {
        let mut allow = true;
        let mut method_restricted = false;
        let mut method_bits = [false; KNOWN_METHODS.len()];
        let mut src_ip = Vec::new();

        for arg in &self.argv {
            let (key, value) = match arg.split_once('=') {
                Some((k, v)) => (k, v),
                None => (arg.as_str(), ""),
            };
            if key.eq_ignore_ascii_case("method") {
                let idx = method_index(value)
                    .ok_or_else(|| config_error!("Unknown method {value} in filter args"))?;
                method_bits[idx] = true;
                method_restricted = true;
            } else if key.eq_ignore_ascii_case("src_ip") {
                src_ip.push(SrcIpRange::parse(value)?);
            } else if key.eq_ignore_ascii_case("action") {
                allow = parse_action(value)?;
            } else {
                return Err(config_error!("Unknown filter argument @{arg}"));
            }
        }

        self.allow = allow;
        self.method_restricted = method_restricted;
        self.method_bits = method_bits;
        self.src_ip = src_ip;
        Ok(())
    }
}

fn parse_action(value: &str) -> RemapResult<bool> {
    let v = value.to_ascii_lowercase();
    match v.as_str() {
        "allow" | "on" | "enable" | "1" => Ok(true),
        "deny" | "off" | "disable" | "0" => Ok(false),
        _ => Err(config_error!("Unknown filter action {value}")),
    }
}

/// Named-filter library with an activation queue. `.usefilter` moves a
/// filter into the active queue; every remap line compiled afterwards
/// inherits the queue in activation order.
#[derive(Default)]
pub struct FilterLibrary {
    filters: Vec<Arc<RemapFilter>>,
    active: Vec<String>,
}

impl FilterLibrary {
    fn position(&self, name: &str) -> Option<usize> {
        self.filters.iter().position(|f| f.name == name)
    }

    /// Create a filter, or extend an existing one with more arguments.
    /// Rules compiled before an extension keep the earlier definition.
    pub fn define(&mut self, name: &str, args: &[String]) -> RemapResult<()> {
        let mut filter = match self.position(name) {
            Some(i) => (*self.filters[i]).clone(),
            None => RemapFilter::named(name),
        };
        filter.argv.extend(args.iter().cloned());
        filter.validate_filter_args()?;

        match self.position(name) {
            Some(i) => self.filters[i] = Arc::new(filter),
            None => self.filters.push(Arc::new(filter)),
        }
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> RemapResult<()> {
        let pos = self
            .position(name)
            .ok_or_else(|| config_error!("Cannot delete undefined filter {name}"))?;
        self.filters.remove(pos);
        self.active.retain(|n| n != name);
        Ok(())
    }

    pub fn use_filter(&mut self, name: &str) -> RemapResult<()> {
        if self.position(name).is_none() {
            return Err(config_error!("Cannot use undefined filter {name}"));
        }
        if !self.active.iter().any(|n| n == name) {
            self.active.push(name.to_string());
        }
        Ok(())
    }

    pub fn unuse_filter(&mut self, name: &str) -> RemapResult<()> {
        if self.position(name).is_none() {
            return Err(config_error!("Cannot unuse undefined filter {name}"));
        }
        self.active.retain(|n| n != name);
        Ok(())
    }

    /// Snapshot of the active queue in activation order.
    pub fn active_filters(&self) -> Vec<Arc<RemapFilter>> {
        self.active
            .iter()
            .filter_map(|name| self.position(name).map(|i| self.filters[i].clone()))
            .collect()
    }
}

/// Walk the matched rule's filter chain and toggle the transaction's
/// client-enabled flag. Runs once per transaction; matching decides, order
/// wins: only a filter that matches can change the flag, so a deny is never
/// lifted by a later allow that failed to match. Rewriting is not
/// short-circuited here.
pub fn perform_acl_filtering(txn: &mut Transaction, mapping: &UrlMapping) {
    if txn.acl_checked {
        return;
    }
    txn.acl_checked = true;

    if mapping.filters.is_empty() {
        return;
    }

    let method_idx = method_index(txn.request.method.as_str());
    let client: Option<u32> = match txn.client_addr {
        IpAddr::V4(v4) => Some(u32::from(v4)),
        IpAddr::V6(_) => None,
    };

    for filter in &mapping.filters {
        let mut matched = true;
        if filter.method_restricted {
            matched = method_idx.map_or(false, |i| filter.method_bits[i]);
        }
        if matched && !filter.src_ip.is_empty() {
            matched = client.map_or(false, |addr| filter.src_ip.iter().any(|r| r.matches(addr)));
        }
        if matched {
            log::debug!(
                "ACL filter {} matched, client_connection_enabled={}",
                if filter.name.is_empty() { "<rule-local>" } else { filter.name.as_str() },
                filter.allow
            );
            txn.client_connection_enabled = filter.allow;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::url::RewriteUrl;
    use pingora_http::RequestHeader;

    fn txn(method: &str, addr: [u8; 4]) -> Transaction {
        let request = RequestHeader::build(method, b"/x", None).unwrap();
        Transaction::new(request, IpAddr::V4(Ipv4Addr::from(addr)))
    }

    fn filter_from(args: &[&str]) -> RemapFilter {
        let mut f = RemapFilter::anonymous();
        f.argv = args.iter().map(|s| s.to_string()).collect();
        f.validate_filter_args().unwrap();
        f
    }

    fn rule_with(filters: Vec<RemapFilter>) -> UrlMapping {
        let mut m = UrlMapping::new(
            RewriteUrl::parse_no_path_breakdown("http://a.test/").unwrap(),
            RewriteUrl::parse("http://b.test/").unwrap(),
            1,
        );
        m.filters = filters.into_iter().map(Arc::new).collect();
        m
    }

    #[test]
    fn test_src_ip_range_forms() {
        let r = SrcIpRange::parse("10.0.0.0-10.0.0.255").unwrap();
        assert!(r.matches(u32::from(Ipv4Addr::new(10, 0, 0, 5))));
        assert!(!r.matches(u32::from(Ipv4Addr::new(10, 0, 1, 5))));

        let r = SrcIpRange::parse("192.168.1.0/24").unwrap();
        assert!(r.matches(u32::from(Ipv4Addr::new(192, 168, 1, 77))));

        let r = SrcIpRange::parse("127.0.0.1").unwrap();
        assert!(r.matches(u32::from(Ipv4Addr::LOCALHOST)));

        assert!(SrcIpRange::parse("10.0.0.9-10.0.0.1").is_err());
        assert!(SrcIpRange::parse("not-an-ip").is_err());
    }

    #[test]
    fn test_inverted_range_negates() {
        let r = SrcIpRange::parse("~10.0.0.0-10.0.0.255").unwrap();
        assert!(!r.matches(u32::from(Ipv4Addr::new(10, 0, 0, 5))));
        assert!(r.matches(u32::from(Ipv4Addr::new(172, 16, 0, 1))));
    }

    #[test]
    fn test_filter_args_parsed_lazily() {
        let f = filter_from(&["method=GET", "method=head", "action=deny"]);
        assert!(!f.allow);
        assert!(f.method_restricted);
        assert!(f.method_bits[method_index("GET").unwrap()]);
        assert!(f.method_bits[method_index("HEAD").unwrap()]);
        assert!(!f.method_bits[method_index("POST").unwrap()]);
    }

    #[test]
    fn test_unknown_method_and_action_rejected() {
        let mut f = RemapFilter::anonymous();
        f.argv = vec!["method=BREW".to_string()];
        assert!(f.validate_filter_args().is_err());

        let mut f = RemapFilter::anonymous();
        f.argv = vec!["action=maybe".to_string()];
        assert!(f.validate_filter_args().is_err());
    }

    #[test]
    fn test_deny_by_source_ip() {
        // Matching deny clears the flag while the URL still gets rewritten.
        let rule = rule_with(vec![filter_from(&["src_ip=10.0.0.0-10.0.0.255", "action=deny"])]);

        let mut t = txn("GET", [10, 0, 0, 5]);
        perform_acl_filtering(&mut t, &rule);
        assert!(!t.client_connection_enabled);

        let mut t = txn("GET", [10, 0, 1, 5]);
        perform_acl_filtering(&mut t, &rule);
        assert!(t.client_connection_enabled);
    }

    #[test]
    fn test_deny_sticky_against_non_matching_allow() {
        let rule = rule_with(vec![
            filter_from(&["src_ip=10.0.0.0-10.0.0.255", "action=deny"]),
            filter_from(&["method=POST", "action=allow"]),
        ]);

        let mut t = txn("GET", [10, 0, 0, 5]);
        perform_acl_filtering(&mut t, &rule);
        assert!(!t.client_connection_enabled);
    }

    #[test]
    fn test_matching_allow_overrides_deny() {
        let rule = rule_with(vec![
            filter_from(&["src_ip=10.0.0.0-10.0.0.255", "action=deny"]),
            filter_from(&["method=GET", "action=allow"]),
        ]);

        let mut t = txn("GET", [10, 0, 0, 5]);
        perform_acl_filtering(&mut t, &rule);
        assert!(t.client_connection_enabled);
    }

    #[test]
    fn test_acl_runs_once_per_transaction() {
        let deny = rule_with(vec![filter_from(&["action=deny"])]);
        let mut t = txn("GET", [10, 0, 0, 5]);
        perform_acl_filtering(&mut t, &deny);
        assert!(!t.client_connection_enabled);

        t.client_connection_enabled = true;
        perform_acl_filtering(&mut t, &deny);
        assert!(t.client_connection_enabled);
    }

    #[test]
    fn test_library_activation_queue() {
        let mut lib = FilterLibrary::default();
        lib.define("deny-lab", &["src_ip=10.0.0.0/8".to_string(), "action=deny".to_string()])
            .unwrap();
        assert!(lib.active_filters().is_empty());

        lib.use_filter("deny-lab").unwrap();
        assert_eq!(1, lib.active_filters().len());

        lib.unuse_filter("deny-lab").unwrap();
        assert!(lib.active_filters().is_empty());

        assert!(lib.use_filter("missing").is_err());
        lib.delete("deny-lab").unwrap();
        assert!(lib.delete("deny-lab").is_err());
    }
}
