//! Host resolution capability.
//!
//! The rule compiler expands `tunnel`/`mms` rules to one duplicate per
//! A-record, so builds need a blocking IPv4 lookup. It is injected rather
//! than called directly so that table builds are testable without real DNS.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use hickory_resolver::Resolver;

use super::error::{RemapError, RemapResult};

/// Synchronous IPv4 A-record lookup by name.
pub trait HostResolver: Send + Sync {
    fn lookup_ipv4(&self, host: &str) -> RemapResult<Vec<Ipv4Addr>>;
}

/// System resolver backed by hickory-resolver.
pub struct DnsResolver {
    inner: Resolver,
}

impl DnsResolver {
    pub fn from_system() -> RemapResult<Self> {
        let inner = Resolver::from_system_conf().map_err(|e| {
            RemapError::Resolver(format!("Failed to read system resolver config: {e}"))
        })?;
        Ok(Self { inner })
    }
}

impl HostResolver for DnsResolver {
    fn lookup_ipv4(&self, host: &str) -> RemapResult<Vec<Ipv4Addr>> {
        let lookup = self
            .inner
            .ipv4_lookup(host)
            .map_err(|e| RemapError::Resolver(format!("A-record lookup for {host} failed: {e}")))?;
        Ok(lookup.iter().map(|a| a.0).collect())
    }
}

/// Fixed host-to-address map. Doubles as a "no DNS" resolver when empty.
#[derive(Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<Ipv4Addr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: &str, addrs: Vec<Ipv4Addr>) {
        self.hosts.insert(host.to_ascii_lowercase(), addrs);
    }
}

impl HostResolver for StaticResolver {
    fn lookup_ipv4(&self, host: &str) -> RemapResult<Vec<Ipv4Addr>> {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| RemapError::Resolver(format!("No A records for {host}")))
    }
}
