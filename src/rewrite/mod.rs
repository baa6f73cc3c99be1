//! The URL rewriting engine.
//!
//! `UrlRewriter` owns the compiled rule table and everything needed to
//! rebuild it; the table itself is immutable once built and swapped in
//! atomically, so request threads share it without locking.

pub mod compiler;
pub mod filter;
pub mod indexes;
pub mod regex_map;
pub mod rule;
pub mod url;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::RemapConfig;
use crate::core::{Action, Continuation, Event, HostResolver, RemapResult, Scheduler, Transaction};
use crate::plugin::{ChainDisposition, PluginChain, PluginRegistry};

pub use compiler::BuildReport;
pub use filter::perform_acl_filtering;
pub use rule::{MappingContainer, RuleClass, UrlMapping};
pub use url::{RewriteUrl, UrlScheme};

use indexes::HostTable;
use regex_map::{regex_mapping_lookup, RegexMapping};

/// Compiled indexes for one rule class.
pub struct ClassIndex {
    pub(crate) hosts: HostTable,
    pub(crate) regex: Vec<RegexMapping>,
}

impl ClassIndex {
    pub fn rule_count(&self) -> usize {
        self.hosts.rule_count() + self.regex.len()
    }
}

/// The four compiled rule classes. Classes that ended a build empty hold no
/// index at all.
#[derive(Default)]
pub struct RewriteTable {
    pub(crate) forward: Option<ClassIndex>,
    pub(crate) reverse: Option<ClassIndex>,
    pub(crate) permanent_redirect: Option<ClassIndex>,
    pub(crate) temporary_redirect: Option<ClassIndex>,
}

impl RewriteTable {
    fn class(&self, class: RuleClass) -> Option<&ClassIndex> {
        match class {
            RuleClass::Forward => self.forward.as_ref(),
            RuleClass::Reverse => self.reverse.as_ref(),
            RuleClass::PermanentRedirect => self.permanent_redirect.as_ref(),
            RuleClass::TemporaryRedirect => self.temporary_redirect.as_ref(),
        }
    }

    pub fn rule_count(&self, class: RuleClass) -> usize {
        self.class(class).map_or(0, ClassIndex::rule_count)
    }

    /// Best rule for the request in one class: hash lookup first, then the
    /// regex index under the hash match's rank as a ceiling.
    pub fn mapping_lookup(
        &self,
        class: RuleClass,
        request_url: &RewriteUrl,
    ) -> Option<MappingContainer> {
        let index = self.class(class)?;
        let host = request_url.host().to_ascii_lowercase();
        let port = request_url.port_or_default();
        let path = request_url.path();

        let mut rank_ceiling = u32::MAX;
        let mut container = None;
        if let Some(mapping) = index.hosts.lookup(&host, port, path) {
            log::debug!(
                "{} hash hit for {host} at rank {}",
                class.as_str(),
                mapping.rank
            );
            rank_ceiling = mapping.rank;
            container = Some(MappingContainer::new(mapping));
        }

        if let Some(regex_hit) = regex_mapping_lookup(&index.regex, request_url, &host, rank_ceiling)
        {
            log::debug!(
                "{} regex hit for {host} at rank {}",
                class.as_str(),
                regex_hit.mapping.rank
            );
            container = Some(regex_hit);
        }
        container
    }
}

/// Commit a match: the request URL takes the to-URL's scheme, host and port,
/// and its path becomes the to-path followed by whatever the from-path
/// prefix left of the request path. The query string stays put.
pub fn do_remap(container: &MappingContainer, request_url: &mut RewriteUrl) {
    let to_url = container.to_url();
    request_url.set_scheme(to_url.scheme());
    request_url.set_host(to_url.host());
    request_url.set_port(to_url.port());

    let from_path = container.mapping.from_url.path();
    let suffix = request_url.path().strip_prefix(from_path).unwrap_or("");
    let mut new_path = String::with_capacity(to_url.path().len() + suffix.len());
    new_path.push_str(to_url.path());
    new_path.push_str(suffix);
    request_url.set_path(&new_path);
}

/// The rewriting engine: compiled table, plugin registry and the injected
/// resolver, behind one handle the HTTP state machine keeps.
pub struct UrlRewriter {
    config: RemapConfig,
    registry: Arc<PluginRegistry>,
    resolver: Arc<dyn HostResolver>,
    table: ArcSwap<RewriteTable>,
}

impl UrlRewriter {
    /// Starts with an empty table; call `build_from_file` to populate it.
    pub fn new(config: RemapConfig, resolver: Arc<dyn HostResolver>) -> Self {
        let registry = Arc::new(PluginRegistry::new(config.plugin_dir.clone()));
        Self {
            config,
            registry,
            resolver,
            table: ArcSwap::from_pointee(RewriteTable::default()),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Full rebuild from a rule file. The new table replaces the old one
    /// atomically; in-flight lookups keep the table they started with.
    pub fn build_from_file<P: AsRef<Path>>(&self, path: P) -> RemapResult<BuildReport> {
        let contents = fs::read_to_string(path.as_ref())?;
        let (table, report) =
            compiler::build_table(&contents, &self.config, &self.registry, self.resolver.as_ref())?;
        log::info!(
            "Loaded {} remap rules ({} lines skipped)",
            report.rules,
            report.skipped
        );
        self.table.store(Arc::new(table));
        Ok(report)
    }

    /// Per-class match. `None` is not an error; the caller falls through to
    /// its per-class default.
    pub fn rewrite(&self, class: RuleClass, request_url: &RewriteUrl) -> Option<MappingContainer> {
        self.table.load().mapping_lookup(class, request_url)
    }

    /// Evaluate the matched rule's ACL filters against the transaction.
    pub fn apply_acl(&self, txn: &mut Transaction, container: &MappingContainer) {
        perform_acl_filtering(txn, &container.mapping);
    }

    /// Drive the matched rule's plugin chain to completion or cancellation.
    /// Each yield goes through `scheduler`; completion is a single
    /// `RemapComplete` on `continuation`.
    pub fn run_plugin_chain(
        &self,
        container: &MappingContainer,
        request_url: &mut RewriteUrl,
        txn: &mut Transaction,
        continuation: &mut dyn Continuation,
        action: &Action,
        scheduler: &mut dyn Scheduler,
    ) {
        let mut chain = PluginChain::new(
            container,
            request_url,
            continuation,
            action.clone(),
            self.config.max_plugin_chain,
        );
        loop {
            match chain.handle_event(Event::Immediate, txn) {
                ChainDisposition::Reschedule => scheduler.schedule_imm(),
                ChainDisposition::Finished | ChainDisposition::Cancelled => break,
            }
        }
    }
}
