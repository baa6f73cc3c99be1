//! Remap rule objects.

use std::sync::Arc;

use regex::Regex;

use super::filter::RemapFilter;
use super::url::RewriteUrl;
use crate::plugin::RemapPlugin;

/// The four rule classes; each is compiled into its own pair of indexes and
/// matched in a distinct phase of the transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuleClass {
    Forward,
    Reverse,
    PermanentRedirect,
    TemporaryRedirect,
}

impl RuleClass {
    pub const ALL: [RuleClass; 4] = [
        RuleClass::Forward,
        RuleClass::Reverse,
        RuleClass::PermanentRedirect,
        RuleClass::TemporaryRedirect,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RuleClass::Forward => "forward map",
            RuleClass::Reverse => "reverse map",
            RuleClass::PermanentRedirect => "permanent redirect",
            RuleClass::TemporaryRedirect => "temporary redirect",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            RuleClass::Forward => 0,
            RuleClass::Reverse => 1,
            RuleClass::PermanentRedirect => 2,
            RuleClass::TemporaryRedirect => 3,
        }
    }
}

/// One referer pattern attached to a referer-conditional rule. The engine
/// stores these faithfully; the referer filter that applies them lives in the
/// HTTP state machine.
#[derive(Clone, Debug)]
pub struct RefererInfo {
    pub raw: String,
    pub negative: bool,
    pub regex: Regex,
}

/// A compiled remap rule. Built by the compiler, owned by exactly one index
/// slot, never mutated after insertion.
#[derive(Clone)]
pub struct UrlMapping {
    pub from_url: RewriteUrl,
    pub to_url: RewriteUrl,

    /// Priority; lower wins. Assigned from the rule-file line number so
    /// configuration order deterministically controls matching.
    pub rank: u32,

    /// Set when the FROM URL ended in a double slash; such rules match only
    /// the empty request path.
    pub unique: bool,

    /// Set when the FROM URL was written without a scheme; regex lookups
    /// waive their scheme-equality check for these rules.
    pub wildcard_from_scheme: bool,

    pub tag: Option<String>,
    pub map_id: Option<u32>,

    /// ACL filters in evaluation order: inherited active filters first, the
    /// rule-local `@method/@src_ip/@action` filter last.
    pub filters: Vec<Arc<RemapFilter>>,

    /// Plugin instances in declaration order. Each instance handle is shared
    /// by every request matching this rule.
    pub plugins: Vec<Arc<dyn RemapPlugin>>,

    pub referer_list: Vec<RefererInfo>,
    pub optional_referer: bool,
    pub negative_referer: bool,
    pub referer_conditional: bool,
    /// Redirect target template for referer mismatches; `@` substitutes the
    /// serialized FROM URL.
    pub filter_redirect_url: Option<String>,

    /// Consumed by the HTTP state machine when a virtual directory maps to a
    /// server home page; carried here, never acted on.
    pub home_page_redirect: bool,
}

impl UrlMapping {
    pub fn new(from_url: RewriteUrl, to_url: RewriteUrl, rank: u32) -> Self {
        Self {
            from_url,
            to_url,
            rank,
            unique: false,
            wildcard_from_scheme: false,
            tag: None,
            map_id: None,
            filters: Vec::new(),
            plugins: Vec::new(),
            referer_list: Vec::new(),
            optional_referer: false,
            negative_referer: false,
            referer_conditional: false,
            filter_redirect_url: None,
            home_page_redirect: false,
        }
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    pub(crate) fn set_home_page_redirect(&mut self) {
        self.home_page_redirect = !self.from_url.path().is_empty() && self.to_url.path().is_empty();
    }
}

/// A matched rule plus the to-URL the match produced. Regex matches expand a
/// fresh to-URL; the rule's own to-URL is never touched.
pub struct MappingContainer {
    pub mapping: Arc<UrlMapping>,
    expanded_to: Option<RewriteUrl>,
}

impl MappingContainer {
    pub fn new(mapping: Arc<UrlMapping>) -> Self {
        Self {
            mapping,
            expanded_to: None,
        }
    }

    pub fn with_expanded(mapping: Arc<UrlMapping>, expanded_to: RewriteUrl) -> Self {
        Self {
            mapping,
            expanded_to: Some(expanded_to),
        }
    }

    /// The to-URL this match rewrites onto: the regex-expanded one when
    /// present, the rule default otherwise.
    pub fn to_url(&self) -> &RewriteUrl {
        self.expanded_to.as_ref().unwrap_or(&self.mapping.to_url)
    }

    pub fn is_regex_expanded(&self) -> bool {
        self.expanded_to.is_some()
    }
}
