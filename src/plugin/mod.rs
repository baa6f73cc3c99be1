//! Remap plugin system.
//!
//! Plugins are shared objects exposing a fixed six-symbol table; the registry
//! loads each path once and hands out per-rule instances. The chain runner in
//! [`chain`] drives the instances attached to a matched rule.

pub mod chain;
pub mod dso;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use pingora_http::RequestHeader;

pub use chain::{ChainDisposition, PluginChain, DEFAULT_MAX_PLUGIN_CHAIN};
pub use dso::PluginDso;

use crate::core::RemapResult;
use crate::rewrite::url::RewriteUrl;

/// Verdict returned by one remap plugin invocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RemapStatus {
    NoRemap,
    NoRemapStop,
    DidRemap,
    DidRemapStop,
}

impl RemapStatus {
    /// Negative and unknown codes clamp to `NoRemap`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => RemapStatus::NoRemapStop,
            2 => RemapStatus::DidRemap,
            3 => RemapStatus::DidRemapStop,
            _ => RemapStatus::NoRemap,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            RemapStatus::NoRemap => 0,
            RemapStatus::NoRemapStop => 1,
            RemapStatus::DidRemap => 2,
            RemapStatus::DidRemapStop => 3,
        }
    }

    pub fn did_remap(self) -> bool {
        matches!(self, RemapStatus::DidRemap | RemapStatus::DidRemapStop)
    }

    pub fn stop(self) -> bool {
        matches!(self, RemapStatus::NoRemapStop | RemapStatus::DidRemapStop)
    }
}

/// Request state shared with a plugin for one `do_remap` call. The request
/// URL and header are read-write; the rule's own URLs are read-only.
pub struct RemapRequestInfo<'a> {
    pub request_header: &'a mut RequestHeader,
    pub request_url: &'a mut RewriteUrl,
    pub map_from_url: &'a RewriteUrl,
    pub map_to_url: &'a RewriteUrl,
    /// Set by the plugin to have the current request URL captured into the
    /// transaction's redirect slot.
    pub redirect: bool,
}

/// One plugin instance attached to a rule. Loaded shared objects implement
/// this through [`dso::DsoInstance`]; tests implement it directly. Instances
/// are shared by every request matching the rule, so `do_remap` must be
/// reentrant.
pub trait RemapPlugin: Send + Sync {
    fn do_remap(&self, rri: &mut RemapRequestInfo) -> RemapStatus;

    fn os_response(&self, _response_type: i32) {}
}

/// Loaded shared objects, one per resolved path. Mutated only while a table
/// build is running.
pub struct PluginRegistry {
    plugin_dir: PathBuf,
    dsos: DashMap<PathBuf, Arc<PluginDso>>,
}

impl PluginRegistry {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            dsos: DashMap::new(),
        }
    }

    /// Absolute paths that exist are used as-is; everything else resolves
    /// against the plugin directory.
    pub fn resolve(&self, spec: &str) -> PathBuf {
        let path = Path::new(spec);
        if path.is_absolute() && path.exists() {
            path.to_path_buf()
        } else {
            self.plugin_dir.join(spec)
        }
    }

    /// Load the shared object at `spec`, or return the already-loaded copy.
    /// The one-time plugin `init` runs on first load; failures are fatal.
    pub fn load(&self, spec: &str) -> RemapResult<Arc<PluginDso>> {
        let path = self.resolve(spec);
        if let Some(dso) = self.dsos.get(&path) {
            return Ok(dso.value().clone());
        }
        let dso = Arc::new(PluginDso::load(&path)?);
        self.dsos.insert(path, dso.clone());
        Ok(dso)
    }

    pub fn len(&self) -> usize {
        self.dsos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dsos.is_empty()
    }
}
