//! Service configuration.
//!
//! The rule file carries the remap grammar; this YAML document carries
//! everything around it: where the rule file and plugins live, the plugin
//! chain cap, and the two synthetic-rule toggles.

use std::fs;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::{RemapError, RemapResult};

/// Root configuration for the rewriting engine.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct RemapConfig {
    /// Path to the remap rule file.
    #[validate(length(min = 1))]
    pub rule_file: String,

    /// Directory searched for relative `@plugin=` paths.
    #[serde(default = "RemapConfig::default_plugin_dir")]
    pub plugin_dir: String,

    /// Upper bound on plugin invocations per matched rule.
    #[serde(default = "RemapConfig::default_max_plugin_chain")]
    #[validate(range(min = 1))]
    pub max_plugin_chain: usize,

    /// Install the management backdoor rule under the empty host key.
    #[serde(default)]
    pub backdoor_enabled: bool,

    /// Proxy auto-config: when set, hostless requests remap to the autoconf
    /// port on loopback.
    #[validate(nested)]
    pub pac: Option<PacConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct PacConfig {
    #[validate(range(min = 1))]
    pub autoconf_port: u16,
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            rule_file: "remap.config".to_string(),
            plugin_dir: Self::default_plugin_dir(),
            max_plugin_chain: Self::default_max_plugin_chain(),
            backdoor_enabled: false,
            pac: None,
        }
    }
}

impl RemapConfig {
    fn default_plugin_dir() -> String {
        "/usr/local/lib/remap".to_string()
    }

    fn default_max_plugin_chain() -> usize {
        crate::plugin::DEFAULT_MAX_PLUGIN_CHAIN
    }

    /// Loads configuration from a YAML file with validation.
    ///
    /// Synchronous loading is intentional - configuration should be validated
    /// at startup before the first table build.
    pub fn load_from_yaml<P>(path: P) -> RemapResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .map_err(|e| RemapError::Config(format!("Unable to read conf file from {path}: {e}")))?;
        log::debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    /// Parses a YAML configuration string with validation.
    pub fn from_yaml(conf_str: &str) -> RemapResult<Self> {
        log::trace!("Read conf file: {conf_str}");
        let conf: RemapConfig = serde_yaml::from_str(conf_str)
            .map_err(|e| RemapError::Config(format!("Unable to parse yaml conf: {e}")))?;

        log::trace!("Loaded conf: {conf:?}");
        conf.validate()
            .map_err(|e| RemapError::Config(format!("Conf file validation failed: {e}")))?;
        Ok(conf)
    }
}
