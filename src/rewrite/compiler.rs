//! Rule-file compiler.
//!
//! Turns the line-oriented remap configuration into the four compiled rule
//! classes. Rule-level problems skip the offending line with a warning and
//! the build carries on; plugin failures abort it.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use super::filter::{FilterLibrary, RemapFilter, MAX_RULE_FILTERS};
use super::indexes::HostTable;
use super::regex_map::RegexMapping;
use super::rule::{RefererInfo, RuleClass, UrlMapping};
use super::url::{RewriteUrl, UrlScheme};
use super::{ClassIndex, RewriteTable};
use crate::config::RemapConfig;
use crate::config_error;
use crate::core::{HostResolver, RemapError, RemapResult};
use crate::plugin::PluginRegistry;

// Pre-compiled hostname check for literal (non-regex) from-hosts, so a typo
// never becomes an unmatchable hash key.
static FROM_HOST_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:(?:\d{1,3}\.){3}\d{1,3}|\[[0-9a-f:]+\]|[a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)*)$",
    )
    .expect("Invalid regex pattern for hostname validation")
});

/// Outcome of a successful build.
#[derive(Debug)]
pub struct BuildReport {
    pub rules: usize,
    pub per_class: [usize; 4],
    /// Lines dropped with a warning.
    pub skipped: usize,
}

impl BuildReport {
    pub fn rules_for(&self, class: RuleClass) -> usize {
        self.per_class[class.index()]
    }
}

/// Compile `contents` into a rule table. The build succeeds as long as the
/// file was readable; individual bad lines only bump the skip count.
pub fn build_table(
    contents: &str,
    config: &RemapConfig,
    registry: &PluginRegistry,
    resolver: &dyn HostResolver,
) -> RemapResult<(RewriteTable, BuildReport)> {
    let mut builder = TableBuilder::new(config, registry, resolver);

    for (idx, raw) in contents.lines().enumerate() {
        let line_no = (idx + 1) as u32;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut tokens: Vec<&str> = Vec::new();
        for token in line.split_whitespace() {
            if token.starts_with('#') {
                break;
            }
            tokens.push(token);
        }
        if tokens.is_empty() {
            continue;
        }

        match builder.process_tokens(line_no, &tokens) {
            Ok(()) => {}
            Err(err @ RemapError::PluginLoad(_)) => return Err(err),
            Err(err) => {
                log::warn!("Skipping remap line {line_no}: {err}");
                builder.skipped += 1;
            }
        }
    }

    Ok(builder.finish())
}

struct TableBuilder<'a> {
    config: &'a RemapConfig,
    registry: &'a PluginRegistry,
    resolver: &'a dyn HostResolver,
    filters: FilterLibrary,
    classes: [ClassBuilder; 4],
    skipped: usize,
}

#[derive(Default)]
struct ClassBuilder {
    hosts: HostTable,
    regex: Vec<RegexMapping>,
}

impl ClassBuilder {
    fn rule_count(&self) -> usize {
        self.hosts.rule_count() + self.regex.len()
    }

    fn into_index(self) -> Option<ClassIndex> {
        if self.hosts.is_empty() && self.regex.is_empty() {
            None
        } else {
            Some(ClassIndex {
                hosts: self.hosts,
                regex: self.regex,
            })
        }
    }
}

impl<'a> TableBuilder<'a> {
    fn new(
        config: &'a RemapConfig,
        registry: &'a PluginRegistry,
        resolver: &'a dyn HostResolver,
    ) -> Self {
        Self {
            config,
            registry,
            resolver,
            filters: FilterLibrary::default(),
            classes: std::array::from_fn(|_| ClassBuilder::default()),
            skipped: 0,
        }
    }

    fn process_tokens(&mut self, line_no: u32, tokens: &[&str]) -> RemapResult<()> {
        let params: Vec<&str> = tokens.iter().filter(|t| !t.starts_with('@')).copied().collect();
        let args: Vec<String> = tokens
            .iter()
            .filter_map(|t| t.strip_prefix('@'))
            .map(str::to_string)
            .collect();

        if params.is_empty() {
            return Err(config_error!("Line has options but no rule"));
        }

        if params[0].starts_with('.') {
            self.process_directive(&params, &args)
        } else {
            self.process_remap_line(line_no, &params, &args)
        }
    }

    fn process_directive(&mut self, params: &[&str], args: &[String]) -> RemapResult<()> {
        let directive = params[0];
        let name = params
            .get(1)
            .ok_or_else(|| config_error!("Directive {directive} needs a filter name"))?;
        if params.len() > 2 {
            return Err(config_error!("Too many parameters for {directive}"));
        }

        if directive.eq_ignore_ascii_case(".definefilter") {
            self.filters.define(name, args)
        } else if directive.eq_ignore_ascii_case(".deletefilter") {
            self.filters.delete(name)
        } else if directive.eq_ignore_ascii_case(".usefilter") {
            self.filters.use_filter(name)
        } else if directive.eq_ignore_ascii_case(".unusefilter") {
            self.filters.unuse_filter(name)
        } else {
            Err(config_error!("Unknown directive {directive}"))
        }
    }

    fn process_remap_line(
        &mut self,
        line_no: u32,
        params: &[&str],
        args: &[String],
    ) -> RemapResult<()> {
        let (class, is_regex, with_referer) = parse_rule_type(params[0])
            .ok_or_else(|| config_error!("Unknown remap directive {}", params[0]))?;
        if params.len() < 3 {
            return Err(config_error!("A remap rule needs FROM and TO URLs"));
        }
        if !with_referer && params.len() > 4 {
            return Err(config_error!("Too many parameters for {}", params[0]));
        }

        let unique = is_unique_from(params[1]);
        let (mut from_token, wildcard_from_scheme) = split_wildcard_scheme(params[1]);
        if unique {
            // Drop the uniqueness marker so the parsed from-path is empty,
            // exactly as for a single-slash FROM URL.
            from_token.pop();
        }
        let from_str = whack(&from_token);
        let to_str = whack(params[2]);

        let mut from_url = RewriteUrl::parse_no_path_breakdown(&from_str)?;
        let to_url = RewriteUrl::parse(&to_str)?;

        if to_url.scheme() == UrlScheme::File {
            return Err(config_error!("Scheme file is only valid on the FROM side"));
        }
        if class == RuleClass::Reverse && (from_url.host().is_empty() || to_url.host().is_empty())
        {
            return Err(config_error!("A reverse_map rule requires explicit hostnames"));
        }
        if !is_regex {
            from_url.make_host_lowercase();
            if !from_url.host().is_empty() && !FROM_HOST_REGEX.is_match(from_url.host()) {
                return Err(config_error!(
                    "Invalid hostname {} in FROM URL",
                    from_url.host()
                ));
            }
        }

        let mut mapping = UrlMapping::new(from_url, to_url, line_no);
        mapping.unique = unique;
        mapping.wildcard_from_scheme = wildcard_from_scheme;

        if with_referer {
            mapping.referer_conditional = true;
            mapping.filter_redirect_url = Some(
                params
                    .get(3)
                    .ok_or_else(|| config_error!("map_with_referer needs a redirect URL"))?
                    .to_string(),
            );
            for pattern in &params[4..] {
                add_referer(&mut mapping, pattern)?;
            }
        } else if let Some(tag) = params.get(3) {
            mapping.tag = Some(tag.to_string());
        }

        let mut filters = self.filters.active_filters();
        self.process_rule_options(&mut mapping, &mut filters, args)?;
        if filters.len() > MAX_RULE_FILTERS {
            return Err(config_error!(
                "Too many filters for one rule (max {MAX_RULE_FILTERS})"
            ));
        }
        mapping.filters = filters;

        self.load_plugins(&mut mapping, &from_str, &to_str, args)?;

        if class == RuleClass::Forward {
            mapping.set_home_page_redirect();
        }

        let mapping = Arc::new(mapping);
        if is_regex {
            let regex_mapping = RegexMapping::new(mapping)?;
            self.classes[class.index()].regex.push(regex_mapping);
        } else {
            self.insert_mapping(class, mapping.clone());
            self.expand_dns_duplicates(class, &mapping);
        }
        Ok(())
    }

    fn process_rule_options(
        &self,
        mapping: &mut UrlMapping,
        filters: &mut Vec<Arc<RemapFilter>>,
        args: &[String],
    ) -> RemapResult<()> {
        let mut local_args: Vec<String> = Vec::new();

        for arg in args {
            let (key, value) = match arg.split_once('=') {
                Some((k, v)) => (k, v),
                None => (arg.as_str(), ""),
            };
            if key.eq_ignore_ascii_case("plugin") || key.eq_ignore_ascii_case("pparam") {
                // Consumed by load_plugins in declaration order.
            } else if key.eq_ignore_ascii_case("method")
                || key.eq_ignore_ascii_case("src_ip")
                || key.eq_ignore_ascii_case("action")
            {
                local_args.push(arg.clone());
            } else if key.eq_ignore_ascii_case("mapid") {
                let id = value
                    .parse()
                    .map_err(|_| config_error!("Invalid mapid {value}"))?;
                mapping.map_id = Some(id);
            } else if key.eq_ignore_ascii_case("map_with_referer") {
                mapping.referer_conditional = true;
            } else {
                return Err(config_error!("Unknown remap option @{arg}"));
            }
        }

        if !local_args.is_empty() {
            let mut filter = RemapFilter::anonymous();
            filter.argv = local_args;
            filter.validate_filter_args()?;
            filters.push(Arc::new(filter));
        }
        Ok(())
    }

    /// Each `@plugin=` opens a chain entry; the `@pparam=` values up to the
    /// next `@plugin=` belong to it. Instance argv starts with the FROM and
    /// TO URL strings. Load and instantiation failures abort the build.
    fn load_plugins(
        &mut self,
        mapping: &mut UrlMapping,
        from_str: &str,
        to_str: &str,
        args: &[String],
    ) -> RemapResult<()> {
        let mut i = 0;
        while i < args.len() {
            if let Some(path) = args[i].strip_prefix("plugin=") {
                let mut argv = vec![from_str.to_string(), to_str.to_string()];
                let mut j = i + 1;
                while j < args.len() && !args[j].starts_with("plugin=") {
                    if let Some(param) = args[j].strip_prefix("pparam=") {
                        argv.push(param.to_string());
                    }
                    j += 1;
                }
                let dso = self.registry.load(path)?;
                let instance = dso.new_instance(&argv)?;
                mapping.plugins.push(instance);
                i = j;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn insert_mapping(&mut self, class: RuleClass, mapping: Arc<UrlMapping>) {
        let key = mapping.from_url.host().to_string();
        self.classes[class.index()].hosts.insert(&key, mapping);
    }

    /// Forward `tunnel`/`mms` rules and reverse `mms` rules carry one extra
    /// copy per resolved IPv4 address, at the same rank. Resolution failures
    /// keep the name-keyed rule and log.
    fn expand_dns_duplicates(&mut self, class: RuleClass, mapping: &Arc<UrlMapping>) {
        let forward_by_addr = class == RuleClass::Forward
            && matches!(
                mapping.from_url.scheme(),
                UrlScheme::Tunnel | UrlScheme::Mms
            );
        let reverse_by_addr =
            class == RuleClass::Reverse && mapping.to_url.scheme() == UrlScheme::Mms;

        if forward_by_addr {
            let host = mapping.from_url.host().to_string();
            if host.is_empty() {
                return;
            }
            match self.resolver.lookup_ipv4(&host) {
                Ok(addrs) => {
                    for addr in addrs {
                        let mut dup = (**mapping).clone();
                        dup.from_url.set_host(&addr.to_string());
                        self.insert_mapping(class, Arc::new(dup));
                    }
                }
                Err(err) => log::warn!("Keeping {host} unexpanded: {err}"),
            }
        } else if reverse_by_addr {
            let host = mapping.to_url.host().to_string();
            match self.resolver.lookup_ipv4(&host) {
                Ok(addrs) => {
                    for addr in addrs {
                        let mut dup = (**mapping).clone();
                        dup.to_url.set_host(&addr.to_string());
                        self.insert_mapping(class, Arc::new(dup));
                    }
                }
                Err(err) => log::warn!("Keeping {host} unexpanded: {err}"),
            }
        }
    }

    /// Management backdoor: `/ink/rh` under the empty host key, pointing at
    /// the internal host marker.
    fn install_backdoor_mapping(&mut self) {
        let mut from = RewriteUrl::new(UrlScheme::Http);
        from.set_path("ink/rh");
        let mut to = RewriteUrl::new(UrlScheme::Http);
        to.set_host("{backdoor}");
        to.set_path("ink/rh");
        let mapping = Arc::new(UrlMapping::new(from, to, 0));
        self.classes[RuleClass::Forward.index()].hosts.insert("", mapping);
    }

    /// Proxy auto-config: hostless requests fall through to the autoconf
    /// port on loopback.
    fn install_pac_mapping(&mut self, autoconf_port: u16) {
        let from = RewriteUrl::new(UrlScheme::Http);
        let mut to = RewriteUrl::new(UrlScheme::Http);
        to.set_host("127.0.0.1");
        to.set_port(autoconf_port);
        let mapping = Arc::new(UrlMapping::new(from, to, 1));
        self.classes[RuleClass::Forward.index()].hosts.insert("", mapping);
    }

    fn finish(mut self) -> (RewriteTable, BuildReport) {
        if self.config.backdoor_enabled {
            self.install_backdoor_mapping();
        }
        if let Some(pac) = &self.config.pac {
            self.install_pac_mapping(pac.autoconf_port);
        }

        let per_class = [
            self.classes[0].rule_count(),
            self.classes[1].rule_count(),
            self.classes[2].rule_count(),
            self.classes[3].rule_count(),
        ];
        let report = BuildReport {
            rules: per_class.iter().sum(),
            per_class,
            skipped: self.skipped,
        };

        let [forward, reverse, permanent, temporary] = self.classes;
        let table = RewriteTable {
            forward: forward.into_index(),
            reverse: reverse.into_index(),
            permanent_redirect: permanent.into_index(),
            temporary_redirect: temporary.into_index(),
        };
        (table, report)
    }
}

fn parse_rule_type(token: &str) -> Option<(RuleClass, bool, bool)> {
    let (is_regex, rest) = match token.strip_prefix("regex_") {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    match rest {
        "map" => Some((RuleClass::Forward, is_regex, false)),
        "map_with_referer" => Some((RuleClass::Forward, is_regex, true)),
        "reverse_map" => Some((RuleClass::Reverse, is_regex, false)),
        "redirect" => Some((RuleClass::PermanentRedirect, is_regex, false)),
        "redirect_temporary" => Some((RuleClass::TemporaryRedirect, is_regex, false)),
        _ => None,
    }
}

/// A FROM URL ending in a double slash marks the rule unique: it only
/// matches requests with an empty path.
fn is_unique_from(token: &str) -> bool {
    match token.split_once("://") {
        Some((_, rest)) => rest.len() > 2 && rest.ends_with("//"),
        None => false,
    }
}

/// FROM URLs written without a scheme match any request scheme in regex
/// lookups; they parse as http.
fn split_wildcard_scheme(token: &str) -> (String, bool) {
    if let Some(rest) = token.strip_prefix("//") {
        (format!("http://{rest}"), true)
    } else {
        (token.to_string(), false)
    }
}

/// Append the root slash to `scheme://host` URLs written without a path.
fn whack(token: &str) -> String {
    match token.split_once("://") {
        Some((_, rest)) if !rest.is_empty() && !rest.contains('/') => format!("{token}/"),
        _ => token.to_string(),
    }
}

fn add_referer(mapping: &mut UrlMapping, pattern: &str) -> RemapResult<()> {
    if pattern == "*" {
        mapping.optional_referer = true;
        return Ok(());
    }
    let (negative, body) = match pattern.strip_prefix('~') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    if negative {
        mapping.negative_referer = true;
    }
    let regex = Regex::new(body)
        .map_err(|e| config_error!("Invalid referer regex {pattern}: {e}"))?;
    mapping.referer_list.push(RefererInfo {
        raw: pattern.to_string(),
        negative,
        regex,
    });
    Ok(())
}
