//! Mutable URL view used throughout the rewriting engine.
//!
//! Rules own two of these (from/to), requests own one, and remap plugins
//! mutate the request's copy in place. The path is stored without its leading
//! slash so prefix matching works on raw bytes.

use std::fmt;

use crate::config_error;
use crate::core::RemapResult;

/// Scheme tokens the rule compiler accepts. `file` is only legal on the FROM
/// side of a rule.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UrlScheme {
    Http,
    Https,
    Rtsp,
    Mms,
    Mmsu,
    Mmst,
    Tunnel,
    File,
}

impl UrlScheme {
    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("http") {
            Some(UrlScheme::Http)
        } else if token.eq_ignore_ascii_case("https") {
            Some(UrlScheme::Https)
        } else if token.eq_ignore_ascii_case("rtsp") {
            Some(UrlScheme::Rtsp)
        } else if token.eq_ignore_ascii_case("mms") {
            Some(UrlScheme::Mms)
        } else if token.eq_ignore_ascii_case("mmsu") {
            Some(UrlScheme::Mmsu)
        } else if token.eq_ignore_ascii_case("mmst") {
            Some(UrlScheme::Mmst)
        } else if token.eq_ignore_ascii_case("tunnel") {
            Some(UrlScheme::Tunnel)
        } else if token.eq_ignore_ascii_case("file") {
            Some(UrlScheme::File)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UrlScheme::Http => "http",
            UrlScheme::Https => "https",
            UrlScheme::Rtsp => "rtsp",
            UrlScheme::Mms => "mms",
            UrlScheme::Mmsu => "mmsu",
            UrlScheme::Mmst => "mmst",
            UrlScheme::Tunnel => "tunnel",
            UrlScheme::File => "file",
        }
    }

    /// Canonical port, 0 where the scheme has none.
    pub fn default_port(self) -> u16 {
        match self {
            UrlScheme::Http => 80,
            UrlScheme::Https => 443,
            UrlScheme::Rtsp => 554,
            UrlScheme::Mms | UrlScheme::Mmsu | UrlScheme::Mmst => 1755,
            UrlScheme::Tunnel | UrlScheme::File => 0,
        }
    }
}

impl fmt::Display for UrlScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed URL with mutable fields. Port 0 means "unspecified"; rule lookups
/// treat an unspecified from-port as matching any request port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewriteUrl {
    scheme: UrlScheme,
    host: String,
    port: u16,
    path: String,
    query: Option<String>,
}

impl RewriteUrl {
    pub fn new(scheme: UrlScheme) -> Self {
        Self {
            scheme,
            host: String::new(),
            port: 0,
            path: String::new(),
            query: None,
        }
    }

    pub fn parse(input: &str) -> RemapResult<Self> {
        Self::parse_with_mode(input, true)
    }

    /// Parse mode for FROM URLs: everything after the authority is kept as
    /// the raw path, query separator included. Regex from-hosts and literal
    /// `?` bytes survive this way.
    pub fn parse_no_path_breakdown(input: &str) -> RemapResult<Self> {
        Self::parse_with_mode(input, false)
    }

    fn parse_with_mode(input: &str, split_query: bool) -> RemapResult<Self> {
        let (scheme_token, rest) = input
            .split_once("://")
            .ok_or_else(|| config_error!("URL {input} has no scheme separator"))?;
        let scheme = UrlScheme::from_token(scheme_token)
            .ok_or_else(|| config_error!("Unknown scheme in URL {input}"))?;

        let (authority, raw_path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| config_error!("Invalid port in URL {input}"))?;
                (h, port)
            }
            None => (authority, 0),
        };

        let (path, query) = if split_query {
            match raw_path.split_once('?') {
                Some((p, q)) => (p.to_string(), Some(q.to_string())),
                None => (raw_path.to_string(), None),
            }
        } else {
            (raw_path.to_string(), None)
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path,
            query,
        })
    }

    pub fn scheme(&self) -> UrlScheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The explicit port, or the scheme's canonical port when unspecified.
    pub fn port_or_default(&self) -> u16 {
        if self.port != 0 {
            self.port
        } else {
            self.scheme.default_port()
        }
    }

    /// Path bytes without the leading slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn set_scheme(&mut self, scheme: UrlScheme) {
        self.scheme = scheme;
    }

    pub fn set_host(&mut self, host: &str) {
        self.host = host.to_string();
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn set_path(&mut self, path: &str) {
        self.path = path.strip_prefix('/').unwrap_or(path).to_string();
    }

    pub fn set_query(&mut self, query: Option<&str>) {
        self.query = query.map(str::to_string);
    }

    pub(crate) fn make_host_lowercase(&mut self) {
        self.host.make_ascii_lowercase();
    }
}

impl fmt::Display for RewriteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        write!(f, "/{}", self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}
