//! Per-request transaction view.

use std::net::IpAddr;

use pingora_http::RequestHeader;

/// The slice of the HTTP transaction the rewriting engine is allowed to see
/// and mutate. The enclosing state machine owns the real transaction; this
/// view travels through matching, ACL filtering and the plugin chain.
pub struct Transaction {
    /// Parsed client request header, shared read-write with remap plugins.
    pub request: RequestHeader,

    /// Address the client connected from; ACL source-IP filters apply to it.
    pub client_addr: IpAddr,

    /// Cleared by a matching deny filter. The state machine decides what a
    /// disabled connection means; the engine only toggles the flag.
    pub client_connection_enabled: bool,

    /// Serialized redirect target captured from a plugin that remapped with
    /// the redirect flag set. Replaces any earlier value.
    pub remap_redirect: Option<String>,

    pub(crate) acl_checked: bool,
}

impl Transaction {
    pub fn new(request: RequestHeader, client_addr: IpAddr) -> Self {
        Self {
            request,
            client_addr,
            client_connection_enabled: true,
            remap_redirect: None,
            acl_checked: false,
        }
    }
}
