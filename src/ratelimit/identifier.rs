//! Caller identification.
//!
//! Resolution is a total function over a transport-independent [`RequestContext`]:
//! authenticated principal first, then network origin, then a shared `unknown` bucket.

use http::HeaderMap;
use std::fmt;
use std::net::IpAddr;

/// Header carrying the proxy chain, client first.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Header set by some proxies with the single client address.
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Value used when no network origin is known.
const UNKNOWN: &str = "unknown";

/// The scope an identifier was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// An authenticated principal
    User,
    /// A network origin
    Ip,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Ip => "ip",
        }
    }
}

/// A key that uniquely represents a caller for throttling purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Build a `scope:value` identifier.
    pub fn new(scope: Scope, value: &str) -> Self {
        Self(format!("{}:{}", scope.as_str(), value))
    }

    /// Use a caller-supplied key verbatim, e.g. an email address or job id.
    pub fn explicit(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The shared bucket for callers with no usable origin.
    pub fn unknown() -> Self {
        Self::new(Scope::Ip, UNKNOWN)
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the resolver may look at, already extracted from the transport.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Resolved principal id, if the session was authenticated
    pub principal_id: Option<String>,
    /// Raw `X-Forwarded-For` value
    pub forwarded_for: Option<String>,
    /// Raw `X-Real-IP` value
    pub real_ip: Option<String>,
    /// Address of the directly connected peer
    pub peer_addr: Option<IpAddr>,
}

impl RequestContext {
    /// An empty context. Resolves to the `unknown` bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from request headers and the peer address.
    pub fn from_headers(headers: &HeaderMap, peer_addr: Option<IpAddr>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            principal_id: None,
            forwarded_for: header(FORWARDED_FOR_HEADER),
            real_ip: header(REAL_IP_HEADER),
            peer_addr,
        }
    }

    /// Attach an authenticated principal.
    pub fn with_principal(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    /// Attach a forwarded-for chain.
    pub fn with_forwarded_for(mut self, chain: impl Into<String>) -> Self {
        self.forwarded_for = Some(chain.into());
        self
    }

    /// Attach the peer address.
    pub fn with_peer(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Resolve the caller identifier.
    ///
    /// Precedence: principal id, first forwarded-for hop, real-ip header, peer address,
    /// then the shared `ip:unknown` bucket.
    pub fn identifier(&self) -> Identifier {
        if let Some(id) = non_empty(self.principal_id.as_deref()) {
            return Identifier::new(Scope::User, id);
        }

        let forwarded = self
            .forwarded_for
            .as_deref()
            .and_then(|chain| chain.split(',').next());
        if let Some(addr) = non_empty(forwarded) {
            return Identifier::new(Scope::Ip, addr);
        }

        if let Some(addr) = non_empty(self.real_ip.as_deref()) {
            return Identifier::new(Scope::Ip, addr);
        }

        match self.peer_addr {
            Some(addr) => Identifier::new(Scope::Ip, &addr.to_string()),
            None => Identifier::unknown(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
