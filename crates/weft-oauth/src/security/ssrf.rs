//! SSRF-safe URL admissibility: exact-scheme, host allow-list, and
//! resolved-address range checks before any outbound call whose target is
//! not a compile-time constant.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::sync::Arc;

use smol_str::SmolStr;
use tracing::{debug, warn};
use url::Url;

/// Hostname resolution seam. The default implementation asks the system
/// resolver; tests inject a static map so no DNS leaves the process.
pub trait ResolveHost: Send + Sync {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl ResolveHost for SystemResolver {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        Ok((host, 443)
            .to_socket_addrs()?
            .map(|addr| addr.ip())
            .collect())
    }
}

/// URL admissibility gate. A URL passes only if the scheme is exactly
/// `https`, the host is on the fixed allow-list, and every address the
/// host resolves to is public.
#[derive(Clone)]
pub struct UrlGate {
    allowed_hosts: Vec<SmolStr>,
    resolver: Arc<dyn ResolveHost>,
}

impl UrlGate {
    pub fn new(allowed_hosts: Vec<SmolStr>) -> Self {
        Self::with_resolver(allowed_hosts, Arc::new(SystemResolver))
    }

    pub fn with_resolver(allowed_hosts: Vec<SmolStr>, resolver: Arc<dyn ResolveHost>) -> Self {
        Self {
            allowed_hosts,
            resolver,
        }
    }

    /// Every failure mode collapses into `false` so callers cannot be used
    /// as a probing oracle; the rejection reason only reaches the log.
    /// Never panics on malformed input.
    pub fn is_admissible(&self, url: &str) -> bool {
        match self.evaluate(url) {
            Ok(()) => true,
            Err(rejection) => {
                debug!(url, %rejection, "outbound url rejected");
                false
            }
        }
    }

    fn evaluate(&self, url: &str) -> Result<(), Rejection> {
        let url = Url::parse(url).map_err(|_| Rejection::Malformed)?;
        if url.scheme() != "https" {
            return Err(Rejection::Scheme);
        }
        let Some(host) = url.host_str() else {
            return Err(Rejection::NoHost);
        };
        if !self.allowed_hosts.iter().any(|allowed| allowed == host) {
            return Err(Rejection::HostNotAllowed);
        }
        let addrs = self
            .resolver
            .resolve(host)
            .map_err(|_| Rejection::Resolution)?;
        if addrs.is_empty() {
            return Err(Rejection::Resolution);
        }
        for ip in addrs {
            check_ip(ip)?;
        }
        Ok(())
    }
}

fn check_ip(ip: IpAddr) -> Result<(), Rejection> {
    let blocked = match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => is_forbidden_v6(v6),
    };
    if blocked {
        warn!(%ip, "blocked address range");
        return Err(Rejection::BlockedAddress(ip));
    }
    Ok(())
}

/// 10/8, 172.16/12, 192.168/16, 127/8, 0/8, 169.254/16, broadcast.
fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.octets()[0] == 0
}

/// Loopback, unspecified, unique-local (fc00::/7, covers `fd`), and
/// link-local (fe80::/10).
fn is_forbidden_v6(ip: Ipv6Addr) -> bool {
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.segments()[0] & 0xfe00 == 0xfc00
        || ip.segments()[0] & 0xffc0 == 0xfe80
}

#[derive(Debug)]
enum Rejection {
    Malformed,
    Scheme,
    NoHost,
    HostNotAllowed,
    Resolution,
    BlockedAddress(IpAddr),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed url"),
            Self::Scheme => write!(f, "scheme is not https"),
            Self::NoHost => write!(f, "url has no host"),
            Self::HostNotAllowed => write!(f, "host not on allow-list"),
            Self::Resolution => write!(f, "hostname did not resolve"),
            Self::BlockedAddress(ip) => write!(f, "resolved to blocked address {ip}"),
        }
    }
}
