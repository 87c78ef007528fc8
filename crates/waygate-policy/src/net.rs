//! Network access enforcement.
//!
//! The enforcer makes the pre-flight decision for the guarded `fetch`:
//! scheme, domain patterns, IP literals, and private ranges. Body-size and
//! redirect-count limits are enforced by the request lifecycle itself and
//! are only carried here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use url::Url;

use crate::error::{PolicyError, PolicyResult};
use crate::model::NetworkPolicy;

/// Pre-flight checker for outbound requests.
#[derive(Debug, Clone)]
pub struct NetworkEnforcer {
    policy: NetworkPolicy,
}

impl NetworkEnforcer {
    /// Build an enforcer over an intersected network policy.
    #[must_use]
    pub fn new(policy: NetworkPolicy) -> Self {
        Self { policy }
    }

    /// The policy this enforcer applies.
    #[must_use]
    pub fn policy(&self) -> &NetworkPolicy {
        &self.policy
    }

    /// Check a target URL. Returns the parsed URL on allow so callers do
    /// not parse twice.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NetworkDenied`] with the refusal reason.
    pub fn check(&self, raw: &str) -> PolicyResult<Url> {
        let url = Url::parse(raw).map_err(|e| PolicyError::NetworkDenied {
            reason: format!("unparseable URL: {e}"),
        })?;

        match url.scheme() {
            "http" | "https" => {},
            other => {
                return Err(PolicyError::NetworkDenied {
                    reason: format!("scheme {other:?} is not allowed, only http(s)"),
                });
            },
        }

        let Some(host) = url.host_str() else {
            return Err(PolicyError::NetworkDenied {
                reason: "URL has no host".to_string(),
            });
        };
        let host = host.trim_matches(|c| c == '[' || c == ']');

        for pattern in &self.policy.denied_domains {
            if domain_matches(pattern, host) {
                return Err(PolicyError::NetworkDenied {
                    reason: format!("domain {host} is denied by pattern {pattern}"),
                });
            }
        }

        if let Ok(ip) = IpAddr::from_str(host) {
            if self.policy.deny_ip_literals {
                return Err(PolicyError::NetworkDenied {
                    reason: format!("IP literals are not allowed: {host}"),
                });
            }
            if self.policy.block_private_ranges && is_private_ip(ip) {
                return Err(PolicyError::NetworkDenied {
                    reason: format!("address {host} is in a blocked private range"),
                });
            }
            // An IP host that survived the flags bypasses domain patterns.
            return Ok(url);
        }

        let allowed = self
            .policy
            .allowed_domains
            .iter()
            .any(|pattern| domain_matches(pattern, host));
        if !allowed {
            return Err(PolicyError::NetworkDenied {
                reason: format!("domain {host} is not in the allowed list"),
            });
        }

        Ok(url)
    }
}

/// Match a domain pattern against a host. `*.host` matches `host` itself
/// and any subdomain; anything else is an exact, case-insensitive match.
fn domain_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();

    if let Some(suffix) = pattern.strip_prefix("*.") {
        host == suffix || host.ends_with(&format!(".{suffix}"))
    } else {
        host == pattern
    }
}

/// Private, loopback, link-local, CGNAT, unique-local, or unspecified.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    if ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() {
        return true;
    }
    // 100.64.0.0/10 carrier-grade NAT.
    let octets = ip.octets();
    octets[0] == 100 && (64..128).contains(&octets[1])
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let segments = ip.segments();
    // fc00::/7 unique-local, fe80::/10 link-local.
    (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
}
