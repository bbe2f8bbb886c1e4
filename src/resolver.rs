//! DNS resolution adapter.
//!
//! Wraps hickory-resolver behind the two requests the bouncer makes:
//! forward lookup of a server or local-address name, and reverse lookup of
//! a peer for hostname display and `from` mask authentication.  Every
//! request is bounded by the configured `dns_timeout`; cancellation is
//! inherent, since a request future dies with the session that made it.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use tracing::debug;

/// Shared resolver handle.
pub struct Resolver {
    inner: TokioResolver,
    timeout: Duration,
}

impl Resolver {
    /// Build a resolver from the system configuration, falling back to
    /// defaults when that cannot be read.
    pub fn new(dns_timeout: u64) -> Self {
        let inner = TokioResolver::builder_tokio()
            .map(|b| b.build())
            .unwrap_or_else(|_| {
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            });
        Resolver {
            inner,
            timeout: Duration::from_secs(dns_timeout.max(1)),
        }
    }

    /// Resolve a hostname to an address.  Literal addresses short-circuit.
    pub async fn resolve_host(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        let lookup = self.inner.lookup_ip(host);
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(response)) => response.iter().next(),
            Ok(Err(e)) => {
                debug!(host, error = %e, "DNS lookup failed");
                None
            }
            Err(_) => {
                debug!(host, "DNS lookup timed out");
                None
            }
        }
    }

    /// Reverse-resolve an address to a hostname.  Returns `None` when the
    /// address has no PTR record (callers fall back to the address form).
    pub async fn resolve_addr(&self, addr: IpAddr) -> Option<String> {
        let lookup = self.inner.reverse_lookup(addr);
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(response)) => response
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_owned()),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "Reverse DNS lookup failed");
                None
            }
            Err(_) => {
                debug!(%addr, "Reverse DNS lookup timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_address_short_circuits() {
        let resolver = Resolver::new(1);
        let ip = resolver.resolve_host("127.0.0.1").await;
        assert_eq!(ip, Some(IpAddr::from([127, 0, 0, 1])));
    }
}
