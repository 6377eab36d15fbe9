use crate::message::{Host, HostWithPort, Transport};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;

/// Name resolution seam per RFC 3263.
///
/// The stack only requires A/AAAA with port defaulting; an embedding
/// application that needs NAPTR/SRV installs its own implementation. The
/// returned list is ordered: the UAC walks it for failover on 408/503 and
/// transport errors.
#[async_trait::async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, addr: &HostWithPort, transport: Transport) -> Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system, via `tokio::net::lookup_host`.
#[derive(Default)]
pub struct SystemResolver;

#[async_trait::async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, addr: &HostWithPort, transport: Transport) -> Result<Vec<SocketAddr>> {
        let port = addr.port.unwrap_or_else(|| transport.default_port());
        match &addr.host {
            Host::Ip(ip) => Ok(vec![SocketAddr::new(*ip, port)]),
            Host::Domain(domain) => {
                let candidates: Vec<SocketAddr> = tokio::net::lookup_host((domain.as_str(), port))
                    .await
                    .map_err(|e| {
                        Error::DnsResolutionError(format!("{}: {}", domain, e))
                    })?
                    .collect();
                if candidates.is_empty() {
                    return Err(Error::DnsResolutionError(format!(
                        "no addresses for {}",
                        domain
                    )));
                }
                Ok(candidates)
            }
        }
    }
}

pub type DnsResolverRef = Arc<dyn DnsResolver>;
