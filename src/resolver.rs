//! DNS checks used by the envelope validator and the Received header.

use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};

/// The lookups the session needs, behind a trait so tests stay off the
/// network.
#[async_trait::async_trait]
pub trait Lookup: Send + Sync {
    /// is this host a fully qualified, resolvable domain (A, MX or NS
    /// records present)
    async fn is_fqdn(&self, host: &str) -> anyhow::Result<bool>;

    /// reverse (PTR) lookup, `None` when there is no reverse
    async fn reverse(&self, ip: std::net::IpAddr) -> Option<String>;
}

pub struct DnsResolver {
    inner: trust_dns_resolver::TokioAsyncResolver,
}

impl DnsResolver {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            inner: trust_dns_resolver::TokioAsyncResolver::tokio(
                trust_dns_resolver::config::ResolverConfig::default(),
                trust_dns_resolver::config::ResolverOpts::default(),
            )?,
        })
    }
}

/// `Ok(false)` on an authoritative no-records answer, `Err` on a lookup
/// failure (timeout, servfail) so the caller can answer 451 instead of 550.
fn no_records(error: ResolveError) -> anyhow::Result<bool> {
    match error.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Ok(false),
        _ => Err(anyhow::Error::new(error)),
    }
}

#[async_trait::async_trait]
impl Lookup for DnsResolver {
    async fn is_fqdn(&self, host: &str) -> anyhow::Result<bool> {
        match self.inner.lookup_ip(host).await {
            Ok(answer) => {
                if answer.iter().next().is_some() {
                    return Ok(true);
                }
            }
            Err(e) => {
                no_records(e)?;
            }
        }
        match self.inner.mx_lookup(host).await {
            Ok(answer) => {
                if answer.iter().next().is_some() {
                    return Ok(true);
                }
            }
            Err(e) => {
                no_records(e)?;
            }
        }
        match self.inner.ns_lookup(host).await {
            Ok(answer) => Ok(answer.iter().next().is_some()),
            Err(e) => no_records(e),
        }
    }

    async fn reverse(&self, ip: std::net::IpAddr) -> Option<String> {
        self.inner
            .reverse_lookup(ip)
            .await
            .ok()
            .and_then(|answer| answer.iter().next().map(ToString::to_string))
            .map(|name| name.trim_end_matches('.').to_string())
    }
}
