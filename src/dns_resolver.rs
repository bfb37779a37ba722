use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::address::AddressIdentity;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("destination has no hostname to resolve")]
    NoHostname,
    #[error("no addresses found for {0}")]
    NoAddresses(String),
    #[error("resolving {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("DNS-over-HTTPS query for {0} failed")]
    Doh(String),
}

/// Turns a named destination into one carrying a resolved address.
///
/// The hostname and port are kept; only `address` is filled in.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    async fn resolve(&self, target: &AddressIdentity) -> Result<AddressIdentity, DnsError>;
}

/// First IPv4 address if there is one, otherwise the first address.
fn pick_address(addrs: &[IpAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

fn with_address(target: &AddressIdentity, addr: IpAddr) -> AddressIdentity {
    let mut out = target.clone();
    out.address = Some(addr);
    out
}

/// getaddrinfo's EAI_AGAIN surfaces only through the message text.
fn is_try_again(e: &io::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("try again") || msg.contains("temporary failure")
}

/// Resolver backed by the operating system's lookup.
pub struct SystemResolver {
    retries: u32,
    retry_delay: Duration,
}

impl SystemResolver {
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            retry_delay: Duration::from_millis(200),
        }
    }

    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let mut attempt = 0;
        loop {
            match tokio::net::lookup_host((host, 0)).await {
                Ok(addrs) => return Ok(addrs.map(|a| a.ip()).collect()),
                Err(e) if is_try_again(&e) && attempt < self.retries => {
                    attempt += 1;
                    debug!(host, attempt, "temporary DNS failure, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    return Err(DnsError::Lookup {
                        host: host.to_string(),
                        source: e,
                    })
                }
            }
        }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn resolve(&self, target: &AddressIdentity) -> Result<AddressIdentity, DnsError> {
        let host = target.hostname.as_deref().ok_or(DnsError::NoHostname)?;
        if let Ok(literal) = host.parse::<IpAddr>() {
            return Ok(with_address(target, literal));
        }

        let addrs = self.lookup(host).await?;
        trace!(host, ?addrs, "system lookup");
        let addr = pick_address(&addrs).ok_or_else(|| DnsError::NoAddresses(host.to_string()))?;
        Ok(with_address(target, addr))
    }
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

#[derive(Deserialize)]
struct DohAnswer {
    #[serde(rename = "TTL")]
    ttl: u32,
    data: String,
}

struct CacheEntry {
    ips: Vec<IpAddr>,
    expires: Instant,
}

/// DNS-over-HTTPS JSON resolver with a TTL cache.
pub struct DohResolver {
    client: reqwest::Client,
    endpoint: String,
    cache: Mutex<HashMap<String, CacheEntry>>,
    #[cfg(feature = "doh_fallback")]
    fallback: SystemResolver,
}

impl DohResolver {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            cache: Mutex::new(HashMap::new()),
            #[cfg(feature = "doh_fallback")]
            fallback: SystemResolver::default(),
        }
    }

    fn get_cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        let cache = self.cache.lock();
        let entry = cache.get(host)?;
        (entry.expires > Instant::now()).then(|| entry.ips.clone())
    }

    fn cache_result(&self, host: &str, ips: Vec<IpAddr>, ttl: u32) {
        let expires = Instant::now() + Duration::from_secs(u64::from(ttl));
        self.cache
            .lock()
            .insert(host.to_string(), CacheEntry { ips, expires });
    }

    async fn query(&self, host: &str) -> Option<Vec<IpAddr>> {
        for _ in 0..2 {
            let response = self
                .client
                .get(&self.endpoint)
                .query(&[("name", host), ("type", "A")])
                .header("Accept", "application/dns-json")
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            let body = match response {
                Ok(resp) => match resp.json::<DohResponse>().await {
                    Ok(body) => body,
                    Err(e) => {
                        debug!(host, "DoH response unreadable: {}", e);
                        continue;
                    }
                },
                Err(e) => {
                    debug!(host, "DoH request failed: {}", e);
                    continue;
                }
            };

            let mut ips = Vec::new();
            let mut min_ttl = 300u32;
            for answer in body.answer.unwrap_or_default() {
                if let Ok(ip) = answer.data.parse::<IpAddr>() {
                    ips.push(ip);
                    min_ttl = min_ttl.min(answer.ttl);
                }
            }
            if !ips.is_empty() {
                self.cache_result(host, ips.clone(), min_ttl);
                return Some(ips);
            }
        }
        None
    }
}

#[async_trait]
impl Resolver for DohResolver {
    fn name(&self) -> &'static str {
        "doh"
    }

    async fn resolve(&self, target: &AddressIdentity) -> Result<AddressIdentity, DnsError> {
        let host = target.hostname.as_deref().ok_or(DnsError::NoHostname)?;
        if let Ok(literal) = host.parse::<IpAddr>() {
            return Ok(with_address(target, literal));
        }

        let ips = match self.get_cached(host) {
            Some(ips) => Some(ips),
            None => self.query(host).await,
        };
        if let Some(addr) = ips.as_deref().and_then(pick_address) {
            return Ok(with_address(target, addr));
        }

        #[cfg(feature = "doh_fallback")]
        {
            self.fallback.resolve(target).await
        }
        #[cfg(not(feature = "doh_fallback"))]
        {
            Err(DnsError::Doh(host.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_prefers_ipv4() {
        let addrs: Vec<IpAddr> = vec!["::1".parse().unwrap(), "10.0.0.1".parse().unwrap()];
        assert_eq!(pick_address(&addrs), Some("10.0.0.1".parse().unwrap()));
        let v6_only: Vec<IpAddr> = vec!["::1".parse().unwrap()];
        assert_eq!(pick_address(&v6_only), Some("::1".parse().unwrap()));
        assert_eq!(pick_address(&[]), None);
    }

    #[test]
    fn test_try_again_detection() {
        let e = io::Error::new(
            io::ErrorKind::Other,
            "failed to lookup address information: Temporary failure in name resolution",
        );
        assert!(is_try_again(&e));
        let e = io::Error::new(io::ErrorKind::Other, "Name or service not known");
        assert!(!is_try_again(&e));
    }

    #[tokio::test]
    async fn test_system_resolver_literal_and_missing_name() {
        let resolver = SystemResolver::default();
        let literal = AddressIdentity::from_hostname("127.0.0.1", 8080);
        let out = resolver.resolve(&literal).await.unwrap();
        assert_eq!(out.address, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(out.hostname.as_deref(), Some("127.0.0.1"));
        assert_eq!(out.port, 8080);

        let unnamed = AddressIdentity::from_ipv4_octets([1, 1, 1, 1], 53);
        assert!(matches!(
            resolver.resolve(&unnamed).await,
            Err(DnsError::NoHostname)
        ));
    }

    #[tokio::test]
    async fn test_system_resolver_localhost() {
        let resolver = SystemResolver::default();
        let out = resolver
            .resolve(&AddressIdentity::from_hostname("localhost", 22))
            .await
            .unwrap();
        assert!(out.address.unwrap().is_loopback());
    }

    #[tokio::test]
    async fn test_doh_cache_hit_skips_network() {
        let resolver = DohResolver::new("http://127.0.0.1:9/dns-query");
        resolver.cache_result("cached.test", vec!["10.2.3.4".parse().unwrap()], 60);
        let out = resolver
            .resolve(&AddressIdentity::from_hostname("cached.test", 443))
            .await
            .unwrap();
        assert_eq!(out.address, Some("10.2.3.4".parse().unwrap()));
    }
}
