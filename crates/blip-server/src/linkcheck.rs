//! Target checks for plaintext links.
//!
//! Redirects are served to anyone holding the code, so a link must not point
//! into the server's own network.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

#[async_trait]
pub trait LinkPolicy: Send + Sync + 'static {
    /// Accept or refuse `url` as a redirect target.
    async fn check(&self, url: &str) -> Result<()>;
}

/// Accepts every target.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl LinkPolicy for AllowAll {
    async fn check(&self, _url: &str) -> Result<()> {
        Ok(())
    }
}

/// Accepts http(s) URLs whose host is, and resolves to, public addresses
/// only. A host that does not resolve is accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicOnly;

#[async_trait]
impl LinkPolicy for PublicOnly {
    async fn check(&self, raw: &str) -> Result<()> {
        let parsed =
            Url::parse(raw).map_err(|e| Error::InvalidInput(format!("invalid URL format: {e}")))?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Error::InvalidInput(
                "invalid URL scheme: only http and https are allowed".into(),
            ));
        }

        let host = match parsed.host() {
            Some(url::Host::Domain(d)) if !d.is_empty() => d.to_owned(),
            Some(url::Host::Ipv4(ip)) => return ensure_public(IpAddr::V4(ip)),
            Some(url::Host::Ipv6(ip)) => return ensure_public(IpAddr::V6(ip)),
            _ => return Err(Error::InvalidInput("URL must have a valid hostname".into())),
        };

        let port = parsed.port_or_known_default().unwrap_or(80);
        let addrs = match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(host = %host, error = %e, "link host did not resolve; allowing");
                return Ok(());
            }
        };
        for addr in addrs {
            ensure_public(addr.ip())?;
        }
        Ok(())
    }
}

fn ensure_public(ip: IpAddr) -> Result<()> {
    if is_internal(ip) {
        return Err(Error::InvalidInput(format!(
            "URL points to internal/private IP address: {ip}"
        )));
    }
    Ok(())
}

const INTERNAL_V4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(224, 0, 0, 0), 4),
    (Ipv4Addr::new(240, 0, 0, 0), 4),
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(255, 255, 255, 255), 32),
];

const INTERNAL_V6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::LOCALHOST, 128),
    (Ipv6Addr::UNSPECIFIED, 128),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0x0100, 0, 0, 0, 0, 0, 0, 0), 64),
    (Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0x2001, 0x0010, 0, 0, 0, 0, 0, 0), 28),
    (Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8),
];

pub fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => in_v4_ranges(v4),
        // IPv4-mapped addresses are judged by the address they carry.
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => in_v4_ranges(v4),
            None => {
                let bits = u128::from(v6);
                INTERNAL_V6.iter().any(|(net, prefix)| {
                    let mask = u128::MAX.checked_shl(128 - u32::from(*prefix)).unwrap_or(0);
                    bits & mask == u128::from(*net) & mask
                })
            }
        },
    }
}

fn in_v4_ranges(v4: Ipv4Addr) -> bool {
    let bits = u32::from(v4);
    INTERNAL_V4.iter().any(|(net, prefix)| {
        let mask = u32::MAX.checked_shl(32 - u32::from(*prefix)).unwrap_or(0);
        bits & mask == u32::from(*net) & mask
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn internal_v4_ranges() {
        for addr in [
            "10.1.2.3",
            "172.31.255.255",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.169.254",
            "100.64.0.1",
            "198.19.0.1",
            "0.0.0.0",
            "255.255.255.255",
            "239.1.1.1",
        ] {
            assert!(is_internal(ip(addr)), "{addr} should be internal");
        }
        for addr in ["8.8.8.8", "172.32.0.1", "100.128.0.1", "1.1.1.1"] {
            assert!(!is_internal(ip(addr)), "{addr} should be public");
        }
    }

    #[test]
    fn internal_v6_ranges() {
        for addr in ["::1", "::", "fe80::1", "fd00::1", "2001:db8::1", "ff02::1", "2001::1"] {
            assert!(is_internal(ip(addr)), "{addr} should be internal");
        }
        assert!(!is_internal(ip("2606:4700:4700::1111")));
    }

    #[test]
    fn mapped_v4_uses_embedded_address() {
        assert!(is_internal(ip("::ffff:127.0.0.1")));
        assert!(!is_internal(ip("::ffff:8.8.8.8")));
    }

    #[tokio::test]
    async fn public_only_rejects_bad_urls() {
        let policy = PublicOnly;
        assert!(policy.check("not a url").await.is_err());
        assert!(policy.check("ftp://example.com/file").await.is_err());
        assert!(policy.check("javascript:alert(1)").await.is_err());
        assert!(policy.check("http://127.0.0.1:8080/admin").await.is_err());
        assert!(policy.check("http://[::1]/").await.is_err());
        assert!(policy.check("http://169.254.169.254/latest").await.is_err());
    }

    #[tokio::test]
    async fn public_only_accepts_public_literals_and_unresolvable_hosts() {
        let policy = PublicOnly;
        policy.check("https://8.8.8.8/").await.unwrap();
        policy.check("https://does-not-exist.invalid/").await.unwrap();
    }

    #[tokio::test]
    async fn localhost_is_rejected_after_resolution() {
        assert!(PublicOnly.check("http://localhost:9000/").await.is_err());
    }

    #[tokio::test]
    async fn allow_all_accepts_anything() {
        AllowAll.check("http://127.0.0.1/").await.unwrap();
    }
}
