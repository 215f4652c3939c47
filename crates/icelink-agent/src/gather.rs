//! Host candidate gathering.
//!
//! One base per usable interface address. Loopback is never used, IPv6
//! only when enabled. An interface that cannot be bound is skipped.

use crate::base::Base;
use crate::candidate::Candidate;
use crate::error::{IceError, Result};
use std::borrow::Cow;
use std::net::{IpAddr, Ipv6Addr};

/// A local interface address as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    /// Interface name
    pub name: String,
    /// Address
    pub ip: IpAddr,
    /// Whether the interface is a loopback interface
    pub is_loopback: bool,
}

/// List the addresses of every local interface.
///
/// # Errors
///
/// `Transport` if the OS refuses to enumerate interfaces. This aborts the
/// agent.
pub fn enumerate_interfaces() -> Result<Vec<InterfaceAddr>> {
    let interfaces = if_addrs::get_if_addrs().map_err(|e| {
        IceError::Transport(Cow::Owned(format!("interface enumeration failed: {e}")))
    })?;

    Ok(interfaces
        .into_iter()
        .map(|iface| InterfaceAddr {
            is_loopback: iface.is_loopback(),
            ip: iface.ip(),
            name: iface.name,
        })
        .collect())
}

/// Addresses to open bases on, in interface order without duplicates.
#[must_use]
pub fn usable_addresses(interfaces: &[InterfaceAddr], enable_ipv6: bool) -> Vec<IpAddr> {
    let mut addrs: Vec<IpAddr> = Vec::new();
    for iface in interfaces {
        let usable = match iface.ip {
            _ if iface.is_loopback || iface.ip.is_loopback() || iface.ip.is_unspecified() => false,
            IpAddr::V4(_) => true,
            IpAddr::V6(v6) => enable_ipv6 && !is_unicast_link_local(&v6),
        };
        if !usable {
            tracing::trace!(interface = %iface.name, ip = %iface.ip, "Skipping interface address");
            continue;
        }
        if !addrs.contains(&iface.ip) {
            addrs.push(iface.ip);
        }
    }
    addrs
}

/// fe80::/10 needs a scope id to bind
fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Bind one base per address. Failures are logged and skipped.
pub async fn bind_bases(addrs: &[IpAddr], data_queue_capacity: usize) -> Vec<Base> {
    let mut bases = Vec::with_capacity(addrs.len());
    for ip in addrs {
        match Base::bind(*ip, data_queue_capacity).await {
            Ok(base) => {
                tracing::debug!(base = %base.local_addr(), "Base bound");
                bases.push(base);
            }
            Err(e) => {
                tracing::warn!(ip = %ip, "Skipping interface, bind failed: {}", e);
            }
        }
    }
    bases
}

/// Local preference for the base at `index`, distinct per base
#[must_use]
pub fn local_preference(index: usize) -> u16 {
    u16::MAX.saturating_sub(u16::try_from(index).unwrap_or(u16::MAX))
}

/// Host candidate for the base at `index`
#[must_use]
pub fn host_candidate(base: &Base, index: usize) -> Candidate {
    Candidate::host(base.local_addr(), local_preference(index))
}
