use std::net::Ipv4Addr;

use vpnctl_core::VpnctlError;
use vpnctl_store::{IpAllocGuard, Store};

fn parse_cidr(cidr: &str) -> Result<(u32, u32), VpnctlError> {
    let (addr_str, prefix_str) = cidr
        .split_once('/')
        .ok_or_else(|| VpnctlError::Other(format!("not a CIDR: {cidr}")))?;
    let addr: Ipv4Addr = addr_str
        .parse()
        .map_err(|e| VpnctlError::Other(format!("invalid network address {addr_str}: {e}")))?;
    let prefix: u32 = prefix_str
        .parse()
        .map_err(|e| VpnctlError::Other(format!("invalid prefix {prefix_str}: {e}")))?;
    if prefix > 32 {
        return Err(VpnctlError::Other(format!("invalid prefix length {prefix}")));
    }
    let mask: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    Ok((u32::from(addr) & mask, mask))
}

/// Every usable host address in `cidr`, excluding the network and broadcast
/// addresses (mirrors Python's `ipaddress.ip_network(...).hosts()`).
fn hosts(cidr: &str) -> Result<Vec<Ipv4Addr>, VpnctlError> {
    let (network, mask) = parse_cidr(cidr)?;
    let broadcast = network | !mask;
    if broadcast <= network + 1 {
        return Ok(Vec::new());
    }
    Ok((network + 1..broadcast).map(Ipv4Addr::from).collect())
}

/// Scans the WireGuard client network host by host and returns the first
/// address with no active subscription bound to it. Must be called with the
/// store's IP allocation advisory lock already held — the scan and the
/// eventual `INSERT`/`UPDATE` that claims the address need to observe a
/// consistent view of `is_vpn_ip_used` across concurrent callers.
///
/// `network_prefix`/`cidr` describe the pool (`WG_CLIENT_NETWORK_PREFIX`/
/// `WG_CLIENT_NETWORK_CIDR`); `ip_start` is the first host octet considered
/// (`WG_CLIENT_IP_START`), which lets the server's own address at the start
/// of the range be skipped without a special case in the scan.
pub async fn allocate_client_ip(
    store: &Store,
    guard: &mut IpAllocGuard,
    network_prefix: &str,
    cidr: u8,
    ip_start: u8,
) -> Result<String, VpnctlError> {
    let cidr_spec = format!("{network_prefix}/{cidr}");
    let (network, _) = parse_cidr(&cidr_spec)?;
    let first_offered = network + u32::from(ip_start);

    for ip in hosts(&cidr_spec)? {
        if u32::from(ip) < first_offered {
            continue;
        }
        let candidate = ip.to_string();
        if !store.is_vpn_ip_used(guard, &candidate).await? {
            return Ok(candidate);
        }
    }

    Err(VpnctlError::NoFreeAddresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_excludes_network_and_broadcast() {
        let addrs = hosts("10.8.0.0/30").unwrap();
        // /30 has 4 addresses total: network, 2 hosts, broadcast.
        assert_eq!(addrs, vec![Ipv4Addr::new(10, 8, 0, 1), Ipv4Addr::new(10, 8, 0, 2)]);
    }

    #[test]
    fn hosts_of_default_network_starts_after_server_ip() {
        let addrs = hosts(vpnctl_core::DEFAULT_WG_NETWORK_CIDR).unwrap();
        assert_eq!(addrs[0], Ipv4Addr::new(10, 8, 0, 1));
        assert!(addrs.len() > 60000);
    }

    #[test]
    fn first_offered_skips_server_address_across_a_sixteen() {
        let (network, _) = parse_cidr("10.8.0.0/16").unwrap();
        let first_offered = network + 2u32;
        assert_eq!(Ipv4Addr::from(first_offered), Ipv4Addr::new(10, 8, 0, 2));

        // A candidate in a later /24 block must never be skipped just
        // because its own last octet is below `ip_start`.
        let later_block: u32 = Ipv4Addr::new(10, 8, 1, 1).into();
        assert!(later_block >= first_offered);
    }
}
