use local_ip_address::{list_afinet_netifas, local_ip};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use str0m::Candidate;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::error::{RelayError, RelayResult};

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Pick an IPv4 address that can be shared with the gateway as an ICE host
/// candidate.
///
/// Prefers the address of the default route, then the first routable
/// interface, and finally loopback, which still works against a gateway on
/// the same machine.
pub fn select_host_address() -> IpAddr {
    if let Ok(ip @ IpAddr::V4(v4)) = local_ip() {
        if !v4.is_loopback() && !v4.is_link_local() {
            return ip;
        }
    }

    if let Ok(network_interfaces) = list_afinet_netifas() {
        for (name, ip) in network_interfaces {
            debug!("iface: {} / {:?}", name, ip);
            if let IpAddr::V4(v4) = ip {
                if !v4.is_loopback() && !v4.is_link_local() && !v4.is_broadcast() {
                    return ip;
                }
            }
        }
    }

    warn!("Found no routable interface, using loopback");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// The host candidate for a bound socket address.
pub fn host_candidate(addr: SocketAddr) -> RelayResult<Candidate> {
    Candidate::host(addr, str0m::net::Protocol::Udp)
        .map_err(|e| RelayError::Config(format!("{addr} is not a usable candidate: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selected_address_is_ipv4() {
        assert!(select_host_address().is_ipv4());
    }

    #[test]
    fn candidate_keeps_the_socket_address() {
        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        assert_eq!(host_candidate(addr).unwrap().addr(), addr);
    }
}
