//! Local network address discovery.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// This host's address on the local network plus the subnet broadcast address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAddress {
    pub ip: IpAddr,
    pub broadcast: IpAddr,
}

impl NetworkAddress {
    /// Build from a known address and netmask.
    pub fn new(ip: IpAddr, netmask: Ipv4Addr) -> Self {
        let broadcast = match ip {
            IpAddr::V4(v4) => IpAddr::V4(broadcast_address(v4, netmask)),
            // No broadcast in IPv6; fall back to the limited broadcast address.
            IpAddr::V6(_) => IpAddr::V4(Ipv4Addr::BROADCAST),
        };
        Self { ip, broadcast }
    }

    /// Detect the address of the interface holding the default route.
    ///
    /// Connecting a UDP socket only consults the routing table, nothing is
    /// sent.
    pub fn detect(netmask: Ipv4Addr) -> io::Result<Self> {
        let probe = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        probe.connect(SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 80)))?;
        let ip = probe.local_addr()?.ip();
        if ip.is_unspecified() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no routable local address",
            ));
        }
        Ok(Self::new(ip, netmask))
    }

    /// Use `advertised` when set, otherwise detect.
    pub fn resolve(advertised: Option<IpAddr>, netmask: Ipv4Addr) -> io::Result<Self> {
        match advertised {
            Some(ip) => Ok(Self::new(ip, netmask)),
            None => Self::detect(netmask),
        }
    }
}

/// `ip | !mask`, octet by octet.
pub fn broadcast_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let ip = ip.octets();
    let mask = netmask.octets();
    Ipv4Addr::new(
        ip[0] | !mask[0],
        ip[1] | !mask[1],
        ip[2] | !mask[2],
        ip[3] | !mask[3],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_for_class_c() {
        assert_eq!(
            broadcast_address(Ipv4Addr::new(192, 168, 1, 37), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
    }

    #[test]
    fn broadcast_for_wide_mask() {
        assert_eq!(
            broadcast_address(Ipv4Addr::new(10, 4, 200, 1), Ipv4Addr::new(255, 240, 0, 0)),
            Ipv4Addr::new(10, 15, 255, 255)
        );
    }

    #[test]
    fn advertised_address_skips_detection() {
        let addr = NetworkAddress::resolve(
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            Ipv4Addr::new(255, 0, 0, 0),
        )
        .unwrap();
        assert_eq!(addr.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(addr.broadcast, IpAddr::V4(Ipv4Addr::new(127, 255, 255, 255)));
    }
}
