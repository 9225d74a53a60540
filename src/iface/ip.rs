use crate::network::ethernet::EthernetAddress;
use crate::network::ipv4::Ipv4Address;

/// Addressing of the local host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostAddresses {
    pub mac: EthernetAddress,
    pub ip: Ipv4Address,
    pub netmask: Ipv4Address,
    /// Default router for destinations outside the local subnet.
    pub gateway: Ipv4Address,
}

impl HostAddresses {
    /// Whether `addr` is reachable without going through the gateway.
    pub fn is_local(&self, addr: Ipv4Address) -> bool {
        addr.same_network(self.ip, self.netmask)
    }
}
