//! Protocol counters
//!
//! All counters are 16 bits wide and wrap.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpStats {
    pub recv: u16,
    pub sent: u16,
    pub drop: u16,
    /// Wrong version or header length.
    pub vhlerr: u16,
    /// Too short to hold a header.
    pub hblenerr: u16,
    /// Declared length exceeds the received length.
    pub lblenerr: u16,
    /// Fragment received with reassembly disabled.
    pub fragerr: u16,
    pub chkerr: u16,
    /// Unsupported protocol.
    pub protoerr: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IcmpStats {
    pub recv: u16,
    pub sent: u16,
    pub drop: u16,
    pub typeerr: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStats {
    pub recv: u16,
    pub sent: u16,
    pub drop: u16,
    pub chkerr: u16,
    /// Acknowledgement that did not cover our outstanding data.
    pub ackerr: u16,
    /// Resets sent.
    pub rst: u16,
    pub rexmit: u16,
    /// SYN dropped for lack of a free connection slot.
    pub syndrop: u16,
    /// SYN to a port nobody listens on.
    pub synrst: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpStats {
    pub recv: u16,
    pub sent: u16,
    pub drop: u16,
    pub chkerr: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub ip: IpStats,
    pub icmp: IcmpStats,
    pub tcp: TcpStats,
    pub udp: UdpStats,
}

#[inline]
pub(crate) fn bump(counter: &mut u16) {
    *counter = counter.wrapping_add(1);
}
