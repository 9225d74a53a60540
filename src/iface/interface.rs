//! Network interface and packet processing
//!
//! [`NetworkInterface`] is the whole engine: the shared packet buffer, the
//! connection tables, the ARP cache and the counters. Every entry point takes
//! `&mut self`, so at most one stimulus is ever in flight.
//!
//! It handles:
//! - IPv4 reception and validation, with optional fragment reassembly
//! - Protocol dispatch (ICMP, TCP, UDP)
//! - ICMP echo request/reply, rewritten in place
//! - TCP demultiplexing, handshake, retransmission and teardown
//! - UDP demultiplexing and replies
//!
//! A driver either feeds raw Ethernet frames through
//! [`handle_frame`](NetworkInterface::handle_frame) and the periodic helpers,
//! or calls [`process`](NetworkInterface::process) itself and does the link
//! layer on its own.

use core::ops::Range;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::iface::app::{AppEvents, AppReply, Application, TcpIo, UdpIo};
use crate::iface::buffer::{
    PacketBuffer, IPH_LEN, IP_OFFSET, LLH_LEN, TCPIP_HLEN, TCP_APPDATA, TRANSPORT_OFFSET, UDPIP_HLEN, UDP_APPDATA,
};
use crate::iface::ip::HostAddresses;
use crate::iface::stats::{bump, Stats};
use crate::network::arp::ArpTable;
use crate::network::ethernet::{EthernetAddress, EthernetHeader, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::network::fragment::Reassembler;
use crate::network::icmp::{self, IcmpHeader, ICMP_HEADER_LEN};
use crate::network::ipv4::{self, protocol, Ipv4Address, Ipv4Header, VERSION_IHL};
use crate::network::{checksum_field, ip_checksum, tcp_checksum, udp_checksum};
use crate::transport::tcp::{
    self, backoff, flags, parse_mss_option, transition, Action, ConnId, Connection, Event, Segment, TcpHeader,
    TcpState, TCP_HEADER_LEN, TCP_OPT_MSS, TCP_OPT_MSS_LEN,
};
use crate::transport::udp::{UdpConnId, UdpConnection, UdpHeader, UDP_HEADER_LEN};

const FIRST_EPHEMERAL_PORT: u16 = 1024;
const LAST_EPHEMERAL_PORT: u16 = 32000;

/// What the engine is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stimulus {
    /// An IPv4 datagram of this many bytes sits after the link header.
    Data(usize),
    /// Periodic tick for one TCP connection. The tick for connection 0 also
    /// ages the fragment reassembly buffer.
    Timer(ConnId),
    /// Poll an idle connection without running its timers.
    PollRequest(ConnId),
    /// Periodic tick for one UDP connection.
    UdpTimer(UdpConnId),
}

/// Network interface for packet processing
#[derive(Debug)]
pub struct NetworkInterface {
    config: Config,
    host: HostAddresses,
    buffer: PacketBuffer,
    connections: Vec<Connection>,
    listen_ports: Vec<Option<u16>>,
    udp_connections: Vec<UdpConnection>,
    arp: ArpTable,
    reassembler: Option<Reassembler>,
    /// Initial sequence number for the next connection.
    iss: u32,
    ip_id: u16,
    last_port: u16,
    stats: Stats,
}

fn change_state(id: ConnId, conn: &mut Connection, next: TcpState) {
    if conn.state == next {
        return;
    }
    debug!("tcp: connection {} {} -> {}", id.0, conn.state, next);
    match next {
        TcpState::TimeWait => {
            conn.timer = 0;
            conn.len = 0;
        }
        TcpState::FinWait2 => conn.len = 0,
        _ => {}
    }
    conn.state = next;
}

impl NetworkInterface {
    /// Create an engine with every table sized from `config`.
    pub fn new(config: Config, host: HostAddresses) -> Result<Self> {
        config.validate()?;
        let udp_slots = if config.udp { config.udp_connections } else { 0 };
        let reassembler = if config.reassembly {
            Some(Reassembler::new(config.buffer_size - LLH_LEN, config.reassembly_max_age))
        } else {
            None
        };
        Ok(NetworkInterface {
            host,
            buffer: PacketBuffer::new(config.buffer_size),
            connections: vec![Connection::closed(); config.max_connections],
            listen_ports: vec![None; config.max_listen_ports],
            udp_connections: vec![UdpConnection::unbound(); udp_slots],
            arp: ArpTable::new(config.arp_table_size, config.arp_max_age),
            reassembler,
            iss: 0,
            ip_id: 0,
            last_port: FIRST_EPHEMERAL_PORT,
            stats: Stats::default(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> &HostAddresses {
        &self.host
    }

    pub fn set_host_addr(&mut self, ip: Ipv4Address) {
        self.host.ip = ip;
    }

    pub fn set_netmask(&mut self, netmask: Ipv4Address) {
        self.host.netmask = netmask;
    }

    pub fn set_default_router(&mut self, gateway: Ipv4Address) {
        self.host.gateway = gateway;
    }

    pub fn set_ethernet_addr(&mut self, mac: EthernetAddress) {
        self.host.mac = mac;
    }

    /// Seed the IP identification counter.
    pub fn set_ip_id(&mut self, id: u16) {
        self.ip_id = id;
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn arp_table(&self) -> &ArpTable {
        &self.arp
    }

    /// The whole packet buffer, link header included.
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    /// Bytes left in the buffer for transmission by the last call: an IPv4
    /// datagram after [`process`](Self::process), a whole frame after
    /// [`handle_frame`](Self::handle_frame) and the periodic calls.
    pub fn output_len(&self) -> usize {
        self.buffer.len
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(id.0)
    }

    pub fn connections(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.connections.iter().enumerate().map(|(i, conn)| (ConnId(i), conn))
    }

    pub fn udp_connection(&self, id: UdpConnId) -> Option<&UdpConnection> {
        self.udp_connections.get(id.0)
    }

    pub fn listen(&mut self, port: u16) -> Result<()> {
        if self.listen_ports.contains(&Some(port)) {
            return Err(Error::PortInUse);
        }
        let slot = self.listen_ports.iter_mut().find(|slot| slot.is_none()).ok_or(Error::NoFreeListenSlot)?;
        *slot = Some(port);
        debug!("tcp: listening on port {}", port);
        Ok(())
    }

    pub fn unlisten(&mut self, port: u16) {
        for slot in self.listen_ports.iter_mut().filter(|slot| **slot == Some(port)) {
            *slot = None;
        }
    }

    /// A CLOSED slot, or else the TIME_WAIT slot that has waited longest.
    fn free_slot(&self) -> Option<usize> {
        let mut candidate: Option<usize> = None;
        for (i, conn) in self.connections.iter().enumerate() {
            match conn.state {
                TcpState::Closed => return Some(i),
                TcpState::TimeWait => {
                    if candidate.map_or(true, |c| conn.timer > self.connections[c].timer) {
                        candidate = Some(i);
                    }
                }
                _ => {}
            }
        }
        candidate
    }

    fn next_port(&mut self, in_use: impl Fn(&Self, u16) -> bool) -> u16 {
        loop {
            self.last_port += 1;
            if self.last_port >= LAST_EPHEMERAL_PORT {
                self.last_port = FIRST_EPHEMERAL_PORT;
            }
            let port = self.last_port;
            if !in_use(&*self, port) {
                return port;
            }
        }
    }

    /// Open a connection to `remote:port`. The SYN goes out on the
    /// connection's next periodic ticks.
    pub fn connect(&mut self, remote: Ipv4Address, port: u16) -> Result<ConnId> {
        let slot = self.free_slot().ok_or(Error::NoFreeConnection)?;
        let local_port = self.next_port(|engine, p| {
            engine.connections.iter().any(|c| !c.is_closed() && c.local_port == p)
        });
        let mss = self.config.tcp_mss;
        self.connections[slot] = Connection {
            remote_addr: remote,
            local_port,
            remote_port: port,
            rcv_nxt: 0,
            snd_nxt: self.iss,
            // The SYN occupies one sequence number.
            len: 1,
            mss,
            initial_mss: mss,
            sa: 0,
            sv: 16,
            rto: self.config.rto,
            state: TcpState::SynSent,
            stopped: false,
            timer: 1,
            nrtx: 0,
        };
        debug!("tcp: connection {} connecting {}:{} from port {}", slot, remote, port, local_port);
        Ok(ConnId(slot))
    }

    /// Bind a UDP connection to `remote:port` on an ephemeral local port.
    /// An unspecified remote address or a zero port accepts any peer.
    pub fn udp_new(&mut self, remote: Ipv4Address, port: u16) -> Result<UdpConnId> {
        let slot = self
            .udp_connections
            .iter()
            .position(|c| !c.is_bound())
            .ok_or(Error::NoFreeUdpConnection)?;
        let local_port = self.next_port(|engine, p| engine.udp_connections.iter().any(|c| c.local_port == p));
        self.udp_connections[slot] = UdpConnection {
            remote_addr: remote,
            local_port,
            remote_port: port,
            ttl: self.config.ttl,
        };
        Ok(UdpConnId(slot))
    }

    pub fn udp_bind(&mut self, id: UdpConnId, port: u16) -> Result<()> {
        if self
            .udp_connections
            .iter()
            .enumerate()
            .any(|(i, c)| i != id.0 && c.is_bound() && c.local_port == port)
        {
            return Err(Error::PortInUse);
        }
        let conn = self.udp_connections.get_mut(id.0).ok_or(Error::NoFreeUdpConnection)?;
        conn.local_port = port;
        Ok(())
    }

    pub fn udp_remove(&mut self, id: UdpConnId) {
        if let Some(conn) = self.udp_connections.get_mut(id.0) {
            conn.local_port = 0;
        }
    }

    /// Run the engine once.
    ///
    /// Returns the length of the IPv4 datagram to transmit, written after the
    /// link header, or 0 when there is nothing to send.
    pub fn process<A: Application>(&mut self, stimulus: Stimulus, app: &mut A) -> usize {
        let out = match stimulus {
            Stimulus::Data(len) => self.ip_input(len, app),
            Stimulus::Timer(id) if id.0 < self.connections.len() => self.tcp_timer(id, app),
            Stimulus::PollRequest(id) if id.0 < self.connections.len() => self.tcp_poll(id, app),
            Stimulus::UdpTimer(id) if id.0 < self.udp_connections.len() => self.udp_poll(id, app),
            _ => 0,
        };
        if out > 0 {
            bump(&mut self.stats.ip.sent);
        }
        self.buffer.len = out;
        out
    }

    /// Handle the Ethernet frame of `len` bytes sitting in the buffer.
    ///
    /// Returns the length of the frame to transmit from the buffer, or 0.
    pub fn handle_frame<A: Application>(&mut self, len: usize, app: &mut A) -> usize {
        let len = len.min(self.buffer.capacity());
        let ethertype = EthernetHeader::from_bytes(&self.buffer.data[..len]).map(|header| header.ethertype);
        let out = match ethertype {
            Some(ETHERTYPE_IPV4) => {
                self.arp.ip_input(&self.host, &self.buffer.data[..len]);
                let out = self.process(Stimulus::Data(len - LLH_LEN), app);
                self.link_output(out)
            }
            Some(ETHERTYPE_ARP) => self.arp.arp_input(&self.host, &mut self.buffer.data, len),
            Some(other) => {
                trace!("eth: ignoring ethertype {:#06x}", other);
                0
            }
            None => 0,
        };
        self.buffer.len = out;
        out
    }

    /// Prepend the link header to `ip_len` bytes of output. May replace the
    /// packet by an ARP request.
    fn link_output(&mut self, ip_len: usize) -> usize {
        let len = if ip_len == 0 {
            0
        } else {
            self.arp.arp_output(&self.host, &mut self.buffer.data, ip_len)
        };
        self.buffer.len = len;
        len
    }

    /// Run the timers of every TCP connection, handing each frame produced
    /// to `transmit`. Call this on a fixed cadence.
    pub fn periodic<A, F>(&mut self, app: &mut A, mut transmit: F)
    where
        A: Application,
        F: FnMut(&[u8]),
    {
        for i in 0..self.connections.len() {
            let out = self.process(Stimulus::Timer(ConnId(i)), app);
            let len = self.link_output(out);
            if len > 0 {
                transmit(&self.buffer.data[..len]);
            }
        }
    }

    /// Poll every bound UDP connection, handing each frame produced to
    /// `transmit`.
    pub fn udp_periodic<A, F>(&mut self, app: &mut A, mut transmit: F)
    where
        A: Application,
        F: FnMut(&[u8]),
    {
        for i in 0..self.udp_connections.len() {
            let out = self.process(Stimulus::UdpTimer(UdpConnId(i)), app);
            let len = self.link_output(out);
            if len > 0 {
                transmit(&self.buffer.data[..len]);
            }
        }
    }

    /// Age the ARP cache. Call this about every ten seconds.
    pub fn arp_timer(&mut self) {
        self.arp.timer();
    }

    fn ip_drop(&mut self) -> usize {
        bump(&mut self.stats.ip.drop);
        0
    }

    fn ip_input<A: Application>(&mut self, len: usize, app: &mut A) -> usize {
        bump(&mut self.stats.ip.recv);
        let avail = len.min(self.buffer.capacity() - LLH_LEN);
        if avail < IPH_LEN {
            trace!("ip: short packet ({} bytes)", avail);
            bump(&mut self.stats.ip.hblenerr);
            return self.ip_drop();
        }

        let packet = &self.buffer.data[IP_OFFSET..];
        if packet[ipv4::field::VER_IHL] != VERSION_IHL {
            trace!("ip: invalid version or header length {:#04x}", packet[ipv4::field::VER_IHL]);
            bump(&mut self.stats.ip.vhlerr);
            return self.ip_drop();
        }
        let header = match Ipv4Header::from_bytes(packet) {
            Some(header) => header,
            None => return self.ip_drop(),
        };
        let mut ip_len = header.total_len as usize;
        if ip_len > avail || ip_len < IPH_LEN {
            trace!("ip: declared length {} but received {}", ip_len, avail);
            bump(&mut self.stats.ip.lblenerr);
            return self.ip_drop();
        }

        if header.is_fragment() {
            match self.reassembler.as_mut() {
                Some(reassembler) => {
                    ip_len = reassembler.input(&mut self.buffer.data[IP_OFFSET..]);
                    if ip_len == 0 {
                        return 0;
                    }
                }
                None => {
                    trace!("ip: fragment dropped, reassembly disabled");
                    bump(&mut self.stats.ip.fragerr);
                    return self.ip_drop();
                }
            }
        }

        let broadcast_udp = self.config.broadcast && header.protocol == protocol::UDP && header.dst_addr.is_broadcast();
        if !broadcast_udp && header.dst_addr != self.host.ip {
            trace!("ip: packet for {} is not for us", header.dst_addr);
            return self.ip_drop();
        }

        if ip_checksum(&self.buffer.data[IP_OFFSET..]) != 0xFFFF {
            debug!("ip: bad checksum from {}", header.src_addr);
            bump(&mut self.stats.ip.chkerr);
            return self.ip_drop();
        }

        match header.protocol {
            protocol::TCP => self.tcp_input(ip_len, header.src_addr, header.dst_addr, app),
            protocol::UDP if self.config.udp => self.udp_input(ip_len, header.src_addr, header.dst_addr, app),
            protocol::ICMP => self.icmp_input(ip_len),
            other => {
                trace!("ip: unsupported protocol {}", other);
                bump(&mut self.stats.ip.protoerr);
                self.ip_drop()
            }
        }
    }

    fn icmp_input(&mut self, ip_len: usize) -> usize {
        bump(&mut self.stats.icmp.recv);
        if ip_len < IPH_LEN + ICMP_HEADER_LEN {
            bump(&mut self.stats.icmp.drop);
            return 0;
        }
        let data = &mut self.buffer.data;
        let msg = TRANSPORT_OFFSET;
        match IcmpHeader::from_bytes(&data[msg..IP_OFFSET + ip_len]) {
            Some(header) if header.is_echo_request() => {}
            header => {
                trace!("icmp: unsupported message {:?}", header);
                bump(&mut self.stats.icmp.typeerr);
                bump(&mut self.stats.icmp.drop);
                return 0;
            }
        }
        icmp::echo_request_to_reply(&mut data[msg..IP_OFFSET + ip_len]);

        // Swapping the addresses leaves the header sum unchanged.
        let src = IP_OFFSET + ipv4::field::SRC_ADDR.start;
        let dst = IP_OFFSET + ipv4::field::DST_ADDR.start;
        let mut addr = [0u8; 4];
        addr.copy_from_slice(&data[src..src + 4]);
        data.copy_within(dst..dst + 4, src);
        data[dst..dst + 4].copy_from_slice(&addr);
        bump(&mut self.stats.icmp.sent);
        ip_len
    }

    /// Fill in the IPv4 header for `payload_len` bytes to `dst`.
    fn ip_header(&mut self, proto: u8, dst: Ipv4Address, payload_len: usize, ttl: u8) -> usize {
        self.ip_id = self.ip_id.wrapping_add(1);
        let mut header = Ipv4Header::new(proto, self.host.ip, dst, payload_len as u16, ttl);
        header.id = self.ip_id;
        header.write_to(&mut self.buffer.data[IP_OFFSET..]);
        IPH_LEN + payload_len
    }

    fn udp_input<A: Application>(&mut self, ip_len: usize, src: Ipv4Address, dst: Ipv4Address, app: &mut A) -> usize {
        bump(&mut self.stats.udp.recv);
        let header = match UdpHeader::from_bytes(&self.buffer.data[TRANSPORT_OFFSET..]) {
            Some(header) if ip_len >= UDPIP_HLEN => header,
            _ => {
                bump(&mut self.stats.udp.drop);
                return 0;
            }
        };
        let udp_len = header.length as usize;
        if udp_len < UDP_HEADER_LEN || udp_len > ip_len - IPH_LEN {
            trace!("udp: bad length {}", udp_len);
            bump(&mut self.stats.udp.drop);
            return 0;
        }
        if self.config.udp_checksums
            && header.checksum != 0
            && udp_checksum(src, dst, &self.buffer.data[TRANSPORT_OFFSET..TRANSPORT_OFFSET + udp_len]) != 0xFFFF
        {
            debug!("udp: bad checksum from {}:{}", src, header.src_port);
            bump(&mut self.stats.udp.chkerr);
            bump(&mut self.stats.udp.drop);
            return 0;
        }

        let slot = match self
            .udp_connections
            .iter()
            .position(|c| c.accepts(header.dst_port, src, header.src_port))
        {
            Some(slot) => slot,
            None => {
                trace!("udp: no connection for port {}", header.dst_port);
                bump(&mut self.stats.udp.drop);
                return 0;
            }
        };

        let mut io = UdpIo {
            buf: &mut self.buffer.data[UDP_APPDATA..],
            data_len: udp_len - UDP_HEADER_LEN,
            remote_addr: src,
            remote_port: header.src_port,
            send_len: 0,
        };
        app.udp_event(UdpConnId(slot), AppEvents::NEWDATA, &mut io);
        let (send_len, remote, port) = (io.send_len, io.remote_addr, io.remote_port);
        self.udp_send(UdpConnId(slot), remote, port, send_len)
    }

    fn udp_poll<A: Application>(&mut self, id: UdpConnId, app: &mut A) -> usize {
        let conn = &self.udp_connections[id.0];
        if !conn.is_bound() {
            return 0;
        }
        let mut io = UdpIo {
            buf: &mut self.buffer.data[UDP_APPDATA..],
            data_len: 0,
            remote_addr: conn.remote_addr,
            remote_port: conn.remote_port,
            send_len: 0,
        };
        app.udp_event(id, AppEvents::POLL, &mut io);
        let (send_len, remote, port) = (io.send_len, io.remote_addr, io.remote_port);
        self.udp_send(id, remote, port, send_len)
    }

    fn udp_send(&mut self, id: UdpConnId, remote: Ipv4Address, port: u16, payload_len: usize) -> usize {
        if payload_len == 0 {
            return 0;
        }
        let conn = &self.udp_connections[id.0];
        let udp_len = UDP_HEADER_LEN + payload_len;
        let (local_port, ttl) = (conn.local_port, conn.ttl);
        UdpHeader {
            src_port: local_port,
            dst_port: port,
            length: udp_len as u16,
            checksum: 0,
        }
        .write_to(&mut self.buffer.data[TRANSPORT_OFFSET..]);
        let ip_len = self.ip_header(protocol::UDP, remote, udp_len, ttl);
        if self.config.udp_checksums {
            let sum = udp_checksum(
                self.host.ip,
                remote,
                &self.buffer.data[TRANSPORT_OFFSET..TRANSPORT_OFFSET + udp_len],
            );
            let at = TRANSPORT_OFFSET + 6;
            BigEndian::write_u16(&mut self.buffer.data[at..at + 2], checksum_field(sum));
        }
        bump(&mut self.stats.udp.sent);
        ip_len
    }

    fn tcp_input<A: Application>(&mut self, ip_len: usize, src: Ipv4Address, dst: Ipv4Address, app: &mut A) -> usize {
        bump(&mut self.stats.tcp.recv);
        if ip_len < TCPIP_HLEN {
            bump(&mut self.stats.tcp.drop);
            return 0;
        }
        if tcp_checksum(src, dst, &self.buffer.data[TRANSPORT_OFFSET..IP_OFFSET + ip_len]) != 0xFFFF {
            debug!("tcp: bad checksum from {}", src);
            bump(&mut self.stats.tcp.chkerr);
            bump(&mut self.stats.tcp.drop);
            return 0;
        }
        let header = match TcpHeader::from_bytes(&self.buffer.data[TRANSPORT_OFFSET..]) {
            Some(header) if header.header_len() >= TCP_HEADER_LEN && IPH_LEN + header.header_len() <= ip_len => header,
            _ => {
                bump(&mut self.stats.tcp.drop);
                return 0;
            }
        };

        if let Some(slot) = self
            .connections
            .iter()
            .position(|c| c.matches(header.dst_port, src, header.src_port))
        {
            let data_len = ip_len - IPH_LEN - header.header_len();
            return self.tcp_segment(ConnId(slot), &header, data_len, app);
        }

        // Anything but a bare SYN is a stray segment from an old connection.
        if header.flags & flags::CTL != flags::SYN {
            return self.tcp_reset(&header, src);
        }
        if self.listen_ports.contains(&Some(header.dst_port)) {
            return self.tcp_accept(&header, src);
        }
        trace!("tcp: SYN to closed port {}", header.dst_port);
        bump(&mut self.stats.tcp.synrst);
        self.tcp_reset(&header, src)
    }

    /// Answer the segment in the buffer with RST+ACK.
    fn tcp_reset(&mut self, inbound: &TcpHeader, src: Ipv4Address) -> usize {
        if inbound.is_rst() {
            return 0;
        }
        bump(&mut self.stats.tcp.rst);
        TcpHeader {
            src_port: inbound.dst_port,
            dst_port: inbound.src_port,
            seq_number: inbound.ack_number,
            ack_number: inbound.seq_number.wrapping_add(1),
            data_offset: (TCP_HEADER_LEN / 4) as u8,
            flags: flags::RST | flags::ACK,
            window_size: 0,
            checksum: 0,
            urgent_ptr: 0,
        }
        .write_to(&mut self.buffer.data[TRANSPORT_OFFSET..]);
        self.tcp_finish(src, TCP_HEADER_LEN)
    }

    fn tcp_options(&self, header: &TcpHeader) -> &[u8] {
        let start = TRANSPORT_OFFSET + tcp::field::OPTIONS;
        &self.buffer.data[start..TRANSPORT_OFFSET + header.header_len()]
    }

    /// The peer's MSS option, capped to ours.
    fn negotiated_mss(&self, header: &TcpHeader) -> u16 {
        let ours = self.config.tcp_mss;
        parse_mss_option(self.tcp_options(header))
            .filter(|&mss| mss > 0)
            .map_or(ours, |mss| mss.min(ours))
    }

    fn tcp_accept(&mut self, header: &TcpHeader, src: Ipv4Address) -> usize {
        let slot = match self.free_slot() {
            Some(slot) => slot,
            None => {
                debug!("tcp: no free connection for SYN from {}:{}", src, header.src_port);
                bump(&mut self.stats.tcp.syndrop);
                return 0;
            }
        };
        let mss = self.negotiated_mss(header);
        self.connections[slot] = Connection {
            remote_addr: src,
            local_port: header.dst_port,
            remote_port: header.src_port,
            rcv_nxt: header.seq_number.wrapping_add(1),
            snd_nxt: self.iss,
            // Our SYN occupies one sequence number.
            len: 1,
            mss,
            initial_mss: mss,
            sa: 0,
            sv: 4,
            rto: self.config.rto,
            state: TcpState::SynRcvd,
            stopped: false,
            timer: self.config.rto,
            nrtx: 0,
        };
        debug!(
            "tcp: connection {} SYN_RCVD from {}:{} on port {} (mss {})",
            slot, src, header.src_port, header.dst_port, mss
        );
        self.tcp_send(ConnId(slot), flags::SYN | flags::ACK, 0, true)
    }

    fn tcp_segment<A: Application>(&mut self, id: ConnId, header: &TcpHeader, mut data_len: usize, app: &mut A) -> usize {
        // Inbound data, relative to the application data region.
        let mut data_start = header.header_len() - TCP_HEADER_LEN;
        let syn_ack = header.flags & flags::CTL == flags::SYN | flags::ACK;

        let conn = &mut self.connections[id.0];
        let state = conn.state;

        if header.is_rst() {
            let (next, _) = transition(state, Event::Reset);
            change_state(id, conn, next);
            debug!("tcp: connection {} reset by peer", id.0);
            self.app_call(id, AppEvents::ABORT, 0..0, app);
            return 0;
        }

        let expects_syn_ack = state == TcpState::SynSent && syn_ack;
        if !expects_syn_ack
            && (data_len > 0 || header.flags & (flags::SYN | flags::FIN) != 0)
            && header.seq_number != conn.rcv_nxt
        {
            trace!(
                "tcp: connection {} out of order seq {} (expected {})",
                id.0,
                header.seq_number,
                conn.rcv_nxt
            );
            return self.tcp_send(id, flags::ACK, 0, false);
        }

        let mut events = AppEvents::empty();
        if header.is_ack() && conn.outstanding() {
            if header.ack_number == conn.snd_nxt.wrapping_add(conn.len as u32) {
                conn.snd_nxt = header.ack_number;
                // Samples taken after a retransmission are ambiguous.
                if conn.nrtx == 0 {
                    conn.update_rto();
                }
                events |= AppEvents::ACKDATA;
                conn.timer = conn.rto;
                conn.len = 0;
            } else {
                bump(&mut self.stats.tcp.ackerr);
            }
        }

        let conn = &mut self.connections[id.0];
        let segment = Segment {
            acked: events.contains(AppEvents::ACKDATA),
            syn_ack,
            fin: header.is_fin() && !(state == TcpState::Established && conn.stopped),
            outstanding: conn.outstanding(),
            has_data: data_len > 0,
        };
        if matches!(state, TcpState::FinWait1 | TcpState::FinWait2) && data_len > 0 {
            conn.rcv_nxt = conn.rcv_nxt.wrapping_add(data_len as u32);
        }

        let (next, action) = transition(state, Event::Segment(segment));
        change_state(id, conn, next);

        match action {
            Action::Drop => 0,
            Action::Ack => self.tcp_send(id, flags::ACK, 0, false),
            Action::Connected => {
                let mut events = AppEvents::CONNECTED;
                if state == TcpState::SynSent {
                    let mss = self.negotiated_mss(header);
                    let conn = &mut self.connections[id.0];
                    conn.mss = mss;
                    conn.initial_mss = mss;
                    conn.rcv_nxt = header.seq_number.wrapping_add(1);
                    conn.len = 0;
                    data_len = 0;
                } else {
                    let conn = &mut self.connections[id.0];
                    conn.len = 0;
                    if data_len > 0 {
                        events |= AppEvents::NEWDATA;
                        conn.rcv_nxt = conn.rcv_nxt.wrapping_add(data_len as u32);
                    }
                }
                let reply = self.app_call(id, events, data_start..data_start + data_len, app);
                if state == TcpState::SynSent {
                    // Our ACK completes the handshake.
                    events |= AppEvents::NEWDATA;
                }
                self.app_send(id, events, reply)
            }
            Action::Deliver => {
                let segment_len = data_len;
                // Urgent bytes are acknowledged but never delivered.
                if header.is_urg() {
                    let urgent = (header.urgent_ptr as usize).min(data_len);
                    data_start += urgent;
                    data_len -= urgent;
                }
                let conn = &mut self.connections[id.0];
                let accepted = segment_len > 0 && !conn.stopped;
                if accepted {
                    conn.rcv_nxt = conn.rcv_nxt.wrapping_add(segment_len as u32);
                    if data_len > 0 {
                        events |= AppEvents::NEWDATA;
                    }
                } else {
                    data_len = 0;
                }
                // A zero window falls back to the initial MSS; the unacked
                // segment is then retried by the retransmission timer.
                let window = header.window_size;
                conn.mss = if window == 0 || window > conn.initial_mss {
                    conn.initial_mss
                } else {
                    window
                };
                if events.intersects(AppEvents::NEWDATA | AppEvents::ACKDATA) {
                    let reply = self.app_call(id, events, data_start..data_start + data_len, app);
                    self.app_send(id, events, reply)
                } else if accepted {
                    self.tcp_send(id, flags::ACK, 0, false)
                } else {
                    0
                }
            }
            Action::PeerClosed => {
                let conn = &mut self.connections[id.0];
                conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1 + data_len as u32);
                events |= AppEvents::CLOSE;
                if data_len > 0 {
                    events |= AppEvents::NEWDATA;
                }
                self.app_call(id, events, data_start..data_start + data_len, app);
                let conn = &mut self.connections[id.0];
                conn.len = 1;
                conn.nrtx = 0;
                self.tcp_send(id, flags::FIN | flags::ACK, 0, false)
            }
            Action::PeerClosedAck => {
                let conn = &mut self.connections[id.0];
                conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
                self.app_call(id, AppEvents::CLOSE, 0..0, app);
                self.tcp_send(id, flags::ACK, 0, false)
            }
            Action::Closed => {
                self.app_call(id, AppEvents::CLOSE, 0..0, app);
                0
            }
            Action::AbortedReset => {
                debug!("tcp: connection {} handshake failed", id.0);
                self.app_call(id, AppEvents::ABORT, 0..0, app);
                let src = self.connections[id.0].remote_addr;
                self.tcp_reset(header, src)
            }
            Action::Aborted | Action::SendFin | Action::SendReset | Action::TimedOut => 0,
        }
    }

    /// Hand the connection to the application and apply its flow control
    /// requests.
    fn app_call<A: Application>(&mut self, id: ConnId, events: AppEvents, data: Range<usize>, app: &mut A) -> AppReply {
        let NetworkInterface {
            buffer, connections, ..
        } = self;
        let mut io = TcpIo {
            buf: &mut buffer.data[TCP_APPDATA..],
            data,
            conn: &connections[id.0],
            reply: AppReply::default(),
        };
        app.tcp_event(id, events, &mut io);
        let reply = io.reply;

        let conn = &mut connections[id.0];
        if reply.stop {
            conn.stopped = true;
        }
        if reply.restart {
            conn.stopped = false;
        }
        reply
    }

    /// Turn the application's answer into a segment.
    fn app_send(&mut self, id: ConnId, mut events: AppEvents, reply: AppReply) -> usize {
        if reply.restart {
            // Advertise the reopened window.
            events |= AppEvents::NEWDATA;
        }
        let conn = &mut self.connections[id.0];

        if reply.abort {
            let (next, _) = transition(conn.state, Event::AppAbort);
            change_state(id, conn, next);
            return self.tcp_send(id, flags::RST | flags::ACK, 0, false);
        }
        if reply.close {
            if let (next, Action::SendFin) = transition(conn.state, Event::AppClose) {
                change_state(id, conn, next);
                conn.len = 1;
                conn.nrtx = 0;
                return self.tcp_send(id, flags::FIN | flags::ACK, 0, false);
            }
        }

        let mut send_len = reply.send_len;
        if send_len > 0 {
            if events.contains(AppEvents::ACKDATA) {
                conn.len = 0;
            }
            if conn.len == 0 {
                send_len = send_len.min(conn.mss as usize);
                conn.len = send_len as u16;
            } else {
                // One segment in flight at a time: only resend what is
                // already outstanding.
                send_len = conn.len as usize;
            }
        }
        conn.nrtx = 0;
        self.app_retransmit(id, events, send_len)
    }

    fn app_retransmit(&mut self, id: ConnId, events: AppEvents, send_len: usize) -> usize {
        let len = self.connections[id.0].len as usize;
        if send_len > 0 && len > 0 {
            return self.tcp_send(id, flags::ACK | flags::PSH, len, false);
        }
        if events.contains(AppEvents::NEWDATA) {
            return self.tcp_send(id, flags::ACK, 0, false);
        }
        0
    }

    fn tcp_timer<A: Application>(&mut self, id: ConnId, app: &mut A) -> usize {
        self.iss = self.iss.wrapping_add(1);
        // The first connection's tick stands for one pass over the table.
        if id.0 == 0 {
            if let Some(reassembler) = self.reassembler.as_mut() {
                reassembler.timer();
            }
        }
        let conn = &mut self.connections[id.0];
        let state = conn.state;

        match state {
            TcpState::Closed => 0,
            TcpState::TimeWait | TcpState::FinWait2 => {
                conn.timer = conn.timer.wrapping_add(1);
                if conn.timer >= self.config.time_wait_timeout {
                    let (next, _) = transition(state, Event::TimeWaitExpired);
                    change_state(id, conn, next);
                }
                0
            }
            _ if conn.outstanding() => {
                if conn.timer > 0 {
                    conn.timer -= 1;
                    return 0;
                }
                let limit = match state {
                    TcpState::SynSent | TcpState::SynRcvd => self.config.max_syn_retransmissions,
                    _ => self.config.max_retransmissions,
                };
                if conn.nrtx >= limit {
                    let (next, _) = transition(state, Event::RetransmitTimeout);
                    change_state(id, conn, next);
                    debug!("tcp: connection {} timed out after {} retransmissions", id.0, limit);
                    self.app_call(id, AppEvents::TIMEDOUT, 0..0, app);
                    return self.tcp_send(id, flags::RST | flags::ACK, 0, false);
                }

                conn.timer = backoff(self.config.rto, conn.nrtx);
                conn.nrtx += 1;
                bump(&mut self.stats.tcp.rexmit);
                trace!("tcp: connection {} retransmit #{} in {}", id.0, conn.nrtx, state);
                match state {
                    TcpState::SynRcvd => self.tcp_send(id, flags::SYN | flags::ACK, 0, true),
                    TcpState::SynSent => self.tcp_send(id, flags::SYN, 0, true),
                    TcpState::Established => {
                        let reply = self.app_call(id, AppEvents::REXMIT, 0..0, app);
                        self.app_retransmit(id, AppEvents::REXMIT, reply.send_len)
                    }
                    TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck => {
                        self.tcp_send(id, flags::FIN | flags::ACK, 0, false)
                    }
                    _ => 0,
                }
            }
            TcpState::Established => {
                let reply = self.app_call(id, AppEvents::POLL, 0..0, app);
                self.app_send(id, AppEvents::POLL, reply)
            }
            _ => 0,
        }
    }

    fn tcp_poll<A: Application>(&mut self, id: ConnId, app: &mut A) -> usize {
        let conn = &self.connections[id.0];
        if conn.state != TcpState::Established || conn.outstanding() {
            return 0;
        }
        let reply = self.app_call(id, AppEvents::POLL, 0..0, app);
        self.app_send(id, AppEvents::POLL, reply)
    }

    /// Build a segment on connection `id` around `payload_len` bytes already
    /// in the application data region.
    fn tcp_send(&mut self, id: ConnId, flags: u8, payload_len: usize, with_mss: bool) -> usize {
        let conn = &self.connections[id.0];
        let options_len = if with_mss { TCP_OPT_MSS_LEN } else { 0 };
        let remote = conn.remote_addr;
        TcpHeader {
            src_port: conn.local_port,
            dst_port: conn.remote_port,
            seq_number: conn.snd_nxt,
            ack_number: conn.rcv_nxt,
            data_offset: ((TCP_HEADER_LEN + options_len) / 4) as u8,
            flags,
            window_size: if conn.stopped { 0 } else { self.config.receive_window },
            checksum: 0,
            urgent_ptr: 0,
        }
        .write_to(&mut self.buffer.data[TRANSPORT_OFFSET..]);
        if with_mss {
            let at = TRANSPORT_OFFSET + tcp::field::OPTIONS;
            let options = &mut self.buffer.data[at..at + TCP_OPT_MSS_LEN];
            options[0] = TCP_OPT_MSS;
            options[1] = TCP_OPT_MSS_LEN as u8;
            BigEndian::write_u16(&mut options[2..4], self.config.tcp_mss);
        }
        self.tcp_finish(remote, TCP_HEADER_LEN + options_len + payload_len)
    }

    /// Add the IPv4 header and the checksum to a TCP segment of `segment_len`
    /// bytes.
    fn tcp_finish(&mut self, remote: Ipv4Address, segment_len: usize) -> usize {
        let ttl = self.config.ttl;
        let ip_len = self.ip_header(protocol::TCP, remote, segment_len, ttl);
        let sum = tcp_checksum(
            self.host.ip,
            remote,
            &self.buffer.data[TRANSPORT_OFFSET..TRANSPORT_OFFSET + segment_len],
        );
        let at = TRANSPORT_OFFSET + tcp::field::CHECKSUM.start;
        BigEndian::write_u16(&mut self.buffer.data[at..at + 2], checksum_field(sum));
        bump(&mut self.stats.tcp.sent);
        ip_len
    }
}
