//! TCP (Transmission Control Protocol) implementation
//!
//! This module provides the TCP header codec, the connection record kept in
//! the engine's fixed connection table, the round-trip estimator and the
//! connection state machine.
//!
//! The state machine is a pure function from `(state, event)` to
//! `(next state, action)`. The engine turns an inbound segment or a timer
//! into an [`Event`], asks [`transition`] what to do, then applies the
//! [`Action`] to the packet buffer.

use core::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::network::ipv4::Ipv4Address;

pub const TCP_HEADER_LEN: usize = 20;

// Option kinds. MSS is the only option we emit: kind 2, length 4.
pub const TCP_OPT_END: u8 = 0;
pub const TCP_OPT_NOOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;
pub const TCP_OPT_MSS_LEN: usize = 4;

/// TCP header flag bits
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const CTL: u8 = 0x3F;
}

/// Byte offsets of the header fields, relative to the start of the header.
pub mod field {
    use core::ops::Range;

    pub const SRC_PORT: Range<usize> = 0..2;
    pub const DST_PORT: Range<usize> = 2..4;
    pub const SEQ_NUM: Range<usize> = 4..8;
    pub const ACK_NUM: Range<usize> = 8..12;
    pub const DATA_OFFSET: usize = 12;
    pub const FLAGS: usize = 13;
    pub const WIN_SIZE: Range<usize> = 14..16;
    pub const CHECKSUM: Range<usize> = 16..18;
    pub const URGENT: Range<usize> = 18..20;
    pub const OPTIONS: usize = 20;
}

/// Index of a slot in the TCP connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub usize);

/// TCP connection states
///
/// LISTEN is not a connection state here: listening is membership in the
/// engine's listen-port table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynRcvd,
    SynSent,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    LastAck,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::SynSent => "SYN_SENT",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::LastAck => "LAST_ACK",
        };
        f.write_str(name)
    }
}

/// TCP packet header structure
///
/// Represents the standard 20-byte TCP header as defined in RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub data_offset: u8, // header length in 32-bit words
    pub flags: u8,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Parse TCP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid TCP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < TCP_HEADER_LEN {
            return None;
        }

        Some(TcpHeader {
            src_port: BigEndian::read_u16(&data[field::SRC_PORT]),
            dst_port: BigEndian::read_u16(&data[field::DST_PORT]),
            seq_number: BigEndian::read_u32(&data[field::SEQ_NUM]),
            ack_number: BigEndian::read_u32(&data[field::ACK_NUM]),
            data_offset: data[field::DATA_OFFSET] >> 4,
            flags: data[field::FLAGS],
            window_size: BigEndian::read_u16(&data[field::WIN_SIZE]),
            checksum: BigEndian::read_u16(&data[field::CHECKSUM]),
            urgent_ptr: BigEndian::read_u16(&data[field::URGENT]),
        })
    }

    /// Serialize the fixed header into `buf`. The checksum is written as is.
    pub fn write_to(&self, buf: &mut [u8]) {
        BigEndian::write_u16(&mut buf[field::SRC_PORT], self.src_port);
        BigEndian::write_u16(&mut buf[field::DST_PORT], self.dst_port);
        BigEndian::write_u32(&mut buf[field::SEQ_NUM], self.seq_number);
        BigEndian::write_u32(&mut buf[field::ACK_NUM], self.ack_number);
        buf[field::DATA_OFFSET] = self.data_offset << 4;
        buf[field::FLAGS] = self.flags;
        BigEndian::write_u16(&mut buf[field::WIN_SIZE], self.window_size);
        BigEndian::write_u16(&mut buf[field::CHECKSUM], self.checksum);
        BigEndian::write_u16(&mut buf[field::URGENT], self.urgent_ptr);
    }

    /// Check if SYN flag is set
    pub fn is_syn(&self) -> bool {
        self.flags & flags::SYN != 0
    }

    /// Check if ACK flag is set
    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }

    /// Check if FIN flag is set
    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN != 0
    }

    /// Check if RST flag is set
    pub fn is_rst(&self) -> bool {
        self.flags & flags::RST != 0
    }

    pub fn is_urg(&self) -> bool {
        self.flags & flags::URG != 0
    }

    /// Get the data offset (header length) in bytes
    pub fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }
}

/// Find the MSS option in a TCP option list.
///
/// Stops at the end-of-options marker or at a malformed zero-length option.
pub fn parse_mss_option(options: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            TCP_OPT_END => return None,
            TCP_OPT_NOOP => i += 1,
            TCP_OPT_MSS if options.get(i + 1) == Some(&(TCP_OPT_MSS_LEN as u8)) => {
                let value = options.get(i + 2..i + 4)?;
                return Some(BigEndian::read_u16(value));
            }
            _ => match options.get(i + 1) {
                Some(&len) if len > 0 => i += len as usize,
                _ => return None,
            },
        }
    }
    None
}

/// One slot of the TCP connection table.
#[derive(Debug, Clone)]
pub struct Connection {
    pub remote_addr: Ipv4Address,
    pub local_port: u16,
    pub remote_port: u16,
    /// Next sequence number we expect from the peer.
    pub rcv_nxt: u32,
    /// Sequence number of the first unacknowledged byte we sent.
    pub snd_nxt: u32,
    /// Length of the data sent and not yet acknowledged.
    pub len: u16,
    /// Largest segment we may send right now.
    pub mss: u16,
    /// MSS negotiated at connection setup.
    pub initial_mss: u16,
    /// Smoothed RTT, scaled by 8.
    pub sa: u8,
    /// RTT variance, scaled by 4.
    pub sv: u8,
    pub rto: u8,
    pub state: TcpState,
    /// The application closed our receive window.
    pub stopped: bool,
    pub timer: u8,
    /// Retransmissions of the segment in flight.
    pub nrtx: u8,
}

impl Connection {
    pub const fn closed() -> Self {
        Connection {
            remote_addr: Ipv4Address::UNSPECIFIED,
            local_port: 0,
            remote_port: 0,
            rcv_nxt: 0,
            snd_nxt: 0,
            len: 0,
            mss: 0,
            initial_mss: 0,
            sa: 0,
            sv: 0,
            rto: 0,
            state: TcpState::Closed,
            stopped: false,
            timer: 0,
            nrtx: 0,
        }
    }

    /// Check if the connection has unacknowledged data in flight
    pub fn outstanding(&self) -> bool {
        self.len > 0
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    /// Whether this slot carries the segment described by the four-tuple.
    pub fn matches(&self, local_port: u16, remote_addr: Ipv4Address, remote_port: u16) -> bool {
        !self.is_closed()
            && self.local_port == local_port
            && self.remote_port == remote_port
            && self.remote_addr == remote_addr
    }

    /// Fold one round-trip sample into the estimator (Jacobson/Karels, 8-bit).
    ///
    /// The sample is the time elapsed since the segment was last (re)sent:
    /// the timer was loaded with `rto` and counts down each tick.
    pub fn update_rto(&mut self) {
        let mut m = self.rto.wrapping_sub(self.timer) as i8;
        m = m.wrapping_sub((self.sa >> 3) as i8);
        self.sa = self.sa.wrapping_add(m as u8);
        if m < 0 {
            m = m.wrapping_neg();
        }
        m = m.wrapping_sub((self.sv >> 2) as i8);
        self.sv = self.sv.wrapping_add(m as u8);
        self.rto = (self.sa >> 3).wrapping_add(self.sv);
    }
}

/// Retransmission timer for the `nrtx`-th retransmission.
pub fn backoff(base_rto: u8, nrtx: u8) -> u8 {
    base_rto << nrtx.min(4)
}

/// What an inbound segment means to the state machine, once the engine has
/// processed its acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    /// The segment acknowledged everything we had outstanding.
    pub acked: bool,
    /// SYN and ACK both set, and no other control bit.
    pub syn_ack: bool,
    /// FIN set (and the receive window is open).
    pub fin: bool,
    /// We still have unacknowledged data in flight.
    pub outstanding: bool,
    /// The segment carries payload.
    pub has_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Segment(Segment),
    /// The peer reset the connection.
    Reset,
    AppClose,
    AppAbort,
    /// Retransmission limit reached.
    RetransmitTimeout,
    /// The TIME_WAIT / FIN_WAIT_2 timer ran out.
    TimeWaitExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to send, nothing to tell the application.
    Drop,
    /// Send a bare ACK.
    Ack,
    /// Tell the application the connection is up, then send what it queued
    /// (or ACK the handshake).
    Connected,
    /// Normal data transfer: deliver data/acks to the application and send
    /// what it queued.
    Deliver,
    /// The peer closed: tell the application, send FIN+ACK.
    PeerClosed,
    /// The peer's FIN answers ours: tell the application, send ACK.
    PeerClosedAck,
    /// Our FIN was acknowledged in LAST_ACK: tell the application.
    Closed,
    /// The application closed: send FIN+ACK.
    SendFin,
    /// The application aborted: send RST+ACK.
    SendReset,
    /// The peer reset us: tell the application, send nothing.
    Aborted,
    /// The handshake failed: tell the application and send RST+ACK.
    AbortedReset,
    /// Too many retransmissions: tell the application and send RST+ACK.
    TimedOut,
}

/// The connection state machine.
pub fn transition(state: TcpState, event: Event) -> (TcpState, Action) {
    use TcpState::*;

    match (state, event) {
        (Closed, _) => (Closed, Action::Drop),

        (_, Event::Reset) => (Closed, Action::Aborted),
        (_, Event::RetransmitTimeout) => (Closed, Action::TimedOut),
        (_, Event::AppAbort) => (Closed, Action::SendReset),
        (TimeWait | FinWait2, Event::TimeWaitExpired) => (Closed, Action::Drop),
        (_, Event::TimeWaitExpired) => (state, Action::Drop),
        (Established, Event::AppClose) => (FinWait1, Action::SendFin),
        (_, Event::AppClose) => (state, Action::Drop),

        (SynRcvd, Event::Segment(seg)) if seg.acked => (Established, Action::Connected),
        (SynRcvd, Event::Segment(_)) => (SynRcvd, Action::Drop),

        (SynSent, Event::Segment(seg)) if seg.acked && seg.syn_ack => (Established, Action::Connected),
        (SynSent, Event::Segment(_)) => (Closed, Action::AbortedReset),

        // Our data must drain before we accept the close.
        (Established, Event::Segment(seg)) if seg.fin && seg.outstanding => (Established, Action::Drop),
        (Established, Event::Segment(seg)) if seg.fin => (LastAck, Action::PeerClosed),
        (Established, Event::Segment(_)) => (Established, Action::Deliver),

        (LastAck, Event::Segment(seg)) if seg.acked => (Closed, Action::Closed),
        (LastAck, Event::Segment(_)) => (LastAck, Action::Drop),

        (FinWait1, Event::Segment(seg)) if seg.fin && seg.acked => (TimeWait, Action::PeerClosedAck),
        (FinWait1, Event::Segment(seg)) if seg.fin => (Closing, Action::PeerClosedAck),
        (FinWait1, Event::Segment(seg)) if seg.acked => (FinWait2, Action::Drop),
        (FinWait1, Event::Segment(seg)) if seg.has_data => (FinWait1, Action::Ack),
        (FinWait1, Event::Segment(_)) => (FinWait1, Action::Drop),

        (FinWait2, Event::Segment(seg)) if seg.fin => (TimeWait, Action::PeerClosedAck),
        (FinWait2, Event::Segment(seg)) if seg.has_data => (FinWait2, Action::Ack),
        (FinWait2, Event::Segment(_)) => (FinWait2, Action::Drop),

        (Closing, Event::Segment(seg)) if seg.acked => (TimeWait, Action::Drop),
        (Closing, Event::Segment(_)) => (Closing, Action::Drop),

        (TimeWait, Event::Segment(_)) => (TimeWait, Action::Ack),
    }
}
