//! The application side of the engine
//!
//! The engine calls back into an [`Application`] whenever something happens
//! on a connection. The callback sees what happened as [`AppEvents`] and
//! answers through the I/O handle it is given: queue data, close, abort, or
//! throttle the peer. Whatever it queues lands directly in the packet buffer.

use core::ops::Range;

use bitflags::bitflags;

use crate::network::ipv4::Ipv4Address;
use crate::transport::tcp::{ConnId, Connection, TcpState};
use crate::transport::udp::UdpConnId;

bitflags! {
    /// What the engine is telling the application.
    pub struct AppEvents: u8 {
        /// Our outstanding data was acknowledged.
        const ACKDATA = 0x01;
        /// The peer sent data.
        const NEWDATA = 0x02;
        /// Regenerate the last segment.
        const REXMIT = 0x04;
        /// Idle connection; new data may be sent.
        const POLL = 0x08;
        /// The connection closed.
        const CLOSE = 0x10;
        /// The peer reset the connection.
        const ABORT = 0x20;
        /// The connection is up.
        const CONNECTED = 0x40;
        /// Too many retransmissions.
        const TIMEDOUT = 0x80;
    }
}

pub trait Application {
    fn tcp_event(&mut self, conn: ConnId, events: AppEvents, io: &mut TcpIo<'_>);

    fn udp_event(&mut self, _conn: UdpConnId, _events: AppEvents, _io: &mut UdpIo<'_>) {}
}

/// Requests the application made during one callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AppReply {
    pub send_len: usize,
    pub close: bool,
    pub abort: bool,
    pub stop: bool,
    pub restart: bool,
}

/// Access to a TCP connection from inside a callback.
///
/// Inbound data and outbound data share the same buffer region. Copy out
/// what you need from [`data`](Self::data) before calling
/// [`send`](Self::send).
pub struct TcpIo<'a> {
    pub(crate) buf: &'a mut [u8],
    pub(crate) data: Range<usize>,
    pub(crate) conn: &'a Connection,
    pub(crate) reply: AppReply,
}

impl<'a> TcpIo<'a> {
    pub fn data(&self) -> &[u8] {
        &self.buf[self.data.clone()]
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }

    pub fn state(&self) -> TcpState {
        self.conn.state
    }

    pub fn remote(&self) -> (Ipv4Address, u16) {
        (self.conn.remote_addr, self.conn.remote_port)
    }

    /// Largest segment the peer will take right now.
    pub fn mss(&self) -> usize {
        (self.conn.mss as usize).min(self.buf.len())
    }

    pub fn initial_mss(&self) -> usize {
        self.conn.initial_mss as usize
    }

    /// Queue `data` for sending, truncated to [`mss`](Self::mss).
    ///
    /// On a retransmission the same bytes must be queued again. Returns the
    /// number of bytes taken.
    pub fn send(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.mss());
        self.buf[..len].copy_from_slice(&data[..len]);
        self.data = 0..0;
        self.reply.send_len = len;
        len
    }

    /// Close the connection gracefully (FIN).
    pub fn close(&mut self) {
        self.reply.close = true;
    }

    /// Reset the connection (RST).
    pub fn abort(&mut self) {
        self.reply.abort = true;
    }

    /// Close the receive window; inbound data is refused until
    /// [`restart`](Self::restart).
    pub fn stop(&mut self) {
        self.reply.stop = true;
        self.reply.restart = false;
    }

    pub fn restart(&mut self) {
        self.reply.restart = true;
        self.reply.stop = false;
    }

    pub fn is_stopped(&self) -> bool {
        (self.conn.stopped || self.reply.stop) && !self.reply.restart
    }
}

/// Access to a UDP datagram from inside a callback.
///
/// A reply goes to [`remote`](Self::remote): the sender of the datagram being
/// delivered, or the connection's peer on a poll.
pub struct UdpIo<'a> {
    pub(crate) buf: &'a mut [u8],
    pub(crate) data_len: usize,
    pub(crate) remote_addr: Ipv4Address,
    pub(crate) remote_port: u16,
    pub(crate) send_len: usize,
}

impl<'a> UdpIo<'a> {
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.data_len]
    }

    pub fn remote(&self) -> (Ipv4Address, u16) {
        (self.remote_addr, self.remote_port)
    }

    pub fn set_remote(&mut self, addr: Ipv4Address, port: u16) {
        self.remote_addr = addr;
        self.remote_port = port;
    }

    /// Queue a datagram, truncated to the buffer. Returns the bytes taken.
    pub fn send(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.buf.len());
        self.buf[..len].copy_from_slice(&data[..len]);
        self.data_len = 0;
        self.send_len = len;
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_truncates_to_mss() {
        let mut buf = [0u8; 16];
        let mut conn = Connection::closed();
        conn.mss = 4;
        let mut io = TcpIo {
            buf: &mut buf,
            data: 0..0,
            conn: &conn,
            reply: AppReply::default(),
        };
        assert_eq!(io.send(b"abcdef"), 4);
        assert_eq!(io.reply.send_len, 4);
        assert_eq!(&buf[..4], b"abcd");
    }

    #[test]
    fn test_stop_then_restart() {
        let mut buf = [0u8; 4];
        let conn = Connection::closed();
        let mut io = TcpIo {
            buf: &mut buf,
            data: 0..0,
            conn: &conn,
            reply: AppReply::default(),
        };
        io.stop();
        assert!(io.is_stopped());
        io.restart();
        assert!(!io.is_stopped());
        assert!(io.reply.restart);
    }
}
