//! An echo server on a TAP interface
//!
//! This example runs the engine behind a TAP device and answers:
//! - ARP requests and ICMP echo (ping)
//! - TCP echo on port 7, buffered through the packet memory pool
//! - UDP echo on port 7
//!
//! To run this example:
//!
//! ```sh
//! sudo cargo run --example tap_echo
//! ping 10.0.0.1
//! nc 10.0.0.1 7
//! ```
//!
//! Note: Root/sudo privileges are required to create and configure the TAP
//! device. Set `MICRO_IP_LOG=debug` to watch the engine at work.

use std::collections::HashMap;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use micro_ip::error::Error;
use micro_ip::mempool::MemoryPool;
use micro_ip::socket::{PacketQueue, SOCKET_NUM_PACKETS};
use micro_ip::{
    AppEvents, Application, Config, ConnId, EthernetAddress, HostAddresses, Ipv4Address, NetworkInterface, RamWindow,
    TcpIo, UdpConnId, UdpIo,
};
use tun_tap::{Iface, Mode};

mod utils;
use utils::network::{configure_interface, parse_ip_cidr};

const ECHO_PORT: u16 = 7;
const PERIODIC_INTERVAL: Duration = Duration::from_millis(250);
const ARP_INTERVAL: Duration = Duration::from_secs(10);
const POOL_SIZE: u16 = 4096;

/// Per-connection echo state: bytes waiting to go back out, and the segment
/// in flight in case it must be sent again.
#[derive(Default)]
struct EchoSocket {
    queue: PacketQueue,
    in_flight: Vec<u8>,
}

struct EchoApp {
    pool: MemoryPool,
    ram: RamWindow,
    sockets: HashMap<ConnId, EchoSocket>,
}

impl EchoApp {
    fn new(max_connections: usize) -> micro_ip::Result<Self> {
        Ok(EchoApp {
            pool: MemoryPool::new(0, POOL_SIZE, SOCKET_NUM_PACKETS * max_connections)?,
            ram: RamWindow::new(0, POOL_SIZE as usize),
            sockets: HashMap::new(),
        })
    }

    fn release(&mut self, conn: ConnId) {
        if let Some(mut socket) = self.sockets.remove(&conn) {
            socket.queue.flush(&mut self.pool);
        }
    }
}

impl Application for EchoApp {
    fn tcp_event(&mut self, conn: ConnId, events: AppEvents, io: &mut TcpIo<'_>) {
        if events.intersects(AppEvents::CLOSE | AppEvents::ABORT | AppEvents::TIMEDOUT) {
            println!("Connection {:?} from {:?} ended ({:?})", conn, io.remote(), events);
            self.release(conn);
            return;
        }
        if events.contains(AppEvents::CONNECTED) {
            println!("Connection {:?} from {:?} established", conn, io.remote());
        }

        let socket = self.sockets.entry(conn).or_default();
        if events.contains(AppEvents::REXMIT) {
            io.send(&socket.in_flight);
            return;
        }
        if events.contains(AppEvents::ACKDATA) {
            socket.in_flight.clear();
        }

        if events.contains(AppEvents::NEWDATA) && !io.data().is_empty() {
            let data = io.data().to_vec();
            match socket.queue.enqueue_packet(&mut self.pool, &mut self.ram, &data) {
                Ok(()) => {}
                Err(Error::QueueFull) | Err(Error::PoolExhausted) => {
                    // Already acknowledged, so these bytes are lost. Hold
                    // the peer off until the queue drains.
                    println!("Connection {:?}: buffer full, dropping {} bytes", conn, data.len());
                    io.stop();
                }
                Err(e) => eprintln!("Connection {:?}: {}", conn, e),
            }
        }

        if !io.connection().outstanding() && socket.in_flight.is_empty() && socket.queue.has_packet() {
            let mut segment = vec![0u8; io.mss()];
            match socket.queue.read(&mut self.pool, &mut self.ram, &mut segment) {
                Ok(n) => {
                    segment.truncate(n);
                    io.send(&segment);
                    socket.in_flight = segment;
                }
                Err(e) => eprintln!("Connection {:?}: {}", conn, e),
            }
        }
        if io.is_stopped() && !socket.queue.is_full() {
            io.restart();
        }
    }

    fn udp_event(&mut self, _conn: UdpConnId, events: AppEvents, io: &mut UdpIo<'_>) {
        if events.contains(AppEvents::NEWDATA) {
            let data = io.data().to_vec();
            println!("UDP: echoing {} bytes to {:?}", data.len(), io.remote());
            io.send(&data);
        }
    }
}

fn main() -> io::Result<()> {
    utils::logger::init();
    println!("Starting TAP echo server...");

    let iface = Arc::new(Iface::without_packet_info("tap0", Mode::Tap)?);
    println!("TAP device created: {}", iface.name());
    configure_interface(iface.name(), "10.0.0.254/24")?;

    let (ip, netmask) = parse_ip_cidr("10.0.0.1/24")?;
    let host = HostAddresses {
        mac: EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
        ip,
        netmask,
        gateway: Ipv4Address::new(10, 0, 0, 254),
    };
    let config = Config {
        buffer_size: 1514,
        tcp_mss: 1460,
        receive_window: 1460,
        ..Config::default()
    };
    let max_connections = config.max_connections;
    let to_io = |e: Error| io::Error::new(io::ErrorKind::Other, e.to_string());

    let mut engine = NetworkInterface::new(config, host).map_err(to_io)?;
    engine.listen(ECHO_PORT).map_err(to_io)?;
    let udp = engine.udp_new(Ipv4Address::UNSPECIFIED, 0).map_err(to_io)?;
    engine.udp_bind(udp, ECHO_PORT).map_err(to_io)?;
    let mut app = EchoApp::new(max_connections).map_err(to_io)?;
    println!("Echo server listening on {}:{} (TCP and UDP)", ip, ECHO_PORT);

    // The TAP read blocks, so frames come in on their own thread.
    let (frames_tx, frames_rx) = mpsc::channel::<Vec<u8>>();
    let reader = Arc::clone(&iface);
    thread::spawn(move || {
        let mut buf = [0u8; 1514];
        loop {
            match reader.recv(&mut buf) {
                Ok(n) => {
                    if frames_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Failed to read from TAP device: {}", e);
                    break;
                }
            }
        }
    });

    let send = |frame: &[u8]| {
        if let Err(e) = iface.send(frame) {
            eprintln!("Failed to send frame: {}", e);
        }
    };
    let mut next_periodic = Instant::now() + PERIODIC_INTERVAL;
    let mut next_arp = Instant::now() + ARP_INTERVAL;

    loop {
        let timeout = next_periodic.saturating_duration_since(Instant::now());
        match frames_rx.recv_timeout(timeout) {
            Ok(frame) => {
                let len = frame.len().min(engine.buffer().len());
                engine.buffer_mut()[..len].copy_from_slice(&frame[..len]);
                engine.handle_frame(len, &mut app);
                let out = engine.output_len();
                if out > 0 {
                    send(&engine.buffer()[..out]);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        if now >= next_periodic {
            next_periodic = now + PERIODIC_INTERVAL;
            engine.periodic(&mut app, send);
            engine.udp_periodic(&mut app, send);
        }
        if now >= next_arp {
            next_arp = now + ARP_INTERVAL;
            engine.arp_timer();
        }
    }

    let stats = engine.stats();
    println!(
        "Stopped. IP recv/sent/drop: {}/{}/{}, TCP rexmit: {}",
        stats.ip.recv, stats.ip.sent, stats.ip.drop, stats.tcp.rexmit
    );
    Ok(())
}
