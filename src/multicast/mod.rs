use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::logging::Logger;

pub const DISCOVER_PAYLOAD: &str = "DISCOVER";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum MulticastError {
    Setup { source: io::Error },
    Probe { source: io::Error },
}

impl fmt::Display for MulticastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup { source } => write!(f, "failed to set up multicast socket: {source}"),
            Self::Probe { source } => write!(f, "discovery probe failed: {source}"),
        }
    }
}

impl std::error::Error for MulticastError {}

pub fn announce_payload(tcp_port: u16) -> String {
    format!("ANNOUNCE central {tcp_port}")
}

/// Parses "ANNOUNCE central <port>"; anything else is not an announcement.
pub fn parse_announce(payload: &str) -> Option<u16> {
    let rest = payload.strip_prefix("ANNOUNCE central ")?;
    if rest.is_empty() || !rest.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

/// Datagram payload as text with trailing CR/LF/space tolerated.
fn trim_probe(raw: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(raw).ok()?;
    Some(text.trim_end_matches(['\r', '\n', ' ']))
}

/// Answers multicast DISCOVER probes with a unicast ANNOUNCE carrying the
/// server's TCP port.
pub struct DiscoveryResponder {
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    local_port: u16,
}

impl DiscoveryResponder {
    pub fn start(
        group: Ipv4Addr,
        port: u16,
        announce_tcp_port: u16,
        logger: Arc<Logger>,
    ) -> Result<Self, MulticastError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|source| MulticastError::Setup { source })?;
        socket
            .set_reuse_address(true)
            .map_err(|source| MulticastError::Setup { source })?;
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket
            .bind(&bind_addr.into())
            .map_err(|source| MulticastError::Setup { source })?;

        let udp: UdpSocket = socket.into();
        udp.set_read_timeout(Some(RECEIVE_POLL_INTERVAL))
            .map_err(|source| MulticastError::Setup { source })?;
        let _ = udp.set_multicast_loop_v4(true);

        // A failed group join leaves unicast probes working, so the
        // responder stays up and only logs the degradation.
        let joined = match udp.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
            Ok(()) => true,
            Err(error) => {
                logger.warn(
                    Some("multicast::discovery"),
                    &format!("failed to join multicast group {group}: {error}"),
                );
                false
            }
        };

        let local_port = udp
            .local_addr()
            .map_err(|source| MulticastError::Setup { source })?
            .port();

        let stop_signal = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop_signal);
        let worker_logger = Arc::clone(&logger);
        let worker = thread::spawn(move || {
            run_responder(&udp, group, joined, announce_tcp_port, &worker_stop, &worker_logger);
        });

        logger.info(
            Some("multicast::discovery"),
            &format!("discovery responder listening on {group}:{local_port}"),
        );

        Ok(Self {
            stop_signal,
            worker: Some(worker),
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_responder(
    udp: &UdpSocket,
    group: Ipv4Addr,
    joined: bool,
    announce_tcp_port: u16,
    stop_signal: &AtomicBool,
    logger: &Logger,
) {
    let mut buffer = [0_u8; 512];
    while !stop_signal.load(Ordering::SeqCst) {
        let (size, sender) = match udp.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(error) if crate::transport::is_poll_timeout(error.kind()) => continue,
            Err(error) => {
                logger.warn(
                    Some("multicast::discovery"),
                    &format!("receive error: {error}; responder exiting"),
                );
                break;
            }
        };

        let Some(payload) = trim_probe(&buffer[..size]) else {
            continue;
        };
        logger.debug(
            Some("multicast::discovery"),
            &format!("RX '{payload}' from {sender}"),
        );

        if payload == DISCOVER_PAYLOAD {
            let announce = announce_payload(announce_tcp_port);
            match udp.send_to(announce.as_bytes(), sender) {
                Ok(_) => logger.info(
                    Some("multicast::discovery"),
                    &format!("TX '{announce}' to {sender}"),
                ),
                Err(error) => logger.warn(
                    Some("multicast::discovery"),
                    &format!("ANNOUNCE send failed: {error}"),
                ),
            }
        }
    }

    if joined {
        let _ = udp.leave_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED);
    }
}

/// Sends DISCOVER to the group and waits for the first ANNOUNCE. Returns the
/// announcer's TCP target, or `None` when nothing replied within the timeout.
pub fn discover(
    group: Ipv4Addr,
    port: u16,
    timeout: Duration,
) -> Result<Option<SocketAddr>, MulticastError> {
    let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .map_err(|source| MulticastError::Probe { source })?;
    let _ = udp.set_multicast_loop_v4(true);
    udp.set_read_timeout(Some(timeout))
        .map_err(|source| MulticastError::Probe { source })?;

    udp.send_to(DISCOVER_PAYLOAD.as_bytes(), (group, port))
        .map_err(|source| MulticastError::Probe { source })?;

    let mut buffer = [0_u8; 512];
    match udp.recv_from(&mut buffer) {
        Ok((size, sender)) => {
            let Some(payload) = trim_probe(&buffer[..size]) else {
                return Ok(None);
            };
            Ok(parse_announce(payload)
                .map(|tcp_port| SocketAddr::new(sender.ip(), tcp_port)))
        }
        Err(error) if crate::transport::is_poll_timeout(error.kind()) => Ok(None),
        Err(source) => Err(MulticastError::Probe { source }),
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, UdpSocket};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::logging::{Logger, LoggerConfig};

    use super::{
        announce_payload, parse_announce, trim_probe, DiscoveryResponder, DEFAULT_PROBE_TIMEOUT,
    };

    #[test]
    fn announce_format_matches_protocol() {
        assert_eq!(announce_payload(8080), "ANNOUNCE central 8080");
        assert_eq!(parse_announce("ANNOUNCE central 8080"), Some(8080));
        assert_eq!(parse_announce("ANNOUNCE central "), None);
        assert_eq!(parse_announce("ANNOUNCE central 80x0"), None);
        assert_eq!(parse_announce("DISCOVER"), None);
    }

    #[test]
    fn probe_trimming_tolerates_trailing_noise() {
        assert_eq!(trim_probe(b"DISCOVER\r\n"), Some("DISCOVER"));
        assert_eq!(trim_probe(b"DISCOVER  "), Some("DISCOVER"));
        assert_eq!(trim_probe(b"DISCOVER"), Some("DISCOVER"));
        assert_eq!(trim_probe(&[0xFF, 0xFE]), None);
    }

    #[test]
    fn responder_answers_discover_with_announce() {
        let logger = Arc::new(Logger::new(LoggerConfig::default()));
        // Port 0 keeps the test self-contained; probes go over loopback
        // unicast so multicast routing is not required here.
        let mut responder =
            DiscoveryResponder::start(Ipv4Addr::new(239, 192, 0, 1), 0, 18080, logger)
                .expect("responder should start");

        let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("probe socket should bind");
        probe
            .set_read_timeout(Some(DEFAULT_PROBE_TIMEOUT))
            .expect("timeout should set");
        probe
            .send_to(b"DISCOVER\r\n", (Ipv4Addr::LOCALHOST, responder.local_port()))
            .expect("probe should send");

        let mut buffer = [0_u8; 128];
        let (size, _) = probe.recv_from(&mut buffer).expect("announce should arrive");
        assert_eq!(&buffer[..size], b"ANNOUNCE central 18080");

        responder.stop();
    }

    #[test]
    fn responder_ignores_other_payloads() {
        let logger = Arc::new(Logger::new(LoggerConfig::default()));
        let mut responder =
            DiscoveryResponder::start(Ipv4Addr::new(239, 192, 0, 1), 0, 18081, logger)
                .expect("responder should start");

        let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("probe socket should bind");
        probe
            .set_read_timeout(Some(Duration::from_millis(400)))
            .expect("timeout should set");
        probe
            .send_to(b"HELLO", (Ipv4Addr::LOCALHOST, responder.local_port()))
            .expect("probe should send");

        let mut buffer = [0_u8; 128];
        assert!(probe.recv_from(&mut buffer).is_err());

        responder.stop();
    }
}
