//! A minimal ICMP echo client used as a cheap reachability check.
//!
//! The socket is raw when the process may open one, otherwise an unprivileged
//! datagram ICMP socket (Linux `net.ipv4.ping_group_range`). The read loop runs on
//! the blocking pool and is bounded by the caller's timeout.
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use log::debug;
use pnet_packet::icmp::{self, IcmpCode, IcmpPacket, IcmpTypes};
use pnet_packet::icmpv6::{self, Icmpv6Code, Icmpv6Packet, Icmpv6Types};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::Packet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;

const ECHO_HEADER_LEN: usize = 8;
const IPV4_MIN_HEADER_LEN: usize = 20;
const PAYLOAD: &[u8] = b"gscan reachability probe, gscan reachability probe.";

/// Why an echo round trip did not complete.
#[derive(Debug, Error)]
pub enum PingError {
    /// The ICMP socket could not be opened or connected.
    #[error("ping: connect failed: {0}")]
    ConnectFailed(#[source] io::Error),
    /// No echo reply arrived before the deadline.
    #[error("ping: no reply within {0:?}")]
    Timeout(Duration),
    /// Sending or receiving failed.
    #[error("ping: {0}")]
    Io(#[from] io::Error),
    /// A datagram too short to be an ICMP message.
    #[error("ping: malformed message of {0} bytes")]
    Malformed(usize),
    /// The blocking task did not finish.
    #[error("ping: worker task failed: {0}")]
    Join(String),
}

/// What one received ICMP message is, as far as a pending echo cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    /// An echo reply carrying this identifier.
    Reply(u16),
    /// An echo request, such as our own looped back on a raw socket.
    Request,
    /// Anything else: unreachable, time exceeded and so on.
    Other,
}

/// Builds an echo request for the given address family.
///
/// ICMPv4 carries the Internet checksum. ICMPv6 leaves the field zero; the kernel
/// computes it over the pseudo-header.
pub fn echo_request(v6: bool, ident: u16, seq: u16, payload: &[u8]) -> Result<Vec<u8>, PingError> {
    let mut buf = vec![0u8; ECHO_HEADER_LEN + payload.len()];
    let len = buf.len();

    if v6 {
        let mut request = icmpv6::echo_request::MutableEchoRequestPacket::new(&mut buf)
            .ok_or(PingError::Malformed(len))?;
        request.set_icmpv6_type(Icmpv6Types::EchoRequest);
        request.set_icmpv6_code(Icmpv6Code(0));
        request.set_identifier(ident);
        request.set_sequence_number(seq);
        request.set_payload(payload);
    } else {
        let mut request = icmp::echo_request::MutableEchoRequestPacket::new(&mut buf)
            .ok_or(PingError::Malformed(len))?;
        request.set_icmp_type(IcmpTypes::EchoRequest);
        request.set_icmp_code(IcmpCode(0));
        request.set_identifier(ident);
        request.set_sequence_number(seq);
        request.set_payload(payload);
        let sum = {
            let view = IcmpPacket::new(request.packet()).ok_or(PingError::Malformed(len))?;
            icmp::checksum(&view)
        };
        request.set_checksum(sum);
    }
    Ok(buf)
}

/// Classifies one ICMP message, without any IP header in front.
pub fn classify(v6: bool, message: &[u8]) -> Result<Echo, PingError> {
    let malformed = PingError::Malformed(message.len());

    if v6 {
        let packet = Icmpv6Packet::new(message).ok_or(malformed)?;
        let kind = packet.get_icmpv6_type();
        if kind == Icmpv6Types::EchoReply {
            let reply = icmpv6::echo_reply::EchoReplyPacket::new(message)
                .ok_or(PingError::Malformed(message.len()))?;
            Ok(Echo::Reply(reply.get_identifier()))
        } else if kind == Icmpv6Types::EchoRequest {
            Ok(Echo::Request)
        } else {
            Ok(Echo::Other)
        }
    } else {
        let packet = IcmpPacket::new(message).ok_or(malformed)?;
        let kind = packet.get_icmp_type();
        if kind == IcmpTypes::EchoReply {
            let reply = icmp::echo_reply::EchoReplyPacket::new(message)
                .ok_or(PingError::Malformed(message.len()))?;
            Ok(Echo::Reply(reply.get_identifier()))
        } else if kind == IcmpTypes::EchoRequest {
            Ok(Echo::Request)
        } else {
            Ok(Echo::Other)
        }
    }
}

/// Strips the IPv4 header (IHL × 4 bytes) delivered on raw IPv4 sockets.
fn ipv4_payload(datagram: &[u8]) -> &[u8] {
    match Ipv4Packet::new(datagram) {
        Some(header) => datagram
            .get(usize::from(header.get_header_length()) * 4..)
            .unwrap_or(datagram),
        None => datagram,
    }
}

/// The echo identifier, derived from the process id.
fn echo_ident() -> u16 {
    #[allow(clippy::cast_possible_truncation)]
    let ident = (std::process::id() & 0xffff) as u16;
    ident
}

struct EchoSocket {
    socket: Socket,
    raw: bool,
    v6: bool,
}

impl EchoSocket {
    fn connect(addr: IpAddr) -> io::Result<Self> {
        let (domain, protocol, v6) = match addr {
            IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, false),
            IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, true),
        };
        let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
            Ok(socket) => (socket, true),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!("Raw ICMP socket not permitted, falling back to datagram socket");
                (Socket::new(domain, Type::DGRAM, Some(protocol))?, false)
            }
            Err(e) => return Err(e),
        };
        socket.connect(&SockAddr::from(SocketAddr::new(addr, 0)))?;
        Ok(Self { socket, raw, v6 })
    }

    /// Unwraps the ICMP message from one received datagram.
    fn message<'a>(&self, datagram: &'a [u8]) -> &'a [u8] {
        if self.raw && !self.v6 {
            ipv4_payload(datagram)
        } else {
            datagram
        }
    }

    /// Datagram sockets get their identifier rewritten by the kernel, so only raw
    /// sockets can match it.
    fn answers(&self, ident: u16, sent: u16) -> bool {
        !self.raw || ident == sent
    }
}

/// Sends one echo request and waits up to `timeout` for the matching reply.
///
/// Blocks the calling thread; use [`ping`] from async code.
pub fn ping_blocking(addr: IpAddr, timeout: Duration) -> Result<Duration, PingError> {
    let start = Instant::now();
    let deadline = start + timeout;
    let echo = EchoSocket::connect(addr).map_err(PingError::ConnectFailed)?;

    let ident = echo_ident();
    let wire = echo_request(echo.v6, ident, 1, PAYLOAD)?;
    echo.socket.send(&wire)?;

    let mut buf = vec![0u8; IPV4_MIN_HEADER_LEN + 40 + wire.len()];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PingError::Timeout(timeout));
        }
        echo.socket.set_read_timeout(Some(remaining))?;

        let read = match (&echo.socket).read(&mut buf) {
            Ok(read) => read,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(PingError::Timeout(timeout));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        match classify(echo.v6, echo.message(&buf[..read]))? {
            Echo::Reply(reply) if echo.answers(reply, ident) => return Ok(start.elapsed()),
            // skip looped-back requests and foreign messages
            Echo::Reply(_) | Echo::Request | Echo::Other => {}
        }
    }
}

/// Async wrapper around [`ping_blocking`]; returns the round-trip time.
pub async fn ping(addr: IpAddr, timeout: Duration) -> Result<Duration, PingError> {
    tokio::task::spawn_blocking(move || ping_blocking(addr, timeout))
        .await
        .map_err(|e| PingError::Join(e.to_string()))?
}
