use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use thiserror::Error;

const ECHO_REQUEST: u8 = 8;
const ECHO_REPLY: u8 = 0;
const HEADER_LEN: usize = 8;
const PAYLOAD: &[u8] = b"pinglog-echo-data";
const MAX_REPLY_LEN: usize = 576;

#[derive(Debug, Error)]
pub enum IcmpError {
    #[error("unable to open icmp socket: {0}")]
    Open(#[source] io::Error),
    #[error("echo send failed: {0}")]
    Send(#[source] io::Error),
    #[error("echo receive failed: {0}")]
    Recv(#[source] io::Error),
    #[error("no reply within {0:?}")]
    TimedOut(Duration),
}

/// A successfully matched echo reply.
#[derive(Clone, Copy, Debug)]
pub struct EchoReply {
    pub rtt: Duration,
    /// IP TTL of the reply. Zero in unprivileged datagram mode, where the
    /// kernel strips the IP header before delivery.
    pub ttl: u8,
}

/// One blocking echo round-trip. Implemented by the raw socket transport and
/// by scripted fakes in tests.
pub trait EchoTransport: Send {
    fn echo(
        &mut self,
        addr: Ipv4Addr,
        sequence: u16,
        timeout: Duration,
    ) -> Result<EchoReply, IcmpError>;
}

/// IPv4 ICMP echo socket owned by a single prober thread.
pub struct IcmpSocket {
    socket: Socket,
    ident: u16,
    raw: bool,
}

impl IcmpSocket {
    /// Open a raw ICMP socket, falling back to the unprivileged datagram
    /// flavor when raw sockets are denied.
    pub fn open() -> Result<Self, IcmpError> {
        match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
            Ok(socket) => Ok(Self {
                socket,
                ident: (std::process::id() & 0xffff) as u16,
                raw: true,
            }),
            Err(raw_err) if raw_err.kind() == io::ErrorKind::PermissionDenied => {
                let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))
                    .map_err(IcmpError::Open)?;
                Ok(Self {
                    socket,
                    ident: (std::process::id() & 0xffff) as u16,
                    raw: false,
                })
            }
            Err(raw_err) => Err(IcmpError::Open(raw_err)),
        }
    }
}

impl EchoTransport for IcmpSocket {
    fn echo(
        &mut self,
        addr: Ipv4Addr,
        sequence: u16,
        timeout: Duration,
    ) -> Result<EchoReply, IcmpError> {
        let packet = build_echo_request(self.ident, sequence);
        let dest = SockAddr::from(SocketAddrV4::new(addr, 0));
        let sent_at = Instant::now();
        self.socket
            .send_to(&packet, &dest)
            .map_err(IcmpError::Send)?;

        let mut buf = [MaybeUninit::<u8>::uninit(); MAX_REPLY_LEN];
        loop {
            let remaining = timeout.saturating_sub(sent_at.elapsed());
            if remaining.is_zero() {
                return Err(IcmpError::TimedOut(timeout));
            }
            self.socket
                .set_read_timeout(Some(remaining))
                .map_err(IcmpError::Recv)?;

            let len = match self.socket.recv_from(&mut buf) {
                Ok((len, _)) => len,
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(IcmpError::TimedOut(timeout));
                }
                Err(err) => return Err(IcmpError::Recv(err)),
            };
            let bytes = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

            if let Some(reply) = parse_echo_reply(bytes, self.raw) {
                // Datagram sockets rewrite the identifier, so only the raw
                // flavor can match on it.
                let ident_ok = !self.raw || reply.ident == self.ident;
                if ident_ok && reply.sequence == sequence {
                    return Ok(EchoReply {
                        rtt: sent_at.elapsed(),
                        ttl: reply.ttl,
                    });
                }
            }
            // Unrelated traffic on the shared raw socket; keep waiting.
        }
    }
}

pub(crate) struct ParsedReply {
    pub ident: u16,
    pub sequence: u16,
    pub ttl: u8,
}

pub(crate) fn build_echo_request(ident: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; HEADER_LEN + PAYLOAD.len()];
    packet[0] = ECHO_REQUEST;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[HEADER_LEN..].copy_from_slice(PAYLOAD);
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

/// Parse an inbound packet into an echo reply. Raw sockets deliver the full
/// IP datagram; datagram sockets deliver the bare ICMP message.
pub(crate) fn parse_echo_reply(bytes: &[u8], raw: bool) -> Option<ParsedReply> {
    let (icmp, ttl) = if raw {
        if bytes.len() < 20 {
            return None;
        }
        let ihl = usize::from(bytes[0] & 0x0f) * 4;
        if ihl < 20 || bytes.len() < ihl + HEADER_LEN {
            return None;
        }
        (&bytes[ihl..], bytes[8])
    } else {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        (bytes, 0)
    };

    if icmp[0] != ECHO_REPLY || icmp[1] != 0 {
        return None;
    }
    Some(ParsedReply {
        ident: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
        ttl,
    })
}

/// RFC 1071 ones'-complement checksum.
pub(crate) fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
