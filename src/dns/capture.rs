//! Link-layer frames down to the DNS payload, and where frames come from.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::socket::{self, sockopt, AddressFamily, MsgFlags, SockFlag, SockProtocol, SockType};
use nix::sys::time::{TimeVal, TimeValLike};

use crate::layout::{DecodeError, Reader};

pub const DNS_PORT: u16 = 53;
/// Largest frame read off the capture socket.
pub const SNAPLEN: usize = 65536;

const ETH_HEADER: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

/// A DNS message lifted out of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSegment<'a> {
    pub saddr: IpAddr,
    pub sport: u16,
    pub daddr: IpAddr,
    pub dport: u16,
    pub transport: Transport,
    pub payload: &'a [u8],
}

/// Extract the DNS message carried by an Ethernet frame. Frames that are not
/// DNS traffic yield `Ok(None)`. TCP segments must hold a whole
/// length-prefixed message; streams are not reassembled.
pub fn parse_frame(frame: &[u8]) -> Result<Option<DnsSegment<'_>>, DecodeError> {
    let r = Reader::new(frame);
    let mut pos = 12;
    let mut ethertype = r.be16(pos)?;
    pos = ETH_HEADER;
    while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        ethertype = r.be16(pos + 2)?;
        pos += 4;
    }

    let (saddr, daddr, proto, l4) = match ethertype {
        ETHERTYPE_IPV4 => {
            let ihl = (r.u8(pos)? & 0x0f) as usize * 4;
            if ihl < 20 {
                return Err(DecodeError::Invalid {
                    field: "ipv4 header length",
                    value: ihl as u64,
                });
            }
            let src = r.bytes(pos + 12, 4)?;
            let dst = r.bytes(pos + 16, 4)?;
            (
                IpAddr::V4(Ipv4Addr::new(src[0], src[1], src[2], src[3])),
                IpAddr::V4(Ipv4Addr::new(dst[0], dst[1], dst[2], dst[3])),
                r.u8(pos + 9)?,
                pos + ihl,
            )
        }
        ETHERTYPE_IPV6 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(r.bytes(pos + 8, 16)?);
            dst.copy_from_slice(r.bytes(pos + 24, 16)?);
            (
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
                r.u8(pos + 6)?,
                pos + 40,
            )
        }
        _ => return Ok(None),
    };

    let (transport, payload_at) = match proto {
        PROTO_UDP => (Transport::Udp, l4 + 8),
        PROTO_TCP => {
            let data_off = (r.u8(l4 + 12)? >> 4) as usize * 4;
            (Transport::Tcp, l4 + data_off)
        }
        _ => return Ok(None),
    };
    let sport = r.be16(l4)?;
    let dport = r.be16(l4 + 2)?;
    if sport != DNS_PORT && dport != DNS_PORT {
        return Ok(None);
    }

    let rest = frame.get(payload_at..).unwrap_or_default();
    let payload = match transport {
        Transport::Udp => rest,
        Transport::Tcp => {
            if rest.is_empty() {
                // Handshake and bare acks
                return Ok(None);
            }
            let rr = Reader::new(rest);
            let len = rr.be16(0)? as usize;
            rr.bytes(2, len)?
        }
    };
    Ok(Some(DnsSegment {
        saddr,
        sport,
        daddr,
        dport,
        transport,
        payload,
    }))
}

/// Source of captured link-layer frames.
pub trait PacketSource: Send {
    /// Read one frame into `buf`. `Ok(None)` means nothing arrived within the
    /// source's poll interval.
    fn next_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;
}

/// Raw AF_PACKET socket seeing every frame on every interface.
pub struct AfPacketSource {
    fd: OwnedFd,
}

impl AfPacketSource {
    pub fn open(poll: Duration) -> Result<Self> {
        let fd = socket::socket(
            AddressFamily::Packet,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::EthAll,
        )
        .context("Failed to open AF_PACKET socket")?;
        socket::setsockopt(
            &fd,
            sockopt::ReceiveTimeout,
            &TimeVal::milliseconds(poll.as_millis() as i64),
        )
        .context("Failed to set capture receive timeout")?;
        Ok(Self { fd })
    }
}

impl PacketSource for AfPacketSource {
    fn next_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()) {
            Ok(n) => Ok(Some(n)),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(e).context("Failed to read from capture socket"),
        }
    }
}

/// A source that never sees traffic, for runs without capture privileges.
pub struct NoPackets {
    poll: Duration,
}

impl NoPackets {
    pub fn new(poll: Duration) -> Self {
        Self { poll }
    }
}

impl PacketSource for NoPackets {
    fn next_frame(&mut self, _buf: &mut [u8]) -> Result<Option<usize>> {
        std::thread::sleep(self.poll);
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layout::Writer;

    /// Ethernet + IPv4 + UDP or TCP frame around `payload`.
    pub(crate) fn frame(
        src: (&str, u16),
        dst: (&str, u16),
        transport: Transport,
        vlan: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut w = Writer::new(0);
        let mut pos = 12;
        if vlan {
            w.put_be16(pos, ETHERTYPE_VLAN).put_be16(pos + 2, 42);
            pos += 4;
        }
        let saddr: Ipv4Addr = src.0.parse().unwrap();
        let daddr: Ipv4Addr = dst.0.parse().unwrap();
        w.put_be16(pos, ETHERTYPE_IPV4);
        let ip = pos + 2;
        let proto = match transport {
            Transport::Udp => PROTO_UDP,
            Transport::Tcp => PROTO_TCP,
        };
        w.put_u8(ip, 0x45)
            .put_u8(ip + 9, proto)
            .put_bytes(ip + 12, &saddr.octets())
            .put_bytes(ip + 16, &daddr.octets());
        let l4 = ip + 20;
        w.put_be16(l4, src.1).put_be16(l4 + 2, dst.1);
        match transport {
            Transport::Udp => {
                w.put_be16(l4 + 4, 8 + payload.len() as u16)
                    .put_bytes(l4 + 8, payload);
            }
            Transport::Tcp => {
                w.put_u8(l4 + 12, 5 << 4)
                    .put_be16(l4 + 20, payload.len() as u16)
                    .put_bytes(l4 + 22, payload);
            }
        }
        w.into_inner()
    }

    #[test]
    fn test_udp_frame() {
        let f = frame(("10.0.0.5", 41000), ("10.0.0.2", 53), Transport::Udp, false, b"hello");
        let seg = parse_frame(&f).unwrap().unwrap();
        assert_eq!(seg.transport, Transport::Udp);
        assert_eq!(seg.sport, 41000);
        assert_eq!(seg.daddr, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(seg.payload, b"hello");
    }

    #[test]
    fn test_tcp_frame_behind_vlan() {
        let f = frame(("10.0.0.2", 53), ("10.0.0.5", 41000), Transport::Tcp, true, b"answer");
        let seg = parse_frame(&f).unwrap().unwrap();
        assert_eq!(seg.transport, Transport::Tcp);
        assert_eq!(seg.sport, 53);
        assert_eq!(seg.payload, b"answer");
    }

    #[test]
    fn test_non_dns_and_short_frames() {
        let f = frame(("10.0.0.5", 41000), ("10.0.0.2", 443), Transport::Udp, false, b"x");
        assert_eq!(parse_frame(&f).unwrap(), None);
        let mut arp = vec![0u8; 42];
        arp[12] = 0x08;
        arp[13] = 0x06;
        assert_eq!(parse_frame(&arp).unwrap(), None);
        assert!(parse_frame(&f[..30]).is_err());
    }
}
