use crate::constants::IPV4_HEADER_SIZE;
use crate::error::{Error, Result};
use crate::types::{Port, ProbeId, Sequence, TcpFlags, TimeToLive};
use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;
use tracing::instrument;
use trippy_packet::checksum::{
    icmp_ipv4_checksum, ipv4_header_checksum, tcp_ipv4_checksum, udp_ipv4_checksum,
};
use trippy_packet::icmpv4::echo_request::EchoRequestPacket;
use trippy_packet::icmpv4::{IcmpCode, IcmpPacket, IcmpType};
use trippy_packet::ipv4::Ipv4Packet;
use trippy_packet::tcp::TcpPacket;
use trippy_packet::udp::UdpPacket;
use trippy_packet::IpProtocol;

/// The IPv4 `Don't Fragment` flag.
const DONT_FRAGMENT: u16 = 0x4000;

/// The TCP window size advertised by probes.
const TCP_WINDOW_SIZE: u16 = 0xFFFF;

/// An IPv4 datagram.
///
/// The fixed header fields are decoded once on construction, everything else is read on demand
/// through `trippy_packet` views over the raw bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Packet {
    buf: Vec<u8>,
    header: Header,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Header {
    source: Ipv4Addr,
    destination: Ipv4Addr,
    ttl: u8,
    identification: u16,
    protocol: u8,
    header_length: usize,
}

impl Packet {
    /// Decode a `Packet` from the bytes of an IPv4 datagram.
    ///
    /// Bytes beyond the declared total length (such as link layer padding) are discarded.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let mut buf = bytes.into();
        let header = {
            let ipv4 = Ipv4Packet::new_view(&buf)?;
            if ipv4.get_version() != 4 {
                return Err(Error::InvalidPacket(format!(
                    "unsupported IP version {}",
                    ipv4.get_version()
                )));
            }
            let header_length = usize::from(ipv4.get_header_length()) * 4;
            if header_length < IPV4_HEADER_SIZE || header_length > buf.len() {
                return Err(Error::InvalidPacket(format!(
                    "bad IPv4 header length {header_length}"
                )));
            }
            Header {
                source: ipv4.get_source(),
                destination: ipv4.get_destination(),
                ttl: ipv4.get_ttl(),
                identification: ipv4.get_identification(),
                protocol: ipv4.get_protocol().id(),
                header_length,
            }
        };
        let total_length = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if total_length >= header.header_length && total_length < buf.len() {
            buf.truncate(total_length);
        }
        Ok(Self { buf, header })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn source(&self) -> Ipv4Addr {
        self.header.source
    }

    #[must_use]
    pub fn destination(&self) -> Ipv4Addr {
        self.header.destination
    }

    #[must_use]
    pub fn ttl(&self) -> TimeToLive {
        TimeToLive(self.header.ttl)
    }

    #[must_use]
    pub fn identification(&self) -> u16 {
        self.header.identification
    }

    #[must_use]
    pub fn protocol(&self) -> IpProtocol {
        IpProtocol::from(self.header.protocol)
    }

    /// The bytes following the IPv4 header (and options).
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header.header_length..]
    }

    /// The (source, destination) ports of a TCP or UDP datagram.
    #[must_use]
    pub fn ports(&self) -> Option<(Port, Port)> {
        match self.protocol() {
            IpProtocol::Tcp | IpProtocol::Udp if self.payload().len() >= 4 => {
                let payload = self.payload();
                Some((
                    Port(u16::from_be_bytes([payload[0], payload[1]])),
                    Port(u16::from_be_bytes([payload[2], payload[3]])),
                ))
            }
            _ => None,
        }
    }

    /// A view over the IPv4 datagram.
    pub fn ipv4(&self) -> Result<Ipv4Packet<'_>> {
        Ok(Ipv4Packet::new_view(&self.buf)?)
    }

    /// Clone this packet with a new TTL and a recomputed IPv4 header checksum.
    ///
    /// The TTL is not covered by any transport checksum and so the rest of the datagram is sent
    /// unchanged.
    #[instrument(skip(self), level = "trace")]
    pub fn with_ttl(&self, ttl: TimeToLive) -> Result<Self> {
        let mut buf = self.buf.clone();
        let header_length = self.header.header_length;
        {
            let mut ipv4 = Ipv4Packet::new(&mut buf)?;
            ipv4.set_ttl(ttl.0);
            ipv4.set_checksum(0);
        }
        let checksum = ipv4_header_checksum(&buf[..header_length]);
        Ipv4Packet::new(&mut buf)?.set_checksum(checksum);
        Ok(Self {
            buf,
            header: Header {
                ttl: ttl.0,
                ..self.header
            },
        })
    }

    /// Is the IPv4 header checksum of this packet valid?
    #[must_use]
    pub fn has_valid_checksum(&self) -> bool {
        let stored = u16::from_be_bytes([self.buf[10], self.buf[11]]);
        stored == ipv4_header_checksum(&self.buf[..self.header.header_length])
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IP {} > {} proto={} ttl={} id={} len={}",
            self.header.source,
            self.header.destination,
            self.header.protocol,
            self.header.ttl,
            self.header.identification,
            self.buf.len()
        )
    }
}

/// Builds IPv4 probe packets between a fixed pair of addresses.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Probe {
    pub src_addr: Ipv4Addr,
    pub dest_addr: Ipv4Addr,
}

impl Ipv4Probe {
    #[must_use]
    pub const fn new(src_addr: Ipv4Addr, dest_addr: Ipv4Addr) -> Self {
        Self {
            src_addr,
            dest_addr,
        }
    }

    /// Create an ICMP `EchoRequest` probe.
    pub fn make_echo_request(
        &self,
        ttl: TimeToLive,
        id: ProbeId,
        identifier: u16,
        sequence: u16,
    ) -> Result<Packet> {
        let mut icmp_buf = vec![0_u8; IcmpPacket::minimum_packet_size()];
        let mut icmp = EchoRequestPacket::new(&mut icmp_buf)?;
        icmp.set_icmp_type(IcmpType::EchoRequest);
        icmp.set_icmp_code(IcmpCode(0));
        icmp.set_identifier(identifier);
        icmp.set_sequence(sequence);
        icmp.set_checksum(icmp_ipv4_checksum(icmp.packet()));
        self.make_ipv4_packet(IpProtocol::Icmp, ttl, id, icmp.packet())
    }

    /// Create a UDP probe.
    pub fn make_udp(
        &self,
        ttl: TimeToLive,
        id: ProbeId,
        src_port: Port,
        dest_port: Port,
        payload: &[u8],
    ) -> Result<Packet> {
        let udp_packet_size = UdpPacket::minimum_packet_size() + payload.len();
        let mut udp_buf = vec![0_u8; udp_packet_size];
        let mut udp = UdpPacket::new(&mut udp_buf)?;
        udp.set_source(src_port.0);
        udp.set_destination(dest_port.0);
        udp.set_length(udp_packet_size as u16);
        udp.set_payload(payload);
        udp.set_checksum(udp_ipv4_checksum(
            udp.packet(),
            self.src_addr,
            self.dest_addr,
        ));
        self.make_ipv4_packet(IpProtocol::Udp, ttl, id, udp.packet())
    }

    /// Create a TCP `SYN` probe.
    pub fn make_tcp_syn(
        &self,
        ttl: TimeToLive,
        id: ProbeId,
        src_port: Port,
        dest_port: Port,
        sequence: Sequence,
    ) -> Result<Packet> {
        self.make_tcp(
            ttl,
            id,
            src_port,
            dest_port,
            sequence,
            Sequence(0),
            TcpFlags::SYN,
        )
    }

    /// Create a TCP segment without payload.
    #[allow(clippy::too_many_arguments)]
    pub fn make_tcp(
        &self,
        ttl: TimeToLive,
        id: ProbeId,
        src_port: Port,
        dest_port: Port,
        sequence: Sequence,
        acknowledgement: Sequence,
        flags: TcpFlags,
    ) -> Result<Packet> {
        let mut tcp_buf = vec![0_u8; TcpPacket::minimum_packet_size()];
        let mut tcp = TcpPacket::new(&mut tcp_buf)?;
        tcp.set_data_offset(5);
        tcp.set_source(src_port.0);
        tcp.set_destination(dest_port.0);
        tcp.set_sequence(sequence.0);
        tcp.set_acknowledgement(acknowledgement.0);
        tcp.set_flags(flags.bits());
        tcp.set_window_size(TCP_WINDOW_SIZE);
        tcp.set_checksum(tcp_ipv4_checksum(
            tcp.packet(),
            self.src_addr,
            self.dest_addr,
        ));
        self.make_ipv4_packet(IpProtocol::Tcp, ttl, id, tcp.packet())
    }

    /// Wrap a transport payload in an IPv4 header.
    pub fn make_ipv4_packet(
        &self,
        protocol: IpProtocol,
        ttl: TimeToLive,
        id: ProbeId,
        payload: &[u8],
    ) -> Result<Packet> {
        let total_length = Ipv4Packet::minimum_packet_size() + payload.len();
        let total_length_header = u16::try_from(total_length)
            .map_err(|_| Error::InvalidPacket(format!("packet too large: {total_length}")))?;
        let mut ipv4_buf = vec![0_u8; total_length];
        let mut ipv4 = Ipv4Packet::new(&mut ipv4_buf)?;
        ipv4.set_version(4);
        ipv4.set_header_length(5);
        ipv4.set_total_length(total_length_header);
        ipv4.set_ttl(ttl.0);
        ipv4.set_protocol(protocol);
        ipv4.set_source(self.src_addr);
        ipv4.set_destination(self.dest_addr);
        ipv4.set_identification(id.0);
        ipv4.set_flags_and_fragment_offset(DONT_FRAGMENT);
        ipv4.set_payload(payload);
        ipv4.set_checksum(ipv4_header_checksum(
            &ipv4.packet()[..Ipv4Packet::minimum_packet_size()],
        ));
        Packet::from_bytes(ipv4_buf)
    }
}
