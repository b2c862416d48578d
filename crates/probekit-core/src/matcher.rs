//! Pair inbound packets with the probes that caused them.
//!
//! An inbound packet either answers a probe directly (an echo reply, a TCP `SYN/ACK` or `RST`, a
//! UDP datagram from the probed port) or is an ICMP error which quotes the start of the probe.
//! Either way a [`CorrelationKey`] is derived, from the inbound packet itself for a direct reply or
//! from the quoted packet for an error, and is used to look up the candidate probes in a
//! [`PendingIndex`]. Each candidate is then confirmed against the protocol specific relationship
//! between the two packets.
//!
//! The key holds only the remote end of the flow. The local end is confirmed per candidate, as a
//! NAT may rewrite the source address quoted in an ICMP error.
use crate::config::MatchOptions;
use crate::packet::Packet;
use crate::types::TcpFlags;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::Instant;
use tracing::instrument;
use trippy_packet::icmpv4::destination_unreachable::DestinationUnreachablePacket;
use trippy_packet::icmpv4::echo_request::EchoRequestPacket;
use trippy_packet::icmpv4::time_exceeded::TimeExceededPacket;
use trippy_packet::icmpv4::{IcmpPacket, IcmpType};
use trippy_packet::ipv4::Ipv4Packet;
use trippy_packet::tcp::TcpPacket;
use trippy_packet::udp::UdpPacket;
use trippy_packet::IpProtocol;

/// ICMP source quench.
const ICMP_SOURCE_QUENCH: u8 = 4;

/// ICMP redirect.
const ICMP_REDIRECT: u8 = 5;

/// ICMP parameter problem.
const ICMP_PARAMETER_PROBLEM: u8 = 12;

/// How an inbound packet relates to the probe it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// The inbound packet is a reply from the probed host.
    DirectReply,
    /// The inbound packet is an ICMP error quoting the probe.
    EmbeddedOriginal,
}

/// A value shared by a probe and every packet which may answer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    remote: Ipv4Addr,
    protocol: u8,
    flow: Flow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Flow {
    Echo { identifier: u16 },
    Ports(u16, u16),
}

/// The transport fields of a datagram relevant to matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Echo {
        request: bool,
        identifier: u16,
        sequence: u16,
    },
    Tcp(TcpFields),
    Udp {
        source: u16,
        destination: u16,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TcpFields {
    source: u16,
    destination: u16,
    sequence: u32,
    acknowledgement: u32,
    flags: TcpFlags,
    payload_len: usize,
}

/// A minimally decoded IPv4 datagram, either a whole packet or one quoted in an ICMP error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Datagram {
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: u8,
    identification: u16,
    transport: Transport,
}

impl Datagram {
    fn decode(bytes: &[u8]) -> Option<Self> {
        let ipv4 = Ipv4Packet::new_view(bytes).ok()?;
        let header_length = usize::from(ipv4.get_header_length()) * 4;
        if ipv4.get_version() != 4 || header_length > bytes.len() {
            return None;
        }
        let protocol = ipv4.get_protocol();
        let transport = decode_transport(protocol, &bytes[header_length..])?;
        Some(Self {
            source: ipv4.get_source(),
            destination: ipv4.get_destination(),
            protocol: protocol.id(),
            identification: ipv4.get_identification(),
            transport,
        })
    }

    /// The key of this datagram as a probe sent towards its destination.
    fn probe_key(&self) -> CorrelationKey {
        self.key_towards(self.destination)
    }

    fn key_towards(&self, remote: Ipv4Addr) -> CorrelationKey {
        let flow = match self.transport {
            Transport::Echo { identifier, .. } => Flow::Echo { identifier },
            Transport::Tcp(TcpFields {
                source,
                destination,
                ..
            })
            | Transport::Udp {
                source,
                destination,
            } => Flow::Ports(source.min(destination), source.max(destination)),
        };
        CorrelationKey {
            remote,
            protocol: self.protocol,
            flow,
        }
    }
}

fn decode_transport(protocol: IpProtocol, payload: &[u8]) -> Option<Transport> {
    match protocol {
        IpProtocol::Icmp => {
            let icmp = IcmpPacket::new_view(payload).ok()?;
            let request = match icmp.get_icmp_type() {
                IcmpType::EchoRequest => true,
                IcmpType::EchoReply => false,
                _ => return None,
            };
            // echo request and reply share a layout
            let echo = EchoRequestPacket::new_view(payload).ok()?;
            Some(Transport::Echo {
                request,
                identifier: echo.get_identifier(),
                sequence: echo.get_sequence(),
            })
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_view(payload).ok()?;
            Some(Transport::Udp {
                source: udp.get_source(),
                destination: udp.get_destination(),
            })
        }
        IpProtocol::Tcp => decode_tcp(payload).map(Transport::Tcp),
        _ => None,
    }
}

/// Decode a TCP header which may be truncated.
///
/// ICMP errors are only required to quote the first 8 bytes of the original datagram payload, so
/// a quoted TCP header may be incomplete. Such headers are zero padded to the minimum TCP header
/// size, which preserves the ports and sequence number.
fn decode_tcp(payload: &[u8]) -> Option<TcpFields> {
    if payload.len() < TcpPacket::minimum_packet_size() {
        let mut buf = [0_u8; TcpPacket::minimum_packet_size()];
        buf[..payload.len()].copy_from_slice(payload);
        Some(tcp_fields(&TcpPacket::new_view(&buf).ok()?, 0))
    } else {
        let tcp = TcpPacket::new_view(payload).ok()?;
        let header_length = usize::from(tcp.get_data_offset()) * 4;
        Some(tcp_fields(
            &tcp,
            payload.len().saturating_sub(header_length),
        ))
    }
}

fn tcp_fields(tcp: &TcpPacket<'_>, payload_len: usize) -> TcpFields {
    TcpFields {
        source: tcp.get_source(),
        destination: tcp.get_destination(),
        sequence: tcp.get_sequence(),
        acknowledgement: tcp.get_acknowledgement(),
        flags: TcpFlags::from_bits_truncate(tcp.get_flags()),
        payload_len,
    }
}

/// The bytes an ICMP error quotes from the datagram which caused it.
fn quoted_datagram(icmp: &IcmpPacket<'_>) -> Option<Vec<u8>> {
    match icmp.get_icmp_type() {
        IcmpType::TimeExceeded => {
            let packet = TimeExceededPacket::new_view(icmp.packet()).ok()?;
            Some(packet.payload_raw().to_vec())
        }
        IcmpType::DestinationUnreachable => {
            let packet = DestinationUnreachablePacket::new_view(icmp.packet()).ok()?;
            Some(packet.payload().to_vec())
        }
        IcmpType::Other(ICMP_SOURCE_QUENCH | ICMP_REDIRECT | ICMP_PARAMETER_PROBLEM) => icmp
            .packet()
            .get(IcmpPacket::minimum_packet_size()..)
            .map(<[u8]>::to_vec),
        _ => None,
    }
}

/// A classified inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    correlation: Correlation,
    key: CorrelationKey,
    datagram: Datagram,
}

impl Inbound {
    #[must_use]
    pub const fn correlation(&self) -> Correlation {
        self.correlation
    }

    #[must_use]
    pub const fn key(&self) -> CorrelationKey {
        self.key
    }

    /// How well this inbound packet answers the `probe`, `None` if it does not.
    fn answers(&self, probe: &Datagram, options: MatchOptions) -> Option<Strength> {
        match self.correlation {
            Correlation::DirectReply => direct_reply_matches(probe, &self.datagram, options),
            Correlation::EmbeddedOriginal => quoted_matches(probe, &self.datagram, options),
        }
    }
}

/// Classify an inbound packet as a direct reply or an ICMP error quoting a probe.
///
/// Returns `None` for packets which cannot answer any probe.
#[instrument(level = "trace")]
#[must_use]
pub fn classify(packet: &Packet) -> Option<Inbound> {
    if packet.protocol() == IpProtocol::Icmp {
        let icmp = IcmpPacket::new_view(packet.payload()).ok()?;
        if let Some(quoted) = quoted_datagram(&icmp) {
            let datagram = Datagram::decode(&quoted)?;
            return Some(Inbound {
                correlation: Correlation::EmbeddedOriginal,
                key: datagram.probe_key(),
                datagram,
            });
        }
    }
    let datagram = Datagram::decode(packet.as_bytes())?;
    Some(Inbound {
        correlation: Correlation::DirectReply,
        key: datagram.key_towards(datagram.source),
        datagram,
    })
}

/// The key a probe is indexed by, `None` if the probe is not of a protocol which can be matched.
#[must_use]
pub fn correlation_key(probe: &Packet) -> Option<CorrelationKey> {
    Datagram::decode(probe.as_bytes()).map(|datagram| datagram.probe_key())
}

/// Does `reply` answer `probe` directly?
fn direct_reply_matches(
    probe: &Datagram,
    reply: &Datagram,
    options: MatchOptions,
) -> Option<Strength> {
    if reply.source != probe.destination
        || reply.destination != probe.source
        || reply.protocol != probe.protocol
    {
        return None;
    }
    let matches = match (probe.transport, reply.transport) {
        (
            Transport::Echo {
                request: true,
                identifier: probe_id,
                sequence: probe_seq,
            },
            Transport::Echo {
                request: false,
                identifier,
                sequence,
            },
        ) => probe_id == identifier && probe_seq == sequence,
        (Transport::Tcp(probe), Transport::Tcp(reply)) => {
            tcp_reply_matches(&probe, &reply, options)
        }
        (
            Transport::Udp {
                source: probe_src,
                destination: probe_dest,
            },
            Transport::Udp {
                source,
                destination,
            },
        ) => source == probe_dest && destination == probe_src,
        _ => false,
    };
    matches.then_some(Strength::Exact)
}

/// Does a TCP `reply` answer the `probe` segment?
///
/// A reply which acknowledges must acknowledge at most the bytes (plus `SYN` and `FIN`) the probe
/// carried.
fn tcp_reply_matches(probe: &TcpFields, reply: &TcpFields, options: MatchOptions) -> bool {
    if reply.source != probe.destination || reply.destination != probe.source {
        return false;
    }
    let ack_matches = !reply.flags.contains(TcpFlags::ACK) || {
        let advance = reply.acknowledgement.wrapping_sub(probe.sequence);
        u64::from(advance) <= probe.payload_len as u64 + 2
    };
    let seq_matches = !options.check_seq_ack || !probe.flags.contains(TcpFlags::ACK) || {
        let advance = reply.sequence.wrapping_sub(probe.acknowledgement);
        u64::from(advance) <= reply.payload_len as u64 + 2
    };
    ack_matches && seq_matches
}

/// Does the datagram `quoted` in an ICMP error match the `probe`?
fn quoted_matches(probe: &Datagram, quoted: &Datagram, options: MatchOptions) -> Option<Strength> {
    if quoted.destination != probe.destination || quoted.protocol != probe.protocol {
        return None;
    }
    if options.check_ip_src && quoted.source != probe.source {
        return None;
    }
    let strength = if !options.check_ip_id || quoted.identification == probe.identification {
        Strength::Exact
    } else if quoted.identification == probe.identification.swap_bytes() {
        Strength::SwappedId
    } else {
        return None;
    };
    let matches = match (probe.transport, quoted.transport) {
        (
            Transport::Echo {
                identifier: probe_id,
                sequence: probe_seq,
                ..
            },
            Transport::Echo {
                identifier,
                sequence,
                ..
            },
        ) => probe_id == identifier && probe_seq == sequence,
        (Transport::Tcp(probe), Transport::Tcp(quoted)) => {
            probe.source == quoted.source
                && probe.destination == quoted.destination
                && (!options.check_seq_ack || probe.sequence == quoted.sequence)
        }
        (
            Transport::Udp {
                source: probe_src,
                destination: probe_dest,
            },
            Transport::Udp {
                source,
                destination,
            },
        ) => probe_src == source && probe_dest == destination,
        _ => false,
    };
    matches.then_some(strength)
}

/// How closely a probe matches an inbound packet.
///
/// Some stacks quote the IP identification byte swapped, such a match is only taken when no
/// probe matches exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Strength {
    SwappedId,
    Exact,
}

/// A probe awaiting answers.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    packet: Packet,
    datagram: Option<Datagram>,
    sent_at: Option<Instant>,
    answers: usize,
}

impl PendingEntry {
    #[must_use]
    pub const fn packet(&self) -> &Packet {
        &self.packet
    }

    /// When the probe was written, `None` if it has not been (successfully) sent.
    #[must_use]
    pub const fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// The number of answers matched to this probe.
    #[must_use]
    pub const fn answers(&self) -> usize {
        self.answers
    }
}

/// Probes awaiting answers, indexed by [`CorrelationKey`].
///
/// Probes sharing a key are kept in the order they were sent, and each has its own slot, so
/// identical probes are answered independently and oldest first.
#[derive(Debug, Default)]
pub struct PendingIndex {
    entries: BTreeMap<usize, PendingEntry>,
    by_key: HashMap<CorrelationKey, VecDeque<usize>>,
    next_slot: usize,
}

impl PendingIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a probe which is not yet sent and return its slot.
    pub fn insert(&mut self, packet: Packet) -> usize {
        let datagram = Datagram::decode(packet.as_bytes());
        let slot = self.next_slot;
        self.next_slot += 1;
        self.entries.insert(
            slot,
            PendingEntry {
                packet,
                datagram,
                sent_at: None,
                answers: 0,
            },
        );
        slot
    }

    /// Record that the probe in `slot` was sent, making it eligible for matching.
    pub fn mark_sent(&mut self, slot: usize, sent_at: Instant) {
        if let Some(entry) = self.entries.get_mut(&slot) {
            entry.sent_at = Some(sent_at);
            if let Some(datagram) = entry.datagram {
                self.by_key
                    .entry(datagram.probe_key())
                    .or_default()
                    .push_back(slot);
            } else {
                tracing::debug!(packet = ?entry.packet, "probe cannot be matched");
            }
        }
    }

    /// Find the probes `inbound` answers.
    ///
    /// Probes matching exactly are preferred over those matching only with a byte swapped IP
    /// identification. When `multi_answer` is false at most one probe, the oldest of the best
    /// matches, is returned and it is no longer eligible for further matches. Otherwise every best
    /// matching probe is returned, oldest first, and all remain eligible.
    pub fn match_inbound(
        &mut self,
        inbound: &Inbound,
        multi_answer: bool,
        options: MatchOptions,
    ) -> Vec<usize> {
        let Some(candidates) = self.by_key.get_mut(&inbound.key) else {
            return vec![];
        };
        let entries = &self.entries;
        let confirmed = candidates
            .iter()
            .enumerate()
            .filter_map(|(position, slot)| {
                let probe = entries.get(slot)?.datagram?;
                let strength = inbound.answers(&probe, options)?;
                Some((position, *slot, strength))
            })
            .collect::<Vec<_>>();
        let Some(best) = confirmed.iter().map(|(_, _, strength)| *strength).max() else {
            return vec![];
        };
        let mut best_matches = confirmed
            .into_iter()
            .filter(|(_, _, strength)| *strength == best);
        let matched: Vec<usize> = if multi_answer {
            best_matches.map(|(_, slot, _)| slot).collect()
        } else {
            best_matches
                .next()
                .map(|(position, slot, _)| {
                    candidates.remove(position);
                    slot
                })
                .into_iter()
                .collect()
        };
        if candidates.is_empty() {
            self.by_key.remove(&inbound.key);
        }
        for slot in &matched {
            if let Some(entry) = self.entries.get_mut(slot) {
                entry.answers += 1;
            }
        }
        matched
    }

    /// Is `packet` one of the probes in this index?
    #[must_use]
    pub fn contains(&self, packet: &Packet) -> bool {
        correlation_key(packet)
            .and_then(|key| self.by_key.get(&key))
            .is_some_and(|slots| {
                slots
                    .iter()
                    .filter_map(|slot| self.entries.get(slot))
                    .any(|entry| entry.packet == *packet)
            })
    }

    /// Remove the probe in `slot`, it is no longer eligible for matching.
    pub fn remove(&mut self, slot: usize) -> Option<PendingEntry> {
        let entry = self.entries.remove(&slot)?;
        if let Some(key) = entry.datagram.map(|datagram| datagram.probe_key()) {
            if let Some(slots) = self.by_key.get_mut(&key) {
                slots.retain(|other| *other != slot);
                if slots.is_empty() {
                    self.by_key.remove(&key);
                }
            }
        }
        Some(entry)
    }

    /// Remove every probe sent before `cutoff` and return how many were removed.
    pub fn expire(&mut self, cutoff: Instant) -> usize {
        let expired = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.sent_at.is_some_and(|sent_at| sent_at < cutoff))
            .map(|(slot, _)| *slot)
            .collect::<Vec<_>>();
        for slot in &expired {
            self.remove(*slot);
        }
        expired.len()
    }

    #[must_use]
    pub fn entry(&self, slot: usize) -> Option<&PendingEntry> {
        self.entries.get(&slot)
    }

    /// Every probe, in the order they were inserted.
    pub fn entries(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
