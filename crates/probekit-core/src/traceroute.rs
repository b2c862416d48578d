use crate::config::{defaults, Protocol, SessionConfig, TracerouteConfig};
use crate::constants::MAX_TTL;
use crate::error::{Error, Result};
use crate::hop::{hops_from_answers, Hop};
use crate::net::channel::Channel;
use crate::net::socket::Socket;
use crate::packet::{Ipv4Probe, Packet};
use crate::session::{ProbeOutcome, ProbeSession};
use crate::types::{Port, ProbeId, Sequence, TimeToLive};
use rand::Rng;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::rc::Rc;
use tracing::instrument;

/// The range random source ports are drawn from.
const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// The most probes a single run may send.
///
/// Each probe reserves its IP identification in both byte orders, so at most half of the
/// identifiers are usable.
const MAX_PROBES: usize = 16_384;

/// The lifecycle of a traceroute run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TraceState {
    Created,
    /// Probes are being written.
    Sending,
    /// Every probe is written, waiting for late responses.
    Awaiting,
    /// Responses are being grouped into hops.
    Matched,
    Done,
}

/// The result of a traceroute run.
#[derive(Debug, Clone)]
pub struct Traceroute {
    pub destination: Ipv4Addr,
    pub protocol: Protocol,
    /// One hop per TTL which received at least one response, sorted by TTL.
    pub hops: Vec<Hop>,
    /// Every probe sent and every answer received.
    pub outcome: ProbeOutcome,
}

impl Traceroute {
    /// The hops observed by probes sent towards `port`.
    #[must_use]
    pub fn hops_for_port(&self, port: Port) -> Vec<Hop> {
        self.hops.iter().filter_map(|hop| hop.for_port(port)).collect()
    }

    /// The first hop at which the destination itself responded.
    #[must_use]
    pub fn destination_hop(&self) -> Option<&Hop> {
        self.hops
            .iter()
            .find(|hop| hop.addrs().any(|addr| *addr == self.destination))
    }
}

/// Probes every TTL of a range towards a destination in a single pass.
///
/// There are no retries, a TTL whose probes are not answered within the time budget is a gap in
/// the result.
pub struct TracerouteSession<S: Socket> {
    channel: Rc<Channel<S>>,
    config: TracerouteConfig,
    state: TraceState,
}

impl<S: Socket + 'static> TracerouteSession<S> {
    pub fn new(channel: &Rc<Channel<S>>, config: TracerouteConfig) -> Self {
        tracing::debug!(?config);
        Self {
            channel: Rc::clone(channel),
            config,
            state: TraceState::Created,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TraceState {
        self.state
    }

    #[must_use]
    pub const fn config(&self) -> &TracerouteConfig {
        &self.config
    }

    /// Trace the route to `destination`.
    ///
    /// TCP and UDP probes are sent to each of `ports`, or to the protocol default port if `None`.
    /// ICMP ignores `ports`.
    #[instrument(skip(self), level = "trace")]
    pub fn run(
        &mut self,
        destination: Ipv4Addr,
        protocol: Protocol,
        ttl_range: RangeInclusive<TimeToLive>,
        ports: Option<&[Port]>,
    ) -> Result<Traceroute> {
        let (first_ttl, max_ttl) = validate_ttl_range(&ttl_range)?;
        let ports = dest_ports(protocol, ports)?;
        let probes = self.make_probes(destination, protocol, first_ttl, max_ttl, &ports)?;
        let budget = self
            .config
            .probe_interval
            .saturating_mul(u32::try_from(probes.len()).unwrap_or(u32::MAX))
            .saturating_add(self.config.grace_duration);
        let session_config = SessionConfig::new(budget)
            .send_interval(self.config.probe_interval)
            .match_options(self.config.match_options);
        self.transition(TraceState::Sending);
        let handle = ProbeSession::start_sending(&self.channel, probes, session_config)?;
        self.transition(TraceState::Awaiting);
        let outcome = handle.wait();
        self.transition(TraceState::Matched);
        let hops = hops_from_answers(&outcome.answered);
        tracing::debug!(
            %destination,
            %protocol,
            hops = hops.len(),
            reason = ?outcome.reason,
            "traceroute complete"
        );
        self.transition(TraceState::Done);
        Ok(Traceroute {
            destination,
            protocol,
            hops,
            outcome,
        })
    }

    fn make_probes(
        &self,
        destination: Ipv4Addr,
        protocol: Protocol,
        first_ttl: TimeToLive,
        max_ttl: TimeToLive,
        ports: &[Option<Port>],
    ) -> Result<Vec<Packet>> {
        let ttl_count = usize::from(max_ttl.0 - first_ttl.0) + 1;
        let total = ttl_count * ports.len() * self.config.probes_per_hop;
        if total > MAX_PROBES {
            return Err(Error::BadConfig(format!(
                "too many probes for unique identifiers: {total} > {MAX_PROBES}"
            )));
        }
        let probe = Ipv4Probe::new(self.channel.local_addr()?, destination);
        let mut rng = rand::rng();
        let src_port = self
            .config
            .source_port
            .unwrap_or_else(|| Port(rng.random_range(EPHEMERAL_PORTS)));
        let mut used = HashSet::with_capacity(total);
        let mut probes = Vec::with_capacity(total);
        for ttl in TimeToLive::range_inclusive(first_ttl, max_ttl) {
            for port in ports {
                for _ in 0..self.config.probes_per_hop {
                    let id = loop {
                        let id = rng.random_range(1..=u16::MAX);
                        if !used.contains(&id) && !used.contains(&id.swap_bytes()) {
                            used.insert(id);
                            used.insert(id.swap_bytes());
                            break ProbeId(id);
                        }
                    };
                    let packet = match (protocol, port) {
                        (Protocol::Tcp, Some(port)) => {
                            probe.make_tcp_syn(ttl, id, src_port, *port, Sequence(rng.random()))?
                        }
                        (Protocol::Udp, Some(port)) => {
                            probe.make_udp(ttl, id, src_port, *port, &[])?
                        }
                        _ => probe.make_echo_request(ttl, id, id.0, u16::from(ttl.0))?,
                    };
                    probes.push(packet);
                }
            }
        }
        Ok(probes)
    }

    fn transition(&mut self, state: TraceState) {
        tracing::trace!(from = ?self.state, to = ?state, "traceroute state");
        self.state = state;
    }
}

fn validate_ttl_range(
    ttl_range: &RangeInclusive<TimeToLive>,
) -> Result<(TimeToLive, TimeToLive)> {
    let (first_ttl, max_ttl) = (*ttl_range.start(), *ttl_range.end());
    if first_ttl.0 == 0 {
        Err(Error::BadConfig(String::from("first_ttl must be at least 1")))
    } else if first_ttl > max_ttl {
        Err(Error::BadConfig(format!(
            "first_ttl {first_ttl} > max_ttl {max_ttl}"
        )))
    } else if max_ttl.0 > MAX_TTL {
        Err(Error::BadConfig(format!("max_ttl {max_ttl} > {MAX_TTL}")))
    } else {
        Ok((first_ttl, max_ttl))
    }
}

/// The destination ports probed, a single `None` for protocols without ports.
fn dest_ports(protocol: Protocol, ports: Option<&[Port]>) -> Result<Vec<Option<Port>>> {
    match (protocol, ports) {
        (Protocol::Icmp, _) => Ok(vec![None]),
        (_, Some([])) => Err(Error::BadConfig(String::from("empty port list"))),
        (_, Some(ports)) => Ok(ports.iter().copied().map(Some).collect()),
        (Protocol::Tcp, None) => Ok(vec![Some(Port(defaults::DEFAULT_TRACEROUTE_TCP_PORT))]),
        (Protocol::Udp, None) => Ok(vec![Some(Port(defaults::DEFAULT_TRACEROUTE_UDP_PORT))]),
    }
}
