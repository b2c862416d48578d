use crate::config::InjectorConfig;
use crate::constants::{COMMON_INITIAL_TTLS, MAX_TTL};
use crate::error::{Error, Result};
use crate::hop::{Hop, HopResponse};
use crate::matcher::{classify, Correlation, PendingIndex};
use crate::net::channel::{Channel, ListenerId, PacketListener};
use crate::net::socket::Socket;
use crate::packet::Packet;
use crate::types::TimeToLive;
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use trippy_packet::IpProtocol;

/// The hops discovered by a passive probe injector.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct InjectorReport {
    /// The hops towards each traced host, sorted by TTL, hosts in the order they were discovered.
    pub hosts: IndexMap<Ipv4Addr, Vec<Hop>>,
    /// The number of probes injected.
    pub sent: usize,
    /// The number of ICMP responses matched to an injected probe.
    pub received: usize,
}

/// A remote host whose traffic is used to carry probes.
#[derive(Debug)]
struct Candidate {
    /// The highest TTL probed towards this host.
    bound: TimeToLive,
    /// The current TTL permutation.
    plan: Vec<TimeToLive>,
    /// The position of the next TTL in `plan`.
    cursor: usize,
    hops: BTreeMap<TimeToLive, Hop>,
}

/// Parasitic traceroute.
///
/// Watches TCP traffic between this host and remote hosts and occasionally sends a copy of an
/// outbound segment with a lowered TTL. The copy belongs to an existing connection and so travels
/// the same path through middleboxes as the connection itself. The ICMP time exceeded errors the
/// copies provoke reveal the routers on that path.
pub struct PassiveProbeInjector<S: Socket, R: Rng> {
    channel: Rc<Channel<S>>,
    config: InjectorConfig,
    rng: R,
    listener_id: Option<ListenerId>,
    candidates: IndexMap<Ipv4Addr, Candidate>,
    pending: PendingIndex,
    sent: usize,
    received: usize,
    stopped: bool,
}

impl<S: Socket + 'static> PassiveProbeInjector<S, StdRng> {
    /// Start injecting probes into traffic seen on `channel`.
    pub fn start(
        channel: &Rc<Channel<S>>,
        config: InjectorConfig,
    ) -> Result<InjectorHandle<S, StdRng>> {
        Self::start_with_rng(channel, config, StdRng::from_os_rng())
    }
}

impl<S: Socket + 'static, R: Rng + 'static> PassiveProbeInjector<S, R> {
    /// Start injecting probes, drawing every random choice from `rng`.
    pub fn start_with_rng(
        channel: &Rc<Channel<S>>,
        config: InjectorConfig,
        rng: R,
    ) -> Result<InjectorHandle<S, R>> {
        tracing::debug!(?config);
        validate(&config)?;
        let injector = Rc::new(RefCell::new(Self {
            channel: Rc::clone(channel),
            config,
            rng,
            listener_id: None,
            candidates: IndexMap::new(),
            pending: PendingIndex::new(),
            sent: 0,
            received: 0,
            stopped: false,
        }));
        let id = channel.register(injector.clone())?;
        injector.borrow_mut().listener_id = Some(id);
        Ok(InjectorHandle {
            channel: Rc::clone(channel),
            injector,
        })
    }
}

impl<S: Socket, R: Rng> PassiveProbeInjector<S, R> {
    fn observe_tcp(&mut self, packet: &Packet) {
        let (source, destination) = (packet.source(), packet.destination());
        match (
            self.channel.is_local(source),
            self.channel.is_local(destination),
        ) {
            (true, false) => {
                self.discover(destination, self.config.max_ttl);
                if self.candidates.contains_key(&destination) {
                    self.maybe_inject(packet, destination);
                }
            }
            (false, true) => {
                let bound = hop_estimate(packet.ttl()).min(self.config.max_ttl);
                if self.candidates.contains_key(&source) {
                    self.tighten(source, bound);
                } else {
                    self.discover(source, bound);
                }
            }
            _ => {}
        }
    }

    fn discover(&mut self, host: Ipv4Addr, bound: TimeToLive) {
        if self.candidates.contains_key(&host) || self.candidates.len() >= self.config.max_hosts {
            return;
        }
        let bound = bound.max(self.config.min_ttl);
        tracing::debug!(%host, %bound, "tracing host");
        self.candidates.insert(
            host,
            Candidate {
                bound,
                plan: vec![],
                cursor: 0,
                hops: BTreeMap::new(),
            },
        );
    }

    /// Lower the bound of a known host, the next TTL is drawn from a fresh permutation.
    fn tighten(&mut self, host: Ipv4Addr, bound: TimeToLive) {
        let bound = bound.max(self.config.min_ttl);
        let Some(candidate) = self.candidates.get_mut(&host) else {
            return;
        };
        if bound < candidate.bound {
            tracing::debug!(%host, from = %candidate.bound, to = %bound, "tightened bound");
            candidate.bound = bound;
            candidate.cursor = candidate.plan.len();
        }
    }

    fn maybe_inject(&mut self, packet: &Packet, host: Ipv4Addr) {
        if self.rng.random_range(1..=100) > self.config.rate_percent {
            return;
        }
        let Some(ttl) = self.next_ttl(host) else {
            return;
        };
        let clone = match packet.with_ttl(ttl) {
            Ok(clone) => clone,
            Err(err) => {
                tracing::warn!(%err, "failed to clone packet");
                return;
            }
        };
        if let Some(cutoff) = Instant::now().checked_sub(self.config.reply_timeout) {
            let expired = self.pending.expire(cutoff);
            if expired > 0 {
                tracing::trace!(expired, "forgot unanswered probes");
            }
        }
        let slot = self.pending.insert(clone.clone());
        match self.channel.send(&clone) {
            Ok(()) => {
                tracing::trace!(%host, %ttl, "injected probe");
                self.pending.mark_sent(slot, Instant::now());
                self.sent += 1;
            }
            Err(err) => {
                self.pending.remove(slot);
                tracing::warn!(%err, %host, "failed to inject probe");
            }
        }
    }

    /// The next TTL from the host's current permutation, drawing a fresh one when exhausted.
    fn next_ttl(&mut self, host: Ipv4Addr) -> Option<TimeToLive> {
        let min_ttl = self.config.min_ttl;
        let candidate = self.candidates.get_mut(&host)?;
        if candidate.cursor >= candidate.plan.len() {
            candidate.plan = ttl_permutation(&mut self.rng, min_ttl, candidate.bound);
            candidate.cursor = 0;
        }
        let ttl = candidate.plan.get(candidate.cursor).copied();
        candidate.cursor += 1;
        ttl
    }

    fn observe_icmp(&mut self, packet: &Packet, received_at: Instant) {
        let Some(inbound) = classify(packet) else {
            return;
        };
        if inbound.correlation() != Correlation::EmbeddedOriginal {
            return;
        }
        for slot in self
            .pending
            .match_inbound(&inbound, false, self.config.match_options)
        {
            let Some(entry) = self.pending.entry(slot) else {
                continue;
            };
            let probe = entry.packet();
            let Some(candidate) = self.candidates.get_mut(&probe.destination()) else {
                continue;
            };
            let ttl = probe.ttl();
            let rtt = entry
                .sent_at()
                .map_or(Duration::ZERO, |sent_at| {
                    received_at.saturating_duration_since(sent_at)
                });
            candidate
                .hops
                .entry(ttl)
                .or_insert_with(|| Hop::new(ttl))
                .record(HopResponse {
                    addr: packet.source(),
                    rtt,
                    dest_port: probe.ports().map(|(_, dest)| dest),
                });
            self.received += 1;
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        tracing::debug!(sent = self.sent, received = self.received, "injector stopped");
        self.stopped = true;
        if let Some(id) = self.listener_id.take() {
            self.channel.unregister(id);
        }
    }

    fn report(&self) -> InjectorReport {
        InjectorReport {
            hosts: self
                .candidates
                .iter()
                .map(|(host, candidate)| (*host, candidate.hops.values().cloned().collect()))
                .collect(),
            sent: self.sent,
            received: self.received,
        }
    }
}

impl<S: Socket, R: Rng> PacketListener for PassiveProbeInjector<S, R> {
    fn packet_received(&mut self, packet: &Packet, received_at: Instant) {
        if self.stopped || self.pending.contains(packet) {
            return;
        }
        match packet.protocol() {
            IpProtocol::Tcp => self.observe_tcp(packet),
            IpProtocol::Icmp => self.observe_icmp(packet, received_at),
            _ => {}
        }
    }

    fn channel_closed(&mut self) {
        self.listener_id = None;
        self.stop();
    }
}

/// Drives a running [`PassiveProbeInjector`].
pub struct InjectorHandle<S: Socket, R: Rng> {
    channel: Rc<Channel<S>>,
    injector: Rc<RefCell<PassiveProbeInjector<S, R>>>,
}

impl<S: Socket, R: Rng> InjectorHandle<S, R> {
    /// Observe and inject for `duration`, then stop and report.
    ///
    /// Stops early if the channel closes.
    pub fn run_for(&self, duration: Duration) -> InjectorReport {
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.is_running() {
                break;
            }
            let max_wait = remaining.min(self.channel.read_timeout());
            if let Err(err) = self.channel.poll(max_wait) {
                tracing::debug!(%err, "injector interrupted");
                break;
            }
        }
        self.stop();
        self.report()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.injector.borrow().stopped
    }

    /// Stop injecting, this has no effect if already stopped.
    pub fn stop(&self) {
        self.injector.borrow_mut().stop();
    }

    /// The hops discovered so far.
    #[must_use]
    pub fn report(&self) -> InjectorReport {
        self.injector.borrow().report()
    }
}

impl<S: Socket, R: Rng> Drop for InjectorHandle<S, R> {
    fn drop(&mut self) {
        if let Ok(mut injector) = self.injector.try_borrow_mut() {
            injector.stop();
        }
    }
}

fn validate(config: &InjectorConfig) -> Result<()> {
    if config.max_hosts == 0 {
        Err(Error::BadConfig(String::from("max_hosts must be at least 1")))
    } else if config.rate_percent > 100 {
        Err(Error::BadConfig(format!(
            "rate_percent {} > 100",
            config.rate_percent
        )))
    } else if config.min_ttl.0 == 0 || config.min_ttl > config.max_ttl {
        Err(Error::BadConfig(format!(
            "invalid ttl range {}..={}",
            config.min_ttl, config.max_ttl
        )))
    } else if config.max_ttl.0 > MAX_TTL {
        Err(Error::BadConfig(format!(
            "max_ttl {} > {MAX_TTL}",
            config.max_ttl
        )))
    } else {
        Ok(())
    }
}

/// Estimate the number of hops a packet travelled from the TTL it arrived with.
///
/// Assumes the sender used the smallest common initial TTL not below the observed TTL.
fn hop_estimate(observed: TimeToLive) -> TimeToLive {
    let initial = COMMON_INITIAL_TTLS
        .iter()
        .copied()
        .find(|initial| *initial >= observed.0)
        .unwrap_or(u8::MAX);
    TimeToLive(initial - observed.0)
}

/// A random ordering of `min..=max`, never in ascending order when it has two or more elements.
fn ttl_permutation<R: Rng>(rng: &mut R, min: TimeToLive, max: TimeToLive) -> Vec<TimeToLive> {
    let mut ttls = TimeToLive::range_inclusive(min, max).collect::<Vec<_>>();
    if ttls.len() < 2 {
        return ttls;
    }
    loop {
        ttls.shuffle(rng);
        if ttls.windows(2).any(|pair| pair[0] > pair[1]) {
            return ttls;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoError;
    use crate::net::socket::tests::{SimNetwork, LOCAL_ADDR};
    use crate::net::socket::MockSocket;
    use crate::packet::tests::time_exceeded;
    use crate::packet::Ipv4Probe;
    use crate::types::{Port, ProbeId, Sequence, TcpFlags};
    use std::net::{IpAddr, SocketAddr};
    use std::sync::{Arc, Mutex};
    use test_case::test_case;

    const REMOTE: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
    const NEIGHBOUR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn router(ttl: u8) -> Ipv4Addr {
        Ipv4Addr::new(172, 16, ttl, 1)
    }

    fn outbound(id: u16) -> anyhow::Result<Packet> {
        Ok(Ipv4Probe::new(LOCAL_ADDR, REMOTE).make_tcp(
            TimeToLive(64),
            ProbeId(id),
            Port(51000),
            Port(443),
            Sequence(u32::from(id) * 100),
            Sequence(7),
            TcpFlags::ACK | TcpFlags::PSH,
        )?)
    }

    fn inbound(from: Ipv4Addr, ttl: u8) -> anyhow::Result<Packet> {
        Ok(Ipv4Probe::new(from, LOCAL_ADDR).make_tcp(
            TimeToLive(ttl),
            ProbeId(1),
            Port(443),
            Port(51000),
            Sequence(7),
            Sequence(100),
            TcpFlags::ACK,
        )?)
    }

    fn config(rate_percent: u8, max_ttl: u8) -> InjectorConfig {
        InjectorConfig {
            rate_percent,
            max_ttl: TimeToLive(max_ttl),
            ..InjectorConfig::default()
        }
    }

    fn start(
        network: &SimNetwork,
        config: InjectorConfig,
    ) -> anyhow::Result<InjectorHandle<MockSocket, StdRng>> {
        Ok(PassiveProbeInjector::start_with_rng(
            &network.channel,
            config,
            StdRng::seed_from_u64(42),
        )?)
    }

    #[test_case(64, 0; "linux default unchanged")]
    #[test_case(52, 12; "linux")]
    #[test_case(116, 12; "windows")]
    #[test_case(240, 15; "network equipment")]
    #[test_case(255, 0; "max")]
    fn test_hop_estimate(observed: u8, expected: u8) {
        assert_eq!(TimeToLive(expected), hop_estimate(TimeToLive(observed)));
    }

    #[test]
    fn test_ttl_permutation_is_never_ascending() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let plan = ttl_permutation(&mut rng, TimeToLive(1), TimeToLive(3));
            let mut sorted = plan.clone();
            sorted.sort();
            assert_eq!(vec![TimeToLive(1), TimeToLive(2), TimeToLive(3)], sorted);
            assert_ne!(sorted, plan);
        }
    }

    #[test]
    fn test_ttl_permutation_of_single_ttl() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(
            vec![TimeToLive(5)],
            ttl_permutation(&mut rng, TimeToLive(5), TimeToLive(5))
        );
    }

    #[test]
    fn test_each_cycle_is_a_permutation() -> anyhow::Result<()> {
        let injected = Arc::new(Mutex::new(vec![]));
        let recorded = Arc::clone(&injected);
        let network = SimNetwork::new(move |packet| {
            recorded.lock().unwrap().push(packet.ttl().0);
            Ok(vec![])
        });
        let handle = start(&network, config(100, 6))?;
        for id in 1..=18 {
            network.inject(&outbound(id)?);
        }
        let report = handle.run_for(Duration::from_millis(50));
        let ttls = injected.lock().unwrap().clone();
        assert_eq!(18, report.sent);
        assert_eq!(18, ttls.len());
        for cycle in ttls.chunks(6) {
            let mut sorted = cycle.to_vec();
            sorted.sort_unstable();
            assert_eq!(vec![1, 2, 3, 4, 5, 6], sorted);
            assert_ne!(sorted, cycle);
        }
        Ok(())
    }

    #[test]
    fn test_inbound_host_bounds_ttl() -> anyhow::Result<()> {
        let injected = Arc::new(Mutex::new(vec![]));
        let recorded = Arc::clone(&injected);
        let network = SimNetwork::new(move |packet| {
            assert!(packet.has_valid_checksum());
            recorded.lock().unwrap().push(packet.ttl().0);
            Ok(vec![])
        });
        let handle = start(&network, config(100, 15))?;
        network.inject(&inbound(REMOTE, 60)?);
        for id in 1..=8 {
            network.inject(&outbound(id)?);
        }
        handle.run_for(Duration::from_millis(50));
        let ttls = injected.lock().unwrap().clone();
        assert_eq!(8, ttls.len());
        assert!(ttls.iter().all(|ttl| (1..=4).contains(ttl)));
        Ok(())
    }

    #[test]
    fn test_inbound_segment_tightens_known_host() -> anyhow::Result<()> {
        let injected = Arc::new(Mutex::new(vec![]));
        let recorded = Arc::clone(&injected);
        let network = SimNetwork::new(move |packet| {
            recorded.lock().unwrap().push(packet.ttl().0);
            Ok(vec![])
        });
        let handle = start(&network, config(100, 15))?;
        network.inject(&outbound(1)?);
        network.inject(&inbound(REMOTE, 60)?);
        for id in 2..=16 {
            network.inject(&outbound(id)?);
        }
        let report = handle.run_for(Duration::from_millis(80));
        let ttls = injected.lock().unwrap().clone();
        assert_eq!(16, report.sent);
        assert_eq!(16, ttls.len());
        assert!((1..=15).contains(&ttls[0]));
        assert!(ttls[1..].iter().all(|ttl| (1..=4).contains(ttl)));
        Ok(())
    }

    #[test]
    fn test_inbound_segment_never_raises_bound() -> anyhow::Result<()> {
        let injected = Arc::new(Mutex::new(vec![]));
        let recorded = Arc::clone(&injected);
        let network = SimNetwork::new(move |packet| {
            recorded.lock().unwrap().push(packet.ttl().0);
            Ok(vec![])
        });
        let handle = start(&network, config(100, 15))?;
        network.inject(&inbound(REMOTE, 60)?);
        network.inject(&inbound(REMOTE, 52)?);
        for id in 1..=8 {
            network.inject(&outbound(id)?);
        }
        handle.run_for(Duration::from_millis(50));
        let ttls = injected.lock().unwrap().clone();
        assert_eq!(8, ttls.len());
        assert!(ttls.iter().all(|ttl| (1..=4).contains(ttl)));
        Ok(())
    }

    #[test]
    fn test_unanswered_injections_are_forgotten() -> anyhow::Result<()> {
        let network = SimNetwork::silent();
        let config = InjectorConfig {
            reply_timeout: Duration::from_millis(20),
            ..config(100, 15)
        };
        let handle = start(&network, config)?;
        let drain = || -> anyhow::Result<()> {
            for _ in 0..40 {
                network.channel.poll(Duration::from_millis(1))?;
            }
            Ok(())
        };
        for id in 1..=10 {
            network.inject(&outbound(id)?);
        }
        drain()?;
        assert_eq!(10, handle.injector.borrow().pending.len());
        std::thread::sleep(Duration::from_millis(30));
        network.inject(&outbound(11)?);
        drain()?;
        assert_eq!(1, handle.injector.borrow().pending.len());
        assert_eq!(11, handle.report().sent);
        Ok(())
    }

    #[test]
    fn test_failed_injection_is_not_pending() -> anyhow::Result<()> {
        let network = SimNetwork::new(|packet| {
            Err(IoError::SendTo(
                std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                SocketAddr::new(IpAddr::V4(packet.destination()), 0),
            ))
        });
        let handle = start(&network, config(100, 15))?;
        for id in 1..=5 {
            network.inject(&outbound(id)?);
        }
        for _ in 0..10 {
            network.channel.poll(Duration::from_millis(1))?;
        }
        assert!(handle.injector.borrow().pending.is_empty());
        assert_eq!(0, handle.report().sent);
        Ok(())
    }

    #[test]
    fn test_time_exceeded_becomes_hop() -> anyhow::Result<()> {
        let network = SimNetwork::new(|packet| {
            let ttl = packet.ttl().0;
            if ttl < 3 {
                Ok(vec![time_exceeded(router(ttl), packet).unwrap()])
            } else {
                Ok(vec![])
            }
        });
        let handle = start(&network, config(100, 4))?;
        for id in 1..=4 {
            network.inject(&outbound(id)?);
        }
        let report = handle.run_for(Duration::from_millis(50));
        assert_eq!(4, report.sent);
        assert_eq!(2, report.received);
        let hops = &report.hosts[&REMOTE];
        assert_eq!(
            vec![TimeToLive(1), TimeToLive(2)],
            hops.iter().map(Hop::ttl).collect::<Vec<_>>()
        );
        assert_eq!(vec![&router(2)], hops[1].addrs().collect::<Vec<_>>());
        assert_eq!(Some(Port(443)), hops[1].responses()[0].dest_port);
        Ok(())
    }

    #[test]
    fn test_zero_rate_never_injects() -> anyhow::Result<()> {
        let network = SimNetwork::silent();
        let handle = start(&network, config(0, 10))?;
        for id in 1..=10 {
            network.inject(&outbound(id)?);
        }
        let report = handle.run_for(Duration::from_millis(30));
        assert_eq!(0, report.sent);
        assert_eq!(vec![&REMOTE], report.hosts.keys().collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_local_traffic_is_ignored() -> anyhow::Result<()> {
        let network = SimNetwork::silent();
        let handle = start(&network, config(100, 10))?;
        let local = Ipv4Probe::new(LOCAL_ADDR, NEIGHBOUR).make_tcp_syn(
            TimeToLive(64),
            ProbeId(1),
            Port(50000),
            Port(22),
            Sequence(1),
        )?;
        network.inject(&local);
        network.inject(&inbound(NEIGHBOUR, 64)?);
        let report = handle.run_for(Duration::from_millis(30));
        assert!(report.hosts.is_empty());
        assert_eq!(0, report.sent);
        Ok(())
    }

    #[test]
    fn test_candidates_are_capped() -> anyhow::Result<()> {
        let network = SimNetwork::silent();
        let config = InjectorConfig {
            max_hosts: 2,
            ..config(0, 10)
        };
        let handle = start(&network, config)?;
        for host in 1..=4 {
            network.inject(&inbound(Ipv4Addr::new(198, 51, 100, host), 50)?);
        }
        let report = handle.run_for(Duration::from_millis(30));
        assert_eq!(
            vec![
                &Ipv4Addr::new(198, 51, 100, 1),
                &Ipv4Addr::new(198, 51, 100, 2)
            ],
            report.hosts.keys().collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn test_stop_is_idempotent() -> anyhow::Result<()> {
        let network = SimNetwork::silent();
        let handle = start(&network, InjectorConfig::default())?;
        assert_eq!(1, network.channel.listener_count());
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
        assert_eq!(0, network.channel.listener_count());
        Ok(())
    }

    #[test]
    fn test_invalid_config() {
        let network = SimNetwork::silent();
        let config = InjectorConfig {
            rate_percent: 101,
            ..InjectorConfig::default()
        };
        let err = PassiveProbeInjector::start(&network.channel, config)
            .err()
            .unwrap();
        assert!(matches!(err, Error::BadConfig(_)));
    }
}
