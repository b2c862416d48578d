use crate::session::Answer;
use crate::types::{Port, TimeToLive};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

/// A single response observed for a hop.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HopResponse {
    /// The address which responded.
    pub addr: Ipv4Addr,
    /// The round trip time of the probe.
    pub rtt: Duration,
    /// The destination port of the probe, if it had one.
    pub dest_port: Option<Port>,
}

/// The responses observed for a single time-to-live.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Hop {
    /// The ttl of this hop.
    ttl: TimeToLive,
    /// The addrs of this hop and associated counts.
    addrs: IndexMap<Ipv4Addr, usize>,
    /// Every response, in the order they were matched.
    responses: Vec<HopResponse>,
}

impl Hop {
    #[must_use]
    pub fn new(ttl: TimeToLive) -> Self {
        Self {
            ttl,
            addrs: IndexMap::new(),
            responses: vec![],
        }
    }

    /// The time-to-live of this hop.
    #[must_use]
    pub const fn ttl(&self) -> TimeToLive {
        self.ttl
    }

    /// The set of addresses that have responded for this time-to-live, in first seen order.
    pub fn addrs(&self) -> impl Iterator<Item = &Ipv4Addr> {
        self.addrs.keys()
    }

    pub fn addrs_with_counts(&self) -> impl Iterator<Item = (&Ipv4Addr, &usize)> {
        self.addrs.iter()
    }

    /// The number of unique address observed for this time-to-live.
    #[must_use]
    pub fn addr_count(&self) -> usize {
        self.addrs.len()
    }

    #[must_use]
    pub fn responses(&self) -> &[HopResponse] {
        &self.responses
    }

    /// The total number of responses received.
    #[must_use]
    pub fn total_recv(&self) -> usize {
        self.responses.len()
    }

    /// The duration of the best response observed.
    #[must_use]
    pub fn best_ms(&self) -> Option<f64> {
        self.responses
            .iter()
            .map(|response| response.rtt)
            .min()
            .map(|best| best.as_secs_f64() * 1000_f64)
    }

    /// The duration of the worst response observed.
    #[must_use]
    pub fn worst_ms(&self) -> Option<f64> {
        self.responses
            .iter()
            .map(|response| response.rtt)
            .max()
            .map(|worst| worst.as_secs_f64() * 1000_f64)
    }

    /// The average duration of all responses.
    #[must_use]
    pub fn avg_ms(&self) -> f64 {
        if self.responses.is_empty() {
            0_f64
        } else {
            let total = self
                .responses
                .iter()
                .map(|response| response.rtt)
                .sum::<Duration>();
            (total.as_secs_f64() * 1000_f64) / self.responses.len() as f64
        }
    }

    /// This hop restricted to the responses to probes sent towards `port`.
    #[must_use]
    pub fn for_port(&self, port: Port) -> Option<Self> {
        let mut hop = Self::new(self.ttl);
        self.responses
            .iter()
            .filter(|response| response.dest_port == Some(port))
            .for_each(|response| hop.record(*response));
        (!hop.responses.is_empty()).then_some(hop)
    }

    pub(crate) fn record(&mut self, response: HopResponse) {
        *self.addrs.entry(response.addr).or_default() += 1;
        self.responses.push(response);
    }
}

/// Group answers into hops by the TTL of the probe they answer.
///
/// The result is sorted by TTL and sparse, a TTL without any answer has no hop.
pub fn hops_from_answers<'a>(answers: impl IntoIterator<Item = &'a Answer>) -> Vec<Hop> {
    let mut hops = BTreeMap::<TimeToLive, Hop>::new();
    for answer in answers {
        let ttl = answer.sent.ttl();
        hops.entry(ttl)
            .or_insert_with(|| Hop::new(ttl))
            .record(HopResponse {
                addr: answer.received.source(),
                rtt: answer.rtt(),
                dest_port: answer.sent.ports().map(|(_, dest)| dest),
            });
    }
    hops.into_values().collect()
}
