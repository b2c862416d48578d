use crate::config::{MatchOptions, TracerouteConfig};
use crate::error::{Error, Result};
use crate::net::channel::Channel;
use crate::net::socket::Socket;
use crate::traceroute::TracerouteSession;
use crate::types::Port;
use std::rc::Rc;
use std::time::Duration;

/// Build a traceroute session.
///
/// # Examples
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use probekit_core::{Builder, Channel, ChannelConfig, Protocol, TimeToLive};
/// use std::rc::Rc;
/// use std::time::Duration;
///
/// let channel = Rc::new(Channel::open(&ChannelConfig::new("eth0"))?);
/// let mut session = Builder::new()
///     .probe_interval(Duration::from_millis(100))
///     .probes_per_hop(2)
///     .build(&channel)?;
/// let addr = std::net::Ipv4Addr::new(1, 1, 1, 1);
/// let trace = session.run(addr, Protocol::Icmp, TimeToLive(1)..=TimeToLive(30), None)?;
/// # Ok(())
/// # }
/// ```
///
/// # See Also
///
/// - [`TracerouteSession`] - A single pass traceroute.
#[derive(Debug)]
pub struct Builder {
    probe_interval: Duration,
    grace_duration: Duration,
    probes_per_hop: usize,
    source_port: Option<Port>,
    match_options: MatchOptions,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            probe_interval: TracerouteConfig::default().probe_interval,
            grace_duration: TracerouteConfig::default().grace_duration,
            probes_per_hop: TracerouteConfig::default().probes_per_hop,
            source_port: TracerouteConfig::default().source_port,
            match_options: TracerouteConfig::default().match_options,
        }
    }
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the spacing between two probes.
    #[must_use]
    pub fn probe_interval(self, probe_interval: Duration) -> Self {
        Self {
            probe_interval,
            ..self
        }
    }

    /// Set the time allowed for late responses after the last probe is sent.
    #[must_use]
    pub fn grace_duration(self, grace_duration: Duration) -> Self {
        Self {
            grace_duration,
            ..self
        }
    }

    /// Set the number of probes sent for each TTL and port.
    #[must_use]
    pub fn probes_per_hop(self, probes_per_hop: usize) -> Self {
        Self {
            probes_per_hop,
            ..self
        }
    }

    /// Set a fixed source port for TCP and UDP probes.
    ///
    /// A random ephemeral port is chosen for every run if not set.
    #[must_use]
    pub fn source_port(self, source_port: Option<u16>) -> Self {
        Self {
            source_port: source_port.map(Port),
            ..self
        }
    }

    #[must_use]
    pub fn match_options(self, match_options: MatchOptions) -> Self {
        Self {
            match_options,
            ..self
        }
    }

    /// Build the [`TracerouteSession`] over `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadConfig`] if `probes_per_hop` is zero or the source port is zero.
    pub fn build<S: Socket + 'static>(
        self,
        channel: &Rc<Channel<S>>,
    ) -> Result<TracerouteSession<S>> {
        if self.probes_per_hop == 0 {
            return Err(Error::BadConfig(String::from(
                "probes_per_hop must be at least 1",
            )));
        }
        if self.source_port == Some(Port(0)) {
            return Err(Error::BadConfig(String::from("source_port must not be 0")));
        }
        let config = TracerouteConfig {
            probe_interval: self.probe_interval,
            grace_duration: self.grace_duration,
            probes_per_hop: self.probes_per_hop,
            source_port: self.source_port,
            match_options: self.match_options,
        };
        Ok(TracerouteSession::new(channel, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults;
    use crate::net::socket::tests::SimNetwork;

    #[test]
    fn test_builder_minimal() -> anyhow::Result<()> {
        let network = SimNetwork::silent();
        let session = Builder::new().build(&network.channel)?;
        let config = session.config();
        assert_eq!(defaults::DEFAULT_TRACEROUTE_PROBE_INTERVAL, config.probe_interval);
        assert_eq!(defaults::DEFAULT_TRACEROUTE_GRACE_DURATION, config.grace_duration);
        assert_eq!(defaults::DEFAULT_TRACEROUTE_PROBES_PER_HOP, config.probes_per_hop);
        assert_eq!(None, config.source_port);
        assert!(config.match_options.check_ip_id);
        assert!(!config.match_options.check_ip_src);
        Ok(())
    }

    #[test]
    fn test_builder_full() -> anyhow::Result<()> {
        let network = SimNetwork::silent();
        let options = MatchOptions {
            check_ip_src: true,
            check_ip_id: false,
            check_seq_ack: true,
        };
        let session = Builder::new()
            .probe_interval(Duration::from_millis(50))
            .grace_duration(Duration::from_secs(1))
            .probes_per_hop(3)
            .source_port(Some(33000))
            .match_options(options)
            .build(&network.channel)?;
        let config = session.config();
        assert_eq!(Duration::from_millis(50), config.probe_interval);
        assert_eq!(Duration::from_secs(1), config.grace_duration);
        assert_eq!(3, config.probes_per_hop);
        assert_eq!(Some(Port(33000)), config.source_port);
        assert_eq!(options, config.match_options);
        Ok(())
    }

    #[test]
    fn test_zero_probes_per_hop() {
        let network = SimNetwork::silent();
        let err = Builder::new()
            .probes_per_hop(0)
            .build(&network.channel)
            .err()
            .unwrap();
        assert!(matches!(err, Error::BadConfig(s) if s == "probes_per_hop must be at least 1"));
    }

    #[test]
    fn test_zero_source_port() {
        let network = SimNetwork::silent();
        let err = Builder::new()
            .source_port(Some(0))
            .build(&network.channel)
            .err()
            .unwrap();
        assert!(matches!(err, Error::BadConfig(_)));
    }
}
