use crate::types::{Port, TimeToLive};
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Default values for configuration.
pub mod defaults {
    use std::time::Duration;

    /// The default value for `read-timeout`.
    ///
    /// The maximum time the channel waits for the capture socket to become readable in a single
    /// poll.
    pub const DEFAULT_CHANNEL_READ_TIMEOUT: Duration = Duration::from_millis(10);

    /// The default value for the session `timeout`.
    pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

    /// The default value for `expected-answers` (disabled).
    pub const DEFAULT_SESSION_EXPECTED_ANSWERS: usize = 0;

    /// The default value for `first-ttl`.
    pub const DEFAULT_TRACEROUTE_FIRST_TTL: u8 = 1;

    /// The default value for `max-ttl`.
    pub const DEFAULT_TRACEROUTE_MAX_TTL: u8 = 30;

    /// The default spacing between two traceroute probes.
    pub const DEFAULT_TRACEROUTE_PROBE_INTERVAL: Duration = Duration::from_millis(200);

    /// The default time allowed for late responses after the last probe is sent.
    pub const DEFAULT_TRACEROUTE_GRACE_DURATION: Duration = Duration::from_secs(5);

    /// The default number of probes sent for each (ttl, port).
    pub const DEFAULT_TRACEROUTE_PROBES_PER_HOP: usize = 1;

    /// The default destination port for TCP traceroute.
    pub const DEFAULT_TRACEROUTE_TCP_PORT: u16 = 80;

    /// The default destination port for UDP traceroute.
    pub const DEFAULT_TRACEROUTE_UDP_PORT: u16 = 33434;

    /// The destination ports a full measurement traces towards.
    pub const DEFAULT_TRACEROUTE_PORTS: [u16; 9] = [0, 22, 23, 53, 80, 123, 443, 8080, 65535];

    /// The default maximum number of hosts the injector traces at once.
    pub const DEFAULT_INJECTOR_MAX_HOSTS: usize = 7;

    /// The default chance (in percent) that an observed packet is cloned.
    pub const DEFAULT_INJECTOR_RATE_PERCENT: u8 = 15;

    /// The default lowest TTL injected.
    pub const DEFAULT_INJECTOR_MIN_TTL: u8 = 1;

    /// The default highest TTL injected.
    pub const DEFAULT_INJECTOR_MAX_TTL: u8 = 15;

    /// The default time an injected probe waits for its ICMP error.
    pub const DEFAULT_INJECTOR_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
}

/// The probing protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Protocol {
    /// Internet Control Message Protocol
    Icmp,
    /// User Datagram Protocol
    Udp,
    /// Transmission Control Protocol
    Tcp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Icmp => write!(f, "icmp"),
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// Packet channel configuration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelConfig {
    pub interface: String,
    pub read_timeout: Duration,
}

impl ChannelConfig {
    #[must_use]
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            ..Self::default()
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            read_timeout: defaults::DEFAULT_CHANNEL_READ_TIMEOUT,
        }
    }
}

/// Extra checks applied when deciding whether a packet answers a probe.
///
/// All checks are off by default as some network stacks and middleboxes rewrite the fields
/// involved.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct MatchOptions {
    /// The source address quoted in an ICMP error must equal the probe source address, a NAT may
    /// rewrite it otherwise.
    pub check_ip_src: bool,
    /// The IP identification quoted in an ICMP error must equal the probe's, in either byte
    /// order. An exact match is preferred.
    pub check_ip_id: bool,
    /// The TCP sequence quoted in an ICMP error must equal the probe's, and a direct reply's
    /// sequence must agree with the probe's acknowledgement.
    pub check_seq_ack: bool,
}

/// Probe session configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SessionConfig {
    /// Time allowed from the start of sending until the session completes.
    pub timeout: Duration,
    /// Complete once this many answers are recorded, disabled when zero.
    pub expected_answers: usize,
    /// Allow a sent packet to be answered more than once.
    pub multi_answer: bool,
    /// Spacing between consecutive sends, all packets are sent at once when zero.
    pub send_interval: Duration,
    pub match_options: MatchOptions,
}

impl SessionConfig {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn expected_answers(self, expected_answers: usize) -> Self {
        Self {
            expected_answers,
            ..self
        }
    }

    #[must_use]
    pub fn multi_answer(self, multi_answer: bool) -> Self {
        Self {
            multi_answer,
            ..self
        }
    }

    #[must_use]
    pub fn send_interval(self, send_interval: Duration) -> Self {
        Self {
            send_interval,
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
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: defaults::DEFAULT_SESSION_TIMEOUT,
            expected_answers: defaults::DEFAULT_SESSION_EXPECTED_ANSWERS,
            multi_answer: false,
            send_interval: Duration::ZERO,
            match_options: MatchOptions::default(),
        }
    }
}

/// Traceroute configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TracerouteConfig {
    pub probe_interval: Duration,
    pub grace_duration: Duration,
    pub probes_per_hop: usize,
    /// The source port of TCP and UDP probes, a random ephemeral port per run when `None`.
    pub source_port: Option<Port>,
    pub match_options: MatchOptions,
}

impl Default for TracerouteConfig {
    fn default() -> Self {
        Self {
            probe_interval: defaults::DEFAULT_TRACEROUTE_PROBE_INTERVAL,
            grace_duration: defaults::DEFAULT_TRACEROUTE_GRACE_DURATION,
            probes_per_hop: defaults::DEFAULT_TRACEROUTE_PROBES_PER_HOP,
            source_port: None,
            match_options: MatchOptions {
                check_ip_id: true,
                ..MatchOptions::default()
            },
        }
    }
}

/// Passive probe injector configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InjectorConfig {
    pub max_hosts: usize,
    pub rate_percent: u8,
    pub min_ttl: TimeToLive,
    pub max_ttl: TimeToLive,
    /// Injected probes still unanswered after this long are forgotten.
    pub reply_timeout: Duration,
    pub match_options: MatchOptions,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            max_hosts: defaults::DEFAULT_INJECTOR_MAX_HOSTS,
            rate_percent: defaults::DEFAULT_INJECTOR_RATE_PERCENT,
            min_ttl: TimeToLive(defaults::DEFAULT_INJECTOR_MIN_TTL),
            max_ttl: TimeToLive(defaults::DEFAULT_INJECTOR_MAX_TTL),
            reply_timeout: defaults::DEFAULT_INJECTOR_REPLY_TIMEOUT,
            match_options: MatchOptions {
                check_ip_id: true,
                ..MatchOptions::default()
            },
        }
    }
}
