use bitflags::bitflags;
use derive_more::{Add, AddAssign, Display, Sub};

/// `TimeToLive` (ttl) newtype.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Add, Sub, AddAssign, Display,
)]
pub struct TimeToLive(pub u8);

/// Port newtype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Display)]
pub struct Port(pub u16);

/// `ProbeId` newtype.
///
/// The random value a probe is tagged with, carried in the IPv4 identification field (and in
/// the ICMP identifier for echo probes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Display)]
pub struct ProbeId(pub u16);

/// TCP `Sequence` number newtype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Display)]
pub struct Sequence(pub u32);

bitflags! {
    /// TCP header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u16 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

impl TimeToLive {
    /// The `TimeToLive` values of an inclusive range, in ascending order.
    pub fn range_inclusive(first: Self, last: Self) -> impl Iterator<Item = Self> {
        (first.0..=last.0).map(Self)
    }
}

impl From<u8> for TimeToLive {
    fn from(ttl: u8) -> Self {
        Self(ttl)
    }
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self(port)
    }
}
