/// The maximum time-to-live value allowed.
///
/// The IP `ttl` is an u8 (0..255) but since a `ttl` of zero isn't useful we only allow 254 distinct
/// hops (1..255).
pub const MAX_TTL: u8 = 254;

/// The maximum size of an IP frame read from the capture socket.
pub const MAX_PACKET_SIZE: usize = 65535;

/// The minimum size of an IPv4 header.
pub const IPV4_HEADER_SIZE: usize = 20;

/// Common initial TTL values used by operating systems, in ascending order.
///
/// The observed TTL of an inbound packet is subtracted from the smallest of these which is not
/// below it to estimate the hop distance to the sender.
pub const COMMON_INITIAL_TTLS: [u8; 3] = [64, 128, 255];
