use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Platform specific network code.
#[cfg(target_os = "linux")]
mod platform;

/// A network socket.
pub mod socket;

/// A channel shared by packet listeners.
pub mod channel;

/// The platform specific socket type.
#[cfg(target_os = "linux")]
pub use platform::{lookup_interface, SocketImpl};

/// A network interface a channel is bound to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    /// The IPv4 networks assigned to the interface, the first is the primary address.
    pub networks: Vec<Ipv4Network>,
}

impl Interface {
    /// The primary IPv4 address of the interface.
    #[must_use]
    pub fn addr(&self) -> Option<Ipv4Addr> {
        self.networks.first().map(|network| network.ip())
    }

    /// Is `addr` on this host or its directly attached networks?
    ///
    /// Loopback, link-local, multicast, broadcast and unspecified addresses are always local.
    #[must_use]
    pub fn is_local(&self, addr: Ipv4Addr) -> bool {
        addr.is_loopback()
            || addr.is_link_local()
            || addr.is_multicast()
            || addr.is_broadcast()
            || addr.is_unspecified()
            || self.networks.iter().any(|network| network.contains(addr))
    }
}
