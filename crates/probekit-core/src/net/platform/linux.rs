pub use address::lookup_interface;
pub use socket::SocketImpl;

mod address {
    use crate::error::{Error, Result};
    use crate::net::Interface;
    use ipnetwork::Ipv4Network;
    use nix::sys::socket::{AddressFamily, SockaddrLike};
    use tracing::instrument;

    /// Resolve an interface name to its index and IPv4 networks.
    #[instrument(ret, level = "trace")]
    pub fn lookup_interface(name: &str) -> Result<Interface> {
        let index = nix::net::if_::if_nametoindex(name)
            .map_err(|_| Error::NoSuchInterface(name.to_string()))?;
        let networks = nix::ifaddrs::getifaddrs()
            .map_err(|_| Error::NoSuchInterface(name.to_string()))?
            .filter(|ia| ia.interface_name == name)
            .filter_map(|ia| {
                let addr = ia.address.and_then(|addr| match addr.family() {
                    Some(AddressFamily::Inet) => addr.as_sockaddr_in().map(|sin| sin.ip()),
                    _ => None,
                })?;
                let prefix = ia
                    .netmask
                    .and_then(|mask| mask.as_sockaddr_in().map(|sin| sin.ip()))
                    .and_then(|mask| ipnetwork::ipv4_mask_to_prefix(mask).ok())
                    .unwrap_or(32);
                Ipv4Network::new(addr, prefix).ok()
            })
            .collect();
        Ok(Interface {
            name: name.to_string(),
            index,
            networks,
        })
    }
}

mod socket {
    use crate::error::{IoError, IoOperation, IoResult};
    use crate::net::socket::Socket;
    use itertools::Itertools;
    use nix::libc;
    use nix::sys::select::FdSet;
    use nix::sys::time::{TimeVal, TimeValLike};
    use socket2::{Domain, Protocol, SockAddr, Type};
    use std::io;
    use std::io::Read;
    use std::net::SocketAddr;
    use std::os::fd::AsFd;
    use std::time::Duration;
    use tracing::instrument;

    /// The `ETH_P_IP` link protocol in network byte order.
    const ETH_P_IP_BE: u16 = (libc::ETH_P_IP as u16).to_be();

    /// A raw network socket.
    pub struct SocketImpl {
        inner: socket2::Socket,
    }

    impl SocketImpl {
        fn new(domain: Domain, ty: Type, protocol: Protocol) -> IoResult<Self> {
            Ok(Self {
                inner: socket2::Socket::new(domain, ty, Some(protocol))
                    .map_err(|err| IoError::Other(err, IoOperation::NewSocket))?,
            })
        }

        fn set_nonblocking(&self, nonblocking: bool) -> IoResult<()> {
            self.inner
                .set_nonblocking(nonblocking)
                .map_err(|err| IoError::Other(err, IoOperation::SetNonBlocking))
        }

        fn set_header_included(&self, included: bool) -> IoResult<()> {
            self.inner
                .set_header_included_v4(included)
                .map_err(|err| IoError::Other(err, IoOperation::SetHeaderIncluded))
        }

        fn bind_device(&self, interface: &str) -> IoResult<()> {
            self.inner
                .bind_device(Some(interface.as_bytes()))
                .map_err(|err| IoError::Other(err, IoOperation::BindDevice))
        }

        /// Bind a packet socket so it only sees IPv4 traffic on a single link.
        #[allow(unsafe_code)]
        fn bind_link(&self, ifindex: u32) -> IoResult<()> {
            let sll_ifindex = i32::try_from(ifindex).map_err(|_| {
                IoError::Bind(
                    io::Error::from(io::ErrorKind::InvalidInput),
                    format!("ifindex {ifindex}"),
                )
            })?;
            // SAFETY: the storage is zeroed and large enough for a `sockaddr_ll`, every field
            // written below belongs to that struct and the reported length matches it.
            let ((), addr) = unsafe {
                SockAddr::try_init(|storage, len| {
                    let link = storage.cast::<libc::sockaddr_ll>();
                    (*link).sll_family = libc::AF_PACKET as u16;
                    (*link).sll_protocol = ETH_P_IP_BE;
                    (*link).sll_ifindex = sll_ifindex;
                    *len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
                    Ok(())
                })
            }
            .map_err(|err| IoError::Bind(err, format!("ifindex {ifindex}")))?;
            self.inner
                .bind(&addr)
                .map_err(|err| IoError::Bind(err, format!("ifindex {ifindex}")))
        }
    }

    impl Socket for SocketImpl {
        #[instrument(level = "trace")]
        fn new_raw_send_socket_ipv4(interface: &str) -> IoResult<Self> {
            let socket = Self::new(
                Domain::IPV4,
                Type::RAW,
                Protocol::from(libc::IPPROTO_RAW),
            )?;
            socket.set_nonblocking(true)?;
            socket.set_header_included(true)?;
            socket.bind_device(interface)?;
            Ok(socket)
        }
        #[instrument(level = "trace")]
        fn new_capture_socket_ipv4(ifindex: u32) -> IoResult<Self> {
            let socket = Self::new(
                Domain::PACKET,
                Type::DGRAM,
                Protocol::from(i32::from(ETH_P_IP_BE)),
            )?;
            socket.set_nonblocking(true)?;
            socket.bind_link(ifindex)?;
            Ok(socket)
        }
        #[instrument(skip(self, buf), level = "trace")]
        fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> IoResult<()> {
            tracing::trace!(buf = format!("{:02x?}", buf.iter().format(" ")), ?addr);
            self.inner
                .send_to(buf, &SockAddr::from(addr))
                .map_err(|err| IoError::SendTo(err, addr))?;
            Ok(())
        }
        #[instrument(skip(self), level = "trace")]
        fn is_readable(&mut self, timeout: Duration) -> IoResult<bool> {
            let mut read = FdSet::new();
            read.insert(self.inner.as_fd());
            let readable = nix::sys::select::select(
                None,
                Some(&mut read),
                None,
                None,
                Some(&mut TimeVal::microseconds(
                    i64::try_from(timeout.as_micros()).unwrap_or(i64::MAX),
                )),
            );
            match readable {
                Ok(readable) => Ok(readable == 1),
                Err(nix::Error::EINTR) => Ok(false),
                Err(err) => Err(IoError::Other(io::Error::from(err), IoOperation::Select)),
            }
        }
        #[instrument(skip(self, buf), level = "trace")]
        fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
            let bytes_read = self
                .inner
                .read(buf)
                .map_err(|err| IoError::Other(err, IoOperation::Read))?;
            tracing::trace!(
                buf = format!("{:02x?}", buf[..bytes_read].iter().format(" ")),
                bytes_read
            );
            Ok(bytes_read)
        }
    }
}
