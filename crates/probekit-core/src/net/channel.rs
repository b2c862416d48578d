use crate::capture::CaptureSink;
use crate::config::ChannelConfig;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::{Error, IoError, Result};
use crate::net::socket::Socket;
use crate::net::Interface;
use crate::packet::Packet;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Consumes packets read from a [`Channel`].
///
/// Listeners are driven from the thread which polls the channel, one callback at a time. A
/// listener may send packets and unregister itself (or any other listener) from within any
/// callback.
#[cfg_attr(test, mockall::automock)]
pub trait PacketListener {
    /// Called for every packet read from the channel while the listener is registered.
    fn packet_received(&mut self, packet: &Packet, received_at: Instant);

    /// The next instant at which this listener wants [`PacketListener::on_tick`] called.
    fn next_wakeup(&self) -> Option<Instant> {
        None
    }

    fn on_tick(&mut self, _now: Instant) {}

    /// The channel closed, no further packets will be delivered.
    fn channel_closed(&mut self) {}
}

/// A shared, dynamically typed, packet listener.
pub type SharedListener = Rc<RefCell<dyn PacketListener>>;

/// Identifies a registration with a [`Channel`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ListenerId(u64);

impl Display for ListenerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// The lifecycle state of a [`Channel`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    /// Open with no listeners, nothing is read.
    Idle,
    /// Open and reading on behalf of at least one listener.
    Reading,
    /// Closed, either explicitly or after a fatal read error.
    Closed,
}

/// A raw IPv4 channel bound to a single interface.
///
/// The channel owns a send socket and a capture socket. Every datagram read from the capture
/// socket is offered to every registered listener in registration order.
pub struct Channel<S: Socket> {
    interface: Interface,
    read_timeout: Duration,
    send_socket: RefCell<S>,
    recv_socket: RefCell<S>,
    recv_buf: RefCell<Vec<u8>>,
    registry: RefCell<Registry>,
    capture: RefCell<Option<Box<dyn CaptureSink>>>,
    state: Cell<ChannelState>,
}

#[cfg(target_os = "linux")]
impl Channel<crate::net::SocketImpl> {
    /// Open a channel on the named interface.
    ///
    /// Fails with [`Error::NoSuchInterface`] if the interface does not exist and with
    /// [`Error::PermissionDenied`] if raw sockets may not be opened.
    #[instrument(level = "trace")]
    pub fn open(config: &ChannelConfig) -> Result<Self> {
        tracing::debug!(?config);
        let interface = crate::net::lookup_interface(&config.interface)?;
        let privilege = trippy_privilege::Privilege::discover()?;
        if !privilege.has_privileges() {
            return Err(Error::PermissionDenied(format!(
                "raw sockets on {} require CAP_NET_RAW",
                interface.name
            )));
        }
        let send_socket = crate::net::SocketImpl::new_raw_send_socket_ipv4(&interface.name)
            .map_err(Error::from_socket_setup)?;
        let recv_socket = crate::net::SocketImpl::new_capture_socket_ipv4(interface.index)
            .map_err(Error::from_socket_setup)?;
        Ok(Self::with_sockets(
            send_socket,
            recv_socket,
            interface,
            config.read_timeout,
        ))
    }
}

impl<S: Socket> Channel<S> {
    /// Create a channel over existing sockets.
    pub fn with_sockets(
        send_socket: S,
        recv_socket: S,
        interface: Interface,
        read_timeout: Duration,
    ) -> Self {
        Self {
            interface,
            read_timeout,
            send_socket: RefCell::new(send_socket),
            recv_socket: RefCell::new(recv_socket),
            recv_buf: RefCell::new(vec![0; MAX_PACKET_SIZE]),
            registry: RefCell::new(Registry::default()),
            capture: RefCell::new(None),
            state: Cell::new(ChannelState::Idle),
        }
    }

    #[must_use]
    pub const fn interface(&self) -> &Interface {
        &self.interface
    }

    /// The primary IPv4 address of the bound interface.
    pub fn local_addr(&self) -> Result<Ipv4Addr> {
        self.interface.addr().ok_or_else(|| {
            Error::NoSuchInterface(format!("{} has no IPv4 address", self.interface.name))
        })
    }

    #[must_use]
    pub fn is_local(&self, addr: Ipv4Addr) -> bool {
        self.interface.is_local(addr)
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// Is the capture socket being polled on behalf of at least one listener?
    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.state.get() == ChannelState::Reading
    }

    /// The default bound on a single wait for the capture socket.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.get() == ChannelState::Closed
    }

    /// The number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.registry.borrow().len()
    }

    /// Copy every packet read from now on to `sink`.
    ///
    /// The sink is dropped after the first write failure.
    pub fn set_capture_sink(&self, sink: Box<dyn CaptureSink>) {
        *self.capture.borrow_mut() = Some(sink);
    }

    /// Write a complete IPv4 datagram to the network.
    #[instrument(skip_all, level = "trace")]
    pub fn send(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let addr = SocketAddr::new(IpAddr::V4(packet.destination()), 0);
        self.send_socket
            .borrow_mut()
            .send_to(packet.as_bytes(), addr)?;
        Ok(())
    }

    /// Register a listener, the channel starts reading if it was idle.
    ///
    /// Registering the same listener twice fails with [`Error::AlreadyRegistered`].
    pub fn register(&self, listener: SharedListener) -> Result<ListenerId> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let id = self.registry.borrow_mut().insert(listener)?;
        tracing::trace!(%id, "registered listener");
        if self.state.get() == ChannelState::Idle {
            tracing::debug!(interface = %self.interface.name, "channel reading started");
            self.state.set(ChannelState::Reading);
        }
        Ok(id)
    }

    /// Remove a listener, the channel stops reading when the last one is removed.
    ///
    /// Returns false if `id` was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let (removed, remaining) = {
            let mut registry = self.registry.borrow_mut();
            (registry.remove(id), registry.len())
        };
        if removed {
            tracing::trace!(%id, "unregistered listener");
            if remaining == 0 && self.state.get() == ChannelState::Reading {
                tracing::debug!(interface = %self.interface.name, "channel reading stopped");
                self.state.set(ChannelState::Idle);
            }
        }
        removed
    }

    /// Close the channel, every registered listener is notified and removed.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.state.set(ChannelState::Closed);
        tracing::debug!(interface = %self.interface.name, "channel closed");
        let listeners = self.registry.borrow_mut().drain();
        for (_, listener) in listeners {
            listener.borrow_mut().channel_closed();
        }
    }

    /// Fire due timers then wait for, read and dispatch at most one packet.
    ///
    /// The wait is bounded by `max_wait` and the earliest wakeup requested by a listener. A read
    /// failure closes the channel and is returned.
    #[instrument(skip(self), level = "trace")]
    pub fn poll(&self, max_wait: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let now = Instant::now();
        self.fire_timers(now);
        if !self.is_reading() {
            return Ok(());
        }
        let wait = self.next_wakeup().map_or(max_wait, |wakeup| {
            wakeup.saturating_duration_since(now).min(max_wait)
        });
        let readable = self.recv_socket.borrow_mut().is_readable(wait);
        match readable {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) => return Err(self.fail(err)),
        }
        let frame = {
            let mut buf = self.recv_buf.borrow_mut();
            let read = self.recv_socket.borrow_mut().read(&mut buf);
            match read {
                Ok(bytes_read) => buf[..bytes_read].to_vec(),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(self.fail(err)),
            }
        };
        let received_at = Instant::now();
        match Packet::from_bytes(frame) {
            Ok(packet) => self.deliver(&packet, received_at),
            Err(err) => tracing::trace!(?err, "dropping undecodable frame"),
        }
        Ok(())
    }

    /// Offer `packet` to the capture sink and then to every registered listener.
    ///
    /// Listeners are taken from a snapshot of the registry, a listener unregistered by an earlier
    /// listener during this dispatch is skipped.
    pub(crate) fn deliver(&self, packet: &Packet, received_at: Instant) {
        self.capture_packet(packet);
        let snapshot = self.registry.borrow().snapshot();
        for (id, listener) in snapshot {
            if self.is_closed() {
                break;
            }
            if self.registry.borrow().contains(id) {
                listener.borrow_mut().packet_received(packet, received_at);
            }
        }
    }

    fn capture_packet(&self, packet: &Packet) {
        let failed = self
            .capture
            .borrow_mut()
            .as_mut()
            .map(|sink| sink.capture(packet));
        if let Some(Err(err)) = failed {
            tracing::warn!(?err, "packet capture failed, capture disabled");
            *self.capture.borrow_mut() = None;
        }
    }

    fn fire_timers(&self, now: Instant) {
        let snapshot = self.registry.borrow().snapshot();
        for (id, listener) in snapshot {
            if !self.registry.borrow().contains(id) {
                continue;
            }
            let due = listener
                .borrow()
                .next_wakeup()
                .is_some_and(|wakeup| wakeup <= now);
            if due {
                listener.borrow_mut().on_tick(now);
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.registry
            .borrow()
            .snapshot()
            .into_iter()
            .filter_map(|(_, listener)| listener.borrow().next_wakeup())
            .min()
    }

    fn fail(&self, err: IoError) -> Error {
        tracing::error!(%err, interface = %self.interface.name, "channel read failed");
        self.close();
        Error::IoError(err)
    }
}

/// Registered listeners in registration order.
///
/// Removal leaves a tombstone which is reclaimed once tombstones outnumber live listeners, so
/// both insertion and removal are amortized constant time.
#[derive(Default)]
struct Registry {
    slots: Vec<Option<(ListenerId, SharedListener)>>,
    positions: HashMap<ListenerId, usize>,
    identities: HashMap<usize, ListenerId>,
    next_id: u64,
    tombstones: usize,
}

impl Registry {
    fn insert(&mut self, listener: SharedListener) -> Result<ListenerId> {
        let identity = identity(&listener);
        if self.identities.contains_key(&identity) {
            return Err(Error::AlreadyRegistered);
        }
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.positions.insert(id, self.slots.len());
        self.identities.insert(identity, id);
        self.slots.push(Some((id, listener)));
        Ok(id)
    }

    fn remove(&mut self, id: ListenerId) -> bool {
        let Some(position) = self.positions.remove(&id) else {
            return false;
        };
        if let Some((_, listener)) = self.slots[position].take() {
            self.identities.remove(&identity(&listener));
        }
        self.tombstones += 1;
        if self.tombstones > self.positions.len() {
            self.compact();
        }
        true
    }

    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        for (position, (id, _)) in self.slots.iter().flatten().enumerate() {
            self.positions.insert(*id, position);
        }
        self.tombstones = 0;
    }

    fn contains(&self, id: ListenerId) -> bool {
        self.positions.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.positions.len()
    }

    fn snapshot(&self) -> Vec<(ListenerId, SharedListener)> {
        self.slots.iter().flatten().cloned().collect()
    }

    fn drain(&mut self) -> Vec<(ListenerId, SharedListener)> {
        let listeners = self.slots.drain(..).flatten().collect();
        self.positions.clear();
        self.identities.clear();
        self.tombstones = 0;
        listeners
    }
}

/// The address of the shared listener allocation.
fn identity(listener: &SharedListener) -> usize {
    Rc::as_ptr(listener).cast::<()>() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoOperation;
    use crate::mocket_read;
    use crate::net::socket::MockSocket;
    use crate::packet::Ipv4Probe;
    use crate::types::{ProbeId, TimeToLive};
    use ipnetwork::Ipv4Network;
    use mockall::predicate;
    use std::io;
    use std::sync::{Arc, Mutex};

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const DEST: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    fn interface() -> Interface {
        Interface {
            name: String::from("test0"),
            index: 1,
            networks: vec![Ipv4Network::new(SRC, 24).unwrap()],
        }
    }

    fn channel(send: MockSocket, recv: MockSocket) -> Channel<MockSocket> {
        Channel::with_sockets(send, recv, interface(), Duration::from_millis(10))
    }

    fn echo_request() -> anyhow::Result<Packet> {
        Ok(Ipv4Probe::new(SRC, DEST).make_echo_request(TimeToLive(64), ProbeId(7), 1, 1)?)
    }

    /// Records the packets it receives and optionally unregisters another listener.
    #[derive(Default)]
    struct Recorder {
        received: Vec<Packet>,
        closed: bool,
        unregister: Option<(Rc<Channel<MockSocket>>, ListenerId)>,
    }

    impl PacketListener for Recorder {
        fn packet_received(&mut self, packet: &Packet, _received_at: Instant) {
            self.received.push(packet.clone());
            if let Some((channel, id)) = self.unregister.take() {
                channel.unregister(id);
            }
        }

        fn channel_closed(&mut self) {
            self.closed = true;
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() -> anyhow::Result<()> {
        let channel = channel(MockSocket::new(), MockSocket::new());
        let order = Arc::new(Mutex::new(vec![]));
        for name in ["first", "second", "third"] {
            let mut listener = MockPacketListener::new();
            let order = Arc::clone(&order);
            listener
                .expect_packet_received()
                .times(1)
                .returning(move |_, _| order.lock().unwrap().push(name));
            channel.register(Rc::new(RefCell::new(listener)))?;
        }
        channel.deliver(&echo_request()?, Instant::now());
        assert_eq!(vec!["first", "second", "third"], *order.lock().unwrap());
        Ok(())
    }

    #[test]
    fn test_register_twice_is_rejected() -> anyhow::Result<()> {
        let channel = channel(MockSocket::new(), MockSocket::new());
        let listener: SharedListener = Rc::new(RefCell::new(Recorder::default()));
        channel.register(Rc::clone(&listener))?;
        assert!(matches!(
            channel.register(listener),
            Err(Error::AlreadyRegistered)
        ));
        assert_eq!(1, channel.listener_count());
        Ok(())
    }

    #[test]
    fn test_unregister_is_idempotent() -> anyhow::Result<()> {
        let channel = channel(MockSocket::new(), MockSocket::new());
        let id = channel.register(Rc::new(RefCell::new(Recorder::default())))?;
        assert_eq!(ChannelState::Reading, channel.state());
        assert!(channel.unregister(id));
        assert!(!channel.unregister(id));
        assert_eq!(ChannelState::Idle, channel.state());
        Ok(())
    }

    #[test]
    fn test_unregistered_during_dispatch_is_skipped() -> anyhow::Result<()> {
        let channel = Rc::new(channel(MockSocket::new(), MockSocket::new()));
        let first = Rc::new(RefCell::new(Recorder::default()));
        let second = Rc::new(RefCell::new(Recorder::default()));
        channel.register(first.clone())?;
        let second_id = channel.register(second.clone())?;
        first.borrow_mut().unregister = Some((Rc::clone(&channel), second_id));
        channel.deliver(&echo_request()?, Instant::now());
        assert_eq!(1, first.borrow().received.len());
        assert!(second.borrow().received.is_empty());
        assert_eq!(1, channel.listener_count());
        Ok(())
    }

    #[test]
    fn test_registry_compaction_keeps_order() -> anyhow::Result<()> {
        let channel = channel(MockSocket::new(), MockSocket::new());
        let listeners = (0..8)
            .map(|_| Rc::new(RefCell::new(Recorder::default())))
            .collect::<Vec<_>>();
        let ids = listeners
            .iter()
            .map(|listener| channel.register(listener.clone()))
            .collect::<Result<Vec<_>>>()?;
        for id in ids.iter().take(6) {
            assert!(channel.unregister(*id));
        }
        channel.deliver(&echo_request()?, Instant::now());
        assert_eq!(2, channel.listener_count());
        assert!(listeners[..6].iter().all(|l| l.borrow().received.is_empty()));
        assert!(listeners[6..].iter().all(|l| l.borrow().received.len() == 1));
        assert!(channel.unregister(ids[7]));
        assert!(!channel.unregister(ids[0]));
        Ok(())
    }

    #[test]
    fn test_send_writes_to_destination() -> anyhow::Result<()> {
        let packet = echo_request()?;
        let expected = packet.as_bytes().to_vec();
        let mut send = MockSocket::new();
        send.expect_send_to()
            .with(
                predicate::function(move |buf: &[u8]| buf == expected.as_slice()),
                predicate::eq(SocketAddr::new(IpAddr::V4(DEST), 0)),
            )
            .times(1)
            .returning(|_, _| Ok(()));
        let channel = channel(send, MockSocket::new());
        channel.send(&packet)?;
        Ok(())
    }

    #[test]
    fn test_poll_reads_and_dispatches() -> anyhow::Result<()> {
        let packet = echo_request()?;
        let bytes = packet.as_bytes().to_vec();
        let mut recv = MockSocket::new();
        recv.expect_is_readable().times(1).returning(|_| Ok(true));
        recv.expect_read().times(1).returning(mocket_read!(bytes));
        let channel = channel(MockSocket::new(), recv);
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        channel.register(recorder.clone())?;
        channel.poll(Duration::from_millis(10))?;
        assert_eq!(vec![packet], recorder.borrow().received);
        Ok(())
    }

    #[test]
    fn test_poll_drops_undecodable_frame() -> anyhow::Result<()> {
        let garbage = [0x60_u8, 0, 0, 0];
        let mut recv = MockSocket::new();
        recv.expect_is_readable().times(1).returning(|_| Ok(true));
        recv.expect_read().times(1).returning(mocket_read!(garbage));
        let channel = channel(MockSocket::new(), recv);
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        channel.register(recorder.clone())?;
        channel.poll(Duration::from_millis(10))?;
        assert!(recorder.borrow().received.is_empty());
        assert_eq!(ChannelState::Reading, channel.state());
        Ok(())
    }

    #[test]
    fn test_idle_channel_does_not_read() -> anyhow::Result<()> {
        let mut recv = MockSocket::new();
        recv.expect_is_readable().never();
        let channel = channel(MockSocket::new(), recv);
        channel.poll(Duration::from_millis(10))?;
        Ok(())
    }

    #[test]
    fn test_read_failure_closes_channel() -> anyhow::Result<()> {
        let mut recv = MockSocket::new();
        recv.expect_is_readable().times(1).returning(|_| {
            Err(IoError::Other(
                io::Error::from(io::ErrorKind::NetworkDown),
                IoOperation::Select,
            ))
        });
        let channel = channel(MockSocket::new(), recv);
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        channel.register(recorder.clone())?;
        assert!(matches!(
            channel.poll(Duration::from_millis(10)),
            Err(Error::IoError(_))
        ));
        assert!(channel.is_closed());
        assert!(recorder.borrow().closed);
        assert_eq!(0, channel.listener_count());
        assert!(matches!(
            channel.poll(Duration::from_millis(10)),
            Err(Error::ChannelClosed)
        ));
        assert!(matches!(
            channel.send(&echo_request()?),
            Err(Error::ChannelClosed)
        ));
        Ok(())
    }

    #[test]
    fn test_due_timer_fires() -> anyhow::Result<()> {
        let mut recv = MockSocket::new();
        recv.expect_is_readable().returning(|_| Ok(false));
        let channel = channel(MockSocket::new(), recv);
        let mut listener = MockPacketListener::new();
        let past = Instant::now();
        listener.expect_next_wakeup().returning(move || Some(past));
        listener.expect_on_tick().times(1).return_const(());
        channel.register(Rc::new(RefCell::new(listener)))?;
        channel.poll(Duration::from_millis(10))?;
        Ok(())
    }

    #[test]
    fn test_capture_failure_does_not_abort_dispatch() -> anyhow::Result<()> {
        struct FailingSink(Rc<Cell<usize>>);
        impl CaptureSink for FailingSink {
            fn capture(&mut self, _packet: &Packet) -> io::Result<()> {
                self.0.set(self.0.get() + 1);
                Err(io::Error::from(io::ErrorKind::StorageFull))
            }
        }
        let attempts = Rc::new(Cell::new(0));
        let channel = channel(MockSocket::new(), MockSocket::new());
        channel.set_capture_sink(Box::new(FailingSink(Rc::clone(&attempts))));
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        channel.register(recorder.clone())?;
        let packet = echo_request()?;
        channel.deliver(&packet, Instant::now());
        channel.deliver(&packet, Instant::now());
        assert_eq!(2, recorder.borrow().received.len());
        assert_eq!(1, attempts.get());
        Ok(())
    }

    #[test]
    fn test_local_addr() -> anyhow::Result<()> {
        let channel = channel(MockSocket::new(), MockSocket::new());
        assert_eq!(SRC, channel.local_addr()?);
        assert!(channel.is_local(Ipv4Addr::new(10, 0, 0, 254)));
        assert!(!channel.is_local(DEST));
        Ok(())
    }
}
