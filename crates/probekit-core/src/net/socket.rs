use crate::error::IoResult as Result;
use std::net::SocketAddr;
use std::time::Duration;

#[cfg_attr(test, mockall::automock)]
pub trait Socket
where
    Self: Sized,
{
    /// Create a raw IPv4 socket for sending complete IP datagrams out of an interface.
    fn new_raw_send_socket_ipv4(interface: &str) -> Result<Self>;
    /// Create a socket which captures every IPv4 datagram sent or received on an interface.
    fn new_capture_socket_ipv4(ifindex: u32) -> Result<Self>;
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<()>;
    /// Returns true if the socket becomes readable before the timeout, false otherwise.
    fn is_readable(&mut self, timeout: Duration) -> Result<bool>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

#[cfg(test)]
pub mod tests {
    use super::MockSocket;
    use crate::error::IoResult;
    use crate::net::channel::Channel;
    use crate::net::Interface;
    use crate::packet::Packet;
    use ipnetwork::Ipv4Network;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;

    #[macro_export]
    macro_rules! mocket_read {
        ($packet: expr) => {
            move |buf: &mut [u8]| -> $crate::error::IoResult<usize> {
                buf[..$packet.len()].copy_from_slice(&$packet);
                Ok($packet.len())
            }
        };
    }

    /// The address of the simulated host.
    pub const LOCAL_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    type Frames = Arc<Mutex<VecDeque<Vec<u8>>>>;

    /// Send `tracing` output to the test harness, filtered by `RUST_LOG`.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// A network where every packet sent is captured back and then answered by a responder.
    pub struct SimNetwork {
        pub channel: Rc<Channel<MockSocket>>,
        frames: Frames,
    }

    impl SimNetwork {
        /// A network in which nothing ever answers.
        pub fn silent() -> Self {
            Self::new(|_| Ok(vec![]))
        }

        pub fn new<F>(mut responder: F) -> Self
        where
            F: FnMut(&Packet) -> IoResult<Vec<Packet>> + Send + 'static,
        {
            init_tracing();
            let frames = Frames::default();
            let mut send = MockSocket::new();
            let sent_frames = Arc::clone(&frames);
            send.expect_send_to().returning(move |buf, _| {
                let packet = Packet::from_bytes(buf.to_vec()).unwrap();
                let responses = responder(&packet)?;
                let mut frames = sent_frames.lock().unwrap();
                frames.push_back(buf.to_vec());
                frames.extend(responses.iter().map(|p| p.as_bytes().to_vec()));
                Ok(())
            });
            let mut recv = MockSocket::new();
            let readable_frames = Arc::clone(&frames);
            recv.expect_is_readable().returning(move |timeout| {
                let readable = !readable_frames.lock().unwrap().is_empty();
                if !readable {
                    std::thread::sleep(timeout.min(Duration::from_millis(1)));
                }
                Ok(readable)
            });
            let read_frames = Arc::clone(&frames);
            recv.expect_read().returning(move |buf| {
                let frame = read_frames.lock().unwrap().pop_front().unwrap_or_default();
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            });
            let interface = Interface {
                name: String::from("sim0"),
                index: 1,
                networks: vec![Ipv4Network::new(LOCAL_ADDR, 24).unwrap()],
            };
            let channel = Channel::with_sockets(send, recv, interface, Duration::from_millis(5));
            Self {
                channel: Rc::new(channel),
                frames,
            }
        }

        /// Queue a packet seen on the wire which was not sent through the channel.
        pub fn inject(&self, packet: &Packet) {
            self.frames
                .lock()
                .unwrap()
                .push_back(packet.as_bytes().to_vec());
        }
    }

    #[test]
    fn test_tracing_reaches_harness() {
        init_tracing();
        init_tracing();
        let routed = tracing::dispatcher::get_default(|dispatch| {
            !dispatch.is::<tracing::subscriber::NoSubscriber>()
        });
        assert!(routed);
    }
}
