//! probekit - A raw-packet probing engine.
//!
//! This crate provides the packet level core of a network measurement probe. A single
//! [`Channel`] owns a raw send socket and a capture socket bound to one interface and is
//! shared by any number of concurrent listeners, each of which sends crafted IPv4 packets and
//! correlates the out-of-order, possibly missing responses back to the probes that caused them.
//!
//! The listeners provided are:
//!
//! - [`ProbeSession`] - send a batch of packets and collect the answers under a timeout.
//! - [`TracerouteSession`] - probe a TTL range towards a destination and report the hops.
//! - [`PassiveProbeInjector`] - trace the path of existing TCP connections.
//!
//! # Example
//!
//! The following example pings a host over the `eth0` interface:
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use probekit_core::{
//!     Channel, ChannelConfig, Ipv4Probe, ProbeId, ProbeSession, SessionConfig, TimeToLive,
//! };
//! use std::net::Ipv4Addr;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! let channel = Rc::new(Channel::open(&ChannelConfig::new("eth0"))?);
//! let probe = Ipv4Probe::new(channel.local_addr()?, Ipv4Addr::new(1, 1, 1, 1));
//! let echo = probe.make_echo_request(TimeToLive(64), ProbeId(4321), 4321, 1)?;
//! let outcome = ProbeSession::start_sending(
//!     &channel,
//!     vec![echo],
//!     SessionConfig::new(Duration::from_secs(2)),
//! )?
//! .wait();
//! for answer in &outcome.answered {
//!     println!("{:?} answered in {:?}", answer.received, answer.rtt());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The following example traces the path to a host with TCP probes towards ports 80 and 443:
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use probekit_core::{Builder, Channel, ChannelConfig, Port, Protocol, TimeToLive};
//! use std::net::Ipv4Addr;
//! use std::rc::Rc;
//!
//! let channel = Rc::new(Channel::open(&ChannelConfig::new("eth0"))?);
//! let trace = Builder::new().build(&channel)?.run(
//!     Ipv4Addr::new(1, 1, 1, 1),
//!     Protocol::Tcp,
//!     TimeToLive(1)..=TimeToLive(30),
//!     Some(&[Port(80), Port(443)][..]),
//! )?;
//! for hop in &trace.hops {
//!     println!("{} {:?}", hop.ttl(), hop.addrs().collect::<Vec<_>>());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # See Also
//!
//! - [`Channel::poll`] - Drive the channel from the current thread.
//! - [`SessionHandle::wait`] - Run a probe session to completion.
//! - [`InjectorHandle::run_for`] - Run the passive probe injector for a sample period.
//! - [`PcapWriter`] - Record every packet seen on a channel.
#![warn(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::option_if_let_else,
    clippy::missing_const_for_fn,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::cast_precision_loss
)]
#![deny(unsafe_code)]

mod builder;
mod capture;
mod config;
mod constants;
mod error;
mod hop;
mod injector;
mod matcher;
mod net;
mod packet;
mod session;
mod traceroute;
mod types;

pub use builder::Builder;
pub use capture::{CaptureSink, PcapWriter};
pub use config::{
    defaults, ChannelConfig, InjectorConfig, MatchOptions, Protocol, SessionConfig,
    TracerouteConfig,
};
pub use constants::{MAX_PACKET_SIZE, MAX_TTL};
pub use error::{Error, IoError, IoOperation, IoResult, Result};
pub use hop::{hops_from_answers, Hop, HopResponse};
pub use injector::{InjectorHandle, InjectorReport, PassiveProbeInjector};
pub use matcher::{
    classify, correlation_key, Correlation, CorrelationKey, Inbound, PendingEntry, PendingIndex,
};
pub use net::channel::{Channel, ChannelState, ListenerId, PacketListener, SharedListener};
pub use net::socket::Socket;
pub use net::Interface;
#[cfg(target_os = "linux")]
pub use net::{lookup_interface, SocketImpl};
pub use packet::{Ipv4Probe, Packet};
pub use session::{Answer, CompletionReason, ProbeOutcome, ProbeSession, SessionHandle};
pub use traceroute::{TraceState, Traceroute, TracerouteSession};
pub use types::{Port, ProbeId, Sequence, TcpFlags, TimeToLive};
