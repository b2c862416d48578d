use anyhow::anyhow;
use clap::{Parser, ValueEnum};
use itertools::Itertools;
use probekit_core::{
    defaults, Builder, Channel, ChannelConfig, Hop, InjectorConfig, PassiveProbeInjector, PcapWriter, Port,
    Protocol, SocketImpl, TimeToLive,
};
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

/// A toy traceroute over a raw packet channel.
///
/// *** This is for demonstration purposes only. ***
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, arg_required_else_help(true))]
struct Args {
    /// The host to trace, ignored with `--passive`.
    host: Option<Ipv4Addr>,
    #[arg(short = 'i', default_value = "eth0")]
    interface: String,
    #[arg(short = 'P', value_enum, default_value_t = ProtocolArg::Udp)]
    protocol: ProtocolArg,
    #[arg(short = 'f')]
    first_ttl: Option<u8>,
    #[arg(short = 'm')]
    max_ttl: Option<u8>,
    /// Destination ports, may be repeated.
    #[arg(short = 'p', conflicts_with = "all_ports")]
    port: Vec<u16>,
    /// Trace towards every port of a full measurement.
    #[arg(long)]
    all_ports: bool,
    #[arg(short = 'q')]
    nqueries: Option<usize>,
    #[arg(short = 'z')]
    pausemsecs: Option<u64>,
    /// Write every packet seen to a pcap file.
    #[arg(short = 'w')]
    pcap: Option<String>,
    /// Trace the hosts of existing TCP connections for this many seconds instead.
    #[arg(long)]
    passive: Option<u64>,
    /// Tracing filter, for example `probekit_core=debug`.
    #[arg(short = 'v')]
    log_filter: Option<String>,
}

impl Args {
    fn ttl_range(&self) -> (u8, u8) {
        (
            self.first_ttl.unwrap_or(defaults::DEFAULT_TRACEROUTE_FIRST_TTL),
            self.max_ttl.unwrap_or(defaults::DEFAULT_TRACEROUTE_MAX_TTL),
        )
    }

    fn ports(&self) -> Vec<Port> {
        if self.all_ports {
            defaults::DEFAULT_TRACEROUTE_PORTS.map(Port).to_vec()
        } else {
            self.port.iter().copied().map(Port).collect()
        }
    }
}

#[derive(ValueEnum, Debug, Copy, Clone)]
enum ProtocolArg {
    Icmp,
    Udp,
    Tcp,
}

impl From<ProtocolArg> for Protocol {
    fn from(protocol: ProtocolArg) -> Self {
        match protocol {
            ProtocolArg::Icmp => Self::Icmp,
            ProtocolArg::Udp => Self::Udp,
            ProtocolArg::Tcp => Self::Tcp,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if let Some(filter) = &args.log_filter {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    let channel = Rc::new(Channel::open(&ChannelConfig::new(&args.interface))?);
    if let Some(path) = &args.pcap {
        channel.set_capture_sink(Box::new(PcapWriter::create(path)?));
    }
    if let Some(secs) = args.passive {
        return run_passive(&channel, Duration::from_secs(secs));
    }
    let addr = args
        .host
        .ok_or_else(|| anyhow!("traceroute: a host is required"))?;
    let (first_ttl, max_ttl) = args.ttl_range();
    let pausemsecs = args.pausemsecs.unwrap_or(100);
    let ports = args.ports();
    let mut session = Builder::new()
        .probe_interval(Duration::from_millis(pausemsecs))
        .probes_per_hop(args.nqueries.unwrap_or(3))
        .build(&channel)?;
    println!(
        "traceroute to {addr} via {}, {max_ttl} hops max, {} probes",
        channel.interface().name,
        Protocol::from(args.protocol)
    );
    let trace = session.run(
        addr,
        args.protocol.into(),
        TimeToLive(first_ttl)..=TimeToLive(max_ttl),
        (!ports.is_empty()).then_some(ports.as_slice()),
    )?;
    for ttl in TimeToLive::range_inclusive(TimeToLive(first_ttl), TimeToLive(max_ttl)) {
        match trace.hops.iter().find(|hop| hop.ttl() == ttl) {
            Some(hop) => print_hop(hop),
            None => println!(" {ttl}  * * *"),
        }
        if trace.destination_hop().is_some_and(|hop| hop.ttl() == ttl) {
            break;
        }
    }
    Ok(())
}

fn run_passive(channel: &Rc<Channel<SocketImpl>>, duration: Duration) -> anyhow::Result<()> {
    let handle = PassiveProbeInjector::start(channel, InjectorConfig::default())?;
    let report = handle.run_for(duration);
    println!(
        "injected {} probes, {} responses, {} hosts",
        report.sent,
        report.received,
        report.hosts.len()
    );
    for (host, hops) in &report.hosts {
        println!("{host}");
        hops.iter().for_each(print_hop);
    }
    Ok(())
}

fn print_hop(hop: &Hop) {
    let samples: String = hop
        .responses()
        .iter()
        .map(|response| format!("{:.3} ms", response.rtt.as_secs_f64() * 1000_f64))
        .join("  ");
    for (i, addr) in hop.addrs().enumerate() {
        if i == 0 {
            println!(" {}  {addr} {samples}", hop.ttl());
        } else {
            println!("    {addr}");
        }
    }
}
