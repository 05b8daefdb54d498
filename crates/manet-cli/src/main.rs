//! MANET Command-Line Interface
//!
//! This CLI provides tools for:
//! - Inspecting wire constants
//! - Checking segmentation and reassembly for a payload size
//! - Simulating two nodes over an in-process stream
//! - Running real nodes over TCP
//!
//! Every command accepts `--config FILE` with a JSON `ManetConfig`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use manet_core::packet::{self, PacketBody, FRAGMENT_OVERHEAD, HEADER_SIZE};
use manet_core::segment::{chunk_size, fragment_count, should_segment, MAX_FRAGMENTS};
use manet_core::{
    duplex_pair, IssueKind, ManetConfig, ManetContext, ManetIssue, ManetListener,
    ManetTransport, NodeAddress, Packet, PacketType, SegmentEngine, SocketManet, StatsSnapshot,
    StreamManet, TransportStatus,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "manet")]
#[command(author, version, about = "MANET substrate CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show wire format constants
    Info,

    /// Segment a random payload and verify reassembly
    Segment {
        /// Payload size in bytes
        #[arg(short, long, default_value = "300000")]
        size: usize,

        /// Transport MTU in bytes [default: from the config, 1400]
        #[arg(short, long)]
        mtu: Option<usize>,

        /// Deliver fragments in random order instead of reversed
        #[arg(long)]
        shuffle: bool,
    },

    /// Run two nodes over an in-process stream
    Simulate {
        /// Payload size in bytes
        #[arg(short, long, default_value = "300000")]
        size: usize,

        /// Transport MTU in bytes [default: from the config, 1400]
        #[arg(short, long)]
        mtu: Option<usize>,

        /// Number of pings to send
        #[arg(short, long, default_value = "5")]
        pings: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Accept TCP links until Ctrl+C
    Listen {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:7700")]
        bind: SocketAddr,

        /// Node address (hex, e.g. 1a2b3c4d)
        #[arg(short, long)]
        node: Option<String>,
    },

    /// Dial a TCP peer and stay connected until Ctrl+C
    Connect {
        /// Peer address
        #[arg(short, long)]
        peer: SocketAddr,

        /// Node address (hex, e.g. 1a2b3c4d)
        #[arg(short, long)]
        node: Option<String>,

        /// Broadcast this message once connected
        #[arg(short, long)]
        message: Option<String>,

        /// Pings to send to the first peer heard
        #[arg(long, default_value = "0")]
        pings: usize,
    },
}

/// What the CLI listener forwards to the command loop
#[derive(Debug)]
enum Event {
    Status(TransportStatus),
    Issue(ManetIssue),
    Peer(NodeAddress),
    Rx(Packet),
    Latency(NodeAddress, i64),
    Unreachable(NodeAddress),
}

struct ChannelListener {
    tx: Mutex<Sender<Event>>,
}

impl ChannelListener {
    fn new() -> (Arc<Self>, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }

    fn send(&self, event: Event) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event);
        }
    }
}

impl ManetListener for ChannelListener {
    fn on_status(&self, status: TransportStatus) {
        self.send(Event::Status(status));
    }

    fn on_issue(&self, issue: &ManetIssue) {
        self.send(Event::Issue(issue.clone()));
    }

    fn on_devices_changed(&self, peer: NodeAddress) {
        self.send(Event::Peer(peer));
    }

    fn on_high_noise(&self, backlog: usize) {
        warn!("Receiver falling behind: {} bytes unread", backlog);
    }

    fn on_rx(&self, packet: &Packet) {
        self.send(Event::Rx(packet.clone()));
    }

    fn on_latency(&self, peer: NodeAddress, rtt_ms: i64) {
        self.send(Event::Latency(peer, rtt_ms));
    }

    fn on_peer_unreachable(&self, peer: NodeAddress) {
        self.send(Event::Unreachable(peer));
    }
}

fn parse_node(text: &str) -> Result<NodeAddress> {
    let digits = text.trim_start_matches("0x");
    let value = u32::from_str_radix(digits, 16)
        .with_context(|| format!("Invalid node address: {}", text))?;
    let address = NodeAddress::new(value);
    if address.is_broadcast() || address.is_unknown() {
        bail!("Node address {} is reserved", text);
    }
    Ok(address)
}

fn load_config(path: Option<&Path>, preset: fn() -> ManetConfig) -> Result<ManetConfig> {
    match path {
        Some(path) => ManetConfig::from_json_file(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => Ok(preset()),
    }
}

fn with_mtu(config: ManetConfig, mtu: Option<usize>) -> ManetConfig {
    match mtu {
        Some(mtu) => config.mtu(mtu),
        None => config,
    }
}

fn with_node(config: ManetConfig, node: Option<String>) -> Result<ManetConfig> {
    match node {
        Some(node) => Ok(config.node_address(parse_node(&node)?)),
        None => Ok(config),
    }
}

fn describe(packet: &Packet) -> String {
    match packet.body() {
        PacketBody::RawBytes(data) => match std::str::from_utf8(data) {
            Ok(text) => format!("\"{}\"", text),
            Err(_) => format!("{} bytes", data.len()),
        },
        PacketBody::ChannelBytes { channel, data } => {
            format!("[{}] {} bytes", channel, data.len())
        }
        other => format!("{:?}", other.packet_type()),
    }
}

fn print_stats(label: &str, stats: &StatsSnapshot) {
    println!("{}:", label);
    println!("  Packets:     {} tx / {} rx", stats.packets_tx, stats.packets_rx);
    println!("  Admin:       {} tx / {} rx", stats.admin_tx, stats.admin_rx);
    println!("  Bytes:       {} tx / {} rx", stats.bytes_tx, stats.bytes_rx);
    println!("  Fragments:   {} tx / {} rx", stats.fragments_tx, stats.fragments_rx);
    println!("  Reassembled: {}", stats.payloads_reassembled);
    println!(
        "  Dropped:     {} checksum, {} unknown type, {} malformed",
        stats.checksum_failures, stats.unknown_type_drops, stats.malformed_drops
    );
}

fn cmd_info() -> Result<()> {
    println!("=== MANET Wire Format ===");
    println!();
    println!("Header:            {} bytes", HEADER_SIZE);
    println!("  type u8 | origin u32 | destination u32 | timestamp i64 | checksum u8");
    println!("Fragment overhead: {} bytes", FRAGMENT_OVERHEAD);
    println!("Max fragments:     {}", MAX_FRAGMENTS);
    println!("Broadcast address: {:08x}", NodeAddress::BROADCAST.to_u32());
    println!();
    println!("Packet types:");
    for byte in 0u8..=255 {
        let Ok(kind) = PacketType::try_from(byte) else {
            continue;
        };
        let role = if kind.is_admin() { "admin" } else { "data" };
        println!("  {:>3}  {:<16} {}", byte, format!("{:?}", kind), role);
    }
    println!();
    println!("Examples:");
    println!("  manet segment --size 300000 --mtu 1400 --shuffle");
    println!("  manet simulate --pings 10 --json");
    println!("  manet listen --bind 0.0.0.0:7700");
    println!("  manet connect --peer 192.168.1.20:7700 -m \"Hello mesh!\"");
    Ok(())
}

fn cmd_segment(config: ManetConfig, size: usize, shuffle: bool) -> Result<()> {
    use rand::seq::SliceRandom;
    use rand::RngCore;

    let mtu = config.mtu;

    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);
    let original = Packet::raw_bytes(NodeAddress::new(1), NodeAddress::new(2), 0, payload);
    let encoded = original.encode();

    println!("Payload:   {} bytes ({} encoded)", size, encoded.len());
    println!("MTU:       {} bytes", mtu);
    if !should_segment(original.body_len(), mtu) {
        println!("Fits in one packet; no segmentation needed");
        return Ok(());
    }
    println!("Chunk:     {} bytes", chunk_size(mtu)?);
    println!("Fragments: {}", fragment_count(encoded.len(), mtu)?);

    let sender = SegmentEngine::new(NodeAddress::new(1), config.reassembly_timeout());
    let receiver = SegmentEngine::new(NodeAddress::new(2), config.reassembly_timeout());
    let mut frames: Vec<Vec<u8>> = sender
        .segment(&encoded, mtu, NodeAddress::new(2), 0)?
        .iter()
        .map(Packet::encode)
        .collect();
    if shuffle {
        frames.shuffle(&mut rand::thread_rng());
    } else {
        frames.reverse();
    }

    let start = Instant::now();
    let mut reassembled = None;
    for frame in &frames {
        let decoded = packet::decode(frame).context("Fragment failed to decode")?;
        if let PacketBody::SegmentFragment(fragment) = decoded.into_body() {
            reassembled = receiver.on_fragment_received(NodeAddress::new(1), fragment, start);
        }
    }

    let Some(bytes) = reassembled else {
        bail!("Reassembly did not complete");
    };
    let restored = packet::decode(&bytes).context("Reassembled packet failed to decode")?;
    if restored != original {
        bail!("Reassembled packet differs from the original");
    }
    println!(
        "Reassembled {} fragments ({}) in {:.2?}: OK",
        frames.len(),
        if shuffle { "shuffled" } else { "reversed" },
        start.elapsed()
    );
    Ok(())
}

#[derive(Serialize)]
struct SimulationReport {
    payload_bytes: usize,
    mtu: usize,
    delivered: bool,
    transfer_ms: u128,
    rtt_ms: Vec<i64>,
    sender: StatsSnapshot,
    receiver: StatsSnapshot,
}

fn wait_for<T>(
    events: &Receiver<Event>,
    timeout: Duration,
    mut pick: impl FnMut(Event) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        match events.recv_timeout(left) {
            Ok(event) => {
                if let Some(found) = pick(event) {
                    return Some(found);
                }
            }
            Err(_) => return None,
        }
    }
}

fn cmd_simulate(config: ManetConfig, size: usize, pings: usize, json: bool) -> Result<()> {
    let mtu = config.mtu;
    let base = config
        .ring_capacity(size.max(1 << 20) * 2)
        .heartbeat_interval_ms(600_000);
    let (port_a, port_b) = duplex_pair(size.max(1 << 20) * 2);
    let addr_a = NodeAddress::new(0x0000_0a0a);
    let addr_b = NodeAddress::new(0x0000_0b0b);

    let (listener_a, events_a) = ChannelListener::new();
    let (listener_b, events_b) = ChannelListener::new();
    let node_a = StreamManet::new(
        ManetContext::shared(base.clone().node_address(addr_a)),
        listener_a,
        port_a.named("sim-a"),
    )
    .with_peer(addr_b);
    let node_b = StreamManet::new(
        ManetContext::shared(base.node_address(addr_b)),
        listener_b,
        port_b.named("sim-b"),
    )
    .with_peer(addr_a);

    for node in [&node_a, &node_b] {
        node.init()?;
        node.connect()?;
    }
    let timeout = Duration::from_secs(10);
    for (name, events) in [("a", &events_a), ("b", &events_b)] {
        wait_for(events, timeout, |e| match e {
            Event::Peer(_) => Some(()),
            _ => None,
        })
        .with_context(|| format!("Node {} never heard its peer", name))?;
    }
    info!("Both nodes linked");

    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let start = Instant::now();
    node_a.burst(Packet::raw_bytes(addr_a, addr_b, 0, data.clone()))?;
    let delivered = wait_for(&events_b, timeout, |e| match e {
        Event::Rx(packet) => Some(packet.payload() == Some(&data[..])),
        _ => None,
    })
    .unwrap_or(false);
    let transfer = start.elapsed();

    let mut rtt_ms = Vec::with_capacity(pings);
    for _ in 0..pings {
        node_a.ping(addr_b)?;
        match wait_for(&events_a, timeout, |e| match e {
            Event::Latency(_, rtt) => Some(rtt),
            _ => None,
        }) {
            Some(rtt) => rtt_ms.push(rtt),
            None => warn!("Ping timed out"),
        }
    }

    let report = SimulationReport {
        payload_bytes: size,
        mtu,
        delivered,
        transfer_ms: transfer.as_millis(),
        rtt_ms,
        sender: node_a.core().ctx().stats().snapshot(),
        receiver: node_b.core().ctx().stats().snapshot(),
    };
    node_a.disconnect()?;
    node_b.disconnect()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("=== Two-Node Stream Simulation ===");
        println!();
        println!("Payload:   {} bytes at MTU {}", report.payload_bytes, report.mtu);
        println!(
            "Delivered: {} in {} ms",
            if report.delivered { "yes" } else { "NO" },
            report.transfer_ms
        );
        println!("Pings:     {:?} ms", report.rtt_ms);
        println!();
        print_stats("Sender", &report.sender);
        print_stats("Receiver", &report.receiver);
    }

    if !delivered {
        bail!("Payload was not delivered intact");
    }
    Ok(())
}

/// Print events until Ctrl+C; `on_peer` runs once per newly heard peer
fn run_until_interrupted(
    manet: &SocketManet,
    events: Receiver<Event>,
    mut on_peer: impl FnMut(NodeAddress),
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let mut known = Vec::new();
    while running.load(Ordering::SeqCst) {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(Event::Status(status)) => println!("* status {:?}", status),
            Ok(Event::Issue(issue)) => {
                println!("! {:?} issue: {}", issue.kind(), issue);
                if issue.is_blocker() && issue.kind() == IssueKind::Hardware {
                    break;
                }
            }
            Ok(Event::Peer(peer)) => {
                if !known.contains(&peer) {
                    known.push(peer);
                    println!("+ peer {}", peer);
                    on_peer(peer);
                }
            }
            Ok(Event::Unreachable(peer)) => println!("- peer {} unreachable", peer),
            Ok(Event::Rx(packet)) => println!("< {}: {}", packet.origin(), describe(&packet)),
            Ok(Event::Latency(peer, rtt)) => println!("~ {} rtt {} ms", peer, rtt),
            Err(_) => {}
        }
    }

    println!();
    manet.disconnect()?;
    print_stats("Totals", &manet.core().ctx().stats().snapshot());
    for peer in manet.core().peers() {
        println!("  {}", serde_json::to_string(&peer)?);
    }
    Ok(())
}

fn cmd_listen(config: ManetConfig, bind: SocketAddr) -> Result<()> {
    let (listener, events) = ChannelListener::new();
    let manet = SocketManet::new(ManetContext::shared(config), listener).listen_on(bind);
    manet.init()?;
    manet.connect()?;

    println!("Node {} listening on {}", manet.address(), manet.local_addr().unwrap_or(bind));
    println!("Press Ctrl+C to stop");
    run_until_interrupted(&manet, events, |_| {})
}

fn cmd_connect(
    config: ManetConfig,
    peer: SocketAddr,
    message: Option<String>,
    pings: usize,
) -> Result<()> {
    let (listener, events) = ChannelListener::new();
    let manet = SocketManet::new(ManetContext::shared(config), listener).with_peer(peer);
    manet.init()?;
    manet.connect()?;

    println!("Node {} dialing {}", manet.address(), peer);
    println!("Press Ctrl+C to stop");
    let mut first = true;
    run_until_interrupted(&manet, events, |heard| {
        if !first {
            return;
        }
        first = false;
        if let Some(text) = &message {
            let packet = Packet::raw_bytes(
                manet.address(),
                NodeAddress::BROADCAST,
                manet.core().ctx().clock().now(),
                text.as_bytes().to_vec(),
            );
            match manet.burst(packet) {
                Ok(()) => println!("> broadcast \"{}\"", text),
                Err(e) => warn!("Send failed: {}", e),
            }
        }
        for _ in 0..pings {
            if let Err(e) = manet.ping(heard) {
                warn!("Ping failed: {}", e);
            }
        }
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Info => cmd_info(),

        Commands::Segment { size, mtu, shuffle } => {
            let config = with_mtu(load_config(config_path, ManetConfig::sdr)?, mtu);
            cmd_segment(config, size, shuffle)
        }

        Commands::Simulate {
            size,
            mtu,
            pings,
            json,
        } => {
            let config = with_mtu(load_config(config_path, ManetConfig::sdr)?, mtu);
            cmd_simulate(config, size, pings, json)
        }

        Commands::Listen { bind, node } => {
            let config = with_node(load_config(config_path, ManetConfig::wifi)?, node)?;
            cmd_listen(config, bind)
        }

        Commands::Connect {
            peer,
            node,
            message,
            pings,
        } => {
            let config = with_node(load_config(config_path, ManetConfig::wifi)?, node)?;
            cmd_connect(config, peer, message, pings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_mtu(cli: &Cli) -> Option<usize> {
        match cli.command {
            Commands::Segment { mtu, .. } => mtu,
            _ => panic!("not a segment command"),
        }
    }

    #[test]
    fn test_segment_takes_mtu_from_config_file() {
        let path = std::env::temp_dir().join(format!("manet-cli-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"mtu": 600}"#).unwrap();
        let cli = Cli::try_parse_from([
            "manet",
            "--config",
            path.to_str().unwrap(),
            "segment",
            "--size",
            "5000",
        ])
        .unwrap();
        assert_eq!(segment_mtu(&cli), None);

        let config = with_mtu(
            load_config(cli.config.as_deref(), ManetConfig::sdr).unwrap(),
            segment_mtu(&cli),
        );
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.mtu, 600);
        cmd_segment(config, 5000, true).unwrap();
    }

    #[test]
    fn test_mtu_flag_overrides_preset() {
        let cli = Cli::try_parse_from(["manet", "segment", "--mtu", "900"]).unwrap();
        let config = with_mtu(ManetConfig::sdr(), segment_mtu(&cli));
        assert_eq!(config.mtu, 900);
        assert_eq!(with_mtu(ManetConfig::sdr(), None).mtu, 1_400);
    }
}
