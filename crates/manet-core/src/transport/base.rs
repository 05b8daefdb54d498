//! State shared by every transport variant
//!
//! [`ManetCore`] owns the lifecycle status, active issues, the link registry,
//! the segment engine and the peer table. Variants only differ in how they
//! open byte streams; everything from framing upward runs through here.

use super::{ManetListener, TransportStatus};
use crate::clock::local_now_ms;
use crate::context::{ManetContext, ManetStats};
use crate::error::{DecodeError, LinkError, ManetError, Result};
use crate::issue::{IssueBoard, ManetIssue};
use crate::link::{FrameSink, LinkChannel, LinkId};
use crate::liveness::{HeartbeatSchedule, PeerEvent, PeerSummary, PeerTable};
use crate::packet::{self, NodeAddress, Packet, PacketBody, HEADER_SIZE};
use crate::segment::{should_segment, SegmentEngine};
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long a burst waits for queue space before giving up on a link
const BACKPRESSURE_WAIT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot stop flag that sleeping threads can wait on
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *lock(&self.stopped) = true;
        self.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *lock(&self.stopped)
    }

    /// Sleep for up to `timeout`. Returns true if stop was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.stopped);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// What a supervisor does when the peer closes a link on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerClose {
    /// Stop supervising; the peer will dial back if it returns
    Release,
    /// Reopen and wait for the peer to come back
    Rearm,
}

/// Threads belonging to one connect/disconnect cycle
#[derive(Clone, Default)]
pub(crate) struct Session {
    stop: Arc<StopSignal>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Session {
    pub(crate) fn stop_signal(&self) -> &Arc<StopSignal> {
        &self.stop
    }

    pub(crate) fn spawn<F>(&self, name: String, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name).spawn(f)?;
        let mut threads = lock(&self.threads);
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
        Ok(())
    }

    /// Stop and join every thread. Links are closed between the two so no
    /// read loop outlives the session. A thread shutting down its own
    /// session is not joined.
    pub(crate) fn shutdown(&self, core: &ManetCore) {
        self.stop.trigger();
        core.close_links();
        let current = thread::current().id();
        loop {
            let next = lock(&self.threads).pop();
            let Some(handle) = next else { break };
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Transport thread panicked");
            }
        }
    }
}

/// Transport state shared by all variants
pub struct ManetCore {
    ctx: Arc<ManetContext>,
    listener: Arc<dyn ManetListener>,
    status: Mutex<TransportStatus>,
    issues: Mutex<IssueBoard>,
    links: RwLock<HashMap<LinkId, Arc<LinkChannel>>>,
    segments: SegmentEngine,
    peers: Mutex<PeerTable>,
    heartbeat: Mutex<HeartbeatSchedule>,
    announced: AtomicBool,
}

impl ManetCore {
    pub fn new(ctx: Arc<ManetContext>, listener: Arc<dyn ManetListener>) -> Self {
        let config = ctx.config();
        Self {
            segments: SegmentEngine::new(config.node_address, config.reassembly_timeout()),
            peers: Mutex::new(PeerTable::new(config.peer_timeout())),
            heartbeat: Mutex::new(HeartbeatSchedule::new(config.heartbeat_interval())),
            status: Mutex::new(TransportStatus::Uninitialized),
            issues: Mutex::new(IssueBoard::new()),
            links: RwLock::new(HashMap::new()),
            announced: AtomicBool::new(false),
            listener,
            ctx,
        }
    }

    pub fn ctx(&self) -> &Arc<ManetContext> {
        &self.ctx
    }

    pub fn address(&self) -> NodeAddress {
        self.ctx.address()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn status(&self) -> TransportStatus {
        *lock(&self.status)
    }

    pub(crate) fn set_status(&self, to: TransportStatus) {
        let from = std::mem::replace(&mut *lock(&self.status), to);
        if from != to {
            info!(node = %self.address(), "Transport {:?} -> {:?}", from, to);
            self.listener.on_status(to);
        }
    }

    fn require(&self, operation: &'static str, allowed: &[TransportStatus]) -> Result<()> {
        let status = self.status();
        if allowed.contains(&status) {
            Ok(())
        } else {
            Err(ManetError::InvalidState { operation, status })
        }
    }

    /// Start `init()`: earlier issues are cleared so checks run fresh
    pub(crate) fn begin_init(&self) -> Result<()> {
        self.require(
            "init",
            &[
                TransportStatus::Uninitialized,
                TransportStatus::Initializing,
                TransportStatus::Disconnected,
            ],
        )?;
        lock(&self.issues).clear();
        self.set_status(TransportStatus::Initializing);
        Ok(())
    }

    /// Raise what the checks found; fail on the first blocker
    pub(crate) fn finish_init(&self, found: Vec<ManetIssue>) -> Result<()> {
        for issue in found {
            self.raise_issue(issue);
        }
        self.check_blockers()
    }

    pub(crate) fn begin_connect(&self) -> Result<()> {
        self.check_blockers()?;
        self.require(
            "connect",
            &[TransportStatus::Initializing, TransportStatus::Disconnected],
        )?;
        self.announced.store(false, Ordering::Release);
        lock(&self.heartbeat).reset();
        self.set_status(TransportStatus::Connecting);
        Ok(())
    }

    pub(crate) fn enter_pause(&self) -> Result<()> {
        if self.status() == TransportStatus::Paused {
            return Ok(());
        }
        self.require(
            "pause",
            &[TransportStatus::Connecting, TransportStatus::Connected],
        )?;
        self.set_status(TransportStatus::Paused);
        Ok(())
    }

    pub(crate) fn leave_pause(&self) -> Result<()> {
        match self.status() {
            TransportStatus::Paused => {
                let next = if self.has_ready_link() {
                    TransportStatus::Connected
                } else {
                    TransportStatus::Connecting
                };
                self.set_status(next);
                Ok(())
            }
            TransportStatus::Connected | TransportStatus::Connecting => Ok(()),
            status => Err(ManetError::InvalidState {
                operation: "resume",
                status,
            }),
        }
    }

    /// Returns false when already disconnected
    pub(crate) fn begin_disconnect(&self) -> bool {
        match self.status() {
            TransportStatus::Disconnected | TransportStatus::Disconnecting => false,
            _ => {
                self.set_status(TransportStatus::Disconnecting);
                true
            }
        }
    }

    pub(crate) fn finish_disconnect(&self) {
        self.close_links();
        self.set_status(TransportStatus::Disconnected);
    }

    // ------------------------------------------------------------------
    // Issues
    // ------------------------------------------------------------------

    pub fn raise_issue(&self, issue: ManetIssue) {
        if issue.is_blocker() {
            error!(kind = ?issue.kind(), "{}", issue);
        } else {
            warn!(kind = ?issue.kind(), "{}", issue);
        }
        self.listener.on_issue(&issue);
        lock(&self.issues).raise(issue);
    }

    /// Every active issue, oldest first
    pub fn issues(&self) -> Vec<ManetIssue> {
        lock(&self.issues).all().to_vec()
    }

    /// Forget all issues, e.g. after the user fixed the hardware
    pub fn clear_issues(&self) {
        lock(&self.issues).clear();
    }

    fn check_blockers(&self) -> Result<()> {
        match lock(&self.issues).first_blocker() {
            Some(issue) => Err(ManetError::Blocked(issue.clone())),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    fn links_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<LinkId, Arc<LinkChannel>>> {
        self.links.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn links_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<LinkId, Arc<LinkChannel>>> {
        self.links.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register_link(&self, link: Arc<LinkChannel>) {
        debug!(link = %link.id(), role = ?link.role(), "Link registered");
        self.links_write().insert(link.id(), link);
    }

    pub(crate) fn remove_link(&self, id: LinkId) {
        self.links_write().remove(&id);
        if self.status() == TransportStatus::Connected && !self.has_ready_link() {
            self.set_status(TransportStatus::Connecting);
        }
    }

    fn link(&self, id: LinkId) -> Option<Arc<LinkChannel>> {
        self.links_read().get(&id).cloned()
    }

    /// Authenticated links, ordered by id
    pub fn ready_links(&self) -> Vec<Arc<LinkChannel>> {
        let mut links: Vec<_> = self
            .links_read()
            .values()
            .filter(|l| l.is_ready_to_write())
            .cloned()
            .collect();
        links.sort_by_key(|l| l.id());
        links
    }

    pub fn has_ready_link(&self) -> bool {
        self.links_read().values().any(|l| l.is_ready_to_write())
    }

    pub fn link_count(&self) -> usize {
        self.links_read().len()
    }

    pub(crate) fn close_links(&self) {
        let links: Vec<_> = self.links_write().drain().map(|(_, l)| l).collect();
        for link in links {
            link.close();
        }
    }

    /// Run a link's read loop on the calling thread until it ends. A link
    /// registered after `stop` fired is closed at once.
    pub(crate) fn drive_link(
        &self,
        link: &Arc<LinkChannel>,
        mut reader: Box<dyn Read + Send>,
        stop: &StopSignal,
    ) -> std::result::Result<(), LinkError> {
        self.register_link(link.clone());
        if stop.is_triggered() {
            link.close();
        }
        let result = link.run(&mut *reader, self);
        link.close();
        self.remove_link(link.id());
        drop(reader);
        result
    }

    /// Keep a dialed link up: reopen after failures with a fixed delay,
    /// and raise a non-blocking issue once attempts run out. A link the
    /// peer closed deliberately is handled per `on_peer_close` and does not
    /// count as a failure.
    pub(crate) fn supervise<F>(
        &self,
        label: &str,
        stop: &StopSignal,
        on_peer_close: PeerClose,
        mut open: F,
    ) where
        F: FnMut() -> io::Result<(LinkChannel, Box<dyn Read + Send>)>,
    {
        let config = self.ctx.config();
        let mut failures: u32 = 0;
        while !stop.is_triggered() {
            match open() {
                Ok((link, reader)) => {
                    let link = Arc::new(link);
                    let result = self.drive_link(&link, reader, stop);
                    if link.was_authenticated() {
                        failures = 0;
                    }
                    match result {
                        Ok(()) if stop.is_triggered() => return,
                        Ok(()) if on_peer_close == PeerClose::Release => {
                            info!("{}: closed by peer", label);
                            return;
                        }
                        Ok(()) => {
                            info!("{}: closed by peer, waiting for it to return", label);
                            if stop.wait_timeout(config.reconnect_delay()) {
                                return;
                            }
                            continue;
                        }
                        Err(e) => warn!("{}: link lost: {}", label, e),
                    }
                }
                Err(e) => warn!("{}: open failed: {}", label, e),
            }
            if stop.is_triggered() {
                return;
            }

            failures += 1;
            if failures > config.max_reconnect_attempts {
                self.raise_issue(ManetIssue::app_code(
                    false,
                    format!(
                        "{} unreachable after {} reconnect attempts",
                        label, config.max_reconnect_attempts
                    ),
                ));
                return;
            }
            ManetStats::inc(&self.ctx.stats().reconnects);
            debug!("{}: reconnecting in {:?}", label, config.reconnect_delay());
            if stop.wait_timeout(config.reconnect_delay()) {
                return;
            }
        }
    }

    /// Periodic-task loop run on a transport's supervisor thread
    pub(crate) fn run_periodic(&self, stop: &StopSignal) {
        let tick = (self.ctx.config().heartbeat_interval() / 4)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        while !stop.wait_timeout(tick) {
            self.execute_periodic_tasks(Instant::now());
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send an application or admin packet on every ready link
    pub fn burst(&self, packet: Packet) -> Result<()> {
        match self.status() {
            TransportStatus::Paused => return Err(ManetError::Paused),
            TransportStatus::Connected | TransportStatus::Connecting => {}
            status => {
                return Err(ManetError::InvalidState {
                    operation: "burst",
                    status,
                })
            }
        }
        self.send(&packet)
    }

    fn send(&self, packet: &Packet) -> Result<()> {
        let links = self.ready_links();
        if links.is_empty() {
            debug!(kind = ?packet.packet_type(), "No ready link");
            return Err(ManetError::NoReadyLink);
        }

        let mtu = self.ctx.config().mtu;
        let encoded = packet.encode();
        let frames = if should_segment(encoded.len() - HEADER_SIZE, mtu) {
            let fragments =
                self.segments
                    .segment(&encoded, mtu, packet.destination(), packet.timestamp())?;
            ManetStats::add(&self.ctx.stats().fragments_tx, fragments.len() as u64);
            fragments.iter().map(Packet::encode).collect()
        } else {
            vec![encoded]
        };

        let mut delivered = false;
        let mut last_error = None;
        for link in &links {
            match frames
                .iter()
                .try_for_each(|frame| Self::queue_with_backpressure(link, frame))
            {
                Ok(()) => delivered = true,
                Err(e) => {
                    warn!(link = %link.id(), "Burst failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        if !delivered {
            return Err(last_error.map_or(ManetError::NoReadyLink, ManetError::from));
        }
        let stats = self.ctx.stats();
        if packet.is_admin() {
            ManetStats::inc(&stats.admin_tx);
        } else {
            ManetStats::inc(&stats.packets_tx);
        }
        debug!(
            kind = ?packet.packet_type(),
            dest = %packet.destination(),
            frames = frames.len(),
            "Burst sent"
        );
        Ok(())
    }

    fn queue_with_backpressure(
        link: &LinkChannel,
        frame: &[u8],
    ) -> std::result::Result<(), LinkError> {
        let deadline = Instant::now() + BACKPRESSURE_WAIT;
        loop {
            match link.queue_encoded(frame) {
                Err(LinkError::QueueFull { .. }) if Instant::now() < deadline => {
                    link.flush()?;
                    thread::sleep(Duration::from_millis(1));
                }
                other => return other.map(|_| ()),
            }
        }
    }

    /// Probe the round trip to `peer`
    pub fn ping(&self, peer: NodeAddress) -> Result<()> {
        let packet = Packet::ping(self.address(), peer, self.ctx.clock().now());
        self.burst(packet)
    }

    /// Tell every peer this node is leaving
    pub(crate) fn announce_departure(&self) {
        let packet = Packet::disconnecting(self.address(), self.ctx.clock().now());
        if let Err(e) = self.send(&packet) {
            debug!("Departure not announced: {}", e);
        }
    }

    pub(crate) fn report_high_noise(&self, backlog: usize) {
        debug!(backlog, "Stream ring overflowing");
        self.listener.on_high_noise(backlog);
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    fn record_decode_failure(&self, link: LinkId, err: &DecodeError) {
        let stats = self.ctx.stats();
        match err {
            DecodeError::ChecksumMismatch { .. } => ManetStats::inc(&stats.checksum_failures),
            DecodeError::UnknownType(_) => ManetStats::inc(&stats.unknown_type_drops),
            DecodeError::HeaderTooShort { .. } | DecodeError::MalformedBody { .. } => {
                ManetStats::inc(&stats.malformed_drops)
            }
        }
        warn!(link = %link, "Dropping packet: {}", err);
    }

    fn record_seen(&self, address: NodeAddress, now: Instant) {
        let event = lock(&self.peers).record_seen(address, now);
        match event {
            Some(PeerEvent::Discovered(peer)) => {
                info!(peer = %peer, "Peer discovered");
                self.listener.on_devices_changed(peer);
            }
            Some(PeerEvent::Recovered(peer)) => {
                info!(peer = %peer, "Peer reachable again");
                self.listener.on_devices_changed(peer);
            }
            None => {}
        }
    }

    /// Route one decoded packet
    pub(crate) fn handle_packet(&self, link_id: LinkId, packet: Packet, now: Instant) {
        let me = self.address();
        let origin = packet.origin();
        let link = self.link(link_id);

        if packet.as_ping().is_some() {
            self.handle_ping(link.as_deref(), packet, now);
            return;
        }

        if origin == me {
            debug!(link = %link_id, "Dropping circular report");
            return;
        }
        if let Some(link) = &link {
            link.set_peer(origin);
        }

        if matches!(packet.body(), PacketBody::SegmentFragment(_)) {
            ManetStats::inc(&self.ctx.stats().fragments_rx);
            self.record_seen(origin, now);
            if !packet.is_for(me) {
                return;
            }
            let PacketBody::SegmentFragment(fragment) = packet.into_body() else {
                return;
            };
            if let Some(bytes) = self.segments.on_fragment_received(origin, fragment, now) {
                ManetStats::inc(&self.ctx.stats().payloads_reassembled);
                match packet::decode(&bytes) {
                    Ok(inner) if matches!(inner.body(), PacketBody::SegmentFragment(_)) => {
                        warn!(link = %link_id, "Dropping nested fragment");
                        ManetStats::inc(&self.ctx.stats().malformed_drops);
                    }
                    Ok(inner) => self.handle_packet(link_id, inner, now),
                    Err(e) => self.record_decode_failure(link_id, &e),
                }
            }
            return;
        }

        if matches!(packet.body(), PacketBody::Disconnecting) {
            ManetStats::inc(&self.ctx.stats().admin_rx);
            info!(peer = %origin, "Peer disconnecting");
            if lock(&self.peers).mark_unreachable(origin) {
                self.listener.on_peer_unreachable(origin);
                self.listener.on_devices_changed(origin);
            }
            if let Some(link) = &link {
                link.close();
            }
            return;
        }

        self.record_seen(origin, now);
        if !packet.is_for(me) {
            debug!(dest = %packet.destination(), "Dropping packet for another node");
            return;
        }

        if packet.is_admin() {
            ManetStats::inc(&self.ctx.stats().admin_rx);
            return;
        }
        ManetStats::inc(&self.ctx.stats().packets_rx);
        self.listener.on_rx(&packet);
    }

    fn handle_ping(&self, link: Option<&LinkChannel>, packet: Packet, now: Instant) {
        let me = self.address();
        ManetStats::inc(&self.ctx.stats().admin_rx);

        if packet.is_ping_request() {
            if packet.destination() != me {
                return;
            }
            self.record_seen(packet.origin(), now);
            let Some(link) = link else { return };
            link.set_peer(packet.origin());
            if let Some(reply) = packet.to_ping_reply(local_now_ms()) {
                match link.queue(&reply) {
                    Ok(_) => ManetStats::inc(&self.ctx.stats().admin_tx),
                    Err(e) => warn!(link = %link.id(), "Ping reply failed: {}", e),
                }
            }
            return;
        }

        if packet.origin() != me {
            return;
        }
        let peer = packet.destination();
        self.record_seen(peer, now);
        if let Some(rtt) = packet.finalize_ping(self.ctx.clock().now()) {
            debug!(peer = %peer, rtt_ms = rtt, "Ping returned");
            lock(&self.peers).record_rtt(peer, rtt, now);
            self.listener.on_latency(peer, rtt);
        }
    }

    // ------------------------------------------------------------------
    // Periodic
    // ------------------------------------------------------------------

    pub fn execute_periodic_tasks(&self, now: Instant) {
        if self.status() == TransportStatus::Connected && self.has_ready_link() {
            let due = lock(&self.heartbeat).is_due(now);
            if due {
                let beat = Packet::heartbeat(self.address(), self.ctx.clock().now());
                match self.send(&beat) {
                    Ok(()) => lock(&self.heartbeat).mark_sent(now),
                    Err(e) => debug!("Heartbeat not sent: {}", e),
                }
            }
        }

        let expired = self.segments.collect_garbage(now);
        if expired > 0 {
            ManetStats::add(&self.ctx.stats().reassembly_expired, expired as u64);
            warn!(expired, "Discarded incomplete reassemblies");
        }

        let (lost, evicted) = {
            let mut peers = lock(&self.peers);
            let lost = peers.sweep(now);
            (lost, peers.prune_stale(now))
        };
        for peer in lost {
            warn!(peer = %peer, "Peer unreachable");
            self.listener.on_peer_unreachable(peer);
            self.listener.on_devices_changed(peer);
        }
        if evicted > 0 {
            debug!(evicted, "Forgot long-silent peers");
        }
    }

    /// Liveness and latency for every peer heard
    pub fn peers(&self) -> Vec<PeerSummary> {
        lock(&self.peers).summaries()
    }

    /// Incomplete reassemblies held right now
    pub fn pending_reassemblies(&self) -> usize {
        self.segments.pending()
    }
}

impl FrameSink for ManetCore {
    fn on_frame(&self, link: LinkId, frame: Vec<u8>) {
        match packet::decode(&frame) {
            Ok(packet) => self.handle_packet(link, packet, Instant::now()),
            Err(e) => self.record_decode_failure(link, &e),
        }
    }

    fn on_authenticated(&self, link: LinkId) {
        if self.status() == TransportStatus::Connecting {
            self.set_status(TransportStatus::Connected);
        }
        if !self.announced.swap(true, Ordering::AcqRel) {
            self.listener.on_authenticated_on_net();
        }
        // Announce ourselves so the far end learns our address at once
        if let Some(link) = self.link(link) {
            let beat = Packet::heartbeat(self.address(), self.ctx.clock().now());
            if link.queue(&beat).is_ok() {
                ManetStats::inc(&self.ctx.stats().admin_tx);
            }
        }
    }
}
