//! Byte-stream transport
//!
//! Serial lines, SDR modems and in-process pipes all look the same here: a
//! [`StreamPort`] hands out a reader and a writer, and the transport runs a
//! single link over them. Incoming bytes are pumped into a
//! [`StreamRingBuffer`] so a producer that outruns the parser shows up as
//! `on_high_noise` instead of blocking the port.
//!
//! ```text
//!   port reader ──pump──► ring ──► link read loop ──► ManetCore
//!   port writer ◄──────────────── link queue ◄──────── burst()
//! ```
//!
//! Both ends of a stream must take opposite handshake roles. Unless set
//! explicitly, the side with the greater address issues the challenge.
//! When the far end leaves (disconnect or pause) the port is reopened and
//! the link waits for it to come back.

use super::base::{ManetCore, PeerClose, Session};
use super::{is_organizer, ManetListener, ManetTransport, TransportStatus};
use crate::context::ManetContext;
use crate::error::Result;
use crate::issue::ManetIssue;
use crate::link::{LinkChannel, LinkRole};
use crate::packet::{NodeAddress, Packet};
use crate::stream::{RingReader, RingWriter, StreamRingBuffer};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const PUMP_CHUNK: usize = 16 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Source of a bidirectional byte stream
///
/// Readers returned by `open` should time out periodically (as
/// `ErrorKind::TimedOut` or `WouldBlock`) so shutdown is never stuck
/// behind a blocking read.
pub trait StreamPort: Send + Sync {
    /// Name for logs and issues
    fn name(&self) -> &str;

    /// Capability checks run by `init()`
    fn check(&self) -> Vec<ManetIssue> {
        Vec::new()
    }

    /// Open the stream; called again after each failure
    fn open(&self) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)>;
}

/// One end of an in-process stream pair
#[derive(Debug, Clone)]
pub struct DuplexPort {
    name: String,
    inbound: Arc<StreamRingBuffer>,
    outbound: Arc<StreamRingBuffer>,
    read_timeout: Duration,
}

impl DuplexPort {
    /// Builder: rename the port
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder: how long a read waits before reporting a timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Close both directions; readers on either end see EOF
    pub fn hang_up(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

/// Two connected ports: what one writes, the other reads
pub fn duplex_pair(capacity: usize) -> (DuplexPort, DuplexPort) {
    let a_to_b = Arc::new(StreamRingBuffer::new(capacity));
    let b_to_a = Arc::new(StreamRingBuffer::new(capacity));
    let timeout = Duration::from_millis(50);
    (
        DuplexPort {
            name: "duplex-a".into(),
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
            read_timeout: timeout,
        },
        DuplexPort {
            name: "duplex-b".into(),
            inbound: a_to_b,
            outbound: b_to_a,
            read_timeout: timeout,
        },
    )
}

impl StreamPort for DuplexPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> Vec<ManetIssue> {
        if self.inbound.is_closed() || self.outbound.is_closed() {
            vec![ManetIssue::hardware(true, format!("{} is hung up", self.name))]
        } else {
            Vec::new()
        }
    }

    fn open(&self) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        if self.inbound.is_closed() {
            return Err(io::Error::new(ErrorKind::NotConnected, "port hung up"));
        }
        Ok((
            Box::new(RingReader::new(self.inbound.clone(), Some(self.read_timeout))),
            Box::new(RingWriter::new(self.outbound.clone())),
        ))
    }
}

/// Link reader fed by a pump thread. Dropping it stops the pump.
struct PumpedReader {
    ring: Arc<StreamRingBuffer>,
    reader: RingReader,
    pump: Option<JoinHandle<()>>,
}

impl PumpedReader {
    fn spawn(
        core: Arc<ManetCore>,
        mut source: Box<dyn Read + Send>,
        label: String,
    ) -> io::Result<Self> {
        let config = core.ctx().config();
        let ring = Arc::new(StreamRingBuffer::with_slack(
            config.ring_capacity,
            config.ring_slack,
        ));
        let reader = RingReader::new(ring.clone(), Some(config.read_timeout()));
        let sink = ring.clone();
        let pump = thread::Builder::new()
            .name(format!("manet-pump-{}", label))
            .spawn(move || {
                let mut buf = vec![0u8; PUMP_CHUNK];
                while !sink.is_closed() {
                    match source.read(&mut buf) {
                        Ok(0) => {
                            debug!("{}: stream ended", label);
                            break;
                        }
                        Ok(n) => {
                            if sink.write(&buf[..n]) {
                                core.report_high_noise(sink.backlog());
                            }
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                ErrorKind::TimedOut
                                    | ErrorKind::WouldBlock
                                    | ErrorKind::Interrupted
                            ) => {}
                        Err(e) => {
                            warn!("{}: read failed: {}", label, e);
                            break;
                        }
                    }
                }
                sink.close();
            })?;
        Ok(Self {
            ring,
            reader,
            pump: Some(pump),
        })
    }
}

impl Read for PumpedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Drop for PumpedReader {
    fn drop(&mut self) {
        self.ring.close();
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

/// Transport over a [`StreamPort`]
pub struct StreamManet<P: StreamPort + 'static> {
    core: Arc<ManetCore>,
    port: Arc<P>,
    peer: Option<NodeAddress>,
    role: Option<LinkRole>,
    session: Mutex<Option<Session>>,
}

impl<P: StreamPort + 'static> StreamManet<P> {
    pub fn new(ctx: Arc<ManetContext>, listener: Arc<dyn ManetListener>, port: P) -> Self {
        Self {
            core: Arc::new(ManetCore::new(ctx, listener)),
            port: Arc::new(port),
            peer: None,
            role: None,
            session: Mutex::new(None),
        }
    }

    /// Builder: address of the node at the other end, used to pick roles
    pub fn with_peer(mut self, peer: NodeAddress) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Builder: force a handshake role
    pub fn with_role(mut self, role: LinkRole) -> Self {
        self.role = Some(role);
        self
    }

    /// Handshake role for this end, if it can be decided
    pub fn role(&self) -> Option<LinkRole> {
        self.role.or_else(|| {
            self.peer.map(|peer| {
                if is_organizer(self.core.address(), peer) {
                    LinkRole::Challenger
                } else {
                    LinkRole::Responder
                }
            })
        })
    }

    pub fn core(&self) -> &Arc<ManetCore> {
        &self.core
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    fn start(&self) -> io::Result<()> {
        let role = self
            .role()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "link role undecided"))?;
        let session = Session::default();

        let core = self.core.clone();
        let port = self.port.clone();
        let stop = session.stop_signal().clone();
        let spawned = session.spawn(format!("manet-stream-{}", port.name()), move || {
            let label = port.name().to_string();
            let ctx = core.ctx().clone();
            core.supervise(&label, &stop, PeerClose::Rearm, || {
                let (source, writer) = port.open()?;
                let reader = PumpedReader::spawn(core.clone(), source, label.clone())?;
                let ring = reader.ring.clone();
                let link =
                    LinkChannel::new(role, writer, ctx.clone()).with_shutdown(move || ring.close());
                Ok((link, Box::new(reader) as Box<dyn Read + Send>))
            });
        });

        let core = self.core.clone();
        let stop = session.stop_signal().clone();
        let periodic = spawned.and_then(|_| {
            session.spawn("manet-periodic".into(), move || core.run_periodic(&stop))
        });
        if let Err(e) = periodic {
            session.shutdown(&self.core);
            return Err(e);
        }

        *lock(&self.session) = Some(session);
        Ok(())
    }

    fn stop_session(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.shutdown(&self.core);
        }
    }

    fn fail_start(&self, e: io::Error) -> crate::error::ManetError {
        let issue = ManetIssue::hardware(true, format!("{}: {}", self.port.name(), e));
        self.core.raise_issue(issue.clone());
        self.core.set_status(TransportStatus::Disconnected);
        crate::error::ManetError::Blocked(issue)
    }
}

impl<P: StreamPort + 'static> ManetTransport for StreamManet<P> {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn address(&self) -> NodeAddress {
        self.core.address()
    }

    fn status(&self) -> TransportStatus {
        self.core.status()
    }

    fn max_packet_size(&self) -> usize {
        self.core.ctx().config().mtu
    }

    fn init(&self) -> Result<()> {
        self.core.begin_init()?;
        let mut found = Vec::new();
        if let Err(e) = self.core.ctx().config().validate() {
            found.push(ManetIssue::app_code(true, e.to_string()));
        }
        found.extend(self.port.check());
        if self.role().is_none() {
            found.push(ManetIssue::app_code(
                true,
                "stream link needs a peer address or an explicit role",
            ));
        }
        self.core.finish_init(found)
    }

    fn connect(&self) -> Result<()> {
        self.core.begin_connect()?;
        self.start().map_err(|e| self.fail_start(e))
    }

    fn burst(&self, packet: Packet) -> Result<()> {
        self.core.burst(packet)
    }

    /// A stream cannot idle cheaply, so pausing drops the link. The peer
    /// is told first so it re-arms and answers the handshake on resume.
    fn pause(&self) -> Result<()> {
        if self.core.status() == TransportStatus::Paused {
            return Ok(());
        }
        self.core.enter_pause()?;
        self.core.announce_departure();
        self.stop_session();
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let was_paused = self.core.status() == TransportStatus::Paused;
        self.core.leave_pause()?;
        if was_paused {
            self.start().map_err(|e| self.fail_start(e))?;
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        if !self.core.begin_disconnect() {
            return Ok(());
        }
        self.core.announce_departure();
        self.stop_session();
        self.core.finish_disconnect();
        Ok(())
    }

    fn execute_periodic_tasks(&self, now: Instant) {
        self.core.execute_periodic_tasks(now)
    }

    fn ping(&self, peer: NodeAddress) -> Result<()> {
        self.core.ping(peer)
    }
}

impl<P: StreamPort + 'static> Drop for StreamManet<P> {
    fn drop(&mut self) {
        self.stop_session();
    }
}
