//! TCP socket transport
//!
//! One listener accepts inbound links; one supervisor per configured peer
//! dials out and redials after failures. The accepting side issues the
//! link challenge, the dialing side answers it.
//!
//! ```text
//!   accept thread ──► link thread (Challenger) ─┐
//!   dial thread   ──► link (Responder) ─────────┼──► ManetCore
//!   periodic thread ── heartbeats / sweeps ─────┘
//! ```

use super::base::{ManetCore, PeerClose, Session};
use super::{ManetListener, ManetTransport, TransportStatus};
use crate::context::ManetContext;
use crate::error::{ManetError, Result};
use crate::issue::ManetIssue;
use crate::link::{LinkChannel, LinkRole};
use crate::packet::{NodeAddress, Packet};
use std::io::{self, ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport over TCP sockets
pub struct SocketManet {
    core: Arc<ManetCore>,
    bind: Option<SocketAddr>,
    peers: Vec<SocketAddr>,
    local_addr: Mutex<Option<SocketAddr>>,
    session: Mutex<Option<Session>>,
}

impl SocketManet {
    pub fn new(ctx: Arc<ManetContext>, listener: Arc<dyn ManetListener>) -> Self {
        Self {
            core: Arc::new(ManetCore::new(ctx, listener)),
            bind: None,
            peers: Vec::new(),
            local_addr: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    /// Builder: accept inbound links on `addr` (port 0 picks a free port)
    pub fn listen_on(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(addr);
        self
    }

    /// Builder: dial `addr` on connect
    pub fn with_peer(mut self, addr: SocketAddr) -> Self {
        self.peers.push(addr);
        self
    }

    /// Address the listener actually bound, once connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn core(&self) -> &Arc<ManetCore> {
        &self.core
    }

    fn bind_listener(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?;
        info!("Listening on {}", bound);
        *lock(&self.local_addr) = Some(bound);
        Ok(listener)
    }

    fn start(&self, session: &Session) -> io::Result<()> {
        let ctx = self.core.ctx().clone();

        if let Some(addr) = self.bind {
            let listener = match self.bind_listener(addr) {
                Ok(listener) => listener,
                Err(e) => {
                    return Err(io::Error::new(
                        e.kind(),
                        format!("cannot listen on {}: {}", addr, e),
                    ))
                }
            };
            let core = self.core.clone();
            let accept_session = session.clone();
            session.spawn("manet-accept".into(), move || {
                accept_loop(&core, listener, &accept_session)
            })?;
        }

        for peer in self.peers.clone() {
            let core = self.core.clone();
            let ctx = ctx.clone();
            let stop = session.stop_signal().clone();
            session.spawn(format!("manet-dial-{}", peer), move || {
                let label = format!("peer {}", peer);
                core.supervise(&label, &stop, PeerClose::Release, || {
                    let stream = TcpStream::connect_timeout(&peer, DIAL_TIMEOUT)?;
                    debug!("Dialed {}", peer);
                    stream_link(stream, LinkRole::Responder, &ctx)
                });
            })?;
        }

        let core = self.core.clone();
        let stop = session.stop_signal().clone();
        session.spawn("manet-periodic".into(), move || core.run_periodic(&stop))?;
        Ok(())
    }

    fn stop_session(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.shutdown(&self.core);
        }
    }
}

/// Wrap a connected stream in a link
fn stream_link(
    stream: TcpStream,
    role: LinkRole,
    ctx: &Arc<ManetContext>,
) -> io::Result<(LinkChannel, Box<dyn Read + Send>)> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(ctx.config().read_timeout()))?;
    let writer = stream.try_clone()?;
    let hook = stream.try_clone()?;
    let link = LinkChannel::new(role, Box::new(writer), ctx.clone()).with_shutdown(move || {
        let _ = hook.shutdown(Shutdown::Both);
    });
    Ok((link, Box::new(stream)))
}

fn accept_loop(core: &Arc<ManetCore>, listener: TcpListener, session: &Session) {
    let stop = session.stop_signal();
    while !stop.is_triggered() {
        match listener.accept() {
            Ok((stream, from)) => {
                info!("Incoming link from {}", from);
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("Rejecting {}: {}", from, e);
                    continue;
                }
                let (link, reader) = match stream_link(stream, LinkRole::Challenger, core.ctx()) {
                    Ok(parts) => parts,
                    Err(e) => {
                        warn!("Rejecting {}: {}", from, e);
                        continue;
                    }
                };
                let core = core.clone();
                let stop = stop.clone();
                let spawned = session.spawn(format!("manet-link-{}", from), move || {
                    let link = Arc::new(link);
                    if let Err(e) = core.drive_link(&link, reader, &stop) {
                        debug!("Inbound link from {} ended: {}", from, e);
                    }
                });
                if let Err(e) = spawned {
                    warn!("Cannot start link thread for {}: {}", from, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                stop.wait_timeout(ACCEPT_POLL);
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                stop.wait_timeout(ACCEPT_POLL);
            }
        }
    }
    debug!("Accept loop stopped");
}

impl ManetTransport for SocketManet {
    fn name(&self) -> &'static str {
        "socket"
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
        if self.bind.is_none() && self.peers.is_empty() {
            found.push(ManetIssue::app_code(
                true,
                "no listen address and no peers configured",
            ));
        }
        self.core.finish_init(found)
    }

    fn connect(&self) -> Result<()> {
        self.core.begin_connect()?;
        let session = Session::default();
        if let Err(e) = self.start(&session) {
            session.shutdown(&self.core);
            let issue = ManetIssue::hardware(true, e.to_string());
            self.core.raise_issue(issue.clone());
            self.core.set_status(TransportStatus::Disconnected);
            return Err(ManetError::Blocked(issue));
        }
        *lock(&self.session) = Some(session);
        Ok(())
    }

    fn burst(&self, packet: Packet) -> Result<()> {
        self.core.burst(packet)
    }

    fn pause(&self) -> Result<()> {
        self.core.enter_pause()
    }

    fn resume(&self) -> Result<()> {
        self.core.leave_pause()
    }

    fn disconnect(&self) -> Result<()> {
        if !self.core.begin_disconnect() {
            return Ok(());
        }
        self.core.announce_departure();
        self.stop_session();
        self.core.finish_disconnect();
        *lock(&self.local_addr) = None;
        Ok(())
    }

    fn execute_periodic_tasks(&self, now: Instant) {
        self.core.execute_periodic_tasks(now)
    }

    fn ping(&self, peer: NodeAddress) -> Result<()> {
        self.core.ping(peer)
    }
}

impl Drop for SocketManet {
    fn drop(&mut self) {
        self.stop_session();
    }
}
