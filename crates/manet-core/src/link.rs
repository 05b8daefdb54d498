//! Per-connection protocol driver
//!
//! A [`LinkChannel`] wraps one byte stream. It starts in
//! [`LinkState::AwaitingChallenge`]; the listening side sends a sync word and
//! a random challenge, the connecting side answers with a keyed digest, and
//! the listening side replies with a one-byte verdict. Only then does the
//! link carry packets.
//!
//! ```text
//! Challenger                         Responder
//!     ── SYNC_WORD ‖ challenge (24B) ──►   (scans past stale bytes)
//!     ◄──────────── digest (32B) ──────
//!     ── verdict (1B) ─────────────────►
//! ```
//!
//! Packets travel as length-prefixed frames:
//!
//! ```text
//! ┌────────────────────┬──────────────────────────────┐
//! │ Length (4B, BE)    │ Encoded packet (Length B)    │
//! └────────────────────┴──────────────────────────────┘
//! ```
//!
//! States only move forward: AwaitingChallenge → Authenticated → Closed.

use crate::context::{ManetContext, ManetStats};
use crate::error::LinkError;
use crate::packet::{NodeAddress, Packet};
use blake2::{Blake2s256, Digest};
use byteorder::{BigEndian, WriteBytesExt};
use rand::RngCore;
use std::collections::VecDeque;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{debug, info, warn};

/// Challenge token length
pub const CHALLENGE_LEN: usize = 16;
/// Challenge response length
pub const RESPONSE_LEN: usize = 32;
/// Frame length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Marks the start of a handshake in a byte stream
pub const SYNC_WORD: [u8; 8] = [0x7E, 0x4D, 0x4E, 0x45, 0x54, 0x21, 0xA5, 0x5A];
/// Challenger's verdict: response accepted
pub const VERDICT_ACCEPT: u8 = 0x06;
/// Challenger's verdict: response rejected
pub const VERDICT_REJECT: u8 = 0x15;

const RESPONSE_DOMAIN: &[u8] = b"manet-link-v1";

/// Process-unique link identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn new(id: u64) -> Self {
        LinkId(id)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Link lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    AwaitingChallenge = 0,
    Authenticated = 1,
    Closed = 2,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkState::AwaitingChallenge,
            1 => LinkState::Authenticated,
            _ => LinkState::Closed,
        }
    }
}

/// Which half of the handshake this side performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Listening side: issues the challenge and checks the answer
    Challenger,
    /// Connecting side: answers the challenge
    Responder,
}

/// Receives what the read loop produces
pub trait FrameSink: Send + Sync {
    /// One complete frame, in arrival order
    fn on_frame(&self, link: LinkId, frame: Vec<u8>);

    /// The handshake completed
    fn on_authenticated(&self, _link: LinkId) {}
}

/// Called after every successful transmit with the packet size in bytes
pub type TransmitListener = Box<dyn Fn(LinkId, usize) + Send + Sync>;

type ShutdownHook = Box<dyn Fn() + Send + Sync>;

/// Keyed digest of a challenge
pub fn challenge_response(secret: Option<&[u8]>, challenge: &[u8]) -> [u8; RESPONSE_LEN] {
    let mut hasher = Blake2s256::new();
    hasher.update(RESPONSE_DOMAIN);
    if let Some(secret) = secret {
        hasher.update(secret);
    }
    hasher.update(challenge);
    let digest = hasher.finalize();
    let mut out = [0u8; RESPONSE_LEN];
    out.copy_from_slice(&digest);
    out
}

/// What a challenger puts on the wire to open a handshake
pub fn handshake_hello(challenge: &[u8; CHALLENGE_LEN]) -> Vec<u8> {
    let mut hello = Vec::with_capacity(SYNC_WORD.len() + CHALLENGE_LEN);
    hello.extend_from_slice(&SYNC_WORD);
    hello.extend_from_slice(challenge);
    hello
}

fn responses_match(expected: &[u8], actual: &[u8]) -> bool {
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Protocol driver for one connection
pub struct LinkChannel {
    id: LinkId,
    role: LinkRole,
    state: AtomicU8,
    authenticated: AtomicBool,
    writer: Mutex<Box<dyn Write + Send>>,
    queue: Mutex<VecDeque<Vec<u8>>>,
    slots: usize,
    max_frame_size: usize,
    secret: Option<Vec<u8>>,
    peer: Mutex<Option<NodeAddress>>,
    bytes_transmitted: AtomicU64,
    ctx: Arc<ManetContext>,
    on_transmit: Option<TransmitListener>,
    on_shutdown: Option<ShutdownHook>,
}

impl LinkChannel {
    /// New link writing to `writer`, sized from the context's config
    pub fn new(role: LinkRole, writer: Box<dyn Write + Send>, ctx: Arc<ManetContext>) -> Self {
        let config = ctx.config();
        Self {
            id: LinkId(ctx.next_link_id()),
            role,
            state: AtomicU8::new(LinkState::AwaitingChallenge as u8),
            authenticated: AtomicBool::new(false),
            writer: Mutex::new(writer),
            queue: Mutex::new(VecDeque::with_capacity(config.queue_slots)),
            slots: config.queue_slots,
            max_frame_size: config.max_frame_size,
            secret: config.link_secret.as_ref().map(|s| s.as_bytes().to_vec()),
            peer: Mutex::new(None),
            bytes_transmitted: AtomicU64::new(0),
            on_transmit: None,
            on_shutdown: None,
            ctx,
        }
    }

    /// Builder: notify `listener` after each transmit
    pub fn with_transmit_listener(mut self, listener: TransmitListener) -> Self {
        self.on_transmit = Some(listener);
        self
    }

    /// Builder: run `hook` once when the link closes, typically to unblock
    /// the stream the read loop is waiting on
    pub fn with_shutdown(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_shutdown = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once authenticated and until closed
    pub fn is_ready_to_write(&self) -> bool {
        self.state() == LinkState::Authenticated
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    /// True if the handshake ever completed, even after close
    pub fn was_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Address of the node at the far end, once it has sent a packet
    pub fn peer(&self) -> Option<NodeAddress> {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_peer(&self, address: NodeAddress) {
        let mut peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        if peer.is_none() {
            debug!(link = %self.id, peer = %address, "Link peer identified");
            *peer = Some(address);
        }
    }

    /// Packet bytes written by this link
    pub fn bytes_transmitted(&self) -> u64 {
        self.bytes_transmitted.load(Ordering::Relaxed)
    }

    /// Free outbound slots
    pub fn remaining_capacity(&self) -> usize {
        self.slots.saturating_sub(self.lock_queue().len())
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a packet and try to send it. Never blocks; returns the
    /// remaining queue capacity.
    pub fn queue(&self, packet: &Packet) -> Result<usize, LinkError> {
        self.queue_encoded(&packet.encode())
    }

    /// Queue an already encoded packet
    pub fn queue_encoded(&self, encoded: &[u8]) -> Result<usize, LinkError> {
        match self.state() {
            LinkState::AwaitingChallenge => {
                ManetStats::inc(&self.ctx.stats().queue_rejections);
                debug!(link = %self.id, "Refusing packet before authentication");
                return Err(LinkError::NotAuthenticated);
            }
            LinkState::Closed => return Err(LinkError::Closed),
            LinkState::Authenticated => {}
        }
        if encoded.len() > self.max_frame_size {
            return Err(LinkError::InvalidFrameLength {
                declared: encoded.len() as i64,
                max: self.max_frame_size,
            });
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + encoded.len());
        // Writes into a Vec cannot fail.
        let _ = frame.write_u32::<BigEndian>(encoded.len() as u32);
        frame.extend_from_slice(encoded);

        {
            let mut queue = self.lock_queue();
            if queue.len() >= self.slots {
                ManetStats::inc(&self.ctx.stats().queue_rejections);
                warn!(link = %self.id, slots = self.slots, "Outbound queue full");
                return Err(LinkError::QueueFull { slots: self.slots });
            }
            queue.push_back(frame);
        }

        self.flush()?;
        Ok(self.remaining_capacity())
    }

    /// Drain the queue onto the stream. A thread that finds the writer busy
    /// leaves its frames for the current holder, which re-checks the queue
    /// after releasing the writer.
    pub fn flush(&self) -> Result<(), LinkError> {
        loop {
            let mut writer = match self.writer.try_lock() {
                Ok(writer) => writer,
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
                Err(TryLockError::WouldBlock) => return Ok(()),
            };
            loop {
                let next = self.lock_queue().pop_front();
                let Some(frame) = next else { break };
                if let Err(e) = writer.write_all(&frame).and_then(|_| writer.flush()) {
                    drop(writer);
                    warn!(link = %self.id, "Write failed: {}", e);
                    self.close();
                    return Err(e.into());
                }
                self.record_transmit(frame.len() - LENGTH_PREFIX_LEN);
            }
            drop(writer);
            if self.is_closed() || self.lock_queue().is_empty() {
                return Ok(());
            }
        }
    }

    fn record_transmit(&self, bytes: usize) {
        self.bytes_transmitted
            .fetch_add(bytes as u64, Ordering::Relaxed);
        ManetStats::add(&self.ctx.stats().bytes_tx, bytes as u64);
        if let Some(listener) = &self.on_transmit {
            listener(self.id, bytes);
        }
    }

    fn write_raw(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Close the link. Only the first call has any effect; returns whether
    /// this call closed it.
    pub fn close(&self) -> bool {
        let previous = self.state.swap(LinkState::Closed as u8, Ordering::AcqRel);
        if LinkState::from_u8(previous) == LinkState::Closed {
            return false;
        }
        self.lock_queue().clear();
        if let Some(hook) = &self.on_shutdown {
            hook();
        }
        info!(link = %self.id, "Link closed");
        true
    }

    /// Drive the link until it closes. Frames go to `sink` in arrival order.
    /// Returns `Ok` when closed locally; any other exit closes the link and
    /// reports why.
    pub fn run(&self, reader: &mut dyn Read, sink: &dyn FrameSink) -> Result<(), LinkError> {
        let result = self.read_loop(reader, sink);
        if let Err(e) = &result {
            if self.close() {
                warn!(link = %self.id, "Link failed: {}", e);
            }
        }
        result
    }

    fn read_loop(&self, reader: &mut dyn Read, sink: &dyn FrameSink) -> Result<(), LinkError> {
        loop {
            match self.state() {
                LinkState::Closed => return Ok(()),
                LinkState::AwaitingChallenge => {
                    if !self.authenticate(reader)? {
                        return Ok(());
                    }
                    sink.on_authenticated(self.id);
                }
                LinkState::Authenticated => match self.read_frame(reader)? {
                    Some(frame) => {
                        debug!(link = %self.id, len = frame.len(), "Frame received");
                        sink.on_frame(self.id, frame);
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// Run this side of the handshake. Returns false if the link was closed
    /// while waiting.
    fn authenticate(&self, reader: &mut dyn Read) -> Result<bool, LinkError> {
        let secret = self.secret.as_deref();
        match self.role {
            LinkRole::Challenger => {
                let mut challenge = [0u8; CHALLENGE_LEN];
                rand::thread_rng().fill_bytes(&mut challenge);
                self.write_raw(&handshake_hello(&challenge))?;

                let mut response = [0u8; RESPONSE_LEN];
                if !self.read_full(reader, &mut response)? {
                    return Ok(false);
                }
                if !responses_match(&challenge_response(secret, &challenge), &response) {
                    // Best effort: the link is failing either way
                    let _ = self.write_raw(&[VERDICT_REJECT]);
                    return Err(LinkError::ChallengeFailed);
                }
                self.write_raw(&[VERDICT_ACCEPT])?;
            }
            LinkRole::Responder => {
                if !self.await_sync(reader)? {
                    return Ok(false);
                }
                let mut challenge = [0u8; CHALLENGE_LEN];
                if !self.read_full(reader, &mut challenge)? {
                    return Ok(false);
                }
                self.write_raw(&challenge_response(secret, &challenge))?;

                let mut verdict = [0u8; 1];
                if !self.read_full(reader, &mut verdict)? {
                    return Ok(false);
                }
                if verdict[0] != VERDICT_ACCEPT {
                    return Err(LinkError::ChallengeFailed);
                }
            }
        }

        self.state
            .compare_exchange(
                LinkState::AwaitingChallenge as u8,
                LinkState::Authenticated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| LinkError::Closed)?;
        self.authenticated.store(true, Ordering::Release);
        info!(link = %self.id, role = ?self.role, "Link authenticated");
        Ok(true)
    }

    /// Slide over the stream until the sync word has been read. Bytes left
    /// over from an earlier session are skipped.
    fn await_sync(&self, reader: &mut dyn Read) -> Result<bool, LinkError> {
        let mut window = [0u8; SYNC_WORD.len()];
        if !self.read_full(reader, &mut window)? {
            return Ok(false);
        }
        let mut skipped = 0usize;
        while window != SYNC_WORD {
            let mut next = [0u8; 1];
            if !self.read_full(reader, &mut next)? {
                return Ok(false);
            }
            window.copy_within(1.., 0);
            window[SYNC_WORD.len() - 1] = next[0];
            skipped += 1;
        }
        if skipped > 0 {
            debug!(link = %self.id, skipped, "Skipped stale bytes before handshake");
        }
        Ok(true)
    }

    fn read_frame(&self, reader: &mut dyn Read) -> Result<Option<Vec<u8>>, LinkError> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        if !self.read_full(reader, &mut prefix)? {
            return Ok(None);
        }
        let declared = i32::from_be_bytes(prefix);
        if declared < 0 || declared as usize > self.max_frame_size {
            ManetStats::inc(&self.ctx.stats().frames_rejected);
            return Err(LinkError::InvalidFrameLength {
                declared: declared as i64,
                max: self.max_frame_size,
            });
        }

        let mut frame = vec![0u8; declared as usize];
        if !self.read_full(reader, &mut frame)? {
            return Ok(None);
        }
        ManetStats::add(&self.ctx.stats().bytes_rx, frame.len() as u64);
        Ok(Some(frame))
    }

    /// Fill `buf` completely. Read timeouts just re-check the stop flag.
    /// Returns false once the link is closed.
    fn read_full(&self, reader: &mut dyn Read, buf: &mut [u8]) -> Result<bool, LinkError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.is_closed() {
                return Ok(false);
            }
            match reader.read(&mut buf[filled..]) {
                Ok(0) if self.is_closed() => return Ok(false),
                Ok(0) => {
                    return Err(LinkError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed the stream",
                    )))
                }
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(_) if self.is_closed() => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

impl fmt::Debug for LinkChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkChannel")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("peer", &self.peer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManetConfig;
    use std::io::Cursor;

    #[derive(Clone, Default)]
    struct Wire(Arc<Mutex<Vec<u8>>>);

    impl Write for Wire {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Wire {
        fn bytes(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct Frames(Mutex<Vec<Vec<u8>>>);

    impl FrameSink for Frames {
        fn on_frame(&self, _link: LinkId, frame: Vec<u8>) {
            self.0.lock().unwrap().push(frame);
        }
    }

    fn context() -> Arc<ManetContext> {
        ManetContext::shared(ManetConfig::default().queue_slots(2).max_frame_size(64_000))
    }

    /// Challenger bytes for a responder that gets accepted
    fn accepted_handshake() -> Vec<u8> {
        let mut input = handshake_hello(&[0u8; CHALLENGE_LEN]);
        input.push(VERDICT_ACCEPT);
        input
    }

    fn authenticated_responder(wire: Wire, ctx: Arc<ManetContext>) -> LinkChannel {
        let link = LinkChannel::new(LinkRole::Responder, Box::new(wire), ctx);
        let mut reader = Cursor::new(accepted_handshake());
        assert!(link.authenticate(&mut reader).unwrap());
        link
    }

    #[test]
    fn test_queue_before_authentication_writes_nothing() {
        let wire = Wire::default();
        let link = LinkChannel::new(LinkRole::Responder, Box::new(wire.clone()), context());
        let packet = Packet::heartbeat(NodeAddress::new(1), 0);
        assert!(!link.is_ready_to_write());
        assert!(matches!(link.queue(&packet), Err(LinkError::NotAuthenticated)));
        assert!(wire.bytes().is_empty());
    }

    #[test]
    fn test_responder_answers_challenge() {
        let wire = Wire::default();
        let challenge = [7u8; CHALLENGE_LEN];
        let link = LinkChannel::new(LinkRole::Responder, Box::new(wire.clone()), context());
        let mut input = handshake_hello(&challenge);
        input.push(VERDICT_ACCEPT);
        assert!(link.authenticate(&mut Cursor::new(input)).unwrap());
        assert_eq!(link.state(), LinkState::Authenticated);
        assert_eq!(wire.bytes(), challenge_response(None, &challenge).to_vec());
    }

    #[test]
    fn test_responder_skips_stale_bytes_before_sync() {
        let challenge = [9u8; CHALLENGE_LEN];
        let wire = Wire::default();
        let link = LinkChannel::new(LinkRole::Responder, Box::new(wire.clone()), context());
        // Leftover frame from an earlier session, including a partial sync word
        let mut input = vec![0x00, 0x00, 0x00, 0x03, 0x7E, 0x4D, 0x4E];
        input.extend_from_slice(&handshake_hello(&challenge));
        input.push(VERDICT_ACCEPT);
        assert!(link.authenticate(&mut Cursor::new(input)).unwrap());
        assert_eq!(wire.bytes(), challenge_response(None, &challenge).to_vec());
    }

    #[test]
    fn test_responder_waits_for_verdict() {
        let link = LinkChannel::new(LinkRole::Responder, Box::new(Wire::default()), context());
        let mut input = handshake_hello(&[0u8; CHALLENGE_LEN]);
        input.push(VERDICT_REJECT);
        assert!(matches!(
            link.run(&mut Cursor::new(input), &Frames::default()),
            Err(LinkError::ChallengeFailed)
        ));
        assert!(!link.was_authenticated());
        assert!(link.is_closed());
    }

    #[test]
    fn test_challenger_sends_verdict() {
        let wire = Wire::default();
        let link = LinkChannel::new(LinkRole::Challenger, Box::new(wire.clone()), context());
        let mut reader = Cursor::new(vec![0u8; RESPONSE_LEN]);
        assert!(link.run(&mut reader, &Frames::default()).is_err());

        let bytes = wire.bytes();
        assert_eq!(bytes.len(), SYNC_WORD.len() + CHALLENGE_LEN + 1);
        assert_eq!(&bytes[..SYNC_WORD.len()], &SYNC_WORD);
        assert_eq!(bytes[bytes.len() - 1], VERDICT_REJECT);
    }

    #[test]
    fn test_challenger_rejects_wrong_response() {
        let link = LinkChannel::new(LinkRole::Challenger, Box::new(Wire::default()), context());
        let mut reader = Cursor::new(vec![0u8; RESPONSE_LEN]);
        let sink = Frames::default();
        assert!(matches!(
            link.run(&mut reader, &sink),
            Err(LinkError::ChallengeFailed)
        ));
        assert!(link.is_closed());
    }

    #[test]
    fn test_secret_changes_response() {
        let challenge = [1u8; CHALLENGE_LEN];
        assert_ne!(
            challenge_response(None, &challenge),
            challenge_response(Some(b"key"), &challenge)
        );
    }

    #[test]
    fn test_queue_frames_packet() {
        let wire = Wire::default();
        let link = authenticated_responder(wire.clone(), context());
        let handshake = wire.bytes().len();

        let packet = Packet::raw_bytes(NodeAddress::new(1), NodeAddress::new(2), 0, b"hi".to_vec());
        let remaining = link.queue(&packet).unwrap();
        assert_eq!(remaining, 2);

        let bytes = wire.bytes();
        let frame = &bytes[handshake..];
        let encoded = packet.encode();
        assert_eq!(&frame[..4], &(encoded.len() as u32).to_be_bytes());
        assert_eq!(&frame[4..], &encoded[..]);
        assert_eq!(link.bytes_transmitted(), encoded.len() as u64);
    }

    #[test]
    fn test_transmit_listener_notified() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let link = LinkChannel::new(LinkRole::Responder, Box::new(Wire::default()), context())
            .with_transmit_listener(Box::new(move |_, n| {
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }));
        let mut reader = Cursor::new(accepted_handshake());
        link.authenticate(&mut reader).unwrap();

        let packet = Packet::heartbeat(NodeAddress::new(1), 0);
        link.queue(&packet).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), packet.encode().len() as u64);
    }

    #[test]
    fn test_read_loop_emits_single_frame() {
        let mut input = accepted_handshake();
        input.extend_from_slice(&[0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
        let link = LinkChannel::new(LinkRole::Responder, Box::new(Wire::default()), context());
        let sink = Frames::default();

        // Stream ends after the frame
        let result = link.run(&mut Cursor::new(input), &sink);
        assert!(matches!(result, Err(LinkError::Io(_))));

        let frames = sink.0.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], b"hello".to_vec());
    }

    #[test]
    fn test_negative_length_closes_link() {
        let mut input = accepted_handshake();
        input.extend_from_slice(&(-1i32).to_be_bytes());
        let ctx = context();
        let link = LinkChannel::new(LinkRole::Responder, Box::new(Wire::default()), ctx.clone());
        let result = link.run(&mut Cursor::new(input), &Frames::default());
        assert!(matches!(
            result,
            Err(LinkError::InvalidFrameLength { declared: -1, .. })
        ));
        assert!(link.is_closed());
        assert_eq!(ctx.stats().snapshot().frames_rejected, 1);
    }

    #[test]
    fn test_oversized_length_closes_link() {
        let mut input = accepted_handshake();
        input.extend_from_slice(&(64_001i32).to_be_bytes());
        let link = LinkChannel::new(LinkRole::Responder, Box::new(Wire::default()), context());
        assert!(matches!(
            link.run(&mut Cursor::new(input), &Frames::default()),
            Err(LinkError::InvalidFrameLength { .. })
        ));
    }

    #[test]
    fn test_close_is_once_and_runs_hook() {
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let link = LinkChannel::new(LinkRole::Challenger, Box::new(Wire::default()), context())
            .with_shutdown(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        assert!(link.close());
        assert!(!link.close());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(matches!(
            link.queue(&Packet::heartbeat(NodeAddress::new(1), 0)),
            Err(LinkError::Closed)
        ));
    }

    struct StalledWriter;

    impl Write for StalledWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "gone"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_closes_link() {
        let link = LinkChannel::new(LinkRole::Challenger, Box::new(StalledWriter), context());
        link.state
            .store(LinkState::Authenticated as u8, Ordering::Release);
        let err = link.queue(&Packet::heartbeat(NodeAddress::new(1), 0));
        assert!(matches!(err, Err(LinkError::Io(_))));
        assert!(link.is_closed());
    }

    #[test]
    fn test_queue_full_when_writer_busy() {
        let wire = Wire::default();
        let link = authenticated_responder(wire, context());
        let packet = Packet::heartbeat(NodeAddress::new(1), 0);

        // Hold the writer so frames pile up in the queue
        let guard = link.writer.lock().unwrap();
        assert_eq!(link.queue(&packet).unwrap(), 1);
        assert_eq!(link.queue(&packet).unwrap(), 0);
        assert!(matches!(
            link.queue(&packet),
            Err(LinkError::QueueFull { slots: 2 })
        ));
        drop(guard);

        link.flush().unwrap();
        assert_eq!(link.remaining_capacity(), 2);
    }
}
