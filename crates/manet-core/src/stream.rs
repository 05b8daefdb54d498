//! Lossy byte ring between a producer and a blocking consumer
//!
//! Byte-stream transports pump whatever the radio delivers into a
//! [`StreamRingBuffer`]; the link reader drains it. Writers never block: when
//! the consumer falls behind, the oldest unread bytes are overwritten and the
//! write reports overflow so the transport can raise a high-noise event.
//!
//! Cursors are absolute byte counts, so positions stay comparable across
//! wrap-around.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default gap between backlog and capacity that counts as overflowing
pub const DEFAULT_SLACK: usize = 2;

struct RingState {
    buf: Box<[u8]>,
    read_cursor: u64,
    write_cursor: u64,
    dropped: u64,
    closed: bool,
}

impl RingState {
    fn backlog(&self) -> usize {
        (self.write_cursor - self.read_cursor) as usize
    }

    /// Copy up to `out.len()` unread bytes and advance the read cursor
    fn take(&mut self, out: &mut [u8]) -> usize {
        let cap = self.buf.len();
        let n = out.len().min(self.backlog());
        let start = (self.read_cursor % cap as u64) as usize;
        let first = n.min(cap - start);
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        self.read_cursor += n as u64;
        n
    }
}

/// Bounded single-consumer byte ring with lossy writes
pub struct StreamRingBuffer {
    state: Mutex<RingState>,
    data_ready: Condvar,
    capacity: usize,
    slack: usize,
}

impl StreamRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_slack(capacity, DEFAULT_SLACK)
    }

    /// Ring of `capacity` bytes that reports overflow once the backlog is
    /// within `slack` bytes of full
    pub fn with_slack(capacity: usize, slack: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read_cursor: 0,
                write_cursor: 0,
                dropped: 0,
                closed: false,
            }),
            data_ready: Condvar::new(),
            capacity,
            slack: slack.min(capacity),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append bytes, overwriting the oldest unread data if needed.
    /// Returns true when the ring is overflowing after the write.
    pub fn write(&self, data: &[u8]) -> bool {
        let mut st = self.lock();
        if st.closed || data.is_empty() {
            return self.overflowing(st.backlog());
        }

        let cap = self.capacity;
        let keep = &data[data.len().saturating_sub(cap)..];
        st.write_cursor += (data.len() - keep.len()) as u64;

        let start = (st.write_cursor % cap as u64) as usize;
        let first = keep.len().min(cap - start);
        st.buf[start..start + first].copy_from_slice(&keep[..first]);
        st.buf[..keep.len() - first].copy_from_slice(&keep[first..]);
        st.write_cursor += keep.len() as u64;

        let backlog = st.backlog();
        if backlog > cap {
            let lost = (backlog - cap) as u64;
            st.dropped += lost;
            st.read_cursor += lost;
        }
        let overflowing = self.overflowing(st.backlog());
        drop(st);
        self.data_ready.notify_all();
        overflowing
    }

    /// Read into `out`. Blocks until at least one byte is available, or
    /// until `out` is full when `exact` is set. Returns fewer bytes only
    /// once the ring is closed and drained.
    pub fn read(&self, out: &mut [u8], exact: bool) -> usize {
        self.read_until(out, exact, None)
    }

    /// Like [`read`](Self::read) but gives up after `timeout`, returning
    /// whatever was collected.
    pub fn read_timeout(&self, out: &mut [u8], exact: bool, timeout: Duration) -> usize {
        self.read_until(out, exact, Some(Instant::now() + timeout))
    }

    fn read_until(&self, out: &mut [u8], exact: bool, deadline: Option<Instant>) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut filled = 0;
        let mut st = self.lock();
        loop {
            filled += st.take(&mut out[filled..]);
            let satisfied = if exact { filled == out.len() } else { filled > 0 };
            if satisfied || st.closed {
                return filled;
            }
            st = match deadline {
                None => self
                    .data_ready
                    .wait(st)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return filled;
                    }
                    self.data_ready
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Reposition the read cursor to absolute `offset` and read. The offset
    /// is clamped to the retained window and never passes the write cursor.
    pub fn read_at(&self, offset: u64, out: &mut [u8]) -> usize {
        {
            let mut st = self.lock();
            let oldest = st.write_cursor.saturating_sub(self.capacity as u64);
            st.read_cursor = offset.clamp(oldest, st.write_cursor);
        }
        self.read(out, false)
    }

    /// Absolute position of the next byte to read
    pub fn read_position(&self) -> u64 {
        self.lock().read_cursor
    }

    /// Absolute position of the next byte to write
    pub fn write_position(&self) -> u64 {
        self.lock().write_cursor
    }

    /// Unread bytes
    pub fn backlog(&self) -> usize {
        self.lock().backlog()
    }

    /// True once the backlog reaches capacity minus slack
    pub fn is_overflowing(&self) -> bool {
        self.overflowing(self.backlog())
    }

    fn overflowing(&self, backlog: usize) -> bool {
        backlog >= self.capacity - self.slack
    }

    /// Bytes overwritten before they were read
    pub fn dropped_bytes(&self) -> u64 {
        self.lock().dropped
    }

    /// Discard unread data
    pub fn clear(&self) {
        let mut st = self.lock();
        st.read_cursor = st.write_cursor;
    }

    /// Stop accepting writes and wake blocked readers
    pub fn close(&self) {
        self.lock().closed = true;
        self.data_ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl fmt::Debug for StreamRingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("StreamRingBuffer")
            .field("capacity", &self.capacity)
            .field("backlog", &state.backlog())
            .field("dropped", &state.dropped)
            .field("closed", &state.closed)
            .finish()
    }
}

/// `io::Read` view of a shared ring
///
/// With a timeout, an empty read surfaces as `ErrorKind::TimedOut` so the
/// caller can check its stop flag; a closed, drained ring reads as EOF.
pub struct RingReader {
    ring: Arc<StreamRingBuffer>,
    timeout: Option<Duration>,
}

impl RingReader {
    pub fn new(ring: Arc<StreamRingBuffer>, timeout: Option<Duration>) -> Self {
        Self { ring, timeout }
    }
}

impl Read for RingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = match self.timeout {
            Some(t) => self.ring.read_timeout(buf, false, t),
            None => self.ring.read(buf, false),
        };
        if n == 0 && !self.ring.is_closed() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "ring read timed out"));
        }
        Ok(n)
    }
}

/// `io::Write` view of a shared ring
pub struct RingWriter {
    ring: Arc<StreamRingBuffer>,
}

impl RingWriter {
    pub fn new(ring: Arc<StreamRingBuffer>) -> Self {
        Self { ring }
    }
}

impl Write for RingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.ring.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "ring closed"));
        }
        self.ring.write(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_write_then_read() {
        let ring = StreamRingBuffer::new(16);
        assert!(!ring.write(b"abcd"));
        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out, false), 4);
        assert_eq!(&out[..4], b"abcd");
        assert_eq!(ring.backlog(), 0);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let ring = StreamRingBuffer::new(8);
        let mut out = [0u8; 6];
        ring.write(b"123456");
        assert_eq!(ring.read(&mut out, true), 6);
        ring.write(b"789abc");
        assert_eq!(ring.read(&mut out, true), 6);
        assert_eq!(&out, b"789abc");
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let ring = StreamRingBuffer::new(8);
        ring.write(b"0123");
        assert!(ring.write(b"456789"));
        assert_eq!(ring.backlog(), 8);
        assert_eq!(ring.dropped_bytes(), 2);
        let mut out = [0u8; 8];
        ring.read(&mut out, true);
        assert_eq!(&out, b"23456789");
    }

    #[test]
    fn test_debug_reports_backlog() {
        let ring = StreamRingBuffer::new(8);
        ring.write(b"abc");
        let shown = format!("{:?}", ring);
        assert!(shown.contains("backlog: 3"));
        assert!(shown.contains("closed: false"));
    }

    #[test]
    fn test_oversized_write_keeps_tail() {
        let ring = StreamRingBuffer::new(4);
        ring.write(b"abcdefgh");
        assert_eq!(ring.write_position(), 8);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out, true), 4);
        assert_eq!(&out, b"efgh");
    }

    #[test]
    fn test_overflow_threshold_uses_slack() {
        let ring = StreamRingBuffer::with_slack(10, 2);
        assert!(!ring.write(&[0; 7]));
        assert!(ring.write(&[0; 1]));
        assert!(ring.is_overflowing());
    }

    #[test]
    fn test_exact_read_blocks_for_producer() {
        let ring = Arc::new(StreamRingBuffer::new(64));
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for chunk in [&b"he"[..], b"ll", b"o!"] {
                    thread::sleep(Duration::from_millis(5));
                    ring.write(chunk);
                }
            })
        };
        let mut out = [0u8; 6];
        assert_eq!(ring.read(&mut out, true), 6);
        assert_eq!(&out, b"hello!");
        producer.join().unwrap();
    }

    #[test]
    fn test_close_wakes_reader() {
        let ring = Arc::new(StreamRingBuffer::new(8));
        let reader = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut out = [0u8; 4];
                ring.read(&mut out, true)
            })
        };
        thread::sleep(Duration::from_millis(10));
        ring.close();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn test_read_timeout_returns_partial() {
        let ring = StreamRingBuffer::new(8);
        ring.write(b"ab");
        let mut out = [0u8; 4];
        assert_eq!(ring.read_timeout(&mut out, true, Duration::from_millis(10)), 2);
    }

    #[test]
    fn test_read_at_clamps() {
        let ring = StreamRingBuffer::new(4);
        ring.write(b"abcdef");
        let mut out = [0u8; 4];
        // Position 0 has been overwritten; clamps to the oldest retained byte
        assert_eq!(ring.read_at(0, &mut out), 4);
        assert_eq!(&out, b"cdef");
        // Replay the last two bytes
        assert_eq!(ring.read_at(4, &mut out), 2);
        assert_eq!(&out[..2], b"ef");
        assert_eq!(ring.read_position(), 6);
    }

    #[test]
    fn test_ring_reader_times_out_then_eof() {
        let ring = Arc::new(StreamRingBuffer::new(8));
        let mut reader = RingReader::new(ring.clone(), Some(Duration::from_millis(5)));
        let mut buf = [0u8; 2];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        ring.close();
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_ring_writer_refuses_after_close() {
        let ring = Arc::new(StreamRingBuffer::new(8));
        let mut writer = RingWriter::new(ring.clone());
        writer.write_all(b"ok").unwrap();
        ring.close();
        assert!(writer.write(b"x").is_err());
    }
}
