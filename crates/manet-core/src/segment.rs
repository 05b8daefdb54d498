//! Segmentation and reassembly
//!
//! Packets whose body would not fit in one MTU are encoded whole and the
//! encoded bytes are split into [`SegmentFragment`] packets. Receivers
//! collect fragments per `(origin, sequence_id)` and hand back the original
//! encoded packet once every index has arrived, in any order.
//!
//! ```text
//!  encoded packet ──► ┌────────┬────────┬─────┬────────┐
//!                     │ frag 0 │ frag 1 │ ... │ frag N │   chunk = MTU - 18 - 12
//!                     └────────┴────────┴─────┴────────┘
//! ```

use crate::error::SegmentError;
use crate::packet::{
    NodeAddress, Packet, PacketBody, SegmentFragment, FRAGMENT_OVERHEAD, HEADER_SIZE,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on fragments in one sequence, also enforced on receipt
pub const MAX_FRAGMENTS: usize = 65_536;

/// True when a body of `payload_size` bytes must be segmented for `mtu`
pub fn should_segment(payload_size: usize, mtu: usize) -> bool {
    payload_size > mtu.saturating_sub(HEADER_SIZE)
}

/// Data bytes carried by each fragment at this MTU
pub fn chunk_size(mtu: usize) -> Result<usize, SegmentError> {
    match mtu.checked_sub(HEADER_SIZE + FRAGMENT_OVERHEAD) {
        Some(chunk) if chunk > 0 => Ok(chunk),
        _ => Err(SegmentError::MtuTooSmall {
            mtu,
            minimum: HEADER_SIZE + FRAGMENT_OVERHEAD + 1,
        }),
    }
}

/// Number of fragments needed for `len` encoded bytes
pub fn fragment_count(len: usize, mtu: usize) -> Result<usize, SegmentError> {
    let chunk = chunk_size(mtu)?;
    Ok(len.div_ceil(chunk).max(1))
}

struct Reassembly {
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    started: Instant,
}

impl Reassembly {
    fn new(count: usize, now: Instant) -> Self {
        Self {
            fragments: vec![None; count],
            received: 0,
            started: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.fragments.len()
    }

    fn assemble(self) -> Vec<u8> {
        let total = self.fragments.iter().flatten().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for piece in self.fragments.into_iter().flatten() {
            out.extend_from_slice(&piece);
        }
        out
    }
}

/// Splits outbound packets and reassembles inbound fragments
pub struct SegmentEngine {
    origin: NodeAddress,
    next_sequence: AtomicU32,
    timeout: Duration,
    pending: Mutex<HashMap<(NodeAddress, u32), Reassembly>>,
}

impl SegmentEngine {
    /// Engine for a node; incomplete sequences expire after `timeout`
    pub fn new(origin: NodeAddress, timeout: Duration) -> Self {
        Self {
            origin,
            next_sequence: AtomicU32::new(rand::random()),
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending_table(&self) -> MutexGuard<'_, HashMap<(NodeAddress, u32), Reassembly>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Split an encoded packet into fragments addressed to `destination`
    pub fn segment(
        &self,
        encoded: &[u8],
        mtu: usize,
        destination: NodeAddress,
        timestamp: i64,
    ) -> Result<Vec<Packet>, SegmentError> {
        let chunk = chunk_size(mtu)?;
        let count = fragment_count(encoded.len(), mtu)?;
        if count > MAX_FRAGMENTS {
            return Err(SegmentError::TooManyFragments {
                count,
                limit: MAX_FRAGMENTS,
            });
        }

        let sequence_id = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Segmenting {} bytes into {} fragments (seq {}, chunk {})",
            encoded.len(),
            count,
            sequence_id,
            chunk
        );

        let fragments = (0..count)
            .map(|index| {
                let start = (index * chunk).min(encoded.len());
                let end = (start + chunk).min(encoded.len());
                let fragment = SegmentFragment {
                    sequence_id,
                    fragment_index: index as u32,
                    fragment_count: count as u32,
                    data: encoded[start..end].to_vec(),
                };
                Packet::new(
                    self.origin,
                    destination,
                    timestamp,
                    PacketBody::SegmentFragment(fragment),
                )
            })
            .collect();
        Ok(fragments)
    }

    /// Record a fragment from `origin`. Returns the reassembled encoded
    /// packet when this fragment completes its sequence.
    pub fn on_fragment_received(
        &self,
        origin: NodeAddress,
        fragment: SegmentFragment,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let count = fragment.fragment_count as usize;
        let index = fragment.fragment_index as usize;
        if count == 0 || count > MAX_FRAGMENTS || index >= count {
            warn!(
                "Dropping fragment {}/{} of seq {} from {}: out of range",
                index, count, fragment.sequence_id, origin
            );
            return None;
        }

        let key = (origin, fragment.sequence_id);
        let mut table = self.pending_table();
        let entry = table
            .entry(key)
            .or_insert_with(|| Reassembly::new(count, now));

        if entry.fragments.len() != count {
            warn!(
                "Dropping fragment of seq {} from {}: count {} disagrees with {}",
                fragment.sequence_id,
                origin,
                count,
                entry.fragments.len()
            );
            return None;
        }

        let slot = &mut entry.fragments[index];
        if slot.is_none() {
            entry.received += 1;
        }
        *slot = Some(fragment.data);

        if !entry.is_complete() {
            return None;
        }
        let done = table.remove(&key)?;
        debug!("Reassembled seq {} from {}", key.1, origin);
        Some(done.assemble())
    }

    /// Discard sequences older than the timeout. Returns how many expired.
    pub fn collect_garbage(&self, now: Instant) -> usize {
        let mut table = self.pending_table();
        let before = table.len();
        table.retain(|(origin, seq), entry| {
            let keep = now.saturating_duration_since(entry.started) < self.timeout;
            if !keep {
                debug!(
                    "Expiring seq {} from {} with {}/{} fragments",
                    seq,
                    origin,
                    entry.received,
                    entry.fragments.len()
                );
            }
            keep
        });
        before - table.len()
    }

    /// Sequences currently awaiting fragments
    pub fn pending(&self) -> usize {
        self.pending_table().len()
    }
}
