//! The lock-free-ish segment queue: a bounded ring of transmit
//! segments filled by multiple producer threads (DAQ sampler,
//! protocol responses) and drained by a single transmit worker.
//!
//! Mirrors the teacher's choice of `parking_lot::Mutex` for the one
//! lock this module needs (the original `CalSeg::sync` lock, reused
//! here for the queue's cursor/length bookkeeping per the
//! single-mutex concurrency model).

use parking_lot::{Mutex, MutexGuard};

use super::{align_up, HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    /// `payload_len` alone (plus header) can never fit in a segment.
    TooLarge,
    /// The ring has no free segment left to advance into.
    QueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    Sent(usize),
    Empty,
    WouldBlock,
}

struct Segment {
    bytes: Vec<u8>,
    size: u16,
    uncommitted: u16,
}

impl Segment {
    fn new(capacity: u16) -> Self {
        Segment { bytes: vec![0u8; capacity as usize], size: 0, uncommitted: 0 }
    }

    fn reset(&mut self) {
        self.size = 0;
        self.uncommitted = 0;
    }
}

struct QueueState {
    segments: Vec<Segment>,
    /// Index of the segment currently being written into.
    write_idx: usize,
    /// Index of the oldest not-yet-drained segment.
    read_idx: usize,
    /// Number of segments currently holding data, write_idx included
    /// once it has any bytes.
    len: usize,
    /// Free-running message counter, shared across all segments in
    /// the queue's lifetime; wraps modulo 2^16.
    counter: u16,
}

pub struct TransmitQueue {
    state: Mutex<QueueState>,
    segment_size: u16,
    alignment: u8,
    capacity: usize,
}

impl TransmitQueue {
    pub fn new(capacity: usize, segment_size: u16, alignment: u8) -> Self {
        assert!(capacity >= 2, "queue_depth must be at least 2");
        let segments = (0..capacity).map(|_| Segment::new(segment_size)).collect();
        TransmitQueue {
            state: Mutex::new(QueueState { segments, write_idx: 0, read_idx: 0, len: 0, counter: 0 }),
            segment_size,
            alignment,
            capacity,
        }
    }

    /// Reserves room for a message of `payload_len` bytes, returning a
    /// handle the caller writes the payload into before calling
    /// [`TransmitSlot::commit`].
    pub fn reserve(&self, payload_len: usize) -> Result<TransmitSlot<'_>, ReserveError> {
        let aligned = align_up(payload_len, self.alignment);
        let msg_size = aligned + HEADER_SIZE;
        if msg_size > self.segment_size as usize {
            return Err(ReserveError::TooLarge);
        }

        let mut state = self.state.lock();

        let fits = {
            let seg = &state.segments[state.write_idx];
            seg.size as usize + msg_size <= self.segment_size as usize
        };
        if !fits {
            // Advance to a fresh ring slot.
            if state.len == self.capacity {
                return Err(ReserveError::QueueFull);
            }
            let next = (state.write_idx + 1) % self.capacity;
            state.segments[next].reset();
            state.write_idx = next;
            state.len += 1;
        } else if state.len == 0 {
            // First reservation ever: the write segment counts as occupied.
            state.len = 1;
        }

        let ctr = state.counter;
        state.counter = state.counter.wrapping_add(1);

        let write_idx = state.write_idx;
        let start = state.segments[write_idx].size as usize;
        {
            let seg = &mut state.segments[write_idx];
            let header_start = start;
            let payload_start = start + HEADER_SIZE;
            super::FrameHeader { len: payload_len as u16, ctr }.encode(&mut seg.bytes[header_start..header_start + HEADER_SIZE]);
            seg.size += msg_size as u16;
            seg.uncommitted += 1;
        }

        Ok(TransmitSlot { guard: state, seg_idx: write_idx, payload_start: start + HEADER_SIZE, payload_len })
    }

    /// Inspects the head segment and, if fully committed, hands its
    /// bytes to `send` (called outside the lock) and advances the
    /// read cursor on success.
    pub fn drain_one(&self, send: impl FnOnce(&[u8]) -> std::io::Result<()>) -> DrainResult {
        let (read_idx, size) = {
            let state = self.state.lock();
            if state.len == 0 {
                return DrainResult::Empty;
            }
            let seg = &state.segments[state.read_idx];
            if seg.uncommitted > 0 {
                return DrainResult::WouldBlock;
            }
            (state.read_idx, seg.size as usize)
        };

        // Copy bytes out before releasing correctness of the slice:
        // we re-lock only to read since no producer may mutate a
        // fully-committed segment. To avoid holding the lock across
        // the actual socket write we snapshot the bytes here.
        let bytes = {
            let state = self.state.lock();
            state.segments[read_idx].bytes[..size].to_vec()
        };

        if send(&bytes).is_err() {
            return DrainResult::WouldBlock;
        }

        let mut state = self.state.lock();
        if state.write_idx == read_idx {
            // No rotation has moved the write cursor off this segment
            // since it filled up (the common case for unflushed DAQ
            // samples) — reset it in place so the next reserve starts
            // clean instead of appending behind bytes already on the
            // wire. read_idx and write_idx stay together, now pointing
            // at one freshly-empty segment.
            state.segments[read_idx].reset();
        } else {
            state.read_idx = (state.read_idx + 1) % self.capacity;
        }
        state.len -= 1;
        DrainResult::Sent(size)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().len == 0
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    /// Forces the current write segment to stop accepting further
    /// appends, so a partially-filled segment doesn't wait indefinitely
    /// for more data before becoming drainable. Called by the transmit
    /// worker on an idle poll (no data to drain) so partial segments age
    /// out instead of stalling until the next reserve happens to fill
    /// them. A no-op if the write segment is still empty.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        let write_idx = state.write_idx;
        if state.segments[write_idx].size == 0 {
            return;
        }
        let capacity = state.segments.len();
        if state.len < capacity {
            let next = (write_idx + 1) % capacity;
            state.segments[next].reset();
            state.write_idx = next;
            state.len += 1;
        }
    }
}

/// A reserved, not-yet-committed slice of a transmit segment.
pub struct TransmitSlot<'q> {
    guard: MutexGuard<'q, QueueState>,
    seg_idx: usize,
    payload_start: usize,
    payload_len: usize,
}

impl<'q> TransmitSlot<'q> {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.payload_start;
        let end = start + self.payload_len;
        &mut self.guard.segments[self.seg_idx].bytes[start..end]
    }

    /// Marks the PID byte's bit 7 to signal an overrun on the next
    /// successful transmission, per the overrun-by-PID indication.
    pub fn mark_overrun_pid(&mut self) {
        if self.payload_len > 0 {
            self.payload_mut()[0] |= 0x80;
        }
    }

    /// Commits the slot. If `flush` is set and this segment is the
    /// queue's current write segment, advances the write cursor so
    /// the next producer starts a fresh segment — used to give
    /// command responses a low-latency path without a second
    /// non-queued send function (see the queued-vs-direct design
    /// decision).
    pub fn commit(mut self, flush: bool) {
        let seg_idx = self.seg_idx;
        self.guard.segments[seg_idx].uncommitted -= 1;
        if flush && self.guard.write_idx == seg_idx {
            let capacity = self.guard.segments.len();
            if self.guard.len < capacity {
                let next = (self.guard.write_idx + 1) % capacity;
                self.guard.segments[next].reset();
                self.guard.write_idx = next;
                self.guard.len += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_drain_round_trip() {
        let q = TransmitQueue::new(4, 64, 4);
        let mut slot = q.reserve(4).unwrap();
        slot.payload_mut().copy_from_slice(&[1, 2, 3, 4]);
        slot.commit(false);

        let mut seen = Vec::new();
        let res = q.drain_one(|bytes| {
            seen.extend_from_slice(bytes);
            Ok(())
        });
        assert!(matches!(res, DrainResult::Sent(_)));
        assert_eq!(&seen[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn uncommitted_segment_blocks_drain() {
        let q = TransmitQueue::new(4, 64, 4);
        let slot = q.reserve(4).unwrap();
        assert_eq!(q.drain_one(|_| Ok(())), DrainResult::WouldBlock);
        slot.commit(false);
        assert!(matches!(q.drain_one(|_| Ok(())), DrainResult::Sent(_)));
    }

    #[test]
    fn overflow_when_ring_exhausted() {
        let q = TransmitQueue::new(2, 16, 4);
        // Fill segment 0 fully (16 - 4 header = 12 usable, reserve 8 -> msg_size 12, fits once).
        let s0 = q.reserve(8).unwrap();
        s0.commit(false);
        // Doesn't fit in segment 0 anymore, advances to segment 1.
        let s1 = q.reserve(8).unwrap();
        s1.commit(false);
        // Ring exhausted (capacity 2, both occupied and not drained).
        assert_eq!(q.reserve(8).unwrap_err(), ReserveError::QueueFull);
    }

    #[test]
    fn too_large_payload_rejected() {
        let q = TransmitQueue::new(2, 16, 4);
        assert_eq!(q.reserve(64).unwrap_err(), ReserveError::TooLarge);
    }

    #[test]
    fn draining_the_live_write_segment_resets_it_in_place() {
        // A small, unflushed message (commit(false), as DAQ samples use)
        // leaves write_idx sitting on the same segment it just filled.
        // Draining that segment must not leave stale bytes behind for
        // the next reserve to append after.
        let q = TransmitQueue::new(2, 64, 4);
        let s0 = q.reserve(4).unwrap();
        s0.commit(false);
        assert!(matches!(q.drain_one(|_| Ok(())), DrainResult::Sent(_)));

        let mut s1 = q.reserve(4).unwrap();
        s1.payload_mut().copy_from_slice(&[9, 9, 9, 9]);
        s1.commit(false);

        let mut seen = Vec::new();
        let res = q.drain_one(|bytes| {
            seen.extend_from_slice(bytes);
            Ok(())
        });
        assert!(matches!(res, DrainResult::Sent(_)));
        assert_eq!(seen.len(), 8, "must contain exactly the new message, not the already-sent one too");
        assert_eq!(&seen[4..8], &[9, 9, 9, 9]);
    }

    #[test]
    fn flush_rotates_partial_segment_so_it_becomes_drainable() {
        // After one commit(false), write_idx still sits on the segment
        // that holds the data (the queue never auto-flushes unflushed
        // commits). Without a flush, drain_one still sees it because
        // uncommitted == 0 — the queue always drains the write segment
        // once it has no pending reservation. flush()'s job is to keep
        // segments from being reused out from under not-yet-drained
        // data when more messages keep landing in the same segment; it
        // must not panic or corrupt state when called on a normal,
        // already-drainable queue.
        let q = TransmitQueue::new(2, 64, 4);
        let mut s0 = q.reserve(4).unwrap();
        s0.payload_mut().copy_from_slice(&[7, 7, 7, 7]);
        s0.commit(false);

        q.flush();
        assert_eq!(q.len(), 2, "flush rotates to a fresh segment, occupying the second ring slot");

        let mut seen = Vec::new();
        let res = q.drain_one(|bytes| {
            seen.extend_from_slice(bytes);
            Ok(())
        });
        assert!(matches!(res, DrainResult::Sent(_)));
        assert_eq!(&seen[4..8], &[7, 7, 7, 7]);
    }

    #[test]
    fn flush_on_empty_queue_is_a_no_op() {
        let q = TransmitQueue::new(2, 64, 4);
        q.flush();
        assert_eq!(q.drain_one(|_| Ok(())), DrainResult::Empty);
    }

    #[test]
    fn counters_strictly_monotonic() {
        let q = TransmitQueue::new(8, 256, 4);
        let mut last = None;
        for i in 0..20u16 {
            let mut slot = q.reserve(4).unwrap();
            slot.payload_mut().copy_from_slice(&i.to_le_bytes().repeat(2)[..4].try_into().unwrap());
            slot.commit(false);
        }
        loop {
            let mut hdr_ctr = None;
            let res = q.drain_one(|bytes| {
                let mut off = 0;
                while off + 4 <= bytes.len() {
                    if let Some(h) = super::super::FrameHeader::decode(&bytes[off..]) {
                        hdr_ctr = Some(h.ctr);
                        off += 4 + h.len as usize;
                    } else {
                        break;
                    }
                }
                Ok(())
            });
            match res {
                DrainResult::Sent(_) => {
                    if let Some(ctr) = hdr_ctr {
                        if let Some(prev) = last {
                            assert!(ctr != prev);
                        }
                        last = Some(ctr);
                    }
                }
                DrainResult::Empty => break,
                DrainResult::WouldBlock => break,
            }
        }
    }
}
