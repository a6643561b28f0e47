//! The DAQ sampler: `trigger_event`, called by application code at a
//! measurement point. Walks every RUNNING DAQ list bound to the
//! event, reserves a segment-queue slot per ODT, copies sampled
//! bytes, and commits — all ODTs of one list form one consistent
//! sample, or the whole list is marked OVERRUN and the rest of its
//! ODTs for this trigger are skipped.

use crate::address::AddressSpace;
use crate::clock::Clock;
use crate::daq::DescriptorStore;
use crate::transport::queue::{ReserveError, TransmitQueue};

/// Samples every DAQ list bound to `event_id` into `queue`.
///
/// `base` is the event-relative base pointer for `addr_ext ==
/// XCP_ADDR_EXT_DYN` entries; pass `std::ptr::null()` for events with
/// no per-instance context (absolute addressing only).
pub fn trigger_event(daq: &DescriptorStore, addr_space: &dyn AddressSpace, clock: &Clock, queue: &TransmitQueue, event_id: u16, base: *const u8) {
    daq.with_running_lists_for_event(event_id, |_list_id, snapshot| {
        let mut timestamp_written = false;
        for rel_odt in 0..snapshot.odt_count {
            let global_odt = snapshot.first_odt + rel_odt;
            let entries = daq.odt_entries(global_odt);
            let payload_len = odt_payload_len(&entries, snapshot.timestamp && !timestamp_written);

            let mut slot = match queue.reserve(payload_len) {
                Ok(slot) => slot,
                Err(ReserveError::QueueFull) | Err(ReserveError::TooLarge) => {
                    snapshot.overrun = true;
                    break;
                }
            };

            let buf = slot.payload_mut();
            let mut off = 0;
            buf[off] = (global_odt & 0xFF) as u8; // PID = absolute ODT number
            off += 1;

            if snapshot.timestamp && !timestamp_written {
                let ts = (clock.now_ticks() as u32).to_le_bytes();
                buf[off..off + 4].copy_from_slice(&ts);
                off += 4;
                timestamp_written = true;
            }

            for (ext, addr, size) in &entries {
                let size = *size as usize;
                // SAFETY: resolve_with_base/resolve bounds-check against the region the entry names.
                let bytes = unsafe {
                    if base.is_null() {
                        addr_space.resolve(*ext, *addr, size)
                    } else {
                        addr_space.resolve_with_base(base, *addr, size)
                    }
                };
                match bytes {
                    Some(b) => {
                        buf[off..off + size].copy_from_slice(b);
                    }
                    None => {
                        buf[off..off + size].fill(0);
                    }
                }
                off += size;
            }

            if snapshot.overrun {
                slot.mark_overrun_pid();
                snapshot.overrun = false;
            }
            slot.commit(false);
        }
    });
}

fn odt_payload_len(entries: &[(u8, u32, u8)], with_timestamp: bool) -> usize {
    let data: usize = entries.iter().map(|(_, _, size)| *size as usize).sum();
    1 + if with_timestamp { 4 } else { 0 } + data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimestampUnit;

    struct FlatMem(parking_lot::Mutex<Vec<u8>>);
    impl AddressSpace for FlatMem {
        fn base(&self) -> *const u8 {
            std::ptr::null()
        }
        unsafe fn resolve(&self, _ext: u8, addr: u32, len: usize) -> Option<&[u8]> {
            let mem = self.0.lock();
            if (addr as usize) + len > mem.len() {
                return None;
            }
            Some(std::slice::from_raw_parts(mem.as_ptr().add(addr as usize), len))
        }
        unsafe fn resolve_mut(&self, _ext: u8, addr: u32, len: usize) -> Option<&mut [u8]> {
            let mut mem = self.0.lock();
            if (addr as usize) + len > mem.len() {
                return None;
            }
            Some(std::slice::from_raw_parts_mut(mem.as_mut_ptr().add(addr as usize), len))
        }
    }

    fn setup_one_list() -> (DescriptorStore, FlatMem, Clock, TransmitQueue) {
        let store = DescriptorStore::new(16 * 1024, 256, 16);
        store.register_event("e0", 0, 0, 0);
        store.alloc_daq(1).unwrap();
        store.alloc_odt(0, 1).unwrap();
        store.alloc_odt_entry(0, 0, 1).unwrap();
        store.set_daq_ptr(0, 0, 0).unwrap();
        store.write_daq(0, 4, 0, 0x10).unwrap();
        store.set_daq_list_mode(0, 0x01, 0, 1).unwrap();
        store.start_daq_list(0).unwrap();
        let mem = FlatMem(parking_lot::Mutex::new((0u8..64).collect()));
        let clock = Clock::new(TimestampUnit::Microseconds);
        let queue = TransmitQueue::new(8, 256, 4);
        (store, mem, clock, queue)
    }

    #[test]
    fn trigger_emits_one_packet_with_timestamp_and_data() {
        let (store, mem, clock, queue) = setup_one_list();
        trigger_event(&store, &mem, &clock, &queue, 0, std::ptr::null());

        let mut seen = Vec::new();
        let res = queue.drain_one(|bytes| {
            seen.extend_from_slice(bytes);
            Ok(())
        });
        assert!(matches!(res, super::super::super::transport::queue::DrainResult::Sent(_)));
        // header (4) + pid (1) + timestamp (4) + 4 bytes of data from addr 0x10
        assert_eq!(seen[4], 0); // PID = odt 0
        assert_eq!(&seen[9..13], &[0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn stopped_session_does_not_sample() {
        let (store, mem, clock, queue) = setup_one_list();
        store.stop_daq_list(0).unwrap();
        trigger_event(&store, &mem, &clock, &queue, 0, std::ptr::null());
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_full_sets_overrun_then_marks_next_successful_odt() {
        let store = DescriptorStore::new(16 * 1024, 256, 16);
        store.register_event("e0", 0, 0, 0);
        store.alloc_daq(1).unwrap();
        store.alloc_odt(0, 1).unwrap();
        store.alloc_odt_entry(0, 0, 1).unwrap();
        store.set_daq_ptr(0, 0, 0).unwrap();
        store.write_daq(0, 4, 0, 0x10).unwrap();
        store.set_daq_list_mode(0, 0x01, 0, 1).unwrap();
        store.start_daq_list(0).unwrap();
        let mem = FlatMem(parking_lot::Mutex::new((0u8..64).collect()));
        let clock = Clock::new(TimestampUnit::Microseconds);
        // Each sample is pid(1) + timestamp(4) + data(4) = 9 bytes, 13 with
        // the frame header; a 16-byte segment holds exactly one, so two
        // triggers fill both ring slots and a third hits QueueFull.
        let queue = TransmitQueue::new(2, 16, 1);

        trigger_event(&store, &mem, &clock, &queue, 0, std::ptr::null());
        trigger_event(&store, &mem, &clock, &queue, 0, std::ptr::null());
        assert!(!store.is_overrun(0));
        trigger_event(&store, &mem, &clock, &queue, 0, std::ptr::null());
        assert!(store.is_overrun(0), "third trigger under queue pressure must set OVERRUN");

        // Resume the transmit worker: drain what's already queued.
        for _ in 0..2 {
            let res = queue.drain_one(|_| Ok(()));
            assert!(matches!(res, super::super::super::transport::queue::DrainResult::Sent(_)));
        }
        assert!(store.is_overrun(0), "flag stays pending until a fresh sample can carry the mark");

        trigger_event(&store, &mem, &clock, &queue, 0, std::ptr::null());
        let mut seen = Vec::new();
        let res = queue.drain_one(|bytes| {
            seen.extend_from_slice(bytes);
            Ok(())
        });
        assert!(matches!(res, super::super::super::transport::queue::DrainResult::Sent(_)));
        assert_eq!(seen[4] & 0x80, 0x80, "the first ODT sent after an overrun carries bit 7");
        assert!(!store.is_overrun(0), "the mark clears the pending flag");
    }
}
