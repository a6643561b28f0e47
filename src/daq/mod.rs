//! DAQ descriptor store (dynamic allocation of DAQ lists, ODTs and
//! ODT entries out of a bounded arena) and the event-trigger sampler.

pub mod event;
pub mod sampler;

use parking_lot::Mutex;

pub use sampler::trigger_event;

/// Maximum ODT count when the overrun-by-PID indication is disabled;
/// the high bit of the one-byte PID is reserved when it's active, so
/// the usable range halves (see [`DescriptorStore::new`]).
pub const MAX_ODT_NO_OVERRUN_PID: usize = 0xFB;
pub const MAX_ODT_WITH_OVERRUN_PID: usize = 0x7B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqError {
    Sequence,
    Overflow,
    OutOfRange,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct DaqListFlags: u8 {
        const SELECTED  = 0x01;
        const DIRECTION = 0x02; // set = STIM, clear = DAQ
        const TIMESTAMP = 0x04;
        const NO_PID    = 0x08;
        const RUNNING   = 0x10;
        const OVERRUN   = 0x20;
    }
}

struct DaqListRecord {
    first_odt: u16,
    odt_count: u16,
    flags: DaqListFlags,
    event_channel: u16,
    prescaler: u16,
    prescaler_counter: u16,
    priority: u8,
}

#[derive(Clone, Copy)]
struct OdtRecord {
    first_entry: u32,
    entry_count: u8,
}

#[derive(Clone, Copy, Default)]
struct EntryRecord {
    addr: u32,
    size: u8,
    ext: u8,
}

#[derive(Clone)]
pub struct EventMeta {
    pub name: String,
    pub cycle: u16,
    pub unit_exponent: i8,
    pub priority: u8,
    pub sample_count: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessorInfo {
    pub max_daq: u16,
    pub max_event: u16,
}

#[derive(Clone, Copy)]
struct DaqPtr {
    daq: u16,
    odt: u16,
    entry_idx: u8,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum AllocStage {
    Cleared,
    DaqAllocated,
    OdtAllocated,
    EntriesAllocated,
}

struct Inner {
    daq_lists: Vec<DaqListRecord>,
    odts: Vec<OdtRecord>,
    entries: Vec<EntryRecord>,
    events: Vec<EventMeta>,
    stage: AllocStage,
    daq_ptr: Option<DaqPtr>,
    arena_bytes_used: usize,
}

const DAQ_LIST_RECORD_SIZE: usize = std::mem::size_of::<u16>() * 4 + 4;
const ODT_RECORD_SIZE: usize = std::mem::size_of::<u32>() + 1;
const ENTRY_RECORD_SIZE: usize = std::mem::size_of::<u32>() + 2;

/// Bump-allocated store for DAQ lists/ODTs/ODT entries, plus the
/// static event table. Allocation only ever grows within one arena
/// "generation"; `free_all` resets everything (FREE_DAQ).
pub struct DescriptorStore {
    inner: Mutex<Inner>,
    arena_bytes: usize,
    max_odts: usize,
}

impl DescriptorStore {
    pub fn new(arena_bytes: usize, _max_odts: u16, _max_events: usize) -> Self {
        DescriptorStore {
            inner: Mutex::new(Inner {
                daq_lists: Vec::new(),
                odts: Vec::new(),
                entries: Vec::new(),
                events: Vec::new(),
                stage: AllocStage::Cleared,
                daq_ptr: None,
                arena_bytes_used: 0,
            }),
            arena_bytes,
            max_odts: MAX_ODT_NO_OVERRUN_PID,
        }
    }

    pub fn register_event(&self, name: impl Into<String>, cycle: u16, unit_exponent: i8, priority: u8) -> u16 {
        let mut inner = self.inner.lock();
        let id = inner.events.len() as u16;
        inner.events.push(EventMeta { name: name.into(), cycle, unit_exponent, priority, sample_count: 1 });
        id
    }

    pub fn event_info(&self, event: u16) -> Option<EventMeta> {
        self.inner.lock().events.get(event as usize).cloned()
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn free_all(&self) {
        let mut inner = self.inner.lock();
        inner.daq_lists.clear();
        inner.odts.clear();
        inner.entries.clear();
        inner.stage = AllocStage::Cleared;
        inner.daq_ptr = None;
        inner.arena_bytes_used = 0;
    }

    pub fn allocated_daq_count(&self) -> usize {
        self.inner.lock().daq_lists.len()
    }

    pub fn processor_info(&self) -> ProcessorInfo {
        let inner = self.inner.lock();
        ProcessorInfo { max_daq: u16::MAX, max_event: inner.events.len().max(1) as u16 }
    }

    pub fn alloc_daq(&self, n: u16) -> Result<(), DaqError> {
        let mut inner = self.inner.lock();
        if inner.stage != AllocStage::Cleared && !inner.daq_lists.is_empty() {
            return Err(DaqError::Sequence);
        }
        inner.stage = AllocStage::DaqAllocated;
        for _ in 0..n {
            inner.daq_lists.push(DaqListRecord {
                first_odt: 0,
                odt_count: 0,
                flags: DaqListFlags::empty(),
                event_channel: 0,
                prescaler: 1,
                prescaler_counter: 1,
                priority: 0,
            });
        }
        inner.arena_bytes_used += n as usize * DAQ_LIST_RECORD_SIZE;
        if inner.arena_bytes_used > self.arena_bytes {
            return Err(DaqError::Overflow);
        }
        Ok(())
    }

    pub fn alloc_odt(&self, daq: u16, n: u8) -> Result<(), DaqError> {
        let mut inner = self.inner.lock();
        if inner.stage == AllocStage::Cleared || inner.stage == AllocStage::EntriesAllocated {
            return Err(DaqError::Sequence);
        }
        inner.stage = AllocStage::OdtAllocated;
        let daq_idx = daq as usize;
        if daq_idx >= inner.daq_lists.len() {
            return Err(DaqError::OutOfRange);
        }
        if inner.odts.len() + n as usize > self.max_odts {
            return Err(DaqError::Overflow);
        }
        let first_odt = inner.odts.len() as u16;
        for _ in 0..n {
            inner.odts.push(OdtRecord { first_entry: 0, entry_count: 0 });
        }
        let rec = &mut inner.daq_lists[daq_idx];
        if rec.odt_count == 0 {
            rec.first_odt = first_odt;
        }
        rec.odt_count += n as u16;
        inner.arena_bytes_used += n as usize * ODT_RECORD_SIZE;
        if inner.arena_bytes_used > self.arena_bytes {
            return Err(DaqError::Overflow);
        }
        Ok(())
    }

    pub fn alloc_odt_entry(&self, daq: u16, odt: u8, n: u8) -> Result<(), DaqError> {
        let mut inner = self.inner.lock();
        if inner.stage != AllocStage::OdtAllocated && inner.stage != AllocStage::EntriesAllocated {
            return Err(DaqError::Sequence);
        }
        inner.stage = AllocStage::EntriesAllocated;
        let daq_idx = daq as usize;
        let rec = inner.daq_lists.get(daq_idx).copied_meta().ok_or(DaqError::OutOfRange)?;
        let odt_idx = rec.first_odt as usize + odt as usize;
        if odt_idx >= inner.odts.len() {
            return Err(DaqError::OutOfRange);
        }
        let first_entry = inner.entries.len() as u32;
        if (inner.entries.len() + n as usize) > u16::MAX as usize {
            return Err(DaqError::Overflow);
        }
        for _ in 0..n {
            inner.entries.push(EntryRecord::default());
        }
        inner.odts[odt_idx] = OdtRecord { first_entry, entry_count: n };
        inner.arena_bytes_used += n as usize * ENTRY_RECORD_SIZE;
        if inner.arena_bytes_used > self.arena_bytes {
            return Err(DaqError::Overflow);
        }
        Ok(())
    }

    pub fn set_daq_ptr(&self, daq: u16, odt: u8, idx: u8) -> Result<(), DaqError> {
        let mut inner = self.inner.lock();
        if (daq as usize) >= inner.daq_lists.len() {
            return Err(DaqError::OutOfRange);
        }
        inner.daq_ptr = Some(DaqPtr { daq, odt: odt as u16, entry_idx: idx });
        Ok(())
    }

    pub fn write_daq(&self, _bit_offset: u8, size: u8, ext: u8, addr: u32) -> Result<(), DaqError> {
        let mut inner = self.inner.lock();
        let ptr = inner.daq_ptr.ok_or(DaqError::Sequence)?;
        let daq_idx = ptr.daq as usize;
        let rec = inner.daq_lists.get(daq_idx).copied_meta().ok_or(DaqError::OutOfRange)?;
        let odt_idx = rec.first_odt as usize + ptr.odt as usize;
        let odt = *inner.odts.get(odt_idx).ok_or(DaqError::OutOfRange)?;
        if ptr.entry_idx as usize >= odt.entry_count as usize {
            return Err(DaqError::Overflow);
        }
        let entry_idx = odt.first_entry as usize + ptr.entry_idx as usize;
        inner.entries[entry_idx] = EntryRecord { addr, size, ext };
        if let Some(p) = inner.daq_ptr.as_mut() {
            p.entry_idx += 1;
        }
        Ok(())
    }

    pub fn set_daq_list_mode(&self, daq: u16, mode: u8, event: u16, prescaler: u16) -> Result<(), DaqError> {
        let mut inner = self.inner.lock();
        let rec = inner.daq_lists.get_mut(daq as usize).ok_or(DaqError::OutOfRange)?;
        rec.event_channel = event;
        rec.prescaler = prescaler.max(1);
        rec.prescaler_counter = rec.prescaler;
        rec.flags.set(DaqListFlags::TIMESTAMP, mode & 0x01 != 0);
        rec.flags.set(DaqListFlags::DIRECTION, mode & 0x02 != 0);
        rec.flags.set(DaqListFlags::NO_PID, mode & 0x04 != 0);
        Ok(())
    }

    pub fn daq_list_mode(&self, daq: u16) -> Option<(u8, u16, u16, u8)> {
        let inner = self.inner.lock();
        let rec = inner.daq_lists.get(daq as usize)?;
        let mut mode = 0u8;
        if rec.flags.contains(DaqListFlags::TIMESTAMP) {
            mode |= 0x01;
        }
        if rec.flags.contains(DaqListFlags::DIRECTION) {
            mode |= 0x02;
        }
        if rec.flags.contains(DaqListFlags::NO_PID) {
            mode |= 0x04;
        }
        Some((mode, rec.event_channel, rec.prescaler, rec.priority))
    }

    pub fn select_daq_list(&self, daq: u16) -> Result<(), DaqError> {
        let mut inner = self.inner.lock();
        let rec = inner.daq_lists.get_mut(daq as usize).ok_or(DaqError::OutOfRange)?;
        rec.flags.insert(DaqListFlags::SELECTED);
        Ok(())
    }

    pub fn start_daq_list(&self, daq: u16) -> Result<u8, DaqError> {
        let mut inner = self.inner.lock();
        let (first_odt, rec_exists) = {
            let rec = inner.daq_lists.get_mut(daq as usize).ok_or(DaqError::OutOfRange)?;
            rec.flags.insert(DaqListFlags::RUNNING);
            (rec.first_odt, true)
        };
        let _ = rec_exists;
        Ok(first_odt.min(u8::MAX as u16) as u8)
    }

    pub fn stop_daq_list(&self, daq: u16) -> Result<(), DaqError> {
        let mut inner = self.inner.lock();
        let rec = inner.daq_lists.get_mut(daq as usize).ok_or(DaqError::OutOfRange)?;
        rec.flags.remove(DaqListFlags::RUNNING);
        Ok(())
    }

    pub fn start_selected(&self) {
        let mut inner = self.inner.lock();
        for rec in inner.daq_lists.iter_mut() {
            if rec.flags.contains(DaqListFlags::SELECTED) {
                rec.flags.insert(DaqListFlags::RUNNING);
            }
        }
    }

    pub fn stop_selected(&self) {
        let mut inner = self.inner.lock();
        for rec in inner.daq_lists.iter_mut() {
            if rec.flags.contains(DaqListFlags::SELECTED) {
                rec.flags.remove(DaqListFlags::RUNNING | DaqListFlags::SELECTED);
            }
        }
    }

    pub fn stop_all(&self) {
        let mut inner = self.inner.lock();
        for rec in inner.daq_lists.iter_mut() {
            rec.flags.remove(DaqListFlags::RUNNING | DaqListFlags::SELECTED);
        }
    }

    pub fn is_overrun(&self, daq: u16) -> bool {
        self.inner.lock().daq_lists.get(daq as usize).map(|r| r.flags.contains(DaqListFlags::OVERRUN)).unwrap_or(false)
    }

    pub(crate) fn with_running_lists_for_event<F: FnMut(u16, &mut DaqListSnapshot)>(&self, event: u16, mut f: F) {
        // Snapshot every matching list first and release the lock before
        // calling `f`: `f` (the sampler) calls back into `odt_entries`,
        // which takes this same `inner` mutex, and `parking_lot::Mutex`
        // is not reentrant — holding the guard across `f` would deadlock
        // the calling thread on its own lock.
        let mut snapshots = Vec::new();
        {
            let mut inner = self.inner.lock();
            for idx in 0..inner.daq_lists.len() {
                let matches = {
                    let rec = &inner.daq_lists[idx];
                    rec.flags.contains(DaqListFlags::RUNNING) && rec.event_channel == event
                };
                if !matches {
                    continue;
                }
                let should_sample = {
                    let rec = &mut inner.daq_lists[idx];
                    if rec.prescaler > 1 {
                        rec.prescaler_counter = rec.prescaler_counter.saturating_sub(1);
                        if rec.prescaler_counter == 0 {
                            rec.prescaler_counter = rec.prescaler;
                            true
                        } else {
                            false
                        }
                    } else {
                        true
                    }
                };
                if !should_sample {
                    continue;
                }
                let (first_odt, odt_count, timestamp, pending_overrun) = {
                    let rec = &inner.daq_lists[idx];
                    (rec.first_odt, rec.odt_count, rec.flags.contains(DaqListFlags::TIMESTAMP), rec.flags.contains(DaqListFlags::OVERRUN))
                };
                // `overrun` carries the sticky bit-7 mark across calls: set
                // here means "the next successfully sent ODT of this list
                // must carry it"; the sampler clears it once it has, so it
                // only leaves this snapshot true if nothing could be sent
                // this cycle to carry it, or a fresh overrun happened.
                snapshots.push(DaqListSnapshot { daq: idx as u16, first_odt, odt_count, timestamp, overrun: pending_overrun });
            }
        }

        for snap in &mut snapshots {
            f(snap.daq, snap);
        }

        let mut inner = self.inner.lock();
        for snap in &snapshots {
            if let Some(rec) = inner.daq_lists.get_mut(snap.daq as usize) {
                if snap.overrun {
                    rec.flags.insert(DaqListFlags::OVERRUN);
                } else {
                    rec.flags.remove(DaqListFlags::OVERRUN);
                }
            }
        }
    }

    pub(crate) fn odt_entries(&self, global_odt: u16) -> Vec<(u8, u32, u8)> {
        let inner = self.inner.lock();
        let odt = match inner.odts.get(global_odt as usize) {
            Some(o) => *o,
            None => return Vec::new(),
        };
        (0..odt.entry_count)
            .map(|i| {
                let e = inner.entries[odt.first_entry as usize + i as usize];
                (e.ext, e.addr, e.size)
            })
            .collect()
    }
}

pub(crate) struct DaqListSnapshot {
    pub daq: u16,
    pub first_odt: u16,
    pub odt_count: u16,
    pub timestamp: bool,
    pub overrun: bool,
}

trait OptionRecordExt {
    fn copied_meta(self) -> Option<DaqListMeta>;
}

#[derive(Clone, Copy)]
struct DaqListMeta {
    first_odt: u16,
}

impl<'a> OptionRecordExt for Option<&'a DaqListRecord> {
    fn copied_meta(self) -> Option<DaqListMeta> {
        self.map(|r| DaqListMeta { first_odt: r.first_odt })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_sequence_enforced() {
        let store = DescriptorStore::new(16 * 1024, 256, 16);
        assert_eq!(store.alloc_odt(0, 1), Err(DaqError::Sequence));
        store.alloc_daq(1).unwrap();
        store.alloc_odt(0, 1).unwrap();
        store.alloc_odt_entry(0, 0, 1).unwrap();
        assert_eq!(store.alloc_daq(1), Err(DaqError::Sequence));
    }

    #[test]
    fn write_daq_and_trigger_roundtrip() {
        let store = DescriptorStore::new(16 * 1024, 256, 16);
        store.register_event("e0", 0, 0, 0);
        store.alloc_daq(1).unwrap();
        store.alloc_odt(0, 1).unwrap();
        store.alloc_odt_entry(0, 0, 1).unwrap();
        store.set_daq_ptr(0, 0, 0).unwrap();
        store.write_daq(0, 4, 0, 0x2000).unwrap();
        store.set_daq_list_mode(0, 0x01, 0, 1).unwrap();
        let pid = store.start_daq_list(0).unwrap();
        assert_eq!(pid, 0);
        let entries = store.odt_entries(0);
        assert_eq!(entries, vec![(0, 0x2000, 4)]);
    }

    #[test]
    fn free_daq_resets_sequence() {
        let store = DescriptorStore::new(16 * 1024, 256, 16);
        store.alloc_daq(1).unwrap();
        store.free_all();
        store.alloc_daq(2).unwrap();
        assert_eq!(store.allocated_daq_count(), 2);
    }
}
