//! Double-buffered calibration segments.
//!
//! Grounded almost directly on the teacher's `cal/cal_seg.rs`: two
//! pages per segment — an `ecu_page` the application reads directly
//! (the RAM "working page") and an `xcp_page` the protocol dispatcher
//! writes through SET_CAL_PAGE/DOWNLOAD (the "reference"/FLASH page
//! when the active page selector points at it). `sync()` copies the
//! XCP page into the ECU page; call it once per application cycle
//! (e.g. at the top of a task) to pick up master-written changes
//! without tearing a read mid-update.
//!
//! `CalSeg<T>` intentionally isn't `Sync`: the ECU page is meant to be
//! read only from the single application thread that owns the
//! segment, same as the teacher's original.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::PageSetStatus;
use crate::registry::CalSegMeta;
use crate::xcp::Xcp;

/// Marker for types usable as a calibration segment's payload: must
/// be `Copy` (pages are byte-for-byte swapped) and `'static` (the
/// segment outlives the function that created it, held by the `Xcp`
/// singleton).
pub trait CalPageField: Copy + Send + 'static {}
impl<T: Copy + Send + 'static> CalPageField for T {}

/// A calibration segment: a named, addressable, double-buffered
/// instance of `T`.
pub struct CalSeg<T: CalPageField> {
    name: &'static str,
    index: u8,
    ecu_page: Box<UnsafeCell<T>>,
    xcp_page: Arc<Mutex<T>>,
    _not_sync: PhantomData<*mut ()>,
}

// SAFETY: `ecu_page` is only ever dereferenced from the thread that
// owns the `CalSeg`; sending the segment across threads is fine, just
// not sharing `&CalSeg` across threads (hence no `Sync`).
unsafe impl<T: CalPageField> Send for CalSeg<T> {}

impl<T: CalPageField> CalSeg<T> {
    pub fn new(name: &'static str, index: u8, default: T) -> Self {
        Xcp::get().registry().add_cal_seg(CalSegMeta { name: name.to_string(), segment_index: index, size: std::mem::size_of::<T>() });
        CalSeg { name, index, ecu_page: Box::new(UnsafeCell::new(default)), xcp_page: Arc::new(Mutex::new(default)), _not_sync: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// Reads the current ECU (working) page value.
    pub fn read(&self) -> T {
        unsafe { *self.ecu_page.get() }
    }

    /// Copies the XCP page into the ECU page. Call once per
    /// application cycle so in-flight reads never observe a torn
    /// write from SET_CAL_PAGE/DOWNLOAD.
    pub fn sync(&self) {
        let xcp = *self.xcp_page.lock();
        unsafe {
            *self.ecu_page.get() = xcp;
        }
    }

    /// Overwrites `len` bytes at `offset` in the XCP page — the body
    /// SET_CAL_PAGE/DOWNLOAD calls into through the `Instrumentation`
    /// surface.
    pub fn write_xcp_bytes(&self, offset: usize, data: &[u8]) {
        let mut guard = self.xcp_page.lock();
        let ptr = &mut *guard as *mut T as *mut u8;
        let dst = unsafe { std::slice::from_raw_parts_mut(ptr.add(offset), data.len()) };
        dst.copy_from_slice(data);
    }

    /// Reads `len` bytes at `offset` from whichever page `page`
    /// selects (`0` = ECU/RAM working page, `1` = XCP/FLASH reference
    /// page), for UPLOAD.
    pub fn read_bytes(&self, offset: usize, len: usize, page: u8) -> Vec<u8> {
        if page == 0 {
            let value = self.read();
            let ptr = &value as *const T as *const u8;
            unsafe { std::slice::from_raw_parts(ptr.add(offset), len) }.to_vec()
        } else {
            let guard = self.xcp_page.lock();
            let ptr = &*guard as *const T as *const u8;
            unsafe { std::slice::from_raw_parts(ptr.add(offset), len) }.to_vec()
        }
    }

    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    /// Clones the handle to the XCP (master-writable) page's backing
    /// storage. Unlike `CalSeg` itself (deliberately not `Sync`, since
    /// the ECU page is single-thread-owned), `Arc<Mutex<T>>` is
    /// `Send + Sync` whenever `T: Send` — use this to wire an
    /// [`crate::address::AddressSpace`] impl that resolves calibration
    /// addresses from the transport/protocol thread.
    pub fn xcp_page_handle(&self) -> Arc<Mutex<T>> {
        self.xcp_page.clone()
    }
}

impl<T: CalPageField> Deref for CalSeg<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.ecu_page.get() }
    }
}

impl<T: CalPageField> Clone for CalSeg<T> {
    fn clone(&self) -> Self {
        CalSeg { name: self.name, index: self.index, ecu_page: Box::new(UnsafeCell::new(self.read())), xcp_page: self.xcp_page.clone(), _not_sync: PhantomData }
    }
}

/// Implements [`crate::address::Instrumentation`]'s page-switch
/// callbacks for a single `CalSeg<T>`, selecting between its two
/// pages. Multi-segment applications compose several of these behind
/// their own `Instrumentation` impl keyed by segment index.
pub fn set_cal_page<T: CalPageField>(seg: &CalSeg<T>, page: u8, data: &[u8], offset: usize) -> PageSetStatus {
    if page > 1 {
        return PageSetStatus::InvalidPage;
    }
    if page == 1 {
        seg.write_xcp_bytes(offset, data);
        PageSetStatus::Ok
    } else {
        PageSetStatus::Denied // writing the ECU/RAM page directly through XCP is not supported
    }
}

/// Reads a named field out of a calibration segment's current ECU
/// page. `T` must be `Copy`, matching `CalSeg`'s page-swap model.
#[macro_export]
macro_rules! calseg_field {
    ($calseg:expr, $field:ident) => {
        $calseg.read().$field
    };
}

/// Optional calibration-segment persistence, left as an external
/// collaborator per `SPEC_FULL.md` §1 — the core never requires it.
pub trait CalSegPersistence<T> {
    fn load(&self) -> Option<T>;
    fn save(&self, value: &T);
}

#[cfg(feature = "serde")]
pub struct JsonFilePersistence {
    pub path: std::path::PathBuf,
}

#[cfg(feature = "serde")]
impl<T: serde::Serialize + serde::de::DeserializeOwned> CalSegPersistence<T> for JsonFilePersistence {
    fn load(&self) -> Option<T> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn save(&self, value: &T) {
        if let Ok(bytes) = serde_json::to_vec_pretty(value) {
            let _ = std::fs::write(&self.path, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    struct Params {
        gain: f32,
        offset: i32,
    }

    #[test]
    fn sync_copies_xcp_page_into_ecu_page() {
        let seg = CalSeg::new("params", 0, Params { gain: 1.0, offset: 0 });
        assert_eq!(seg.read().gain, 1.0);

        let gain_offset = 0usize; // `gain` is the first field
        seg.write_xcp_bytes(gain_offset, &2.5f32.to_le_bytes());
        // Not yet visible on the ECU page.
        assert_eq!(seg.read().gain, 1.0);

        seg.sync();
        assert_eq!(seg.read().gain, 2.5);
    }

    #[test]
    fn deref_reads_ecu_page() {
        let seg = CalSeg::new("params", 0, Params { gain: 3.0, offset: 7 });
        assert_eq!(seg.offset, 7);
        assert_eq!(calseg_field!(seg, offset), 7);
    }
}
