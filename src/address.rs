//! Address resolution and the external callback surface.
//!
//! The original C core stores only a raw `u32` address per ODT entry
//! and reconstitutes a pointer through a single global base. We
//! express the same idea as a trait so the rest of the crate never
//! touches raw pointers directly: [`AddressSpace::resolve`] turns
//! `(ext, addr)` into a byte slice, or `None` if access is denied.

use crate::clock::GrandmasterInfo;

/// Address extension `0` means "absolute", i.e. relative to the
/// process base pointer.
pub const XCP_ADDR_EXT_ABS: u8 = 0;
/// Address extension `1` means relative to the event's data context
/// (the `base_ptr` passed to `trigger_event`).
pub const XCP_ADDR_EXT_DYN: u8 = 1;
/// Address extension `2` is reserved for application-defined memory
/// segments (calibration pages resolve through here).
pub const XCP_ADDR_EXT_APP: u8 = 2;

/// Resolves `(addr_ext, addr)` pairs to byte ranges.
///
/// Implementations must be careful: `resolve`/`resolve_mut` hand out
/// slices into live application memory. The protocol layer only ever
/// calls these while holding no other lock, and treats `None` as
/// `ACCESS_DENIED`.
pub trait AddressSpace: Send + Sync {
    /// Process base pointer used when `addr_ext == XCP_ADDR_EXT_ABS`.
    fn base(&self) -> *const u8;

    /// Resolve a read-only view of `len` bytes at `(ext, addr)`.
    ///
    /// # Safety
    /// The returned slice must stay valid for the duration of the
    /// call; implementations are responsible for bounds-checking
    /// `addr`/`len` against whatever region `ext` designates.
    unsafe fn resolve(&self, ext: u8, addr: u32, len: usize) -> Option<&[u8]>;

    /// Resolve a writable view of `len` bytes at `(ext, addr)`.
    ///
    /// # Safety
    /// Same requirements as [`resolve`](Self::resolve).
    unsafe fn resolve_mut(&self, ext: u8, addr: u32, len: usize) -> Option<&mut [u8]>;

    /// Resolve an address relative to an event-supplied base pointer
    /// (`addr_ext == XCP_ADDR_EXT_DYN`), used while building DAQ
    /// packets during `trigger_event`.
    ///
    /// # Safety
    /// `base` must point at at least `addr + len` readable bytes.
    unsafe fn resolve_with_base(&self, base: *const u8, addr: u32, len: usize) -> Option<&[u8]> {
        if base.is_null() {
            return None;
        }
        Some(std::slice::from_raw_parts(base.add(addr as usize), len))
    }
}

/// Outcome of a connect/prepare-DAQ gate callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Accept,
    Reject,
}

/// Result of a SET_CAL_PAGE request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSetStatus {
    Ok,
    Denied,
    InvalidPage,
    InvalidMode,
}

/// The external callback surface: hooks an embedding application
/// supplies so the protocol/DAQ core can ask about connect
/// acceptance, DAQ lifecycle transitions, and calibration page
/// switching without the core depending on application types.
pub trait Instrumentation: Send + Sync {
    fn on_connect(&self) -> Gate {
        Gate::Accept
    }

    fn on_prepare_daq(&self) -> Gate {
        Gate::Accept
    }

    fn on_start_daq(&self) {}

    fn on_stop_daq(&self) {}

    /// Returns the active page index for `segment`, or `None` if the
    /// segment id is unknown.
    fn get_cal_page(&self, segment: u8, mode: u8) -> Option<u8>;

    fn set_cal_page(&self, segment: u8, page: u8, mode: u8) -> PageSetStatus;

    fn clock_info_grandmaster(&self) -> Option<GrandmasterInfo> {
        None
    }
}

/// An [`Instrumentation`] that accepts every connection and has no
/// calibration segments; used when an embedding application has none
/// of its own (demo binaries, unit tests).
pub struct NullInstrumentation;

impl Instrumentation for NullInstrumentation {
    fn get_cal_page(&self, _segment: u8, _mode: u8) -> Option<u8> {
        None
    }

    fn set_cal_page(&self, _segment: u8, _page: u8, _mode: u8) -> PageSetStatus {
        PageSetStatus::Denied
    }
}
