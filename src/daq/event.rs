//! Application-facing DAQ event API.
//!
//! Kept close to the teacher's `daq_event.rs`: an [`XcpEvent`] handle,
//! a [`DaqEvent`] buffer wrapper for building one ODT's worth of
//! bytes, and the `daq_register!`/`daq_create_event!`/`daq_capture!`
//! macro family using the same thread-local/`AtomicI16` "register
//! once" sentinel pattern (`-32768` means "not yet registered").
//! Only the bodies that used to call into `xcplib` are rewired, to
//! `crate::xcp::Xcp`'s native `trigger_event`.

use std::sync::atomic::{AtomicI16, Ordering};

use crate::address::XCP_ADDR_EXT_DYN;
use crate::registry::{MeasurementMeta, RegistryScalar};
use crate::xcp::Xcp;

/// Sentinel value meaning "measurement object not yet registered",
/// matching the teacher's convention.
pub const UNREGISTERED: i16 = i16::MIN;

/// A handle to one registered DAQ event (a measurement trigger
/// point). Cheap to copy; the real state lives in the process-wide
/// [`Xcp`] singleton's descriptor store.
#[derive(Debug, Clone, Copy)]
pub struct XcpEvent {
    id: u16,
}

impl XcpEvent {
    pub(crate) fn new(id: u16) -> Self {
        XcpEvent { id }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Samples every DAQ list bound to this event using absolute
    /// addressing (no per-instance base pointer).
    pub fn trigger(&self) {
        Xcp::get().trigger_event_abs(self.id);
    }

    /// Samples using `base` as the event-relative context pointer for
    /// entries registered with `addr_ext == XCP_ADDR_EXT_DYN`.
    pub fn trigger_ext(&self, base: *const u8) {
        Xcp::get().trigger_event_ext(self.id, base);
    }
}

/// A per-event sample buffer: applications describe a struct's
/// fields, call `capture` once per trigger, and the event fires from
/// the buffer's bytes.
pub struct DaqEvent<const N: usize> {
    event: XcpEvent,
    buffer: [u8; N],
    len: usize,
}

impl<const N: usize> DaqEvent<N> {
    pub fn new(name: &str) -> Self {
        let event = Xcp::get().create_event(name, 0, 0, 0);
        DaqEvent { event, buffer: [0u8; N], len: 0 }
    }

    pub fn event(&self) -> XcpEvent {
        self.event
    }

    /// Appends `bytes` to the capture buffer, returning the offset at
    /// which they were written (used by `daq_register!` to record a
    /// field's address for WRITE_DAQ on first trigger).
    pub fn add_capture(&mut self, bytes: &[u8]) -> usize {
        let offset = self.len;
        let end = offset + bytes.len();
        assert!(end <= N, "DaqEvent buffer overflow");
        self.buffer[offset..end].copy_from_slice(bytes);
        self.len = end;
        offset
    }

    pub fn capture_stack<T: Copy>(&mut self, value: &T) -> usize {
        let bytes = unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) };
        self.add_capture(bytes)
    }

    /// Like [`Self::capture_stack`], but also registers `value` as a
    /// named measurement in the process registry (`addr_ext ==
    /// XCP_ADDR_EXT_DYN`, `addr` == this call's buffer offset), so the
    /// external A2L writer has metadata to describe it with. Used by
    /// `daq_register!` the first time a measurement object is seen;
    /// later triggers just re-capture the bytes through
    /// `capture_stack` since the offset and type don't change.
    pub fn capture_and_register<T: Copy + RegistryScalar>(&mut self, name: &str, value: &T) -> usize {
        let offset = self.capture_stack(value);
        Xcp::get().registry().add_measurement(MeasurementMeta {
            name: name.to_string(),
            addr_ext: XCP_ADDR_EXT_DYN,
            addr: offset as u32,
            size: std::mem::size_of::<T>() as u8,
            datatype: T::registry_type(),
        });
        offset
    }

    /// Resets the capture cursor for a new sampling instant, then
    /// triggers the event over the buffer written so far.
    pub fn trigger(&mut self) {
        self.event.trigger_ext(self.buffer.as_ptr());
        self.len = 0;
    }

    pub fn buffer_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }
}

/// Registers a static measurement object exactly once per process,
/// using an `AtomicI16` sentinel the way the teacher's
/// `daq_register_static!`/`daq_register!` macros do: the first caller
/// (id still `UNREGISTERED`) performs registration and stores the
/// resulting offset/event id; subsequent callers on other threads
/// just read the cached value.
#[macro_export]
macro_rules! daq_register {
    ($event:expr, $value:expr) => {{
        static REGISTERED: std::sync::atomic::AtomicI16 = std::sync::atomic::AtomicI16::new($crate::daq::event::UNREGISTERED);
        if REGISTERED.load(std::sync::atomic::Ordering::Relaxed) == $crate::daq::event::UNREGISTERED {
            let offset = $event.capture_and_register(stringify!($value), &$value);
            REGISTERED.store(offset as i16, std::sync::atomic::Ordering::Relaxed);
        } else {
            $event.capture_stack(&$value);
        }
    }};
}

/// Captures a value into the event's buffer every call (no
/// registration bookkeeping) — used for values whose address/layout
/// never needs to survive past the current trigger.
#[macro_export]
macro_rules! daq_capture {
    ($event:expr, $value:expr) => {{
        $event.capture_stack(&$value)
    }};
}

/// Creates (once per process) a named event with the given nominal
/// cycle time and returns its [`XcpEvent`] handle. Mirrors the
/// teacher's `daq_create_event!` thread-local-cached pattern.
#[macro_export]
macro_rules! daq_create_event {
    ($name:expr) => {{
        thread_local! {
            static EVENT: std::cell::Cell<Option<$crate::daq::event::XcpEvent>> = std::cell::Cell::new(None);
        }
        EVENT.with(|cell| {
            if let Some(ev) = cell.get() {
                ev
            } else {
                let ev = $crate::xcp::Xcp::get().create_event($name, 0, 0, 0);
                cell.set(Some(ev));
                ev
            }
        })
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daq_event_buffer_accumulates_and_resets() {
        crate::xcp::Xcp::test_reinit();
        let mut ev: DaqEvent<32> = DaqEvent::new("test_event");
        let off1 = ev.capture_stack(&1u32);
        assert_eq!(off1, 0);
        let off2 = ev.capture_stack(&2u16);
        assert_eq!(off2, 4);
        ev.trigger();
        // After trigger the cursor resets for the next sampling instant.
        let off3 = ev.capture_stack(&3u8);
        assert_eq!(off3, 0);
    }

    #[test]
    fn daq_register_populates_the_registry_once() {
        crate::xcp::Xcp::test_reinit();
        let mut ev: DaqEvent<32> = DaqEvent::new("registered_event");
        let value: u16 = 7;
        crate::daq_register!(ev, value);
        crate::daq_register!(ev, value);
        assert_eq!(crate::xcp::Xcp::get().registry().measurement_count(), 1, "the sentinel must register the measurement exactly once across repeated triggers");
    }
}
