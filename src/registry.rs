//! In-memory registry of event/measurement/calibration metadata.
//!
//! This is the named interface point for the out-of-scope A2L
//! description-file generator: it is the data an external text emitter
//! would walk to produce an A2L file, but this crate never emits A2L
//! text itself (see `SPEC_FULL.md` §1). It also backs GET_ID /
//! UPLOAD's identification-payload chunking (§4.8).

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Ascii,
    AsamName,
    AsamPath,
    AsamUrl,
    AsamUpload,
    AsamEpk,
}

#[derive(Debug, Clone)]
pub struct MeasurementMeta {
    pub name: String,
    pub addr_ext: u8,
    pub addr: u32,
    pub size: u8,
    pub datatype: RegistryDataType,
}

#[derive(Debug, Clone)]
pub struct CharacteristicMeta {
    pub name: String,
    pub segment: u8,
    pub offset: u32,
    pub size: u8,
    pub datatype: RegistryDataType,
}

#[derive(Debug, Clone)]
pub struct CalSegMeta {
    pub name: String,
    pub segment_index: u8,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryDataType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

/// Maps a primitive Rust scalar type to its [`RegistryDataType`] tag —
/// glue for `daq_register!`'s automatic measurement registration.
pub trait RegistryScalar {
    fn registry_type() -> RegistryDataType;
}

macro_rules! impl_registry_scalar {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl RegistryScalar for $t {
            fn registry_type() -> RegistryDataType {
                RegistryDataType::$variant
            }
        })*
    };
}

impl_registry_scalar! {
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
}

struct Inner {
    name: String,
    epk: String,
    measurements: Vec<MeasurementMeta>,
    characteristics: Vec<CharacteristicMeta>,
    cal_segs: Vec<CalSegMeta>,
    staged_id_payload: Vec<u8>,
    staged_cursor: usize,
    frozen: bool,
}

/// Event/measurement/calibration metadata store. Deliberately does
/// not write A2L text — see module docs.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(Inner {
                name: String::new(),
                epk: String::from("EPK_00000000"),
                measurements: Vec::new(),
                characteristics: Vec::new(),
                cal_segs: Vec::new(),
                staged_id_payload: Vec::new(),
                staged_cursor: 0,
                frozen: false,
            }),
        }
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.lock().name = name.into();
    }

    pub fn set_epk(&self, epk: impl Into<String>) {
        self.inner.lock().epk = epk.into();
    }

    pub fn add_measurement(&self, meta: MeasurementMeta) {
        self.inner.lock().measurements.push(meta);
    }

    pub fn add_characteristic(&self, meta: CharacteristicMeta) {
        self.inner.lock().characteristics.push(meta);
    }

    pub fn add_cal_seg(&self, meta: CalSegMeta) {
        self.inner.lock().cal_segs.push(meta);
    }

    pub fn measurement_count(&self) -> usize {
        self.inner.lock().measurements.len()
    }

    pub fn freeze(&self) {
        self.inner.lock().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().frozen
    }

    /// Builds the payload GET_ID would set as the identification
    /// content for `id_type`.
    pub fn id_payload(&self, id_type: IdType) -> Vec<u8> {
        let inner = self.inner.lock();
        match id_type {
            IdType::Ascii | IdType::AsamName => inner.name.as_bytes().to_vec(),
            IdType::AsamPath => format!("{}.a2l", inner.name).into_bytes(),
            IdType::AsamUrl => Vec::new(),
            IdType::AsamUpload => Vec::new(), // an external A2L writer supplies this payload
            IdType::AsamEpk => inner.epk.as_bytes().to_vec(),
        }
    }

    pub fn stage_id_payload(&self, payload: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.staged_id_payload = payload;
        inner.staged_cursor = 0;
    }

    pub fn read_staged_id_payload(&self, n: usize) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let start = inner.staged_cursor.min(inner.staged_id_payload.len());
        let end = (start + n).min(inner.staged_id_payload.len());
        let out = inner.staged_id_payload[start..end].to_vec();
        inner.staged_cursor = end;
        out
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_payload_round_trips_through_staging() {
        let r = Registry::new();
        r.set_name("demo_ecu");
        let payload = r.id_payload(IdType::AsamName);
        r.stage_id_payload(payload.clone());
        let mut out = Vec::new();
        loop {
            let chunk = r.read_staged_id_payload(3);
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn epk_defaults_and_can_be_overridden() {
        let r = Registry::new();
        assert_eq!(r.id_payload(IdType::AsamEpk), b"EPK_00000000".to_vec());
        r.set_epk("EPK_deadbeef");
        assert_eq!(r.id_payload(IdType::AsamEpk), b"EPK_deadbeef".to_vec());
    }
}
