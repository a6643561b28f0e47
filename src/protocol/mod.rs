//! The XCP protocol state machine: command decode, response encode,
//! session status, MTA cursor, calibration-page dispatch.
//!
//! Single-threaded within the receive worker; never dispatched from
//! the DAQ sampler (spec §4.5).

pub mod checksum;

use std::net::SocketAddr;

use crate::address::{AddressSpace, Gate, Instrumentation, PageSetStatus};
use crate::clock::{Clock, Epoch};
use crate::daq::{DaqError, DescriptorStore};
use crate::registry::{IdType, Registry};
use crate::session::{Mta, Session};
use checksum::ChecksumType;

// Packet identifiers.
pub const PID_RES: u8 = 0xFF;
pub const PID_ERR: u8 = 0xFE;
pub const PID_EV: u8 = 0xFD;
pub const PID_SERV: u8 = 0xFC;

// Command PIDs (first byte of a CRO).
mod cmd {
    pub const CONNECT: u8 = 0xFF;
    pub const DISCONNECT: u8 = 0xFE;
    pub const GET_STATUS: u8 = 0xFD;
    pub const SYNCH: u8 = 0xFC;
    pub const GET_COMM_MODE_INFO: u8 = 0xFB;
    pub const GET_ID: u8 = 0xFA;
    pub const SET_MTA: u8 = 0xF6;
    pub const UPLOAD: u8 = 0xF5;
    pub const SHORT_UPLOAD: u8 = 0xF4;
    pub const BUILD_CHECKSUM: u8 = 0xF3;
    pub const DOWNLOAD: u8 = 0xF0;
    pub const DOWNLOAD_MAX: u8 = 0xEE;
    pub const SHORT_DOWNLOAD: u8 = 0xED;
    pub const SET_CAL_PAGE: u8 = 0xEB;
    pub const GET_CAL_PAGE: u8 = 0xEA;
    pub const SET_DAQ_PTR: u8 = 0xE2;
    pub const WRITE_DAQ: u8 = 0xE1;
    pub const SET_DAQ_LIST_MODE: u8 = 0xE0;
    pub const GET_DAQ_LIST_MODE: u8 = 0xDF;
    pub const START_STOP_DAQ_LIST: u8 = 0xDE;
    pub const START_STOP_SYNCH: u8 = 0xDD;
    pub const GET_DAQ_CLOCK: u8 = 0xDC;
    pub const GET_DAQ_PROCESSOR_INFO: u8 = 0xDA;
    pub const GET_DAQ_RESOLUTION_INFO: u8 = 0xD9;
    pub const GET_DAQ_EVENT_INFO: u8 = 0xD7;
    pub const FREE_DAQ: u8 = 0xD6;
    pub const ALLOC_DAQ: u8 = 0xD5;
    pub const ALLOC_ODT: u8 = 0xD4;
    pub const ALLOC_ODT_ENTRY: u8 = 0xD3;
    pub const WRITE_DAQ_MULTIPLE: u8 = 0xC7;
    pub const TIME_CORRELATION_PROPERTIES: u8 = 0xC6;
    pub const GET_VERSION: u8 = 0xC0;
}

/// Wire error codes, preserved from XCP, emitted as the second byte
/// of an ERR response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    CmdSynch = 0x00,
    CmdBusy = 0x10,
    CmdUnknown = 0x20,
    CmdSyntax = 0x21,
    OutOfRange = 0x22,
    WriteProtected = 0x23,
    AccessDenied = 0x24,
    AccessLocked = 0x25,
    PageNotValid = 0x26,
    PageModeNotValid = 0x27,
    SegmentNotValid = 0x28,
    Sequence = 0x29,
    DaqConfig = 0x2A,
    MemoryOverflow = 0x2B,
    Generic = 0x2C,
    Verify = 0x2F,
}

struct WriteDaqEntry {
    bit_offset: u8,
    size: u8,
    ext: u8,
    addr: u32,
}

enum Command {
    Connect { mode: u8 },
    Disconnect,
    GetStatus,
    Sync,
    GetCommModeInfo,
    GetId { id_type: u8 },
    SetMta { ext: u8, addr: u32 },
    Upload { n: u8 },
    ShortUpload { n: u8, ext: u8, addr: u32 },
    Download { data: Vec<u8> },
    DownloadMax { data: Vec<u8> },
    ShortDownload { ext: u8, addr: u32, data: Vec<u8> },
    BuildChecksum { n: u32 },
    GetCalPage { segment: u8, mode: u8 },
    SetCalPage { mode: u8, segment: u8, page: u8 },
    GetDaqProcessorInfo,
    GetDaqResolutionInfo,
    GetDaqEventInfo { event: u16 },
    FreeDaq,
    AllocDaq { n: u16 },
    AllocOdt { daq: u16, n: u8 },
    AllocOdtEntry { daq: u16, odt: u8, n: u8 },
    SetDaqPtr { daq: u16, odt: u8, idx: u8 },
    WriteDaq(WriteDaqEntry),
    WriteDaqMultiple(Vec<WriteDaqEntry>),
    SetDaqListMode { mode: u8, daq: u16, event: u16, prescaler: u16, priority: u8 },
    GetDaqListMode { daq: u16 },
    StartStopDaqList { mode: u8, daq: u16 },
    StartStopSynch { mode: u8 },
    GetDaqClock,
    TimeCorrelationProperties,
    GetVersion,
    Unknown,
}

fn u16_le(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}
fn u32_le(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn decode(payload: &[u8]) -> Option<Command> {
    if payload.is_empty() {
        return None;
    }
    let pid = payload[0];
    let b = &payload[1..];
    Some(match pid {
        cmd::CONNECT if !b.is_empty() => Command::Connect { mode: b[0] },
        cmd::DISCONNECT => Command::Disconnect,
        cmd::GET_STATUS => Command::GetStatus,
        cmd::SYNCH => Command::Sync,
        cmd::GET_COMM_MODE_INFO => Command::GetCommModeInfo,
        cmd::GET_ID if !b.is_empty() => Command::GetId { id_type: b[0] },
        cmd::SET_MTA if b.len() >= 7 => Command::SetMta { ext: b[2], addr: u32_le(&b[3..7]) },
        cmd::UPLOAD if !b.is_empty() => Command::Upload { n: b[0] },
        cmd::SHORT_UPLOAD if b.len() >= 6 => Command::ShortUpload { n: b[0], ext: b[2], addr: u32_le(&b[3..7.min(b.len())]) },
        cmd::BUILD_CHECKSUM if b.len() >= 7 => Command::BuildChecksum { n: u32_le(&b[3..7]) },
        cmd::DOWNLOAD if !b.is_empty() => {
            let n = b[0] as usize;
            Command::Download { data: b.get(1..1 + n).unwrap_or(&[]).to_vec() }
        }
        cmd::DOWNLOAD_MAX => Command::DownloadMax { data: b.to_vec() },
        cmd::SHORT_DOWNLOAD if b.len() >= 7 => {
            let n = b[0] as usize;
            Command::ShortDownload { ext: b[2], addr: u32_le(&b[3..7]), data: b.get(7..7 + n).unwrap_or(&[]).to_vec() }
        }
        cmd::GET_CAL_PAGE if b.len() >= 2 => Command::GetCalPage { segment: b[1], mode: b[0] },
        cmd::SET_CAL_PAGE if b.len() >= 3 => Command::SetCalPage { mode: b[0], segment: b[1], page: b[2] },
        cmd::GET_DAQ_PROCESSOR_INFO => Command::GetDaqProcessorInfo,
        cmd::GET_DAQ_RESOLUTION_INFO => Command::GetDaqResolutionInfo,
        cmd::GET_DAQ_EVENT_INFO if b.len() >= 3 => Command::GetDaqEventInfo { event: u16_le(&b[1..3]) },
        cmd::FREE_DAQ => Command::FreeDaq,
        cmd::ALLOC_DAQ if b.len() >= 3 => Command::AllocDaq { n: u16_le(&b[1..3]) },
        cmd::ALLOC_ODT if b.len() >= 4 => Command::AllocOdt { daq: u16_le(&b[1..3]), n: b[3] },
        cmd::ALLOC_ODT_ENTRY if b.len() >= 5 => Command::AllocOdtEntry { daq: u16_le(&b[1..3]), odt: b[3], n: b[4] },
        cmd::SET_DAQ_PTR if b.len() >= 4 => Command::SetDaqPtr { daq: u16_le(&b[1..3]), odt: b[3], idx: *b.get(4).unwrap_or(&0) },
        cmd::WRITE_DAQ if b.len() >= 7 => Command::WriteDaq(WriteDaqEntry { bit_offset: b[0], size: b[1], ext: b[2], addr: u32_le(&b[3..7]) }),
        cmd::WRITE_DAQ_MULTIPLE if !b.is_empty() => {
            let count = b[0] as usize;
            let mut entries = Vec::with_capacity(count);
            let mut off = 1;
            for _ in 0..count {
                if off + 7 > b.len() {
                    break;
                }
                entries.push(WriteDaqEntry { bit_offset: b[off], size: b[off + 1], ext: b[off + 2], addr: u32_le(&b[off + 3..off + 7]) });
                off += 7;
            }
            Command::WriteDaqMultiple(entries)
        }
        cmd::SET_DAQ_LIST_MODE if b.len() >= 7 => Command::SetDaqListMode {
            mode: b[0],
            daq: u16_le(&b[1..3]),
            event: u16_le(&b[3..5]),
            prescaler: b[5] as u16,
            priority: b[6],
        },
        cmd::GET_DAQ_LIST_MODE if b.len() >= 3 => Command::GetDaqListMode { daq: u16_le(&b[1..3]) },
        cmd::START_STOP_DAQ_LIST if b.len() >= 3 => Command::StartStopDaqList { mode: b[0], daq: u16_le(&b[1..3]) },
        cmd::START_STOP_SYNCH if !b.is_empty() => Command::StartStopSynch { mode: b[0] },
        cmd::GET_DAQ_CLOCK => Command::GetDaqClock,
        cmd::TIME_CORRELATION_PROPERTIES => Command::TimeCorrelationProperties,
        cmd::GET_VERSION => Command::GetVersion,
        _ => Command::Unknown,
    })
}

/// A protocol response: raw XCP payload bytes (PID-first), not yet
/// wrapped in transport framing.
pub struct Response(pub Vec<u8>);

impl Response {
    fn res(bytes: &[u8]) -> Response {
        let mut v = Vec::with_capacity(bytes.len() + 1);
        v.push(PID_RES);
        v.extend_from_slice(bytes);
        Response(v)
    }

    fn err(code: ErrorCode) -> Response {
        Response(vec![PID_ERR, code as u8])
    }
}

/// Drives the protocol state machine against a [`Session`], a
/// [`DescriptorStore`], an [`AddressSpace`], an [`Instrumentation`],
/// a [`Clock`], and a [`Registry`].
pub struct Dispatcher<'a> {
    pub session: &'a Session,
    pub daq: &'a DescriptorStore,
    pub addr_space: &'a dyn AddressSpace,
    pub instrumentation: &'a dyn Instrumentation,
    pub clock: &'a Clock,
    pub registry: &'a Registry,
    pub config: &'a crate::config::XcpConfig,
}

impl<'a> Dispatcher<'a> {
    /// Processes one received XCP message, returning the response to
    /// send (if any). Per spec §4.5: pre-connect, only CONNECT is
    /// accepted; every other command is silently dropped. `src` is the
    /// peer address the message arrived from, used to pin the master
    /// on a successful CONNECT.
    pub fn dispatch(&self, src: SocketAddr, payload: &[u8]) -> Option<Response> {
        let command = decode(payload)?;

        if !self.session.is_connected() && !matches!(command, Command::Connect { .. }) {
            return None;
        }

        Some(match command {
            Command::Connect { mode: _ } => self.handle_connect(src),
            Command::Disconnect => self.handle_disconnect(),
            Command::GetStatus => self.handle_get_status(),
            Command::Sync => Response::err(ErrorCode::CmdSynch),
            Command::GetCommModeInfo => self.handle_get_comm_mode_info(),
            Command::GetId { id_type } => self.handle_get_id(id_type),
            Command::SetMta { ext, addr } => {
                self.session.set_mta(Mta { ext, addr });
                Response::res(&[])
            }
            Command::Upload { n } => self.handle_upload(n),
            Command::ShortUpload { n, ext, addr } => {
                self.session.set_mta(Mta { ext, addr });
                self.handle_upload(n)
            }
            Command::Download { data } => self.handle_download(&data),
            Command::DownloadMax { data } => self.handle_download(&data),
            Command::ShortDownload { ext, addr, data } => {
                self.session.set_mta(Mta { ext, addr });
                self.handle_download(&data)
            }
            Command::BuildChecksum { n } => self.handle_build_checksum(n),
            Command::GetCalPage { segment, mode } => self.handle_get_cal_page(segment, mode),
            Command::SetCalPage { mode, segment, page } => self.handle_set_cal_page(mode, segment, page),
            Command::GetDaqProcessorInfo => self.handle_get_daq_processor_info(),
            Command::GetDaqResolutionInfo => self.handle_get_daq_resolution_info(),
            Command::GetDaqEventInfo { event } => self.handle_get_daq_event_info(event),
            Command::FreeDaq => {
                self.daq.free_all();
                self.session.set_daq_running(false);
                Response::res(&[])
            }
            Command::AllocDaq { n } => match self.daq.alloc_daq(n) {
                Ok(()) => Response::res(&[]),
                Err(e) => Response::err(daq_error_code(e)),
            },
            Command::AllocOdt { daq, n } => match self.daq.alloc_odt(daq, n) {
                Ok(()) => Response::res(&[]),
                Err(e) => Response::err(daq_error_code(e)),
            },
            Command::AllocOdtEntry { daq, odt, n } => match self.daq.alloc_odt_entry(daq, odt, n) {
                Ok(()) => Response::res(&[]),
                Err(e) => Response::err(daq_error_code(e)),
            },
            Command::SetDaqPtr { daq, odt, idx } => match self.daq.set_daq_ptr(daq, odt, idx) {
                Ok(()) => Response::res(&[]),
                Err(e) => Response::err(daq_error_code(e)),
            },
            Command::WriteDaq(entry) => self.handle_write_daq(&entry),
            Command::WriteDaqMultiple(entries) => {
                for e in &entries {
                    if let r @ Response(_) = self.handle_write_daq(e) {
                        if r.0[0] == PID_ERR {
                            return Some(r);
                        }
                    }
                }
                Response::res(&[])
            }
            Command::SetDaqListMode { mode, daq, event, prescaler, priority } => self.handle_set_daq_list_mode(mode, daq, event, prescaler, priority),
            Command::GetDaqListMode { daq } => self.handle_get_daq_list_mode(daq),
            Command::StartStopDaqList { mode, daq } => self.handle_start_stop_daq_list(mode, daq),
            Command::StartStopSynch { mode } => self.handle_start_stop_synch(mode),
            Command::GetDaqClock => self.handle_get_daq_clock(),
            Command::TimeCorrelationProperties => self.handle_time_correlation_properties(),
            Command::GetVersion => Response::res(&[self.session.protocol_version(), self.session.transport_version()]),
            Command::Unknown => Response::err(ErrorCode::CmdUnknown),
        })
    }

    fn handle_connect(&self, src: SocketAddr) -> Response {
        if self.instrumentation.on_connect() == Gate::Reject {
            return Response::err(ErrorCode::AccessDenied);
        }
        let resume = self.session.connect(Some(src));
        if !resume {
            self.daq.free_all();
        }
        let resources = self.session.resources().bits();
        let comm_basic = 0x01; // byte order (little-endian) + address granularity byte = 1
        let max_dto = self.config.max_dto;
        Response::res(&[
            resources,
            comm_basic,
            self.config.max_cto,
            (max_dto & 0xFF) as u8,
            (max_dto >> 8) as u8,
            self.session.protocol_version(),
            self.session.transport_version(),
        ])
    }

    fn handle_disconnect(&self) -> Response {
        self.instrumentation.on_stop_daq();
        self.daq.stop_all();
        self.session.set_daq_running(false);
        self.session.disconnect();
        Response::res(&[])
    }

    fn handle_get_status(&self) -> Response {
        let status = self.session.status().bits();
        let protection = 0u8; // no seed-and-key, nothing is protected
        let config_id = 0u16;
        Response::res(&[status, protection, (config_id & 0xFF) as u8, (config_id >> 8) as u8])
    }

    fn handle_get_comm_mode_info(&self) -> Response {
        // 8-byte layout per the cited C original's CRM_BYTE offsets:
        // reserved, optional byte (block/interleaved mode bits), reserved,
        // max_bs, min_st, queue size (1 byte), driver version (1 byte).
        let queue_size = self.config.queue_depth.min(u8::MAX as usize) as u8;
        Response::res(&[0, 0, 0, 0, 0, queue_size, self.session.protocol_version()])
    }

    fn handle_get_id(&self, id_type: u8) -> Response {
        let id_type = match id_type {
            0 => IdType::Ascii,
            1 => IdType::AsamName,
            2 => IdType::AsamPath,
            3 => IdType::AsamUrl,
            4 => IdType::AsamUpload,
            _ => IdType::AsamEpk,
        };
        let payload = self.registry.id_payload(id_type);
        self.session.set_mta(Mta { ext: 0, addr: crate::xcp::EPK_PSEUDO_ADDR });
        self.registry.stage_id_payload(payload.clone());
        let len = payload.len() as u32;
        Response::res(&[0, 0, 0, (len & 0xFF) as u8, ((len >> 8) & 0xFF) as u8, ((len >> 16) & 0xFF) as u8, ((len >> 24) & 0xFF) as u8])
    }

    fn handle_upload(&self, n: u8) -> Response {
        let max_payload = self.config.max_cto.saturating_sub(1);
        if n > max_payload {
            return Response::err(ErrorCode::OutOfRange);
        }
        let mta = self.session.mta();
        if mta.addr == crate::xcp::EPK_PSEUDO_ADDR {
            let bytes = self.registry.read_staged_id_payload(n as usize);
            self.session.advance_mta(n as u32);
            return Response::res(&bytes);
        }
        // SAFETY: resolve() bounds-checks addr/len against the region `ext` designates.
        let bytes = unsafe { self.addr_space.resolve(mta.ext, mta.addr, n as usize) };
        match bytes {
            Some(b) => {
                let out = b.to_vec();
                self.session.advance_mta(n as u32);
                Response::res(&out)
            }
            None => Response::err(ErrorCode::AccessDenied),
        }
    }

    fn handle_download(&self, data: &[u8]) -> Response {
        let mta = self.session.mta();
        // SAFETY: resolve_mut() bounds-checks addr/len against the region `ext` designates.
        let slot = unsafe { self.addr_space.resolve_mut(mta.ext, mta.addr, data.len()) };
        match slot {
            Some(dst) => {
                dst.copy_from_slice(data);
                self.session.advance_mta(data.len() as u32);
                Response::res(&[])
            }
            None => Response::err(ErrorCode::AccessDenied),
        }
    }

    fn handle_build_checksum(&self, n: u32) -> Response {
        let mta = self.session.mta();
        // SAFETY: resolve() bounds-checks addr/len against the region `ext` designates.
        let bytes = unsafe { self.addr_space.resolve(mta.ext, mta.addr, n as usize) };
        match bytes {
            Some(b) => {
                // Default to CRC32 when not otherwise negotiated; a full
                // implementation would let SET_REQUEST pick the type, which
                // is out of scope here.
                let value = checksum::compute(ChecksumType::Crc32, b);
                Response::res(&[
                    ChecksumType::Crc32 as u8,
                    0,
                    0,
                    (value & 0xFF) as u8,
                    ((value >> 8) & 0xFF) as u8,
                    ((value >> 16) & 0xFF) as u8,
                    ((value >> 24) & 0xFF) as u8,
                ])
            }
            None => Response::err(ErrorCode::AccessDenied),
        }
    }

    fn handle_get_cal_page(&self, segment: u8, mode: u8) -> Response {
        match self.instrumentation.get_cal_page(segment, mode) {
            Some(page) => Response::res(&[0, page]),
            None => Response::err(ErrorCode::SegmentNotValid),
        }
    }

    fn handle_set_cal_page(&self, mode: u8, segment: u8, page: u8) -> Response {
        match self.instrumentation.set_cal_page(segment, page, mode) {
            PageSetStatus::Ok => Response::res(&[]),
            PageSetStatus::Denied => Response::err(ErrorCode::AccessDenied),
            PageSetStatus::InvalidPage => Response::err(ErrorCode::PageNotValid),
            PageSetStatus::InvalidMode => Response::err(ErrorCode::PageModeNotValid),
        }
    }

    fn handle_get_daq_processor_info(&self) -> Response {
        let info = self.daq.processor_info();
        Response::res(&[
            0x01, // dynamic DAQ configuration
            (info.max_daq & 0xFF) as u8,
            (info.max_daq >> 8) as u8,
            (info.max_event & 0xFF) as u8,
            (info.max_event >> 8) as u8,
            0, // min daq, unused
            0x01, // key byte: standard identification field
        ])
    }

    fn handle_get_daq_resolution_info(&self) -> Response {
        let (ts_size, ts_unit) = match (self.clock.unit(), self.config.timestamp_size) {
            (crate::config::TimestampUnit::Nanoseconds, crate::config::TimestampSize::Bits32) => (4u8, 0u8),
            (crate::config::TimestampUnit::Nanoseconds, crate::config::TimestampSize::Bits64) => (8u8, 0u8),
            (crate::config::TimestampUnit::Microseconds, crate::config::TimestampSize::Bits32) => (4u8, 3u8),
            (crate::config::TimestampUnit::Microseconds, crate::config::TimestampSize::Bits64) => (8u8, 3u8),
        };
        Response::res(&[1, 1, 1, 1, ts_size, ts_unit, 1, 0])
    }

    fn handle_get_daq_event_info(&self, event: u16) -> Response {
        match self.daq.event_info(event) {
            Some(meta) => Response::res(&[
                0x01, // DAQ direction supported
                meta.name.len().min(255) as u8,
                (meta.cycle & 0xFF) as u8,
                (meta.cycle >> 8) as u8,
                meta.unit_exponent as u8,
                meta.priority,
            ]),
            None => Response::err(ErrorCode::OutOfRange),
        }
    }

    fn handle_write_daq(&self, entry: &WriteDaqEntry) -> Response {
        match self.daq.write_daq(entry.bit_offset, entry.size, entry.ext, entry.addr) {
            Ok(()) => Response::res(&[]),
            Err(e) => Response::err(daq_error_code(e)),
        }
    }

    fn handle_set_daq_list_mode(&self, mode: u8, daq: u16, event: u16, prescaler: u16, priority: u8) -> Response {
        if priority != 0 {
            return Response::err(ErrorCode::OutOfRange);
        }
        if self.daq.event_info(event).is_none() {
            return Response::err(ErrorCode::OutOfRange);
        }
        match self.daq.set_daq_list_mode(daq, mode, event, prescaler.max(1)) {
            Ok(()) => Response::res(&[]),
            Err(e) => Response::err(daq_error_code(e)),
        }
    }

    fn handle_get_daq_list_mode(&self, daq: u16) -> Response {
        match self.daq.daq_list_mode(daq) {
            Some((mode, event, prescaler, priority)) => {
                Response::res(&[mode, (event & 0xFF) as u8, (event >> 8) as u8, (prescaler & 0xFF) as u8, (prescaler >> 8) as u8, priority])
            }
            None => Response::err(ErrorCode::OutOfRange),
        }
    }

    fn handle_start_stop_daq_list(&self, mode: u8, daq: u16) -> Response {
        match mode {
            0 => match self.daq.stop_daq_list(daq) {
                Ok(()) => Response::res(&[]),
                Err(e) => Response::err(daq_error_code(e)),
            },
            1 => match self.daq.start_daq_list(daq) {
                Ok(first_pid) => Response::res(&[first_pid]),
                Err(e) => Response::err(daq_error_code(e)),
            },
            2 => match self.daq.select_daq_list(daq) {
                Ok(()) => Response::res(&[]),
                Err(e) => Response::err(daq_error_code(e)),
            },
            _ => Response::err(ErrorCode::OutOfRange),
        }
    }

    fn handle_start_stop_synch(&self, mode: u8) -> Response {
        if self.daq.allocated_daq_count() == 0 {
            return Response::err(ErrorCode::DaqConfig);
        }
        match mode {
            0 => {
                self.daq.stop_all();
                self.instrumentation.on_stop_daq();
                self.session.set_daq_running(false);
                Response::res(&[])
            }
            1 => {
                if self.instrumentation.on_prepare_daq() == Gate::Reject {
                    return Response::err(ErrorCode::AccessDenied);
                }
                self.daq.start_selected();
                self.instrumentation.on_start_daq();
                self.session.set_daq_running(true);
                Response::res(&[])
            }
            2 => {
                self.daq.stop_selected();
                Response::res(&[])
            }
            _ => Response::err(ErrorCode::OutOfRange),
        }
    }

    fn handle_get_daq_clock(&self) -> Response {
        let ticks = self.clock.now_ticks();
        match self.config.timestamp_size {
            crate::config::TimestampSize::Bits32 => {
                let t = ticks as u32;
                Response::res(&t.to_le_bytes())
            }
            crate::config::TimestampSize::Bits64 => Response::res(&ticks.to_le_bytes()),
        }
    }

    fn handle_time_correlation_properties(&self) -> Response {
        match self.instrumentation.clock_info_grandmaster() {
            Some(gm) => {
                let epoch_byte = match gm.epoch {
                    Epoch::Tai => 0,
                    Epoch::Utc => 1,
                    Epoch::Arbitrary => 2,
                };
                let mut out = vec![gm.stratum, epoch_byte];
                out.extend_from_slice(&gm.uuid);
                Response::res(&out)
            }
            None => Response::res(&[0xFF, 2]), // stratum 0xFF = free-running, arbitrary epoch
        }
    }
}

fn daq_error_code(e: DaqError) -> ErrorCode {
    match e {
        DaqError::Sequence => ErrorCode::Sequence,
        DaqError::Overflow => ErrorCode::MemoryOverflow,
        DaqError::OutOfRange => ErrorCode::OutOfRange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NullInstrumentation;
    use crate::config::XcpConfig;
    use crate::daq::DescriptorStore;
    use crate::registry::Registry;

    struct TestAddrSpace {
        mem: parking_lot::Mutex<Vec<u8>>,
    }
    impl AddressSpace for TestAddrSpace {
        fn base(&self) -> *const u8 {
            std::ptr::null()
        }
        unsafe fn resolve(&self, _ext: u8, addr: u32, len: usize) -> Option<&[u8]> {
            let mem = self.mem.lock();
            if (addr as usize) + len > mem.len() {
                return None;
            }
            Some(std::slice::from_raw_parts(mem.as_ptr().add(addr as usize), len))
        }
        unsafe fn resolve_mut(&self, _ext: u8, addr: u32, len: usize) -> Option<&mut [u8]> {
            let mut mem = self.mem.lock();
            if (addr as usize) + len > mem.len() {
                return None;
            }
            Some(std::slice::from_raw_parts_mut(mem.as_mut_ptr().add(addr as usize), len))
        }
    }

    fn setup() -> (Session, DescriptorStore, TestAddrSpace, NullInstrumentation, Clock, Registry, XcpConfig) {
        (
            Session::new(),
            DescriptorStore::new(4096, 256, 256),
            TestAddrSpace { mem: parking_lot::Mutex::new(vec![0xABu8; 4096]) },
            NullInstrumentation,
            Clock::new(crate::config::TimestampUnit::Microseconds),
            Registry::new(),
            XcpConfig::default(),
        )
    }

    fn test_src() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    #[test]
    fn connect_then_upload_reads_memory() {
        let (session, daq, addr_space, instr, clock, registry, config) = setup();
        let d = Dispatcher { session: &session, daq: &daq, addr_space: &addr_space, instrumentation: &instr, clock: &clock, registry: &registry, config: &config };

        let r = d.dispatch(test_src(), &[cmd::CONNECT, 0]).unwrap();
        assert_eq!(r.0[0], PID_RES);
        assert_eq!(r.0.len(), 8);
        assert_eq!(session.master_addr(), Some(test_src()));

        let mut set_mta = vec![cmd::SET_MTA, 0, 0, 0];
        set_mta.extend_from_slice(&0x10u32.to_le_bytes());
        let r = d.dispatch(test_src(), &set_mta).unwrap();
        assert_eq!(r.0[0], PID_RES);

        let r = d.dispatch(test_src(), &[cmd::UPLOAD, 4]).unwrap();
        assert_eq!(r.0, vec![PID_RES, 0xAB, 0xAB, 0xAB, 0xAB]);
    }

    #[test]
    fn commands_before_connect_are_dropped() {
        let (session, daq, addr_space, instr, clock, registry, config) = setup();
        let d = Dispatcher { session: &session, daq: &daq, addr_space: &addr_space, instrumentation: &instr, clock: &clock, registry: &registry, config: &config };
        assert!(d.dispatch(test_src(), &[cmd::GET_STATUS]).is_none());
    }

    #[test]
    fn upload_out_of_range_errors() {
        let (session, daq, addr_space, instr, clock, registry, config) = setup();
        let d = Dispatcher { session: &session, daq: &daq, addr_space: &addr_space, instrumentation: &instr, clock: &clock, registry: &registry, config: &config };
        d.dispatch(test_src(), &[cmd::CONNECT, 0]);
        let r = d.dispatch(test_src(), &[cmd::UPLOAD, 0xFF]).unwrap();
        assert_eq!(r.0, vec![PID_ERR, ErrorCode::OutOfRange as u8]);
    }

    #[test]
    fn sync_always_errs_with_cmd_synch() {
        let (session, daq, addr_space, instr, clock, registry, config) = setup();
        let d = Dispatcher { session: &session, daq: &daq, addr_space: &addr_space, instrumentation: &instr, clock: &clock, registry: &registry, config: &config };
        d.dispatch(test_src(), &[cmd::CONNECT, 0]);
        let r = d.dispatch(test_src(), &[cmd::SYNCH]).unwrap();
        assert_eq!(r.0, vec![PID_ERR, ErrorCode::CmdSynch as u8]);
    }

    #[test]
    fn disconnect_stops_running_daq_lists() {
        let (session, daq, addr_space, instr, clock, registry, config) = setup();
        let d = Dispatcher { session: &session, daq: &daq, addr_space: &addr_space, instrumentation: &instr, clock: &clock, registry: &registry, config: &config };
        d.dispatch(test_src(), &[cmd::CONNECT, 0]);

        daq.alloc_daq(1).unwrap();
        daq.alloc_odt(0, 1).unwrap();
        daq.alloc_odt_entry(0, 0, 1).unwrap();
        daq.set_daq_ptr(0, 0, 0).unwrap();
        daq.write_daq(0, 4, 0, 0x10).unwrap();
        daq.set_daq_list_mode(0, 0, 0, 1).unwrap();
        daq.start_daq_list(0).unwrap();

        let r = d.dispatch(test_src(), &[cmd::DISCONNECT]).unwrap();
        assert_eq!(r.0, vec![PID_RES]);
        assert!(!session.status().contains(crate::session::XcpSessionStatus::CONNECTED));

        let queue = crate::transport::queue::TransmitQueue::new(4, 256, 4);
        crate::daq::trigger_event(&daq, &addr_space, &clock, &queue, 0, std::ptr::null());
        assert!(queue.is_empty(), "a list left RUNNING across DISCONNECT would keep sampling and never go idle");
    }

    #[test]
    fn reconnect_after_disconnect_renegotiates_cleanly() {
        let (session, daq, addr_space, instr, clock, registry, config) = setup();
        let d = Dispatcher { session: &session, daq: &daq, addr_space: &addr_space, instrumentation: &instr, clock: &clock, registry: &registry, config: &config };
        let first = d.dispatch(test_src(), &[cmd::CONNECT, 0]).unwrap();
        d.dispatch(test_src(), &[cmd::DISCONNECT]);
        let second = d.dispatch(test_src(), &[cmd::CONNECT, 0]).unwrap();
        assert_eq!(first.0, second.0, "negotiated CONNECT response must be identical across reconnects");
    }
}
