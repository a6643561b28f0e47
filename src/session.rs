//! Process-wide session state: connection status, negotiated protocol
//! parameters, and the MTA (memory-transfer-address) cursor used by
//! SET_MTA/UPLOAD/DOWNLOAD.

use bitflags::bitflags;
use parking_lot::Mutex;

bitflags! {
    /// Session status bits reported by GET_STATUS.
    ///
    /// `CONNECTED` and `DAQ_RUNNING` come from the distilled spec;
    /// `INITIALIZED` and `STARTED` are carried over from the C
    /// original's `SS_INITIALIZED`/`SS_STARTED` bits, which the
    /// distillation didn't name but GET_STATUS's single status byte
    /// needs to report meaningfully.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct XcpSessionStatus: u8 {
        const INITIALIZED = 0x01;
        const CONNECTED   = 0x02;
        const DAQ_RUNNING = 0x04;
        const STARTED     = 0x08;
        const RESUME      = 0x10;
    }
}

/// Memory-transfer-address cursor, owned solely by the protocol state
/// machine (never touched from the DAQ sampler or transport workers).
#[derive(Debug, Clone, Copy, Default)]
pub struct Mta {
    pub ext: u8,
    pub addr: u32,
}

impl Mta {
    pub fn advance(&mut self, n: u32) {
        self.addr = self.addr.wrapping_add(n);
    }
}

/// Resource bitmask advertised at CONNECT (CAL/PAG, DAQ, STIM, PGM).
bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ResourceMask: u8 {
        const CAL_PAG = 0x01;
        const DAQ     = 0x04;
        const STIM    = 0x08;
        const PGM     = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Single process-wide state: connection status, negotiated version,
/// advertised resources, last error, and the MTA cursor.
pub struct Session {
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    state: ConnectionState,
    status: XcpSessionStatus,
    resources: ResourceMask,
    protocol_version: u8,
    transport_version: u8,
    mta: Mta,
    last_error: Option<u8>,
    master_addr: Option<std::net::SocketAddr>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            inner: Mutex::new(SessionInner {
                state: ConnectionState::Disconnected,
                status: XcpSessionStatus::INITIALIZED,
                resources: ResourceMask::CAL_PAG | ResourceMask::DAQ,
                protocol_version: 0x01,
                transport_version: 0x01,
                mta: Mta::default(),
                last_error: None,
                master_addr: None,
            })
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().state == ConnectionState::Connected
    }

    pub fn daq_running(&self) -> bool {
        self.inner.lock().status.contains(XcpSessionStatus::DAQ_RUNNING)
    }

    pub fn status(&self) -> XcpSessionStatus {
        self.inner.lock().status
    }

    pub fn resources(&self) -> ResourceMask {
        self.inner.lock().resources
    }

    pub fn protocol_version(&self) -> u8 {
        self.inner.lock().protocol_version
    }

    pub fn transport_version(&self) -> u8 {
        self.inner.lock().transport_version
    }

    /// Marks the session connected. Returns whether a resume bit was
    /// already set (in which case DAQ state should not be reset).
    pub fn connect(&self, master_addr: Option<std::net::SocketAddr>) -> bool {
        let mut inner = self.inner.lock();
        let resume = inner.status.contains(XcpSessionStatus::RESUME);
        inner.state = ConnectionState::Connected;
        inner.status.insert(XcpSessionStatus::CONNECTED | XcpSessionStatus::STARTED);
        inner.master_addr = master_addr;
        resume
    }

    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Disconnected;
        inner.status.remove(XcpSessionStatus::CONNECTED | XcpSessionStatus::DAQ_RUNNING);
        inner.master_addr = None;
    }

    pub fn set_daq_running(&self, running: bool) {
        let mut inner = self.inner.lock();
        inner.status.set(XcpSessionStatus::DAQ_RUNNING, running);
    }

    pub fn master_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.lock().master_addr
    }

    pub fn set_last_error(&self, code: u8) {
        self.inner.lock().last_error = Some(code);
    }

    pub fn mta(&self) -> Mta {
        self.inner.lock().mta
    }

    pub fn set_mta(&self, mta: Mta) {
        self.inner.lock().mta = mta;
    }

    pub fn advance_mta(&self, n: u32) {
        self.inner.lock().mta.advance(n);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_disconnect_round_trip() {
        let s = Session::new();
        assert!(!s.is_connected());
        s.connect(None);
        assert!(s.is_connected());
        assert!(s.status().contains(XcpSessionStatus::CONNECTED));
        s.disconnect();
        assert!(!s.is_connected());
        // A second connect must negotiate identical values (no state carried over).
        s.connect(None);
        assert!(s.is_connected());
        assert!(!s.daq_running());
    }

    #[test]
    fn mta_advances() {
        let s = Session::new();
        s.set_mta(Mta { ext: 0, addr: 0x1000 });
        s.advance_mta(4);
        assert_eq!(s.mta().addr, 0x1004);
    }
}
