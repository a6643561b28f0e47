//! Process-scoped configuration, collecting every option named in the
//! external-interfaces table: `max_cto`, `max_dto`, segment/queue
//! sizing, alignment, arena capacity, event capacity, timestamp
//! format, transport selection and bind address, and the transmit
//! worker's flush cycle.

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct XcpConfig {
    /// Maximum command/response payload. Must be >= 8.
    pub max_cto: u8,
    /// Maximum DAQ packet payload. Must be >= 8.
    pub max_dto: u16,
    /// Transport segment byte capacity (UDP MTU or TCP flush size).
    pub segment_size: u16,
    /// Ring capacity in segments.
    pub queue_depth: usize,
    /// Alignment in bytes between concatenated messages in a segment: 1, 2, or 4.
    pub alignment: u8,
    /// Descriptor store (DAQ/ODT/entry arena) capacity in bytes.
    pub arena_bytes: usize,
    /// Upper bound on event count.
    pub max_events: usize,
    /// Clock tick unit.
    pub timestamp_unit: TimestampUnit,
    /// Timestamp width carried in DAQ packets.
    pub timestamp_size: TimestampSize,
    pub enable_tcp: bool,
    pub enable_udp: bool,
    pub enable_multicast: bool,
    /// IPv4 bind address, `0.0.0.0` meaning any.
    pub bind_addr: std::net::Ipv4Addr,
    pub bind_port: u16,
    /// Periodic flush timeout for the transmit worker.
    pub flush_cycle_ms: u64,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampUnit {
    Nanoseconds,
    Microseconds,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSize {
    Bits32,
    Bits64,
}

impl Default for XcpConfig {
    fn default() -> Self {
        XcpConfig {
            max_cto: 0xFC,
            max_dto: 1480,
            segment_size: 1500,
            queue_depth: 64,
            alignment: 4,
            arena_bytes: 64 * 1024,
            max_events: 256,
            timestamp_unit: TimestampUnit::Microseconds,
            timestamp_size: TimestampSize::Bits32,
            enable_tcp: false,
            enable_udp: true,
            enable_multicast: false,
            bind_addr: std::net::Ipv4Addr::UNSPECIFIED,
            bind_port: 5555,
            flush_cycle_ms: 50,
        }
    }
}

impl XcpConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_cto < 8 {
            return Err(crate::error::XcpError::Config("max_cto must be >= 8".into()));
        }
        if self.max_dto < 8 {
            return Err(crate::error::XcpError::Config("max_dto must be >= 8".into()));
        }
        if !matches!(self.alignment, 1 | 2 | 4) {
            return Err(crate::error::XcpError::Config("alignment must be 1, 2 or 4".into()));
        }
        if self.segment_size as usize <= (self.max_dto as usize + 4) {
            return Err(crate::error::XcpError::Config("segment_size too small for max_dto".into()));
        }
        if !self.enable_tcp && !self.enable_udp {
            return Err(crate::error::XcpError::Config("at least one of enable_tcp/enable_udp must be set".into()));
        }
        Ok(())
    }
}
