//! `xcp` — a server-side (ECU-side) runtime for XCP, the ASAM
//! Universal Measurement and Calibration Protocol, over Ethernet.
//!
//! An embedding application builds the process-wide [`xcp::Xcp`]
//! singleton through [`xcp::XcpBuilder`], supplying an
//! [`address::AddressSpace`] (how calibration-segment addresses
//! resolve to bytes) and an [`address::Instrumentation`] (connect/DAQ
//! lifecycle hooks and calibration page switching). It then creates
//! [`daq::event::XcpEvent`]s at its measurement points and calls
//! `trigger()`/`trigger_ext()` from application code; an external XCP
//! client (CANape or similar) connects over the configured UDP/TCP
//! transport, configures DAQ lists, and receives the resulting
//! timestamped sample stream.
//!
//! Out of scope, by design (see `SPEC_FULL.md` §1): A2L
//! description-file generation (this crate exposes [`registry::Registry`]
//! as the metadata an external A2L writer would consume), seed-and-key
//! authentication, flash programming, block upload/download,
//! interleaved command mode, resume-mode DAQ persistence, and
//! DAQ-list prioritization.

pub mod address;
pub mod cal;
pub mod clock;
pub mod config;
pub mod daq;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod xcp;

pub use address::{AddressSpace, Gate, Instrumentation, NullInstrumentation, PageSetStatus};
pub use cal::{CalSeg, CalSegPersistence};
pub use config::XcpConfig;
pub use daq::event::{DaqEvent, XcpEvent};
pub use error::{Result, XcpError};
pub use session::XcpSessionStatus;
pub use xcp::{Xcp, XcpBuilder};
