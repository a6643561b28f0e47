// hello_xcp — a minimal XCP-instrumented application: one calibration
// segment, one periodic measurement, served over UDP or TCP.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::info;
use parking_lot::Mutex;

use xcp::address::{Gate, PageSetStatus, XCP_ADDR_EXT_APP};
use xcp::{AddressSpace, CalSeg, Instrumentation, XcpBuilder, XcpConfig};

#[derive(Debug, Clone, Copy)]
struct CalPage {
    max: u16,
    min: u16,
    delay_us: u32,
}

const CAL_PAGE: CalPage = CalPage { min: 0, max: 100, delay_us: 100_000 };

#[derive(Parser, Debug)]
#[command(version, about = "hello_xcp: minimal XCP-on-Ethernet demo server")]
struct Args {
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Bind address, default is ANY
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: std::net::Ipv4Addr,

    /// Use TCP as transport layer, default is UDP
    #[arg(short, long, default_value_t = false)]
    tcp: bool,

    /// Port number
    #[arg(short, long, default_value_t = 5555)]
    port: u16,

    /// Application name, echoed back through GET_ID
    #[arg(short, long, default_value = "hello_xcp")]
    name: String,
}

/// Selects which `CalSeg` page (0 = ECU/working, 1 = XCP/reference)
/// GET_CAL_PAGE/SET_CAL_PAGE report/select. Shared with
/// `CalPageAddressSpace` only for reporting; resolve() always targets
/// the XCP page regardless of the selector, same as a real ECU's
/// master-writable memory.
struct CalPageInstrumentation {
    segment_index: u8,
    active_page: Arc<AtomicU8>,
}

impl Instrumentation for CalPageInstrumentation {
    fn on_connect(&self) -> Gate {
        Gate::Accept
    }

    fn get_cal_page(&self, segment: u8, _mode: u8) -> Option<u8> {
        if segment != self.segment_index {
            return None;
        }
        Some(self.active_page.load(Ordering::Relaxed))
    }

    fn set_cal_page(&self, segment: u8, page: u8, _mode: u8) -> PageSetStatus {
        if segment != self.segment_index {
            return PageSetStatus::InvalidPage;
        }
        if page > 1 {
            return PageSetStatus::InvalidPage;
        }
        self.active_page.store(page, Ordering::Relaxed);
        PageSetStatus::Ok
    }
}

/// Resolves calibration-segment addresses (`XCP_ADDR_EXT_APP`) for
/// SET_MTA/UPLOAD/DOWNLOAD/BUILD_CHECKSUM. Holds only the XCP
/// (master-writable) page's own `Mutex` handle — not the `CalSeg`
/// itself, which isn't `Sync` — so this can be shared with the
/// transport/protocol thread while the application thread keeps its
/// own `CalSeg` for `sync()`/`Deref` reads.
struct CalPageAddressSpace {
    page: Arc<Mutex<CalPage>>,
}

impl AddressSpace for CalPageAddressSpace {
    fn base(&self) -> *const u8 {
        std::ptr::null()
    }

    unsafe fn resolve(&self, ext: u8, addr: u32, len: usize) -> Option<&[u8]> {
        let size = std::mem::size_of::<CalPage>();
        if ext != XCP_ADDR_EXT_APP || (addr as usize) + len > size {
            return None;
        }
        let guard = self.page.lock();
        let ptr = &*guard as *const CalPage as *const u8;
        Some(std::slice::from_raw_parts(ptr.add(addr as usize), len))
    }

    unsafe fn resolve_mut(&self, ext: u8, addr: u32, len: usize) -> Option<&mut [u8]> {
        let size = std::mem::size_of::<CalPage>();
        if ext != XCP_ADDR_EXT_APP || (addr as usize) + len > size {
            return None;
        }
        let mut guard = self.page.lock();
        let ptr = &mut *guard as *mut CalPage as *mut u8;
        Some(std::slice::from_raw_parts_mut(ptr.add(addr as usize), len))
    }
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::new().filter_level(args.log_level.parse().unwrap_or(log::LevelFilter::Info)).init();

    info!("{}: starting on {}:{} ({})", args.name, args.bind, args.port, if args.tcp { "TCP" } else { "UDP" });

    let cal_seg = CalSeg::new("cal_page", 0, CAL_PAGE);
    let active_page = Arc::new(AtomicU8::new(0));

    let instrumentation = Arc::new(CalPageInstrumentation { segment_index: cal_seg.index(), active_page: active_page.clone() });
    let addr_space = Arc::new(CalPageAddressSpace { page: cal_seg.xcp_page_handle() });

    let config = XcpConfig { enable_tcp: args.tcp, enable_udp: !args.tcp, bind_addr: args.bind, bind_port: args.port, ..XcpConfig::default() };

    let _xcp = XcpBuilder::new(args.name).config(config).build(instrumentation, addr_space).expect("xcp server failed to start");

    let mut daq_event: xcp::DaqEvent<8> = xcp::DaqEvent::new("mainloop");
    let mut counter: u16 = cal_seg.min;

    loop {
        counter += 1;
        if counter > cal_seg.max {
            counter = cal_seg.min;
        }

        xcp::daq_register!(daq_event, counter);
        daq_event.trigger();

        cal_seg.sync();
        thread::sleep(Duration::from_micros(cal_seg.delay_us as u64));
    }
}
