//! End-to-end loopback wire-protocol tests: a real `UdpSocket` client
//! speaks the framing from the transport layer directly against a
//! server built through the public `XcpBuilder` API. Stands in for the
//! teacher's separate `xcp_client` test-master crate.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

use xcp::address::XCP_ADDR_EXT_ABS;
use xcp::transport::server::frame_message;
use xcp::transport::split_one;
use xcp::{AddressSpace, Xcp, XcpBuilder, XcpConfig};

const PID_RES: u8 = 0xFF;

const CONNECT: u8 = 0xFF;
const SET_MTA: u8 = 0xF6;
const UPLOAD: u8 = 0xF5;
const GET_DAQ_CLOCK: u8 = 0xDC;
const ALLOC_DAQ: u8 = 0xD5;
const ALLOC_ODT: u8 = 0xD4;
const ALLOC_ODT_ENTRY: u8 = 0xD3;
const SET_DAQ_PTR: u8 = 0xE2;
const WRITE_DAQ: u8 = 0xE1;
const SET_DAQ_LIST_MODE: u8 = 0xE0;
const START_STOP_DAQ_LIST: u8 = 0xDE;
const START_STOP_SYNCH: u8 = 0xDD;

struct FlatMemory(Mutex<Vec<u8>>);

impl AddressSpace for FlatMemory {
    fn base(&self) -> *const u8 {
        std::ptr::null()
    }

    unsafe fn resolve(&self, _ext: u8, addr: u32, len: usize) -> Option<&[u8]> {
        let mem = self.0.lock().unwrap();
        if (addr as usize) + len > mem.len() {
            return None;
        }
        Some(std::slice::from_raw_parts(mem.as_ptr().add(addr as usize), len))
    }

    unsafe fn resolve_mut(&self, _ext: u8, addr: u32, len: usize) -> Option<&mut [u8]> {
        let mut mem = self.0.lock().unwrap();
        if (addr as usize) + len > mem.len() {
            return None;
        }
        Some(std::slice::from_raw_parts_mut(mem.as_mut_ptr().add(addr as usize), len))
    }
}

/// Reads every framed message out of one datagram.
fn frames_in(datagram: &[u8]) -> Vec<(u16, Vec<u8>)> {
    let mut out = Vec::new();
    let mut rest = datagram;
    while let Some((header, payload, tail)) = split_one(rest) {
        out.push((header.ctr, payload.to_vec()));
        rest = tail;
    }
    out
}

/// Collects `want` framed messages from `client`, across as many
/// datagrams as it takes, within a generous overall timeout.
fn recv_frames(client: &UdpSocket, want: usize) -> Vec<(u16, Vec<u8>)> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    while collected.len() < want {
        let n = client.recv(&mut buf).expect("expected a reply datagram");
        collected.extend(frames_in(&buf[..n]));
    }
    collected
}

#[test]
fn connect_daq_and_clock_scenarios() {
    let mem = (0u8..=255).cycle().take(0x4000).collect::<Vec<u8>>();
    let addr_space = std::sync::Arc::new(FlatMemory(Mutex::new(mem.clone())));

    let config = XcpConfig { bind_addr: Ipv4Addr::LOCALHOST, bind_port: 55601, ..XcpConfig::default() };
    let _xcp = XcpBuilder::new("wire_protocol_test").config(config).build_minimal(addr_space).expect("server failed to start");

    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    client.connect((Ipv4Addr::LOCALHOST, 55601)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let mut ctr = 0u16;
    let mut send = |payload: &[u8]| {
        let frame = frame_message(payload, ctr);
        ctr = ctr.wrapping_add(1);
        client.send(&frame).unwrap();
    };

    // Scenario 1: simple connect and upload.
    send(&[CONNECT, 0]);
    let replies = recv_frames(&client, 1);
    assert_eq!(replies[0].1[0], PID_RES);
    assert_eq!(replies[0].1.len(), 8, "CONNECT response is 8 bytes: resource, comm_basic, max_cto, max_dto(2), protocol, transport");

    let mut set_mta = vec![SET_MTA, 0, 0, XCP_ADDR_EXT_ABS];
    set_mta.extend_from_slice(&0x1000u32.to_le_bytes());
    send(&set_mta);
    let replies = recv_frames(&client, 1);
    assert_eq!(replies[0].1, vec![PID_RES]);

    send(&[UPLOAD, 4]);
    let replies = recv_frames(&client, 1);
    assert_eq!(&replies[0].1[1..], &mem[0x1000..0x1004]);

    // Scenario 2: DAQ setup and one trigger.
    let event = Xcp::get().create_event("wire_protocol_evt", 0, 0, 0);

    send(&[ALLOC_DAQ, 0, 1, 0]);
    recv_frames(&client, 1);
    send(&[ALLOC_ODT, 0, 0, 0, 1]);
    recv_frames(&client, 1);
    send(&[ALLOC_ODT_ENTRY, 0, 0, 0, 0, 1]);
    recv_frames(&client, 1);
    send(&[SET_DAQ_PTR, 0, 0, 0, 0]);
    recv_frames(&client, 1);

    let mut write_daq = vec![WRITE_DAQ, 0, 4, XCP_ADDR_EXT_ABS];
    write_daq.extend_from_slice(&0x2000u32.to_le_bytes());
    send(&write_daq);
    recv_frames(&client, 1);

    let mut set_mode = vec![SET_DAQ_LIST_MODE, 0x10 /* TIMESTAMP */, 0, 0];
    set_mode.extend_from_slice(&event.id().to_le_bytes());
    set_mode.extend_from_slice(&[1, 0]); // prescaler, priority
    send(&set_mode);
    recv_frames(&client, 1);

    send(&[START_STOP_DAQ_LIST, 1, 0, 0]);
    let replies = recv_frames(&client, 1);
    assert_eq!(replies[0].1[1], 0, "first_pid for the only allocated ODT is 0");

    send(&[START_STOP_SYNCH, 1]);
    recv_frames(&client, 1);

    event.trigger();

    let replies = recv_frames(&client, 1);
    let daq_packet = &replies[0].1;
    assert_eq!(daq_packet[0] & 0x7F, 0, "PID is the absolute ODT number, overrun bit clear");
    assert_eq!(&daq_packet[5..9], &mem[0x2000..0x2004], "sampled bytes follow the 4-byte timestamp");

    // Scenario 4: counter monotonicity across interleaved responses and DAQ data.
    let mut seen_ctrs = Vec::new();
    for i in 0..6 {
        if i % 2 == 0 {
            send(&[GET_DAQ_CLOCK]);
        } else {
            event.trigger();
        }
        let frames = recv_frames(&client, 1);
        seen_ctrs.push(frames[0].0);
    }
    for w in seen_ctrs.windows(2) {
        assert_ne!(w[0], w[1], "message counters must never repeat");
    }
}
