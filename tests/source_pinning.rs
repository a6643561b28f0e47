//! Source pinning on UDP: once a master is pinned by its first CONNECT,
//! traffic from any other source is rejected and tears the session
//! down without a reply.

use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use xcp::transport::server::frame_message;
use xcp::{AddressSpace, XcpBuilder, XcpConfig};

const CONNECT: u8 = 0xFF;
const GET_STATUS: u8 = 0xFD;

struct EmptyMemory;

impl AddressSpace for EmptyMemory {
    fn base(&self) -> *const u8 {
        std::ptr::null()
    }
    unsafe fn resolve(&self, _ext: u8, _addr: u32, _len: usize) -> Option<&[u8]> {
        None
    }
    unsafe fn resolve_mut(&self, _ext: u8, _addr: u32, _len: usize) -> Option<&mut [u8]> {
        None
    }
}

fn recv_one(client: &UdpSocket) -> Option<Vec<u8>> {
    let mut buf = [0u8; 256];
    match client.recv(&mut buf) {
        Ok(n) if n > 0 => Some(buf[..n].to_vec()),
        _ => None,
    }
}

#[test]
fn second_source_is_rejected_and_session_torn_down() {
    let config = XcpConfig { bind_addr: Ipv4Addr::LOCALHOST, bind_port: 55602, ..XcpConfig::default() };
    let _xcp = XcpBuilder::new("source_pinning_test").config(config).build_minimal(std::sync::Arc::new(EmptyMemory)).expect("server failed to start");

    let master = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    master.connect((Ipv4Addr::LOCALHOST, 55602)).unwrap();
    master.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    master.send(&frame_message(&[CONNECT, 0], 0)).unwrap();
    let reply = recv_one(&master).expect("first CONNECT must be accepted");
    assert!(reply.len() > 4, "expected a framed CONNECT response");

    let impostor = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    impostor.connect((Ipv4Addr::LOCALHOST, 55602)).unwrap();
    impostor.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    impostor.send(&frame_message(&[GET_STATUS], 0)).unwrap();
    assert!(recv_one(&impostor).is_none(), "an unpinned source must get no reply at all");

    // The pinned master's session was torn down as a side effect of
    // the impostor's datagram, so a non-CONNECT command from the
    // master now goes unanswered too.
    master.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    master.send(&frame_message(&[GET_STATUS], 1)).unwrap();
    assert!(recv_one(&master).is_none(), "session must be disconnected after the spoofed source was rejected");

    // A fresh CONNECT from the original master succeeds again.
    master.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    master.send(&frame_message(&[CONNECT, 0], 2)).unwrap();
    let reply = recv_one(&master).expect("reconnect must succeed after teardown");
    assert!(reply.len() > 4);
}
