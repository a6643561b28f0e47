//! The transport server: UDP or TCP receive/transmit worker threads.
//!
//! Grounded in the original `xcpTl.c` thread structure (one receive
//! loop dispatching into the protocol state machine, one transmit
//! loop draining the segment queue on a timeout so partial segments
//! age out even under sparse sampling).

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use super::queue::{DrainResult, TransmitQueue};
use super::{FrameHeader, HEADER_SIZE};

/// Callbacks the transport layer drives; implemented by the protocol
/// dispatcher (kept as a trait so this module has no dependency on
/// the rest of the crate).
pub trait Receiver: Send + Sync {
    /// One fully-framed XCP message payload (post header-strip), with
    /// the peer address it arrived from (used to pin the master on
    /// the first CONNECT).
    fn on_message(&self, src: SocketAddr, payload: &[u8]);

    /// Whether `src` is allowed to be, or remain, the pinned master.
    /// The first accepted source becomes pinned; subsequent calls
    /// from a different source while one is already pinned must
    /// return `false`.
    fn accept_source(&self, src: SocketAddr) -> bool;

    /// Invoked after a source is rejected, or on TCP client close —
    /// tear the session down.
    fn on_session_lost(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Udp,
    Tcp,
}

enum Endpoint {
    Udp { socket: Arc<UdpSocket>, peer: Mutex<Option<SocketAddr>> },
    Tcp { stream: Mutex<Option<TcpStream>> },
}

impl Endpoint {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Endpoint::Udp { socket, peer } => {
                if let Some(addr) = *peer.lock().unwrap() {
                    socket.send_to(bytes, addr).map(|_| ())
                } else {
                    Ok(())
                }
            }
            Endpoint::Tcp { stream } => {
                let mut guard = stream.lock().unwrap();
                if let Some(s) = guard.as_mut() {
                    s.write_all(bytes)
                } else {
                    Ok(())
                }
            }
        }
    }
}

pub struct TransportServer {
    endpoint: Arc<Endpoint>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl TransportServer {
    /// Binds a UDP socket and spawns the receive and transmit workers.
    ///
    /// `receiver` is `&'static` rather than `Arc` because the protocol
    /// dispatcher is the process-wide `Xcp` singleton, not a
    /// heap-allocated per-instance object.
    pub fn start_udp(
        bind_addr: std::net::Ipv4Addr,
        bind_port: u16,
        queue: Arc<TransmitQueue>,
        receiver: &'static dyn Receiver,
        flush_cycle: Duration,
    ) -> io::Result<TransportServer> {
        let socket = UdpSocket::bind((bind_addr, bind_port))?;
        socket.set_read_timeout(Some(flush_cycle))?;
        let socket = Arc::new(socket);
        let endpoint = Arc::new(Endpoint::Udp { socket: socket.clone(), peer: Mutex::new(None) });
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        handles.push(spawn_udp_receive(socket, endpoint.clone(), receiver, shutdown.clone()));
        handles.push(spawn_transmit(queue, endpoint.clone(), flush_cycle, shutdown.clone()));

        info!("xcp: udp transport listening on {}:{}", bind_addr, bind_port);
        Ok(TransportServer { endpoint, shutdown, handles })
    }

    /// Binds a TCP listener and spawns the accept/receive and
    /// transmit workers. Serves exactly one client at a time.
    pub fn start_tcp(
        bind_addr: std::net::Ipv4Addr,
        bind_port: u16,
        queue: Arc<TransmitQueue>,
        receiver: &'static dyn Receiver,
        flush_cycle: Duration,
    ) -> io::Result<TransportServer> {
        let listener = TcpListener::bind((bind_addr, bind_port))?;
        let endpoint = Arc::new(Endpoint::Tcp { stream: Mutex::new(None) });
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        handles.push(spawn_tcp_accept(listener, endpoint.clone(), receiver, shutdown.clone()));
        handles.push(spawn_transmit(queue, endpoint.clone(), flush_cycle, shutdown.clone()));

        info!("xcp: tcp transport listening on {}:{}", bind_addr, bind_port);
        Ok(TransportServer { endpoint, shutdown, handles })
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn spawn_udp_receive(socket: Arc<UdpSocket>, endpoint: Arc<Endpoint>, receiver: &'static dyn Receiver, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = vec![0u8; 65536];
        while !shutdown.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((n, src)) => {
                    if !receiver.accept_source(src) {
                        warn!("xcp: rejecting datagram from unpinned source {}", src);
                        receiver.on_session_lost();
                        if let Endpoint::Udp { peer, .. } = endpoint.as_ref() {
                            *peer.lock().unwrap() = None;
                        }
                        continue;
                    }
                    if let Endpoint::Udp { peer, .. } = endpoint.as_ref() {
                        *peer.lock().unwrap() = Some(src);
                    }
                    dispatch_frames(src, &buf[..n], receiver);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    warn!("xcp: udp receive error: {}", e);
                    receiver.on_session_lost();
                }
            }
        }
    })
}

fn spawn_tcp_accept(listener: TcpListener, endpoint: Arc<Endpoint>, receiver: &'static dyn Receiver, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        listener.set_nonblocking(true).ok();
        while !shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, src)) => {
                    if !receiver.accept_source(src) {
                        continue;
                    }
                    stream.set_nonblocking(false).ok();
                    if let Endpoint::Tcp { stream: slot } = endpoint.as_ref() {
                        *slot.lock().unwrap() = Some(stream.try_clone().expect("tcp clone"));
                    }
                    serve_tcp_client(stream, src, receiver, &shutdown);
                    if let Endpoint::Tcp { stream: slot } = endpoint.as_ref() {
                        *slot.lock().unwrap() = None;
                    }
                    receiver.on_session_lost();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    warn!("xcp: tcp accept error: {}", e);
                }
            }
        }
    })
}

fn serve_tcp_client(mut stream: TcpStream, src: SocketAddr, receiver: &dyn Receiver, shutdown: &AtomicBool) {
    stream.set_read_timeout(Some(Duration::from_millis(200))).ok();
    let mut acc = Vec::new();
    let mut buf = [0u8; 4096];
    while !shutdown.load(Ordering::Relaxed) {
        match stream.read(&mut buf) {
            Ok(0) => break, // client closed
            Ok(n) => {
                acc.extend_from_slice(&buf[..n]);
                loop {
                    match super::split_one(&acc) {
                        Some((header, payload, _)) => {
                            receiver.on_message(src, payload);
                            let consumed = HEADER_SIZE + header.len as usize;
                            acc.drain(..consumed);
                        }
                        None => break,
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => continue,
            Err(_) => break,
        }
    }
}

fn dispatch_frames(src: SocketAddr, mut buf: &[u8], receiver: &dyn Receiver) {
    loop {
        match super::split_one(buf) {
            Some((_header, payload, rest)) => {
                receiver.on_message(src, payload);
                buf = rest;
            }
            None => {
                if !buf.is_empty() {
                    debug!("xcp: dropping {} trailing bytes of a partial datagram message", buf.len());
                }
                break;
            }
        }
    }
}

fn spawn_transmit(queue: Arc<TransmitQueue>, endpoint: Arc<Endpoint>, flush_cycle: Duration, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            let mut drained_any = false;
            loop {
                match queue.drain_one(|bytes| endpoint.send(bytes)) {
                    DrainResult::Sent(_) => drained_any = true,
                    DrainResult::Empty | DrainResult::WouldBlock => break,
                }
            }
            if !drained_any {
                // Idle poll: nothing was ready to send. Force the
                // current write segment to rotate so a partially-filled
                // segment doesn't sit unsent indefinitely waiting for
                // more data to arrive and fill it.
                queue.flush();
                std::thread::sleep(flush_cycle);
            }
        }
    })
}

/// Encodes `payload` as one framed message with header `ctr` and
/// returns the full bytes (header + payload, no fill). Test/demo
/// helper matching the wire format in [`FrameHeader`].
pub fn frame_message(payload: &[u8], ctr: u16) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_SIZE];
    FrameHeader { len: payload.len() as u16, ctr }.encode(&mut out);
    out.extend_from_slice(payload);
    out
}
