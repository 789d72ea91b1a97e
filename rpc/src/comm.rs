//! TCP mesh communication layer.
//!
//! every process listens on its machine-list address and dials every
//! peer, so each ordered pair `(src, dst)` owns one socket carrying
//! `src`'s packets to `dst`. the first four bytes on a new connection
//! are the initiator's procid in network order; no further handshake.
//!
//! writes go through [`send`]/[`send2`] from the owning sender's I/O
//! thread; reads happen on one dedicated receive thread per inbound
//! socket, feeding that source's [`PacketAssembler`]. the accept loop
//! polls a non-blocking listener against the shutdown flag so `close`
//! can stop it without signals.
//!
//! [`send`]: TcpComm::send
//! [`send2`]: TcpComm::send2

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::receiver::PacketAssembler;
use crate::ProcId;
use log::{error, info, warn};
use plexus_cpu::{AtomicCounter, ThreadGroup};
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// capability flag: the transport is stream-oriented.
pub const COMM_STREAM: usize = 1;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_CHUNK: usize = 64 * 1024;

/// write-side contract the senders program against.
pub trait CommLayer: Send + Sync {
    /// blocking send of one buffer; loops over partial writes.
    fn send(&self, target: ProcId, buf: &[u8]) -> Result<()>;

    /// gather send of two buffers in one kernel call where possible;
    /// used to ship a header and its payload without concatenating.
    fn send2(&self, target: ProcId, buf1: &[u8], buf2: &[u8]) -> Result<()>;

    fn channel_active(&self, target: ProcId) -> bool;

    fn capabilities(&self) -> usize;
}

pub struct TcpComm {
    self_id: ProcId,
    nprocs: u32,
    nodelay: bool,
    socket_buffer_size: usize,

    /// outbound socket per peer; the peer's index in the machine list.
    /// exclusively written by that peer's sender I/O thread.
    out_socks: Vec<Mutex<Option<TcpStream>>>,
    /// clones of the inbound sockets, kept so close() can force the
    /// receive threads out of blocking reads.
    in_socks: Vec<Mutex<Option<TcpStream>>>,
    active: Vec<AtomicBool>,

    network_bytes_sent: AtomicCounter,
    network_bytes_received: Arc<AtomicCounter>,

    shutdown: AtomicBool,
    closed: AtomicBool,

    /// assemblers waiting for their source to dial in; taken by the
    /// accept loop when the inbound handshake identifies the peer.
    pending_assemblers: Mutex<Vec<Option<PacketAssembler>>>,
    inbound_count: Mutex<usize>,
    inbound_cv: Condvar,

    accept_thread: Mutex<Option<JoinHandle<()>>>,
    recv_threads: Mutex<ThreadGroup>,
}

impl TcpComm {
    /// collective mesh construction. binds the listener, dials every
    /// peer with a bounded retry budget, and returns only once every
    /// peer has dialed in and identified itself.
    ///
    /// `assemblers[src]` receives the byte stream from `src`; the slot
    /// for `self_id` must be `None`.
    pub fn init(
        machines: &[SocketAddr],
        self_id: ProcId,
        config: &RpcConfig,
        assemblers: Vec<Option<PacketAssembler>>,
        network_bytes_received: Arc<AtomicCounter>,
    ) -> Result<Arc<TcpComm>> {
        let nprocs = machines.len() as u32;
        assert_eq!(assemblers.len(), machines.len());

        let listener = open_listener(machines[self_id as usize]).map_err(|e| {
            RpcError::InitFailed(format!(
                "cannot listen on {}: {}",
                machines[self_id as usize], e
            ))
        })?;
        listener.set_nonblocking(true).map_err(RpcError::Io)?;

        let comm = Arc::new(TcpComm {
            self_id,
            nprocs,
            nodelay: config.tcp_nodelay,
            socket_buffer_size: config.socket_buffer_size,
            out_socks: (0..nprocs).map(|_| Mutex::new(None)).collect(),
            in_socks: (0..nprocs).map(|_| Mutex::new(None)).collect(),
            active: (0..nprocs).map(|_| AtomicBool::new(false)).collect(),
            network_bytes_sent: AtomicCounter::new(),
            network_bytes_received,
            shutdown: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pending_assemblers: Mutex::new(assemblers),
            inbound_count: Mutex::new(0),
            inbound_cv: Condvar::new(),
            accept_thread: Mutex::new(None),
            recv_threads: Mutex::new(ThreadGroup::new()),
        });

        let accept_comm = Arc::clone(&comm);
        let handle = thread::Builder::new()
            .name("dc-accept".to_string())
            .spawn(move || accept_comm.accept_loop(listener))
            .map_err(RpcError::Io)?;
        *comm.accept_thread.lock().unwrap() = Some(handle);

        if let Err(e) = comm.connect_all(machines, config) {
            comm.close();
            return Err(e);
        }
        if let Err(e) = comm.wait_for_inbound(Duration::from_millis(config.init_timeout_ms)) {
            comm.close();
            return Err(e);
        }

        info!(
            "process {} connected to all {} peers",
            self_id,
            nprocs - 1
        );
        Ok(comm)
    }

    pub fn procid(&self) -> ProcId {
        self.self_id
    }

    pub fn num_procs(&self) -> u32 {
        self.nprocs
    }

    pub fn network_bytes_sent(&self) -> u64 {
        self.network_bytes_sent.value()
    }

    pub fn network_bytes_received(&self) -> u64 {
        self.network_bytes_received.value()
    }

    /// idempotent teardown: stops the accept loop, closes every socket
    /// (EOF-ing peer receive threads), and joins the receive threads.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(true, Ordering::Release);

        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        for (target, sock) in self.out_socks.iter().enumerate() {
            self.active[target].store(false, Ordering::Release);
            if let Some(stream) = sock.lock().unwrap().take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }

        // force our own receive threads out of blocking reads
        for sock in &self.in_socks {
            if let Some(stream) = sock.lock().unwrap().take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        self.recv_threads.lock().unwrap().join_all();

        info!("process {}: communication layer closed", self.self_id);
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = TcpComm::register_inbound(&self, stream) {
                        warn!("rejected inbound connection from {}: {}", addr, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if !self.shutdown.load(Ordering::Acquire) {
                        error!("accept failed: {}", e);
                    }
                    break;
                }
            }
        }
    }

    /// read the initiator's procid, index the socket into the peer
    /// table, and spawn the receive thread for that source.
    fn register_inbound(comm: &Arc<TcpComm>, stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false).map_err(RpcError::Io)?;
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(RpcError::Io)?;

        let mut id_buf = [0u8; 4];
        let mut handshake = &stream;
        handshake.read_exact(&mut id_buf).map_err(RpcError::Io)?;
        let src = ProcId::from_be_bytes(id_buf);

        if src >= comm.nprocs || src == comm.self_id {
            return Err(RpcError::Protocol(format!(
                "inbound connection claims procid {}",
                src
            )));
        }
        stream.set_read_timeout(None).map_err(RpcError::Io)?;
        comm.configure_stream(&stream);

        let assembler = comm.pending_assemblers.lock().unwrap()[src as usize]
            .take()
            .ok_or_else(|| {
                RpcError::Protocol(format!("duplicate inbound connection from {}", src))
            })?;
        *comm.in_socks[src as usize].lock().unwrap() =
            Some(stream.try_clone().map_err(RpcError::Io)?);

        let thread_comm = Arc::clone(comm);
        comm.recv_threads
            .lock()
            .unwrap()
            .launch(&format!("dc-recv-{}", src), move || {
                thread_comm.recv_loop(stream, assembler)
            });

        let mut count = comm.inbound_count.lock().unwrap();
        *count += 1;
        comm.inbound_cv.notify_all();
        Ok(())
    }

    /// blocking read loop for one inbound socket. exits on EOF, on a
    /// read error, or when the assembler reports a framing violation.
    fn recv_loop(&self, mut stream: TcpStream, mut assembler: PacketAssembler) {
        let src = assembler.source();
        let mut buf = vec![0u8; RECV_CHUNK];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    info!("channel from {} closed", src);
                    break;
                }
                Ok(n) => {
                    if let Err(e) = assembler.incoming_data(&buf[..n]) {
                        error!("closing channel from {}: {}", src, e);
                        let _ = stream.shutdown(Shutdown::Both);
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if !self.shutdown.load(Ordering::Acquire) {
                        warn!("read from {} failed: {}", src, e);
                    }
                    break;
                }
            }
        }
    }

    fn connect_all(&self, machines: &[SocketAddr], config: &RpcConfig) -> Result<()> {
        for target in 0..self.nprocs {
            if target == self.self_id {
                continue;
            }
            self.connect_one(target, machines[target as usize], config)?;
        }
        Ok(())
    }

    fn connect_one(&self, target: ProcId, addr: SocketAddr, config: &RpcConfig) -> Result<()> {
        let mut last_err: Option<io::Error> = None;

        for _ in 0..config.connect_retries {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(RpcError::InitFailed("shut down during init".to_string()));
            }
            match TcpStream::connect(addr) {
                Ok(mut stream) => {
                    self.configure_stream(&stream);
                    match stream.write_all(&self.self_id.to_be_bytes()) {
                        Ok(()) => {
                            *self.out_socks[target as usize].lock().unwrap() = Some(stream);
                            self.active[target as usize].store(true, Ordering::Release);
                            return Ok(());
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(e) => last_err = Some(e),
            }
            thread::sleep(Duration::from_millis(config.connect_retry_delay_ms));
        }

        Err(RpcError::InitFailed(format!(
            "cannot connect to peer {} at {} after {} attempts: {}",
            target,
            addr,
            config.connect_retries,
            last_err.map_or_else(|| "no attempt made".to_string(), |e| e.to_string()),
        )))
    }

    fn wait_for_inbound(&self, timeout: Duration) -> Result<()> {
        let expected = (self.nprocs - 1) as usize;
        let deadline = Instant::now() + timeout;

        let mut count = self.inbound_count.lock().unwrap();
        while *count < expected {
            let now = Instant::now();
            if now >= deadline {
                return Err(RpcError::InitFailed(format!(
                    "only {} of {} peers dialed in within {:?}",
                    *count, expected, timeout
                )));
            }
            let (guard, _) = self
                .inbound_cv
                .wait_timeout(count, deadline - now)
                .unwrap();
            count = guard;
        }
        Ok(())
    }

    fn configure_stream(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(self.nodelay) {
            warn!("failed to set TCP_NODELAY: {}", e);
        }
        if let Err(e) = set_socket_buffers(stream.as_raw_fd(), self.socket_buffer_size) {
            warn!("failed to size socket buffers: {}", e);
        }
    }

    fn mark_lost(&self, target: ProcId, sock: &mut Option<TcpStream>) {
        self.active[target as usize].store(false, Ordering::Release);
        if let Some(stream) = sock.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl CommLayer for TcpComm {
    fn send(&self, target: ProcId, buf: &[u8]) -> Result<()> {
        let mut guard = self.out_socks[target as usize].lock().unwrap();
        let stream = guard.as_mut().ok_or(RpcError::ConnectionLost(target))?;

        // write_all retries partial writes and EINTR internally
        match stream.write_all(buf) {
            Ok(()) => {
                self.network_bytes_sent.add(buf.len() as u64);
                Ok(())
            }
            Err(e) => {
                warn!("send to {} failed: {}", target, e);
                self.mark_lost(target, &mut guard);
                Err(RpcError::ConnectionLost(target))
            }
        }
    }

    fn send2(&self, target: ProcId, buf1: &[u8], buf2: &[u8]) -> Result<()> {
        let mut guard = self.out_socks[target as usize].lock().unwrap();
        let stream = guard.as_mut().ok_or(RpcError::ConnectionLost(target))?;

        let total = buf1.len() + buf2.len();
        let mut written = 0usize;
        while written < total {
            let result = if written < buf1.len() {
                let iov = [IoSlice::new(&buf1[written..]), IoSlice::new(buf2)];
                stream.write_vectored(&iov)
            } else {
                stream.write(&buf2[written - buf1.len()..])
            };
            match result {
                Ok(0) => {
                    warn!("send to {} failed: connection closed", target);
                    self.mark_lost(target, &mut guard);
                    return Err(RpcError::ConnectionLost(target));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("send to {} failed: {}", target, e);
                    self.mark_lost(target, &mut guard);
                    return Err(RpcError::ConnectionLost(target));
                }
            }
        }

        self.network_bytes_sent.add(total as u64);
        Ok(())
    }

    fn channel_active(&self, target: ProcId) -> bool {
        (target as usize) < self.active.len() && self.active[target as usize].load(Ordering::Acquire)
    }

    fn capabilities(&self) -> usize {
        COMM_STREAM
    }
}

impl Drop for TcpComm {
    fn drop(&mut self) {
        self.close();
    }
}

/// open a listening socket with SO_REUSEADDR, the way a restarted
/// process re-binds its machine-list port without waiting out TIME_WAIT.
fn open_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let addr = match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "machine list must hold IPv4 addresses",
            ))
        }
    };

    // safety: plain socket(2) call
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let guard = FdGuard(fd);

    let one: libc::c_int = 1;
    // safety: fd is a valid socket; SO_REUSEADDR takes a c_int flag
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let sin = sockaddr_of(addr);
    // safety: sin is a fully initialized sockaddr_in of the correct size
    let rc = unsafe {
        libc::bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // safety: fd is bound
    let rc = unsafe { libc::listen(fd, 128) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    std::mem::forget(guard);
    // safety: fd is an exclusively owned, listening socket
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

fn sockaddr_of(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        // octets are already network order
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

fn set_socket_buffers(fd: RawFd, size: usize) -> io::Result<()> {
    let size = size as libc::c_int;
    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        // safety: fd is a valid socket; both options take a c_int size
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &size as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

struct FdGuard(RawFd);

impl Drop for FdGuard {
    fn drop(&mut self) {
        // safety: the fd is owned and not yet wrapped in a TcpListener
        unsafe {
            libc::close(self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketHeader, HEADER_LEN, STANDARD_CALL};
    use crate::receiver::ReceiveCallback;

    fn reserve_addrs(n: usize) -> Vec<SocketAddr> {
        // bind ephemeral listeners to pick free ports, then release them
        let listeners: Vec<TcpListener> = (0..n)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners
            .iter()
            .map(|l| l.local_addr().unwrap())
            .collect()
    }

    fn frame(src: ProcId, payload: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            len: payload.len() as u32,
            src,
            sequentialization_key: 0,
            packet_type_mask: STANDARD_CALL,
        };
        let mut wire = header.to_bytes().to_vec();
        wire.extend_from_slice(payload);
        wire
    }

    fn build_comm(
        machines: Vec<SocketAddr>,
        self_id: ProcId,
        config: RpcConfig,
    ) -> (
        thread::JoinHandle<Result<Arc<TcpComm>>>,
        Arc<Mutex<Vec<(ProcId, Vec<u8>)>>>,
    ) {
        let records: Arc<Mutex<Vec<(ProcId, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&records);
        let callback: ReceiveCallback = Arc::new(move |src, _mask, payload, _key| {
            sink.lock().unwrap().push((src, payload.to_vec()));
        });

        let counter = Arc::new(AtomicCounter::new());
        let assemblers: Vec<Option<PacketAssembler>> = (0..machines.len() as ProcId)
            .map(|src| {
                (src != self_id).then(|| {
                    PacketAssembler::new(
                        src,
                        Arc::clone(&callback),
                        Arc::clone(&counter),
                        config.max_packet_size,
                    )
                })
            })
            .collect();

        let handle = thread::spawn(move || {
            TcpComm::init(&machines, self_id, &config, assemblers, counter)
        });
        (handle, records)
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_two_process_mesh() {
        let machines = reserve_addrs(2);
        let config = RpcConfig::default().with_connect_retries(100, 20);

        let (h0, records0) = build_comm(machines.clone(), 0, config.clone());
        let (h1, records1) = build_comm(machines, 1, config);

        let comm0 = h0.join().unwrap().unwrap();
        let comm1 = h1.join().unwrap().unwrap();

        assert!(comm0.channel_active(1));
        assert!(comm1.channel_active(0));
        assert!(!comm0.channel_active(0));
        assert_eq!(comm0.capabilities(), COMM_STREAM);
        assert_eq!(comm0.num_procs(), 2);
        assert_eq!(comm0.procid(), 0);

        // plain send
        let wire = frame(0, b"over the mesh");
        comm0.send(1, &wire).unwrap();
        wait_for(|| !records1.lock().unwrap().is_empty());
        assert_eq!(records1.lock().unwrap()[0], (0, b"over the mesh".to_vec()));
        assert_eq!(comm0.network_bytes_sent(), wire.len() as u64);
        assert_eq!(comm1.network_bytes_received(), wire.len() as u64);

        // gather send: header and payload in separate buffers
        let wire = frame(1, b"gathered");
        let (header, payload) = wire.split_at(HEADER_LEN);
        comm1.send2(0, header, payload).unwrap();
        wait_for(|| !records0.lock().unwrap().is_empty());
        assert_eq!(records0.lock().unwrap()[0], (1, b"gathered".to_vec()));

        comm0.close();
        comm1.close();
        assert!(!comm0.channel_active(1));
    }

    #[test]
    fn test_send_after_close_is_connection_lost() {
        let machines = reserve_addrs(2);
        let config = RpcConfig::default().with_connect_retries(100, 20);

        let (h0, _) = build_comm(machines.clone(), 0, config.clone());
        let (h1, _) = build_comm(machines, 1, config);
        let comm0 = h0.join().unwrap().unwrap();
        let comm1 = h1.join().unwrap().unwrap();

        comm0.close();
        match comm0.send(1, b"late") {
            Err(RpcError::ConnectionLost(1)) => {}
            other => panic!("expected ConnectionLost, got {:?}", other),
        }
        comm1.close();
    }

    #[test]
    fn test_init_fails_without_peer() {
        let machines = reserve_addrs(2);
        let config = RpcConfig::default().with_connect_retries(3, 10);

        // peer 1 never starts
        let (h0, _) = build_comm(machines, 0, config);
        match h0.join().unwrap() {
            Err(RpcError::InitFailed(_)) => {}
            other => panic!("expected InitFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_single_process_mesh() {
        let machines = reserve_addrs(1);
        let config = RpcConfig::default();
        let (h0, _) = build_comm(machines, 0, config);
        let comm = h0.join().unwrap().unwrap();
        assert_eq!(comm.num_procs(), 1);
        comm.close();
    }
}
