//! distributed-control facade.
//!
//! one [`DistributedControl`] per process owns the whole transport: the
//! TCP mesh, one sender and one packet assembler per peer, the
//! sequentialization-key allocator, and the per-peer call counters.
//! collaborators interact through [`send_data`] and the receive
//! callback; everything else is plumbing they never see.
//!
//! `init` is collective: every process in the machine list must call it
//! with the same list, and it returns only once this process is wired
//! to every peer in both directions. `shutdown` is idempotent and also
//! runs on drop.
//!
//! [`send_data`]: DistributedControl::send_data

use crate::comm::{CommLayer, TcpComm};
use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::packet::{is_call, is_control};
use crate::receiver::{PacketAssembler, ReceiveCallback};
use crate::sender::{ExpQueueSender, SendChannel, StreamSender};
use crate::ProcId;
use log::info;
use plexus_cpu::AtomicCounter;
use std::io::Read;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// state shared between the control and its senders.
pub(crate) struct DcShared {
    pub(crate) procid: ProcId,
    pub(crate) nprocs: u32,
    /// allocator for the per-process monotonic key stamped into every
    /// outgoing header.
    pub(crate) seq_key: AtomicCounter,
    pub(crate) calls_sent: Vec<AtomicCounter>,
    pub(crate) calls_received: Vec<AtomicCounter>,
}

impl DcShared {
    pub(crate) fn new(procid: ProcId, nprocs: u32) -> Self {
        Self {
            procid,
            nprocs,
            seq_key: AtomicCounter::new(),
            calls_sent: (0..nprocs).map(|_| AtomicCounter::new()).collect(),
            calls_received: (0..nprocs).map(|_| AtomicCounter::new()).collect(),
        }
    }
}

pub struct DistributedControl {
    shared: Arc<DcShared>,
    comm: Arc<TcpComm>,
    /// one sender per peer; `None` at our own index.
    senders: Vec<Option<Box<dyn SendChannel>>>,
    max_packet_size: usize,
    shutdown_done: AtomicBool,
}

impl DistributedControl {
    /// collective initialization.
    ///
    /// `machines` maps procid to `host:port` and must be identical on
    /// every process; `callback` receives every inbound packet as
    /// `(source, packet_type_mask, payload, sequentialization_key)` and
    /// must be thread-safe - it runs concurrently on up to `N-1`
    /// receive threads, FIFO per source.
    pub fn init(
        machines: &[String],
        self_id: ProcId,
        config: RpcConfig,
        callback: ReceiveCallback,
    ) -> Result<DistributedControl> {
        config.validate().map_err(RpcError::Configuration)?;
        let addrs = parse_machines(machines, self_id)?;
        let nprocs = addrs.len() as u32;

        let shared = Arc::new(DcShared::new(self_id, nprocs));
        let network_bytes_received = Arc::new(AtomicCounter::new());

        // receive-side call accounting wraps the user callback
        let accounting = Arc::clone(&shared);
        let dispatch: ReceiveCallback = Arc::new(move |src, mask, payload, key| {
            if !is_control(mask) && is_call(mask) {
                accounting.calls_received[src as usize].inc();
            }
            callback(src, mask, payload, key);
        });

        let assemblers = (0..nprocs)
            .map(|src| {
                (src != self_id).then(|| {
                    PacketAssembler::new(
                        src,
                        Arc::clone(&dispatch),
                        Arc::clone(&network_bytes_received),
                        config.max_packet_size,
                    )
                })
            })
            .collect();

        let comm = TcpComm::init(&addrs, self_id, &config, assemblers, network_bytes_received)?;

        let senders = (0..nprocs)
            .map(|target| {
                (target != self_id).then(|| -> Box<dyn SendChannel> {
                    let comm_layer: Arc<dyn CommLayer> = Arc::clone(&comm) as Arc<dyn CommLayer>;
                    if config.buffered_send {
                        Box::new(StreamSender::new(
                            target,
                            Arc::clone(&shared),
                            comm_layer,
                            config.send_buffer_size,
                        ))
                    } else {
                        Box::new(ExpQueueSender::new(
                            target,
                            Arc::clone(&shared),
                            comm_layer,
                            config.combine_lower_threshold,
                            config.combine_upper_threshold,
                        ))
                    }
                })
            })
            .collect();

        info!(
            "process {} of {} up with {} senders",
            self_id,
            nprocs,
            if config.buffered_send {
                "stream"
            } else {
                "expqueue"
            }
        );

        Ok(DistributedControl {
            shared,
            comm,
            senders,
            max_packet_size: config.max_packet_size,
            shutdown_done: AtomicBool::new(false),
        })
    }

    /// enqueue one packet for `target`. the payload is copied before
    /// return; never waits for an acknowledgement. with the stream
    /// sender this may block briefly on a full ring, with the expqueue
    /// sender it never blocks.
    pub fn send_data(&self, target: ProcId, packet_type_mask: u8, payload: &[u8]) -> Result<()> {
        if self.shutdown_done.load(Ordering::Acquire) {
            return Err(RpcError::Shutdown);
        }
        if payload.len() > self.max_packet_size {
            return Err(RpcError::Configuration(format!(
                "payload of {} bytes exceeds max_packet_size {}",
                payload.len(),
                self.max_packet_size
            )));
        }
        let sender = self
            .senders
            .get(target as usize)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| RpcError::Configuration(format!("invalid send target {}", target)))?;
        sender.send_data(packet_type_mask, payload)
    }

    /// drain `reader` into an owned buffer and send it as one packet.
    pub fn send_data_from<R: Read>(
        &self,
        target: ProcId,
        packet_type_mask: u8,
        mut reader: R,
    ) -> Result<()> {
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;
        self.send_data(target, packet_type_mask, &payload)
    }

    pub fn procid(&self) -> ProcId {
        self.shared.procid
    }

    pub fn num_procs(&self) -> u32 {
        self.shared.nprocs
    }

    /// the next sequentialization key to be stamped into an outgoing
    /// header. keys allocated so far are strictly below this value.
    pub fn get_sequentialization_key(&self) -> u64 {
        self.shared.seq_key.value()
    }

    pub fn inc_calls_sent(&self, target: ProcId) -> Result<()> {
        self.peer_counter(&self.shared.calls_sent, target)?.inc();
        Ok(())
    }

    pub fn inc_calls_received(&self, source: ProcId) -> Result<()> {
        self.peer_counter(&self.shared.calls_received, source)?.inc();
        Ok(())
    }

    pub fn calls_sent(&self, target: ProcId) -> Result<u64> {
        Ok(self.peer_counter(&self.shared.calls_sent, target)?.value())
    }

    pub fn calls_received(&self, source: ProcId) -> Result<u64> {
        Ok(self.peer_counter(&self.shared.calls_received, source)?.value())
    }

    /// counters are indexed by peer id; there is no channel to self.
    fn peer_counter<'a>(
        &self,
        counters: &'a [AtomicCounter],
        peer: ProcId,
    ) -> Result<&'a AtomicCounter> {
        if peer == self.shared.procid {
            return Err(RpcError::Configuration(format!(
                "invalid peer id {} (self)",
                peer
            )));
        }
        counters
            .get(peer as usize)
            .ok_or_else(|| RpcError::Configuration(format!("invalid peer id {}", peer)))
    }

    /// payload bytes accepted for sending, control packets excluded.
    pub fn bytes_sent(&self) -> u64 {
        self.senders
            .iter()
            .flatten()
            .map(|s| s.bytes_sent())
            .sum()
    }

    /// raw bytes pushed onto sockets, headers and control traffic
    /// included.
    pub fn network_bytes_sent(&self) -> u64 {
        self.comm.network_bytes_sent()
    }

    pub fn network_bytes_received(&self) -> u64 {
        self.comm.network_bytes_received()
    }

    pub fn channel_active(&self, target: ProcId) -> bool {
        self.senders
            .get(target as usize)
            .and_then(|s| s.as_ref())
            .map_or(false, |s| s.channel_active())
    }

    /// drain and join every sender, close every socket, and join the
    /// receive threads. idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        for sender in self.senders.iter().flatten() {
            sender.shutdown();
        }
        self.comm.close();
        info!("process {} transport shut down", self.shared.procid);
    }
}

impl Drop for DistributedControl {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn parse_machines(machines: &[String], self_id: ProcId) -> Result<Vec<SocketAddr>> {
    if machines.is_empty() {
        return Err(RpcError::Configuration("empty machine list".to_string()));
    }
    if self_id as usize >= machines.len() {
        return Err(RpcError::Configuration(format!(
            "procid {} out of range for {} machines",
            self_id,
            machines.len()
        )));
    }

    let mut addrs = Vec::with_capacity(machines.len());
    for machine in machines {
        let addr = machine
            .to_socket_addrs()
            .map_err(|e| {
                RpcError::Configuration(format!("bad machine address '{}': {}", machine, e))
            })?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| {
                RpcError::Configuration(format!("no IPv4 address for '{}'", machine))
            })?;
        if addrs.contains(&addr) {
            return Err(RpcError::Configuration(format!(
                "duplicate machine address '{}'",
                machine
            )));
        }
        addrs.push(addr);
    }
    Ok(addrs)
}
