//! two in-process controls exchanging varint-framed counters.
//!
//! run with `cargo run --example ping_pong` - both "processes" live in
//! this binary and talk over loopback TCP.

use plexus_rpc::codec::{compress_int2, decompress_int2, MAX_ENCODED_LEN};
use plexus_rpc::{DistributedControl, ProcId, ReceiveCallback, RpcConfig, STANDARD_CALL};
use std::net::TcpListener;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

const ROUNDS: i64 = 100;

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    // reserve two loopback ports for the machine list
    let listeners: Vec<TcpListener> = (0..2)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let machines: Vec<String> = listeners
        .iter()
        .map(|l| format!("127.0.0.1:{}", l.local_addr().unwrap().port()))
        .collect();
    drop(listeners);

    let (done_tx, done_rx) = mpsc::channel::<i64>();

    let mut handles = Vec::new();
    for id in 0..2u32 {
        let machines = machines.clone();
        let done_tx = done_tx.clone();
        handles.push(thread::spawn(move || run_node(machines, id, done_tx)));
    }
    drop(done_tx);

    let last = done_rx.recv().unwrap();
    println!("final counter value: {}", last);

    for handle in handles {
        handle.join().unwrap();
    }
}

fn run_node(machines: Vec<String>, id: ProcId, done_tx: mpsc::Sender<i64>) {
    let (value_tx, value_rx) = mpsc::channel::<i64>();

    // the callback runs on the transport's receive thread
    let value_tx = std::sync::Mutex::new(value_tx);
    let callback: ReceiveCallback = Arc::new(move |_src, _mask, payload, _key| {
        let (value, _) = decompress_int2(payload);
        let _ = value_tx.lock().unwrap().send(value);
    });

    let config = RpcConfig::parse_initstring("buffered_send=no,combine_lower_threshold=1024")
        .expect("bad init string");
    let dc = DistributedControl::init(&machines, id, config, callback).expect("init failed");
    let peer = 1 - id;

    // process 0 serves, process 1 volleys back until the counter runs out
    if id == 0 {
        send_value(&dc, peer, 1);
    }
    let mut last = 0;
    while let Ok(value) = value_rx.recv() {
        last = value;
        if value >= ROUNDS {
            break;
        }
        send_value(&dc, peer, value + 1);
        if value + 1 >= ROUNDS {
            break;
        }
    }

    println!(
        "process {} done: {} calls out, {} calls in, {} payload bytes sent",
        id,
        dc.calls_sent(peer).unwrap(),
        dc.calls_received(peer).unwrap(),
        dc.bytes_sent()
    );
    let _ = done_tx.send(last);
    dc.shutdown();
}

fn send_value(dc: &DistributedControl, peer: ProcId, value: i64) {
    let mut buf = [0u8; MAX_ENCODED_LEN];
    let len = compress_int2(value, &mut buf);
    dc.send_data(peer, STANDARD_CALL, &buf[..len]).unwrap();
}
