//! Basic packet forwarder that receives batches of packets on one NIC,
//! modifies one byte of each packet, and sends them out on another NIC,
//! in both directions.
//!
//! Buffers are never copied: a received buffer is handed straight to the other
//! NIC's transmit queue, and whatever that queue can't take is freed.

#[macro_use] extern crate log;
extern crate getopts;
extern crate kernel_config;
extern crate logger;
extern crate dma_memory;
extern crate nic_buffers;
extern crate nic_descriptors;
extern crate nic_queues;
extern crate mempool;
extern crate loopback_nic;

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};
use getopts::{Matches, Options};
use kernel_config::nic::{DEFAULT_BUFFER_SIZE, DEFAULT_NUM_BUFFERS, FORWARD_BATCH_SIZE, PACKET_SIZE};
use dma_memory::{DmaAllocator, HeapDmaAllocator};
use nic_buffers::PacketBuffer;
use nic_descriptors::{RxDescriptor, TxDescriptor};
use nic_queues::{QueueError, RxQueue, TxQueue};
use mempool::{Mempool, MempoolConfig, MempoolRegistry};
use loopback_nic::{LoopbackConfig, LoopbackNic, LoopbackStats};

/// Iterations to run when `-n` isn't given.
const DEFAULT_ITERATIONS: u64 = 1_000_000;
/// How often throughput is printed.
const STATS_INTERVAL: Duration = Duration::from_secs(1);

pub fn main(args: Vec<String>) -> isize {
    let mut opts = Options::new();
    opts.optflag("h", "help", "prints the help menu");
    opts.optflag("c", "commence", "starts the operation");
    opts.optopt("n", "iterations", "number of forwarding rounds to run (default 1000000)", "COUNT");
    opts.optopt("s", "seed", "number of packets to inject before forwarding starts", "COUNT");
    opts.optflagmulti("v", "verbose", "log more; can be repeated");

    let matches = match opts.parse(&args) {
        Ok(m) => m,
        Err(_) => {
            println!("invalid flag!");
            print_usage(&opts);
            return -1;
        }
    };

    if matches.opt_present("h") {
        print_usage(&opts);
        return 0;
    }

    if let Err(e) = logger::init(logger::level_for_verbosity(matches.opt_count("v"))) {
        println!("couldn't initialize the logger: {}", e);
    }

    match rmain(&matches) {
        Ok(()) => {
            println!("Packet forwarding successful");
            0
        }
        Err(e) => {
            println!("Packet forwarding failed with error: {:?}", e);
            -1
        }
    }
}

fn print_usage(opts: &Options) {
    println!("{}", opts.usage("Usage: packet_forwarder -c [-n COUNT] [-s COUNT] [-v]"));
}

fn parse_count(matches: &Matches, name: &str, default: u64) -> Result<u64, &'static str> {
    match matches.opt_str(name) {
        Some(s) => s.parse::<u64>().map_err(|_| "counts must be non-negative integers"),
        None => Ok(default),
    }
}

fn rmain(matches: &Matches) -> Result<(), &'static str> {
    if !matches.opt_present("c") {
        println!("Run with flag -c to commence the packet forwarding");
        return Ok(());
    }
    let iterations = parse_count(matches, "n", DEFAULT_ITERATIONS)?;
    let seed = parse_count(matches, "s", u64::MAX)?;

    let allocator: Arc<dyn DmaAllocator> = Arc::new(HeapDmaAllocator::new());
    let registry = Arc::new(MempoolRegistry::new());
    let pool_config = MempoolConfig::new(DEFAULT_NUM_BUFFERS, DEFAULT_BUFFER_SIZE);
    let pool1 = Mempool::create(&registry, allocator.as_ref(), pool_config)?;
    let pool2 = Mempool::create(&registry, allocator.as_ref(), pool_config)?;
    let (mut dev1, mut rx1, mut tx1) = LoopbackNic::new("lo0", LoopbackConfig::default(), allocator.clone(), pool1, registry.clone())?;
    let (mut dev2, mut rx2, mut tx2) = LoopbackNic::new("lo1", LoopbackConfig::default(), allocator, pool2, registry.clone())?;

    // packets start out on the wire of the first NIC, as many as it can take
    let mut frame = [0u8; PACKET_SIZE];
    let mut injected = 0u64;
    while injected < seed {
        frame[..8].copy_from_slice(&injected.to_be_bytes());
        if !dev1.receive_frame(&frame) {
            break;
        }
        injected += 1;
    }
    dev1.take_stats();
    info!("injected {} packets into {}", injected, dev1.name());

    let mut fwd = Forwarder::new(registry);
    let mut stats1_old = LoopbackStats::default();
    let mut stats2_old = LoopbackStats::default();
    let mut last_print = Instant::now();
    for i in 0..iterations {
        fwd.forward(&mut rx1, &mut tx2)?;
        fwd.forward(&mut rx2, &mut tx1)?;
        dev1.poll();
        dev2.poll();

        if i % 0x1000 == 0 && last_print.elapsed() >= STATS_INTERVAL {
            let elapsed = last_print.elapsed();
            println!("[{}] {}", dev1.name(), dev1.stats().rates_since(&stats1_old, elapsed));
            println!("[{}] {}", dev2.name(), dev2.stats().rates_since(&stats2_old, elapsed));
            stats1_old = dev1.stats();
            stats2_old = dev2.stats();
            last_print = Instant::now();
        }
    }

    println!("[{}] {}", dev1.name(), dev1.stats());
    println!("[{}] {}", dev2.name(), dev2.stats());
    println!("forwarded {} packets, {} dropped for lack of TX slots", fwd.forwarded, fwd.dropped);
    Ok(())
}


/// Moves batches of packets from a receive queue to a transmit queue.
pub struct Forwarder {
    batch: VecDeque<PacketBuffer>,
    registry: Arc<MempoolRegistry>,
    /// The pool unsent buffers are freed to; all received buffers of one queue share a pool.
    pool: Option<Arc<Mempool>>,
    pub forwarded: u64,
    pub dropped: u64,
}

impl Forwarder {
    pub fn new(registry: Arc<MempoolRegistry>) -> Forwarder {
        Forwarder {
            batch: VecDeque::with_capacity(FORWARD_BATCH_SIZE),
            registry,
            pool: None,
            forwarded: 0,
            dropped: 0,
        }
    }

    /// Receives one batch on `rx`, touches every packet, and sends the batch on `tx`.
    /// Packets that don't fit into `tx` are freed.
    ///
    /// Returns the number of packets received and the number sent.
    pub fn forward<R: RxDescriptor, T: TxDescriptor>(
        &mut self,
        rx: &mut RxQueue<R>,
        tx: &mut TxQueue<T>,
    ) -> Result<(usize, usize), QueueError> {
        let received = rx.rx_batch(&mut self.batch, FORWARD_BATCH_SIZE)?;
        if received == 0 {
            return Ok((0, 0));
        }
        for buf in self.batch.iter_mut() {
            buf.touch();
        }

        let sent = match tx.tx_batch(&mut self.batch) {
            Ok(n) => n,
            Err(QueueError::InvalidBufferSize(size)) => {
                warn!("dropping batch at a {}-byte packet", size);
                0
            }
            Err(e) => return Err(e),
        };
        self.forwarded += sent as u64;

        if !self.batch.is_empty() {
            self.dropped += self.batch.len() as u64;
            self.free_unsent();
        }
        Ok((received, sent))
    }

    fn free_unsent(&mut self) {
        let pool_id = match self.batch.front() {
            Some(buf) => buf.pool_id(),
            None => return,
        };
        if self.pool.as_ref().map_or(true, |pool| pool.id() != pool_id) {
            self.pool = self.registry.find(pool_id);
        }
        match &self.pool {
            Some(pool) => {
                let refused = pool.free_batch(&mut self.batch);
                if refused > 0 {
                    error!("mempool {} refused {} unsent buffers", pool_id, refused);
                }
            }
            None => {
                error!("no mempool with id {}, leaking {} unsent buffers", pool_id, self.batch.len());
                self.batch.clear();
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use nic_descriptors::{AdvancedRxDescriptor, AdvancedTxDescriptor};

    struct Pair {
        allocator: Arc<dyn DmaAllocator>,
        registry: Arc<MempoolRegistry>,
    }

    impl Pair {
        fn new() -> Pair {
            Pair { allocator: Arc::new(HeapDmaAllocator::new()), registry: Arc::new(MempoolRegistry::new()) }
        }

        fn device(&self, name: &'static str, descs: u16, buffers: usize)
            -> (LoopbackNic, RxQueue<AdvancedRxDescriptor>, TxQueue<AdvancedTxDescriptor>, Arc<Mempool>)
        {
            let pool = Mempool::create(&self.registry, self.allocator.as_ref(), MempoolConfig::new(buffers, 2048)).unwrap();
            let config = LoopbackConfig { num_rx_descs: descs, num_tx_descs: descs };
            let (nic, rx, tx) = LoopbackNic::new(name, config, self.allocator.clone(), pool.clone(), self.registry.clone()).unwrap();
            (nic, rx, tx, pool)
        }
    }

    #[test]
    fn forwards_and_touches() {
        let pair = Pair::new();
        let (mut dev1, mut rx1, _tx1, _pool1) = pair.device("a", 64, 256);
        let (mut dev2, mut rx2, mut tx2, _pool2) = pair.device("b", 64, 256);
        for i in 0..10u8 {
            assert!(dev1.receive_frame(&[i; 60]));
        }

        let mut fwd = Forwarder::new(pair.registry.clone());
        assert_eq!(fwd.forward(&mut rx1, &mut tx2), Ok((10, 10)));
        assert_eq!(dev2.poll(), 10);

        let mut out = VecDeque::new();
        assert_eq!(rx2.rx_batch(&mut out, 32), Ok(10));
        for (i, buf) in out.iter().enumerate() {
            let i = i as u8;
            assert_eq!(buf.data()[0], i);
            assert_eq!(buf.data()[1], i.wrapping_add(1));
            assert_eq!(buf.data()[2], i);
        }
        assert_eq!(fwd.forwarded, 10);
        assert_eq!(fwd.dropped, 0);
        assert_eq!(dev1.stats().rx_packets, 10);
    }

    #[test]
    fn unsent_packets_are_freed() {
        let pair = Pair::new();
        let (mut dev1, mut rx1, _tx1, pool1) = pair.device("a", 64, 256);
        let (_dev2, _rx2, mut tx2, _pool2) = pair.device("b", 8, 256);
        for _ in 0..20 {
            assert!(dev1.receive_frame(&[7; 60]));
        }
        let armed_free = pool1.available();

        let mut fwd = Forwarder::new(pair.registry.clone());
        // the TX ring has 7 usable slots and nobody is draining it
        assert_eq!(fwd.forward(&mut rx1, &mut tx2), Ok((20, 7)));
        assert_eq!(fwd.dropped, 13);
        // 20 buffers left pool1 to re-arm the RX ring, 13 came back
        assert_eq!(pool1.available(), armed_free - 20 + 13);

        assert_eq!(fwd.forward(&mut rx1, &mut tx2), Ok((0, 0)));
    }

    #[test]
    fn batch_is_cut_at_an_empty_frame() {
        let pair = Pair::new();
        let (mut dev1, mut rx1, _tx1, pool1) = pair.device("a", 64, 256);
        let (mut dev2, _rx2, mut tx2, _pool2) = pair.device("b", 64, 256);
        let frames: [&[u8]; 4] = [&[1; 60], &[2; 60], &[], &[3; 60]];
        for frame in frames {
            assert!(dev1.receive_frame(frame));
        }
        let armed_free = pool1.available();

        let mut fwd = Forwarder::new(pair.registry.clone());
        // the two frames in front of the empty one go out, the rest is dropped
        assert_eq!(fwd.forward(&mut rx1, &mut tx2), Ok((4, 2)));
        assert_eq!(fwd.forwarded, 2);
        assert_eq!(fwd.dropped, 2);
        assert_eq!(tx2.in_flight(), 2);
        assert_eq!(pool1.available(), armed_free - 4 + 2);
        assert_eq!(dev2.poll(), 2);
    }

    #[test]
    fn usage_and_bad_flags() {
        assert_eq!(main(vec!["-h".into()]), 0);
        assert_eq!(main(vec!["--bogus".into()]), -1);
        assert_eq!(main(vec![]), 0);
        assert_eq!(main(vec!["-c".into(), "-n".into(), "x".into()]), -1);
    }

    #[test]
    fn short_run_over_loopback_devices() {
        assert_eq!(main(vec!["-c".into(), "-n".into(), "200".into(), "-s".into(), "100".into()]), 0);
    }
}
