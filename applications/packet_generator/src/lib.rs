//! A packet generator that sends minimal UDP packets as fast as the NIC accepts them.
//!
//! Every buffer of the generator's mempool is pre-filled with the same packet
//! once; afterwards, sending a packet only writes a sequence number into it.
//! The NIC runs on its own thread, so transmission busy-waits for free slots.

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
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use getopts::{Matches, Options};
use kernel_config::nic::{DEFAULT_BUFFER_SIZE, DEFAULT_NUM_BUFFERS, PACKET_SIZE, PKTGEN_BATCH_SIZE, PKTGEN_NUM_BUFFERS};
use dma_memory::{DmaAllocator, HeapDmaAllocator};
use nic_buffers::PacketBuffer;
use nic_descriptors::TxDescriptor;
use nic_queues::{QueueError, TxQueue};
use mempool::{Mempool, MempoolConfig, MempoolRegistry};
use loopback_nic::{LoopbackConfig, LoopbackNic, LoopbackStats};

/// Batches to send when `-n` isn't given.
const DEFAULT_BATCHES: u64 = 100_000;
/// How often throughput is printed.
const STATS_INTERVAL: Duration = Duration::from_millis(100);

/// Offset of the IPv4 header within the frame.
const IP_HEADER_OFFSET: usize = 14;
/// Length of the IPv4 header.
const IP_HEADER_LEN: usize = 20;
/// Offset of the IPv4 header checksum within the frame.
const IP_CHECKSUM_OFFSET: usize = IP_HEADER_OFFSET + 10;
/// Offset of the sequence number within the frame.
const SEQ_NUM_OFFSET: usize = PACKET_SIZE - 4;

/// The packet every buffer starts out with: 10.0.0.1:42 -> 10.0.0.2:1337, payload "ixy".
/// The IPv4 checksum is filled in by [`packet_template()`].
const PACKET_DATA: [u8; 45] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // dst MAC
    0x11, 0x12, 0x13, 0x14, 0x15, 0x16, // src MAC
    0x08, 0x00,                         // ether type: IPv4
    0x45, 0x00,                         // Version, IHL, TOS
    ((PACKET_SIZE - 14) >> 8) as u8,    // ip len excluding ethernet, high byte
    ((PACKET_SIZE - 14) & 0xFF) as u8,  // ip len excluding ethernet, low byte
    0x00, 0x00, 0x00, 0x00,             // id, flags, fragmentation
    0x40, 0x11, 0x00, 0x00,             // TTL (64), protocol (UDP), checksum
    0x0A, 0x00, 0x00, 0x01,             // src ip (10.0.0.1)
    0x0A, 0x00, 0x00, 0x02,             // dst ip (10.0.0.2)
    0x00, 0x2A, 0x05, 0x39,             // src and dst ports (42 -> 1337)
    ((PACKET_SIZE - 20 - 14) >> 8) as u8,   // udp len excluding ip & ethernet, high byte
    ((PACKET_SIZE - 20 - 14) & 0xFF) as u8, // udp len excluding ip & ethernet, low byte
    0x00, 0x00,                         // udp checksum, optional
    b'i', b'x', b'y',                   // payload
    // the rest of the payload is zero-filled
];

/// Computes the Internet checksum (RFC 1071) of `data`, which must have an even length.
pub fn ip_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data.chunks_exact(2)
        .map(|word| u16::from_be_bytes([word[0], word[1]]) as u32)
        .sum();
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Returns the full packet the generator sends, with a valid IPv4 header checksum.
pub fn packet_template() -> [u8; PACKET_SIZE] {
    let mut packet = [0u8; PACKET_SIZE];
    packet[..PACKET_DATA.len()].copy_from_slice(&PACKET_DATA);
    let checksum = ip_checksum(&packet[IP_HEADER_OFFSET..IP_HEADER_OFFSET + IP_HEADER_LEN]);
    packet[IP_CHECKSUM_OFFSET..IP_CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Writes the packet template into every buffer of `pool`.
///
/// All buffers are taken out of the pool at once so that each one is written exactly once,
/// then all are given back; later allocations get buffers that already hold the packet.
pub fn prefill_pool(pool: &Mempool) -> Result<(), &'static str> {
    let template = packet_template();
    let mut bufs = VecDeque::with_capacity(pool.num_entries());
    pool.alloc_batch(&mut bufs, pool.num_entries());
    let mut result = Ok(());
    for buf in bufs.iter_mut() {
        result = buf.write_bytes(0, &template).and_then(|_| buf.set_size(PACKET_SIZE as u32));
        if result.is_err() {
            break;
        }
    }
    pool.free_batch(&mut bufs);
    result
}

/// Sends batches of template packets, each stamped with the next sequence number.
pub struct Generator {
    pool: Arc<Mempool>,
    batch: VecDeque<PacketBuffer>,
    seq_num: u32,
}

impl Generator {
    pub fn new(pool: Arc<Mempool>) -> Result<Generator, &'static str> {
        prefill_pool(&pool)?;
        debug!("prefilled {} buffers of mempool {} with the packet template", pool.num_entries(), pool.id());
        Ok(Generator {
            pool,
            batch: VecDeque::with_capacity(PKTGEN_BATCH_SIZE),
            seq_num: 0,
        })
    }

    /// The sequence number the next packet will carry.
    pub fn seq_num(&self) -> u32 {
        self.seq_num
    }

    /// Allocates a batch, numbers it, and busy-waits until `tx` has taken all of it.
    ///
    /// Returns the number of packets sent. Anything `tx` refused goes back to the pool.
    pub fn send_batch<T: TxDescriptor>(&mut self, tx: &mut TxQueue<T>) -> Result<usize, QueueError> {
        let count = self.pool.alloc_batch(&mut self.batch, PKTGEN_BATCH_SIZE);
        for buf in self.batch.iter_mut() {
            // SAFETY: every buffer holds at least PACKET_SIZE bytes of payload.
            unsafe { buf.write_data_unchecked(SEQ_NUM_OFFSET, &self.seq_num) };
            self.seq_num = self.seq_num.wrapping_add(1);
        }
        let result = tx.tx_batch_busy_wait(&mut self.batch);
        if !self.batch.is_empty() {
            warn!("{} of {} packets weren't sent", self.batch.len(), count);
            self.pool.free_batch(&mut self.batch);
        }
        result
    }
}


pub fn main(args: Vec<String>) -> isize {
    let mut opts = Options::new();
    opts.optflag("h", "help", "prints the help menu");
    opts.optflag("c", "commence", "starts the operation");
    opts.optopt("n", "batches", "number of batches to send (default 100000)", "COUNT");
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
            println!("Packet generation successful");
            0
        }
        Err(e) => {
            println!("Packet generation failed with error: {:?}", e);
            -1
        }
    }
}

fn print_usage(opts: &Options) {
    println!("{}", opts.usage("Usage: packet_generator -c [-n COUNT] [-v]"));
}

fn parse_count(matches: &Matches, name: &str, default: u64) -> Result<u64, &'static str> {
    match matches.opt_str(name) {
        Some(s) => s.parse::<u64>().map_err(|_| "counts must be non-negative integers"),
        None => Ok(default),
    }
}

fn rmain(matches: &Matches) -> Result<(), &'static str> {
    if !matches.opt_present("c") {
        println!("Run with flag -c to commence the packet generation");
        return Ok(());
    }
    let batches = parse_count(matches, "n", DEFAULT_BATCHES)?;

    let allocator: Arc<dyn DmaAllocator> = Arc::new(HeapDmaAllocator::new());
    let registry = Arc::new(MempoolRegistry::new());
    let rx_pool = Mempool::create(&registry, allocator.as_ref(), MempoolConfig::new(DEFAULT_NUM_BUFFERS, DEFAULT_BUFFER_SIZE))?;
    let tx_pool = Mempool::create(&registry, allocator.as_ref(), MempoolConfig::new(PKTGEN_NUM_BUFFERS, DEFAULT_BUFFER_SIZE))?;
    let (nic, mut rx, mut tx) = LoopbackNic::new("lo0", LoopbackConfig::default(), allocator, rx_pool.clone(), registry)?;

    let mut generator = Generator::new(tx_pool)?;
    let stop = Arc::new(AtomicBool::new(false));
    let device = nic.spawn(stop.clone());

    let mut received = VecDeque::new();
    let mut total_received = 0u64;
    let mut sent_last = 0u64;
    let mut total_sent = 0u64;
    let mut last_print = Instant::now();
    let mut result: Result<(), &'static str> = Ok(());
    for i in 0..batches {
        match generator.send_batch(&mut tx) {
            Ok(n) => total_sent += n as u64,
            Err(e) => {
                result = Err(e.into());
                break;
            }
        }
        // the looped-back packets are only counted
        match rx.rx_batch(&mut received, PKTGEN_BATCH_SIZE) {
            Ok(n) => total_received += n as u64,
            Err(e) => {
                result = Err(e.into());
                break;
            }
        }
        rx_pool.free_batch(&mut received);

        if i & 0xFFF == 0 && last_print.elapsed() >= STATS_INTERVAL {
            let elapsed = last_print.elapsed();
            let old = LoopbackStats { tx_packets: sent_last, tx_bytes: sent_last * PACKET_SIZE as u64, ..Default::default() };
            let new = LoopbackStats { tx_packets: total_sent, tx_bytes: total_sent * PACKET_SIZE as u64, ..Default::default() };
            println!("[lo0] {}", new.rates_since(&old, elapsed));
            sent_last = total_sent;
            last_print = Instant::now();
        }
    }

    stop.store(true, Ordering::Relaxed);
    let nic = device.join().map_err(|_| "the device thread panicked")?;
    println!("[{}] {}", nic.name(), nic.stats());
    println!("sent {} packets, {} came back", total_sent, total_received);
    result
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn template_has_a_valid_ip_checksum() {
        let packet = packet_template();
        assert_eq!(&packet[..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&packet[42..45], b"ixy");
        assert!(packet[45..].iter().all(|&b| b == 0));
        // checksumming a header that includes its own checksum yields zero
        assert_eq!(ip_checksum(&packet[IP_HEADER_OFFSET..IP_HEADER_OFFSET + IP_HEADER_LEN]), 0);
        assert_eq!(&packet[IP_CHECKSUM_OFFSET..IP_CHECKSUM_OFFSET + 2], &[0x66, 0xBD]);
    }

    #[test]
    fn checksum_example_from_rfc_1071() {
        assert_eq!(ip_checksum(&[0x00, 0x01, 0xF2, 0x03, 0xF4, 0xF5, 0xF6, 0xF7]), !0xDDF2);
    }

    #[test]
    fn prefill_writes_every_buffer() {
        let allocator = HeapDmaAllocator::new();
        let registry = MempoolRegistry::new();
        let pool = Mempool::create(&registry, &allocator, MempoolConfig::new(16, 2048)).unwrap();
        prefill_pool(&pool).unwrap();
        assert_eq!(pool.available(), 16);
        let template = packet_template();
        let mut bufs = VecDeque::new();
        pool.alloc_batch(&mut bufs, 16);
        for buf in bufs.iter() {
            assert_eq!(buf.data(), &template[..]);
        }
    }

    #[test]
    fn sequence_numbers_are_stamped() {
        let allocator: Arc<dyn DmaAllocator> = Arc::new(HeapDmaAllocator::new());
        let registry = Arc::new(MempoolRegistry::new());
        let rx_pool = Mempool::create(&registry, allocator.as_ref(), MempoolConfig::new(256, 2048)).unwrap();
        let tx_pool = Mempool::create(&registry, allocator.as_ref(), MempoolConfig::new(256, 2048)).unwrap();
        let config = LoopbackConfig { num_rx_descs: 128, num_tx_descs: 128 };
        let (mut nic, mut rx, mut tx) = LoopbackNic::new("lo-gen", config, allocator, rx_pool, registry).unwrap();

        let mut generator = Generator::new(tx_pool).unwrap();
        assert_eq!(generator.send_batch(&mut tx), Ok(PKTGEN_BATCH_SIZE));
        assert_eq!(generator.seq_num(), PKTGEN_BATCH_SIZE as u32);
        assert_eq!(nic.poll(), PKTGEN_BATCH_SIZE);

        let mut received = VecDeque::new();
        assert_eq!(rx.rx_batch(&mut received, 128), Ok(PKTGEN_BATCH_SIZE));
        for (i, buf) in received.iter().enumerate() {
            assert_eq!(buf.size() as usize, PACKET_SIZE);
            assert_eq!(buf.read_data::<u32>(SEQ_NUM_OFFSET), Ok(i as u32));
            assert_eq!(&buf.data()[..SEQ_NUM_OFFSET], &packet_template()[..SEQ_NUM_OFFSET]);
        }
    }

    #[test]
    fn short_run_with_a_device_thread() {
        assert_eq!(main(vec!["-c".into(), "-n".into(), "50".into()]), 0);
    }
}
