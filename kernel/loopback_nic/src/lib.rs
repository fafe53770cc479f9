//! A simulated 82599-style NIC with its transmit side wired to its own receive side.
//!
//! The driver half (the [`RxQueue`] and [`TxQueue`] returned by [`LoopbackNic::new()`])
//! is the real thing; this crate implements only what the hardware would do:
//! consume transmit descriptors up to TDT, DMA each packet into the next armed
//! receive buffer (as long as the receive head hasn't caught up with RDT),
//! and write back both descriptors. Packets that find no armed receive slot are
//! dropped and counted, like the `RXMPC` missed packets counter.
//!
//! The device can be polled from the driver's own thread, or moved onto a thread
//! of its own with [`LoopbackNic::spawn()`] to behave like real, concurrent hardware.
//! Either way, the two sides only hand slots to each other through atomics: the
//! register words, and the status words of the descriptors.

#[macro_use] extern crate log;
extern crate memory_structs;
extern crate kernel_config;
extern crate dma_memory;
extern crate nic_buffers;
extern crate nic_descriptors;
extern crate nic_queues;
extern crate mempool;


use std::{
    fmt,
    mem::size_of,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use memory_structs::VirtualAddress;
use kernel_config::nic::{DEFAULT_NUM_RX_DESC, DEFAULT_NUM_TX_DESC};
use dma_memory::{DmaAllocator, DmaRegion};
use nic_buffers::DATA_OFFSET;
use nic_descriptors::{AdvancedRxDescriptor, AdvancedTxDescriptor, RxDescriptor, TxDescriptor};
use nic_queues::{RxQueue, TailRegister, TxQueue};
use mempool::{Mempool, MempoolRegistry};

/// Receive Descriptor Head, queue 0.
pub const REG_RDH: usize = 0x01010;
/// Receive Descriptor Tail, queue 0.
pub const REG_RDT: usize = 0x01018;
/// Transmit Descriptor Head, queue 0.
pub const REG_TDH: usize = 0x06010;
/// Transmit Descriptor Tail, queue 0.
pub const REG_TDT: usize = 0x06018;
/// Size of the simulated register space (BAR0).
const REGISTER_SPACE_SIZE: usize = 0x8000;


/// The ring sizes of a loopback device.
#[derive(Clone, Copy, Debug)]
pub struct LoopbackConfig {
    pub num_rx_descs: u16,
    pub num_tx_descs: u16,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            num_rx_descs: DEFAULT_NUM_RX_DESC,
            num_tx_descs: DEFAULT_NUM_TX_DESC,
        }
    }
}


/// Packet and byte counters, as the device's statistics registers would hold them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    /// Packets dropped because no receive descriptor was available.
    pub rx_missed: u64,
    /// Packets dropped because they didn't fit into a receive buffer.
    pub rx_oversize: u64,
}

impl fmt::Display for LoopbackStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RX: {} packets, {} bytes, {} missed, {} oversize | TX: {} packets, {} bytes",
            self.rx_packets, self.rx_bytes, self.rx_missed, self.rx_oversize, self.tx_packets, self.tx_bytes)
    }
}

impl LoopbackStats {
    /// Computes the packet and bit rates between an `old` snapshot and this one.
    pub fn rates_since(&self, old: &LoopbackStats, elapsed: Duration) -> StatsRates {
        let secs = elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
        let mpps = |new: u64, old: u64| new.saturating_sub(old) as f64 / 1_000_000.0 / secs;
        // preamble, start of frame delimiter and inter-frame gap take 20 bytes per packet on the wire
        let mbit = |bytes: (u64, u64), pkts: (u64, u64)| {
            let bytes = bytes.0.saturating_sub(bytes.1) + pkts.0.saturating_sub(pkts.1) * 20;
            bytes as f64 * 8.0 / 1_000_000.0 / secs
        };
        StatsRates {
            rx_mpps: mpps(self.rx_packets, old.rx_packets),
            rx_mbit: mbit((self.rx_bytes, old.rx_bytes), (self.rx_packets, old.rx_packets)),
            tx_mpps: mpps(self.tx_packets, old.tx_packets),
            tx_mbit: mbit((self.tx_bytes, old.tx_bytes), (self.tx_packets, old.tx_packets)),
        }
    }
}

/// Throughput over an interval, see [`LoopbackStats::rates_since()`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatsRates {
    pub rx_mpps: f64,
    pub rx_mbit: f64,
    pub tx_mpps: f64,
    pub tx_mbit: f64,
}

impl fmt::Display for StatsRates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RX: {:.2} Mpps, {:.0} Mbit/s | TX: {:.2} Mpps, {:.0} Mbit/s",
            self.rx_mpps, self.rx_mbit, self.tx_mpps, self.tx_mbit)
    }
}


/// The hardware half of a loopback NIC with one receive and one transmit queue.
pub struct LoopbackNic {
    name: &'static str,
    allocator: Arc<dyn DmaAllocator>,
    /// Start of the simulated register space, which lives for the rest of the process.
    registers: VirtualAddress,
    rx_ring: DmaRegion,
    num_rx_descs: u16,
    /// Largest packet a receive buffer can hold.
    rx_buffer_len: usize,
    tx_ring: DmaRegion,
    num_tx_descs: u16,
    rx_head: u16,
    tx_head: u16,
    stats: LoopbackStats,
}

impl LoopbackNic {
    /// Creates a loopback device and the driver queues that talk to it.
    ///
    /// Receive buffers come from `rx_pool`; transmitted buffers are returned
    /// to whichever pool of `registry` they belong to.
    /// The receive queue is fully armed before this returns.
    pub fn new(
        name: &'static str,
        config: LoopbackConfig,
        allocator: Arc<dyn DmaAllocator>,
        rx_pool: Arc<Mempool>,
        registry: Arc<MempoolRegistry>,
    ) -> Result<(LoopbackNic, RxQueue<AdvancedRxDescriptor>, TxQueue<AdvancedTxDescriptor>), &'static str> {
        let registers: &'static [AtomicU32] = Box::leak(
            (0..REGISTER_SPACE_SIZE / 4).map(|_| AtomicU32::new(0)).collect::<Vec<_>>().into_boxed_slice()
        );
        let registers = VirtualAddress::from_ptr(registers.as_ptr());
        let rx_buffer_len = rx_pool.entry_size() - DATA_OFFSET;

        let rx_ring = allocator.allocate_dma_region(config.num_rx_descs as usize * size_of::<AdvancedRxDescriptor>())?;
        // SAFETY: the register space is leaked, so it outlives the queue.
        let rdt = unsafe { TailRegister::new(registers + REG_RDT) };
        let mut rxq = RxQueue::new(0, config.num_rx_descs, rx_pool, rdt)?;
        rxq.attach_descriptors(rx_ring)?;

        let tx_ring = allocator.allocate_dma_region(config.num_tx_descs as usize * size_of::<AdvancedTxDescriptor>())?;
        let tdt = unsafe { TailRegister::new(registers + REG_TDT) };
        let mut txq = TxQueue::new(0, config.num_tx_descs, registry, tdt)?;
        txq.attach_descriptors(tx_ring)?;

        let nic = LoopbackNic {
            name,
            allocator,
            registers,
            rx_ring,
            num_rx_descs: config.num_rx_descs,
            rx_buffer_len,
            tx_ring,
            num_tx_descs: config.num_tx_descs,
            rx_head: 0,
            tx_head: 0,
            stats: LoopbackStats::default(),
        };
        rxq.init_descriptors()?;
        info!("{}: loopback device up, {} RX / {} TX descriptors", name, config.num_rx_descs, config.num_tx_descs);
        Ok((nic, rxq, txq))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> LoopbackStats {
        self.stats
    }

    /// Returns the counters and clears them, like reading the clear-on-read statistics registers.
    pub fn take_stats(&mut self) -> LoopbackStats {
        core::mem::take(&mut self.stats)
    }

    fn register(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: the register space is leaked and only ever accessed atomically.
        unsafe { &*(self.registers + offset).as_ptr::<AtomicU32>() }
    }

    pub fn read_reg(&self, offset: usize) -> u32 {
        self.register(offset).load(Ordering::Acquire)
    }

    fn write_reg(&self, offset: usize, value: u32) {
        self.register(offset).store(value, Ordering::Release)
    }

    /// The device only reads a descriptor's read format after the tail register handed
    /// it the slot, and only writes its status word, so shared references suffice.
    fn rx_desc(&self, i: u16) -> &'static AdvancedRxDescriptor {
        let addr = self.rx_ring.virt_addr() + i as usize * size_of::<AdvancedRxDescriptor>();
        unsafe { &*addr.as_ptr() }
    }

    fn tx_desc(&self, i: u16) -> &'static AdvancedTxDescriptor {
        let addr = self.tx_ring.virt_addr() + i as usize * size_of::<AdvancedTxDescriptor>();
        unsafe { &*addr.as_ptr() }
    }

    /// Writes `frame` into the next armed receive buffer, as if it had arrived on the wire.
    ///
    /// Returns false if the packet was dropped.
    pub fn receive_frame(&mut self, frame: &[u8]) -> bool {
        let src = VirtualAddress::from_ptr(frame.as_ptr());
        self.deliver(src, frame.len())
    }

    fn deliver(&mut self, src: VirtualAddress, len: usize) -> bool {
        if len > self.rx_buffer_len || len > u16::MAX as usize {
            self.stats.rx_oversize += 1;
            return false;
        }
        // acquiring RDT makes the driver's writes to the slots before it visible
        if self.rx_head == self.read_reg(REG_RDT) as u16 {
            self.stats.rx_missed += 1;
            return false;
        }
        let desc = self.rx_desc(self.rx_head);
        let dst = match self.allocator.phys_to_virt(desc.packet_address()) {
            Some(dst) => dst,
            None => {
                error!("{}: RX descriptor {} points at unknown address {:?}", self.name, self.rx_head, desc.packet_address());
                self.stats.rx_missed += 1;
                return false;
            }
        };
        unsafe { ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_mut_ptr::<u8>(), len) };
        // releases the packet data along with DD
        desc.write_back(len as u16, true);

        self.rx_head = if self.rx_head + 1 == self.num_rx_descs { 0 } else { self.rx_head + 1 };
        self.write_reg(REG_RDH, self.rx_head as u32);
        self.stats.rx_packets += 1;
        self.stats.rx_bytes += len as u64;
        true
    }

    /// Processes every transmit descriptor up to the transmit tail.
    ///
    /// Returns the number of packets sent.
    pub fn poll(&mut self) -> usize {
        let tdt = self.read_reg(REG_TDT) as u16;
        let mut sent = 0;
        while self.tx_head != tdt {
            let desc = self.tx_desc(self.tx_head);
            let len = desc.length() as usize;
            match self.allocator.phys_to_virt(desc.packet_address()) {
                Some(src) => {
                    self.deliver(src, len);
                }
                None => error!("{}: TX descriptor {} points at unknown address {:?}", self.name, self.tx_head, desc.packet_address()),
            }
            desc.write_back();

            self.tx_head = if self.tx_head + 1 == self.num_tx_descs { 0 } else { self.tx_head + 1 };
            self.write_reg(REG_TDH, self.tx_head as u32);
            self.stats.tx_packets += 1;
            self.stats.tx_bytes += len as u64;
            sent += 1;
        }
        sent
    }

    /// Moves the device onto its own thread, where it polls until `stop` is set.
    ///
    /// Joining the returned handle gives the device back.
    pub fn spawn(mut self, stop: Arc<AtomicBool>) -> JoinHandle<LoopbackNic> {
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if self.poll() == 0 {
                    std::hint::spin_loop();
                }
            }
            debug!("{}: device thread stopped, {}", self.name, self.stats);
            self
        })
    }
}

impl fmt::Debug for LoopbackNic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackNic")
            .field("name", &self.name)
            .field("rx_head", &self.rx_head)
            .field("tx_head", &self.tx_head)
            .field("stats", &self.stats)
            .finish()
    }
}
