extern crate std;

use core::sync::atomic::AtomicU32;
use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use memory_structs::VirtualAddress;
use dma_memory::{DmaAllocator, DmaRegion, HeapDmaAllocator};
use nic_buffers::PacketBuffer;
use nic_descriptors::{AdvancedRxDescriptor, AdvancedTxDescriptor, RxDescriptor, TxDescriptor};
use mempool::{Mempool, MempoolConfig, MempoolRegistry};
use super::*;

/// A tail register backed by an ordinary, leaked memory word.
fn tail_register() -> TailRegister {
    let reg: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));
    unsafe { TailRegister::new(VirtualAddress::from_ptr(reg as *const AtomicU32)) }
}

struct Env {
    allocator: HeapDmaAllocator,
    registry: Arc<MempoolRegistry>,
}

impl Env {
    fn new() -> Env {
        Env { allocator: HeapDmaAllocator::new(), registry: Arc::new(MempoolRegistry::new()) }
    }

    fn pool(&self, num_entries: usize) -> Arc<Mempool> {
        Mempool::create(&self.registry, &self.allocator, MempoolConfig::new(num_entries, 2048)).unwrap()
    }

    fn rx_queue(&self, num_descs: u16, pool: Arc<Mempool>) -> RxQueue<AdvancedRxDescriptor> {
        let mut rxq = RxQueue::new(0, num_descs, pool, tail_register()).unwrap();
        let region = self.allocator.allocate_dma_region(num_descs as usize * 16).unwrap();
        rxq.attach_descriptors(region).unwrap();
        rxq.init_descriptors().unwrap();
        rxq
    }

    fn tx_queue(&self, num_descs: u16) -> TxQueue<AdvancedTxDescriptor> {
        let mut txq = TxQueue::new(0, num_descs, self.registry.clone(), tail_register()).unwrap();
        let region = self.allocator.allocate_dma_region(num_descs as usize * 16).unwrap();
        txq.attach_descriptors(region).unwrap();
        txq
    }
}

/// The hardware's view of an RX slot.
fn hw_rx(rxq: &RxQueue<AdvancedRxDescriptor>, i: u16) -> &'static mut AdvancedRxDescriptor {
    unsafe { &mut *rxq.ring().descriptor_address(i).unwrap().as_mut_ptr() }
}

/// The hardware's view of a TX slot.
fn hw_tx(txq: &TxQueue<AdvancedTxDescriptor>, i: u16) -> &'static mut AdvancedTxDescriptor {
    unsafe { &mut *txq.ring().descriptor_address(i).unwrap().as_mut_ptr() }
}

fn filled_bufs(pool: &Mempool, count: usize, size: u32) -> VecDeque<PacketBuffer> {
    let mut bufs = VecDeque::new();
    assert_eq!(pool.alloc_batch(&mut bufs, count), count);
    for buf in bufs.iter_mut() {
        buf.set_size(size).unwrap();
    }
    bufs
}

#[test]
fn unattached_rings_are_rejected() {
    let env = Env::new();
    let pool = env.pool(16);
    let mut rxq: RxQueue<AdvancedRxDescriptor> = RxQueue::new(0, 8, pool.clone(), tail_register()).unwrap();
    let mut txq: TxQueue<AdvancedTxDescriptor> = TxQueue::new(1, 8, env.registry.clone(), tail_register()).unwrap();

    assert_eq!(rxq.ring().descriptor_address(0), Err(QueueError::UninitializedRing));
    assert_eq!(rxq.init_descriptors(), Err(QueueError::UninitializedRing));
    let mut out = VecDeque::new();
    assert_eq!(rxq.rx_batch(&mut out, 4), Err(QueueError::UninitializedRing));

    let mut bufs = filled_bufs(&pool, 2, 60);
    assert_eq!(txq.tx_batch(&mut bufs), Err(QueueError::UninitializedRing));
    assert_eq!(bufs.len(), 2);
    assert_eq!(pool.available(), 14);
}

#[test]
fn ring_geometry_is_validated() {
    assert_eq!(
        DescriptorRing::<AdvancedRxDescriptor>::new(4).err(),
        Some(QueueError::InvalidRingSize(4))
    );
    assert!(DescriptorRing::<AdvancedRxDescriptor>::new(8).is_ok());

    let env = Env::new();
    let region = env.allocator.allocate_dma_region(4096).unwrap();
    let mut ring = DescriptorRing::<AdvancedTxDescriptor>::new(64).unwrap();
    let misaligned = unsafe { DmaRegion::new(region.virt_addr() + 16, region.phys_addr() + 16, 2048) };
    assert!(matches!(ring.attach(misaligned), Err(QueueError::InvalidRegion(_))));
    let too_small = unsafe { DmaRegion::new(region.virt_addr(), region.phys_addr(), 512) };
    assert!(matches!(ring.attach(too_small), Err(QueueError::InvalidRegion(_))));
    assert!(ring.attach(region).is_ok());
    assert_eq!(ring.descriptor_address(3).unwrap(), region.virt_addr() + 48);
    assert_eq!(ring.descriptor_address(63).unwrap(), region.virt_addr() + 63 * 16);
    assert_eq!(ring.phys_addr(), Ok(region.phys_addr()));
}

#[test]
fn descriptor_indices_past_the_ring_are_rejected() {
    let env = Env::new();
    let pool = env.pool(16);
    let rxq = env.rx_queue(8, pool);
    assert!(rxq.ring().descriptor_address(7).is_ok());
    assert_eq!(rxq.ring().descriptor_address(8), Err(QueueError::InvalidIndex(8)));
    assert!(matches!(rxq.ring().descriptor(u16::MAX), Err(QueueError::InvalidIndex(u16::MAX))));
}

#[test]
fn init_arms_every_slot() {
    let env = Env::new();
    let pool = env.pool(16);
    let rxq = env.rx_queue(8, pool.clone());
    assert_eq!(rxq.armed_slots(), 8);
    assert_eq!(pool.available(), 8);
    assert_eq!(rxq.rdt().read(), 7);
    for i in 0..8 {
        let desc = hw_rx(&rxq, i);
        assert!(!desc.descriptor_done());
        assert_eq!(desc.header_address().value(), 0);
        // descriptors point past the buffer header, in pool order
        let expected = pool.base_addr() + i as usize * 2048 + nic_buffers::DATA_OFFSET;
        assert_eq!(desc.packet_address().value(), expected.value());
    }
}

#[test]
fn reinit_counts_buffers_the_pool_refuses() {
    let env = Env::new();
    let pool = env.pool(8);
    let mut rxq = env.rx_queue(8, pool.clone());
    assert_eq!(pool.available(), 0);

    // fill the pool behind the queue's back with second handles to the armed entries
    for i in 0..8 {
        let dup = unsafe { PacketBuffer::from_virt_addr(pool.base_addr() + i * 2048) }.unwrap();
        pool.free_buf(dup).unwrap();
    }
    assert_eq!(pool.available(), 8);

    // the queue can't give its own handles back anymore, but re-arms every slot
    assert_eq!(rxq.init_descriptors(), Ok(8));
    assert_eq!(rxq.lost_buffers(), 8);
    assert_eq!(rxq.armed_slots(), 8);
    assert_eq!(pool.available(), 0);
}

#[test]
fn rx_batch_returns_only_done_slots() {
    let env = Env::new();
    let pool = env.pool(16);
    let mut rxq = env.rx_queue(8, pool.clone());
    let armed_addrs: Vec<_> = (0..3).map(|i| hw_rx(&rxq, i).packet_address()).collect();

    for i in 0..3 {
        hw_rx(&rxq, i).write_back(60 + i, true);
    }
    let mut out = VecDeque::new();
    assert_eq!(rxq.rx_batch(&mut out, 5), Ok(3));
    assert_eq!(out.len(), 3);
    for (i, buf) in out.iter().enumerate() {
        assert_eq!(buf.size(), 60 + i as u32);
        assert_eq!(buf.data_phys_addr(), armed_addrs[i]);
    }

    // exactly the three consumed slots were re-armed with fresh buffers
    assert_eq!(pool.available(), 5);
    assert_eq!(rxq.armed_slots(), 8);
    assert_eq!(rxq.ring().index(), 3);
    assert_eq!(rxq.rdt().read(), 2);
    for i in 0..3 {
        let desc = hw_rx(&rxq, i);
        assert!(!desc.descriptor_done());
        assert!(!armed_addrs.contains(&desc.packet_address()));
    }

    // nothing new: no packets, no tail update
    assert_eq!(rxq.rx_batch(&mut out, 5), Ok(0));
    assert_eq!(out.len(), 3);
    assert_eq!(rxq.rdt().read(), 2);
}

#[test]
fn rx_batch_respects_batch_size() {
    let env = Env::new();
    let pool = env.pool(32);
    let mut rxq = env.rx_queue(8, pool);
    for i in 0..6 {
        hw_rx(&rxq, i).write_back(100, true);
    }
    let mut out = VecDeque::new();
    assert_eq!(rxq.rx_batch(&mut out, 4), Ok(4));
    assert_eq!(rxq.rx_batch(&mut out, 4), Ok(2));
    assert_eq!(out.len(), 6);
    assert_eq!(rxq.ring().index(), 6);
}

#[test]
fn rx_slots_stay_empty_while_pool_is_exhausted() {
    let env = Env::new();
    let pool = env.pool(8);
    let mut rxq = env.rx_queue(8, pool.clone());
    assert_eq!(pool.available(), 0);

    for i in 0..3 {
        hw_rx(&rxq, i).write_back(64, true);
    }
    let mut out = VecDeque::new();
    assert_eq!(rxq.rx_batch(&mut out, 8), Ok(3));
    assert_eq!(rxq.armed_slots(), 5);
    assert_eq!(rxq.rdt().read(), 7);

    // armed slots after the empty ones keep delivering
    hw_rx(&rxq, 3).write_back(64, true);
    assert_eq!(rxq.rx_batch(&mut out, 8), Ok(1));
    assert_eq!(out.len(), 4);

    // give two buffers back: the oldest empty slots get armed on the next call
    for _ in 0..2 {
        pool.free_buf(out.pop_front().unwrap()).unwrap();
    }
    assert_eq!(rxq.rx_batch(&mut out, 8), Ok(0));
    assert_eq!(rxq.armed_slots(), 6);
    assert_eq!(rxq.rdt().read(), 1);
    assert_eq!(pool.available(), 0);
}

#[test]
fn stale_done_bits_on_empty_slots_are_ignored() {
    let env = Env::new();
    let pool = env.pool(8);
    let mut rxq = env.rx_queue(8, pool.clone());
    for i in 0..8 {
        hw_rx(&rxq, i).write_back(64, true);
    }
    let mut out = VecDeque::new();
    assert_eq!(rxq.rx_batch(&mut out, 16), Ok(8));
    assert_eq!(rxq.armed_slots(), 0);
    assert_eq!(rxq.ring().index(), 0);

    // slot 0 still shows its old write-back, but has no buffer behind it
    assert!(hw_rx(&rxq, 0).descriptor_done());
    assert_eq!(rxq.rx_batch(&mut out, 16), Ok(0));
    assert_eq!(out.len(), 8);

    pool.free_buf(out.pop_back().unwrap()).unwrap();
    assert_eq!(rxq.rx_batch(&mut out, 16), Ok(0));
    assert_eq!(rxq.armed_slots(), 1);
    assert_eq!(rxq.rdt().read(), 0);
    assert!(!hw_rx(&rxq, 0).descriptor_done());
}

#[test]
fn rx_wraps_around() {
    let env = Env::new();
    let pool = env.pool(16);
    let mut rxq = env.rx_queue(8, pool.clone());
    let mut out = VecDeque::new();
    for round in 0..20u16 {
        let slot = round % 8;
        hw_rx(&rxq, slot).write_back(round + 1, true);
        assert_eq!(rxq.rx_batch(&mut out, 32), Ok(1));
        let buf = out.pop_front().unwrap();
        assert_eq!(buf.size(), round as u32 + 1);
        pool.free_buf(buf).unwrap();
        assert_eq!(rxq.rdt().read(), slot as u32);
    }
    assert_eq!(rxq.ring().index(), 4);
    assert_eq!(pool.available(), 8);
}

#[test]
fn tx_batch_truncates_to_free_slots() {
    let env = Env::new();
    let pool = env.pool(16);
    let mut txq = env.tx_queue(8);
    assert_eq!(txq.free_slots(), 7);

    let mut bufs = filled_bufs(&pool, 10, 60);
    let first_addr = bufs[0].data_phys_addr();
    assert_eq!(txq.tx_batch(&mut bufs), Ok(7));
    assert_eq!(bufs.len(), 3);
    assert_eq!(txq.free_slots(), 0);
    assert_eq!(txq.tdt().read(), 7);
    assert_eq!(hw_tx(&txq, 0).packet_address(), first_addr);
    assert_eq!(hw_tx(&txq, 0).length(), 60);

    // the remainder is freeable without touching the queued packets
    assert_eq!(pool.free_batch(&mut bufs), 0);
    assert_eq!(pool.available(), 9);
    assert_eq!(txq.in_flight(), 7);

    // hardware finishes three packets: they go back to the pool on the next call
    for i in 0..3 {
        hw_tx(&txq, i).write_back();
    }
    assert_eq!(txq.tx_batch(&mut bufs), Ok(0));
    assert_eq!(pool.available(), 12);
    assert_eq!(txq.free_slots(), 3);
    assert_eq!(txq.tdt().read(), 7);
}

#[test]
fn tx_clean_stops_at_first_pending_slot() {
    let env = Env::new();
    let pool = env.pool(8);
    let mut txq = env.tx_queue(8);
    let mut bufs = filled_bufs(&pool, 4, 60);
    assert_eq!(txq.tx_batch(&mut bufs), Ok(4));
    hw_tx(&txq, 0).write_back();
    hw_tx(&txq, 2).write_back();
    assert_eq!(txq.clean(), Ok(1));
    assert_eq!(txq.in_flight(), 3);
    hw_tx(&txq, 1).write_back();
    hw_tx(&txq, 3).write_back();
    assert_eq!(txq.clean(), Ok(3));
    assert_eq!(pool.available(), 8);
}

#[test]
fn tx_returns_buffers_to_their_own_pools() {
    let env = Env::new();
    let a = env.pool(4);
    let b = env.pool(4);
    let mut txq = env.tx_queue(8);
    let mut bufs = filled_bufs(&a, 2, 60);
    bufs.extend(filled_bufs(&b, 3, 60));
    assert_eq!(txq.tx_batch(&mut bufs), Ok(5));
    for i in 0..5 {
        hw_tx(&txq, i).write_back();
    }
    assert_eq!(txq.clean(), Ok(5));
    assert_eq!(a.available(), 4);
    assert_eq!(b.available(), 4);
}

#[test]
fn tx_stops_at_unsendable_sizes() {
    let env = Env::new();
    let pool = env.pool(8);
    let mut txq = env.tx_queue(8);
    let mut bufs = filled_bufs(&pool, 4, 60);
    bufs[2].set_size(0).unwrap();

    // the two buffers before the bad one are queued and reported
    assert_eq!(txq.tx_batch(&mut bufs), Ok(2));
    assert_eq!(bufs.len(), 2);
    assert_eq!(bufs[0].size(), 0);
    assert_eq!(txq.in_flight(), 2);
    assert_eq!(txq.tdt().read(), 2);

    // with the bad buffer in front, nothing is queued and the call fails
    assert_eq!(txq.tx_batch(&mut bufs), Err(QueueError::InvalidBufferSize(0)));
    assert_eq!(bufs.len(), 2);
    assert_eq!(txq.in_flight(), 2);
    assert_eq!(txq.tdt().read(), 2);

    let bad = bufs.pop_front().unwrap();
    pool.free_buf(bad).unwrap();
    assert_eq!(txq.tx_batch(&mut bufs), Ok(1));
    assert_eq!(txq.tdt().read(), 3);
}

#[test]
fn busy_wait_reports_what_it_queued_before_a_bad_buffer() {
    let env = Env::new();
    let pool = env.pool(8);
    let mut txq = env.tx_queue(8);
    let mut bufs = filled_bufs(&pool, 5, 60);
    bufs[3].set_size(0).unwrap();
    assert_eq!(txq.tx_batch_busy_wait(&mut bufs), Ok(3));
    assert_eq!(bufs.len(), 2);
    assert_eq!(bufs[0].size(), 0);
    assert_eq!(txq.in_flight(), 3);

    assert_eq!(txq.tx_batch_busy_wait(&mut bufs), Err(QueueError::InvalidBufferSize(0)));
    assert_eq!(txq.in_flight(), 3);
}

#[test]
fn received_buffers_are_sent_without_copying() {
    let env = Env::new();
    let pool = env.pool(16);
    let mut rxq = env.rx_queue(8, pool.clone());
    let mut txq = env.tx_queue(8);

    let rx_addr = hw_rx(&rxq, 0).packet_address();
    hw_rx(&rxq, 0).write_back(42, true);
    let mut batch = VecDeque::new();
    assert_eq!(rxq.rx_batch(&mut batch, 32), Ok(1));
    batch[0].touch();
    assert_eq!(txq.tx_batch(&mut batch), Ok(1));
    assert!(batch.is_empty());
    assert_eq!(hw_tx(&txq, 0).packet_address(), rx_addr);
    assert_eq!(hw_tx(&txq, 0).length(), 42);

    let before = pool.available();
    hw_tx(&txq, 0).write_back();
    assert_eq!(txq.clean(), Ok(1));
    assert_eq!(pool.available(), before + 1);
}

#[test]
fn busy_wait_sends_everything_when_slots_are_free() {
    let env = Env::new();
    let pool = env.pool(8);
    let mut txq = env.tx_queue(8);
    let mut bufs = filled_bufs(&pool, 5, 60);
    assert_eq!(txq.tx_batch_busy_wait(&mut bufs), Ok(5));
    assert!(bufs.is_empty());
}
