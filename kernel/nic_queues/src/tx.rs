use alloc::{collections::VecDeque, sync::Arc};
use dma_memory::DmaRegion;
use nic_buffers::PacketBuffer;
use nic_descriptors::TxDescriptor;
use mempool::{Mempool, MempoolRegistry};
use crate::{DescriptorRing, QueueError, TailRegister};


/// A struct that holds all information for a transmit queue.
/// There should be one such object per queue.
pub struct TxQueue<D: TxDescriptor> {
    /// The number of the queue, stored here for our convenience.
    pub id: u8,
    ring: DescriptorRing<D>,
    /// The register that tells the hardware how far it may send.
    tdt: TailRegister,
    /// The oldest slot whose buffer hasn't been returned to its pool yet.
    clean_index: u16,
    /// Used to find the pool each sent buffer goes back to.
    registry: Arc<MempoolRegistry>,
    /// The pool the last cleaned buffer went back to; usually all buffers share one.
    last_pool: Option<Arc<Mempool>>,
}

impl<D: TxDescriptor> TxQueue<D> {
    /// Creates a transmit queue of `num_descs` slots. Sent buffers are returned
    /// to whichever pool in `registry` their header names.
    pub fn new(id: u8, num_descs: u16, registry: Arc<MempoolRegistry>, tdt: TailRegister) -> Result<TxQueue<D>, QueueError> {
        Ok(TxQueue {
            id,
            ring: DescriptorRing::new(num_descs)?,
            tdt,
            clean_index: 0,
            registry,
            last_pool: None,
        })
    }

    /// Uses `region` for this queue's descriptors and clears them.
    pub fn attach_descriptors(&mut self, region: DmaRegion) -> Result<(), QueueError> {
        self.ring.attach(region)?;
        for i in 0..self.ring.num_descs() {
            self.ring.descriptor_mut(i)?.init();
        }
        Ok(())
    }

    pub fn ring(&self) -> &DescriptorRing<D> {
        &self.ring
    }

    /// The transmit descriptor tail register of this queue.
    pub fn tdt(&self) -> &TailRegister {
        &self.tdt
    }

    /// The number of packets handed to hardware whose buffers haven't been reclaimed yet.
    pub fn in_flight(&self) -> u16 {
        let n = self.ring.num_descs() as u32;
        ((self.ring.index() as u32 + n - self.clean_index as u32) % n) as u16
    }

    /// The number of packets that can be queued right now.
    /// One slot always stays empty so that a full ring can be told apart from an empty one.
    pub fn free_slots(&self) -> u16 {
        self.ring.num_descs() - 1 - self.in_flight()
    }

    /// Returns the buffers of every packet the hardware has finished sending to their pools.
    ///
    /// Returns the number of slots reclaimed.
    pub fn clean(&mut self) -> Result<usize, QueueError> {
        let mut cleaned = 0;
        while self.clean_index != self.ring.index() {
            if !self.ring.descriptor(self.clean_index)?.descriptor_done() {
                break;
            }
            if let Some(buf) = self.ring.take_buffer(self.clean_index) {
                self.return_to_pool(buf);
            }
            self.clean_index = self.ring.next(self.clean_index);
            cleaned += 1;
        }
        Ok(cleaned)
    }

    fn return_to_pool(&mut self, buf: PacketBuffer) {
        let pool_id = buf.pool_id();
        let cached = self.last_pool.as_ref().filter(|pool| pool.id() == pool_id).cloned();
        let pool = match cached.or_else(|| self.registry.find(pool_id)) {
            Some(pool) => pool,
            None => {
                error!("TxQueue {}: sent buffer {:?} names mempool {}, which doesn't exist", self.id, buf, pool_id);
                return;
            }
        };
        self.last_pool = Some(pool.clone());
        if let Err(buf) = pool.free_buf(buf) {
            error!("TxQueue {}: mempool {} refused sent buffer {:?}", self.id, pool_id, buf);
        }
    }

    /// Queues the buffers at the front of `bufs` for transmission, as many as there are free slots.
    ///
    /// Returns the number of buffers accepted; those are removed from `bufs`
    /// and the rest stay there for the caller to retry or free.
    ///
    /// Queuing stops at the first buffer whose size is zero or too large to send,
    /// leaving it at the front of `bufs`. If that is the very first buffer, nothing
    /// is queued and [`QueueError::InvalidBufferSize`] is returned, so an `Err`
    /// always means the hardware was handed nothing.
    pub fn tx_batch(&mut self, bufs: &mut VecDeque<PacketBuffer>) -> Result<usize, QueueError> {
        self.ring.descriptor_address(0)?;
        self.clean()?;

        let mut tx_index = self.ring.index();
        let mut sent = 0;
        let mut free = self.free_slots();
        while free > 0 {
            let size = match bufs.front() {
                Some(buf) => buf.size(),
                None => break,
            };
            if size == 0 || size > u16::MAX as u32 {
                if sent == 0 {
                    return Err(QueueError::InvalidBufferSize(size));
                }
                warn!("TxQueue {}: stopping the batch at a {}-byte buffer", self.id, size);
                break;
            }
            let buf = match bufs.pop_front() {
                Some(buf) => buf,
                None => break,
            };
            self.ring.descriptor_mut(tx_index)?.send(buf.data_phys_addr(), size as u16);
            if let Some(stale) = self.ring.set_buffer(tx_index, buf) {
                error!("TxQueue {}: slot {} still held {:?}", self.id, tx_index, stale);
            }
            tx_index = self.ring.next(tx_index);
            free -= 1;
            sent += 1;
        }

        if sent > 0 {
            self.ring.set_index(tx_index);
            self.tdt.write(tx_index as u32);
            trace!("TxQueue {}: queued {} packets, tail {}", self.id, sent, tx_index);
        }
        Ok(sent)
    }

    /// Keeps calling [`tx_batch()`](Self::tx_batch) until every buffer in `bufs` has been queued.
    ///
    /// This spins while the ring is full, so it only makes progress if the
    /// hardware (or whatever plays its part) runs concurrently.
    /// A buffer that can't be sent ends the wait early and stays at the front of `bufs`;
    /// as with `tx_batch()`, an `Err` means nothing was queued by this call.
    pub fn tx_batch_busy_wait(&mut self, bufs: &mut VecDeque<PacketBuffer>) -> Result<usize, QueueError> {
        let mut sent = 0;
        while !bufs.is_empty() {
            match self.tx_batch(bufs) {
                Ok(n) => sent += n,
                Err(QueueError::InvalidBufferSize(_)) if sent > 0 => break,
                Err(e) => return Err(e),
            }
            core::hint::spin_loop();
        }
        Ok(sent)
    }
}
