use alloc::{collections::VecDeque, sync::Arc};
use dma_memory::DmaRegion;
use nic_buffers::PacketBuffer;
use nic_descriptors::RxDescriptor;
use mempool::Mempool;
use crate::{DescriptorRing, QueueError, TailRegister};


/// A struct that holds all information for one receive queue.
/// There should be one such object per queue.
pub struct RxQueue<D: RxDescriptor> {
    /// The number of the queue, stored here for our convenience.
    pub id: u8,
    ring: DescriptorRing<D>,
    /// The pool that receive buffers are taken from.
    mempool: Arc<Mempool>,
    /// The register the hardware reads to find out how far it may fill the ring.
    rdt: TailRegister,
    /// The oldest slot that was handed to the application and not yet re-armed.
    refill_index: u16,
    /// The number of consecutive slots starting at `refill_index` that have no buffer.
    /// They stay empty while the mempool is exhausted.
    vacant: u16,
    /// Buffers the mempool refused to take back when the ring was re-initialized.
    lost_buffers: usize,
}

impl<D: RxDescriptor> RxQueue<D> {
    /// Creates a receive queue of `num_descs` slots whose buffers come from `mempool`.
    ///
    /// The descriptor memory must be attached and the descriptors initialized before receiving.
    pub fn new(id: u8, num_descs: u16, mempool: Arc<Mempool>, rdt: TailRegister) -> Result<RxQueue<D>, QueueError> {
        Ok(RxQueue {
            id,
            ring: DescriptorRing::new(num_descs)?,
            mempool,
            rdt,
            refill_index: 0,
            vacant: num_descs,
            lost_buffers: 0,
        })
    }

    /// Uses `region` for this queue's descriptors.
    pub fn attach_descriptors(&mut self, region: DmaRegion) -> Result<(), QueueError> {
        self.ring.attach(region)
    }

    pub fn ring(&self) -> &DescriptorRing<D> {
        &self.ring
    }

    /// The receive descriptor tail register of this queue.
    pub fn rdt(&self) -> &TailRegister {
        &self.rdt
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    /// The number of buffers this queue has dropped because their mempool refused them.
    pub fn lost_buffers(&self) -> usize {
        self.lost_buffers
    }

    /// The number of slots currently armed with a buffer.
    pub fn armed_slots(&self) -> u16 {
        self.ring.num_descs() - self.vacant
    }

    /// Arms every slot of the ring with a buffer from the mempool and hands them to hardware.
    ///
    /// Returns the number of slots armed. Slots for which the mempool had no
    /// buffer are armed later by [`rx_batch()`](Self::rx_batch).
    pub fn init_descriptors(&mut self) -> Result<u16, QueueError> {
        self.ring.descriptor_address(0)?;
        let mut refused = 0;
        for i in 0..self.ring.num_descs() {
            if let Some(old) = self.ring.take_buffer(i) {
                if self.mempool.free_buf(old).is_err() {
                    refused += 1;
                }
            }
        }
        if refused > 0 {
            error!("RxQueue {}: mempool {} refused {} previously armed buffers", self.id, self.mempool.id(), refused);
            self.lost_buffers += refused;
        }
        self.ring.set_index(0);
        self.refill_index = 0;
        self.vacant = self.ring.num_descs();
        self.refill()?;
        let armed = self.armed_slots();
        if self.vacant > 0 {
            warn!("RxQueue {}: mempool {} could only arm {} of {} descriptors",
                self.id, self.mempool.id(), armed, self.ring.num_descs());
        }
        debug!("RxQueue {}: initialized with {} armed descriptors", self.id, armed);
        Ok(armed)
    }

    /// Arms vacant slots in ring order for as long as the mempool has buffers.
    /// Writes the tail register if anything was armed.
    fn refill(&mut self) -> Result<u16, QueueError> {
        self.ring.descriptor_address(0)?;
        let mut last_armed = None;
        let mut armed = 0;
        while self.vacant > 0 {
            let buf = match self.mempool.try_alloc_buf() {
                Some(buf) => buf,
                None => break,
            };
            let slot = self.refill_index;
            self.ring.descriptor_mut(slot)?.init(buf.data_phys_addr());
            self.ring.set_buffer(slot, buf);
            last_armed = Some(slot);
            self.refill_index = self.ring.next(slot);
            self.vacant -= 1;
            armed += 1;
        }
        if let Some(slot) = last_armed {
            self.rdt.write(slot as u32);
        }
        Ok(armed)
    }

    /// Receives up to `batch_size` packets, appending their buffers to `bufs`.
    ///
    /// Returns the number of packets received, which may be zero. Every slot
    /// that was emptied is re-armed with a fresh buffer from the mempool; slots
    /// the mempool can't cover stay empty until a later call.
    pub fn rx_batch(&mut self, bufs: &mut VecDeque<PacketBuffer>, batch_size: usize) -> Result<usize, QueueError> {
        let mut rx_index = self.ring.index();
        let mut received = 0;

        while received < batch_size {
            let desc = self.ring.descriptor(rx_index)?;
            if !desc.descriptor_done() || !self.ring.has_buffer(rx_index) {
                break;
            }
            let length = desc.length();
            if !desc.end_of_packet() {
                error!("RxQueue {}: slot {} holds a partial frame ({} bytes), multi-buffer frames are unsupported",
                    self.id, rx_index, length);
            }

            let mut buf = match self.ring.take_buffer(rx_index) {
                Some(buf) => buf,
                None => break,
            };
            if buf.set_size(length as u32).is_err() {
                error!("RxQueue {}: slot {} reported {} bytes, more than the buffer holds", self.id, rx_index, length);
                let capacity = buf.capacity();
                let _ = buf.set_size(capacity);
            }
            bufs.push_back(buf);

            self.vacant += 1;
            rx_index = self.ring.next(rx_index);
            received += 1;
        }
        self.ring.set_index(rx_index);

        let rearmed = self.refill()?;
        if self.vacant > 0 && received > 0 {
            warn!("RxQueue {}: mempool {} exhausted, {} slots left empty", self.id, self.mempool.id(), self.vacant);
        }
        if received > 0 {
            trace!("RxQueue {}: received {} packets, re-armed {} slots", self.id, received, rearmed);
        }
        Ok(received)
    }
}
