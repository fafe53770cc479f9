//! The state shared by receive and transmit rings.

use core::{
    marker::PhantomData,
    mem::size_of,
    sync::atomic::{AtomicU32, Ordering},
};
use alloc::vec::Vec;
use memory_structs::{PhysicalAddress, VirtualAddress};
use kernel_config::nic::{RING_ALIGNMENT, RING_LENGTH_GRANULARITY};
use dma_memory::{DmaAllocator, DmaRegion};
use nic_buffers::PacketBuffer;
use crate::QueueError;


/// A memory-mapped queue tail register (RDT or TDT).
///
/// Moving the tail is what hands descriptors over to the device, so the tail
/// is written with release semantics: a device that observes the new value
/// also observes every descriptor written before it.
#[derive(Debug)]
pub struct TailRegister {
    addr: VirtualAddress,
}

impl TailRegister {
    /// # Safety
    /// `addr` must be a valid, 4-byte aligned, mapped register (or memory standing in for one)
    /// for the lifetime of the returned object, and only ever be accessed atomically.
    pub unsafe fn new(addr: VirtualAddress) -> TailRegister {
        TailRegister { addr }
    }

    fn register(&self) -> &AtomicU32 {
        // SAFETY: guaranteed by the caller of `new()`.
        unsafe { &*self.addr.as_ptr::<AtomicU32>() }
    }

    /// Updates the queue tail.
    pub fn write(&self, val: u32) {
        self.register().store(val, Ordering::Release)
    }

    pub fn read(&self) -> u32 {
        self.register().load(Ordering::Acquire)
    }

    pub fn addr(&self) -> VirtualAddress {
        self.addr
    }
}


/// A ring of `num_descs` descriptors of type `D` in DMA memory,
/// plus the side table of buffers backing each slot.
pub struct DescriptorRing<D> {
    num_descs: u16,
    /// The next slot software will look at.
    index: u16,
    /// The descriptors themselves; `None` until memory is attached.
    region: Option<DmaRegion>,
    /// `bufs_in_use[i]` is the buffer that `descriptor(i)` points at, if any.
    bufs_in_use: Vec<Option<PacketBuffer>>,
    _desc: PhantomData<D>,
}

impl<D> DescriptorRing<D> {
    /// Creates a ring with no descriptor memory attached yet.
    ///
    /// The ring's byte length must be a non-zero multiple of 128.
    pub fn new(num_descs: u16) -> Result<DescriptorRing<D>, QueueError> {
        let ring_bytes = num_descs as usize * size_of::<D>();
        if num_descs < 2 || ring_bytes % RING_LENGTH_GRANULARITY != 0 {
            return Err(QueueError::InvalidRingSize(num_descs));
        }
        let mut bufs_in_use = Vec::with_capacity(num_descs as usize);
        bufs_in_use.resize_with(num_descs as usize, || None);
        Ok(DescriptorRing {
            num_descs,
            index: 0,
            region: None,
            bufs_in_use,
            _desc: PhantomData,
        })
    }

    /// Allocates zeroed descriptor memory for `num_descs` descriptors and attaches it.
    pub fn allocate(num_descs: u16, allocator: &dyn DmaAllocator) -> Result<DescriptorRing<D>, QueueError> {
        let mut ring = DescriptorRing::new(num_descs)?;
        let region = allocator.allocate_dma_region(ring.size_in_bytes())
            .map_err(|_| QueueError::InvalidRegion("couldn't allocate descriptor memory"))?;
        ring.attach(region)?;
        Ok(ring)
    }

    /// Uses `region` as the memory holding this ring's descriptors.
    pub fn attach(&mut self, region: DmaRegion) -> Result<(), QueueError> {
        if region.size_in_bytes() < self.size_in_bytes() {
            return Err(QueueError::InvalidRegion("region is too small for the ring"));
        }
        if !region.phys_addr().is_aligned_to(RING_ALIGNMENT) || !region.virt_addr().is_aligned_to(RING_ALIGNMENT) {
            return Err(QueueError::InvalidRegion("descriptor ring must be 128-byte aligned"));
        }
        trace!("DescriptorRing: attached {} descriptors at {:?} ({:?})", self.num_descs, region.virt_addr(), region.phys_addr());
        self.region = Some(region);
        Ok(())
    }

    pub fn num_descs(&self) -> u16 {
        self.num_descs
    }

    /// The ring's length in bytes, as programmed into the length register.
    pub fn size_in_bytes(&self) -> usize {
        self.num_descs as usize * size_of::<D>()
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: u16) {
        self.index = index;
    }

    /// Returns the slot after `i`, wrapping around.
    #[inline]
    pub fn next(&self, i: u16) -> u16 {
        if i + 1 == self.num_descs { 0 } else { i + 1 }
    }

    /// The descriptor memory, if attached.
    pub fn region(&self) -> Option<DmaRegion> {
        self.region
    }

    /// The physical base address programmed into the device's base address registers.
    pub fn phys_addr(&self) -> Result<PhysicalAddress, QueueError> {
        self.region.map(|r| r.phys_addr()).ok_or(QueueError::UninitializedRing)
    }

    /// The virtual address of descriptor `i`.
    pub fn descriptor_address(&self, i: u16) -> Result<VirtualAddress, QueueError> {
        let region = self.region.ok_or(QueueError::UninitializedRing)?;
        if i >= self.num_descs {
            return Err(QueueError::InvalidIndex(i));
        }
        Ok(region.virt_addr() + i as usize * size_of::<D>())
    }

    pub fn descriptor(&self, i: u16) -> Result<&D, QueueError> {
        let addr = self.descriptor_address(i)?;
        // SAFETY: the attached region holds `num_descs` descriptors and lives forever.
        Ok(unsafe { &*addr.as_ptr::<D>() })
    }

    pub fn descriptor_mut(&mut self, i: u16) -> Result<&mut D, QueueError> {
        let addr = self.descriptor_address(i)?;
        // SAFETY: as above; `&mut self` makes this the only driver-side reference, and the
        // device only touches slots that were handed to it through the tail register.
        Ok(unsafe { &mut *addr.as_mut_ptr::<D>() })
    }

    /// Records `buf` as the buffer backing slot `i`, returning the previous one.
    pub(crate) fn set_buffer(&mut self, i: u16, buf: PacketBuffer) -> Option<PacketBuffer> {
        self.bufs_in_use[i as usize].replace(buf)
    }

    pub(crate) fn take_buffer(&mut self, i: u16) -> Option<PacketBuffer> {
        self.bufs_in_use[i as usize].take()
    }

    pub(crate) fn has_buffer(&self, i: u16) -> bool {
        self.bufs_in_use[i as usize].is_some()
    }
}
