//! Defines the buffers that packets are received into and transmitted from.
//!
//! A [`PacketBuffer`] is nothing but the virtual address of one mempool entry.
//! Every entry starts with a small header describing the buffer, followed by
//! headroom and then the packet payload at [`DATA_OFFSET`]:
//!
//! | Offset | Width | Field                                |
//! |--------|-------|--------------------------------------|
//! | 0      | u64   | physical address of the entry        |
//! | 8      | i64   | id of the owning mempool             |
//! | 16     | u32   | index of the entry within its pool   |
//! | 20     | u32   | payload size in bytes                |
//! | 24     | u32   | payload capacity in bytes            |
//! | 64     |       | payload                              |
//!
//! The NIC is given `phys_addr + DATA_OFFSET`, so received bytes land directly
//! in the payload and transmitted bytes are read directly from it.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate zerocopy;
extern crate memory_structs;


use core::{
    fmt,
    mem::size_of,
    ptr::{self, NonNull},
    slice,
};
use alloc::vec::Vec;
use zerocopy::{AsBytes, FromBytes};
use memory_structs::{PhysicalAddress, VirtualAddress};

/// Offset of the entry's physical address (u64).
pub const PHYS_ADDR_OFFSET: usize = 0;
/// Offset of the owning mempool's id (i64).
pub const MEMPOOL_ID_OFFSET: usize = 8;
/// Offset of the entry's index within its mempool (u32).
pub const MEMPOOL_INDEX_OFFSET: usize = 16;
/// Offset of the payload size (u32).
pub const SIZE_OFFSET: usize = 20;
/// Offset of the payload capacity (u32).
pub const CAPACITY_OFFSET: usize = 24;
/// Offset of the payload from the start of the entry.
pub const DATA_OFFSET: usize = 64;

const_assert_eq!(MEMPOOL_ID_OFFSET, PHYS_ADDR_OFFSET + size_of::<u64>());
const_assert_eq!(MEMPOOL_INDEX_OFFSET, MEMPOOL_ID_OFFSET + size_of::<i64>());
const_assert_eq!(SIZE_OFFSET, MEMPOOL_INDEX_OFFSET + size_of::<u32>());
const_assert_eq!(CAPACITY_OFFSET, SIZE_OFFSET + size_of::<u32>());
const_assert!(CAPACITY_OFFSET + size_of::<u32>() <= DATA_OFFSET);
// the payload must stay cacheline-aligned for the NIC's DMA engine
const_assert_eq!(DATA_OFFSET % 64, 0);


/// A packet buffer: a handle to one mempool entry in DMA memory.
///
/// The handle is move-only. At any time it is owned by exactly one of:
/// its mempool's free stack, the application, or a descriptor ring.
/// "No buffer" is expressed as `Option<PacketBuffer>::None`, never as a zero address.
pub struct PacketBuffer {
    base: NonNull<u8>,
}

// A PacketBuffer is the sole handle to its entry, so it can be moved across threads.
unsafe impl Send for PacketBuffer {}

impl PacketBuffer {
    /// Reinterprets the entry at `vaddr` as a packet buffer.
    ///
    /// Returns `None` for the zero address.
    ///
    /// # Safety
    /// `vaddr` must be the start of an initialized mempool entry that is not
    /// currently owned by any other `PacketBuffer`.
    pub unsafe fn from_virt_addr(vaddr: VirtualAddress) -> Option<PacketBuffer> {
        NonNull::new(vaddr.as_mut_ptr::<u8>()).map(|base| PacketBuffer { base })
    }

    /// Writes a fresh header for the entry at `vaddr`, with a size of zero.
    ///
    /// Returns `None` for the zero address.
    ///
    /// # Safety
    /// `vaddr` must point to at least `DATA_OFFSET + capacity` writable bytes
    /// of DMA memory that the device sees at `paddr`, and nothing else may own that entry.
    pub unsafe fn init(
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        pool_id: i64,
        pool_index: u32,
        capacity: u32,
    ) -> Option<PacketBuffer> {
        let buf = PacketBuffer::from_virt_addr(vaddr)?;
        buf.write_header(PHYS_ADDR_OFFSET, paddr.as_u64());
        buf.write_header(MEMPOOL_ID_OFFSET, pool_id);
        buf.write_header(MEMPOOL_INDEX_OFFSET, pool_index);
        buf.write_header(SIZE_OFFSET, 0u32);
        buf.write_header(CAPACITY_OFFSET, capacity);
        Some(buf)
    }

    #[inline(always)]
    fn read_header<T: Copy>(&self, offset: usize) -> T {
        // SAFETY: every header field is naturally aligned within the entry and lies before DATA_OFFSET.
        unsafe { ptr::read_volatile(self.base.as_ptr().add(offset) as *const T) }
    }

    #[inline(always)]
    fn write_header<T: Copy>(&self, offset: usize, value: T) {
        // SAFETY: same as `read_header()`.
        unsafe { ptr::write_volatile(self.base.as_ptr().add(offset) as *mut T, value) }
    }

    #[inline(always)]
    fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: the entry is at least DATA_OFFSET bytes long.
        unsafe { self.base.as_ptr().add(DATA_OFFSET) }
    }

    /// The virtual address of this buffer, i.e., the start of its header.
    pub fn virt_addr(&self) -> VirtualAddress {
        VirtualAddress::new_canonical(self.base.as_ptr() as usize)
    }

    /// The physical address of this buffer, i.e., the start of its header.
    pub fn phys_addr(&self) -> PhysicalAddress {
        PhysicalAddress::from_u64(self.read_header::<u64>(PHYS_ADDR_OFFSET))
    }

    /// The physical address of this buffer's payload, which is what descriptors point at.
    pub fn data_phys_addr(&self) -> PhysicalAddress {
        self.phys_addr() + DATA_OFFSET
    }

    /// The id of the mempool this buffer belongs to.
    pub fn pool_id(&self) -> i64 {
        self.read_header(MEMPOOL_ID_OFFSET)
    }

    /// The index of this buffer's entry within its mempool.
    pub fn pool_index(&self) -> u32 {
        self.read_header(MEMPOOL_INDEX_OFFSET)
    }

    /// The number of valid payload bytes.
    pub fn size(&self) -> u32 {
        self.read_header(SIZE_OFFSET)
    }

    /// The maximum number of payload bytes this buffer can hold.
    pub fn capacity(&self) -> u32 {
        self.read_header(CAPACITY_OFFSET)
    }

    /// Sets the number of valid payload bytes.
    ///
    /// Returns an error if `size` exceeds the buffer's capacity.
    pub fn set_size(&mut self, size: u32) -> Result<(), &'static str> {
        if size > self.capacity() {
            Err("PacketBuffer::set_size(): size exceeds capacity")
        } else {
            self.write_header(SIZE_OFFSET, size);
            Ok(())
        }
    }

    /// Sets the payload size without checking it against the capacity.
    ///
    /// # Safety
    /// `size` must not exceed `self.capacity()`.
    pub unsafe fn set_size_unchecked(&mut self, size: u32) {
        self.write_header(SIZE_OFFSET, size);
    }

    /// Returns `Ok` if `len` bytes starting at payload `offset` fit within the capacity.
    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), &'static str> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity() as usize => Ok(()),
            _ => Err("PacketBuffer: access beyond the payload capacity"),
        }
    }

    /// Writes `value` into the payload at `offset`, in native byte order.
    pub fn write_data<T: AsBytes>(&mut self, offset: usize, value: &T) -> Result<(), &'static str> {
        self.check_bounds(offset, size_of::<T>())?;
        unsafe { self.write_data_unchecked(offset, value) };
        Ok(())
    }

    /// Reads a `T` from the payload at `offset`, in native byte order.
    pub fn read_data<T: FromBytes>(&self, offset: usize) -> Result<T, &'static str> {
        self.check_bounds(offset, size_of::<T>())?;
        Ok(unsafe { self.read_data_unchecked(offset) })
    }

    /// Writes `value` into the payload at `offset` without a bounds check.
    ///
    /// # Safety
    /// `offset + size_of::<T>()` must not exceed `self.capacity()`.
    #[inline]
    pub unsafe fn write_data_unchecked<T: AsBytes>(&mut self, offset: usize, value: &T) {
        let bytes = value.as_bytes();
        ptr::copy_nonoverlapping(bytes.as_ptr(), self.payload_ptr().add(offset), bytes.len());
    }

    /// Reads a `T` from the payload at `offset` without a bounds check.
    ///
    /// # Safety
    /// `offset + size_of::<T>()` must not exceed `self.capacity()`.
    #[inline]
    pub unsafe fn read_data_unchecked<T: FromBytes>(&self, offset: usize) -> T {
        ptr::read_unaligned(self.payload_ptr().add(offset) as *const T)
    }

    /// Copies `bytes` into the payload starting at `offset`.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), &'static str> {
        self.check_bounds(offset, bytes.len())?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.payload_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Increments payload byte 1, a minimal modification that forces the
    /// packet's cache line to be written.
    pub fn touch(&mut self) {
        if self.capacity() > 1 {
            unsafe {
                let byte = self.payload_ptr().add(1);
                *byte = (*byte).wrapping_add(1);
            }
        }
    }

    /// The valid payload bytes, i.e., the first `size()` bytes of the payload.
    pub fn data(&self) -> &[u8] {
        let len = self.size().min(self.capacity()) as usize;
        unsafe { slice::from_raw_parts(self.payload_ptr(), len) }
    }

    /// The valid payload bytes, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.size().min(self.capacity()) as usize;
        unsafe { slice::from_raw_parts_mut(self.payload_ptr(), len) }
    }

    /// Returns an owned copy of the valid payload bytes that doesn't alias DMA memory.
    pub fn copy_data(&self) -> Vec<u8> {
        self.data().to_vec()
    }

    /// Copies `len` payload bytes starting at `offset` into the front of `dst`.
    pub fn copy_data_into(&self, dst: &mut [u8], offset: usize, len: usize) -> Result<(), &'static str> {
        if len > dst.len() {
            return Err("PacketBuffer::copy_data_into(): destination too small");
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.size() as usize => {},
            _ => {
                trace!("copy_data_into: offset {} + len {} past size {}", offset, len, self.size());
                return Err("PacketBuffer::copy_data_into(): range beyond the packet size");
            }
        }
        dst[..len].copy_from_slice(&self.data()[offset..offset + len]);
        Ok(())
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("virt", &self.virt_addr())
            .field("phys", &self.phys_addr())
            .field("pool_id", &self.pool_id())
            .field("pool_index", &self.pool_index())
            .field("size", &self.size())
            .finish()
    }
}
