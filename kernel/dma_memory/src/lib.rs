//! DMA memory: regions that both the CPU and the NIC can address.
//!
//! A [`DmaRegion`] is physically contiguous and stays mapped for the rest of the
//! process's life; nothing in the driver ever gives one back. Where regions come
//! from is abstracted behind the [`DmaAllocator`] trait, so the same pools and
//! rings run on top of hugepage-backed memory or the plain heap.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate memory_structs;
extern crate kernel_config;

#[cfg(test)]
mod test;

use core::fmt;
use alloc::{
    alloc::{alloc_zeroed, dealloc, Layout},
    vec::Vec,
};
use spin::Mutex;
use kernel_config::memory::{HUGE_PAGE_SIZE, PAGE_SIZE};
pub use memory_structs::{PhysicalAddress, VirtualAddress};


/// A physically-contiguous span of memory visible to both the CPU and the device.
///
/// Immutable once obtained. It's `Copy` because it's only a description;
/// the memory itself is owned by whichever pool or ring requested it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaRegion {
    virt: VirtualAddress,
    phys: PhysicalAddress,
    size: usize,
}

impl DmaRegion {
    /// Describes an already-mapped region.
    ///
    /// # Safety
    /// `virt` must be valid for reads and writes of `size` bytes for the rest of
    /// the process, and the device must see that memory at `phys`.
    pub unsafe fn new(virt: VirtualAddress, phys: PhysicalAddress, size: usize) -> DmaRegion {
        DmaRegion { virt, phys, size }
    }

    pub fn virt_addr(&self) -> VirtualAddress {
        self.virt
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size
    }

    /// Returns true if `vaddr` falls within this region.
    pub fn contains_virt(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.virt && (vaddr - self.virt) < self.size
    }

    /// Returns true if `paddr` falls within this region.
    pub fn contains_phys(&self, paddr: PhysicalAddress) -> bool {
        paddr >= self.phys && (paddr - self.phys) < self.size
    }

    /// Translates a virtual address inside this region into the device's view of it.
    pub fn translate_virt(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        if self.contains_virt(vaddr) {
            Some(self.phys + (vaddr - self.virt))
        } else {
            None
        }
    }

    /// Translates a device address inside this region into the CPU's view of it.
    pub fn translate_phys(&self, paddr: PhysicalAddress) -> Option<VirtualAddress> {
        if self.contains_phys(paddr) {
            Some(self.virt + (paddr - self.phys))
        } else {
            None
        }
    }
}


/// The errors that can occur when obtaining or translating DMA memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaError {
    /// A zero-byte region was requested.
    ZeroSize,
    /// The backing allocator couldn't provide the memory.
    OutOfMemory,
    /// The address isn't inside any region handed out by this allocator.
    UnknownAddress(VirtualAddress),
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmaError::ZeroSize => write!(f, "requested a zero-sized DMA region"),
            DmaError::OutOfMemory => write!(f, "out of DMA memory"),
            DmaError::UnknownAddress(vaddr) => write!(f, "{} is not in any DMA region", vaddr),
        }
    }
}

impl From<DmaError> for &'static str {
    fn from(error: DmaError) -> Self {
        match error {
            DmaError::ZeroSize => "requested a zero-sized DMA region",
            DmaError::OutOfMemory => "out of DMA memory",
            DmaError::UnknownAddress(_) => "address is not in any DMA region",
        }
    }
}


/// The source of DMA memory and of virtual-to-physical translation for it.
///
/// Pools and rings only talk to this trait; the platform decides whether the
/// memory is hugepage-backed, IOMMU-mapped, or simulated.
pub trait DmaAllocator: Send + Sync {
    /// Obtains a new physically-contiguous region of at least `size_in_bytes`, zero-filled.
    fn allocate_dma_region(&self, size_in_bytes: usize) -> Result<DmaRegion, DmaError>;

    /// Returns the physical address the device must use for `vaddr`.
    fn virt_to_phys(&self, vaddr: VirtualAddress) -> Result<PhysicalAddress, DmaError>;

    /// Returns the virtual address at which the CPU sees `paddr`, if known.
    ///
    /// Only a simulated device needs this, so the default is `None`.
    fn phys_to_virt(&self, _paddr: PhysicalAddress) -> Option<VirtualAddress> {
        None
    }
}


/// A [`DmaAllocator`] backed by zeroed, page-aligned heap memory.
///
/// The "physical" address of each region is its virtual address plus a fixed
/// bus offset, which lets tests tell the two address spaces apart.
/// Regions are leaked on purpose; DMA memory lives until the process exits.
pub struct HeapDmaAllocator {
    bus_offset: usize,
    regions: Mutex<Vec<DmaRegion>>,
}

impl HeapDmaAllocator {
    /// Creates an allocator whose physical addresses equal the virtual ones.
    pub const fn new() -> HeapDmaAllocator {
        HeapDmaAllocator::with_bus_offset(0)
    }

    /// Creates an allocator that reports `phys = virt + bus_offset`.
    pub const fn with_bus_offset(bus_offset: usize) -> HeapDmaAllocator {
        HeapDmaAllocator {
            bus_offset,
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of regions handed out so far.
    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }
}

impl Default for HeapDmaAllocator {
    fn default() -> Self {
        HeapDmaAllocator::new()
    }
}

impl DmaAllocator for HeapDmaAllocator {
    fn allocate_dma_region(&self, size_in_bytes: usize) -> Result<DmaRegion, DmaError> {
        if size_in_bytes == 0 {
            return Err(DmaError::ZeroSize);
        }
        // round up to a whole number of pages; anything huge-page-sized or bigger
        // gets huge-page alignment so buffers never straddle a huge page boundary
        let size = size_in_bytes.checked_add(PAGE_SIZE - 1).ok_or(DmaError::OutOfMemory)? & !(PAGE_SIZE - 1);
        let align = if size >= HUGE_PAGE_SIZE { HUGE_PAGE_SIZE } else { PAGE_SIZE };
        let layout = Layout::from_size_align(size, align).map_err(|_| DmaError::OutOfMemory)?;

        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            error!("HeapDmaAllocator: couldn't allocate {} bytes", size);
            return Err(DmaError::OutOfMemory);
        }

        let virt = VirtualAddress::new_canonical(ptr as usize);
        let phys = match virt.value().checked_add(self.bus_offset) {
            Some(bus_addr) => PhysicalAddress::new_canonical(bus_addr),
            None => {
                error!("HeapDmaAllocator: bus offset {:#X} pushes {:?} past the address space", self.bus_offset, virt);
                // SAFETY: allocated above with the same layout and never handed out.
                unsafe { dealloc(ptr, layout) };
                return Err(DmaError::OutOfMemory);
            }
        };
        let region = DmaRegion { virt, phys, size };
        debug!("HeapDmaAllocator: allocated DMA region {:?} -> {:?}, {} bytes", virt, phys, size);
        self.regions.lock().push(region);
        Ok(region)
    }

    fn virt_to_phys(&self, vaddr: VirtualAddress) -> Result<PhysicalAddress, DmaError> {
        self.regions.lock()
            .iter()
            .find_map(|r| r.translate_virt(vaddr))
            .ok_or(DmaError::UnknownAddress(vaddr))
    }

    fn phys_to_virt(&self, paddr: PhysicalAddress) -> Option<VirtualAddress> {
        self.regions.lock()
            .iter()
            .find_map(|r| r.translate_phys(paddr))
    }
}
