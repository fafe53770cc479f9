//! Memory geometry the driver assumes.

/// 64-bit architecture results in 8 bytes per address.
pub const BYTES_PER_ADDR: usize = core::mem::size_of::<usize>();

/// The lower 12 bits of an address correspond to the page offset.
pub const PAGE_SHIFT: usize = 12;
/// Page size is 4096 bytes, 4KiB pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// The lower 21 bits of an address correspond to the huge page offset.
pub const HUGE_PAGE_SHIFT: usize = 21;
/// Huge pages are 2MiB. DMA memory is carved out of these so that a physically
/// contiguous region never spans two separately-translated pages.
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_SHIFT;
