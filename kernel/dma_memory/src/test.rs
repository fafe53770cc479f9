extern crate std;

use super::*;

#[test]
fn regions_are_zeroed_and_page_aligned() {
    let allocator = HeapDmaAllocator::new();
    let region = allocator.allocate_dma_region(100).unwrap();
    assert_eq!(region.size_in_bytes(), PAGE_SIZE);
    assert!(region.virt_addr().is_aligned_to(PAGE_SIZE));
    let bytes = unsafe {
        core::slice::from_raw_parts(region.virt_addr().as_ptr::<u8>(), region.size_in_bytes())
    };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn large_regions_are_huge_page_aligned() {
    let allocator = HeapDmaAllocator::new();
    let region = allocator.allocate_dma_region(HUGE_PAGE_SIZE).unwrap();
    assert!(region.virt_addr().is_aligned_to(HUGE_PAGE_SIZE));
}

#[test]
fn zero_size_is_rejected() {
    let allocator = HeapDmaAllocator::new();
    assert_eq!(allocator.allocate_dma_region(0), Err(DmaError::ZeroSize));
    assert_eq!(allocator.region_count(), 0);
}

#[test]
fn translation_uses_the_bus_offset() {
    let allocator = HeapDmaAllocator::with_bus_offset(0x1_0000_0000);
    let region = allocator.allocate_dma_region(2 * PAGE_SIZE).unwrap();
    let inside = region.virt_addr() + 0x1234;

    let paddr = allocator.virt_to_phys(inside).unwrap();
    assert_eq!(paddr.value(), inside.value() + 0x1_0000_0000);
    assert_eq!(allocator.phys_to_virt(paddr), Some(inside));

    let past_end = region.virt_addr() + region.size_in_bytes();
    assert_eq!(allocator.virt_to_phys(past_end), Err(DmaError::UnknownAddress(past_end)));
}

#[test]
fn error_converts_to_str() {
    let msg: &'static str = DmaError::OutOfMemory.into();
    assert_eq!(msg, "out of DMA memory");
}

#[test]
fn bus_offset_overflow_is_an_error() {
    let allocator = HeapDmaAllocator::with_bus_offset(usize::MAX);
    assert_eq!(allocator.allocate_dma_region(64), Err(DmaError::OutOfMemory));
    assert_eq!(allocator.region_count(), 0);
}
