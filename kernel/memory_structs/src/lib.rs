//! This crate contains the basic address types used by the driver.
//!
//! * `VirtualAddress`: what software dereferences.
//! * `PhysicalAddress`: what the NIC is told to DMA to and from.
//!
//! Both are plain `usize`s under the hood; keeping them as distinct types
//! makes it a type error to hand a virtual address to the device.

#![no_std]


use core::{
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};
use kernel_config::memory::PAGE_SIZE;
use zerocopy::FromBytes;
use derive_more::*;

/// A macro for defining `VirtualAddress` and `PhysicalAddress` structs
/// and implementing their common traits, which are generally identical.
macro_rules! implement_address {
    ($TypeName:ident, $desc:literal, $prefix:literal, $is_canonical:ident, $canonicalize:ident) => {
        #[doc = concat!("A ", $desc, " memory address, which is a `usize` under the hood.")]
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
            Binary, Octal, LowerHex, UpperHex,
            BitAnd, BitOr, BitXor, BitAndAssign, BitOrAssign, BitXorAssign,
            FromBytes,
        )]
        #[repr(transparent)]
        pub struct $TypeName(usize);

        impl $TypeName {
            #[doc = concat!("Creates a new `", stringify!($TypeName), "`, returning `None` if the address is not canonical.")]
            pub fn new(addr: usize) -> Option<$TypeName> {
                if $is_canonical(addr) { Some($TypeName(addr)) } else { None }
            }

            #[doc = concat!("Creates a new `", stringify!($TypeName), "` that is guaranteed to be canonical.")]
            pub const fn new_canonical(addr: usize) -> $TypeName {
                $TypeName($canonicalize(addr))
            }

            #[doc = concat!("Creates a new `", stringify!($TypeName), "` with a value 0.")]
            pub const fn zero() -> $TypeName {
                $TypeName(0)
            }

            #[doc = concat!("Returns the underlying `usize` value for this `", stringify!($TypeName), "`.")]
            #[inline]
            pub const fn value(&self) -> usize {
                self.0
            }

            /// Returns `true` if this is the zero address.
            #[inline]
            pub const fn is_zero(&self) -> bool {
                self.0 == 0
            }

            /// Returns the offset of this address from the start of its 4KiB page (or frame).
            pub const fn page_offset(&self) -> usize {
                self.0 & (PAGE_SIZE - 1)
            }

            /// Returns `true` if this address is a multiple of `align`, which must be a power of two.
            pub const fn is_aligned_to(&self, align: usize) -> bool {
                self.0 & (align - 1) == 0
            }
        }
        impl fmt::Debug for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!($prefix, "{:#X}"), self.0)
            }
        }
        impl fmt::Display for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{:?}", self)
            }
        }
        impl fmt::Pointer for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{:?}", self)
            }
        }
        impl Add<usize> for $TypeName {
            type Output = $TypeName;
            fn add(self, rhs: usize) -> $TypeName {
                $TypeName::new_canonical(self.0.saturating_add(rhs))
            }
        }
        impl AddAssign<usize> for $TypeName {
            fn add_assign(&mut self, rhs: usize) {
                *self = $TypeName::new_canonical(self.0.saturating_add(rhs));
            }
        }
        impl Sub<usize> for $TypeName {
            type Output = $TypeName;
            fn sub(self, rhs: usize) -> $TypeName {
                $TypeName::new_canonical(self.0.saturating_sub(rhs))
            }
        }
        impl SubAssign<usize> for $TypeName {
            fn sub_assign(&mut self, rhs: usize) {
                *self = $TypeName::new_canonical(self.0.saturating_sub(rhs));
            }
        }
        impl Sub<$TypeName> for $TypeName {
            type Output = usize;
            fn sub(self, rhs: $TypeName) -> usize {
                self.0.saturating_sub(rhs.0)
            }
        }

        #[allow(clippy::from_over_into)]
        impl Into<usize> for $TypeName {
            #[inline]
            fn into(self) -> usize {
                self.0
            }
        }
    };
}

#[cfg(target_arch = "x86_64")]
mod canonical_address {
    use bit_field::BitField;

    #[inline]
    pub fn is_canonical_virtual_address(virt_addr: usize) -> bool {
        matches!(virt_addr.get_bits(47..64), 0 | 0b1_1111_1111_1111_1111)
    }

    #[inline]
    pub const fn canonicalize_virtual_address(virt_addr: usize) -> usize {
        // sign-extend bit 47 into the upper 16 bits
        ((virt_addr << 16) as isize >> 16) as usize
    }

    #[inline]
    pub fn is_canonical_physical_address(phys_addr: usize) -> bool {
        matches!(phys_addr.get_bits(52..64), 0)
    }

    #[inline]
    pub const fn canonicalize_physical_address(phys_addr: usize) -> usize {
        phys_addr & 0x000F_FFFF_FFFF_FFFF
    }
}

#[cfg(target_arch = "aarch64")]
mod canonical_address {
    use bit_field::BitField;

    /// User-space VAs on aarch64 have the 16 most significant bits cleared.
    #[inline]
    pub fn is_canonical_virtual_address(virt_addr: usize) -> bool {
        matches!(virt_addr.get_bits(48..64), 0)
    }

    #[inline]
    pub const fn canonicalize_virtual_address(virt_addr: usize) -> usize {
        virt_addr & 0x0000_FFFF_FFFF_FFFF
    }

    /// 48-bit physical addresses.
    #[inline]
    pub fn is_canonical_physical_address(phys_addr: usize) -> bool {
        matches!(phys_addr.get_bits(48..64), 0)
    }

    #[inline]
    pub const fn canonicalize_physical_address(phys_addr: usize) -> usize {
        phys_addr & 0x0000_FFFF_FFFF_FFFF
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod canonical_address {
    #[inline]
    pub fn is_canonical_virtual_address(_virt_addr: usize) -> bool {
        true
    }

    #[inline]
    pub const fn canonicalize_virtual_address(virt_addr: usize) -> usize {
        virt_addr
    }

    #[inline]
    pub fn is_canonical_physical_address(_phys_addr: usize) -> bool {
        true
    }

    #[inline]
    pub const fn canonicalize_physical_address(phys_addr: usize) -> usize {
        phys_addr
    }
}

use canonical_address::*;

implement_address!(
    VirtualAddress,
    "virtual",
    "v",
    is_canonical_virtual_address,
    canonicalize_virtual_address
);

implement_address!(
    PhysicalAddress,
    "physical",
    "p",
    is_canonical_physical_address,
    canonicalize_physical_address
);

impl VirtualAddress {
    /// Returns the address of the given pointer.
    pub fn from_ptr<T>(ptr: *const T) -> VirtualAddress {
        VirtualAddress::new_canonical(ptr as usize)
    }

    /// Returns this address as a raw pointer to a `T`.
    pub const fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    /// Returns this address as a raw mutable pointer to a `T`.
    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }
}

impl PhysicalAddress {
    /// Returns this address as the 64-bit value written into hardware descriptors.
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    /// Creates a `PhysicalAddress` from a 64-bit value read out of a hardware descriptor.
    #[inline]
    pub const fn from_u64(addr: u64) -> PhysicalAddress {
        PhysicalAddress::new_canonical(addr as usize)
    }
}
