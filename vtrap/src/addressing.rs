//! Address types of both sides of the monitor.
//!
//! Guest addresses ([`Gpa`], [`Gva`]) are whatever the guest put in its
//! registers and page tables, so they are never validated on construction.
//! Host addresses ([`Hpa`], [`Hva`]) come from the host memory manager.

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;

/// Base address of the 4 KiB page containing `addr`.
#[inline]
pub const fn page_base(addr: usize) -> usize {
    addr & !PAGE_MASK
}

/// Number of bytes from `addr` up to the next page boundary.
#[inline]
pub const fn dist_to_page_edge(addr: usize) -> usize {
    PAGE_SIZE - (addr & PAGE_MASK)
}

macro_rules! address_type {
    ($(#[$doc:meta])* $t: ident) => {
        $(#[$doc])*
        #[repr(transparent)]
        #[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
        pub struct $t(usize);

        impl $t {
            /// Address 0.
            pub const ZERO: Self = Self(0);

            /// Wrap a raw address.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// Cast into usize.
            #[inline]
            pub const fn into_usize(self) -> usize {
                self.0
            }

            /// Offset inside the 4 KiB page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & PAGE_MASK
            }

            /// Round down to the 4 KiB page.
            #[inline]
            pub const fn page_base(self) -> Self {
                Self(page_base(self.0))
            }
        }

        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }

        impl core::fmt::LowerHex for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0.wrapping_add(other))
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0.wrapping_add(other)
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0.wrapping_sub(other))
            }
        }
        impl core::ops::Sub<$t> for $t {
            type Output = usize;

            fn sub(self, other: $t) -> usize {
                self.0.wrapping_sub(other.0)
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0.wrapping_sub(other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
    };
}

address_type!(
    /// Guest physical address
    Gpa
);
address_type!(
    /// Guest virtual (linear) address
    Gva
);
address_type!(
    /// Host physical address
    Hpa
);
address_type!(
    /// Host virtual address
    Hva
);
