//! Host memory manager interface.
use crate::addressing::{Hpa, Hva};

/// Services of the host memory manager.
///
/// Both conversions return 0 when the address has no mapping.
///
/// # Safety
/// The core reads and writes through the host virtual addresses returned by
/// [`HostMemory::paddr_to_vaddr`]. An implementor must guarantee that, for
/// every non-zero result, the whole 4 KiB page containing it is mapped,
/// writable and not aliased by a Rust reference while the core runs.
pub unsafe trait HostMemory {
    /// Translate host virtual address to host physical address.
    fn vaddr_to_paddr(&self, va: Hva) -> Hpa;
    /// Translate host physical address to host virtual address.
    fn paddr_to_vaddr(&self, pa: Hpa) -> Hva;
}

unsafe impl<T: HostMemory + ?Sized> HostMemory for &T {
    fn vaddr_to_paddr(&self, va: Hva) -> Hpa {
        (**self).vaddr_to_paddr(va)
    }
    fn paddr_to_vaddr(&self, pa: Hpa) -> Hva {
        (**self).paddr_to_vaddr(pa)
    }
}
