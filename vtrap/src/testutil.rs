//! Host memory mock for unit tests.
use crate::{
    addressing::{Gpa, Hpa, Hva, PAGE_SIZE},
    host::HostMemory,
    shadow_map::ShadowMap,
};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    cell::RefCell,
    collections::BTreeSet,
};

/// Host physical address of the first byte of the flat host.
pub const HOST_BASE: usize = 0x4000_0000;

/// A contiguous, page aligned chunk of "host physical" memory.
///
/// HPA `HOST_BASE + off` is backed by byte `off` of the buffer; its HVA is
/// the real pointer, so the core can copy through it.
pub struct FlatHost {
    ptr: *mut u8,
    layout: Layout,
    // Host physical pages for which the host reports no mapping.
    holes: RefCell<BTreeSet<usize>>,
}

impl FlatHost {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self {
            ptr,
            layout,
            holes: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Drop the host mapping of the page containing `hpa`.
    pub fn punch_hole(&self, hpa: Hpa) {
        self.holes.borrow_mut().insert(hpa.page_base().into_usize());
    }

    /// Shadow map with guest `[0, size)` mapped onto the whole host.
    pub fn identity_map(&self) -> ShadowMap {
        let mut map = ShadowMap::new();
        map.add_passthrough(Gpa::ZERO, Gpa::new(self.size()), Hpa::new(HOST_BASE))
            .unwrap();
        map
    }

    pub fn bytes(&self, off: usize, len: usize) -> Vec<u8> {
        assert!(off + len <= self.size());
        unsafe { std::slice::from_raw_parts(self.ptr.add(off), len).to_vec() }
    }

    pub fn fill(&self, off: usize, data: &[u8]) {
        assert!(off + data.len() <= self.size());
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(off), data.len()) }
    }

    pub fn write_u64(&self, off: usize, v: u64) {
        self.fill(off, &v.to_le_bytes())
    }

    pub fn write_u32(&self, off: usize, v: u32) {
        self.fill(off, &v.to_le_bytes())
    }
}

unsafe impl HostMemory for FlatHost {
    fn vaddr_to_paddr(&self, va: Hva) -> Hpa {
        let va = va.into_usize();
        let start = self.ptr as usize;
        if va < start || va >= start + self.size() {
            return Hpa::ZERO;
        }
        let pa = HOST_BASE + (va - start);
        if self.holes.borrow().contains(&(pa & !0xfff)) {
            Hpa::ZERO
        } else {
            Hpa::new(pa)
        }
    }

    fn paddr_to_vaddr(&self, pa: Hpa) -> Hva {
        let pa = pa.into_usize();
        if pa < HOST_BASE || pa >= HOST_BASE + self.size() {
            return Hva::ZERO;
        }
        if self.holes.borrow().contains(&(pa & !0xfff)) {
            return Hva::ZERO;
        }
        Hva::new(self.ptr as usize + (pa - HOST_BASE))
    }
}

impl Drop for FlatHost {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}
