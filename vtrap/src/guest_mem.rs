//! Bulk copies between host buffers and guest memory.
//!
//! Contiguous guest memory is not contiguous on the host, so every copy is
//! cut at guest page boundaries and each chunk is translated on its own. A
//! copy stops at the first chunk that fails to translate and reports how far
//! it got.
use crate::{
    addressing::{dist_to_page_edge, Gpa, Gva, Hva},
    host::HostMemory,
    state::GuestCpuState,
    translate::Translator,
    VmError,
};

enum Direction<'b> {
    In(&'b mut [u8]),
    Out(&'b [u8]),
}

impl Direction<'_> {
    fn len(&self) -> usize {
        match self {
            Direction::In(b) => b.len(),
            Direction::Out(b) => b.len(),
        }
    }
}

// Copy page chunk by page chunk. Returns the bytes copied and the error of
// the chunk that stopped the copy.
fn copy(
    mut dir: Direction<'_>,
    start: usize,
    mut translate: impl FnMut(usize) -> Result<Hva, VmError>,
) -> (usize, Option<VmError>) {
    let count = dir.len();
    let mut done = 0;
    while done < count {
        let addr = start.wrapping_add(done);
        let chunk = core::cmp::min(count - done, dist_to_page_edge(addr));
        let hva = match translate(addr) {
            Ok(hva) => hva.into_usize(),
            Err(e) => return (done, Some(e)),
        };
        // SAFETY: the host guarantees the page containing `hva` is mapped and
        // the chunk never leaves that page.
        unsafe {
            match &mut dir {
                Direction::In(buf) => core::ptr::copy_nonoverlapping(
                    hva as *const u8,
                    buf[done..done + chunk].as_mut_ptr(),
                    chunk,
                ),
                Direction::Out(buf) => core::ptr::copy_nonoverlapping(
                    buf[done..done + chunk].as_ptr(),
                    hva as *mut u8,
                    chunk,
                ),
            }
        }
        done += chunk;
    }
    (done, None)
}

fn exact(requested: usize, (done, err): (usize, Option<VmError>)) -> Result<(), VmError> {
    match err {
        Some(e) => Err(e),
        None if done != requested => Err(VmError::ShortTransfer {
            requested,
            transferred: done,
        }),
        None => Ok(()),
    }
}

impl<H: HostMemory + ?Sized> Translator<'_, H> {
    fn pa_copy(&self, dir: Direction<'_>, gpa: Gpa) -> (usize, Option<VmError>) {
        copy(dir, gpa.into_usize(), |addr| self.gpa_to_hva(Gpa::new(addr)))
    }

    fn va_copy(
        &self,
        state: &GuestCpuState,
        dir: Direction<'_>,
        gva: Gva,
    ) -> (usize, Option<VmError>) {
        copy(dir, gva.into_usize(), |addr| {
            self.gva_to_hva(state, Gva::new(addr))
        })
    }

    /// Read `dst.len()` bytes of guest physical memory at `gpa`.
    ///
    /// Returns the number of bytes read.
    pub fn read_guest_pa(&self, gpa: Gpa, dst: &mut [u8]) -> usize {
        self.pa_copy(Direction::In(dst), gpa).0
    }

    /// Write `src` to guest physical memory at `gpa`.
    ///
    /// Returns the number of bytes written.
    pub fn write_guest_pa(&self, gpa: Gpa, src: &[u8]) -> usize {
        self.pa_copy(Direction::Out(src), gpa).0
    }

    /// Read `dst.len()` bytes of guest virtual memory at `gva`.
    ///
    /// Returns the number of bytes read.
    pub fn read_guest_va(&self, state: &GuestCpuState, gva: Gva, dst: &mut [u8]) -> usize {
        self.va_copy(state, Direction::In(dst), gva).0
    }

    /// Write `src` to guest virtual memory at `gva`.
    ///
    /// Returns the number of bytes written.
    pub fn write_guest_va(&self, state: &GuestCpuState, gva: Gva, src: &[u8]) -> usize {
        self.va_copy(state, Direction::Out(src), gva).0
    }

    /// Fill `dst` from guest physical memory, or fail with the error of the
    /// chunk that could not be translated.
    pub fn read_guest_pa_exact(&self, gpa: Gpa, dst: &mut [u8]) -> Result<(), VmError> {
        let len = dst.len();
        exact(len, self.pa_copy(Direction::In(dst), gpa))
    }

    /// Write all of `src` to guest physical memory.
    pub fn write_guest_pa_exact(&self, gpa: Gpa, src: &[u8]) -> Result<(), VmError> {
        exact(src.len(), self.pa_copy(Direction::Out(src), gpa))
    }

    /// Fill `dst` from guest virtual memory.
    pub fn read_guest_va_exact(
        &self,
        state: &GuestCpuState,
        gva: Gva,
        dst: &mut [u8],
    ) -> Result<(), VmError> {
        let len = dst.len();
        exact(len, self.va_copy(state, Direction::In(dst), gva))
    }

    /// Write all of `src` to guest virtual memory.
    pub fn write_guest_va_exact(
        &self,
        state: &GuestCpuState,
        gva: Gva,
        src: &[u8],
    ) -> Result<(), VmError> {
        exact(src.len(), self.va_copy(state, Direction::Out(src), gva))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        addressing::{Gpa, Gva, Hpa},
        config::PagingStrategy,
        shadow_map::ShadowMap,
        state::{Cr0, GuestCpuState},
        testutil::{FlatHost, HOST_BASE},
        translate::{TranslationStage, Translator},
        VmError,
    };

    #[test]
    fn crosses_pages() {
        let host = FlatHost::new(2);
        let mut map = ShadowMap::new();
        // Two guest pages mapped in reverse order on the host.
        map.add_passthrough(Gpa::new(0x1000), Gpa::new(0x2000), Hpa::new(HOST_BASE + 0x1000))
            .unwrap();
        map.add_passthrough(Gpa::new(0x2000), Gpa::new(0x3000), Hpa::new(HOST_BASE))
            .unwrap();
        let t = Translator::new(&host, &map);
        let data = (0..16u8).collect::<Vec<_>>();
        assert_eq!(t.write_guest_pa(Gpa::new(0x1ff8), &data), 16);
        assert_eq!(host.bytes(0x1ff8, 8), &data[..8]);
        assert_eq!(host.bytes(0, 8), &data[8..]);

        let mut back = [0u8; 16];
        assert_eq!(t.read_guest_pa(Gpa::new(0x1ff8), &mut back), 16);
        assert_eq!(&back[..], &data[..]);
    }

    #[test]
    fn stops_at_first_failure() {
        let host = FlatHost::new(4);
        let mut map = ShadowMap::new();
        map.add_passthrough(Gpa::ZERO, Gpa::new(0x2000), Hpa::new(HOST_BASE))
            .unwrap();
        let t = Translator::new(&host, &map);
        let mut buf = [0u8; 0x100];
        assert_eq!(t.read_guest_pa(Gpa::new(0x1f80), &mut buf), 0x80);
        assert_eq!(t.read_guest_pa(Gpa::new(0x2000), &mut buf), 0);
        assert!(matches!(
            t.read_guest_pa_exact(Gpa::new(0x1f80), &mut buf),
            Err(VmError::InvalidAddress {
                stage: TranslationStage::GpaToHpa,
                addr: 0x2000
            })
        ));
        assert!(t.write_guest_pa_exact(Gpa::new(0x1f00), &buf).is_ok());
        assert_eq!(t.write_guest_pa(Gpa::ZERO, &[]), 0);
    }

    #[test]
    fn virtual_copy() {
        let host = FlatHost::new(4);
        let map = host.identity_map();
        let t = Translator::new(&host, &map);
        // 32-bit paging: PDE[0] -> table at 0x2000, PTE[0x10] -> page 0x3000.
        host.write_u32(0x1000, 0x2000 | 0x3);
        host.write_u32(0x2000 + 0x10 * 4, 0x3000 | 0x3);
        let mut state = GuestCpuState::new(PagingStrategy::Nested);
        state.ctrl_regs.cr0 = (Cr0::PE | Cr0::PG).bits();
        state.ctrl_regs.cr3 = 0x1000;
        state.update_modes();

        assert_eq!(t.write_guest_va(&state, Gva::new(0x10ffc), b"abcdefgh"), 4);
        assert_eq!(host.bytes(0x3ffc, 4), b"abcd");
        let err = t
            .write_guest_va_exact(&state, Gva::new(0x10ffc), b"abcdefgh")
            .unwrap_err();
        assert!(err.is_guest_fault());
        let mut buf = [0u8; 4];
        t.read_guest_va_exact(&state, Gva::new(0x10ffc), &mut buf)
            .unwrap();
        assert_eq!(&buf, b"abcd");
    }
}
