//! Address translation between the guest and the host.
//!
//! Every conversion is built from three primitives: the host memory manager
//! (HVA <-> HPA), the shadow map (GPA -> HPA) and the guest page table walk
//! (GVA -> GPA). A composed conversion fails at the first primitive that
//! fails, and the error names that primitive's [`TranslationStage`].
use crate::{
    addressing::{Gpa, Gva, Hpa, Hva},
    host::HostMemory,
    paging::{self, PageTableEntry, PagingMode, Walk},
    shadow_map::{HostRegionKind, ShadowMap},
    state::{CpuMode, GuestCpuState, MemMode, SegmentRegister},
    VmError,
};

/// A primitive translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationStage {
    /// Host virtual to host physical.
    HvaToHpa,
    /// Host physical to host virtual.
    HpaToHva,
    /// Guest physical to host physical.
    GpaToHpa,
    /// Host physical to guest physical.
    HpaToGpa,
    /// Guest virtual to guest physical.
    GvaToGpa,
    /// Guest physical to guest virtual.
    GpaToGva,
}

impl core::fmt::Display for TranslationStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            TranslationStage::HvaToHpa => "HVA->HPA",
            TranslationStage::HpaToHva => "HPA->HVA",
            TranslationStage::GpaToHpa => "GPA->HPA",
            TranslationStage::HpaToGpa => "HPA->GPA",
            TranslationStage::GvaToGpa => "GVA->GPA",
            TranslationStage::GpaToGva => "GPA->GVA",
        })
    }
}

#[inline]
fn invalid(stage: TranslationStage, addr: usize) -> VmError {
    VmError::InvalidAddress { stage, addr }
}

/// Linear address of `offset` in segment `seg`.
///
/// In long mode only the FS and GS bases apply.
pub fn linear_address(state: &GuestCpuState, seg: SegmentRegister, offset: u64) -> Gva {
    let base = state.segments.get(seg).base;
    Gva::new(match state.cpu_mode {
        CpuMode::Real => base.wrapping_add(offset & 0xffff) as usize,
        CpuMode::Protected | CpuMode::ProtectedPae => {
            (base.wrapping_add(offset) & 0xffff_ffff) as usize
        }
        CpuMode::Long => match seg {
            SegmentRegister::Fs | SegmentRegister::Gs => base.wrapping_add(offset) as usize,
            _ => offset as usize,
        },
    })
}

/// Address translator of a virtual machine.
pub struct Translator<'a, H: HostMemory + ?Sized> {
    host: &'a H,
    map: &'a ShadowMap,
}

impl<'a, H: HostMemory + ?Sized> Translator<'a, H> {
    /// Create a translator over the host memory manager and the shadow map.
    pub fn new(host: &'a H, map: &'a ShadowMap) -> Self {
        Self { host, map }
    }

    /// The shadow map this translator resolves guest memory with.
    pub fn shadow_map(&self) -> &'a ShadowMap {
        self.map
    }

    /// Host virtual to host physical.
    pub fn hva_to_hpa(&self, hva: Hva) -> Result<Hpa, VmError> {
        match self.host.vaddr_to_paddr(hva) {
            Hpa::ZERO => Err(invalid(TranslationStage::HvaToHpa, hva.into_usize())),
            hpa => Ok(hpa),
        }
    }

    /// Host physical to host virtual.
    pub fn hpa_to_hva(&self, hpa: Hpa) -> Result<Hva, VmError> {
        match self.host.paddr_to_vaddr(hpa) {
            Hva::ZERO => Err(invalid(TranslationStage::HpaToHva, hpa.into_usize())),
            hva => Ok(hva),
        }
    }

    /// Guest physical to host physical through the shadow map.
    pub fn gpa_to_hpa(&self, gpa: Gpa) -> Result<Hpa, VmError> {
        match self.map.translate(gpa) {
            (HostRegionKind::PhysicalMemory, Some(hpa)) => Ok(hpa),
            (kind, _) => {
                log::trace!("In GPA->HPA: {gpa} resolves to {kind:?}");
                Err(invalid(TranslationStage::GpaToHpa, gpa.into_usize()))
            }
        }
    }

    /// Host physical to guest physical.
    pub fn hpa_to_gpa(&self, _hpa: Hpa) -> Result<Gpa, VmError> {
        Err(VmError::NotImplemented("HPA->GPA translation"))
    }

    /// Guest physical to guest virtual.
    pub fn gpa_to_gva(&self, _state: &GuestCpuState, _gpa: Gpa) -> Result<Gva, VmError> {
        Err(VmError::NotImplemented("GPA->GVA translation"))
    }

    /// Guest physical to host virtual.
    pub fn gpa_to_hva(&self, gpa: Gpa) -> Result<Hva, VmError> {
        self.gpa_to_hpa(gpa).and_then(|hpa| self.hpa_to_hva(hpa))
    }

    /// Host virtual to guest physical.
    pub fn hva_to_gpa(&self, hva: Hva) -> Result<Gpa, VmError> {
        self.hva_to_hpa(hva).and_then(|hpa| self.hpa_to_gpa(hpa))
    }

    /// Guest virtual to guest physical.
    ///
    /// Identity while the guest runs without paging; otherwise walks the
    /// guest page tables rooted at the guest-visible CR3. Any failure
    /// during the walk, including an unreadable table, is reported at the
    /// [`TranslationStage::GvaToGpa`] stage.
    pub fn gva_to_gpa(&self, state: &GuestCpuState, gva: Gva) -> Result<Gpa, VmError> {
        let mode = match (state.mem_mode, state.paging_mode()) {
            (MemMode::Virtual, Some(mode)) => mode,
            _ => return Ok(Gpa::new(gva.into_usize())),
        };
        let fault = invalid(TranslationStage::GvaToGpa, gva.into_usize());
        match paging::walk(mode, state.guest_cr3(), gva.into_usize(), |gpa, mode| {
            self.read_entry(gpa, mode)
        }) {
            Ok(Walk::Mapped(gpa)) => Ok(gpa),
            Ok(Walk::NotPresent { level }) => {
                log::trace!("In GVA->GPA: {gva} not present at level {level}");
                Err(fault)
            }
            Err(e) => {
                log::trace!("In GVA->GPA: page walk of {gva} failed: {e}");
                Err(fault)
            }
        }
    }

    fn read_entry(&self, gpa: Gpa, mode: PagingMode) -> Result<PageTableEntry, VmError> {
        let hva = self.gpa_to_hva(gpa)?.into_usize();
        // Entries are naturally aligned, so they never cross a page.
        Ok(PageTableEntry(unsafe {
            match mode.entry_size() {
                4 => core::ptr::read_unaligned(hva as *const u32) as u64,
                _ => core::ptr::read_unaligned(hva as *const u64),
            }
        }))
    }

    /// Guest virtual to host physical.
    pub fn gva_to_hpa(&self, state: &GuestCpuState, gva: Gva) -> Result<Hpa, VmError> {
        self.gva_to_gpa(state, gva)
            .and_then(|gpa| self.gpa_to_hpa(gpa))
    }

    /// Guest virtual to host virtual.
    pub fn gva_to_hva(&self, state: &GuestCpuState, gva: Gva) -> Result<Hva, VmError> {
        self.gva_to_hpa(state, gva)
            .and_then(|hpa| self.hpa_to_hva(hpa))
    }

    /// Host physical to guest virtual.
    pub fn hpa_to_gva(&self, state: &GuestCpuState, hpa: Hpa) -> Result<Gva, VmError> {
        self.hpa_to_gpa(hpa)
            .and_then(|gpa| self.gpa_to_gva(state, gpa))
    }

    /// Host virtual to guest virtual.
    pub fn hva_to_gva(&self, state: &GuestCpuState, hva: Hva) -> Result<Gva, VmError> {
        self.hva_to_hpa(hva)
            .and_then(|hpa| self.hpa_to_gva(state, hpa))
    }
}
