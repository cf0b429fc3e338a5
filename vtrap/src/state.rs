//! High-level guest register state.
//!
//! The exit handlers never touch the control block directly. The dispatcher
//! pulls the control block into a [`GuestCpuState`] on entry and pushes it
//! back before resuming, so every handler works on this mirror.
use crate::{config::PagingStrategy, paging::PagingMode};
use bitflags::bitflags;
use iced_x86::Register;

bitflags! {
    /// RFLAGS.
    pub struct Rflags: u64 {
        /// Carry flag.
        const CF = 1 << 0;
        /// Parity flag.
        const PF = 1 << 2;
        /// Auxiliary carry flag.
        const AF = 1 << 4;
        /// Zero flag.
        const ZF = 1 << 6;
        /// Sign flag.
        const SF = 1 << 7;
        /// Trap flag.
        const TF = 1 << 8;
        /// Interrupt enable flag.
        const IF = 1 << 9;
        /// Direction flag.
        const DF = 1 << 10;
        /// Overflow flag.
        const OF = 1 << 11;
        /// Virtual 8086 mode.
        const VM = 1 << 17;
    }
}

bitflags! {
    /// CR0.
    pub struct Cr0: u64 {
        /// Protection enable.
        const PE = 1 << 0;
        /// Monitor coprocessor.
        const MP = 1 << 1;
        /// Emulation.
        const EM = 1 << 2;
        /// Task switched.
        const TS = 1 << 3;
        /// Extension type.
        const ET = 1 << 4;
        /// Numeric error.
        const NE = 1 << 5;
        /// Write protect.
        const WP = 1 << 16;
        /// Alignment mask.
        const AM = 1 << 18;
        /// Not write through.
        const NW = 1 << 29;
        /// Cache disable.
        const CD = 1 << 30;
        /// Paging.
        const PG = 1 << 31;
    }
}

bitflags! {
    /// CR4.
    pub struct Cr4: u64 {
        /// Virtual 8086 mode extensions.
        const VME = 1 << 0;
        /// Protected mode virtual interrupts.
        const PVI = 1 << 1;
        /// Time stamp disable.
        const TSD = 1 << 2;
        /// Debugging extensions.
        const DE = 1 << 3;
        /// Page size extensions.
        const PSE = 1 << 4;
        /// Physical address extension.
        const PAE = 1 << 5;
        /// Machine check enable.
        const MCE = 1 << 6;
        /// Page global enable.
        const PGE = 1 << 7;
        /// OS FXSAVE support.
        const OSFXSR = 1 << 9;
        /// OS unmasked SIMD exception support.
        const OSXMMEXCPT = 1 << 10;
    }
}

bitflags! {
    /// IA32_EFER.
    pub struct Efer: u64 {
        /// System call extensions.
        const SCE = 1 << 0;
        /// Long mode enable.
        const LME = 1 << 8;
        /// Long mode active.
        const LMA = 1 << 10;
        /// No execute enable.
        const NXE = 1 << 11;
        /// Secure virtual machine enable.
        const SVME = 1 << 12;
    }
}

/// Operating mode of the guest CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// Real mode.
    Real,
    /// 32-bit protected mode.
    Protected,
    /// 32-bit protected mode with PAE.
    ProtectedPae,
    /// Long mode.
    Long,
}

/// Whether the guest translates its addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemMode {
    /// Paging disabled.
    Physical,
    /// Paging enabled.
    Virtual,
}

/// X86_64 general purpose registers of the guest.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneralPurposeRegisters {
    pub rax: usize,
    pub rbx: usize,
    pub rcx: usize,
    pub rdx: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub rbp: usize,
    pub rsp: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub r12: usize,
    pub r13: usize,
    pub r14: usize,
    pub r15: usize,
}

// (64-bit register, operand size in bytes, bits 15:8).
fn locate(reg: Register) -> Option<(Register, usize, bool)> {
    Some(match reg {
        Register::AL => (Register::RAX, 1, false),
        Register::BL => (Register::RBX, 1, false),
        Register::CL => (Register::RCX, 1, false),
        Register::DL => (Register::RDX, 1, false),
        Register::AH => (Register::RAX, 1, true),
        Register::BH => (Register::RBX, 1, true),
        Register::CH => (Register::RCX, 1, true),
        Register::DH => (Register::RDX, 1, true),
        Register::SPL => (Register::RSP, 1, false),
        Register::BPL => (Register::RBP, 1, false),
        Register::SIL => (Register::RSI, 1, false),
        Register::DIL => (Register::RDI, 1, false),
        Register::R8L => (Register::R8, 1, false),
        Register::R9L => (Register::R9, 1, false),
        Register::R10L => (Register::R10, 1, false),
        Register::R11L => (Register::R11, 1, false),
        Register::R12L => (Register::R12, 1, false),
        Register::R13L => (Register::R13, 1, false),
        Register::R14L => (Register::R14, 1, false),
        Register::R15L => (Register::R15, 1, false),
        Register::AX => (Register::RAX, 2, false),
        Register::BX => (Register::RBX, 2, false),
        Register::CX => (Register::RCX, 2, false),
        Register::DX => (Register::RDX, 2, false),
        Register::SP => (Register::RSP, 2, false),
        Register::BP => (Register::RBP, 2, false),
        Register::SI => (Register::RSI, 2, false),
        Register::DI => (Register::RDI, 2, false),
        Register::R8W => (Register::R8, 2, false),
        Register::R9W => (Register::R9, 2, false),
        Register::R10W => (Register::R10, 2, false),
        Register::R11W => (Register::R11, 2, false),
        Register::R12W => (Register::R12, 2, false),
        Register::R13W => (Register::R13, 2, false),
        Register::R14W => (Register::R14, 2, false),
        Register::R15W => (Register::R15, 2, false),
        Register::EAX => (Register::RAX, 4, false),
        Register::EBX => (Register::RBX, 4, false),
        Register::ECX => (Register::RCX, 4, false),
        Register::EDX => (Register::RDX, 4, false),
        Register::ESP => (Register::RSP, 4, false),
        Register::EBP => (Register::RBP, 4, false),
        Register::ESI => (Register::RSI, 4, false),
        Register::EDI => (Register::RDI, 4, false),
        Register::R8D => (Register::R8, 4, false),
        Register::R9D => (Register::R9, 4, false),
        Register::R10D => (Register::R10, 4, false),
        Register::R11D => (Register::R11, 4, false),
        Register::R12D => (Register::R12, 4, false),
        Register::R13D => (Register::R13, 4, false),
        Register::R14D => (Register::R14, 4, false),
        Register::R15D => (Register::R15, 4, false),
        Register::RAX
        | Register::RBX
        | Register::RCX
        | Register::RDX
        | Register::RSP
        | Register::RBP
        | Register::RSI
        | Register::RDI
        | Register::R8
        | Register::R9
        | Register::R10
        | Register::R11
        | Register::R12
        | Register::R13
        | Register::R14
        | Register::R15 => (reg, 8, false),
        _ => return None,
    })
}

impl GeneralPurposeRegisters {
    fn slot(&mut self, full: Register) -> &mut usize {
        match full {
            Register::RAX => &mut self.rax,
            Register::RBX => &mut self.rbx,
            Register::RCX => &mut self.rcx,
            Register::RDX => &mut self.rdx,
            Register::RSP => &mut self.rsp,
            Register::RBP => &mut self.rbp,
            Register::RSI => &mut self.rsi,
            Register::RDI => &mut self.rdi,
            Register::R8 => &mut self.r8,
            Register::R9 => &mut self.r9,
            Register::R10 => &mut self.r10,
            Register::R11 => &mut self.r11,
            Register::R12 => &mut self.r12,
            Register::R13 => &mut self.r13,
            Register::R14 => &mut self.r14,
            _ => &mut self.r15,
        }
    }

    fn value(&self, full: Register) -> usize {
        match full {
            Register::RAX => self.rax,
            Register::RBX => self.rbx,
            Register::RCX => self.rcx,
            Register::RDX => self.rdx,
            Register::RSP => self.rsp,
            Register::RBP => self.rbp,
            Register::RSI => self.rsi,
            Register::RDI => self.rdi,
            Register::R8 => self.r8,
            Register::R9 => self.r9,
            Register::R10 => self.r10,
            Register::R11 => self.r11,
            Register::R12 => self.r12,
            Register::R13 => self.r13,
            Register::R14 => self.r14,
            _ => self.r15,
        }
    }

    /// Operand size in bytes of a general purpose register operand.
    pub fn width(reg: Register) -> Option<usize> {
        locate(reg).map(|(_, size, _)| size)
    }

    /// Read a decoded register operand, zero extended.
    pub fn get(&self, reg: Register) -> Option<u64> {
        let (full, size, high) = locate(reg)?;
        let v = self.value(full) as u64;
        Some(match (size, high) {
            (1, true) => (v >> 8) & 0xff,
            (1, false) => v & 0xff,
            (2, _) => v & 0xffff,
            (4, _) => v & 0xffff_ffff,
            _ => v,
        })
    }

    /// Write a decoded register operand.
    ///
    /// 32-bit writes clear the upper half; 8 and 16-bit writes preserve the
    /// other bits.
    pub fn set(&mut self, reg: Register, value: u64) -> Option<()> {
        let (full, size, high) = locate(reg)?;
        let slot = self.slot(full);
        let old = *slot as u64;
        let new = match (size, high) {
            (1, true) => (old & !0xff00) | ((value & 0xff) << 8),
            (1, false) => (old & !0xff) | (value & 0xff),
            (2, _) => (old & !0xffff) | (value & 0xffff),
            (4, _) => value & 0xffff_ffff,
            _ => value,
        };
        *slot = new as usize;
        Some(())
    }
}

/// A segment register as cached by the control block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    /// Selector.
    pub selector: u16,
    /// Attributes in the compressed SVM format.
    pub attrib: u16,
    /// Limit.
    pub limit: u32,
    /// Base address.
    pub base: u64,
}

impl Segment {
    /// Long mode code segment (L bit).
    pub fn long(&self) -> bool {
        self.attrib & (1 << 9) != 0
    }

    /// Default operation size is 32 bits (D/B bit).
    pub fn db(&self) -> bool {
        self.attrib & (1 << 10) != 0
    }
}

/// Data and code segment registers.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SegmentRegister {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

impl SegmentRegister {
    /// Resolve a decoded segment register.
    pub fn from_register(reg: Register) -> Option<Self> {
        Some(match reg {
            Register::ES => SegmentRegister::Es,
            Register::CS => SegmentRegister::Cs,
            Register::SS => SegmentRegister::Ss,
            Register::DS => SegmentRegister::Ds,
            Register::FS => SegmentRegister::Fs,
            Register::GS => SegmentRegister::Gs,
            _ => return None,
        })
    }
}

/// Segment state of the guest.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segments {
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub gdtr: Segment,
    pub idtr: Segment,
    pub ldtr: Segment,
    pub tr: Segment,
}

impl Segments {
    /// Get a segment register.
    pub fn get(&self, seg: SegmentRegister) -> &Segment {
        match seg {
            SegmentRegister::Es => &self.es,
            SegmentRegister::Cs => &self.cs,
            SegmentRegister::Ss => &self.ss,
            SegmentRegister::Ds => &self.ds,
            SegmentRegister::Fs => &self.fs,
            SegmentRegister::Gs => &self.gs,
        }
    }

    /// Get a segment register for modification.
    pub fn get_mut(&mut self, seg: SegmentRegister) -> &mut Segment {
        match seg {
            SegmentRegister::Es => &mut self.es,
            SegmentRegister::Cs => &mut self.cs,
            SegmentRegister::Ss => &mut self.ss,
            SegmentRegister::Ds => &mut self.ds,
            SegmentRegister::Fs => &mut self.fs,
            SegmentRegister::Gs => &mut self.gs,
        }
    }
}

#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
}

#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugRegisters {
    pub dr6: u64,
    pub dr7: u64,
}

/// The control registers the guest believes it has under shadow paging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShadowState {
    /// Guest-visible CR0.
    pub guest_cr0: u64,
    /// Guest-visible CR3.
    pub guest_cr3: u64,
}

/// The register mirror of a virtual core.
#[derive(Clone, Debug)]
pub struct GuestCpuState {
    /// Instruction pointer.
    pub rip: u64,
    /// General purpose registers.
    pub gprs: GeneralPurposeRegisters,
    /// Control registers and EFER as loaded in hardware.
    pub ctrl_regs: ControlRegisters,
    /// Debug registers.
    pub dbg_regs: DebugRegisters,
    /// RFLAGS.
    pub rflags: u64,
    /// Current privilege level.
    pub cpl: u8,
    /// Segment registers.
    pub segments: Segments,
    /// Derived operating mode.
    pub cpu_mode: CpuMode,
    /// Derived memory mode.
    pub mem_mode: MemMode,
    /// How guest memory is virtualized.
    pub paging: PagingStrategy,
    /// Guest-visible control registers under shadow paging.
    pub shadow: ShadowState,
}

impl GuestCpuState {
    /// A core in real mode with every register cleared.
    pub fn new(paging: PagingStrategy) -> Self {
        Self {
            rip: 0,
            gprs: GeneralPurposeRegisters::default(),
            ctrl_regs: ControlRegisters::default(),
            dbg_regs: DebugRegisters::default(),
            rflags: 0,
            cpl: 0,
            segments: Segments::default(),
            cpu_mode: CpuMode::Real,
            mem_mode: MemMode::Physical,
            paging,
            shadow: ShadowState::default(),
        }
    }

    /// CR0 as seen by the guest.
    pub fn guest_cr0(&self) -> u64 {
        match self.paging {
            PagingStrategy::Shadow => self.shadow.guest_cr0,
            PagingStrategy::Nested => self.ctrl_regs.cr0,
        }
    }

    /// CR3 as seen by the guest.
    pub fn guest_cr3(&self) -> u64 {
        match self.paging {
            PagingStrategy::Shadow => self.shadow.guest_cr3,
            PagingStrategy::Nested => self.ctrl_regs.cr3,
        }
    }

    /// RFLAGS.
    pub fn rflags(&self) -> Rflags {
        Rflags::from_bits_truncate(self.rflags)
    }

    /// Recompute `cpu_mode` and `mem_mode` from the control registers.
    pub fn update_modes(&mut self) {
        let cr0 = Cr0::from_bits_truncate(self.guest_cr0());
        let cr4 = Cr4::from_bits_truncate(self.ctrl_regs.cr4);
        let efer = Efer::from_bits_truncate(self.ctrl_regs.efer);
        self.cpu_mode = if !cr0.contains(Cr0::PE) {
            CpuMode::Real
        } else if !cr4.contains(Cr4::PAE) {
            CpuMode::Protected
        } else if !efer.contains(Efer::LMA) {
            CpuMode::ProtectedPae
        } else {
            CpuMode::Long
        };
        self.mem_mode = if cr0.contains(Cr0::PG) {
            MemMode::Virtual
        } else {
            MemMode::Physical
        };
    }

    /// Page table format of the guest, if it translates addresses.
    pub fn paging_mode(&self) -> Option<PagingMode> {
        match (self.mem_mode, self.cpu_mode) {
            (MemMode::Physical, _) | (_, CpuMode::Real) => None,
            (MemMode::Virtual, CpuMode::Protected) => Some(PagingMode::Legacy32),
            (MemMode::Virtual, CpuMode::ProtectedPae) => Some(PagingMode::Pae),
            (MemMode::Virtual, CpuMode::Long) => Some(PagingMode::Long),
        }
    }

    /// Mask of a general purpose register in the current mode.
    pub fn gpr_mask(&self) -> u64 {
        match self.cpu_mode {
            CpuMode::Real => 0xffff,
            CpuMode::Protected | CpuMode::ProtectedPae => 0xffff_ffff,
            CpuMode::Long => u64::MAX,
        }
    }

    /// Bitness of the code segment, for the decoder.
    pub fn code_bitness(&self) -> u32 {
        match self.cpu_mode {
            CpuMode::Real => 16,
            CpuMode::Long if self.segments.cs.long() => 64,
            _ if self.segments.cs.db() => 32,
            _ => 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes() {
        let mut state = GuestCpuState::new(PagingStrategy::Nested);
        state.update_modes();
        assert_eq!(state.cpu_mode, CpuMode::Real);
        assert_eq!(state.mem_mode, MemMode::Physical);
        assert_eq!(state.gpr_mask(), 0xffff);

        state.ctrl_regs.cr0 = (Cr0::PE | Cr0::PG).bits();
        state.update_modes();
        assert_eq!(state.cpu_mode, CpuMode::Protected);
        assert_eq!(state.paging_mode(), Some(PagingMode::Legacy32));

        state.ctrl_regs.cr4 = Cr4::PAE.bits();
        state.update_modes();
        assert_eq!(state.cpu_mode, CpuMode::ProtectedPae);

        state.ctrl_regs.efer = (Efer::LME | Efer::LMA).bits();
        state.update_modes();
        assert_eq!(state.cpu_mode, CpuMode::Long);
        assert_eq!(state.paging_mode(), Some(PagingMode::Long));
    }

    #[test]
    fn shadow_modes_follow_guest_cr0() {
        let mut state = GuestCpuState::new(PagingStrategy::Shadow);
        // Hardware runs paged, the guest is still in real mode.
        state.ctrl_regs.cr0 = (Cr0::PE | Cr0::PG).bits();
        state.update_modes();
        assert_eq!(state.cpu_mode, CpuMode::Real);
        assert_eq!(state.mem_mode, MemMode::Physical);
        state.shadow.guest_cr0 = Cr0::PE.bits();
        state.update_modes();
        assert_eq!(state.cpu_mode, CpuMode::Protected);
        assert_eq!(state.mem_mode, MemMode::Physical);
    }

    #[test]
    fn gpr_access() {
        let mut gprs = GeneralPurposeRegisters::default();
        gprs.rax = 0x1122_3344_5566_7788;
        assert_eq!(gprs.get(Register::AL), Some(0x88));
        assert_eq!(gprs.get(Register::AH), Some(0x77));
        assert_eq!(gprs.get(Register::AX), Some(0x7788));
        assert_eq!(gprs.get(Register::EAX), Some(0x5566_7788));
        gprs.set(Register::AH, 0xab).unwrap();
        assert_eq!(gprs.rax, 0x1122_3344_5566_ab88);
        gprs.set(Register::AX, 0xcdef).unwrap();
        assert_eq!(gprs.rax, 0x1122_3344_5566_cdef);
        gprs.set(Register::EAX, 0xffff_ffff_0000_0001).unwrap();
        assert_eq!(gprs.rax, 0x1);
        gprs.set(Register::R12, 42).unwrap();
        assert_eq!(gprs.r12, 42);
        assert_eq!(gprs.get(Register::CR0), None);
        assert_eq!(GeneralPurposeRegisters::width(Register::R9W), Some(2));
    }

    #[test]
    fn get_reads_the_slot_set_writes() {
        let full = [
            Register::RAX,
            Register::RBX,
            Register::RCX,
            Register::RDX,
            Register::RSP,
            Register::RBP,
            Register::RSI,
            Register::RDI,
            Register::R8,
            Register::R9,
            Register::R10,
            Register::R11,
            Register::R12,
            Register::R13,
            Register::R14,
            Register::R15,
        ];
        let mut gprs = GeneralPurposeRegisters::default();
        for (i, reg) in full.iter().enumerate() {
            gprs.set(*reg, 0x100 + i as u64).unwrap();
        }
        for (i, reg) in full.iter().enumerate() {
            assert_eq!(gprs.get(*reg), Some(0x100 + i as u64));
        }
        assert_eq!((gprs.rsp, gprs.r15), (0x104, 0x10f));
        assert_eq!(gprs.get(Register::R15D), Some(0x10f));
    }
}
