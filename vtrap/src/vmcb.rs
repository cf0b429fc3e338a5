//! Virtual Machine Control Block (VMCB) codec.
//!
//! The VMCB is a 4 KiB page shared with the processor: the control area
//! (intercepts, exit information, event injection) starts at offset 0 and
//! the guest state save area at offset 0x400. Every field is little endian
//! at a fixed offset.
//!
//! ## Details
//! See AMD64 Architecture Programmer's Manual Volume 2, Appendix B. Layout of VMCB.
use crate::{state::Segment, VmError};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Virtual Machine Control Block.
#[repr(C, align(4096))]
pub struct Vmcb {
    data: [u8; 4096],
}

/// Vmcb field.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    // Control area.
    CrReadIntercepts,
    CrWriteIntercepts,
    DrReadIntercepts,
    DrWriteIntercepts,
    ExceptionIntercepts,
    InterceptMisc1,
    InterceptMisc2,
    IopmBasePa,
    MsrpmBasePa,
    TscOffset,
    GuestAsid,
    TlbControl,
    VIntr,
    InterruptShadow,
    ExitCode,
    ExitInfo1,
    ExitInfo2,
    ExitIntInfo,
    NpEnable,
    EventInj,
    NestedCr3,
    VmcbClean,
    NextRip,
    // State save area.
    Cpl,
    Efer,
    Cr4,
    Cr3,
    Cr0,
    Dr7,
    Dr6,
    Rflags,
    Rip,
    Rsp,
    Rax,
    Cr2,
}

impl Field {
    /// (offset, size in bytes).
    pub const fn layout(self) -> (usize, usize) {
        match self {
            Field::CrReadIntercepts => (0x000, 2),
            Field::CrWriteIntercepts => (0x002, 2),
            Field::DrReadIntercepts => (0x004, 2),
            Field::DrWriteIntercepts => (0x006, 2),
            Field::ExceptionIntercepts => (0x008, 4),
            Field::InterceptMisc1 => (0x00c, 4),
            Field::InterceptMisc2 => (0x010, 4),
            Field::IopmBasePa => (0x040, 8),
            Field::MsrpmBasePa => (0x048, 8),
            Field::TscOffset => (0x050, 8),
            Field::GuestAsid => (0x058, 4),
            Field::TlbControl => (0x05c, 1),
            Field::VIntr => (0x060, 8),
            Field::InterruptShadow => (0x068, 8),
            Field::ExitCode => (0x070, 8),
            Field::ExitInfo1 => (0x078, 8),
            Field::ExitInfo2 => (0x080, 8),
            Field::ExitIntInfo => (0x088, 8),
            Field::NpEnable => (0x090, 8),
            Field::EventInj => (0x0a8, 8),
            Field::NestedCr3 => (0x0b0, 8),
            Field::VmcbClean => (0x0c0, 4),
            Field::NextRip => (0x0c8, 8),
            Field::Cpl => (0x4cb, 1),
            Field::Efer => (0x4d0, 8),
            Field::Cr4 => (0x548, 8),
            Field::Cr3 => (0x550, 8),
            Field::Cr0 => (0x558, 8),
            Field::Dr7 => (0x560, 8),
            Field::Dr6 => (0x568, 8),
            Field::Rflags => (0x570, 8),
            Field::Rip => (0x578, 8),
            Field::Rsp => (0x5d8, 8),
            Field::Rax => (0x5f8, 8),
            Field::Cr2 => (0x640, 8),
        }
    }
}

/// Segment registers of the state save area.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentField {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Gdtr,
    Ldtr,
    Idtr,
    Tr,
}

impl SegmentField {
    const fn offset(self) -> usize {
        0x400 + 0x10 * self as usize
    }
}

/// The virtual interrupt control word (`V_INTR` fields at 0x60).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VIntr(pub u64);

impl VIntr {
    const V_IRQ: u64 = 1 << 8;
    const V_GIF: u64 = 1 << 9;
    const V_IGN_TPR: u64 = 1 << 20;
    const V_INTR_MASKING: u64 = 1 << 24;

    fn set_bit(&mut self, bit: u64, on: bool) {
        if on {
            self.0 |= bit
        } else {
            self.0 &= !bit
        }
    }

    /// Virtual TPR.
    pub fn tpr(&self) -> u8 {
        self.0 as u8
    }

    /// Set the virtual TPR.
    pub fn set_tpr(&mut self, tpr: u8) {
        self.0 = (self.0 & !0xff) | tpr as u64;
    }

    /// A virtual interrupt is pending.
    pub fn irq(&self) -> bool {
        self.0 & Self::V_IRQ != 0
    }

    /// Set or clear the pending virtual interrupt.
    pub fn set_irq(&mut self, on: bool) {
        self.set_bit(Self::V_IRQ, on)
    }

    /// Virtual global interrupt flag.
    pub fn gif(&self) -> bool {
        self.0 & Self::V_GIF != 0
    }

    /// Priority of the pending virtual interrupt.
    pub fn intr_prio(&self) -> u8 {
        ((self.0 >> 16) & 0xf) as u8
    }

    /// Set the priority of the pending virtual interrupt.
    pub fn set_intr_prio(&mut self, prio: u8) {
        self.0 = (self.0 & !(0xf << 16)) | (((prio & 0xf) as u64) << 16);
    }

    /// The pending virtual interrupt ignores the TPR.
    pub fn ign_tpr(&self) -> bool {
        self.0 & Self::V_IGN_TPR != 0
    }

    /// Set V_IGN_TPR.
    pub fn set_ign_tpr(&mut self, on: bool) {
        self.set_bit(Self::V_IGN_TPR, on)
    }

    /// Virtual interrupt masking.
    pub fn intr_masking(&self) -> bool {
        self.0 & Self::V_INTR_MASKING != 0
    }

    /// Set virtual interrupt masking.
    pub fn set_intr_masking(&mut self, on: bool) {
        self.set_bit(Self::V_INTR_MASKING, on)
    }

    /// Vector of the pending virtual interrupt.
    pub fn vector(&self) -> u8 {
        (self.0 >> 32) as u8
    }

    /// Set the vector of the pending virtual interrupt.
    pub fn set_vector(&mut self, vector: u8) {
        self.0 = (self.0 & !(0xff << 32)) | ((vector as u64) << 32);
    }
}

/// Event type of EVENTINJ and EXITINTINFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EventType {
    /// External or virtual interrupt.
    ExternalIntr = 0,
    /// Virtual interrupt.
    VirtualIntr = 1,
    /// Non-maskable interrupt.
    Nmi = 2,
    /// Exception.
    Exception = 3,
    /// Software interrupt.
    SoftwareIntr = 4,
}

/// An event to inject, or the event that was being delivered at exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInjection {
    /// Vector.
    pub vector: u8,
    /// Type of the event.
    pub kind: EventType,
    /// Error code pushed with the event.
    pub error_code: Option<u32>,
    /// Valid bit.
    pub valid: bool,
}

impl EventInjection {
    const EV: u64 = 1 << 11;
    const V: u64 = 1 << 31;

    /// A valid event.
    pub fn new(kind: EventType, vector: u8, error_code: Option<u32>) -> Self {
        Self {
            vector,
            kind,
            error_code,
            valid: true,
        }
    }

    /// Encode into the 64-bit field layout.
    pub fn encode(&self) -> u64 {
        let mut v = self.vector as u64 | ((u8::from(self.kind) as u64) << 8);
        if let Some(ec) = self.error_code {
            v |= Self::EV | ((ec as u64) << 32);
        }
        if self.valid {
            v |= Self::V;
        }
        v
    }

    /// Decode the 64-bit field layout.
    pub fn decode(raw: u64) -> Result<Self, VmError> {
        Ok(Self {
            vector: raw as u8,
            kind: EventType::try_from(((raw >> 8) & 0x7) as u8)
                .map_err(|_| VmError::InvalidExitInfo(raw))?,
            error_code: if raw & Self::EV != 0 {
                Some((raw >> 32) as u32)
            } else {
                None
            },
            valid: raw & Self::V != 0,
        })
    }

    /// Whether the valid bit of a raw field is set.
    pub fn is_valid(raw: u64) -> bool {
        raw & Self::V != 0
    }
}

impl Default for Vmcb {
    fn default() -> Self {
        Self::new()
    }
}

impl Vmcb {
    /// Create a zeroed VMCB.
    pub const fn new() -> Self {
        Self { data: [0; 4096] }
    }

    /// Raw bytes of the block.
    pub fn as_bytes(&self) -> &[u8; 4096] {
        &self.data
    }

    /// Read a field, zero extended.
    pub fn read(&self, field: Field) -> u64 {
        let (offset, size) = field.layout();
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&self.data[offset..offset + size]);
        u64::from_le_bytes(buf)
    }

    /// Write a field, truncating `v` to its size.
    pub fn write(&mut self, field: Field, v: u64) {
        let (offset, size) = field.layout();
        self.data[offset..offset + size].copy_from_slice(&v.to_le_bytes()[..size]);
    }

    /// Read a segment register.
    pub fn segment(&self, seg: SegmentField) -> Segment {
        let off = seg.offset();
        let d = &self.data[off..off + 16];
        Segment {
            selector: u16::from_le_bytes([d[0], d[1]]),
            attrib: u16::from_le_bytes([d[2], d[3]]),
            limit: u32::from_le_bytes([d[4], d[5], d[6], d[7]]),
            base: u64::from_le_bytes([d[8], d[9], d[10], d[11], d[12], d[13], d[14], d[15]]),
        }
    }

    /// Write a segment register.
    pub fn set_segment(&mut self, seg: SegmentField, s: &Segment) {
        let off = seg.offset();
        let d = &mut self.data[off..off + 16];
        d[0..2].copy_from_slice(&s.selector.to_le_bytes());
        d[2..4].copy_from_slice(&s.attrib.to_le_bytes());
        d[4..8].copy_from_slice(&s.limit.to_le_bytes());
        d[8..16].copy_from_slice(&s.base.to_le_bytes());
    }

    /// The virtual interrupt control word.
    pub fn vintr(&self) -> VIntr {
        VIntr(self.read(Field::VIntr))
    }

    /// Write the virtual interrupt control word.
    pub fn set_vintr(&mut self, v: VIntr) {
        self.write(Field::VIntr, v.0)
    }

    /// Dump the guest state at debug level.
    pub fn dump(&self) {
        log::debug!(
            "RIP: {:#x}, RSP: {:#x}, RAX: {:#x}, RFLAGS: {:#x}, EFER: {:#x}",
            self.read(Field::Rip),
            self.read(Field::Rsp),
            self.read(Field::Rax),
            self.read(Field::Rflags),
            self.read(Field::Efer)
        );
        log::debug!(
            "cr0: {:#x} cr2: {:#x} cr3: {:#x} cr4: {:#x}",
            self.read(Field::Cr0),
            self.read(Field::Cr2),
            self.read(Field::Cr3),
            self.read(Field::Cr4)
        );
        for (name, seg) in [
            ("CS", SegmentField::Cs),
            ("SS", SegmentField::Ss),
            ("DS", SegmentField::Ds),
            ("ES", SegmentField::Es),
            ("FS", SegmentField::Fs),
            ("GS", SegmentField::Gs),
        ] {
            let s = self.segment(seg);
            log::debug!(
                "{}: sel: {:#x}, base: {:#x}, limit: {:#x}, attrib: {:#x}",
                name,
                s.selector,
                s.base,
                s.limit,
                s.attrib
            );
        }
    }
}
