//! Fetch and decode of the guest instruction at RIP.
use crate::{
    host::HostMemory,
    state::{GuestCpuState, SegmentRegister},
    translate::{linear_address, Translator},
    VmError,
};
use iced_x86::{Decoder, DecoderOptions, Instruction};

/// Maximum length of an x86 instruction.
pub const MAX_INSN_LEN: usize = 15;

/// Raw bytes at the guest instruction pointer.
#[derive(Debug, Clone, Copy)]
pub struct InstructionBytes {
    bytes: [u8; MAX_INSN_LEN],
    len: usize,
}

impl InstructionBytes {
    /// The fetched bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Segment override prefix in front of the opcode, if any.
    ///
    /// Scans the legacy prefixes (and a REX prefix in 64-bit code); the
    /// last segment override wins.
    pub fn segment_override(&self) -> Option<SegmentRegister> {
        let mut seg = None;
        for b in self.as_slice() {
            match b {
                0x2e => seg = Some(SegmentRegister::Cs),
                0x36 => seg = Some(SegmentRegister::Ss),
                0x3e => seg = Some(SegmentRegister::Ds),
                0x26 => seg = Some(SegmentRegister::Es),
                0x64 => seg = Some(SegmentRegister::Fs),
                0x65 => seg = Some(SegmentRegister::Gs),
                // lock, repne, rep, operand and address size, rex.
                0xf0 | 0xf2 | 0xf3 | 0x66 | 0x67 | 0x40..=0x4f => (),
                _ => break,
            }
        }
        seg
    }

    /// Decode the bytes as code of the guest's current mode.
    pub fn decode(&self, state: &GuestCpuState) -> Result<Instruction, VmError> {
        let mut decoder = Decoder::with_ip(
            state.code_bitness(),
            self.as_slice(),
            state.rip,
            DecoderOptions::NONE,
        );
        let mut insn = Instruction::default();
        if decoder.can_decode() {
            decoder.decode_out(&mut insn);
            if !insn.is_invalid() {
                return Ok(insn);
            }
        }
        Err(VmError::FailedToDecodeInstruction)
    }
}

impl From<&[u8]> for InstructionBytes {
    fn from(b: &[u8]) -> Self {
        let len = b.len().min(MAX_INSN_LEN);
        let mut bytes = [0; MAX_INSN_LEN];
        bytes[..len].copy_from_slice(&b[..len]);
        Self { bytes, len }
    }
}

/// Pull the bytes at CS:RIP.
///
/// The fetch stops early at an unmapped page; it fails only if not even the
/// first byte is readable.
pub fn fetch<H: HostMemory + ?Sized>(
    t: &Translator<'_, H>,
    state: &GuestCpuState,
) -> Result<InstructionBytes, VmError> {
    let rip = linear_address(state, SegmentRegister::Cs, state.rip);
    let mut bytes = [0; MAX_INSN_LEN];
    let len = t.read_guest_va(state, rip, &mut bytes);
    if len == 0 {
        t.read_guest_va_exact(state, rip, &mut bytes[..1])?;
    }
    Ok(InstructionBytes { bytes, len })
}

/// Get the instruction that rip pointed.
pub fn get_instruction<H: HostMemory + ?Sized>(
    t: &Translator<'_, H>,
    state: &GuestCpuState,
) -> Result<(Instruction, InstructionBytes), VmError> {
    let bytes = fetch(t, state)?;
    bytes.decode(state).map(|insn| (insn, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addressing::Gpa,
        config::PagingStrategy,
        state::{Cr0, Cr4, Efer},
        testutil::FlatHost,
    };
    use iced_x86::{Code, Register};

    fn long_mode() -> GuestCpuState {
        let mut state = GuestCpuState::new(PagingStrategy::Nested);
        state.ctrl_regs.cr0 = Cr0::PE.bits();
        state.ctrl_regs.cr4 = Cr4::PAE.bits();
        state.ctrl_regs.efer = (Efer::LME | Efer::LMA).bits();
        state.segments.cs.attrib = 1 << 9;
        state.update_modes();
        state
    }

    #[test]
    fn prefixes() {
        let b = InstructionBytes::from(&[0xf3, 0x26, 0x6e][..]);
        assert_eq!(b.segment_override(), Some(SegmentRegister::Es));
        let b = InstructionBytes::from(&[0x64, 0x67, 0xf3, 0x48, 0x6f][..]);
        assert_eq!(b.segment_override(), Some(SegmentRegister::Fs));
        // 0x2e after the opcode is not a prefix.
        let b = InstructionBytes::from(&[0x6e, 0x2e][..]);
        assert_eq!(b.segment_override(), None);
    }

    #[test]
    fn fetch_at_rip() {
        let host = FlatHost::new(2);
        let map = host.identity_map();
        let t = Translator::new(&host, &map);
        let mut state = long_mode();
        state.rip = 0x1ffe;
        // mov [rbx], eax straddling the end of guest memory.
        host.fill(0x1ffe, &[0x89, 0x03]);
        let (insn, bytes) = get_instruction(&t, &state).unwrap();
        assert_eq!(bytes.as_slice().len(), 2);
        assert_eq!(insn.code(), Code::Mov_rm32_r32);
        assert_eq!(insn.op1_register(), Register::EAX);
        assert_eq!(insn.len(), 2);

        state.rip = 0x2000;
        let err = fetch(&t, &state).unwrap_err();
        assert_eq!(err.stage(), Some(crate::translate::TranslationStage::GpaToHpa));
        assert_eq!(t.read_guest_pa(Gpa::new(0x2000), &mut [0; 1]), 0);
    }

    #[test]
    fn undecodable() {
        let state = long_mode();
        // Truncated mov r64, imm64.
        let b = InstructionBytes::from(&[0x48, 0xb8, 0x00][..]);
        assert!(matches!(b.decode(&state), Err(VmError::FailedToDecodeInstruction)));
    }
}
