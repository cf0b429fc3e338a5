//! Control register access emulation.
//!
//! Under shadow paging the guest never owns the hardware CR0 and CR3: its
//! writes land in [`ShadowState`](crate::state::ShadowState) and the
//! hardware keeps paging and protection enabled so the shadow tables stay
//! in force. Under nested paging the writes go to the mirror as is.
use crate::{
    config::{trace_event, CoreConfig, PagingStrategy, TraceFlags},
    state::{Cr0, Cr4, Efer, GeneralPurposeRegisters, GuestCpuState},
    VmError,
};
use iced_x86::{Code, Instruction, OpKind, Register};

/// What the caller must do after a control register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrEffect {
    /// Nothing.
    None,
    /// The shadow page tables no longer match the guest's and must be
    /// rebuilt from the guest-visible CR3.
    ShadowRootChanged,
}

fn cr_register(cr: u8) -> Option<Register> {
    match cr {
        0 => Some(Register::CR0),
        3 => Some(Register::CR3),
        4 => Some(Register::CR4),
        _ => None,
    }
}

fn register_operand(state: &GuestCpuState, insn: &Instruction, op: u32) -> Result<u64, VmError> {
    let unsupported = VmError::UnsupportedInstruction(insn.code());
    if insn.op_kind(op) != OpKind::Register {
        return Err(unsupported);
    }
    state.gprs.get(insn.op_register(op)).ok_or(unsupported)
}

/// Emulate a write to CR`cr` by `insn` and step over it.
pub fn handle_cr_write(
    state: &mut GuestCpuState,
    cr: u8,
    insn: &Instruction,
    config: &CoreConfig,
) -> Result<CrEffect, VmError> {
    let unsupported = VmError::UnsupportedInstruction(insn.code());
    let target = cr_register(cr).ok_or(unsupported)?;
    let new = match insn.code() {
        Code::Mov_cr_r32 | Code::Mov_cr_r64 if insn.op0_register() == target => {
            register_operand(state, insn, 1)?
        }
        // LMSW only touches PE, MP, EM and TS, and can not clear PE.
        Code::Lmsw_rm16 if cr == 0 => {
            let msw = register_operand(state, insn, 0)?;
            let old = state.guest_cr0();
            (old & !0xe) | (msw & 0xf) | (old & 0x1)
        }
        Code::Clts if cr == 0 => state.guest_cr0() & !Cr0::TS.bits(),
        _ => return Err(VmError::UnsupportedInstruction(insn.code())),
    };
    trace_event!(
        config,
        TraceFlags::CTRL_REGS,
        "CR{} write {:#x} at rip {:#x}",
        cr,
        new,
        state.rip
    );
    let effect = match cr {
        0 => write_cr0(state, new),
        3 => write_cr3(state, new),
        _ => write_cr4(state, new),
    };
    state.rip = state.rip.wrapping_add(insn.len() as u64);
    state.update_modes();
    Ok(effect)
}

fn write_cr0(state: &mut GuestCpuState, new: u64) -> CrEffect {
    let old = Cr0::from_bits_truncate(state.guest_cr0());
    let cr0 = Cr0::from_bits_truncate(new);
    let mut efer = Efer::from_bits_truncate(state.ctrl_regs.efer);
    if cr0.contains(Cr0::PG) && efer.contains(Efer::LME) {
        efer.insert(Efer::LMA);
    } else if !cr0.contains(Cr0::PG) {
        efer.remove(Efer::LMA);
    }
    state.ctrl_regs.efer = (state.ctrl_regs.efer & !Efer::LMA.bits()) | (efer.bits() & Efer::LMA.bits());
    match state.paging {
        PagingStrategy::Nested => {
            state.ctrl_regs.cr0 = new;
            CrEffect::None
        }
        PagingStrategy::Shadow => {
            state.shadow.guest_cr0 = new;
            state.ctrl_regs.cr0 = new | (Cr0::PE | Cr0::PG).bits();
            if old.contains(Cr0::PG) != cr0.contains(Cr0::PG) {
                CrEffect::ShadowRootChanged
            } else {
                CrEffect::None
            }
        }
    }
}

fn write_cr3(state: &mut GuestCpuState, new: u64) -> CrEffect {
    match state.paging {
        PagingStrategy::Nested => {
            state.ctrl_regs.cr3 = new;
            CrEffect::None
        }
        PagingStrategy::Shadow => {
            state.shadow.guest_cr3 = new;
            if Cr0::from_bits_truncate(state.shadow.guest_cr0).contains(Cr0::PG) {
                CrEffect::ShadowRootChanged
            } else {
                CrEffect::None
            }
        }
    }
}

fn write_cr4(state: &mut GuestCpuState, new: u64) -> CrEffect {
    let changed = Cr4::from_bits_truncate(state.ctrl_regs.cr4 ^ new);
    state.ctrl_regs.cr4 = new;
    if state.paging == PagingStrategy::Shadow
        && changed.intersects(Cr4::PAE | Cr4::PSE | Cr4::PGE)
    {
        CrEffect::ShadowRootChanged
    } else {
        CrEffect::None
    }
}

/// Emulate a read of CR`cr` by `insn` and step over it.
///
/// The guest always reads the guest-visible value.
pub fn handle_cr_read(
    state: &mut GuestCpuState,
    cr: u8,
    insn: &Instruction,
    config: &CoreConfig,
) -> Result<(), VmError> {
    let unsupported = VmError::UnsupportedInstruction(insn.code());
    let target = cr_register(cr).ok_or(unsupported)?;
    let value = match cr {
        0 => state.guest_cr0(),
        3 => state.guest_cr3(),
        _ => state.ctrl_regs.cr4,
    };
    let (dst, value) = match insn.code() {
        Code::Mov_r32_cr | Code::Mov_r64_cr if insn.op1_register() == target => {
            (insn.op0_register(), value)
        }
        Code::Smsw_r32m16 | Code::Smsw_r64m16 | Code::Smsw_rm16
            if cr == 0 && insn.op0_kind() == OpKind::Register =>
        {
            (insn.op0_register(), value & 0xffff)
        }
        _ => return Err(VmError::UnsupportedInstruction(insn.code())),
    };
    if GeneralPurposeRegisters::width(dst).is_none() {
        return Err(VmError::UnsupportedInstruction(insn.code()));
    }
    state
        .gprs
        .set(dst, value)
        .ok_or(VmError::UnsupportedInstruction(insn.code()))?;
    trace_event!(
        config,
        TraceFlags::CTRL_REGS,
        "CR{} read {:#x} at rip {:#x}",
        cr,
        value,
        state.rip
    );
    state.rip = state.rip.wrapping_add(insn.len() as u64);
    Ok(())
}
