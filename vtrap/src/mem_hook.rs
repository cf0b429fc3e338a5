//! Emulation of guest accesses to hooked memory.
//!
//! Hooked regions have no host backing, so every guest access to them
//! faults. The faulting instruction is decoded and emulated against the
//! region's [`MemoryHook`](crate::shadow_map::MemoryHook): stores hand the
//! source operand to the hook, loads put the hook's bytes in the
//! destination register.
use crate::{
    addressing::Gpa,
    config::{trace_event, CoreConfig, TraceFlags},
    exit::PageFaultErrorCode,
    shadow_map::ShadowMap,
    state::{GeneralPurposeRegisters, GuestCpuState},
    HookTarget, VmError,
};
use iced_x86::{Code, Instruction, MemorySize, OpKind};

/// A decoded access to hooked memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Store of `value` (the low `size` bytes).
    Write {
        /// Value to store.
        value: u64,
    },
    /// Load into the destination register.
    Read,
}

/// The access an instruction makes to hooked memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    /// Access size in bytes.
    pub size: usize,
    /// Direction and value of the access.
    pub direction: Direction,
}

fn access_size(insn: &Instruction) -> Result<usize, VmError> {
    match insn.memory_size() {
        MemorySize::UInt8 => Ok(1),
        MemorySize::UInt16 => Ok(2),
        MemorySize::UInt32 => Ok(4),
        MemorySize::UInt64 => Ok(8),
        _ => Err(VmError::UnsupportedInstruction(insn.code())),
    }
}

fn source_value(insn: &Instruction, gprs: &GeneralPurposeRegisters) -> Result<u64, VmError> {
    match insn.op1_kind() {
        OpKind::Register => gprs
            .get(insn.op1_register())
            .ok_or(VmError::UnsupportedInstruction(insn.code())),
        OpKind::Immediate8 => Ok(insn.immediate8() as u64),
        OpKind::Immediate16 => Ok(insn.immediate16() as u64),
        OpKind::Immediate32 => Ok(insn.immediate32() as u64),
        OpKind::Immediate32to64 => Ok(insn.immediate32to64() as u64),
        _ => Err(VmError::UnsupportedInstruction(insn.code())),
    }
}

/// Decode the memory access of `insn`.
///
/// Only `MOV` between a register or an immediate and memory is emulated.
pub fn decode_access(insn: &Instruction, gprs: &GeneralPurposeRegisters) -> Result<MemAccess, VmError> {
    let direction = match insn.code() {
        Code::Mov_rm8_r8
        | Code::Mov_rm16_r16
        | Code::Mov_rm32_r32
        | Code::Mov_rm64_r64
        | Code::Mov_rm8_imm8
        | Code::Mov_rm16_imm16
        | Code::Mov_rm32_imm32
        | Code::Mov_rm64_imm32
            if insn.op0_kind() == OpKind::Memory =>
        {
            Direction::Write {
                value: source_value(insn, gprs)?,
            }
        }
        Code::Mov_r8_rm8 | Code::Mov_r16_rm16 | Code::Mov_r32_rm32 | Code::Mov_r64_rm64
            if insn.op1_kind() == OpKind::Memory =>
        {
            Direction::Read
        }
        _ => return Err(VmError::UnsupportedInstruction(insn.code())),
    };
    Ok(MemAccess {
        size: access_size(insn)?,
        direction,
    })
}

/// Emulate `insn`, which faulted at `gpa` inside a hooked region, and step
/// over it.
///
/// The write bit of `error_code` must agree with the decoded direction.
pub fn mem_hook_dispatch(
    state: &mut GuestCpuState,
    map: &mut ShadowMap,
    gpa: Gpa,
    error_code: PageFaultErrorCode,
    insn: &Instruction,
    config: &CoreConfig,
) -> Result<(), VmError> {
    let access = decode_access(insn, &state.gprs)?;
    let is_write = matches!(access.direction, Direction::Write { .. });
    if is_write != error_code.contains(PageFaultErrorCode::WRITE) {
        return Err(VmError::UnsupportedInstruction(insn.code()));
    }
    let hook = map.mem_hook(gpa).ok_or(VmError::NotFound(gpa))?;
    let failed = || VmError::HookFailed(HookTarget::Memory(gpa));
    match access.direction {
        Direction::Write { value } => {
            let bytes = value.to_le_bytes();
            if hook.write(gpa, &bytes[..access.size])? != access.size {
                return Err(failed());
            }
            trace_event!(
                config,
                TraceFlags::EMULATOR,
                "write {:#x} ({} bytes) to {}",
                value,
                access.size,
                gpa
            );
        }
        Direction::Read => {
            let mut bytes = [0u8; 8];
            if hook.read(gpa, &mut bytes[..access.size])? != access.size {
                return Err(failed());
            }
            let value = u64::from_le_bytes(bytes);
            state
                .gprs
                .set(insn.op0_register(), value)
                .ok_or(VmError::UnsupportedInstruction(insn.code()))?;
            trace_event!(
                config,
                TraceFlags::EMULATOR,
                "read {:#x} ({} bytes) from {}",
                value,
                access.size,
                gpa
            );
        }
    }
    state.rip = state.rip.wrapping_add(insn.len() as u64);
    Ok(())
}
