//! MSR exits.
use super::SvmCore;
use crate::{
    config::{trace_event, TraceFlags},
    io_map::Access,
    VmError,
};

impl SvmCore {
    pub(super) fn handle_msr(&mut self, info1: u64) -> Result<(), VmError> {
        match info1 {
            0 => self.handle_msr_read()?,
            1 => self.handle_msr_write()?,
            info => return Err(VmError::InvalidExitInfo(info)),
        }
        // rdmsr and wrmsr are both two bytes long.
        self.state.rip = self.state.rip.wrapping_add(2);
        Ok(())
    }

    /// RDMSR: ECX names the register, the value goes to EDX:EAX.
    pub(super) fn handle_msr_read(&mut self) -> Result<(), VmError> {
        let msr = self.state.gprs.rcx as u32;
        let value = self.msr_map.handler(msr, Access::READ)?.rdmsr(msr)?;
        self.state.gprs.rax = (value & 0xffff_ffff) as usize;
        self.state.gprs.rdx = (value >> 32) as usize;
        trace_event!(
            self.config,
            TraceFlags::MSR,
            "rdmsr {:#x} = {:#x}",
            msr,
            value
        );
        Ok(())
    }

    /// WRMSR: EDX:EAX goes to the register named by ECX.
    pub(super) fn handle_msr_write(&mut self) -> Result<(), VmError> {
        let msr = self.state.gprs.rcx as u32;
        let value = ((self.state.gprs.rdx as u64 & 0xffff_ffff) << 32)
            | (self.state.gprs.rax as u64 & 0xffff_ffff);
        self.msr_map.handler(msr, Access::WRITE)?.wrmsr(msr, value)?;
        trace_event!(
            self.config,
            TraceFlags::MSR,
            "wrmsr {:#x} <- {:#x}",
            msr,
            value
        );
        Ok(())
    }
}
