//! IOIO exits.
use super::SvmCore;
use crate::{
    addressing::Gva,
    config::{trace_event, TraceFlags},
    decode,
    exit::IoInfo,
    host::HostMemory,
    io_map::Access,
    state::{Rflags, SegmentRegister},
    translate::{linear_address, Translator},
    HookTarget, VmError,
};
use iced_x86::Register;

fn accumulator(size: usize) -> Register {
    match size {
        1 => Register::AL,
        2 => Register::AX,
        _ => Register::EAX,
    }
}

impl SvmCore {
    pub(super) fn handle_io<H: HostMemory + ?Sized>(
        &mut self,
        host: &H,
        info1: u64,
        info2: u64,
    ) -> Result<(), VmError> {
        let info = IoInfo::decode(info1)?;
        let result = match (info.is_in, info.string) {
            (true, false) => self.handle_io_in(&info),
            (false, false) => self.handle_io_out(&info),
            (true, true) => self.handle_io_ins(host, &info),
            (false, true) => self.handle_io_outs(host, &info),
        };
        match result {
            // EXITINFO2 holds the rip of the next instruction.
            Ok(()) => {
                self.state.rip = info2;
                Ok(())
            }
            // Leave rip on the instruction; the guest restarts it after
            // handling the fault.
            Err(e) if e.is_guest_fault() => {
                self.inject_guest_page_fault(&e, info.is_in);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// IN: the port's bytes land in AL, AX or EAX.
    pub(super) fn handle_io_in(&mut self, info: &IoInfo) -> Result<(), VmError> {
        let mut buf = [0u8; 8];
        let handler = self.io_map.handler(info.port, Access::READ)?;
        if handler.read(info.port, &mut buf[..info.size])? != info.size {
            return Err(VmError::HookFailed(HookTarget::Port(info.port)));
        }
        let value = u64::from_le_bytes(buf);
        self.state.gprs.set(accumulator(info.size), value);
        trace_event!(
            self.config,
            TraceFlags::IO,
            "in {:#x} from port {:#x} ({} bytes)",
            value,
            info.port,
            info.size
        );
        Ok(())
    }

    /// OUT: the low bytes of RAX go to the port.
    pub(super) fn handle_io_out(&mut self, info: &IoInfo) -> Result<(), VmError> {
        let bytes = (self.state.gprs.rax as u64).to_le_bytes();
        let handler = self.io_map.handler(info.port, Access::WRITE)?;
        if handler.write(info.port, &bytes[..info.size])? != info.size {
            return Err(VmError::HookFailed(HookTarget::Port(info.port)));
        }
        trace_event!(
            self.config,
            TraceFlags::IO,
            "out {:02x?} to port {:#x}",
            &bytes[..info.size],
            info.port
        );
        Ok(())
    }

    /// Address mask and repetition count of a string operation.
    fn string_params(&self, info: &IoInfo) -> (u64, u64) {
        let mask = info.addr_mask().unwrap_or_else(|| self.state.gpr_mask());
        let count = if info.rep {
            self.state.gprs.rcx as u64 & mask
        } else {
            1
        };
        (mask, count)
    }

    // Step the index register and the counter after one element. Bits above
    // the address size are kept.
    fn step_string(&mut self, info: &IoInfo, index: Register, mask: u64) {
        let size = info.size as u64;
        let down = self.state.rflags().contains(Rflags::DF);
        let slot = match index {
            Register::RDI => &mut self.state.gprs.rdi,
            _ => &mut self.state.gprs.rsi,
        };
        let cur = *slot as u64;
        let stepped = if down {
            cur.overflowing_sub(size).0
        } else {
            cur.overflowing_add(size).0
        };
        *slot = ((cur & !mask) | (stepped & mask)) as usize;
        if info.rep {
            let rcx = self.state.gprs.rcx as u64;
            self.state.gprs.rcx = ((rcx & !mask) | (rcx.wrapping_sub(1) & mask)) as usize;
        }
    }

    /// INS: port to ES:rDI, `rcx` times under REP.
    pub(super) fn handle_io_ins<H: HostMemory + ?Sized>(
        &mut self,
        host: &H,
        info: &IoInfo,
    ) -> Result<(), VmError> {
        self.io_map.handler(info.port, Access::READ)?;
        let map = self.mem_map.clone();
        let map = map.read();
        let t = Translator::new(host, &map);
        let (mask, count) = self.string_params(info);
        for _ in 0..count {
            let dst = linear_address(
                &self.state,
                SegmentRegister::Es,
                self.state.gprs.rdi as u64 & mask,
            );
            // Fault before the device sees the access.
            t.gva_to_hva(&self.state, dst)?;
            t.gva_to_hva(&self.state, dst + (info.size - 1))?;
            let mut buf = [0u8; 4];
            let handler = self.io_map.handler(info.port, Access::READ)?;
            if handler.read(info.port, &mut buf[..info.size])? != info.size {
                return Err(VmError::HookFailed(HookTarget::Port(info.port)));
            }
            t.write_guest_va_exact(&self.state, dst, &buf[..info.size])?;
            trace_event!(
                self.config,
                TraceFlags::IO,
                "ins {:02x?} from port {:#x} to {}",
                &buf[..info.size],
                info.port,
                dst
            );
            self.step_string(info, Register::RDI, mask);
        }
        Ok(())
    }

    /// OUTS: DS:rSI (or the override segment) to port, `rcx` times under
    /// REP.
    pub(super) fn handle_io_outs<H: HostMemory + ?Sized>(
        &mut self,
        host: &H,
        info: &IoInfo,
    ) -> Result<(), VmError> {
        self.io_map.handler(info.port, Access::WRITE)?;
        let map = self.mem_map.clone();
        let map = map.read();
        let t = Translator::new(host, &map);
        let seg = decode::fetch(&t, &self.state)?
            .segment_override()
            .unwrap_or(SegmentRegister::Ds);
        let (mask, count) = self.string_params(info);
        for _ in 0..count {
            let src: Gva = linear_address(&self.state, seg, self.state.gprs.rsi as u64 & mask);
            let mut buf = [0u8; 4];
            t.read_guest_va_exact(&self.state, src, &mut buf[..info.size])?;
            let handler = self.io_map.handler(info.port, Access::WRITE)?;
            if handler.write(info.port, &buf[..info.size])? != info.size {
                return Err(VmError::HookFailed(HookTarget::Port(info.port)));
            }
            trace_event!(
                self.config,
                TraceFlags::IO,
                "outs {:02x?} from {} to port {:#x}",
                &buf[..info.size],
                src,
                info.port
            );
            self.step_string(info, Register::RSI, mask);
        }
        Ok(())
    }
}
