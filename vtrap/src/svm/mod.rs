//! SVM VM-exit dispatcher.
//!
//! [`SvmCore::handle_exit`] runs once per exit, to completion, on the thread
//! that ran the guest:
//!
//! 1. pull the control block into the [`GuestCpuState`] mirror,
//! 2. advance the external interrupt in flight,
//! 3. route the exit to its handler,
//! 4. decide what to inject on the next entry,
//! 5. push the mirror back into the control block.
//!
//! A handler error aborts the exit before injection. Such an exit is fatal:
//! an [`ExitDiagnostics`] record is logged and kept on the core.
mod io;
mod msr;

use crate::{
    addressing::{Gpa, Gva, Hva},
    config::{trace_event, CoreConfig, PagingStrategy, TraceFlags},
    ctrl_regs::{self, CrEffect},
    decode,
    exit::{ExitCode, ExitReason, PageFaultErrorCode, PF_VECTOR},
    host::HostMemory,
    intr::{InterruptController, InterruptInjectionState, InterruptKind, IrqState},
    io_map::PortMap,
    mem_hook::mem_hook_dispatch,
    msr_map::MsrMap,
    shadow_map::{HostRegionKind, ShadowMap},
    state::{GuestCpuState, SegmentRegister},
    translate::{linear_address, Translator},
    vmcb::{EventInjection, EventType, Field, SegmentField, VIntr, Vmcb},
    VmError,
};
use alloc::{boxed::Box, string::String, sync::Arc, vec, vec::Vec};
use spin::RwLock;

/// Collaborators of the dispatcher that live outside this crate.
pub trait CoreServices: InterruptController {
    /// Bring the shadow page tables in line with the guest's after a page
    /// fault on ordinary memory.
    fn reconcile_shadow_pagetable(
        &mut self,
        state: &mut GuestCpuState,
        fault: Gva,
        error_code: PageFaultErrorCode,
    ) -> Result<(), VmError>;

    /// Rebuild the shadow page tables from the guest-visible CR3.
    fn activate_shadow_pt(&mut self, state: &mut GuestCpuState) -> Result<(), VmError>;

    /// Drop the shadow translation of `gva`.
    fn invalidate_shadow_page(&mut self, state: &mut GuestCpuState, gva: Gva)
        -> Result<(), VmError>;

    /// Resolve a nested page fault on ordinary memory.
    fn handle_nested_pagefault(
        &mut self,
        state: &mut GuestCpuState,
        gpa: Gpa,
        error_code: PageFaultErrorCode,
    ) -> Result<(), VmError>;

    /// Handle VMMCALL.
    fn hypercall(&mut self, state: &mut GuestCpuState) -> Result<(), VmError>;

    /// The guest executed HLT.
    fn halt(&mut self, _state: &mut GuestCpuState) -> Result<(), VmError> {
        Ok(())
    }

    /// The guest executed PAUSE.
    fn pause(&mut self, _state: &mut GuestCpuState) -> Result<(), VmError> {
        Ok(())
    }

    /// The guest executed WBINVD.
    fn wbinvd(&mut self, _state: &mut GuestCpuState) -> Result<(), VmError> {
        Ok(())
    }
}

/// What is known about a fatal exit.
#[derive(Debug, Clone)]
pub struct ExitDiagnostics {
    /// Classified exit reason.
    pub reason: ExitReason,
    /// Raw exit code.
    pub exit_code: u64,
    /// EXITINFO1.
    pub exit_info1: u64,
    /// EXITINFO2.
    pub exit_info2: u64,
    /// Guest RIP.
    pub rip: u64,
    /// Linear address of RIP.
    pub rip_linear: Gva,
    /// Host address of RIP, if it resolves.
    pub rip_host: Option<Hva>,
    /// Instruction bytes right before RIP.
    pub before: Vec<u8>,
    /// Instruction bytes at RIP.
    pub after: Vec<u8>,
    /// The error that stopped the exit.
    pub error: String,
}

impl core::fmt::Display for ExitDiagnostics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(
            f,
            "Unhandled exit: {} (0x{:x}): {}",
            self.reason, self.exit_code, self.error
        )?;
        for (name, info) in [("exit_info1", self.exit_info1), ("exit_info2", self.exit_info2)] {
            writeln!(
                f,
                "{} low = 0x{:08x}, high = 0x{:08x}",
                name,
                info as u32,
                (info >> 32) as u32
            )?;
        }
        writeln!(f, "RIP: 0x{:x}, RIP Linear: 0x{:x}", self.rip, self.rip_linear)?;
        match self.rip_host {
            Some(hva) => writeln!(f, "Host Address of rip = 0x{:x}", hva)?,
            None => writeln!(f, "Host Address of rip = <unmapped>")?,
        }
        let start = self.rip_linear - self.before.len();
        for (at, bytes) in [(start, &self.before), (self.rip_linear, &self.after)] {
            write!(f, "Instr ({} bytes) at 0x{:x}:", bytes.len(), at)?;
            for b in bytes.iter() {
                write!(f, " {b:02x}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// A virtual core running on SVM.
pub struct SvmCore {
    /// Register mirror.
    pub state: GuestCpuState,
    /// Injection bookkeeping.
    pub intr: InterruptInjectionState,
    /// Port I/O map.
    pub io_map: PortMap,
    /// MSR map.
    pub msr_map: MsrMap,
    vmcb: Box<Vmcb>,
    mem_map: Arc<RwLock<ShadowMap>>,
    config: CoreConfig,
    last_fatal: Option<ExitDiagnostics>,
}

const SEGMENTS: [(SegmentField, SegmentRegister); 6] = [
    (SegmentField::Cs, SegmentRegister::Cs),
    (SegmentField::Ss, SegmentRegister::Ss),
    (SegmentField::Ds, SegmentRegister::Ds),
    (SegmentField::Es, SegmentRegister::Es),
    (SegmentField::Fs, SegmentRegister::Fs),
    (SegmentField::Gs, SegmentRegister::Gs),
];

impl SvmCore {
    /// Create a core of the virtual machine whose memory is `mem_map`.
    pub fn new(config: CoreConfig, mem_map: Arc<RwLock<ShadowMap>>) -> Self {
        Self {
            state: GuestCpuState::new(config.paging),
            intr: InterruptInjectionState::default(),
            io_map: PortMap::new(),
            msr_map: MsrMap::new(config.msr_layout),
            vmcb: Box::new(Vmcb::new()),
            mem_map,
            config,
            last_fatal: None,
        }
    }

    /// The control block.
    pub fn vmcb(&self) -> &Vmcb {
        &self.vmcb
    }

    /// The control block, for the world switch.
    pub fn vmcb_mut(&mut self) -> &mut Vmcb {
        &mut self.vmcb
    }

    /// Configuration of the core.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Guest memory of the virtual machine.
    pub fn mem_map(&self) -> &Arc<RwLock<ShadowMap>> {
        &self.mem_map
    }

    /// Diagnostics of the last fatal exit.
    pub fn last_fatal(&self) -> Option<&ExitDiagnostics> {
        self.last_fatal.as_ref()
    }

    /// Pull the control block into the mirror.
    pub fn sync_in(&mut self) {
        let (vmcb, state) = (&self.vmcb, &mut self.state);
        state.rip = vmcb.read(Field::Rip);
        state.gprs.rsp = vmcb.read(Field::Rsp) as usize;
        state.gprs.rax = vmcb.read(Field::Rax) as usize;
        state.cpl = vmcb.read(Field::Cpl) as u8;
        state.ctrl_regs.cr0 = vmcb.read(Field::Cr0);
        state.ctrl_regs.cr2 = vmcb.read(Field::Cr2);
        state.ctrl_regs.cr3 = vmcb.read(Field::Cr3);
        state.ctrl_regs.cr4 = vmcb.read(Field::Cr4);
        state.ctrl_regs.cr8 = vmcb.vintr().tpr() as u64;
        state.ctrl_regs.efer = vmcb.read(Field::Efer);
        state.dbg_regs.dr6 = vmcb.read(Field::Dr6);
        state.dbg_regs.dr7 = vmcb.read(Field::Dr7);
        state.rflags = vmcb.read(Field::Rflags);
        for (field, seg) in SEGMENTS {
            *state.segments.get_mut(seg) = vmcb.segment(field);
        }
        state.segments.gdtr = vmcb.segment(SegmentField::Gdtr);
        state.segments.idtr = vmcb.segment(SegmentField::Idtr);
        state.segments.ldtr = vmcb.segment(SegmentField::Ldtr);
        state.segments.tr = vmcb.segment(SegmentField::Tr);
        state.update_modes();
    }

    /// Push the mirror back into the control block.
    pub fn sync_out(&mut self) {
        let (vmcb, state) = (&mut self.vmcb, &self.state);
        vmcb.write(Field::Rip, state.rip);
        vmcb.write(Field::Rsp, state.gprs.rsp as u64);
        vmcb.write(Field::Rax, state.gprs.rax as u64);
        vmcb.write(Field::Cpl, state.cpl as u64);
        vmcb.write(Field::Cr0, state.ctrl_regs.cr0);
        vmcb.write(Field::Cr2, state.ctrl_regs.cr2);
        vmcb.write(Field::Cr3, state.ctrl_regs.cr3);
        vmcb.write(Field::Cr4, state.ctrl_regs.cr4);
        let mut vintr = vmcb.vintr();
        vintr.set_tpr((state.ctrl_regs.cr8 & 0xff) as u8);
        vmcb.set_vintr(vintr);
        vmcb.write(Field::Efer, state.ctrl_regs.efer);
        vmcb.write(Field::Dr6, state.dbg_regs.dr6);
        vmcb.write(Field::Dr7, state.dbg_regs.dr7);
        vmcb.write(Field::Rflags, state.rflags);
        for (field, seg) in SEGMENTS {
            vmcb.set_segment(field, state.segments.get(seg));
        }
        vmcb.set_segment(SegmentField::Gdtr, &state.segments.gdtr);
        vmcb.set_segment(SegmentField::Idtr, &state.segments.idtr);
        vmcb.set_segment(SegmentField::Ldtr, &state.segments.ldtr);
        vmcb.set_segment(SegmentField::Tr, &state.segments.tr);
    }

    /// Handle the exit left in the control block.
    ///
    /// Returns `Ok(())` when the guest may resume. An error is fatal for the
    /// core; its diagnostics are available through [`SvmCore::last_fatal`].
    pub fn handle_exit<H: HostMemory + ?Sized, S: CoreServices>(
        &mut self,
        host: &H,
        services: &mut S,
    ) -> Result<(), VmError> {
        self.sync_in();
        // The hardware consumed the event programmed for the last entry.
        self.vmcb.write(Field::EventInj, 0);

        let exit_int_info = self.vmcb.read(Field::ExitIntInfo);
        if let Some(vector) = self
            .intr
            .ack(self.vmcb.vintr().irq(), EventInjection::is_valid(exit_int_info))
        {
            trace_event!(
                self.config,
                TraceFlags::INTERRUPTS,
                "interrupt {:#x} taken",
                vector
            );
            services.injecting(InterruptKind::External, vector);
        }

        let exit_code = self.vmcb.read(Field::ExitCode);
        let info1 = self.vmcb.read(Field::ExitInfo1);
        let info2 = self.vmcb.read(Field::ExitInfo2);
        let reason = ExitReason::from_code(exit_code);
        trace_event!(
            self.config,
            TraceFlags::EXITS,
            "{} info1={:#x} info2={:#x} rip={:#x}",
            reason,
            info1,
            info2,
            self.state.rip
        );

        let result = match self.route(reason, info1, info2, host, services) {
            Err(e) if e.is_guest_fault() => {
                self.inject_guest_page_fault(&e, false);
                Ok(())
            }
            r => r,
        };
        if let Err(e) = result {
            let diag = self.diagnose(host, reason, exit_code, info1, info2, &e);
            log::error!("{}", diag);
            self.vmcb.dump();
            self.last_fatal = Some(diag);
            return Err(e);
        }

        self.update_injection(services);
        self.sync_out();
        Ok(())
    }

    fn route<H: HostMemory + ?Sized, S: CoreServices>(
        &mut self,
        reason: ExitReason,
        info1: u64,
        info2: u64,
        host: &H,
        services: &mut S,
    ) -> Result<(), VmError> {
        match reason {
            ExitReason::Code(ExitCode::Ioio) => self.handle_io(host, info1, info2),
            ExitReason::Code(ExitCode::Msr) => self.handle_msr(info1),
            ExitReason::CrRead(cr @ (0 | 3 | 4)) => {
                let insn = self.decode(host)?;
                ctrl_regs::handle_cr_read(&mut self.state, cr, &insn, &self.config)
            }
            ExitReason::CrWrite(cr @ (0 | 3 | 4)) => {
                let insn = self.decode(host)?;
                match ctrl_regs::handle_cr_write(&mut self.state, cr, &insn, &self.config)? {
                    CrEffect::ShadowRootChanged => services.activate_shadow_pt(&mut self.state),
                    CrEffect::None => Ok(()),
                }
            }
            ExitReason::Exception(PF_VECTOR) => match self.config.paging {
                PagingStrategy::Shadow => self.handle_page_fault(host, services, info1, info2),
                PagingStrategy::Nested => Err(VmError::UnhandledExit(reason)),
            },
            ExitReason::Code(ExitCode::Npf) => {
                self.handle_nested_page_fault(host, services, info1, info2)
            }
            ExitReason::Code(ExitCode::Invlpg)
                if self.config.paging == PagingStrategy::Shadow =>
            {
                let insn = self.decode(host)?;
                trace_event!(
                    self.config,
                    TraceFlags::SHADOW_PAGING,
                    "invlpg {:#x}",
                    info1
                );
                services.invalidate_shadow_page(&mut self.state, Gva::new(info1 as usize))?;
                self.state.rip = self.state.rip.wrapping_add(insn.len() as u64);
                Ok(())
            }
            // The host takes the interrupt once the exit returns.
            ExitReason::Code(ExitCode::Intr) => Ok(()),
            ExitReason::Code(ExitCode::Smi) => {
                trace_event!(self.config, TraceFlags::EXITS, "SMI acknowledged");
                Ok(())
            }
            ExitReason::Code(ExitCode::Hlt) => {
                trace_event!(self.config, TraceFlags::HALT, "hlt at {:#x}", self.state.rip);
                services.halt(&mut self.state)?;
                self.state.rip = self.state.rip.wrapping_add(1);
                Ok(())
            }
            ExitReason::Code(ExitCode::Pause) => {
                services.pause(&mut self.state)?;
                self.state.rip = self.state.rip.wrapping_add(2);
                Ok(())
            }
            ExitReason::Code(ExitCode::Wbinvd) => {
                trace_event!(self.config, TraceFlags::HALT, "wbinvd at {:#x}", self.state.rip);
                services.wbinvd(&mut self.state)?;
                self.state.rip = self.state.rip.wrapping_add(2);
                Ok(())
            }
            ExitReason::Code(ExitCode::Vmmcall) => {
                services.hypercall(&mut self.state)?;
                self.state.rip = self.state.rip.wrapping_add(3);
                Ok(())
            }
            reason => Err(VmError::UnhandledExit(reason)),
        }
    }

    fn decode<H: HostMemory + ?Sized>(&self, host: &H) -> Result<iced_x86::Instruction, VmError> {
        let map = self.mem_map.read();
        let t = Translator::new(host, &map);
        decode::get_instruction(&t, &self.state).map(|(insn, _)| insn)
    }

    // Whether `gpa` is hooked memory.
    fn is_hooked(&self, gpa: Gpa) -> bool {
        self.mem_map.read().addr_kind(gpa) == HostRegionKind::Hooked
    }

    fn dispatch_hooked<H: HostMemory + ?Sized>(
        &mut self,
        host: &H,
        gpa: Gpa,
        error_code: PageFaultErrorCode,
    ) -> Result<(), VmError> {
        let insn = self.decode(host)?;
        let map = self.mem_map.clone();
        let mut map = map.write();
        mem_hook_dispatch(&mut self.state, &mut map, gpa, error_code, &insn, &self.config)
    }

    fn handle_page_fault<H: HostMemory + ?Sized, S: CoreServices>(
        &mut self,
        host: &H,
        services: &mut S,
        info1: u64,
        info2: u64,
    ) -> Result<(), VmError> {
        let error_code = PageFaultErrorCode::from_bits_truncate(info1);
        let fault = Gva::new(info2 as usize);
        trace_event!(
            self.config,
            TraceFlags::SHADOW_PAGING,
            "page fault at {} ({:?})",
            fault,
            error_code
        );
        let gpa = {
            let map = self.mem_map.read();
            let t = Translator::new(host, &map);
            t.gva_to_gpa(&self.state, fault)
        };
        match gpa {
            Ok(gpa) if self.is_hooked(gpa) => self.dispatch_hooked(host, gpa, error_code),
            Ok(_) => services.reconcile_shadow_pagetable(&mut self.state, fault, error_code),
            // The guest's own tables don't map the address: reflect the fault.
            Err(e) if e.is_guest_fault() => {
                self.state.ctrl_regs.cr2 = info2;
                self.intr.raise_page_fault(info1 as u32);
                trace_event!(
                    self.config,
                    TraceFlags::INTERRUPTS,
                    "reflecting page fault at {:#x}",
                    info2
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn handle_nested_page_fault<H: HostMemory + ?Sized, S: CoreServices>(
        &mut self,
        host: &H,
        services: &mut S,
        info1: u64,
        info2: u64,
    ) -> Result<(), VmError> {
        let error_code = PageFaultErrorCode::from_bits_truncate(info1);
        let gpa = Gpa::new(info2 as usize);
        if self.is_hooked(gpa) {
            self.dispatch_hooked(host, gpa, error_code)
        } else {
            services.handle_nested_pagefault(&mut self.state, gpa, error_code)
        }
    }

    /// Queue a #PF for a guest translation failure.
    fn inject_guest_page_fault(&mut self, e: &VmError, write: bool) {
        if let VmError::InvalidAddress { addr, .. } = e {
            let mut error_code = PageFaultErrorCode::empty();
            error_code.set(PageFaultErrorCode::WRITE, write);
            error_code.set(PageFaultErrorCode::USER, self.state.cpl == 3);
            self.state.ctrl_regs.cr2 = *addr as u64;
            self.intr.raise_page_fault(error_code.bits() as u32);
            trace_event!(
                self.config,
                TraceFlags::INTERRUPTS,
                "page fault at {:#x} ({:?})",
                addr,
                error_code
            );
        }
    }

    fn program_virq(&mut self, vector: u8) {
        let mut vintr: VIntr = self.vmcb.vintr();
        vintr.set_irq(true);
        vintr.set_vector(vector);
        vintr.set_ign_tpr(true);
        vintr.set_intr_prio(0xf);
        self.vmcb.set_vintr(vintr);
    }

    fn program_event(&mut self, kind: EventType, vector: u8, error_code: Option<u32>) {
        self.vmcb.write(
            Field::EventInj,
            EventInjection::new(kind, vector, error_code).encode(),
        );
    }

    fn update_injection<S: CoreServices>(&mut self, services: &mut S) {
        if let Some((vector, error_code)) = self.intr.take_exception() {
            trace_event!(
                self.config,
                TraceFlags::INTERRUPTS,
                "injecting exception {} ({:?})",
                vector,
                error_code
            );
            self.program_event(EventType::Exception, vector, error_code);
            return;
        }
        match self.intr.irq {
            IrqState::Started => {
                let vector = self.intr.irq_vector;
                trace_event!(
                    self.config,
                    TraceFlags::INTERRUPTS,
                    "re-injecting interrupt {:#x}",
                    vector
                );
                self.program_virq(vector);
            }
            // Still waiting in V_IRQ.
            IrqState::Pending => (),
            IrqState::Idle => match services.pending_interrupt() {
                Some(p) if p.kind == InterruptKind::External => {
                    trace_event!(
                        self.config,
                        TraceFlags::INTERRUPTS,
                        "injecting interrupt {:#x}",
                        p.vector
                    );
                    self.program_virq(p.vector);
                    self.intr.set_irq_pending(p.vector);
                }
                Some(p) => {
                    trace_event!(
                        self.config,
                        TraceFlags::INTERRUPTS,
                        "injecting {:?} {:#x}",
                        p.kind,
                        p.vector
                    );
                    self.program_event(p.kind.event_type(), p.vector, p.error_code);
                    services.injecting(p.kind, p.vector);
                }
                None => (),
            },
        }
    }

    fn diagnose<H: HostMemory + ?Sized>(
        &self,
        host: &H,
        reason: ExitReason,
        exit_code: u64,
        exit_info1: u64,
        exit_info2: u64,
        error: &VmError,
    ) -> ExitDiagnostics {
        let map = self.mem_map.read();
        let t = Translator::new(host, &map);
        let rip_linear = linear_address(&self.state, SegmentRegister::Cs, self.state.rip);
        let window = self.config.dump_window;
        let read = |at: Gva| {
            let mut buf = vec![0u8; window];
            let n = t.read_guest_va(&self.state, at, &mut buf);
            buf.truncate(n);
            buf
        };
        ExitDiagnostics {
            reason,
            exit_code,
            exit_info1,
            exit_info2,
            rip: self.state.rip,
            rip_linear,
            rip_host: t.gva_to_hva(&self.state, rip_linear).ok(),
            before: read(rip_linear - window),
            after: read(rip_linear),
            error: alloc::format!("{error}"),
        }
    }
}
