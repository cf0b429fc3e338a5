//! End-to-end exits through the public interface.
use spin::RwLock;
use std::sync::{Arc, Mutex};
use vtrap::{
    addressing::{Gpa, Gva, Hpa, Hva, PAGE_SIZE},
    config::{CoreConfig, PagingStrategy, TraceFlags},
    exit::{ExitCode, ExitReason, PageFaultErrorCode},
    host::HostMemory,
    intr::{InterruptController, InterruptKind, PendingInterrupt},
    io_map::{Access, PortHandler},
    shadow_map::{HostRegionKind, MemoryHook, ShadowMap},
    state::{Cr0, GuestCpuState, Segment},
    svm::{CoreServices, SvmCore},
    vmcb::{Field, SegmentField},
    HookTarget, VmError,
};

const HOST_PA: usize = 0x1_0000_0000;

/// Guest RAM backed by one heap allocation.
struct Ram {
    ptr: *mut u8,
    len: usize,
}

impl Ram {
    fn new(pages: usize) -> Self {
        let len = pages * PAGE_SIZE;
        let ptr = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        Self { ptr, len }
    }

    fn load(&self, off: usize, data: &[u8]) {
        assert!(off + data.len() <= self.len);
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(off), data.len()) }
    }

    fn dump(&self, off: usize, len: usize) -> Vec<u8> {
        assert!(off + len <= self.len);
        unsafe { std::slice::from_raw_parts(self.ptr.add(off), len).to_vec() }
    }
}

unsafe impl HostMemory for Ram {
    fn vaddr_to_paddr(&self, va: Hva) -> Hpa {
        match va.into_usize().checked_sub(self.ptr as usize) {
            Some(off) if off < self.len => Hpa::new(HOST_PA + off),
            _ => Hpa::ZERO,
        }
    }

    fn paddr_to_vaddr(&self, pa: Hpa) -> Hva {
        match pa.into_usize().checked_sub(HOST_PA) {
            Some(off) if off < self.len => Hva::new(self.ptr as usize + off),
            _ => Hva::ZERO,
        }
    }
}

impl Drop for Ram {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )))
        }
    }
}

#[derive(Default)]
struct NoServices;

impl InterruptController for NoServices {
    fn pending_interrupt(&mut self) -> Option<PendingInterrupt> {
        None
    }
    fn injecting(&mut self, _kind: InterruptKind, _vector: u8) {}
}

impl CoreServices for NoServices {
    fn reconcile_shadow_pagetable(
        &mut self,
        _state: &mut GuestCpuState,
        _fault: Gva,
        _error_code: PageFaultErrorCode,
    ) -> Result<(), VmError> {
        Ok(())
    }
    fn activate_shadow_pt(&mut self, _state: &mut GuestCpuState) -> Result<(), VmError> {
        Ok(())
    }
    fn invalidate_shadow_page(
        &mut self,
        _state: &mut GuestCpuState,
        _gva: Gva,
    ) -> Result<(), VmError> {
        Ok(())
    }
    fn handle_nested_pagefault(
        &mut self,
        _state: &mut GuestCpuState,
        _gpa: Gpa,
        _error_code: PageFaultErrorCode,
    ) -> Result<(), VmError> {
        Ok(())
    }
    fn hypercall(&mut self, _state: &mut GuestCpuState) -> Result<(), VmError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct CountingPort(Arc<Mutex<usize>>);

impl PortHandler for CountingPort {
    fn read(&mut self, _port: u16, dst: &mut [u8]) -> Result<usize, VmError> {
        let mut calls = self.0.lock().unwrap();
        *calls += 1;
        dst.fill(*calls as u8);
        Ok(dst.len())
    }
    fn write(&mut self, _port: u16, src: &[u8]) -> Result<usize, VmError> {
        Ok(src.len())
    }
}

struct Nop;

impl MemoryHook for Nop {
    fn read(&mut self, _gpa: Gpa, dst: &mut [u8]) -> Result<usize, VmError> {
        Ok(dst.len())
    }
    fn write(&mut self, _gpa: Gpa, src: &[u8]) -> Result<usize, VmError> {
        Ok(src.len())
    }
}

fn core_on(ram: &Ram) -> SvmCore {
    let mut map = ShadowMap::new();
    map.add_passthrough(Gpa::ZERO, Gpa::new(ram.len), Hpa::new(HOST_PA))
        .unwrap();
    let config = CoreConfig::default()
        .with_paging(PagingStrategy::Nested)
        .with_trace(TraceFlags::all());
    let mut core = SvmCore::new(config, Arc::new(RwLock::new(map)));
    let vmcb = core.vmcb_mut();
    vmcb.write(Field::Cr0, Cr0::PE.bits());
    vmcb.write(Field::Rflags, 0x2);
    vmcb.write(Field::Rip, 0x1000);
    vmcb.set_segment(
        SegmentField::Cs,
        &Segment {
            attrib: 1 << 10,
            limit: 0xffff_ffff,
            ..Default::default()
        },
    );
    core
}

fn ioio(core: &mut SvmCore, info1: u64, next_rip: u64) {
    let vmcb = core.vmcb_mut();
    vmcb.write(Field::ExitCode, ExitCode::Ioio as u64);
    vmcb.write(Field::ExitInfo1, info1);
    vmcb.write(Field::ExitInfo2, next_rip);
}

#[test]
fn shadow_map_layout() {
    let mut map = ShadowMap::new();
    map.add_passthrough(Gpa::ZERO, Gpa::new(0x1000), Hpa::new(0x9000))
        .unwrap();
    map.hook_guest_mem(Gpa::new(0x2000), Gpa::new(0x3000), Nop)
        .unwrap();
    assert_eq!(map.lookup(Gpa::new(0x500)).unwrap().guest_start, Gpa::ZERO);
    assert!(map.lookup(Gpa::new(0x1500)).is_none());
    assert_eq!(
        map.lookup(Gpa::new(0x2500)).unwrap().host_kind,
        HostRegionKind::Hooked
    );
    assert!(matches!(
        map.add_passthrough(Gpa::new(0x800), Gpa::new(0x900), Hpa::new(0x20000)),
        Err(VmError::Overlap { .. })
    ));
}

#[test]
fn rep_insw_calls_the_hook_per_element() {
    let ram = Ram::new(4);
    let mut core = core_on(&ram);
    let port = CountingPort::default();
    assert!(core.io_map.register(0x1f0, Access::READ, port.clone()));
    core.state.gprs.rdi = 0x2000;
    core.state.gprs.rcx = 4;

    // rep insw: in, string, rep, 16-bit operand, 32-bit addressing.
    ioio(&mut core, 0x1f0 << 16 | 1 | 1 << 2 | 1 << 3 | 1 << 5 | 1 << 8, 0x1002);
    core.handle_exit(&ram, &mut NoServices).unwrap();

    assert_eq!(*port.0.lock().unwrap(), 4);
    assert_eq!(core.state.gprs.rdi, 0x2008);
    assert_eq!(core.state.gprs.rcx, 0);
    assert_eq!(ram.dump(0x2000, 8), vec![1, 1, 2, 2, 3, 3, 4, 4]);
    assert_eq!(core.vmcb().read(Field::Rip), 0x1002);
}

#[test]
fn unhooked_port_is_fatal_without_side_effects() {
    let ram = Ram::new(4);
    let mut core = core_on(&ram);
    core.vmcb_mut().write(Field::Rax, 0xdead_beef);
    core.sync_in();
    core.state.gprs.rcx = 7;
    let before = core.state.gprs;

    // in eax, 0x80
    ioio(&mut core, 0x80 << 16 | 1 | 1 << 6, 0x1001);
    assert!(matches!(
        core.handle_exit(&ram, &mut NoServices),
        Err(VmError::NoHook(HookTarget::Port(0x80)))
    ));
    assert_eq!(core.state.gprs, before);
    assert_eq!(core.state.rip, 0x1000);
    assert_eq!(core.vmcb().read(Field::Rax), 0xdead_beef);
    assert_eq!(core.vmcb().read(Field::Rip), 0x1000);

    let diag = core.last_fatal().unwrap();
    assert_eq!(diag.reason, ExitReason::Code(ExitCode::Ioio));
    assert_eq!(diag.exit_info2, 0x1001);
}

#[test]
fn unhooked_string_io_is_fatal_before_any_transfer() {
    let ram = Ram::new(4);
    let mut core = core_on(&ram);
    // rep outsb
    ram.load(0x1000, &[0xf3, 0x6e]);
    core.state.gprs.rsi = 0x2000;
    core.state.gprs.rcx = 0;

    // rep outsb, zero count.
    ioio(&mut core, 0x80 << 16 | 1 << 2 | 1 << 3 | 1 << 4 | 1 << 8, 0x1002);
    assert!(matches!(
        core.handle_exit(&ram, &mut NoServices),
        Err(VmError::NoHook(HookTarget::Port(0x80)))
    ));
    assert_eq!(core.vmcb().read(Field::Rip), 0x1000);

    // insb to an address past guest memory.
    core.state.gprs.rdi = 0x10_0000;
    ioio(&mut core, 0x80 << 16 | 1 | 1 << 2 | 1 << 4 | 1 << 8, 0x1001);
    assert!(matches!(
        core.handle_exit(&ram, &mut NoServices),
        Err(VmError::NoHook(HookTarget::Port(0x80)))
    ));
    assert_eq!(core.vmcb().read(Field::Rip), 0x1000);
    assert_eq!(core.vmcb().read(Field::EventInj), 0);
    assert_eq!(core.last_fatal().unwrap().exit_info1 >> 16, 0x80);
}

#[test]
fn routing_does_not_depend_on_history() {
    let ram = Ram::new(4);
    let mut core = core_on(&ram);
    core.io_map.register(0x1f0, Access::READ, CountingPort::default());
    for _ in 0..3 {
        core.vmcb_mut().write(Field::Rip, 0x1000);
        core.vmcb_mut().write(Field::ExitCode, ExitCode::Rdtsc as u64);
        assert!(matches!(
            core.handle_exit(&ram, &mut NoServices),
            Err(VmError::UnhandledExit(ExitReason::Code(ExitCode::Rdtsc)))
        ));
        ioio(&mut core, 0x1f0 << 16 | 1 | 1 << 4, 0x1002);
        core.handle_exit(&ram, &mut NoServices).unwrap();
        assert_eq!(core.vmcb().read(Field::Rip), 0x1002);
    }
}
