//! Trap-and-translate core of a virtual machine monitor.
//!
//! This crate owns the two things every exit handler needs: the mapping
//! from guest-physical memory to host memory ([`shadow_map`]) and the
//! dispatch of hardware exits back into emulation ([`svm`]).
//!
//! ## Layout
//! The components are layered, leaves first:
//!
//! 1. [`shadow_map`]: ordered, non-overlapping interval map from guest
//!    physical ranges to host resolution strategies.
//! 2. [`translate`]: composable GPA/GVA/HPA/HVA conversions built on the
//!    shadow map, the host memory manager ([`host::HostMemory`]) and the guest
//!    page table walker in [`paging`].
//! 3. [`guest_mem`]: page-boundary-safe bulk copies in and out of the guest.
//! 4. [`io_map`] and [`msr_map`]: interception bitmaps with exact-key hooks.
//! 5. [`svm`]: the per-exit state machine that synchronizes the [`vmcb`]
//!    with the [`state::GuestCpuState`] mirror, routes the exit and decides
//!    what to inject before the guest resumes.
//! 6. [`mem_hook`]: emulation of guest accesses that fault on hooked memory.
//!
//! Every operation is a bounded computation that returns synchronously.
//! Failures are reported as [`VmError`]; [`VmError::is_fatal`] tells the
//! caller whether the virtual core must be stopped.
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod addressing;
pub mod config;
pub mod ctrl_regs;
pub mod decode;
pub mod exit;
pub mod guest_mem;
pub mod host;
pub mod host_events;
pub mod intr;
pub mod io_map;
pub mod mem_hook;
pub mod msr_map;
pub mod paging;
pub mod queue;
pub mod shadow_map;
pub mod state;
pub mod svm;
pub mod translate;
pub mod vmcb;

use addressing::Gpa;
use alloc::boxed::Box;
use exit::ExitReason;
use translate::TranslationStage;

/// The key of a port or MSR hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookTarget {
    /// I/O port.
    Port(u16),
    /// Model specific register.
    Msr(u32),
    /// Hooked guest physical memory.
    Memory(Gpa),
}

impl core::fmt::Display for HookTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HookTarget::Port(port) => write!(f, "port 0x{port:x}"),
            HookTarget::Msr(msr) => write!(f, "msr 0x{msr:x}"),
            HookTarget::Memory(gpa) => write!(f, "memory {gpa}"),
        }
    }
}

/// Possible errors of the monitor core.
#[derive(Debug)]
pub enum VmError {
    /// The region intersects a region already in the shadow map.
    Overlap {
        /// Start of the rejected range.
        start: Gpa,
        /// End of the rejected range.
        end: Gpa,
    },
    /// No shadow region covers the address.
    NotFound(Gpa),
    /// The operation is declared but has no implementation.
    NotImplemented(&'static str),
    /// A translation stage could not resolve the address.
    InvalidAddress {
        /// The first stage that failed.
        stage: TranslationStage,
        /// The address handed to that stage.
        addr: usize,
    },
    /// An exit was taken for a port or MSR without a hook.
    NoHook(HookTarget),
    /// The MSR does not belong to any band of the MSR bitmap.
    OutOfRange(u32),
    /// The exit reason has no handler.
    UnhandledExit(ExitReason),
    /// A bulk copy stopped before all bytes were transferred.
    ShortTransfer {
        /// Requested byte count.
        requested: usize,
        /// Transferred byte count.
        transferred: usize,
    },
    /// A hook returned an error or a size different from the request.
    HookFailed(HookTarget),
    /// The exit information is inconsistent.
    InvalidExitInfo(u64),
    /// The faulting instruction could not be decoded.
    FailedToDecodeInstruction,
    /// The instruction decoded, but it can not be emulated.
    UnsupportedInstruction(iced_x86::Code),
    /// Error from a collaborator.
    ControllerError(Box<dyn core::fmt::Debug + Send + Sync>),
}

impl VmError {
    /// Whether the error must stop the virtual core.
    ///
    /// Overlap, NotImplemented and OutOfRange are left to the caller, and a
    /// guest-induced translation failure is turned into a guest fault.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            VmError::Overlap { .. } | VmError::NotImplemented(_) | VmError::OutOfRange(_)
        ) && !self.is_guest_fault()
    }

    /// Whether the failure comes from the guest's own page tables.
    pub fn is_guest_fault(&self) -> bool {
        matches!(
            self,
            VmError::InvalidAddress {
                stage: TranslationStage::GvaToGpa,
                ..
            }
        )
    }

    /// The translation stage tag, if this is a translation failure.
    pub fn stage(&self) -> Option<TranslationStage> {
        match self {
            VmError::InvalidAddress { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::Overlap { start, end } => {
                write!(f, "region [{start}, {end}) overlaps the shadow map")
            }
            VmError::NotFound(gpa) => write!(f, "no shadow region for {gpa}"),
            VmError::NotImplemented(what) => write!(f, "{what} is not implemented"),
            VmError::InvalidAddress { stage, addr } => {
                write!(f, "In {stage}: invalid lookup of 0x{addr:x}")
            }
            VmError::NoHook(target) => write!(f, "hook not present for {target}"),
            VmError::OutOfRange(msr) => write!(f, "MSR out of range (MSR=0x{msr:x})"),
            VmError::UnhandledExit(reason) => write!(f, "unhandled exit: {reason}"),
            VmError::ShortTransfer {
                requested,
                transferred,
            } => write!(f, "short transfer: {transferred} of {requested} bytes"),
            VmError::HookFailed(target) => write!(f, "hook failure on {target}"),
            VmError::InvalidExitInfo(info) => write!(f, "invalid exit info 0x{info:x}"),
            VmError::FailedToDecodeInstruction => write!(f, "failed to decode instruction"),
            VmError::UnsupportedInstruction(code) => {
                write!(f, "unsupported instruction {code:?}")
            }
            VmError::ControllerError(e) => write!(f, "controller error: {e:?}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil;
