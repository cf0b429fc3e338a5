//! Per-core configuration and the trace sink.
//!
//! Exit tracing is switched per category at runtime through
//! [`TraceFlags`]; enabled categories are emitted through the `log` facade
//! at debug level under the `vtrap::<category>` target.
use bitflags::bitflags;

bitflags! {
    /// Categories of exit tracing.
    pub struct TraceFlags: u32 {
        /// Every exit code and the resulting injection.
        const EXITS = 1 << 0;
        /// Port I/O emulation.
        const IO = 1 << 1;
        /// MSR emulation.
        const MSR = 1 << 2;
        /// Control register emulation.
        const CTRL_REGS = 1 << 3;
        /// Shadow paging faults and invalidations.
        const SHADOW_PAGING = 1 << 4;
        /// Interrupt and exception injection.
        const INTERRUPTS = 1 << 5;
        /// Halt, pause and wbinvd.
        const HALT = 1 << 6;
        /// Memory hook emulation.
        const EMULATOR = 1 << 7;
    }
}

impl TraceFlags {
    /// Log target for a single category.
    pub fn target(self) -> &'static str {
        match self {
            f if f == TraceFlags::EXITS => "vtrap::exits",
            f if f == TraceFlags::IO => "vtrap::io",
            f if f == TraceFlags::MSR => "vtrap::msr",
            f if f == TraceFlags::CTRL_REGS => "vtrap::ctrl_regs",
            f if f == TraceFlags::SHADOW_PAGING => "vtrap::shadow_paging",
            f if f == TraceFlags::INTERRUPTS => "vtrap::interrupts",
            f if f == TraceFlags::HALT => "vtrap::halt",
            f if f == TraceFlags::EMULATOR => "vtrap::emulator",
            _ => "vtrap",
        }
    }
}

/// Emit a debug record if the category is enabled on `$cfg`.
macro_rules! trace_event {
    ($cfg: expr, $flag: expr, $($arg: tt)+) => {
        if $cfg.trace.contains($flag) {
            log::debug!(target: $flag.target(), $($arg)+);
        }
    };
}
pub(crate) use trace_event;

/// How guest memory is virtualized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingStrategy {
    /// The monitor maintains shadow page tables derived from the guest's.
    Shadow,
    /// Hardware nested paging.
    Nested,
}

/// Layout of the MSR interception bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrLayout {
    /// AMD SVM permission map: 2 pages, 2 bits per MSR.
    Svm,
    /// Intel VMX MSR bitmaps: 1 page, separate read and write halves.
    Vmx,
}

/// Configuration of a virtual core.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    /// Paging strategy of the core.
    pub paging: PagingStrategy,
    /// Layout of the MSR bitmap.
    pub msr_layout: MsrLayout,
    /// Enabled trace categories.
    pub trace: TraceFlags,
    /// Bytes dumped on each side of RIP when an exit is fatal.
    pub dump_window: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            paging: PagingStrategy::Shadow,
            msr_layout: MsrLayout::Svm,
            trace: TraceFlags::empty(),
            dump_window: 16,
        }
    }
}

impl CoreConfig {
    /// Use the paging strategy.
    pub fn with_paging(mut self, paging: PagingStrategy) -> Self {
        self.paging = paging;
        self
    }

    /// Use the MSR bitmap layout.
    pub fn with_msr_layout(mut self, layout: MsrLayout) -> Self {
        self.msr_layout = layout;
        self
    }

    /// Enable trace categories.
    pub fn with_trace(mut self, trace: TraceFlags) -> Self {
        self.trace |= trace;
        self
    }

    /// Size of the instruction window of the fatal-exit dump.
    pub fn with_dump_window(mut self, bytes: usize) -> Self {
        self.dump_window = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let cfg = CoreConfig::default()
            .with_paging(PagingStrategy::Nested)
            .with_trace(TraceFlags::IO)
            .with_trace(TraceFlags::MSR);
        assert_eq!(cfg.paging, PagingStrategy::Nested);
        assert!(cfg.trace.contains(TraceFlags::IO | TraceFlags::MSR));
        assert!(!cfg.trace.contains(TraceFlags::EXITS));
        assert_eq!(TraceFlags::IO.target(), "vtrap::io");
        assert_eq!((TraceFlags::IO | TraceFlags::MSR).target(), "vtrap");
    }
}
