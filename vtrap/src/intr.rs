//! Interrupt and exception injection state.
//!
//! External interrupts go through the virtual interrupt (V_IRQ) mechanism:
//! the core marks the IRQ pending, the hardware clears V_IRQ once the guest
//! takes it, and the event is done once EXITINTINFO no longer reports it in
//! flight. Exceptions and other events are injected through EVENTINJ on the
//! next entry.
use crate::vmcb::EventType;

/// Kind of an event the interrupt controller wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// External interrupt.
    External,
    /// Non-maskable interrupt.
    Nmi,
    /// Exception.
    Exception,
    /// Software interrupt.
    SoftwareIntr,
    /// Virtual interrupt.
    VirtualIntr,
}

impl InterruptKind {
    /// EVENTINJ type of the kind.
    pub fn event_type(self) -> EventType {
        match self {
            InterruptKind::External => EventType::ExternalIntr,
            InterruptKind::Nmi => EventType::Nmi,
            InterruptKind::Exception => EventType::Exception,
            InterruptKind::SoftwareIntr => EventType::SoftwareIntr,
            InterruptKind::VirtualIntr => EventType::VirtualIntr,
        }
    }
}

/// An event waiting for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingInterrupt {
    /// Kind of the event.
    pub kind: InterruptKind,
    /// Vector.
    pub vector: u8,
    /// Error code, for exceptions that push one.
    pub error_code: Option<u32>,
}

/// The virtual interrupt controller of a core.
pub trait InterruptController {
    /// The highest priority event waiting for delivery, if any.
    fn pending_interrupt(&mut self) -> Option<PendingInterrupt>;
    /// The event is being delivered to the guest.
    fn injecting(&mut self, kind: InterruptKind, vector: u8);
}

/// Progress of the external interrupt in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqState {
    /// No external interrupt in flight.
    #[default]
    Idle,
    /// Programmed into V_IRQ, not taken by the guest yet.
    Pending,
    /// Taken by the guest, delivery not complete.
    Started,
}

/// Injection bookkeeping of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptInjectionState {
    /// External interrupt progress.
    pub irq: IrqState,
    /// Vector of the external interrupt in flight.
    pub irq_vector: u8,
    /// An exception waits for injection.
    pub exception_pending: bool,
    /// Vector of the pending exception.
    pub exception_vector: u8,
    /// Error code of the pending exception.
    pub exception_error_code: Option<u32>,
}

impl InterruptInjectionState {
    /// Queue an exception for the next entry.
    ///
    /// Returns false, leaving the state unchanged, if an exception is
    /// already pending.
    pub fn raise_exception(&mut self, vector: u8, error_code: Option<u32>) -> bool {
        if self.exception_pending {
            log::warn!(
                "exception {} raised while {} is pending",
                vector,
                self.exception_vector
            );
            return false;
        }
        self.exception_pending = true;
        self.exception_vector = vector;
        self.exception_error_code = error_code;
        true
    }

    /// Queue a page fault. The caller sets CR2.
    pub fn raise_page_fault(&mut self, error_code: u32) -> bool {
        self.raise_exception(crate::exit::PF_VECTOR, Some(error_code))
    }

    /// Take the pending exception.
    pub fn take_exception(&mut self) -> Option<(u8, Option<u32>)> {
        if self.exception_pending {
            self.exception_pending = false;
            Some((self.exception_vector, self.exception_error_code.take()))
        } else {
            None
        }
    }

    /// Mark `vector` as programmed into V_IRQ.
    pub fn set_irq_pending(&mut self, vector: u8) {
        self.irq = IrqState::Pending;
        self.irq_vector = vector;
    }

    /// Advance the external interrupt after an exit.
    ///
    /// `v_irq` is the V_IRQ bit and `exitintinfo_valid` the valid bit of
    /// EXITINTINFO as the hardware left them. Returns the vector if the
    /// guest has just taken the interrupt.
    pub fn ack(&mut self, v_irq: bool, exitintinfo_valid: bool) -> Option<u8> {
        let mut taken = None;
        if self.irq == IrqState::Pending && !v_irq {
            self.irq = IrqState::Started;
            taken = Some(self.irq_vector);
        }
        if self.irq == IrqState::Started && !exitintinfo_valid {
            self.irq = IrqState::Idle;
        }
        taken
    }
}
