//! Host input and timer events forwarded to device models.
//!
//! Each event kind keeps its own list of handlers. The most recently
//! registered handler sees an event first, and delivery stops at the first
//! handler that fails.
use crate::VmError;
use alloc::{boxed::Box, collections::VecDeque};

/// A key press or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyboardEvent {
    /// Controller status byte.
    pub status: u8,
    /// Scan code.
    pub scan_code: u8,
}

/// A mouse packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseEvent {
    /// Raw packet bytes.
    pub data: [u8; 3],
}

/// A host timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    /// Elapsed time since the last tick, in microseconds.
    pub period_us: u32,
}

/// Trait that represent handlers for host events of type `E`.
pub trait EventHandler<E>
where
    Self: Send + Sync,
{
    /// Handle `event`.
    fn handle(&mut self, event: &E) -> Result<(), VmError>;
}

impl<E, F> EventHandler<E> for F
where
    F: FnMut(&E) -> Result<(), VmError> + Send + Sync,
{
    fn handle(&mut self, event: &E) -> Result<(), VmError> {
        self(event)
    }
}

type Handlers<E> = VecDeque<Box<dyn EventHandler<E>>>;

fn deliver<E>(handlers: &mut Handlers<E>, event: &E) -> Result<(), VmError> {
    handlers.iter_mut().try_for_each(|h| h.handle(event))
}

/// Handler lists of a virtual machine.
#[derive(Default)]
pub struct HostEvents {
    keyboard: Handlers<KeyboardEvent>,
    mouse: Handlers<MouseEvent>,
    timer: Handlers<TimerEvent>,
}

impl HostEvents {
    /// Create empty handler lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a keyboard handler.
    pub fn hook_keyboard(&mut self, handler: impl EventHandler<KeyboardEvent> + 'static) {
        self.keyboard.push_front(Box::new(handler));
    }

    /// Register a mouse handler.
    pub fn hook_mouse(&mut self, handler: impl EventHandler<MouseEvent> + 'static) {
        self.mouse.push_front(Box::new(handler));
    }

    /// Register a timer handler.
    pub fn hook_timer(&mut self, handler: impl EventHandler<TimerEvent> + 'static) {
        self.timer.push_front(Box::new(handler));
    }

    /// Deliver a keyboard event.
    pub fn deliver_keyboard(&mut self, event: &KeyboardEvent) -> Result<(), VmError> {
        deliver(&mut self.keyboard, event)
    }

    /// Deliver a mouse event.
    pub fn deliver_mouse(&mut self, event: &MouseEvent) -> Result<(), VmError> {
        deliver(&mut self.mouse, event)
    }

    /// Deliver a timer tick.
    pub fn deliver_timer(&mut self, event: &TimerEvent) -> Result<(), VmError> {
        deliver(&mut self.timer, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn newest_first() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut events = HostEvents::new();
        for id in 0..3 {
            let seen = seen.clone();
            events.hook_keyboard(move |ev: &KeyboardEvent| -> Result<(), VmError> {
                seen.lock().unwrap().push((id, ev.scan_code));
                Ok(())
            });
        }
        events
            .deliver_keyboard(&KeyboardEvent {
                status: 0,
                scan_code: 0x1e,
            })
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(2, 0x1e), (1, 0x1e), (0, 0x1e)]);
        // Other kinds have their own lists.
        events.deliver_mouse(&MouseEvent { data: [0; 3] }).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn stops_at_failure() {
        let ticks = Arc::new(Mutex::new(0u32));
        let mut events = HostEvents::new();
        let t = ticks.clone();
        events.hook_timer(move |ev: &TimerEvent| -> Result<(), VmError> {
            *t.lock().unwrap() += ev.period_us;
            Ok(())
        });
        events.hook_timer(|_: &TimerEvent| -> Result<(), VmError> {
            Err(VmError::NotImplemented("timer"))
        });
        assert!(matches!(
            events.deliver_timer(&TimerEvent { period_us: 10 }),
            Err(VmError::NotImplemented("timer"))
        ));
        assert_eq!(*ticks.lock().unwrap(), 0);
    }
}
