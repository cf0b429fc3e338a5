//! Port I/O interception map.
//!
//! A port is intercepted iff a handler is registered for exactly that port.
//! The I/O permission bitmap handed to the hardware is derived from the
//! registered handlers on every change, one bit per port.
use crate::{HookTarget, VmError};
use alloc::{
    boxed::Box,
    collections::btree_map::{BTreeMap, Entry},
    vec,
    vec::Vec,
};
use bitflags::bitflags;

/// Size of the I/O permission bitmap (3 pages).
pub const IOPM_SIZE: usize = 3 * 4096;

bitflags! {
    /// Accesses a hook wants to see.
    pub struct Access: u8 {
        /// Reads (IN, INS).
        const READ = 1 << 0;
        /// Writes (OUT, OUTS).
        const WRITE = 1 << 1;
    }
}

/// Trait that represent handlers for port-mapped devices.
pub trait PortHandler
where
    Self: Send + Sync,
{
    /// Emulate an input of `dst.len()` bytes from `port`.
    ///
    /// Returns the number of bytes produced.
    fn read(&mut self, port: u16, dst: &mut [u8]) -> Result<usize, VmError>;
    /// Emulate an output of `src` to `port`.
    ///
    /// Returns the number of bytes consumed.
    fn write(&mut self, port: u16, src: &[u8]) -> Result<usize, VmError>;
}

struct PortHook {
    access: Access,
    handler: Box<dyn PortHandler>,
}

/// Port I/O map of a virtual core.
pub struct PortMap {
    bitmap: Vec<u8>,
    hooks: BTreeMap<u16, PortHook>,
}

impl Default for PortMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PortMap {
    /// Create a map that intercepts nothing.
    pub fn new() -> Self {
        Self {
            bitmap: vec![0; IOPM_SIZE],
            hooks: BTreeMap::new(),
        }
    }

    /// Insert a port handler.
    ///
    /// Return false if a handler for the port exists.
    /// Otherwise, return true.
    pub fn register(
        &mut self,
        port: u16,
        access: Access,
        handler: impl PortHandler + 'static,
    ) -> bool {
        match self.hooks.entry(port) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(PortHook {
                    access,
                    handler: Box::new(handler),
                });
                self.update_map(
                    port,
                    access.contains(Access::READ),
                    access.contains(Access::WRITE),
                );
                true
            }
        }
    }

    /// Remove the handler of `port`.
    pub fn unhook(&mut self, port: u16) -> Option<Box<dyn PortHandler>> {
        let hook = self.hooks.remove(&port)?;
        self.update_map(port, false, false);
        Some(hook.handler)
    }

    // Set the interception bit of `port` from the hook state.
    fn update_map(&mut self, port: u16, hook_read: bool, hook_write: bool) {
        let (byte, bit) = (port as usize / 8, port % 8);
        if hook_read || hook_write {
            self.bitmap[byte] |= 1 << bit;
        } else {
            self.bitmap[byte] &= !(1 << bit);
        }
    }

    /// Whether the hardware exits on `port`.
    pub fn is_intercepted(&self, port: u16) -> bool {
        self.bitmap[port as usize / 8] & (1 << (port % 8)) != 0
    }

    /// The I/O permission bitmap.
    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    /// Whether a handler is registered for `port`.
    pub fn is_hooked(&self, port: u16) -> bool {
        self.hooks.contains_key(&port)
    }

    /// The handler of `port` for the access kind, or [`VmError::NoHook`].
    pub fn handler(
        &mut self,
        port: u16,
        access: Access,
    ) -> Result<&mut (dyn PortHandler + 'static), VmError> {
        match self.hooks.get_mut(&port) {
            Some(hook) if hook.access.contains(access) => Ok(hook.handler.as_mut()),
            _ => Err(VmError::NoHook(HookTarget::Port(port))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Latch(u8);

    impl PortHandler for Latch {
        fn read(&mut self, _port: u16, dst: &mut [u8]) -> Result<usize, VmError> {
            dst.fill(self.0);
            Ok(dst.len())
        }
        fn write(&mut self, _port: u16, src: &[u8]) -> Result<usize, VmError> {
            self.0 = src[0];
            Ok(src.len())
        }
    }

    #[test]
    fn bitmap_follows_hooks() {
        let mut map = PortMap::new();
        assert!(map.register(0x3f8, Access::all(), Latch(0)));
        assert!(!map.register(0x3f8, Access::READ, Latch(0)));
        assert!(map.register(0x60, Access::READ, Latch(0)));
        assert_eq!(map.bitmap()[0x3f8 / 8], 1 << (0x3f8 % 8));
        assert!(map.is_intercepted(0x3f8));
        assert!(map.is_intercepted(0x60));
        assert!(!map.is_intercepted(0x3f9));
        assert!(map.register(0xffff, Access::WRITE, Latch(0)));
        assert_eq!(map.bitmap()[0x1fff], 0x80);

        for port in 0..=u16::MAX {
            assert_eq!(map.is_intercepted(port), map.is_hooked(port));
        }
        assert!(map.unhook(0x3f8).is_some());
        assert!(map.unhook(0x3f8).is_none());
        assert!(!map.is_intercepted(0x3f8));
        assert_eq!(map.bitmap().iter().filter(|b| **b != 0).count(), 2);
        assert!(map.unhook(0x60).is_some());
        for port in 0..=u16::MAX {
            assert_eq!(map.is_intercepted(port), map.is_hooked(port));
        }
    }

    #[test]
    fn handler_lookup() {
        let mut map = PortMap::new();
        map.register(0x70, Access::WRITE, Latch(7));
        assert!(map.handler(0x70, Access::WRITE).is_ok());
        assert!(matches!(
            map.handler(0x70, Access::READ),
            Err(VmError::NoHook(HookTarget::Port(0x70)))
        ));
        assert!(matches!(
            map.handler(0x71, Access::WRITE),
            Err(VmError::NoHook(HookTarget::Port(0x71)))
        ));
    }
}
