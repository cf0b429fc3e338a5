//! Model-specific register interception map.
//!
//! RDMSR reads the register named by ECX into EDX:EAX, WRMSR writes EDX:EAX
//! to it. A hooked MSR makes the hardware exit on the accesses the hook asked
//! for; the permission bitmap is derived from the hooks.
//!
//! Only three bands of MSR numbers have bits in the SVM permission map:
//!
//! | MSR range                  | first bit index |
//! |----------------------------|-----------------|
//! | `0x0000_0000-0x0000_1fff`  | `0`             |
//! | `0xc000_0000-0xc000_1fff`  | `0x800 * 4`     |
//! | `0xc001_0000-0xc001_1fff`  | `0x1000 * 4`    |
//!
//! Each MSR takes two bits at byte `index / 4`, bit `(index % 4) * 2`: the
//! read bit and the write bit right above it.
use crate::{config::MsrLayout, io_map::Access, HookTarget, VmError};
use alloc::{
    boxed::Box,
    collections::btree_map::{BTreeMap, Entry},
    vec,
    vec::Vec,
};

/// Size of the SVM MSR permission map (2 pages).
pub const SVM_MSRPM_SIZE: usize = 2 * 4096;
/// Size of the VMX MSR bitmaps (1 page).
pub const VMX_MSR_BITMAP_SIZE: usize = 4096;

const BANDS: [(u32, u32); 3] = [(0x0, 0x1fff), (0xc000_0000, 0xc000_1fff), (0xc001_0000, 0xc001_1fff)];

/// Trait that represent handlers for MSR registers.
pub trait MsrHandler
where
    Self: Send + Sync,
{
    /// Handler on rdmsr.
    fn rdmsr(&mut self, index: u32) -> Result<u64, VmError>;
    /// Handler on wrmsr.
    fn wrmsr(&mut self, index: u32, value: u64) -> Result<(), VmError>;
}

/// Location of the read and write bits of an MSR: (byte, bit) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrBits {
    /// Read intercept bit.
    pub read: (usize, u8),
    /// Write intercept bit.
    pub write: (usize, u8),
}

/// Locate the bits of `msr` in a bitmap of `layout`.
pub fn bitmap_bits(layout: MsrLayout, msr: u32) -> Result<MsrBits, VmError> {
    match layout {
        MsrLayout::Svm => {
            let band = BANDS
                .iter()
                .position(|(lo, hi)| (*lo..=*hi).contains(&msr))
                .ok_or(VmError::OutOfRange(msr))?;
            let index = band * 0x800 * 4 + (msr - BANDS[band].0) as usize;
            let (byte, bit) = (index / 4, ((index % 4) * 2) as u8);
            Ok(MsrBits {
                read: (byte, bit),
                write: (byte, bit + 1),
            })
        }
        MsrLayout::Vmx => {
            let (base, off) = match msr {
                0x0..=0x1fff => (0, msr),
                0xc000_0000..=0xc000_1fff => (1024, msr - 0xc000_0000),
                _ => return Err(VmError::OutOfRange(msr)),
            };
            let (byte, bit) = (base + off as usize / 8, (off % 8) as u8);
            Ok(MsrBits {
                read: (byte, bit),
                write: (byte + 2048, bit),
            })
        }
    }
}

struct MsrHook {
    access: Access,
    handler: Box<dyn MsrHandler>,
}

/// Msr map of a virtual core.
pub struct MsrMap {
    layout: MsrLayout,
    bitmap: Vec<u8>,
    hooks: BTreeMap<u32, MsrHook>,
}

impl MsrMap {
    /// Create a map that intercepts nothing.
    pub fn new(layout: MsrLayout) -> Self {
        Self {
            layout,
            bitmap: vec![
                0;
                match layout {
                    MsrLayout::Svm => SVM_MSRPM_SIZE,
                    MsrLayout::Vmx => VMX_MSR_BITMAP_SIZE,
                }
            ],
            hooks: BTreeMap::new(),
        }
    }

    /// Layout of the bitmap.
    pub fn layout(&self) -> MsrLayout {
        self.layout
    }

    /// Insert msr handler to the index.
    ///
    /// Return Ok(false) if msr handler for index is exists.
    /// An MSR outside the bitmap fails with [`VmError::OutOfRange`] and
    /// nothing is registered.
    pub fn register(
        &mut self,
        msr: u32,
        access: Access,
        handler: impl MsrHandler + 'static,
    ) -> Result<bool, VmError> {
        bitmap_bits(self.layout, msr)?;
        match self.hooks.entry(msr) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(MsrHook {
                    access,
                    handler: Box::new(handler),
                });
                self.update_map(
                    msr,
                    access.contains(Access::READ),
                    access.contains(Access::WRITE),
                )?;
                Ok(true)
            }
        }
    }

    /// Remove the handler of `msr`.
    pub fn unhook(&mut self, msr: u32) -> Option<Box<dyn MsrHandler>> {
        let hook = self.hooks.remove(&msr)?;
        // Registered MSRs are always in range.
        let _ = self.update_map(msr, false, false);
        Some(hook.handler)
    }

    // Set the read and write bits of `msr`.
    fn update_map(&mut self, msr: u32, hook_read: bool, hook_write: bool) -> Result<(), VmError> {
        let bits = bitmap_bits(self.layout, msr)?;
        for ((byte, bit), on) in [(bits.read, hook_read), (bits.write, hook_write)] {
            if on {
                self.bitmap[byte] |= 1 << bit;
            } else {
                self.bitmap[byte] &= !(1 << bit);
            }
        }
        Ok(())
    }

    /// Rebuild the whole bitmap from the registered hooks.
    pub fn refresh(&mut self) {
        self.bitmap.fill(0);
        let hooks = self
            .hooks
            .iter()
            .map(|(msr, hook)| (*msr, hook.access))
            .collect::<Vec<_>>();
        for (msr, access) in hooks {
            let _ = self.update_map(
                msr,
                access.contains(Access::READ),
                access.contains(Access::WRITE),
            );
        }
    }

    /// Whether the hardware exits on the access to `msr`.
    pub fn is_intercepted(&self, msr: u32, access: Access) -> bool {
        match bitmap_bits(self.layout, msr) {
            Ok(bits) => {
                let test = |(byte, bit): (usize, u8)| self.bitmap[byte] & (1 << bit) != 0;
                (access.contains(Access::READ) && test(bits.read))
                    || (access.contains(Access::WRITE) && test(bits.write))
            }
            Err(_) => false,
        }
    }

    /// The MSR bitmap.
    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    /// The handler of `msr` for the access kind, or [`VmError::NoHook`].
    pub fn handler(
        &mut self,
        msr: u32,
        access: Access,
    ) -> Result<&mut (dyn MsrHandler + 'static), VmError> {
        match self.hooks.get_mut(&msr) {
            Some(hook) if hook.access.contains(access) => Ok(hook.handler.as_mut()),
            _ => Err(VmError::NoHook(HookTarget::Msr(msr))),
        }
    }
}
