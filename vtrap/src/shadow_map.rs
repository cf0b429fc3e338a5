//! Shadow memory map.
//!
//! The shadow map describes the guest physical address space: every region
//! tells how a range of guest physical memory is resolved on the host side.
//! Regions are kept in a sorted vector and never overlap, so a lookup is a
//! linear scan that stops as soon as it passes the address.
//!
//! Hooked regions don't resolve to host memory at all. Their `host_base` is
//! the handle of a [`MemoryHook`] that emulates every access.
use crate::{
    addressing::{Gpa, Hpa},
    VmError,
};
use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};

/// What the guest sees in a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestRegionKind {
    /// Ordinary RAM.
    PhysicalMemory,
    /// Nothing is there.
    Nothing,
    /// A memory mapped device.
    MemoryMappedDevice,
}

/// How the host resolves a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRegionKind {
    /// Backed by host physical memory at `host_base`.
    PhysicalMemory,
    /// Emulated by a memory hook.
    Hooked,
    /// Passed through to a host device.
    MemoryMappedDevice,
    /// Not allocated yet.
    Unallocated,
    /// Backed by memory of another machine.
    Remote,
    /// Swapped out.
    Swapped,
    /// No mapping.
    Invalid,
}

impl GuestRegionKind {
    fn name(self) -> &'static str {
        match self {
            GuestRegionKind::PhysicalMemory => "GUEST_REGION_PHYSICAL_MEMORY",
            GuestRegionKind::Nothing => "GUEST_REGION_NOTHING",
            GuestRegionKind::MemoryMappedDevice => "GUEST_REGION_MEMORY_MAPPED_DEVICE",
        }
    }
}

impl HostRegionKind {
    fn name(self) -> &'static str {
        match self {
            HostRegionKind::PhysicalMemory => "HOST_REGION_PHYSICAL_MEMORY",
            HostRegionKind::Hooked => "HOST_REGION_HOOK",
            HostRegionKind::MemoryMappedDevice => "HOST_REGION_MEMORY_MAPPED_DEVICE",
            HostRegionKind::Unallocated => "HOST_REGION_UNALLOCATED",
            HostRegionKind::Remote => "HOST_REGION_REMOTE",
            HostRegionKind::Swapped => "HOST_REGION_SWAPPED",
            HostRegionKind::Invalid => "HOST_REGION_INVALID",
        }
    }

    /// Whether `host_base` is an address for this kind.
    fn has_host_addr(self) -> bool {
        matches!(
            self,
            HostRegionKind::PhysicalMemory
                | HostRegionKind::Unallocated
                | HostRegionKind::MemoryMappedDevice
        )
    }
}

/// Handler of accesses to hooked guest memory.
pub trait MemoryHook
where
    Self: Send + Sync,
{
    /// Emulate a read of `dst.len()` bytes at `gpa`.
    ///
    /// Returns the number of bytes produced.
    fn read(&mut self, gpa: Gpa, dst: &mut [u8]) -> Result<usize, VmError>;
    /// Emulate a write of `src` at `gpa`.
    ///
    /// Returns the number of bytes consumed.
    fn write(&mut self, gpa: Gpa, src: &[u8]) -> Result<usize, VmError>;
}

/// A contiguous range of guest physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowRegion {
    /// First guest physical address of the region.
    pub guest_start: Gpa,
    /// One past the last guest physical address of the region.
    pub guest_end: Gpa,
    /// What the guest sees.
    pub guest_kind: GuestRegionKind,
    /// How the host resolves it.
    pub host_kind: HostRegionKind,
    /// Host physical base, or the hook handle of a hooked region.
    pub host_base: usize,
}

impl ShadowRegion {
    /// Create a new region.
    pub fn new(
        guest_start: Gpa,
        guest_end: Gpa,
        guest_kind: GuestRegionKind,
        host_kind: HostRegionKind,
        host_base: usize,
    ) -> Self {
        Self {
            guest_start,
            guest_end,
            guest_kind,
            host_kind,
            host_base,
        }
    }

    /// Guest RAM backed by host physical memory at `host`.
    pub fn passthrough(guest_start: Gpa, guest_end: Gpa, host: Hpa) -> Self {
        Self::new(
            guest_start,
            guest_end,
            GuestRegionKind::PhysicalMemory,
            HostRegionKind::PhysicalMemory,
            host.into_usize(),
        )
    }

    /// Whether `addr` is inside the region.
    #[inline]
    pub fn contains(&self, addr: Gpa) -> bool {
        self.guest_start <= addr && addr < self.guest_end
    }

    /// Whether the region intersects `[start, end)`.
    #[inline]
    pub fn overlaps(&self, start: Gpa, end: Gpa) -> bool {
        self.guest_start < end && start < self.guest_end
    }

    /// Size of the region in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.guest_end - self.guest_start
    }
}

struct HookSlot {
    // The range of the region that refers to this hook.
    start: Gpa,
    end: Gpa,
    hook: Box<dyn MemoryHook>,
}

/// The guest physical memory layout of a virtual machine.
#[derive(Default)]
pub struct ShadowMap {
    regions: Vec<ShadowRegion>,
    hooks: BTreeMap<usize, HookSlot>,
    next_hook: usize,
}

impl ShadowMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the map has no region.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Iterate the regions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &ShadowRegion> {
        self.regions.iter()
    }

    /// Insert a region, keeping the map sorted.
    ///
    /// Fails with [`VmError::Overlap`] if the region intersects an existing
    /// one or is empty; the map is unchanged in that case.
    pub fn insert(&mut self, region: ShadowRegion) -> Result<(), VmError> {
        let overlap = VmError::Overlap {
            start: region.guest_start,
            end: region.guest_end,
        };
        if region.guest_start >= region.guest_end {
            return Err(overlap);
        }
        log::debug!(
            "Adding Shadow Region: ({:#x}-{:#x})",
            region.guest_start,
            region.guest_end
        );
        // First region that starts at or after the end of the new one.
        let pos = self
            .regions
            .iter()
            .position(|r| r.guest_start >= region.guest_end)
            .unwrap_or(self.regions.len());
        match pos.checked_sub(1).map(|i| &self.regions[i]) {
            Some(prev) if prev.guest_end > region.guest_start => Err(overlap),
            _ => {
                self.regions.insert(pos, region);
                Ok(())
            }
        }
    }

    /// Map `[start, end)` of guest memory onto host memory at `host`.
    pub fn add_passthrough(&mut self, start: Gpa, end: Gpa, host: Hpa) -> Result<(), VmError> {
        self.insert(ShadowRegion::passthrough(start, end, host))
    }

    /// Hook `[start, end)` of guest memory.
    ///
    /// Accesses to the range fault into the monitor and are emulated by
    /// `hook`.
    pub fn hook_guest_mem(
        &mut self,
        start: Gpa,
        end: Gpa,
        hook: impl MemoryHook + 'static,
    ) -> Result<(), VmError> {
        let handle = self.next_hook;
        self.insert(ShadowRegion::new(
            start,
            end,
            GuestRegionKind::PhysicalMemory,
            HostRegionKind::Hooked,
            handle,
        ))?;
        self.next_hook += 1;
        self.hooks.insert(
            handle,
            HookSlot {
                start,
                end,
                hook: Box::new(hook),
            },
        );
        Ok(())
    }

    /// Remove the regions of `[start, end)`.
    ///
    /// Region removal is not supported; this always fails.
    pub fn delete(&mut self, _start: Gpa, _end: Gpa) -> Result<(), VmError> {
        Err(VmError::NotImplemented("shadow region deletion"))
    }

    /// Find the region containing `addr`.
    pub fn lookup(&self, addr: Gpa) -> Option<&ShadowRegion> {
        for region in self.regions.iter() {
            if region.contains(addr) {
                return Some(region);
            } else if region.guest_start > addr {
                return None;
            }
        }
        None
    }

    /// The `index`-th region in ascending order.
    pub fn region_by_index(&self, index: usize) -> Option<&ShadowRegion> {
        self.regions.get(index)
    }

    /// Host kind of the region containing `addr`, or
    /// [`HostRegionKind::Invalid`] if there is none.
    pub fn addr_kind(&self, addr: Gpa) -> HostRegionKind {
        self.lookup(addr)
            .map(|r| r.host_kind)
            .unwrap_or(HostRegionKind::Invalid)
    }

    /// Resolve `addr` to the host.
    ///
    /// Only physical memory regions yield a host address; every other kind
    /// must be special-cased by the caller.
    pub fn translate(&self, addr: Gpa) -> (HostRegionKind, Option<Hpa>) {
        match self.lookup(addr) {
            None => (HostRegionKind::Invalid, None),
            Some(r) if r.host_kind == HostRegionKind::PhysicalMemory => (
                r.host_kind,
                Some(Hpa::new(r.host_base + (addr - r.guest_start))),
            ),
            Some(r) => (r.host_kind, None),
        }
    }

    /// The memory hook covering `addr`.
    pub fn mem_hook(&mut self, addr: Gpa) -> Option<&mut (dyn MemoryHook + 'static)> {
        let handle = match self.lookup(addr) {
            Some(r) if r.host_kind == HostRegionKind::Hooked => r.host_base,
            _ => return None,
        };
        self.hooks.get_mut(&handle).map(|slot| {
            debug_assert!(slot.start <= addr && addr < slot.end);
            slot.hook.as_mut()
        })
    }

    /// Log the layout at debug level.
    pub fn dump(&self) {
        log::debug!("{}", self);
    }
}

impl core::fmt::Display for ShadowMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "Memory Layout (regions: {})", self.regions.len())?;
        for (i, r) in self.regions.iter().enumerate() {
            write!(
                f,
                "{}:  {:#x} - {:#x} ({}) -> ",
                i,
                r.guest_start,
                r.guest_end - 1,
                r.guest_kind.name()
            )?;
            if r.host_kind.has_host_addr() {
                write!(f, "{:#x}", r.host_base)?;
            }
            writeln!(f, "({})", r.host_kind.name())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl MemoryHook for Nop {
        fn read(&mut self, _gpa: Gpa, dst: &mut [u8]) -> Result<usize, VmError> {
            dst.fill(0xff);
            Ok(dst.len())
        }
        fn write(&mut self, _gpa: Gpa, src: &[u8]) -> Result<usize, VmError> {
            Ok(src.len())
        }
    }

    fn gpa(v: usize) -> Gpa {
        Gpa::new(v)
    }

    #[test]
    fn lookup_and_overlap() {
        let mut map = ShadowMap::new();
        map.add_passthrough(gpa(0), gpa(0x1000), Hpa::new(0x9000))
            .unwrap();
        map.hook_guest_mem(gpa(0x2000), gpa(0x3000), Nop).unwrap();

        assert_eq!(map.lookup(gpa(0x500)).unwrap().guest_start, gpa(0));
        assert!(map.lookup(gpa(0x1500)).is_none());
        let hooked = map.lookup(gpa(0x2500)).unwrap();
        assert_eq!(hooked.host_kind, HostRegionKind::Hooked);
        assert!(matches!(
            map.insert(ShadowRegion::passthrough(gpa(0x800), gpa(0x900), Hpa::new(0))),
            Err(VmError::Overlap { .. })
        ));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn overlap_leaves_map_unchanged() {
        let mut map = ShadowMap::new();
        map.add_passthrough(gpa(0x4000), gpa(0x8000), Hpa::new(0x10000))
            .unwrap();
        for (s, e) in [
            (0x3000, 0x4001),
            (0x7fff, 0x9000),
            (0x5000, 0x6000),
            (0x0, 0x10000),
            (0x4000, 0x8000),
            (0x5000, 0x5000),
        ] {
            assert!(map
                .insert(ShadowRegion::passthrough(gpa(s), gpa(e), Hpa::new(0)))
                .is_err());
        }
        assert_eq!(map.len(), 1);
        // Touching ranges are fine.
        map.add_passthrough(gpa(0x3000), gpa(0x4000), Hpa::new(0))
            .unwrap();
        map.add_passthrough(gpa(0x8000), gpa(0x9000), Hpa::new(0))
            .unwrap();
        let starts = map.iter().map(|r| r.guest_start).collect::<Vec<_>>();
        assert_eq!(starts, [gpa(0x3000), gpa(0x4000), gpa(0x8000)]);
    }

    #[test]
    fn regions_stay_sorted_and_disjoint() {
        let mut map = ShadowMap::new();
        // Pseudo-random insertions; some collide.
        let mut x = 0x1234_5678usize;
        for _ in 0..200 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let start = (x % 0x100) * 0x1000;
            let len = ((x >> 8) % 4 + 1) * 0x1000;
            let _ = map.add_passthrough(gpa(start), gpa(start + len), Hpa::new(start));
        }
        let regions = map.iter().copied().collect::<Vec<_>>();
        for w in regions.windows(2) {
            assert!(w[0].guest_end <= w[1].guest_start);
        }
        for addr in (0..0x110000).step_by(0x800) {
            let found = map.lookup(gpa(addr));
            let expected = regions.iter().find(|r| r.contains(gpa(addr)));
            assert_eq!(found, expected);
        }
    }

    #[test]
    fn translate() {
        let mut map = ShadowMap::new();
        map.add_passthrough(gpa(0x1000), gpa(0x3000), Hpa::new(0x40000))
            .unwrap();
        map.hook_guest_mem(gpa(0x3000), gpa(0x4000), Nop).unwrap();
        map.insert(ShadowRegion::new(
            gpa(0x4000),
            gpa(0x5000),
            GuestRegionKind::Nothing,
            HostRegionKind::Unallocated,
            0x7000,
        ))
        .unwrap();

        let mut last = None;
        for a in 0x1000..0x3000 {
            let (kind, hpa) = map.translate(gpa(a));
            assert_eq!(kind, HostRegionKind::PhysicalMemory);
            let hpa = hpa.unwrap();
            assert_eq!(hpa, Hpa::new(0x40000 + (a - 0x1000)));
            if let Some(prev) = last {
                assert!(hpa > prev);
            }
            last = Some(hpa);
        }
        assert_eq!(map.translate(gpa(0x3800)), (HostRegionKind::Hooked, None));
        assert_eq!(
            map.translate(gpa(0x4800)),
            (HostRegionKind::Unallocated, None)
        );
        assert_eq!(map.translate(gpa(0x800)), (HostRegionKind::Invalid, None));
        assert_eq!(map.addr_kind(gpa(0x9000)), HostRegionKind::Invalid);
    }

    #[test]
    fn hooks_and_delete() {
        let mut map = ShadowMap::new();
        map.hook_guest_mem(gpa(0xfee0_0000), gpa(0xfee0_1000), Nop)
            .unwrap();
        let mut buf = [0u8; 4];
        let hook = map.mem_hook(gpa(0xfee0_0020)).unwrap();
        assert_eq!(hook.read(gpa(0xfee0_0020), &mut buf).unwrap(), 4);
        assert_eq!(buf, [0xff; 4]);
        assert!(map.mem_hook(gpa(0xfee0_1000)).is_none());
        assert!(matches!(
            map.delete(gpa(0xfee0_0000), gpa(0xfee0_1000)),
            Err(VmError::NotImplemented(_))
        ));
        assert_eq!(map.len(), 1);
        assert_eq!(map.region_by_index(0).unwrap().size(), 0x1000);
        assert!(map.region_by_index(1).is_none());
    }

    #[test]
    fn layout_dump() {
        let mut map = ShadowMap::new();
        map.add_passthrough(gpa(0), gpa(0x1000), Hpa::new(0x9000))
            .unwrap();
        map.hook_guest_mem(gpa(0x2000), gpa(0x3000), Nop).unwrap();
        let dump = format!("{}", map);
        assert_eq!(
            dump,
            "Memory Layout (regions: 2)\n\
             0:  0x0 - 0xfff (GUEST_REGION_PHYSICAL_MEMORY) -> 0x9000(HOST_REGION_PHYSICAL_MEMORY)\n\
             1:  0x2000 - 0x2fff (GUEST_REGION_PHYSICAL_MEMORY) -> (HOST_REGION_HOOK)\n"
        );
    }
}
