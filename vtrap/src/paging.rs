//! Guest page table formats and walker.
//!
//! The three x86 formats share one algorithm: start at the table named by
//! CR3, index it with a slice of the virtual address, and either stop at a
//! not-present entry, stop at a large page, or descend. They differ only in
//! the entry width, the number of levels and the index slices, which is all
//! that [`PagingMode`] describes.
use crate::addressing::Gpa;
use bitflags::bitflags;

bitflags! {
    /// Flags shared by all entry formats.
    pub struct PageTableFlags: u64 {
        /// Present.
        const P = 1 << 0;
        /// Writable.
        const RW = 1 << 1;
        /// User accessible.
        const US = 1 << 2;
        /// Page level write through.
        const PWT = 1 << 3;
        /// Page level cache disable.
        const PCD = 1 << 4;
        /// Accessed.
        const A = 1 << 5;
        /// Dirty.
        const D = 1 << 6;
        /// Large page (in directory entries).
        const PS = 1 << 7;
        /// Global.
        const G = 1 << 8;
        /// Execute disable.
        const XD = 1 << 63;
    }
}

/// A raw page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// Flags of the entry.
    #[inline]
    pub fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// Whether the entry is present.
    #[inline]
    pub fn present(&self) -> bool {
        self.flags().contains(PageTableFlags::P)
    }

    /// Whether the entry is writable.
    #[inline]
    pub fn writable(&self) -> bool {
        self.flags().contains(PageTableFlags::RW)
    }

    /// Whether the entry maps a large page.
    #[inline]
    pub fn large(&self) -> bool {
        self.flags().contains(PageTableFlags::PS)
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageTableEntry(0x{:x}, {:?})", self.0, self.flags())
    }
}

/// Paging format of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// 32-bit two level paging with 4 MiB large pages.
    Legacy32,
    /// 32-bit PAE paging with 2 MiB large pages.
    Pae,
    /// 4 level long mode paging with 1 GiB and 2 MiB large pages.
    Long,
}

struct Level {
    shift: u32,
    index_mask: usize,
    // Size of the page mapped by a large entry at this level.
    large_page: Option<usize>,
}

const LEGACY32_LEVELS: [Level; 2] = [
    Level {
        shift: 22,
        index_mask: 0x3ff,
        large_page: Some(0x40_0000),
    },
    Level {
        shift: 12,
        index_mask: 0x3ff,
        large_page: None,
    },
];

const PAE_LEVELS: [Level; 3] = [
    Level {
        shift: 30,
        index_mask: 0x3,
        large_page: None,
    },
    Level {
        shift: 21,
        index_mask: 0x1ff,
        large_page: Some(0x20_0000),
    },
    Level {
        shift: 12,
        index_mask: 0x1ff,
        large_page: None,
    },
];

const LONG_LEVELS: [Level; 4] = [
    Level {
        shift: 39,
        index_mask: 0x1ff,
        large_page: None,
    },
    Level {
        shift: 30,
        index_mask: 0x1ff,
        large_page: Some(0x4000_0000),
    },
    Level {
        shift: 21,
        index_mask: 0x1ff,
        large_page: Some(0x20_0000),
    },
    Level {
        shift: 12,
        index_mask: 0x1ff,
        large_page: None,
    },
];

impl PagingMode {
    fn levels(self) -> &'static [Level] {
        match self {
            PagingMode::Legacy32 => &LEGACY32_LEVELS,
            PagingMode::Pae => &PAE_LEVELS,
            PagingMode::Long => &LONG_LEVELS,
        }
    }

    /// Size of an entry in bytes.
    #[inline]
    pub fn entry_size(self) -> usize {
        match self {
            PagingMode::Legacy32 => 4,
            PagingMode::Pae | PagingMode::Long => 8,
        }
    }

    /// Number of table levels.
    #[inline]
    pub fn depth(self) -> usize {
        self.levels().len()
    }

    /// Guest physical address of the top level table.
    pub fn root(self, cr3: u64) -> Gpa {
        Gpa::new(match self {
            PagingMode::Legacy32 => (cr3 & 0xffff_f000) as usize,
            PagingMode::Pae => (cr3 & 0xffff_ffe0) as usize,
            PagingMode::Long => (cr3 & 0x000f_ffff_ffff_f000) as usize,
        })
    }

    fn address_mask(self) -> u64 {
        match self {
            PagingMode::Legacy32 => 0xffff_f000,
            PagingMode::Pae | PagingMode::Long => 0x000f_ffff_ffff_f000,
        }
    }

    fn canonical_va(self, va: usize) -> usize {
        match self {
            PagingMode::Legacy32 | PagingMode::Pae => va & 0xffff_ffff,
            PagingMode::Long => va,
        }
    }
}

/// Result of a page walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// The address is mapped to this guest physical address.
    Mapped(Gpa),
    /// The entry at `level` (0 is the top level) is not present.
    NotPresent {
        /// Level of the missing entry.
        level: usize,
    },
}

/// Walk the guest page tables rooted at `cr3` for `va`.
///
/// `read_entry` loads the raw entry at a guest physical address; its errors
/// abort the walk.
pub fn walk<E>(
    mode: PagingMode,
    cr3: u64,
    va: usize,
    mut read_entry: impl FnMut(Gpa, PagingMode) -> Result<PageTableEntry, E>,
) -> Result<Walk, E> {
    let va = mode.canonical_va(va);
    let mut table = mode.root(cr3);
    for (depth, level) in mode.levels().iter().enumerate() {
        let index = (va >> level.shift) & level.index_mask;
        let entry = read_entry(table + index * mode.entry_size(), mode)?;
        if !entry.present() {
            return Ok(Walk::NotPresent { level: depth });
        }
        let last = depth + 1 == mode.depth();
        match level.large_page {
            Some(size) if entry.large() => {
                let base = match mode {
                    // 4 MiB pages keep bits 31:22 only.
                    PagingMode::Legacy32 => entry.0 & 0xffc0_0000,
                    _ => entry.0 & mode.address_mask() & !(size as u64 - 1),
                };
                return Ok(Walk::Mapped(Gpa::new(base as usize + (va & (size - 1)))));
            }
            _ => {
                let base = (entry.0 & mode.address_mask()) as usize;
                if last {
                    return Ok(Walk::Mapped(Gpa::new(base + (va & 0xfff))));
                }
                table = Gpa::new(base);
            }
        }
    }
    unreachable!()
}
