//! Virtual addresses and page geometry.
//!
//! User virtual addresses are wrapped in the [`Va`] newtype so that page
//! rounding and page-table index extraction happen in exactly one place.
//! The address space is paged in 4 KiB units and walked through four
//! translation levels of 9 bits each, leaf level first.

/// Size of a page, in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;
/// Mask selecting the offset-in-page bits.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Number of software page-table levels.
pub const PT_LEVELS: usize = 4;
/// Translation bits consumed per level.
pub const PT_LEVEL_BITS: usize = 9;
/// Entries per page-table node.
pub const PT_FANOUT: usize = 1 << PT_LEVEL_BITS;

/// Highest user address, exclusive. 48 bits of translation.
pub const USER_TOP: usize = 1 << (PAGE_SHIFT + PT_LEVELS * PT_LEVEL_BITS);

/// A user virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Build a [`Va`] from a raw address.
    ///
    /// Returns `None` when the address lies outside the translatable user
    /// range.
    pub fn new(addr: usize) -> Option<Va> {
        if addr < USER_TOP { Some(Va(addr)) } else { None }
    }

    /// Get the raw address.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }

    /// Round down to the containing page boundary.
    #[inline]
    pub fn page_align_down(self) -> Va {
        Va(self.0 & !PAGE_MASK)
    }

    /// Whether this address sits on a page boundary.
    #[inline]
    pub fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Offset within the containing page.
    #[inline]
    pub fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Virtual page number: the address with the offset bits stripped.
    #[inline]
    pub fn vpn(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Rebuild the page-aligned address of a virtual page number.
    #[inline]
    pub fn from_vpn(vpn: usize) -> Va {
        debug_assert!(vpn << PAGE_SHIFT < USER_TOP);
        Va((vpn << PAGE_SHIFT) & (USER_TOP - 1))
    }

    /// Index into the page-table node at `level` (0 is the leaf level).
    #[inline]
    pub fn pt_index(self, level: usize) -> usize {
        debug_assert!(level < PT_LEVELS);
        (self.0 >> (PAGE_SHIFT + level * PT_LEVEL_BITS)) & (PT_FANOUT - 1)
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va({:#x})", self.0)
    }
}

/// Round `len` up to a whole number of pages, in bytes.
#[inline]
pub fn page_round_up(len: usize) -> usize {
    (len + PAGE_MASK) & !PAGE_MASK
}
