//! Subsystem configuration.
//!
//! All tunables live in one explicit [`Config`] value handed to
//! [`Kernel::new`](crate::kernel::Kernel::new). There are no global
//! singletons; tests build small configurations to force eviction with a
//! handful of frames.

use crate::addressing::PAGE_SIZE;

/// Tunables for the virtual-memory subsystem.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of frames the frame table may claim from the machine.
    /// The arena grows lazily up to this bound.
    pub frame_limit: usize,
    /// Number of page-sized slots in the pagefile.
    pub pagefile_pages: usize,
    /// Top of the user stack, exclusive. Page aligned.
    pub stack_top: usize,
    /// Initial size of the stack region, in bytes.
    pub stack_size: usize,
    /// Base of the user heap. Page aligned.
    pub heap_base: usize,
    /// Where `mmap(NULL, ..)` placement starts. The cursor advances past
    /// each mapping and never moves back.
    pub mmap_base: usize,
    /// Open-file slots per process.
    pub max_open_files: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            frame_limit: 256,
            pagefile_pages: 1024,
            stack_top: 0x7000_0000_0000,
            stack_size: 16 * PAGE_SIZE,
            heap_base: 0x5000_0000_0000,
            mmap_base: 0x6000_0000_0000,
            max_open_files: 16,
        }
    }
}
