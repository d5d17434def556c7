//! Build-time knobs. Everything here is a plain constant so the numbers
//! are greppable in one place.

/// Guest page size. The emulated architecture fixes this at 4 KiB even
/// when the host uses larger pages.
pub const PAGE_SIZE: u64 = 4096;

/// Bytes of host memory reserved for guest RAM plus all page tables.
pub const ARENA_SIZE: usize = 256 * 1024 * 1024;

/// Default size of the main guest stack.
pub const STACK_SIZE: u64 = 8 * 1024 * 1024;

/// Top of the region where the stack is placed in long mode.
pub const STACK_TOP: u64 = 0x7fff_0000_0000;

/// Lowest address `find_unmapped` will hand out for anonymous mappings.
pub const MMAP_BASE: u64 = 0x1000_0000_0000;

/// Depth of the per-thread self-modifying-code queue. Overflow is fatal.
pub const SMC_QUEUE_SIZE: usize = 16;

/// Executions of one address before the path recorder kicks in.
pub const JIT_HOT_THRESHOLD: u32 = 16;

/// Longest straight-line path the recorder will accumulate.
pub const JIT_MAX_PATH: usize = 64;

/// An x86 instruction never exceeds this many bytes.
pub const MAX_INSN_LEN: usize = 15;

/// Guest addresses are canonical within 48 bits.
pub const VIRT_BITS: u32 = 48;
