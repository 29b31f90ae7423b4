/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Number of buddy orders tracked by an allocator (orders `0..MAX_ORDER`)
pub const MAX_ORDER: usize = 11;

/// Bytes of bookkeeping kept per allocated page handle
pub const HANDLE_SIZE: usize = size_of::<usize>();

/// Pages covered by one leaf page table (512 entries of 8 bytes)
pub const PTRS_PER_TABLE: usize = 512;

/// Bytes of timing output produced per high-order attempt
pub const TIMING_LINE_BYTES: usize = 14;

/// Bytes of fragmentation output produced per high-order attempt and node
pub const BUDDYINFO_BLOCK_BYTES: usize = 800 + 10 * MAX_ORDER;
