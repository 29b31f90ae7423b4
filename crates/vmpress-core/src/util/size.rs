use crate::util::{PAGE_SHIFT, PAGE_SIZE};

/// Memory size representation supporting common units.
///
/// All units use binary (base-2) multipliers (1 KB = 1024 bytes). Pressure
/// tests think in pages, so [`Size::Pages`] is a first-class unit.
///
/// # Examples
///
/// ```
/// use vmpress_core::util::Size;
///
/// let size = Size::MB(4);
/// assert_eq!(size.bytes(), 4 * 1024 * 1024);
/// assert_eq!(size.pages(), 1024);
///
/// let mapping = Size::Pages(16);
/// assert_eq!(mapping.bytes(), 16 * 4096);
/// ```
#[derive(Clone, Copy, Debug)]
pub enum Size {
    /// Size in bytes
    B(usize),
    /// Size in kilobytes (1 KB = 1024 bytes)
    KB(usize),
    /// Size in megabytes (1 MB = 1024 KB)
    MB(usize),
    /// Size in base pages of [`PAGE_SIZE`] bytes
    Pages(usize),
}

impl Size {
    /// Converts this size to bytes.
    pub const fn bytes(&self) -> usize {
        match self {
            Size::B(bytes) => *bytes,
            Size::KB(kb) => *kb * (1 << 10),
            Size::MB(mb) => *mb * (1 << 20),
            Size::Pages(pages) => *pages * PAGE_SIZE,
        }
    }

    /// Number of whole pages covered by this size.
    pub const fn pages(&self) -> usize {
        self.bytes() >> PAGE_SHIFT
    }

    /// Size of one allocation unit of the given buddy order.
    pub const fn order(order: usize) -> Self {
        Size::Pages(1 << order)
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Size::B(bytes) => write!(f, "{} B", bytes),
            Size::KB(kb) => write!(f, "{} KB", kb),
            Size::MB(mb) => write!(f, "{} MB", mb),
            Size::Pages(pages) => write!(f, "{} ({} pages)", self.bytes(), pages),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::util::Size;

    #[test]
    fn size_conversions() {
        assert_eq!(Size::B(12).bytes(), 12);
        assert_eq!(Size::MB(12).bytes(), 12 * (1 << 20));
        assert_eq!(Size::Pages(3).bytes(), 3 * 4096);
        assert_eq!(Size::order(3).pages(), 8);
    }

    #[test]
    fn pages_display_carries_both_units() {
        assert_eq!(Size::Pages(2).to_string(), "8192 (2 pages)");
    }
}
