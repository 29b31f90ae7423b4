//! Reporting channel.
//!
//! Tests write human-readable, line-oriented results into a
//! [`ReportChannel`]. Each invocation brackets its writes with
//! [`open()`](ReportChannel::open) and [`close()`](ReportChannel::close);
//! when the output volume is known in advance the harness calls
//! [`grow()`](ReportChannel::grow) up front so appends do not stall.

use log::{debug, warn};
use std::fmt::{self, Write};

use crate::util::PAGE_SIZE;

/// Appends formatted text to a [`ReportChannel`].
///
/// ```
/// use vmpress_core::report::{ReportBuffer, ReportChannel};
/// use vmpress_core::report;
///
/// let mut out = ReportBuffer::new("demo");
/// out.open();
/// report!(out, "o Passes: {}\n", 3);
/// out.close();
/// assert_eq!(out.contents(), "o Passes: 3\n");
/// ```
#[macro_export]
macro_rules! report {
    ($chan:expr, $($arg:tt)*) => {
        $crate::report::ReportChannel::append(&mut $chan, format_args!($($arg)*))
    };
}

/// Growable, page-granular output channel.
pub trait ReportChannel {
    /// Starts a fresh report, discarding previous contents.
    fn open(&mut self);

    /// Appends formatted text.
    fn append(&mut self, args: fmt::Arguments<'_>);

    /// Ends the report; the contents stay readable.
    fn close(&mut self);

    /// Grows the backing capacity by `pages` pages.
    fn grow(&mut self, pages: usize);

    /// Current backing capacity in pages.
    fn capacity_pages(&self) -> usize;

    /// Grows the channel so that it can hold at least `bytes` bytes without stalling.
    fn reserve_bytes(&mut self, bytes: usize) {
        let required = bytes.div_ceil(PAGE_SIZE);
        let current = self.capacity_pages();
        if required > current {
            self.grow(required - current);
        }
    }
}

/// In-memory [`ReportChannel`].
///
/// Appends that outrun the reserved capacity still succeed but are counted
/// as stalls, mirroring a buffer that has to be grown mid-run.
#[derive(Debug, Clone)]
pub struct ReportBuffer {
    name: String,
    buf: String,
    capacity_pages: usize,
    open: bool,
    stalls: u64,
}

impl ReportBuffer {
    /// Creates an empty, closed buffer of one page.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buf: String::with_capacity(PAGE_SIZE),
            capacity_pages: 1,
            open: false,
            stalls: 0,
        }
    }

    /// Name of the channel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The text written so far.
    pub fn contents(&self) -> &str {
        &self.buf
    }

    /// Copies the current report out of the channel.
    pub fn snapshot(&self) -> String {
        self.buf.clone()
    }

    /// Whether the channel is between `open` and `close`.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Number of appends that had to grow the buffer.
    pub fn stalls(&self) -> u64 {
        self.stalls
    }
}

impl ReportChannel for ReportBuffer {
    fn open(&mut self) {
        self.buf.clear();
        self.stalls = 0;
        self.open = true;
    }

    fn append(&mut self, args: fmt::Arguments<'_>) {
        if !self.open {
            warn!("{}: write to closed report dropped", self.name);
            return;
        }
        // Writing into a String cannot fail.
        let _ = self.buf.write_fmt(args);
        let needed = self.buf.len().div_ceil(PAGE_SIZE);
        if needed > self.capacity_pages {
            debug!(
                "{}: report outgrew {} pages, growing to {}",
                self.name, self.capacity_pages, needed
            );
            self.capacity_pages = needed;
            self.stalls += 1;
        }
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn grow(&mut self, pages: usize) {
        debug!("{}: growing report by {} pages", self.name, pages);
        self.capacity_pages += pages;
        let target = self.capacity_pages * PAGE_SIZE;
        self.buf.reserve(target.saturating_sub(self.buf.len()));
    }

    fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }
}
