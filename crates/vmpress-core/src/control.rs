//! Control input.
//!
//! A test is started by one line of text, `"<test> <p1> [p2]"`. The test
//! name selects a [`TestKind`]; the numeric parameters are sanitised the way
//! an interactive control channel expects: a pass count below 1 becomes 1
//! and a negative page count becomes 0 (automatic), each with a warning.

use log::warn;
use serde::Serialize;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;

use crate::allocator::{AllocMode, PageAllocator, ZoneSnapshot};
use crate::error::TestError;
use crate::executor::{Harness, PressureSummary};
use crate::fault::FaultSummary;
use crate::highorder::{HighOrderChannels, HighOrderSummary};
use crate::mapping::AddressSpace;
use crate::params::PressureTier;
use crate::zones::zone_report;

/// The tests that can be started from the control input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TestKind {
    /// Allocate-until-floor / free-all passes
    Alloc(PressureTier),
    /// Reference a mapping and fault it back in each pass
    Fault(PressureTier),
    /// Attempt high-order allocations
    HighOrder,
    /// Print zone statistics
    Zones,
}

impl TestKind {
    /// Every test, in help order.
    pub fn all() -> Vec<TestKind> {
        PressureTier::ALL
            .into_iter()
            .map(TestKind::Alloc)
            .chain(PressureTier::ALL.into_iter().map(TestKind::Fault))
            .chain([TestKind::HighOrder, TestKind::Zones])
            .collect()
    }

    /// Parses a test name such as `alloc_min` or `highalloc`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "highalloc" => Some(TestKind::HighOrder),
            "zones" => Some(TestKind::Zones),
            _ => {
                let (family, tier) = name.split_once('_')?;
                let tier = PressureTier::from_name(tier)?;
                match family {
                    "alloc" => Some(TestKind::Alloc(tier)),
                    "fault" => Some(TestKind::Fault(tier)),
                    _ => None,
                }
            }
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestKind::Alloc(tier) => write!(f, "alloc_{}", tier),
            TestKind::Fault(tier) => write!(f, "fault_{}", tier),
            TestKind::HighOrder => f.write_str("highalloc"),
            TestKind::Zones => f.write_str("zones"),
        }
    }
}

/// Errors in a control line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    /// The line held no test name
    #[error("Empty command")]
    Empty,
    /// The test name is not known
    #[error("Test {0} does not exist")]
    UnknownTest(String),
    /// A required parameter is missing
    #[error("{test} needs a {name} parameter")]
    MissingParameter {
        /// Test the line was for
        test: TestKind,
        /// Name of the missing parameter
        name: &'static str,
    },
    /// A parameter is not an integer
    #[error("Invalid number {value:?}: {source}")]
    InvalidNumber {
        /// The offending token
        value: String,
        /// Parse failure
        #[source]
        source: ParseIntError,
    },
    /// A parameter that must not be negative is
    #[error("{name} must not be negative, got {value}")]
    Negative {
        /// Name of the parameter
        name: &'static str,
        /// The value given
        value: i64,
    },
    /// More parameters than the test takes
    #[error("{0} takes at most two parameters")]
    TooManyParameters(String),
}

/// One parsed and sanitised control line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// `alloc_<tier> passes [pages]`
    Alloc {
        /// Pressure tier
        tier: PressureTier,
        /// Passes, at least 1
        passes: u64,
        /// Pages per pass, 0 = automatic
        pages: u64,
    },
    /// `fault_<tier> passes [pages]`
    Fault {
        /// Pressure tier
        tier: PressureTier,
        /// Passes, at least 1
        passes: u64,
        /// Pages to map, 0 = automatic
        pages: u64,
    },
    /// `highalloc order count`
    HighOrder {
        /// Block order
        order: usize,
        /// Number of attempts
        count: u64,
    },
    /// `zones`
    Zones,
    /// `help [test]`
    Help(Option<TestKind>),
}

fn number(token: &str) -> Result<i64, ControlError> {
    token.parse().map_err(|source| ControlError::InvalidNumber {
        value: token.to_string(),
        source,
    })
}

fn sanitize_pass_count(passes: i64) -> u64 {
    if passes < 1 {
        warn!("Cannot make 0 or negative number of passes, running 1");
        return 1;
    }
    passes as u64
}

fn sanitize_page_count(pages: i64) -> u64 {
    if pages < 0 {
        warn!("Negative page count {}, sizing automatically", pages);
        return 0;
    }
    pages as u64
}

impl FromStr for Command {
    type Err = ControlError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next().ok_or(ControlError::Empty)?;
        let params: Vec<&str> = tokens.collect();
        if params.len() > 2 {
            return Err(ControlError::TooManyParameters(name.to_string()));
        }

        if name == "help" {
            return match params.first() {
                None => Ok(Command::Help(None)),
                Some(test) => TestKind::from_name(test)
                    .map(|kind| Command::Help(Some(kind)))
                    .ok_or_else(|| ControlError::UnknownTest(test.to_string())),
            };
        }

        let kind =
            TestKind::from_name(name).ok_or_else(|| ControlError::UnknownTest(name.to_string()))?;
        let first = params
            .first()
            .map(|t| number(t))
            .transpose()?;
        let second = params.get(1).map(|t| number(t)).transpose()?;
        let missing = |name| ControlError::MissingParameter { test: kind, name };

        Ok(match kind {
            TestKind::Alloc(tier) | TestKind::Fault(tier) => {
                let passes = sanitize_pass_count(first.ok_or_else(|| missing("passes"))?);
                let pages = sanitize_page_count(second.unwrap_or(0));
                if matches!(kind, TestKind::Alloc(_)) {
                    Command::Alloc {
                        tier,
                        passes,
                        pages,
                    }
                } else {
                    Command::Fault {
                        tier,
                        passes,
                        pages,
                    }
                }
            }
            TestKind::HighOrder => {
                let order = first.ok_or_else(|| missing("order"))?;
                let count = second.ok_or_else(|| missing("count"))?;
                if order < 0 {
                    return Err(ControlError::Negative {
                        name: "order",
                        value: order,
                    });
                }
                if count < 0 {
                    return Err(ControlError::Negative {
                        name: "count",
                        value: count,
                    });
                }
                Command::HighOrder {
                    order: order as usize,
                    count: count as u64,
                }
            }
            TestKind::Zones => Command::Zones,
        })
    }
}

/// Usage instructions of a test.
///
/// The ZERO tier tests carry a warning; with a blocking allocation mode the
/// warning says the machine may need a reboot.
pub fn help_text(kind: TestKind, mode: AllocMode) -> String {
    let mut text = format!("{}\n\n", kind);
    match kind {
        TestKind::Alloc(tier) => {
            text += &format!("To run test, send\n\n    {} passes [pages]\n\n", kind);
            text += "Where passes is how many times to allocate a block of pages\n";
            text += "and pages is an optional parameter of how many pages to allocate.\n";
            text += "When the test completes, the report holds the results.\n\n";
            text += &mode_note(mode);
            if tier == PressureTier::Zero {
                text += &zero_warning(mode);
            }
        }
        TestKind::Fault(tier) => {
            text += &format!("To run test, send\n\n    {} passes [pages]\n\n", kind);
            text += "Where passes is how many times to reference all the pages within\n";
            text += "a mapped area in memory and pages is an optional parameter of how many\n";
            text += "pages to map. When the test completes, the report holds the results.\n\n";
            if tier == PressureTier::Zero {
                text += &zero_warning(mode);
            }
        }
        TestKind::HighOrder => {
            text += &format!("To run test, send\n\n    {} order count\n\n", kind);
            text += "Where order is the log2 of the block size in pages and count is how\n";
            text += "many blocks to try to allocate. Timings and free block counts for\n";
            text += "every attempt are written to the timings and buddyinfo channels.\n\n";
        }
        TestKind::Zones => {
            text += "Prints page counts and watermarks of every zone.\n\n";
        }
    }
    text
}

fn mode_note(mode: AllocMode) -> String {
    match mode {
        AllocMode::Atomic => {
            "This test allocates in atomic mode. To let allocations block,\nrun it in blocking mode.\n\n"
                .to_string()
        }
        AllocMode::Blocking => "This test allocates in blocking mode.\n\n".to_string(),
    }
}

fn zero_warning(mode: AllocMode) -> String {
    let mut text = String::from(
        "This test will deliberately force an OOM situation and put the allocator\n\
         under a LOT of pressure. Only run this if you are sure it is what you\n\
         want to do\n\n",
    );
    if mode.can_block() {
        text += "Blocking allocations are in use so this test is exceptionally dangerous. \
                 If it gets aborted, you'll HAVE to reboot\n\
                 Only run this test if you are really sure it is what you want\n\n";
    }
    text
}

/// What a command produced.
#[derive(Debug, Serialize)]
pub enum Outcome {
    /// Result of an alloc test
    Alloc(PressureSummary),
    /// Result of a fault test
    Fault(FaultSummary),
    /// Result of a high-order run
    HighOrder(HighOrderSummary),
    /// Zone snapshots
    Zones(Vec<ZoneSnapshot>),
    /// Usage text
    Help(String),
}

impl<A: PageAllocator> Harness<A> {
    /// Runs one command.
    ///
    /// Everything but the high-order run writes to `channels.report`.
    ///
    /// # Errors
    ///
    /// Propagates the [`TestError`] of the test that ran.
    pub fn execute<S: AddressSpace + ?Sized>(
        &mut self,
        command: Command,
        space: &S,
        channels: HighOrderChannels<'_>,
    ) -> Result<Outcome, TestError> {
        match command {
            Command::Alloc {
                tier,
                passes,
                pages,
            } => self
                .run_alloc(tier, passes, pages, channels.report)
                .map(Outcome::Alloc),
            Command::Fault {
                tier,
                passes,
                pages,
            } => self
                .run_fault(space, tier, passes, pages, channels.report)
                .map(Outcome::Fault),
            Command::HighOrder { order, count } => {
                self.run_highorder(order, count, channels).map(Outcome::HighOrder)
            }
            Command::Zones => Ok(Outcome::Zones(zone_report(
                &self.allocator,
                channels.report,
            )?)),
            Command::Help(kind) => {
                let kinds = kind.map_or_else(TestKind::all, |k| vec![k]);
                let text: String = kinds
                    .into_iter()
                    .map(|k| help_text(k, self.config.mode))
                    .collect();
                let out = channels.report;
                out.open();
                report!(*out, "{}", text);
                out.close();
                Ok(Outcome::Help(text))
            }
        }
    }
}
