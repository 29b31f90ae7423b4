//! Runs control lines against a harness.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{error, info};
use serde::Serialize;
use vmpress_core::allocator::PageAllocator;
use vmpress_core::mapping::AddressSpace;
use vmpress_core::report::{ReportBuffer, ReportChannel};
use vmpress_core::{Command, Harness, HighOrderChannels, Outcome, TestError, TestRecord};

/// The three output channels of a session.
pub struct Channels {
    report: ReportBuffer,
    timings: ReportBuffer,
    buddyinfo: ReportBuffer,
    dir: Option<PathBuf>,
}

impl Channels {
    /// Creates the channels, optionally mirrored to files in `dir`.
    pub fn new(dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            report: ReportBuffer::new("report"),
            timings: ReportBuffer::new("timings"),
            buddyinfo: ReportBuffer::new("buddyinfo"),
            dir,
        })
    }

    fn borrow(&mut self) -> HighOrderChannels<'_> {
        HighOrderChannels {
            report: &mut self.report,
            timings: &mut self.timings,
            buddyinfo: &mut self.buddyinfo,
        }
    }

    /// Prints the report and writes every channel that has content.
    fn flush(&self) -> Result<()> {
        print!("{}", self.report.contents());
        std::io::stdout().flush()?;
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        for chan in [&self.report, &self.timings, &self.buddyinfo] {
            if chan.contents().is_empty() {
                continue;
            }
            write_channel(&dir.join(chan.name()), chan)?;
        }
        Ok(())
    }
}

fn write_channel(path: &Path, chan: &ReportBuffer) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(chan.snapshot().as_bytes())?;
    writer.flush()?;
    if chan.stalls() > 0 {
        info!("{}: {} appends outran the reserved capacity", chan.name(), chan.stalls());
    }
    Ok(())
}

/// Everything a session produced.
#[derive(Debug, Serialize)]
pub struct SessionLog {
    /// One record per control line, in order
    pub records: Vec<TestRecord<Outcome>>,
}

impl SessionLog {
    /// Number of commands that ended in an error.
    pub fn failures(&self) -> usize {
        self.records.iter().filter(|r| r.result.is_err()).count()
    }

    pub fn save_to_file(&self, filename: &str) -> Result<()> {
        let file = File::create(filename)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        info!("Results saved to {}", filename);
        Ok(())
    }
}

/// Parses and runs each control line in turn.
///
/// Lines that do not parse are logged and skipped; blank lines are ignored.
pub fn run_lines<A, S>(
    harness: &mut Harness<A>,
    space: &S,
    channels: &mut Channels,
    lines: impl IntoIterator<Item = String>,
    data: Option<serde_json::Value>,
) -> Result<SessionLog>
where
    A: PageAllocator,
    S: AddressSpace + ?Sized,
{
    let mut log = SessionLog { records: vec![] };
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command: Command = match line.parse() {
            Ok(cmd) => cmd,
            Err(e) => {
                error!("{:?}: {}", line, e);
                continue;
            }
        };
        info!("Running {:?}", command);
        let result: Result<Outcome, TestError> = harness.execute(command, space, channels.borrow());
        if let Err(e) = &result {
            error!("{}: {}", line, e);
        }
        channels.flush()?;
        log.records.push(TestRecord::new(line, result, data.clone()));
    }
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmpress_core::HarnessConfig;
    use vmpress_sim::{SimAllocator, SimConfig};

    #[test]
    fn test_run_lines_skips_bad_lines() -> Result<()> {
        let alloc = SimAllocator::new(&SimConfig::default())?;
        let space = alloc.address_space();
        let mut harness = Harness::new(alloc, HarnessConfig::default());
        let mut channels = Channels::new(None)?;
        let lines = ["zones", "", "bogus 1", "alloc_fast 1 64", "highalloc 2 0"];
        let log = run_lines(
            &mut harness,
            &space,
            &mut channels,
            lines.iter().map(|s| s.to_string()),
            None,
        )?;
        assert_eq!(log.records.len(), 3);
        assert_eq!(log.failures(), 1);
        assert!(matches!(log.records[1].result, Ok(Outcome::Alloc(_))));
        Ok(())
    }
}
