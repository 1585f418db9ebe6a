use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

use crate::filter::MetricsReader;

/// One snapshot of `/proc/loadavg`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadAverage {
  pub load1: f64,
  pub load5: f64,
  pub load10: f64,
  /// Processes currently in the runnable state.
  pub running: u64,
  pub total: u64,
  pub last_pid: u64,
}

pub struct LoadAvgReader {
  path: PathBuf,
}

impl LoadAvgReader {
  pub fn new(proc_dir: &Path) -> LoadAvgReader {
    LoadAvgReader {
      path: proc_dir.join("loadavg"),
    }
  }

  pub fn read(&self) -> anyhow::Result<LoadAverage> {
    let contents = std::fs::read_to_string(&self.path)
      .with_context(|| format!("open {}", self.path.display()))?;
    parse_loadavg(&contents)
  }
}

/// The file is a single line:
/// `1.76 4.08 4.41 3/1484 2852530`
/// load 1 / 5 / 10 minutes, running/total processes, last PID.
fn parse_loadavg(contents: &str) -> anyhow::Result<LoadAverage> {
  let fields = contents.split_whitespace().collect::<Vec<_>>();
  if fields.len() != 5 {
    bail!(
      "invalid loadavg line, got {} fields expected 5",
      fields.len()
    );
  }
  let Some((running, total)) = fields[3].split_once('/') else {
    bail!("invalid running/total field: {}", fields[3]);
  };
  Ok(LoadAverage {
    load1: fields[0].parse().context("parse 1 minute load")?,
    load5: fields[1].parse().context("parse 5 minute load")?,
    load10: fields[2].parse().context("parse 10 minute load")?,
    running: running.parse().context("parse running count")?,
    total: total.parse().context("parse total count")?,
    last_pid: fields[4].parse().context("parse last pid")?,
  })
}

/// Adapts [LoadAvgReader] to the smoothing filter: each sample is
/// the current runnable-process count.
pub struct RunningProcsReader {
  reader: LoadAvgReader,
}

impl RunningProcsReader {
  pub fn new(proc_dir: &Path) -> RunningProcsReader {
    RunningProcsReader {
      reader: LoadAvgReader::new(proc_dir),
    }
  }
}

impl MetricsReader for RunningProcsReader {
  fn read(&self) -> anyhow::Result<f64> {
    Ok(self.reader.read()?.running as f64)
  }
}
