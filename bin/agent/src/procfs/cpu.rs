use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context, bail};

/// Time one CPU spent in each state since boot.
///
/// `/proc/stat` counts in USER_HZ ticks; the reader scales every
/// field to a [Duration] once, so downstream delta arithmetic
/// never sees raw ticks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuTimes {
  pub name: String,
  pub user: Duration,
  pub nice: Duration,
  pub system: Duration,
  pub idle: Duration,
  pub iowait: Duration,
  pub irq: Duration,
  pub softirq: Duration,
  pub steal: Duration,
  pub guest: Duration,
  pub guest_nice: Duration,
}

impl CpuTimes {
  /// Total busy + idle time.
  pub fn total(&self) -> Duration {
    self.user
      + self.nice
      + self.system
      + self.idle
      + self.iowait
      + self.irq
      + self.softirq
      + self.steal
      + self.guest
      + self.guest_nice
  }
}

/// One snapshot of `/proc/stat`, keyed by line name: `cpu` for
/// the aggregate line, `cpu0`..`cpuN` per CPU.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuStats {
  pub cpus: HashMap<String, CpuTimes>,
}

impl CpuStats {
  /// The aggregate line over all CPUs.
  pub fn all(&self) -> CpuTimes {
    self.cpus.get("cpu").cloned().unwrap_or_default()
  }
}

pub struct CpuStatReader {
  path: PathBuf,
  clock_tick: u64,
}

impl CpuStatReader {
  pub fn new(proc_dir: &Path) -> anyhow::Result<CpuStatReader> {
    Ok(CpuStatReader {
      path: proc_dir.join("stat"),
      clock_tick: clock_tick()?,
    })
  }

  pub fn read(&self) -> anyhow::Result<CpuStats> {
    let contents = std::fs::read_to_string(&self.path)
      .with_context(|| format!("open {}", self.path.display()))?;
    parse_cpu_stats(&contents, self.clock_tick)
  }
}

/// SC_CLK_TCK, the unit of `/proc/stat` counters. Queried once
/// per reader.
fn clock_tick() -> anyhow::Result<u64> {
  let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
  if ticks <= 0 {
    bail!("sysconf(_SC_CLK_TCK) returned {ticks}");
  }
  Ok(ticks as u64)
}

fn parse_cpu_stats(
  contents: &str,
  clock_tick: u64,
) -> anyhow::Result<CpuStats> {
  let nanos_per_tick = 1_000_000_000 / clock_tick;
  let mut result = CpuStats::default();
  for line in contents.lines() {
    // Only the cpu lines matter here, /proc/stat holds plenty of
    // other counters.
    if !line.starts_with("cpu") {
      continue;
    }
    let cpu = parse_cpu_line(line, nanos_per_tick)
      .with_context(|| format!("parse stat line '{line}'"))?;
    result.cpus.insert(cpu.name.clone(), cpu);
  }
  Ok(result)
}

/// A cpu line looks like:
/// `cpu0 13069940 9818 5731093 48473111 103287 1760557 386330 0 0 0`
/// with fields user, nice, system, idle, iowait, irq, softirq,
/// steal, guest, guest_nice.
fn parse_cpu_line(
  line: &str,
  nanos_per_tick: u64,
) -> anyhow::Result<CpuTimes> {
  let mut fields = line.split_whitespace();
  let name = fields
    .next()
    .context("empty stat line")?
    .to_string();
  let mut values = [Duration::ZERO; 10];
  for (i, value) in values.iter_mut().enumerate() {
    let raw: u64 = fields
      .next()
      .with_context(|| {
        format!("expected 10 counters, got {i}")
      })?
      .parse()
      .context("counter is not an integer")?;
    *value =
      Duration::from_nanos(raw.saturating_mul(nanos_per_tick));
  }
  let [
    user,
    nice,
    system,
    idle,
    iowait,
    irq,
    softirq,
    steal,
    guest,
    guest_nice,
  ] = values;
  Ok(CpuTimes {
    name,
    user,
    nice,
    system,
    idle,
    iowait,
    irq,
    softirq,
    steal,
    guest,
    guest_nice,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  const FIXTURE: &str = "\
cpu  155973 111 25140 1665056 1628 5054 1906 0 0 0
cpu0 20172 13 3028 207387 220 607 249 0 0 0
cpu1 19340 12 3098 208438 212 581 204 0 0 0
intr 66085838 11 1141 0 0 0 0 0 0 1 25607
ctxt 163164194
btime 1682607279
";

  // One tick at 100Hz.
  const TICK: u64 = 10_000_000;

  #[test]
  fn parses_aggregate_and_per_cpu_lines() {
    let stats = parse_cpu_stats(FIXTURE, 100).unwrap();
    assert_eq!(stats.cpus.len(), 3);

    let all = stats.all();
    assert_eq!(all.name, "cpu");
    assert_eq!(all.user, Duration::from_nanos(155973 * TICK));
    assert_eq!(all.nice, Duration::from_nanos(111 * TICK));
    assert_eq!(all.system, Duration::from_nanos(25140 * TICK));
    assert_eq!(all.idle, Duration::from_nanos(1665056 * TICK));
    assert_eq!(all.iowait, Duration::from_nanos(1628 * TICK));
    assert_eq!(all.irq, Duration::from_nanos(5054 * TICK));
    assert_eq!(all.softirq, Duration::from_nanos(1906 * TICK));
    assert_eq!(all.steal, Duration::ZERO);

    let cpu1 = &stats.cpus["cpu1"];
    assert_eq!(cpu1.user, Duration::from_nanos(19340 * TICK));
    assert_eq!(cpu1.idle, Duration::from_nanos(208438 * TICK));
  }

  #[test]
  fn total_sums_every_state() {
    let stats = parse_cpu_stats(FIXTURE, 100).unwrap();
    let expected: u64 =
      155973 + 111 + 25140 + 1665056 + 1628 + 5054 + 1906;
    assert_eq!(
      stats.all().total(),
      Duration::from_nanos(expected * TICK)
    );
  }

  #[test]
  fn missing_aggregate_line_yields_zero_times() {
    let stats = parse_cpu_stats("ctxt 12345\n", 100).unwrap();
    assert_eq!(stats.all(), CpuTimes::default());
  }

  #[test]
  fn truncated_cpu_line_is_an_error() {
    let res = parse_cpu_stats("cpu 1 2 3\n", 100);
    assert!(res.is_err());
  }

  #[test]
  fn non_numeric_counter_is_an_error() {
    let res =
      parse_cpu_stats("cpu 1 2 3 x 5 6 7 8 9 10\n", 100);
    assert!(res.is_err());
  }
}
