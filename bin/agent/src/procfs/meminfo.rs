use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

/// Host memory counts from `/proc/meminfo`, in bytes.
///
/// Only the labels relevant to reporting are retained, anything
/// else in the file is ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemInfo {
  pub mem_total: u64,
  pub mem_free: u64,
  pub buffers: u64,
  pub cached: u64,
  pub swap_cached: u64,
  pub active: u64,
  pub inactive: u64,
  pub swap_total: u64,
  pub swap_free: u64,
  pub dirty: u64,
  pub writeback: u64,
  pub mapped: u64,
  pub slab: u64,
  pub commit_limit: u64,
  pub committed_as: u64,
}

impl MemInfo {
  /// Memory the kernel could hand out without swapping:
  /// MemFree + Buffers + Cached.
  pub fn free_buffers(&self) -> u64 {
    self.mem_free + self.buffers + self.cached
  }

  pub fn swap_used(&self) -> u64 {
    self.swap_total.saturating_sub(self.swap_free)
  }
}

pub struct MemInfoReader {
  path: PathBuf,
}

impl MemInfoReader {
  pub fn new(proc_dir: &Path) -> MemInfoReader {
    MemInfoReader {
      path: proc_dir.join("meminfo"),
    }
  }

  pub fn read(&self) -> anyhow::Result<MemInfo> {
    let contents = std::fs::read_to_string(&self.path)
      .with_context(|| format!("open {}", self.path.display()))?;
    parse_meminfo(&contents)
  }
}

/// Lines look like `MemTotal:       15996348 kB`. The value is a
/// positive integer, the unit is optional and `kB` is the only
/// one the kernel emits.
fn parse_meminfo(contents: &str) -> anyhow::Result<MemInfo> {
  let mut info = MemInfo::default();
  for line in contents.lines() {
    if line.is_empty() {
      continue;
    }
    let fields = line.split_whitespace().collect::<Vec<_>>();
    if fields.len() < 2 {
      bail!("invalid meminfo line: {line}");
    }
    let Some(label) = fields[0].strip_suffix(':') else {
      bail!("meminfo label without colon: {line}");
    };
    let mut value: u64 = fields[1].parse().with_context(|| {
      format!("invalid value for {label}: {}", fields[1])
    })?;
    if fields.len() > 2 {
      if fields[2] != "kB" {
        bail!("invalid unit in meminfo line: {line}");
      }
      value *= 1024;
    }
    match label {
      "MemTotal" => info.mem_total = value,
      "MemFree" => info.mem_free = value,
      "Buffers" => info.buffers = value,
      "Cached" => info.cached = value,
      "SwapCached" => info.swap_cached = value,
      "Active" => info.active = value,
      "Inactive" => info.inactive = value,
      "SwapTotal" => info.swap_total = value,
      "SwapFree" => info.swap_free = value,
      "Dirty" => info.dirty = value,
      "Writeback" => info.writeback = value,
      "Mapped" => info.mapped = value,
      "Slab" => info.slab = value,
      "CommitLimit" => info.commit_limit = value,
      "Committed_AS" => info.committed_as = value,
      _ => {}
    }
  }
  Ok(info)
}
