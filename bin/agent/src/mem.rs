use std::sync::Arc;

use anyhow::Context;
use dockwatch_client::entities::MemoryUsage;

use crate::cgroup::StatsReader;

/// One-shot memory / swap readings. Stateless: every call reads
/// the container's cgroup afresh.
pub struct MemoryUsageGetter {
  cgroup_stats: Arc<StatsReader>,
}

impl MemoryUsageGetter {
  pub fn new(cgroup_stats: Arc<StatsReader>) -> MemoryUsageGetter {
    MemoryUsageGetter { cgroup_stats }
  }

  pub fn get_memory_usage(
    &self,
    id: &str,
  ) -> anyhow::Result<MemoryUsage> {
    let id = self
      .cgroup_stats
      .expand_id(id)
      .with_context(|| format!("expand container id '{id}'"))?;
    let stats = self.cgroup_stats.stats(&id)?;
    Ok(MemoryUsage {
      memory_usage: bytes(stats.memory_usage),
      swap_usage: bytes(stats.swap_usage),
      memory_limit: bytes(stats.memory_limit),
      swap_limit: bytes(stats.swap_limit),
      max_memory_usage: bytes(stats.memory_max_usage),
      max_swap_usage: bytes(stats.swap_max_usage),
    })
  }
}

// "Unlimited" on the unified hierarchy reads as u64::MAX, which
// must not wrap to -1 on the API.
fn bytes(value: u64) -> i64 {
  i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
  use std::{fs, path::Path};

  use super::*;
  use crate::{cgroup::CgroupLayout, config::CgroupSource};

  const ID: &str =
    "c29b5b6fa9f3cd134e9950b3e510ffb34e8b9b7d0c2a1f23b4a8dd32f4a08372";

  fn write_v1_tree(dir: &Path) {
    let mem = dir.join("memory/docker").join(ID);
    let cpu = dir.join("cpuacct/docker").join(ID);
    fs::create_dir_all(&mem).unwrap();
    fs::create_dir_all(&cpu).unwrap();
    fs::write(cpu.join("cpuacct.usage"), "0\n").unwrap();
    for (file, value) in [
      ("memory.usage_in_bytes", "1000"),
      ("memory.max_usage_in_bytes", "1500"),
      ("memory.limit_in_bytes", "4000"),
      ("memory.memsw.usage_in_bytes", "1300"),
      ("memory.memsw.max_usage_in_bytes", "2100"),
      ("memory.memsw.limit_in_bytes", "6000"),
    ] {
      fs::write(mem.join(file), format!("{value}\n")).unwrap();
    }
  }

  #[test]
  fn maps_cgroup_stats_onto_the_api_shape() {
    let tmp = tempfile::tempdir().unwrap();
    write_v1_tree(tmp.path());
    let getter =
      MemoryUsageGetter::new(Arc::new(StatsReader::new(
        CgroupLayout {
          dir: tmp.path().to_path_buf(),
          source: CgroupSource::Docker,
          v2: false,
        },
      )));

    // Short prefix, the getter expands it.
    let usage = getter.get_memory_usage(&ID[..12]).unwrap();
    assert_eq!(
      usage,
      MemoryUsage {
        memory_usage: 1000,
        swap_usage: 300,
        memory_limit: 4000,
        swap_limit: 2000,
        max_memory_usage: 1500,
        max_swap_usage: 600,
      }
    );
  }

  #[test]
  fn unlimited_values_saturate_instead_of_wrapping() {
    assert_eq!(bytes(u64::MAX), i64::MAX);
    assert_eq!(bytes(1024), 1024);
  }
}
