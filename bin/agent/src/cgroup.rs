use std::{
  io::ErrorKind,
  path::{Path, PathBuf},
  sync::Mutex,
  time::Duration,
};

use anyhow::{Context, bail};

use crate::config::{AgentConfig, CgroupSource};

/// Counters of one container's cgroup.
///
/// Swap values are pure swap on every layout: on cgroup v1 the
/// kernel accounts memory+swap combined and the reader subtracts
/// the memory part (clamped at zero, the two file reads are not
/// atomic).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CgroupStats {
  pub cpu_usage: Duration,
  pub memory_usage: u64,
  pub memory_max_usage: u64,
  pub memory_limit: u64,
  pub swap_usage: u64,
  pub swap_max_usage: u64,
  pub swap_limit: u64,
}

/// Read failure on a container's cgroup files.
///
/// Getting this error means the cgroup is gone or unreadable, not
/// that a single sample glitched: callers holding per-container
/// state drop it and stop sampling.
#[derive(Debug, thiserror::Error)]
#[error("read cgroup stats of '{container_id}': {error:#}")]
pub struct StatsError {
  pub container_id: String,
  error: anyhow::Error,
}

/// Where container cgroups live under CGROUP_DIR.
#[derive(Debug, Clone)]
pub struct CgroupLayout {
  pub dir: PathBuf,
  pub source: CgroupSource,
  pub v2: bool,
}

impl CgroupLayout {
  pub fn from_config(config: &AgentConfig) -> CgroupLayout {
    CgroupLayout {
      dir: config.cgroup_dir.clone(),
      source: config.cgroup_source,
      v2: config.cgroup_v2,
    }
  }

  /// Directory holding the container's files for `controller`.
  /// The unified hierarchy ignores the controller. v2 hosts
  /// always use the systemd scope layout.
  fn container_dir(&self, controller: &str, id: &str) -> PathBuf {
    if self.v2 {
      self
        .dir
        .join("system.slice")
        .join(format!("docker-{id}.scope"))
    } else if self.source == CgroupSource::Systemd {
      self
        .dir
        .join(controller)
        .join("system.slice")
        .join(format!("docker-{id}.scope"))
    } else {
      self.dir.join(controller).join("docker").join(id)
    }
  }

  /// Parent directory listing one entry per container.
  fn containers_dir(&self) -> PathBuf {
    if self.v2 {
      self.dir.join("system.slice")
    } else if self.source == CgroupSource::Systemd {
      self.dir.join("memory").join("system.slice")
    } else {
      self.dir.join("memory").join("docker")
    }
  }

  /// Full container ID from a directory entry name, if the entry
  /// is a container cgroup.
  fn id_from_entry(&self, name: &str) -> Option<String> {
    if self.v2 || self.source == CgroupSource::Systemd {
      name
        .strip_prefix("docker-")?
        .strip_suffix(".scope")
        .map(str::to_string)
    } else {
      Some(name.to_string())
    }
  }
}

/// One-shot reader over container cgroups. Construction is cheap,
/// every call re-reads the kernel files.
pub struct StatsReader {
  layout: CgroupLayout,
  // Full IDs already resolved from prefixes.
  known_ids: Mutex<Vec<String>>,
}

impl StatsReader {
  pub fn new(layout: CgroupLayout) -> StatsReader {
    StatsReader {
      layout,
      known_ids: Mutex::new(Vec::new()),
    }
  }

  pub fn stats(
    &self,
    container_id: &str,
  ) -> Result<CgroupStats, StatsError> {
    let res = if self.layout.v2 {
      self.v2_stats(container_id)
    } else {
      self.v1_stats(container_id)
    };
    res.map_err(|error| StatsError {
      container_id: container_id.to_string(),
      error,
    })
  }

  fn v2_stats(&self, id: &str) -> anyhow::Result<CgroupStats> {
    let dir = self.layout.container_dir("", id);
    Ok(CgroupStats {
      cpu_usage: Duration::from_micros(cpu_stat_usage_usec(
        &dir.join("cpu.stat"),
      )?),
      memory_usage: read_u64(&dir.join("memory.current"))?,
      memory_max_usage: read_u64_or_zero(
        &dir.join("memory.peak"),
      )?,
      memory_limit: read_u64(&dir.join("memory.max"))?,
      swap_usage: read_u64(&dir.join("memory.swap.current"))?,
      swap_max_usage: read_u64_or_zero(
        &dir.join("memory.swap.peak"),
      )?,
      swap_limit: read_u64(&dir.join("memory.swap.max"))?,
    })
  }

  fn v1_stats(&self, id: &str) -> anyhow::Result<CgroupStats> {
    let cpu_dir = self.layout.container_dir("cpuacct", id);
    let mem_dir = self.layout.container_dir("memory", id);

    let cpu_usage = Duration::from_nanos(read_u64(
      &cpu_dir.join("cpuacct.usage"),
    )?);
    let memory_usage =
      read_u64(&mem_dir.join("memory.usage_in_bytes"))?;
    let memory_max_usage =
      read_u64(&mem_dir.join("memory.max_usage_in_bytes"))?;
    let memory_limit =
      read_u64(&mem_dir.join("memory.limit_in_bytes"))?;
    let memsw_usage =
      read_u64(&mem_dir.join("memory.memsw.usage_in_bytes"))?;
    let memsw_max_usage =
      read_u64(&mem_dir.join("memory.memsw.max_usage_in_bytes"))?;
    let memsw_limit =
      read_u64(&mem_dir.join("memory.memsw.limit_in_bytes"))?;

    // memsw counts memory + swap combined. The two reads are not
    // atomic: memory may have grown in between, which would make
    // the difference negative. Clamp to zero swap in that case.
    Ok(CgroupStats {
      cpu_usage,
      memory_usage,
      memory_max_usage,
      memory_limit,
      swap_usage: memsw_usage.saturating_sub(memory_usage),
      swap_max_usage: memsw_max_usage
        .saturating_sub(memory_max_usage),
      swap_limit: memsw_limit.saturating_sub(memory_limit),
    })
  }

  /// PIDs currently in the container's cgroup. v1 goes through
  /// the memory controller.
  pub fn pids(
    &self,
    container_id: &str,
  ) -> anyhow::Result<Vec<u64>> {
    let path = if self.layout.v2 {
      self
        .layout
        .container_dir("", container_id)
        .join("cgroup.procs")
    } else {
      self
        .layout
        .container_dir("memory", container_id)
        .join("tasks")
    };
    let contents = std::fs::read_to_string(&path)
      .with_context(|| format!("open {}", path.display()))?;
    contents
      .lines()
      .filter(|line| !line.is_empty())
      .map(|line| {
        line
          .parse()
          .with_context(|| format!("invalid pid '{line}'"))
      })
      .collect()
  }

  /// First PID of the container, the one whose /proc entry holds
  /// the container's namespaces.
  pub fn container_pid(
    &self,
    container_id: &str,
  ) -> anyhow::Result<u64> {
    self
      .pids(container_id)?
      .first()
      .copied()
      .with_context(|| {
        format!("no process in cgroup of '{container_id}'")
      })
  }

  /// Expand a container ID prefix to the full ID by scanning the
  /// cgroup tree. Resolutions are cached for the process
  /// lifetime.
  pub fn expand_id(&self, id: &str) -> anyhow::Result<String> {
    {
      let known_ids = self.known_ids.lock().unwrap();
      if let Some(full) =
        known_ids.iter().find(|full| full.starts_with(id))
      {
        return Ok(full.clone());
      }
    }
    let dir = self.layout.containers_dir();
    let entries = std::fs::read_dir(&dir)
      .with_context(|| format!("open {}", dir.display()))?;
    for entry in entries {
      let entry = entry
        .with_context(|| format!("read {}", dir.display()))?;
      let name = entry.file_name();
      let Some(full) =
        self.layout.id_from_entry(&name.to_string_lossy())
      else {
        continue;
      };
      if full.starts_with(id) {
        self.known_ids.lock().unwrap().push(full.clone());
        return Ok(full);
      }
    }
    bail!("container '{id}' not found in {}", dir.display())
  }
}

/// Single-value cgroup files hold one integer, or `max` for
/// unlimited on the unified hierarchy.
fn read_u64(path: &Path) -> anyhow::Result<u64> {
  let contents = std::fs::read_to_string(path)
    .with_context(|| format!("open {}", path.display()))?;
  let contents = contents.trim();
  if contents == "max" {
    return Ok(u64::MAX);
  }
  contents.parse().with_context(|| {
    format!("invalid value '{contents}' in {}", path.display())
  })
}

/// Like [read_u64], except a missing file reads as zero. Used for
/// `memory.peak`, which older v2 kernels do not expose.
fn read_u64_or_zero(path: &Path) -> anyhow::Result<u64> {
  match std::fs::read_to_string(path) {
    Ok(contents) => {
      let contents = contents.trim();
      contents.parse().with_context(|| {
        format!(
          "invalid value '{contents}' in {}",
          path.display()
        )
      })
    }
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
    Err(e) => {
      Err(e).with_context(|| format!("open {}", path.display()))
    }
  }
}

fn cpu_stat_usage_usec(path: &Path) -> anyhow::Result<u64> {
  let contents = std::fs::read_to_string(path)
    .with_context(|| format!("open {}", path.display()))?;
  for line in contents.lines() {
    if let Some(value) = line.strip_prefix("usage_usec ") {
      return value.trim().parse().with_context(|| {
        format!("invalid usage_usec in {}", path.display())
      });
    }
  }
  bail!("no usage_usec line in {}", path.display())
}
