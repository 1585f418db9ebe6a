use std::{
  fs::File,
  path::{Path, PathBuf},
};

use anyhow::{Context, bail};
use nix::sched::CloneFlags;

/// Resolves the host-side interface index of a container's eth0
/// by re-executing the agent with `--ns-iface-id <pid>`.
///
/// Entering a network namespace is thread-affine; a short-lived
/// child process keeps the main process free of namespace state.
pub struct IfaceResolver {
  proc_dir: PathBuf,
}

impl IfaceResolver {
  pub fn new(proc_dir: &Path) -> IfaceResolver {
    IfaceResolver {
      proc_dir: proc_dir.to_path_buf(),
    }
  }

  pub async fn peer_index(&self, pid: u64) -> anyhow::Result<u64> {
    let exe =
      std::env::current_exe().context("locate agent binary")?;
    let output = tokio::process::Command::new(exe)
      .arg("--ns-iface-id")
      .arg(pid.to_string())
      .env_clear()
      .env("PROC_DIR", &self.proc_dir)
      .env(
        "PATH",
        std::env::var_os("PATH").unwrap_or_default(),
      )
      .output()
      .await
      .context("run ns-iface-id child")?;
    if !output.status.success() {
      bail!(
        "ns-iface-id child failed: {}{}",
        String::from_utf8_lossy(&output.stderr),
        String::from_utf8_lossy(&output.stdout),
      );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.trim().parse().with_context(|| {
      format!("unexpected child output '{}'", stdout.trim())
    })
  }
}

/// Child-side implementation of `--ns-iface-id <pid>`: enter the
/// network namespace at `$PROC_DIR/<pid>/ns/net` and print the
/// peer index of eth0.
pub fn ns_iface_index(pid: &str) -> anyhow::Result<u64> {
  let proc_dir = std::env::var_os("PROC_DIR")
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from("/proc"));
  let ns_path = proc_dir.join(pid).join("ns/net");
  let ns = File::open(&ns_path).with_context(|| {
    format!("open namespace {}", ns_path.display())
  })?;
  nix::sched::setns(&ns, CloneFlags::CLONE_NEWNET)
    .context("enter network namespace")?;

  // sysfs keeps showing the namespace it was mounted in, the
  // link attributes have to come over netlink; `ip` does that.
  let output = std::process::Command::new("ip")
    .args(["link", "show", "eth0"])
    .output()
    .context("run ip link show eth0")?;
  if !output.status.success() {
    bail!(
      "ip link show eth0: {}",
      String::from_utf8_lossy(&output.stderr)
    );
  }
  parse_peer_index(&String::from_utf8_lossy(&output.stdout))
}

/// `614: eth0@if615: <BROADCAST,MULTICAST,UP> mtu 1500 ...` — the
/// number after `@if` is the interface index of the other end of
/// the veth pair, the host side.
fn parse_peer_index(output: &str) -> anyhow::Result<u64> {
  let (_, rest) = output
    .split_once("@if")
    .context("no @if peer in ip link output")?;
  let digits = rest
    .chars()
    .take_while(char::is_ascii_digit)
    .collect::<String>();
  if digits.is_empty() {
    bail!("no peer index after @if in ip link output");
  }
  digits.parse().context("parse peer index")
}

/// Name of the host interface with the given index, from
/// `<sys_class_net>/*/ifindex`.
pub fn host_iface_by_index(
  sys_class_net: &Path,
  index: u64,
) -> anyhow::Result<String> {
  let entries =
    std::fs::read_dir(sys_class_net).with_context(|| {
      format!("open {}", sys_class_net.display())
    })?;
  for entry in entries {
    let entry = entry.with_context(|| {
      format!("read {}", sys_class_net.display())
    })?;
    let Ok(contents) =
      std::fs::read_to_string(entry.path().join("ifindex"))
    else {
      continue;
    };
    if contents.trim().parse::<u64>() == Ok(index) {
      return Ok(entry.file_name().to_string_lossy().into_owned());
    }
  }
  bail!("no host interface with index {index}")
}
