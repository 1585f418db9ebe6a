//! JSON shapes served by the dockwatch agent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Memory and swap counters for one container, in bytes.
/// Swap values are pure swap: the agent already subtracts the
/// memory part out of the kernel's combined mem+swap counters on
/// cgroup v1 hosts.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize,
)]
pub struct MemoryUsage {
  pub memory_usage: i64,
  pub swap_usage: i64,
  pub memory_limit: i64,
  pub swap_limit: i64,
  pub max_memory_usage: i64,
  pub max_swap_usage: i64,
}

/// CPU consumption of one container, in percents of a single
/// logical CPU. 150 means one and a half cores.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize,
)]
pub struct CpuUsage {
  pub usage_in_percents: i64,
}

/// Raw counters of one direction of a network interface, as
/// accounted by the kernel in `/proc/net/dev`.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize,
)]
pub struct InterfaceCounters {
  pub bytes: u64,
  pub packets: u64,
  pub errs: u64,
  pub drop: u64,
  pub fifo: u64,
  pub frame: u64,
  pub compressed: u64,
  pub multicast: u64,
}

/// Counters of the host-side veth interface of a container.
///
/// The counters keep the host interface's point of view: what the
/// veth *received* is what processes inside the container
/// transmitted, and vice versa. Consumers that want the
/// container's point of view must swap the two directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStat {
  pub interface: String,
  pub received: InterfaceCounters,
  pub transmit: InterfaceCounters,
}

/// [NetworkStat] plus rates derived from two consecutive
/// snapshots, in bytes per second. Zero until two snapshots exist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetUsage {
  #[serde(flatten)]
  pub stat: NetworkStat,
  pub rx_bps: i64,
  pub tx_bps: i64,
}

/// Combined usage of one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
  pub memory: Option<MemoryUsage>,
  pub cpu: Option<CpuUsage>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub net: Option<NetUsage>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub labels: Option<HashMap<String, String>>,
}

pub type ContainersUsage = HashMap<String, Usage>;

/// Aggregate CPU utilization of the host.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize,
)]
pub struct HostCpuUsage {
  /// Fraction of non-idle host CPU time over the last second,
  /// in [0, 1].
  pub usage: f64,
  /// Number of logical CPUs.
  pub amount: i64,
  pub queue_length_exponentially_smoothed: f64,
}

/// Host memory figures, in megabytes. The `*_usage` / `*_committed`
/// fields accumulate the containers included by the request's
/// label filter.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize,
)]
pub struct HostMemoryUsage {
  pub free: u64,
  pub total: u64,
  pub swap: u64,
  pub memory_usage: u64,
  pub memory_committed: u64,
  pub max_memory_usage: u64,
  pub swap_usage: u64,
  pub swap_committed: u64,
  pub max_swap_usage: u64,
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize,
)]
pub struct HostUsage {
  pub cpu: HostCpuUsage,
  pub memory: HostMemoryUsage,
}
