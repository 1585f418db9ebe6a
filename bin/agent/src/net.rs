use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
  time::Duration,
};

use dockwatch_client::entities::{NetUsage, NetworkStat};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
  cgroup::StatsReader,
  docker::events::{ContainerAction, EventBus},
  netns::{IfaceResolver, host_iface_by_index},
  procfs::NetDevReader,
};

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Associates containers to their host-side veth interface and
/// derives Rx/Tx rates from periodic interface counter snapshots.
///
/// Counters keep the host interface's point of view: received on
/// the veth is what the container transmitted and vice versa. The
/// API documents the inversion instead of swapping.
pub struct NetMonitor {
  refresh: Duration,
  net_dev: NetDevReader,
  resolver: IfaceResolver,
  sys_class_net: PathBuf,
  cgroup_stats: Arc<StatsReader>,
  state: Mutex<NetState>,
}

#[derive(Default)]
struct NetState {
  usages: HashMap<String, NetworkStat>,
  previous: HashMap<String, NetworkStat>,
  // host interface name -> container ID
  container_ifaces: HashMap<String, String>,
}

impl NetMonitor {
  pub fn new(
    proc_dir: &Path,
    cgroup_stats: Arc<StatsReader>,
    refresh: Duration,
  ) -> Arc<NetMonitor> {
    Arc::new(NetMonitor {
      refresh,
      net_dev: NetDevReader::new(proc_dir),
      resolver: IfaceResolver::new(proc_dir),
      sys_class_net: PathBuf::from(SYS_CLASS_NET),
      cgroup_stats,
      state: Default::default(),
    })
  }

  pub async fn spawn(
    self: &Arc<Self>,
    bus: &Arc<EventBus>,
    cancel: CancellationToken,
  ) {
    let monitor = self.clone();
    let ticker_cancel = cancel.clone();
    tokio::spawn(async move {
      monitor.monitor_interfaces(ticker_cancel).await
    });

    let mut events = bus.subscribe().await;
    let monitor = self.clone();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = cancel.cancelled() => return,
          event = events.recv() => {
            let Some(event) = event else { return };
            match event.action {
              ContainerAction::Start => {
                // Resolution re-execs a child, keep the event
                // loop draining while it runs.
                let monitor = monitor.clone();
                tokio::spawn(async move {
                  monitor.register_container(event.container_id).await
                });
              }
              ContainerAction::Stop => {
                monitor.unregister_container(&event.container_id)
              }
            }
          }
        }
      }
    });
  }

  async fn register_container(&self, id: String) {
    match self.resolve_iface(&id).await {
      Ok(iface) => {
        info!("container {id} maps to host interface {iface}");
        let mut state = self.state.lock().unwrap();
        state.container_ifaces.insert(iface, id);
      }
      Err(e) => warn!(
        "failed to resolve network interface of '{id}' | {e:#}"
      ),
    }
  }

  /// Interfaces are stable for a container's lifetime, so the
  /// mapping is established once per start and only removed here.
  fn unregister_container(&self, id: &str) {
    let mut state = self.state.lock().unwrap();
    state.container_ifaces.retain(|_, mapped| mapped != id);
    state.usages.remove(id);
    state.previous.remove(id);
  }

  async fn resolve_iface(&self, id: &str) -> anyhow::Result<String> {
    let pid = self.cgroup_stats.container_pid(id)?;
    let index = self.resolver.peer_index(pid).await?;
    host_iface_by_index(&self.sys_class_net, index)
  }

  async fn monitor_interfaces(&self, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(self.refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = ticker.tick() => {}
      }
      let stats = match self.net_dev.read() {
        Ok(stats) => stats,
        Err(e) => {
          info!("failed to read interface stats | {e:#}");
          continue;
        }
      };
      let mut state = self.state.lock().unwrap();
      for stat in stats {
        let Some(id) =
          state.container_ifaces.get(&stat.interface).cloned()
        else {
          continue;
        };
        if let Some(previous) =
          state.usages.insert(id.clone(), stat)
        {
          state.previous.insert(id, previous);
        }
      }
    }
  }

  /// Latest snapshot plus derived rates. Rates are zero until two
  /// snapshots exist, a first sample must not read as a spike.
  pub fn get_usage(&self, id: &str) -> anyhow::Result<NetUsage> {
    let id = self.cgroup_stats.expand_id(id)?;
    let state = self.state.lock().unwrap();
    let mut usage = NetUsage {
      stat: state.usages.get(&id).cloned().unwrap_or_default(),
      rx_bps: 0,
      tx_bps: 0,
    };
    if let Some(previous) = state.previous.get(&id) {
      let secs = self.refresh.as_secs_f64();
      if previous.received.bytes > 0 {
        usage.rx_bps = (usage
          .stat
          .received
          .bytes
          .saturating_sub(previous.received.bytes)
          as f64
          / secs) as i64;
      }
      if previous.transmit.bytes > 0 {
        usage.tx_bps = (usage
          .stat
          .transmit
          .bytes
          .saturating_sub(previous.transmit.bytes)
          as f64
          / secs) as i64;
      }
    }
    Ok(usage)
  }

  /// Current interface mapping, host interface name to container.
  pub fn interface_mappings(&self) -> HashMap<String, String> {
    self.state.lock().unwrap().container_ifaces.clone()
  }
}

#[cfg(test)]
mod tests {
  use dockwatch_client::entities::InterfaceCounters;
  use tempfile::TempDir;

  use super::*;
  use crate::{cgroup::CgroupLayout, config::CgroupSource};

  const ID: &str =
    "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

  // The monitor expands IDs against the cgroup tree before any
  // map lookup, so the tests need a matching cgroup entry.
  fn test_monitor() -> (Arc<NetMonitor>, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(
      tmp.path().join("memory/docker").join(ID),
    )
    .unwrap();
    let layout = CgroupLayout {
      dir: tmp.path().to_path_buf(),
      source: CgroupSource::Docker,
      v2: false,
    };
    let monitor = Arc::new(NetMonitor {
      refresh: Duration::from_secs(20),
      net_dev: NetDevReader::new(Path::new("/proc")),
      resolver: IfaceResolver::new(Path::new("/proc")),
      sys_class_net: PathBuf::from(SYS_CLASS_NET),
      cgroup_stats: Arc::new(StatsReader::new(layout)),
      state: Default::default(),
    });
    (monitor, tmp)
  }

  fn snapshot(rx_bytes: u64, tx_bytes: u64) -> NetworkStat {
    NetworkStat {
      interface: "veth8ba2".to_string(),
      received: InterfaceCounters {
        bytes: rx_bytes,
        ..Default::default()
      },
      transmit: InterfaceCounters {
        bytes: tx_bytes,
        ..Default::default()
      },
    }
  }

  #[test]
  fn first_snapshot_reports_zero_rates() {
    let (monitor, _tmp) = test_monitor();
    monitor
      .state
      .lock()
      .unwrap()
      .usages
      .insert(ID.to_string(), snapshot(5000, 1000));
    let usage = monitor.get_usage(ID).unwrap();
    assert_eq!(usage.stat.received.bytes, 5000);
    assert_eq!(usage.rx_bps, 0);
    assert_eq!(usage.tx_bps, 0);
  }

  #[test]
  fn rates_derive_from_two_snapshots_over_the_period() {
    let (monitor, _tmp) = test_monitor();
    {
      let mut state = monitor.state.lock().unwrap();
      state
        .previous
        .insert(ID.to_string(), snapshot(5000, 1000));
      state
        .usages
        .insert(ID.to_string(), snapshot(25000, 3000));
    }
    let usage = monitor.get_usage(ID).unwrap();
    assert_eq!(usage.rx_bps, 1000);
    assert_eq!(usage.tx_bps, 100);
  }

  #[test]
  fn usage_accepts_id_prefixes() {
    let (monitor, _tmp) = test_monitor();
    monitor
      .state
      .lock()
      .unwrap()
      .usages
      .insert(ID.to_string(), snapshot(5000, 1000));
    let usage = monitor.get_usage(&ID[..12]).unwrap();
    assert_eq!(usage.stat.received.bytes, 5000);
  }

  #[test]
  fn unknown_container_is_an_error() {
    let (monitor, _tmp) = test_monitor();
    assert!(monitor.get_usage("feedface").is_err());
  }

  #[test]
  fn stop_drops_the_mapping_and_the_samples() {
    let (monitor, _tmp) = test_monitor();
    {
      let mut state = monitor.state.lock().unwrap();
      state
        .container_ifaces
        .insert("veth8ba2".to_string(), ID.to_string());
      state.usages.insert(ID.to_string(), snapshot(1, 1));
      state.previous.insert(ID.to_string(), snapshot(1, 1));
    }
    monitor.unregister_container(ID);
    let state = monitor.state.lock().unwrap();
    assert!(state.container_ifaces.is_empty());
    assert!(state.usages.is_empty());
    assert!(state.previous.is_empty());
  }

  #[test]
  fn a_new_start_overwrites_the_interface_mapping() {
    let (monitor, _tmp) = test_monitor();
    {
      let mut state = monitor.state.lock().unwrap();
      state
        .container_ifaces
        .insert("veth8ba2".to_string(), "old".to_string());
      state
        .container_ifaces
        .insert("veth8ba2".to_string(), ID.to_string());
    }
    assert_eq!(
      monitor.interface_mappings().get("veth8ba2"),
      Some(&ID.to_string())
    );
  }
}
