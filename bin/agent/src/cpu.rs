use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  time::Duration,
};

use dockwatch_client::entities::{CpuUsage, HostCpuUsage};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
  cgroup::{CgroupStats, StatsReader},
  docker::events::{ContainerAction, EventBus},
  procfs::{CpuStatReader, CpuTimes},
};

/// Samples container and host CPU counters and derives percent
/// utilization from the deltas of two consecutive samples.
///
/// The host reference is sampled every second; containers are
/// sampled every REFRESH_TIME by one task per running container,
/// spawned on the engine's start event and cancelled on stop.
pub struct CpuUsageMonitor {
  num_cpus: usize,
  refresh: Duration,
  cpu_stat: CpuStatReader,
  cgroup_stats: Arc<StatsReader>,
  state: Mutex<CpuState>,
}

#[derive(Default)]
struct CpuState {
  current_host: Option<CpuTimes>,
  previous_host: Option<CpuTimes>,
  // Host totals observed together with each container sample, so
  // both deltas always cover the same window.
  current_host_sum: HashMap<String, Duration>,
  previous_host_sum: HashMap<String, Duration>,
  current_containers: HashMap<String, CgroupStats>,
  previous_containers: HashMap<String, CgroupStats>,
  tasks: HashMap<String, CancellationToken>,
}

impl CpuUsageMonitor {
  pub fn new(
    cpu_stat: CpuStatReader,
    cgroup_stats: Arc<StatsReader>,
    refresh: Duration,
  ) -> Arc<CpuUsageMonitor> {
    Arc::new(CpuUsageMonitor {
      num_cpus: std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1),
      refresh,
      cpu_stat,
      cgroup_stats,
      state: Default::default(),
    })
  }

  /// Start the host reference loop and subscribe to container
  /// lifecycle events.
  pub async fn spawn(
    self: &Arc<Self>,
    bus: &Arc<EventBus>,
    cancel: CancellationToken,
  ) {
    let monitor = self.clone();
    let host_cancel = cancel.clone();
    tokio::spawn(async move {
      monitor.monitor_host(host_cancel).await
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
              ContainerAction::Start => monitor
                .start_container_task(event.container_id, &cancel),
              ContainerAction::Stop => {
                monitor.stop_container_task(&event.container_id)
              }
            }
          }
        }
      }
    });
  }

  fn start_container_task(
    self: &Arc<Self>,
    id: String,
    root: &CancellationToken,
  ) {
    info!("monitoring CPU of {id}");
    let token = root.child_token();
    let previous = self
      .state
      .lock()
      .unwrap()
      .tasks
      .insert(id.clone(), token.clone());
    // A stop for the previous incarnation may still be in flight.
    if let Some(previous) = previous {
      previous.cancel();
    }
    let monitor = self.clone();
    tokio::spawn(async move {
      monitor.monitor_container(id, token).await
    });
  }

  fn stop_container_task(&self, id: &str) {
    if let Some(token) =
      self.state.lock().unwrap().tasks.remove(id)
    {
      token.cancel();
    }
  }

  async fn monitor_host(&self, cancel: CancellationToken) {
    let mut ticker =
      tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = ticker.tick() => {}
      }
      let stats = match self.cpu_stat.read() {
        Ok(stats) => stats,
        Err(e) => {
          error!("failed to read host CPU stats | {e:#}");
          continue;
        }
      };
      let mut state = self.state.lock().unwrap();
      state.previous_host =
        state.current_host.replace(stats.all());
    }
  }

  async fn monitor_container(
    &self,
    id: String,
    cancel: CancellationToken,
  ) {
    let mut ticker = tokio::time::interval(self.refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = ticker.tick() => {}
      }
      let stats = match self.cgroup_stats.stats(&id) {
        Ok(stats) => stats,
        Err(e) => {
          // The cgroup is gone, so is the container.
          info!("stop monitoring CPU of '{id}', reason: '{e}'");
          self.drop_container(&id);
          return;
        }
      };
      let host_sum = match self.cpu_stat.read() {
        Ok(host) => host.all().total(),
        Err(e) => {
          // Skip the whole tick: installing the container sample
          // without its host counterpart would mix windows.
          warn!("failed to read host CPU stats | {e:#}");
          continue;
        }
      };
      let mut state = self.state.lock().unwrap();
      if let Some(previous) =
        state.current_containers.insert(id.clone(), stats)
      {
        state.previous_containers.insert(id.clone(), previous);
      }
      if let Some(previous) =
        state.current_host_sum.insert(id.clone(), host_sum)
      {
        state.previous_host_sum.insert(id.clone(), previous);
      }
    }
  }

  fn drop_container(&self, id: &str) {
    let mut state = self.state.lock().unwrap();
    state.current_containers.remove(id);
    state.previous_containers.remove(id);
    state.current_host_sum.remove(id);
    state.previous_host_sum.remove(id);
    state.tasks.remove(id);
  }

  /// Percent of a single CPU consumed by the container over its
  /// last sampling window: 150 means one and a half cores. Zero
  /// until two samples exist, or when a delta is not positive.
  pub fn get_container_usage(&self, id: &str) -> CpuUsage {
    let id = self
      .cgroup_stats
      .expand_id(id)
      .unwrap_or_else(|_| id.to_string());
    let state = self.state.lock().unwrap();
    let (
      Some(current),
      Some(previous),
      Some(current_sum),
      Some(previous_sum),
    ) = (
      state.current_containers.get(&id),
      state.previous_containers.get(&id),
      state.current_host_sum.get(&id),
      state.previous_host_sum.get(&id),
    )
    else {
      return CpuUsage::default();
    };

    let delta_container =
      current.cpu_usage.checked_sub(previous.cpu_usage);
    let delta_host = current_sum.checked_sub(*previous_sum);
    let usage_in_percents = match (delta_container, delta_host) {
      (Some(container), Some(host))
        if !container.is_zero() && !host.is_zero() =>
      {
        (container.as_secs_f64() / host.as_secs_f64()
          * 100.0
          * self.num_cpus as f64) as i64
      }
      _ => 0,
    };
    CpuUsage { usage_in_percents }
  }

  /// Aggregate host utilization over the last second, as a
  /// fraction in [0, 1]. The smoothed queue length is filled in
  /// by the controller.
  pub fn get_host_usage(&self) -> HostCpuUsage {
    let state = self.state.lock().unwrap();
    let (Some(current), Some(previous)) =
      (&state.current_host, &state.previous_host)
    else {
      return HostCpuUsage::default();
    };

    let (Some(delta_sum), Some(delta_idle)) = (
      current.total().checked_sub(previous.total()),
      current.idle.checked_sub(previous.idle),
    ) else {
      return HostCpuUsage::default();
    };
    if delta_sum.is_zero() {
      return HostCpuUsage::default();
    }
    // Some counters (iowait) can regress, which would make the
    // idle delta exceed the total one.
    let Some(busy) = delta_sum.checked_sub(delta_idle) else {
      return HostCpuUsage::default();
    };

    HostCpuUsage {
      usage: busy.as_secs_f64() / delta_sum.as_secs_f64(),
      amount: self.num_cpus as i64,
      queue_length_exponentially_smoothed: 0.0,
    }
  }

  /// Containers with a live sampling task.
  pub fn monitored_containers(&self) -> Vec<String> {
    let state = self.state.lock().unwrap();
    let mut ids =
      state.tasks.keys().cloned().collect::<Vec<_>>();
    ids.sort();
    ids
  }
}

#[cfg(test)]
mod tests {
  use std::path::Path;

  use super::*;
  use crate::{cgroup::CgroupLayout, config::CgroupSource};

  const ID: &str = "54dcd7413f5195b47";

  fn test_monitor() -> Arc<CpuUsageMonitor> {
    let layout = CgroupLayout {
      dir: Path::new("/nonexistent").to_path_buf(),
      source: CgroupSource::Docker,
      v2: false,
    };
    Arc::new(CpuUsageMonitor {
      num_cpus: 1,
      refresh: Duration::from_secs(20),
      cpu_stat: CpuStatReader::new(Path::new("/proc")).unwrap(),
      cgroup_stats: Arc::new(StatsReader::new(layout)),
      state: Default::default(),
    })
  }

  fn container_sample(cpu_ms: u64) -> CgroupStats {
    CgroupStats {
      cpu_usage: Duration::from_millis(cpu_ms),
      ..Default::default()
    }
  }

  fn install_samples(
    monitor: &CpuUsageMonitor,
    previous: (u64, u64),
    current: (u64, u64),
  ) {
    let mut state = monitor.state.lock().unwrap();
    state
      .previous_containers
      .insert(ID.to_string(), container_sample(previous.0));
    state
      .previous_host_sum
      .insert(ID.to_string(), Duration::from_millis(previous.1));
    state
      .current_containers
      .insert(ID.to_string(), container_sample(current.0));
    state
      .current_host_sum
      .insert(ID.to_string(), Duration::from_millis(current.1));
  }

  #[test]
  fn unknown_container_reads_zero() {
    let monitor = test_monitor();
    assert_eq!(
      monitor.get_container_usage(ID).usage_in_percents,
      0
    );
  }

  #[test]
  fn single_sample_reads_zero() {
    let monitor = test_monitor();
    {
      let mut state = monitor.state.lock().unwrap();
      state
        .current_containers
        .insert(ID.to_string(), container_sample(100));
      state
        .current_host_sum
        .insert(ID.to_string(), Duration::from_secs(10));
    }
    assert_eq!(
      monitor.get_container_usage(ID).usage_in_percents,
      0
    );
  }

  #[test]
  fn two_samples_give_the_dual_delta_percent() {
    let monitor = test_monitor();
    // Container burned 100ms while the host burned 1s: 10% of
    // one CPU.
    install_samples(&monitor, (100, 10_000), (200, 11_000));
    assert_eq!(
      monitor.get_container_usage(ID).usage_in_percents,
      10
    );
  }

  #[test]
  fn percent_scales_with_the_cpu_count() {
    let monitor = test_monitor();
    let monitor = Arc::into_inner(monitor).unwrap();
    let monitor = CpuUsageMonitor {
      num_cpus: 4,
      ..monitor
    };
    install_samples(&monitor, (100, 10_000), (200, 11_000));
    assert_eq!(
      monitor.get_container_usage(ID).usage_in_percents,
      40
    );
  }

  #[test]
  fn negative_deltas_read_zero() {
    let monitor = test_monitor();
    // Counter went backwards, e.g. the container restarted.
    install_samples(&monitor, (200, 10_000), (100, 11_000));
    assert_eq!(
      monitor.get_container_usage(ID).usage_in_percents,
      0
    );
    install_samples(&monitor, (100, 11_000), (200, 10_000));
    assert_eq!(
      monitor.get_container_usage(ID).usage_in_percents,
      0
    );
  }

  fn host_times(user_s: u64, idle_s: u64) -> CpuTimes {
    CpuTimes {
      name: "cpu".to_string(),
      user: Duration::from_secs(user_s),
      idle: Duration::from_secs(idle_s),
      ..Default::default()
    }
  }

  #[test]
  fn host_usage_is_the_busy_fraction() {
    let monitor = test_monitor();
    {
      let mut state = monitor.state.lock().unwrap();
      state.previous_host = Some(host_times(1, 9));
      state.current_host = Some(host_times(2, 18));
    }
    let usage = monitor.get_host_usage();
    assert!((usage.usage - 0.1).abs() < 1e-9);
    assert_eq!(usage.amount, 1);
  }

  #[test]
  fn host_usage_without_two_samples_is_zero() {
    let monitor = test_monitor();
    assert_eq!(monitor.get_host_usage(), HostCpuUsage::default());
    monitor.state.lock().unwrap().current_host =
      Some(host_times(1, 9));
    assert_eq!(monitor.get_host_usage(), HostCpuUsage::default());
  }

  #[tokio::test(start_paused = true)]
  async fn stop_cancels_the_container_task() {
    let monitor = test_monitor();
    let root = CancellationToken::new();
    monitor.start_container_task(ID.to_string(), &root);
    let token = monitor
      .state
      .lock()
      .unwrap()
      .tasks
      .get(ID)
      .cloned()
      .unwrap();
    assert!(!token.is_cancelled());

    monitor.stop_container_task(ID);
    assert!(token.is_cancelled());
    assert!(monitor.monitored_containers().is_empty());
    // Stop is idempotent.
    monitor.stop_container_task(ID);
  }

  #[tokio::test(start_paused = true)]
  async fn restart_replaces_and_cancels_the_previous_task() {
    let monitor = test_monitor();
    let root = CancellationToken::new();
    monitor.start_container_task(ID.to_string(), &root);
    let first = monitor
      .state
      .lock()
      .unwrap()
      .tasks
      .get(ID)
      .cloned()
      .unwrap();
    monitor.start_container_task(ID.to_string(), &root);
    assert!(first.is_cancelled());
    assert_eq!(monitor.monitored_containers(), vec![ID]);
  }

  #[tokio::test(start_paused = true)]
  async fn root_cancellation_reaches_container_tasks() {
    let monitor = test_monitor();
    let root = CancellationToken::new();
    monitor.start_container_task(ID.to_string(), &root);
    let token = monitor
      .state
      .lock()
      .unwrap()
      .tasks
      .get(ID)
      .cloned()
      .unwrap();
    root.cancel();
    assert!(token.is_cancelled());
  }
}
