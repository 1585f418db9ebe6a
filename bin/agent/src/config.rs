use std::{path::PathBuf, sync::OnceLock, time::Duration};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "dockwatch", version)]
pub struct CliArgs {
  /// Mount diagnostics routes under /debug
  #[arg(long)]
  pub profile: bool,

  /// Internal re-exec mode: enter the network namespace of PID,
  /// print the host-side interface index of its eth0 peer on
  /// stdout and exit.
  #[arg(long = "ns-iface-id", value_name = "PID")]
  pub ns_iface_id: Option<String>,
}

/// Environment of the agent. Every field can be left unset, the
/// defaults match a stock docker host.
#[derive(Debug, Deserialize)]
pub struct Env {
  #[serde(default = "default_docker_url")]
  pub docker_url: String,
  #[serde(default = "default_port")]
  pub port: u16,
  /// Sampling period of the per-container monitors, in seconds.
  #[serde(default = "default_refresh_time")]
  pub refresh_time: u64,
  #[serde(default)]
  pub cgroup_source: CgroupSource,
  #[serde(default = "default_cgroup_dir")]
  pub cgroup_dir: PathBuf,
  #[serde(default = "default_proc_dir")]
  pub proc_dir: PathBuf,
  /// `1` / `true` enables debug logging.
  pub debug: Option<String>,
  /// `0` / `false` disables the network monitor.
  pub net_monitoring: Option<String>,
  /// Basic auth is enabled when both `HTTP_USERNAME` and
  /// `HTTP_PASSWORD` are set.
  pub http_username: Option<String>,
  pub http_password: Option<String>,
  #[serde(default = "default_queue_length_sampling_interval")]
  pub queue_length_sampling_interval: String,
  #[serde(default = "default_queue_length_points_per_sample")]
  pub queue_length_points_per_sample: usize,
  #[serde(default = "default_queue_length_elements_needed")]
  pub queue_length_elements_needed: usize,
}

fn default_docker_url() -> String {
  String::from("http://127.0.0.1:4243")
}

fn default_port() -> u16 {
  4244
}

fn default_refresh_time() -> u64 {
  20
}

fn default_cgroup_dir() -> PathBuf {
  PathBuf::from("/sys/fs/cgroup")
}

fn default_proc_dir() -> PathBuf {
  PathBuf::from("/proc")
}

fn default_queue_length_sampling_interval() -> String {
  String::from("5s")
}

fn default_queue_length_points_per_sample() -> usize {
  5
}

fn default_queue_length_elements_needed() -> usize {
  6
}

/// Layout convention of the container cgroups under CGROUP_DIR.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CgroupSource {
  /// `docker/<id>` under each controller.
  #[default]
  Docker,
  /// `system.slice/docker-<id>.scope`.
  Systemd,
}

#[derive(Debug)]
pub struct AgentConfig {
  pub docker_url: String,
  pub port: u16,
  pub refresh_time: Duration,
  pub cgroup_source: CgroupSource,
  /// Unified (v2) hierarchy detected at CGROUP_DIR.
  pub cgroup_v2: bool,
  pub cgroup_dir: PathBuf,
  pub proc_dir: PathBuf,
  pub debug: bool,
  pub net_monitoring: bool,
  pub basic_auth: Option<(String, String)>,
  pub queue_sampling_interval: Duration,
  pub queue_points_per_sample: usize,
  pub queue_elements_needed: usize,
}

pub fn agent_config() -> &'static AgentConfig {
  static AGENT_CONFIG: OnceLock<AgentConfig> = OnceLock::new();
  AGENT_CONFIG.get_or_init(|| {
    load_config(
      envy::from_env().expect("failed to parse agent environment"),
    )
    .expect("failed to load agent configuration")
  })
}

fn load_config(env: Env) -> anyhow::Result<AgentConfig> {
  let queue_sampling_interval =
    humantime::parse_duration(&env.queue_length_sampling_interval)
      .context("parse QUEUE_LENGTH_SAMPLING_INTERVAL")?;
  let cgroup_v2 =
    env.cgroup_dir.join("cgroup.controllers").exists();
  Ok(AgentConfig {
    refresh_time: Duration::from_secs(env.refresh_time),
    cgroup_v2,
    debug: flag(env.debug.as_deref(), false),
    net_monitoring: flag(env.net_monitoring.as_deref(), true),
    basic_auth: match (env.http_username, env.http_password) {
      (Some(username), Some(password)) => {
        Some((username, password))
      }
      _ => None,
    },
    queue_sampling_interval,
    queue_points_per_sample: env.queue_length_points_per_sample,
    queue_elements_needed: env.queue_length_elements_needed,
    docker_url: env.docker_url,
    port: env.port,
    cgroup_source: env.cgroup_source,
    cgroup_dir: env.cgroup_dir,
    proc_dir: env.proc_dir,
  })
}

fn flag(value: Option<&str>, default: bool) -> bool {
  match value {
    Some("1") | Some("true") => true,
    Some("0") | Some("false") => false,
    _ => default,
  }
}
