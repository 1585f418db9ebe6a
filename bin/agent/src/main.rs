#[macro_use]
extern crate tracing;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use logger::{LogConfig, LogLevel};
use tokio_util::sync::CancellationToken;

mod api;
mod cgroup;
mod config;
mod cpu;
mod docker;
mod filter;
mod mem;
mod net;
mod netns;
mod procfs;

use crate::{
  api::Controller,
  cgroup::{CgroupLayout, StatsReader},
  config::{CliArgs, agent_config},
  cpu::CpuUsageMonitor,
  docker::{DockerClient, events::EventBus},
  filter::ExponentialSmoothing,
  mem::MemoryUsageGetter,
  net::NetMonitor,
  procfs::{CpuStatReader, MemInfoReader, RunningProcsReader},
};

fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let args = CliArgs::parse();

  // Child mode: print the interface index on stdout and exit,
  // before any runtime or logging starts.
  if let Some(pid) = &args.ns_iface_id {
    let index = netns::ns_iface_index(pid)?;
    print!("{index}");
    return Ok(());
  }

  run(args)
}

#[tokio::main]
async fn run(args: CliArgs) -> anyhow::Result<()> {
  let config = agent_config();
  logger::init(&LogConfig {
    level: if config.debug {
      LogLevel::Debug
    } else {
      LogLevel::Info
    },
    ..Default::default()
  })?;

  info!("dockwatch agent v{}", env!("CARGO_PKG_VERSION"));
  debug!("{config:?}");

  let cancel = CancellationToken::new();
  spawn_shutdown_listener(cancel.clone());

  let docker = Arc::new(DockerClient::new(&config.docker_url)?);
  let bus = EventBus::new(docker.clone());
  bus.spawn(cancel.clone());

  let cgroup_stats = Arc::new(StatsReader::new(
    CgroupLayout::from_config(config),
  ));

  let cpu_monitor = CpuUsageMonitor::new(
    CpuStatReader::new(&config.proc_dir)?,
    cgroup_stats.clone(),
    config.refresh_time,
  );
  cpu_monitor.spawn(&bus, cancel.clone()).await;

  let net_monitor = if config.net_monitoring {
    let monitor = NetMonitor::new(
      &config.proc_dir,
      cgroup_stats.clone(),
      config.refresh_time,
    );
    monitor.spawn(&bus, cancel.clone()).await;
    Some(monitor)
  } else {
    info!("network monitoring is disabled");
    None
  };

  let queue = ExponentialSmoothing::new(
    RunningProcsReader::new(&config.proc_dir),
    config.queue_points_per_sample,
    config.queue_sampling_interval,
    config.queue_elements_needed,
  )?;
  queue.spawn(cancel.clone());

  let controller = Arc::new(Controller {
    docker,
    mem: MemoryUsageGetter::new(cgroup_stats),
    cpu: cpu_monitor,
    net: net_monitor,
    queue,
    meminfo: MemInfoReader::new(&config.proc_dir),
  });
  let app = api::router(
    controller,
    config.basic_auth.clone(),
    args.profile,
  );

  let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .with_context(|| format!("bind {addr}"))?;
  info!("dockwatch agent listening on {addr}");
  let shutdown = cancel.clone();
  axum::serve(listener, app)
    .with_graceful_shutdown(async move {
      shutdown.cancelled().await
    })
    .await
    .context("serve api")
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
  tokio::spawn(async move {
    let mut terminate = tokio::signal::unix::signal(
      tokio::signal::unix::SignalKind::terminate(),
    )
    .expect("install SIGTERM handler");
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!("received SIGINT, shutting down")
      }
      _ = terminate.recv() => {
        info!("received SIGTERM, shutting down")
      }
    }
    cancel.cancel();
  });
}
