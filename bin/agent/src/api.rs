use std::sync::Arc;

use anyhow::Context;
use axum::{
  Json, Router,
  extract::{Path, Query, Request, State},
  http::{StatusCode, header},
  middleware::{self, Next},
  response::{IntoResponse, Response},
  routing::get,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use dockwatch_client::entities::{
  ContainersUsage, CpuUsage, HostMemoryUsage, HostUsage,
  MemoryUsage, NetUsage, Usage,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
  cpu::CpuUsageMonitor, docker::DockerClient,
  filter::ExponentialSmoothing, mem::MemoryUsageGetter,
  net::NetMonitor, procfs::MemInfoReader,
};

/// Translates API calls into calls on the monitors. The
/// controller depends on the monitors, never the other way
/// around.
pub struct Controller {
  pub docker: Arc<DockerClient>,
  pub mem: MemoryUsageGetter,
  pub cpu: Arc<CpuUsageMonitor>,
  pub net: Option<Arc<NetMonitor>>,
  pub queue: Arc<ExponentialSmoothing>,
  pub meminfo: MemInfoReader,
}

pub fn router(
  controller: Arc<Controller>,
  basic_auth: Option<(String, String)>,
  profile: bool,
) -> Router {
  let mut router = Router::new()
    .route("/containers/{id}/mem", get(container_mem))
    .route("/containers/{id}/cpu", get(container_cpu))
    .route("/containers/{id}/net", get(container_net))
    .route("/containers/{id}/usage", get(container_usage))
    .route("/containers/usage", get(containers_usage))
    .route("/host/usage", get(host_usage));
  if profile {
    router = router.route("/debug/state", get(debug_state));
  }
  let mut router =
    router.fallback(not_found).with_state(controller);
  if let Some((username, password)) = basic_auth {
    let expected = authorization_header(&username, &password);
    router = router.layer(middleware::from_fn(
      move |req: Request, next: Next| {
        let expected = expected.clone();
        async move { basic_auth_guard(expected, req, next).await }
      },
    ));
  }
  router
}

fn authorization_header(
  username: &str,
  password: &str,
) -> String {
  format!(
    "Basic {}",
    STANDARD.encode(format!("{username}:{password}"))
  )
}

async fn basic_auth_guard(
  expected: String,
  req: Request,
  next: Next,
) -> Response {
  let provided = req
    .headers()
    .get(header::AUTHORIZATION)
    .and_then(|value| value.to_str().ok());
  if provided == Some(expected.as_str()) {
    next.run(req).await
  } else {
    (
      StatusCode::UNAUTHORIZED,
      [(header::WWW_AUTHENTICATE, "Basic realm=\"dockwatch\"")],
      Json(json!({ "error": "unauthorized" })),
    )
      .into_response()
  }
}

async fn not_found() -> impl IntoResponse {
  (
    StatusCode::NOT_FOUND,
    Json(json!({ "error": "not found" })),
  )
}

async fn container_mem(
  State(controller): State<Arc<Controller>>,
  Path(id): Path<String>,
) -> serror::Result<Json<MemoryUsage>> {
  let usage = controller
    .mem
    .get_memory_usage(&id)
    .context("get container memory usage")?;
  Ok(Json(usage))
}

async fn container_cpu(
  State(controller): State<Arc<Controller>>,
  Path(id): Path<String>,
) -> Json<CpuUsage> {
  Json(controller.cpu.get_container_usage(&id))
}

async fn container_net(
  State(controller): State<Arc<Controller>>,
  Path(id): Path<String>,
) -> serror::Result<Json<NetUsage>> {
  let usage = net_monitor(&controller)?
    .get_usage(&id)
    .context("get container network usage")?;
  Ok(Json(usage))
}

async fn container_usage(
  State(controller): State<Arc<Controller>>,
  Path(id): Path<String>,
) -> serror::Result<Json<Usage>> {
  let memory = controller
    .mem
    .get_memory_usage(&id)
    .context("get container memory usage")?;
  let cpu = controller.cpu.get_container_usage(&id);
  let net = match &controller.net {
    Some(monitor) => Some(
      monitor
        .get_usage(&id)
        .context("get container network usage")?,
    ),
    None => None,
  };
  Ok(Json(Usage {
    memory: Some(memory),
    cpu: Some(cpu),
    net,
    labels: None,
  }))
}

/// Best effort over the engine's container list: a container
/// whose stats fail is logged and skipped, it never poisons the
/// whole response.
async fn containers_usage(
  State(controller): State<Arc<Controller>>,
) -> serror::Result<Json<ContainersUsage>> {
  let containers = controller
    .docker
    .list_containers()
    .await
    .context("list containers")?;
  let mut usages = ContainersUsage::new();
  for container in containers {
    let memory =
      match controller.mem.get_memory_usage(&container.id) {
        Ok(memory) => memory,
        Err(e) => {
          warn!(
            "failed to get memory usage of '{}' | {e:#}",
            container.id
          );
          continue;
        }
      };
    let net = match &controller.net {
      Some(monitor) => match monitor.get_usage(&container.id) {
        Ok(net) => Some(net),
        Err(e) => {
          warn!(
            "failed to get network usage of '{}' | {e:#}",
            container.id
          );
          continue;
        }
      },
      None => None,
    };
    usages.insert(
      container.id.clone(),
      Usage {
        memory: Some(memory),
        cpu: Some(controller.cpu.get_container_usage(&container.id)),
        net,
        labels: Some(container.labels),
      },
    );
  }
  Ok(Json(usages))
}

#[derive(Deserialize)]
struct HostUsageQuery {
  include_container_if_label: Option<String>,
}

async fn host_usage(
  State(controller): State<Arc<Controller>>,
  Query(query): Query<HostUsageQuery>,
) -> serror::Result<Json<HostUsage>> {
  let mut cpu = controller.cpu.get_host_usage();
  // The filter needs a full history before it has an opinion,
  // report zero until then.
  cpu.queue_length_exponentially_smoothed =
    controller.queue.read().unwrap_or(0.0);

  let meminfo = controller
    .meminfo
    .read()
    .context("get host memory usage")?;
  let mut memory = HostMemoryUsage {
    free: to_mb(meminfo.free_buffers()),
    total: to_mb(meminfo.mem_total),
    swap: to_mb(meminfo.swap_used()),
    ..Default::default()
  };

  let containers = controller
    .docker
    .list_containers()
    .await
    .context("list containers")?;
  let mut totals = MemoryUsage::default();
  for container in containers {
    if let Some(label) = &query.include_container_if_label {
      if !container.labels.contains_key(label) {
        continue;
      }
    }
    match controller.mem.get_memory_usage(&container.id) {
      Ok(usage) => {
        totals.memory_usage += usage.memory_usage;
        totals.memory_limit =
          totals.memory_limit.saturating_add(usage.memory_limit);
        totals.max_memory_usage += usage.max_memory_usage;
        totals.swap_usage += usage.swap_usage;
        totals.swap_limit =
          totals.swap_limit.saturating_add(usage.swap_limit);
        totals.max_swap_usage += usage.max_swap_usage;
      }
      Err(e) => warn!(
        "failed to get memory usage of '{}' | {e:#}",
        container.id
      ),
    }
  }
  memory.memory_usage = to_mb(totals.memory_usage as u64);
  memory.memory_committed = to_mb(totals.memory_limit as u64);
  memory.max_memory_usage = to_mb(totals.max_memory_usage as u64);
  memory.swap_usage = to_mb(totals.swap_usage as u64);
  memory.swap_committed = to_mb(totals.swap_limit as u64);
  memory.max_swap_usage = to_mb(totals.max_swap_usage as u64);

  Ok(Json(HostUsage { cpu, memory }))
}

async fn debug_state(
  State(controller): State<Arc<Controller>>,
) -> Json<serde_json::Value> {
  Json(json!({
    "monitored_containers": controller.cpu.monitored_containers(),
    "interface_mappings": controller
      .net
      .as_ref()
      .map(|net| net.interface_mappings()),
    "queue_history": controller.queue.snapshot(),
  }))
}

fn net_monitor(
  controller: &Controller,
) -> anyhow::Result<&Arc<NetMonitor>> {
  controller
    .net
    .as_ref()
    .context("network monitoring is disabled")
}

fn to_mb(bytes: u64) -> u64 {
  bytes / 1024 / 1024
}
