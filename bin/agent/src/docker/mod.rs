use std::collections::HashMap;

use anyhow::Context;
use bollard::{
  Docker, query_parameters::ListContainersOptions,
};

pub mod events;

/// A running container, reduced to what the monitors need.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
  pub id: String,
  pub labels: HashMap<String, String>,
}

pub struct DockerClient {
  docker: Docker,
}

impl DockerClient {
  pub fn new(url: &str) -> anyhow::Result<DockerClient> {
    let docker = if url.starts_with("unix://") {
      Docker::connect_with_unix(
        url,
        120,
        bollard::API_DEFAULT_VERSION,
      )
    } else {
      Docker::connect_with_http(
        url,
        120,
        bollard::API_DEFAULT_VERSION,
      )
    }
    .with_context(|| {
      format!("connect to container engine at {url}")
    })?;
    Ok(DockerClient { docker })
  }

  /// Currently running containers.
  pub async fn list_containers(
    &self,
  ) -> anyhow::Result<Vec<Container>> {
    let containers = self
      .docker
      .list_containers(None::<ListContainersOptions>)
      .await
      .context("list containers")?;
    Ok(
      containers
        .into_iter()
        .filter_map(|container| {
          Some(Container {
            id: container.id?,
            labels: container.labels.unwrap_or_default(),
          })
        })
        .collect(),
    )
  }
}
