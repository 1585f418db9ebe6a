//! Read-only HTTP client for the dockwatch agent API.

use anyhow::{Context, anyhow};
use serde::de::DeserializeOwned;

pub mod entities;

use entities::*;

#[derive(Clone)]
pub struct DockwatchClient {
  endpoint: String,
  credentials: Option<(String, String)>,
  http: reqwest::Client,
}

impl DockwatchClient {
  pub fn new(endpoint: impl Into<String>) -> DockwatchClient {
    DockwatchClient {
      endpoint: endpoint.into(),
      credentials: None,
      http: Default::default(),
    }
  }

  /// Attach HTTP Basic Auth credentials, for agents started with
  /// `HTTP_USERNAME` / `HTTP_PASSWORD`.
  pub fn with_basic_auth(
    mut self,
    username: impl Into<String>,
    password: impl Into<String>,
  ) -> DockwatchClient {
    self.credentials = Some((username.into(), password.into()));
    self
  }

  pub async fn memory(
    &self,
    container_id: &str,
  ) -> anyhow::Result<MemoryUsage> {
    self
      .get(&format!("/containers/{container_id}/mem"), &[])
      .await
  }

  pub async fn cpu(
    &self,
    container_id: &str,
  ) -> anyhow::Result<CpuUsage> {
    self
      .get(&format!("/containers/{container_id}/cpu"), &[])
      .await
  }

  pub async fn net(
    &self,
    container_id: &str,
  ) -> anyhow::Result<NetUsage> {
    self
      .get(&format!("/containers/{container_id}/net"), &[])
      .await
  }

  pub async fn usage(
    &self,
    container_id: &str,
  ) -> anyhow::Result<Usage> {
    self
      .get(&format!("/containers/{container_id}/usage"), &[])
      .await
  }

  pub async fn containers_usage(
    &self,
  ) -> anyhow::Result<ContainersUsage> {
    self.get("/containers/usage", &[]).await
  }

  /// Host CPU / memory aggregate. When `label` is given, only
  /// containers carrying that label key are accumulated into the
  /// memory figures.
  pub async fn host_usage(
    &self,
    label: Option<&str>,
  ) -> anyhow::Result<HostUsage> {
    let query = label
      .map(|label| vec![("include_container_if_label", label)])
      .unwrap_or_default();
    self.get("/host/usage", &query).await
  }

  async fn get<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, &str)],
  ) -> anyhow::Result<T> {
    let mut req = self
      .http
      .get(format!("{}{path}", self.endpoint))
      .query(query)
      .header("user-agent", "dockwatch-client");
    if let Some((username, password)) = &self.credentials {
      req = req.basic_auth(username, Some(password));
    }
    let res = req
      .send()
      .await
      .with_context(|| format!("request to {path} failed"))?;
    let status = res.status();
    if !status.is_success() {
      let body = res.text().await.unwrap_or_default();
      return Err(anyhow!("{path} returned {status}: {body}"));
    }
    res
      .json()
      .await
      .with_context(|| format!("parse {path} response body"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn basic_auth_is_optional() {
    let client = DockwatchClient::new("http://localhost:4244");
    assert!(client.credentials.is_none());
    let client = client.with_basic_auth("dockwatch", "secret");
    assert_eq!(
      client.credentials,
      Some(("dockwatch".to_string(), "secret".to_string()))
    );
  }
}
