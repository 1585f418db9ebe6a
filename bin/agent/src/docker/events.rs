use std::{collections::HashMap, sync::Arc, time::Duration};

use bollard::{
  models::EventMessage, query_parameters::EventsOptions,
};
use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::docker::{Container, DockerClient};

// Engine restarts can take dozens of seconds, an immediate
// reconnect loop would spin. Plain end-of-stream retries fast,
// anything else backs off.
const EOF_RETRY: Duration = Duration::from_millis(250);
const ERROR_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
  Start,
  Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
  pub container_id: String,
  pub action: ContainerAction,
}

impl ContainerEvent {
  fn start(container_id: impl Into<String>) -> ContainerEvent {
    ContainerEvent {
      container_id: container_id.into(),
      action: ContainerAction::Start,
    }
  }
}

/// Multiplexes the engine's container lifecycle events to any
/// number of subscribers. Constructed once in main and handed to
/// the monitors.
pub struct EventBus {
  docker: Arc<DockerClient>,
  subscribers: Mutex<Vec<mpsc::Sender<ContainerEvent>>>,
}

impl EventBus {
  pub fn new(docker: Arc<DockerClient>) -> Arc<EventBus> {
    Arc::new(EventBus {
      docker,
      subscribers: Mutex::new(Vec::new()),
    })
  }

  /// Register a new subscriber. The engine's current container
  /// list is replayed to it as synthetic start events, so late
  /// subscribers bootstrap exactly like early ones.
  pub async fn subscribe(
    self: &Arc<Self>,
  ) -> mpsc::Receiver<ContainerEvent> {
    let (tx, rx) = self.register().await;
    let bus = self.clone();
    tokio::spawn(async move {
      match bus.docker.list_containers().await {
        Ok(containers) => replay(containers, tx).await,
        Err(e) => {
          warn!("failed to list containers for bootstrap | {e:#}")
        }
      }
    });
    rx
  }

  async fn register(
    &self,
  ) -> (mpsc::Sender<ContainerEvent>, mpsc::Receiver<ContainerEvent>)
  {
    let (tx, rx) = mpsc::channel(1);
    self.subscribers.lock().await.push(tx.clone());
    (tx, rx)
  }

  /// Deliver one event to every subscriber. Sends block when a
  /// subscriber's buffer is full: slow consumers hold up the
  /// whole fan-out, they must drain promptly.
  async fn broadcast(&self, event: ContainerEvent) {
    let mut subscribers = self.subscribers.lock().await;
    let mut closed = Vec::new();
    for (i, tx) in subscribers.iter().enumerate() {
      if tx.send(event.clone()).await.is_err() {
        closed.push(i);
      }
    }
    for i in closed.into_iter().rev() {
      subscribers.remove(i);
    }
  }

  /// Run the engine listener until cancelled. The agent outlives
  /// the engine: on stream end or error it reconnects forever.
  pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
    let bus = self.clone();
    tokio::spawn(async move { bus.listen(cancel).await });
  }

  async fn listen(&self, cancel: CancellationToken) {
    loop {
      let mut events = self.docker.lifecycle_events();
      let retry = loop {
        tokio::select! {
          _ = cancel.cancelled() => return,
          next = events.next() => match next {
            Some(Ok(event)) => {
              if let Some(event) = convert_event(event) {
                self.broadcast(event).await;
              }
            }
            Some(Err(e)) => {
              error!(
                "container event stream error, retrying in {:?} | {e:#}",
                ERROR_RETRY
              );
              break ERROR_RETRY;
            }
            None => {
              info!(
                "container event stream closed, retrying in {:?}",
                EOF_RETRY
              );
              break EOF_RETRY;
            }
          }
        }
      };
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(retry) => {}
      }
    }
  }
}

async fn replay(
  containers: Vec<Container>,
  tx: mpsc::Sender<ContainerEvent>,
) {
  for container in containers {
    if tx.send(ContainerEvent::start(container.id)).await.is_err()
    {
      return;
    }
  }
}

fn convert_event(event: EventMessage) -> Option<ContainerEvent> {
  let action = match event.action.as_deref() {
    Some("start") => ContainerAction::Start,
    Some("stop") => ContainerAction::Stop,
    _ => return None,
  };
  Some(ContainerEvent {
    container_id: event.actor?.id?,
    action,
  })
}

impl DockerClient {
  /// Start / stop events for containers, from the engine's event
  /// endpoint.
  fn lifecycle_events(
    &self,
  ) -> impl Stream<
    Item = Result<EventMessage, bollard::errors::Error>,
  > + '_ {
    let filters = HashMap::from([
      ("type".to_string(), vec!["container".to_string()]),
      (
        "event".to_string(),
        vec!["start".to_string(), "stop".to_string()],
      ),
    ]);
    self.docker.events(Some(EventsOptions {
      filters: Some(filters),
      ..Default::default()
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_bus() -> Arc<EventBus> {
    // The lazy http transport never connects until used, which
    // these tests do not.
    let docker = Arc::new(
      DockerClient::new("http://127.0.0.1:4243").unwrap(),
    );
    EventBus::new(docker)
  }

  fn start(id: &str) -> ContainerEvent {
    ContainerEvent::start(id)
  }

  fn stop(id: &str) -> ContainerEvent {
    ContainerEvent {
      container_id: id.to_string(),
      action: ContainerAction::Stop,
    }
  }

  #[tokio::test]
  async fn broadcast_delivers_to_every_subscriber_in_order() {
    let bus = test_bus();
    let (_tx1, mut rx1) = bus.register().await;
    let (_tx2, mut rx2) = bus.register().await;

    let sender = bus.clone();
    tokio::spawn(async move {
      sender.broadcast(start("a")).await;
      sender.broadcast(start("b")).await;
      sender.broadcast(stop("a")).await;
    });

    // Drain both receivers in lock step: the buffers only hold
    // one event and the fan-out blocks until they make room.
    for expected in [start("a"), start("b"), stop("a")] {
      assert_eq!(rx1.recv().await.unwrap(), expected);
      assert_eq!(rx2.recv().await.unwrap(), expected);
    }
  }

  #[tokio::test]
  async fn closed_subscribers_are_pruned() {
    let bus = test_bus();
    let (_tx1, rx1) = bus.register().await;
    let (_tx2, mut rx2) = bus.register().await;
    drop(rx1);

    let sender = bus.clone();
    tokio::spawn(async move {
      sender.broadcast(start("a")).await;
    });
    assert_eq!(rx2.recv().await.unwrap(), start("a"));
    assert_eq!(bus.subscribers.lock().await.len(), 1);
  }

  #[tokio::test]
  async fn replay_emits_synthetic_starts_in_list_order() {
    let containers = vec![
      Container {
        id: "a".to_string(),
        ..Default::default()
      },
      Container {
        id: "b".to_string(),
        ..Default::default()
      },
    ];
    let (tx, mut rx) = mpsc::channel(1);
    tokio::spawn(replay(containers, tx));
    assert_eq!(rx.recv().await.unwrap(), start("a"));
    assert_eq!(rx.recv().await.unwrap(), start("b"));
    assert!(rx.recv().await.is_none());
  }

  #[test]
  fn converts_known_actions_only() {
    let event = |action: &str| EventMessage {
      action: Some(action.to_string()),
      actor: Some(bollard::models::EventActor {
        id: Some("abc".to_string()),
        ..Default::default()
      }),
      ..Default::default()
    };
    assert_eq!(convert_event(event("start")), Some(start("abc")));
    assert_eq!(convert_event(event("stop")), Some(stop("abc")));
    assert_eq!(convert_event(event("die")), None);
  }
}
