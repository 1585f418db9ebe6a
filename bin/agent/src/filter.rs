use std::{
  collections::VecDeque,
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use anyhow::bail;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Source of one scalar sample per call.
pub trait MetricsReader: Send + Sync + 'static {
  fn read(&self) -> anyhow::Result<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("not enough metrics yet")]
pub struct NotEnoughMetrics;

/// Running average of a metric, exponentially smoothed over a
/// bounded history.
///
/// Every `average_interval / average_length` a sample is read and
/// accumulated; each time `average_interval` elapses the window's
/// arithmetic mean is appended to the history queue, whose oldest
/// entry is dropped past `queue_length`.
pub struct ExponentialSmoothing {
  reader: Box<dyn MetricsReader>,
  average_length: usize,
  average_interval: Duration,
  queue_length: usize,
  queue: Mutex<VecDeque<f64>>,
  stopped: AtomicBool,
}

impl ExponentialSmoothing {
  pub fn new(
    reader: impl MetricsReader,
    average_length: usize,
    average_interval: Duration,
    queue_length: usize,
  ) -> anyhow::Result<Arc<ExponentialSmoothing>> {
    if queue_length == 0 {
      bail!(
        "queue length should be > 0, current value: {queue_length}"
      );
    }
    if average_length == 0 {
      bail!(
        "average length should be > 0, current value: {average_length}"
      );
    }
    if average_interval <= Duration::from_millis(1) {
      bail!(
        "average interval should be > 1ms, current value: {average_interval:?}"
      );
    }
    Ok(Arc::new(ExponentialSmoothing {
      reader: Box::new(reader),
      average_length,
      average_interval,
      queue_length,
      queue: Mutex::new(VecDeque::new()),
      stopped: AtomicBool::new(false),
    }))
  }

  /// Run the sampling loop until cancelled or [stopped](Self::stop).
  pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
    let filter = self.clone();
    tokio::spawn(async move { filter.run(cancel).await });
  }

  async fn run(&self, cancel: CancellationToken) {
    let slot = self.average_interval / self.average_length as u32;
    let mut window = Vec::with_capacity(self.average_length);
    let mut next_sample = Instant::now() + slot;
    let mut last_average = Instant::now();
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep_until(next_sample) => {}
      }
      if self.stopped.load(Ordering::Relaxed) {
        return;
      }
      next_sample += slot;

      match self.reader.read() {
        Ok(value) => window.push(value),
        Err(e) => {
          error!("failed to fetch metrics | {e:#}");
          continue;
        }
      }

      if last_average.elapsed() >= self.average_interval
        && !window.is_empty()
      {
        let mean =
          window.iter().sum::<f64>() / window.len() as f64;
        self.append(mean);
        window.clear();
        last_average = Instant::now();
      }
    }
  }

  fn append(&self, value: f64) {
    let mut queue = self.queue.lock().unwrap();
    queue.push_back(value);
    while queue.len() > self.queue_length {
      queue.pop_front();
    }
  }

  /// Exponentially smoothed value over the whole history. Fails
  /// until `queue_length` windows have been accumulated.
  pub fn read(&self) -> Result<f64, NotEnoughMetrics> {
    let values = self
      .queue
      .lock()
      .unwrap()
      .iter()
      .copied()
      .collect::<Vec<_>>();
    if values.len() < self.queue_length {
      return Err(NotEnoughMetrics);
    }
    Ok(smooth(&values))
  }

  /// Stop the sampling loop. Idempotent; readers keep seeing the
  /// last history.
  pub fn stop(&self) {
    self.stopped.store(true, Ordering::Relaxed);
  }

  /// Current history, oldest first.
  pub fn snapshot(&self) -> Vec<f64> {
    self.queue.lock().unwrap().iter().copied().collect()
  }
}

/// s0 = v0, si = alpha * vi + (1 - alpha) * si-1, with
/// alpha = exp(-n). Recent windows weigh alpha, the accumulated
/// past weighs the rest.
fn smooth(values: &[f64]) -> f64 {
  let alpha = (-(values.len() as f64)).exp();
  values[1..]
    .iter()
    .fold(values[0], |acc, value| {
      alpha * value + (1.0 - alpha) * acc
    })
}
