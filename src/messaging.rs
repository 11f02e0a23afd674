use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

/// Upload path announces a freshly stored video.
pub const NEW_JOB_TOPIC: &str = "new-job";
/// Worker finished a job, successfully or not.
pub const JOB_COMPLETED_TOPIC: &str = "job.completed";
pub const PROGRESS_TOPIC: &str = "progress";

/// In-process publish/subscribe. Each subscription owns a bounded buffer; a subscriber whose
/// buffer is full misses the message.
pub struct Broker<T> {
  topics: RwLock<HashMap<String, Vec<mpsc::Sender<T>>>>,
  buffer_size: usize,
}

impl<T: Clone + Send + 'static> Broker<T> {
  pub fn new(buffer_size: usize) -> Self {
    Self {
      topics: RwLock::new(HashMap::new()),
      // tokio refuses zero-capacity channels
      buffer_size: buffer_size.max(1),
    }
  }

  pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<T> {
    let mut topics = self.topics.write();
    let subscribers = topics.entry(topic.to_string()).or_default();
    subscribers.retain(|tx| !tx.is_closed());

    let (tx, rx) = mpsc::channel(self.buffer_size);
    subscribers.push(tx);
    rx
  }

  pub fn publish(&self, topic: &str, payload: T) {
    let topics = self.topics.read();
    let Some(subscribers) = topics.get(topic) else {
      return;
    };

    for tx in subscribers {
      match tx.try_send(payload.clone()) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => trace!(topic, "subscriber buffer full, message dropped"),
        Err(TrySendError::Closed(_)) => {}
      }
    }
  }

  pub fn subscriber_count(&self, topic: &str) -> usize {
    self.topics
      .read()
      .get(topic)
      .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
      .unwrap_or(0)
  }
}
