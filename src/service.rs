use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ledger::JobLedger;
use crate::messaging::{Broker, JOB_COMPLETED_TOPIC, NEW_JOB_TOPIC};
use crate::models::Job;
use crate::worker::{JobQueue, WorkerPool};
use crate::worker_processing::TranscodePipeline;
use crate::worker_scheduler::Scheduler;

/// Scheduler and worker pool sharing one bounded job channel.
pub struct TranscodeService {
  pipeline: Arc<TranscodePipeline>,
  events: Arc<Broker<Job>>,
  pool: WorkerPool,
}

pub struct ServiceHandle {
  tasks: JoinSet<()>,
  cancel: CancellationToken,
  queue: JobQueue,
  ledger: Arc<dyn JobLedger>,
}

impl TranscodeService {
  pub fn new(pipeline: Arc<TranscodePipeline>, events: Arc<Broker<Job>>, workers: usize) -> Self {
    Self {
      pipeline,
      events,
      pool: WorkerPool::new(workers),
    }
  }

  /// Subscribes before returning, so every event published afterwards is seen.
  pub fn start(&self, cancel: CancellationToken) -> ServiceHandle {
    let new_jobs = self.events.subscribe(NEW_JOB_TOPIC);
    let completed = self.events.subscribe(JOB_COMPLETED_TOPIC);
    let (queue_tx, queue_rx) = mpsc::channel(self.pool.size());
    let queue: JobQueue = Arc::new(Mutex::new(queue_rx));
    let ledger = self.pipeline.ledger().clone();

    let mut tasks = JoinSet::new();
    let scheduler = Scheduler::new(ledger.clone(), queue_tx);
    tasks.spawn(scheduler.run(new_jobs, completed, cancel.clone()));
    self.pool.spawn(
      &mut tasks,
      queue.clone(),
      self.pipeline.clone(),
      self.events.clone(),
      cancel.clone(),
    );

    ServiceHandle { tasks, cancel, queue, ledger }
  }
}

impl ServiceHandle {
  pub fn shutdown(&self) {
    self.cancel.cancel();
  }

  /// Waits for the scheduler and every worker to exit, then hands jobs that were claimed but
  /// never picked up back to Pending.
  pub async fn join(mut self) {
    while let Some(res) = self.tasks.join_next().await {
      if let Err(e) = res {
        error!("Transcode task ended abnormally: {e}");
      }
    }

    let mut queue = self.queue.lock().await;
    queue.close();
    let mut released = 0usize;
    while let Ok(job) = queue.try_recv() {
      match self.ledger.release(job.node_id).await {
        Ok(()) => released += 1,
        Err(e) => error!(node_id = %job.node_id, "Failed to release queued job: {e:#}"),
      }
    }
    info!(released, "Transcode service stopped");
  }
}
