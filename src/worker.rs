use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::messaging::{Broker, JOB_COMPLETED_TOPIC};
use crate::models::Job;
use crate::worker_processing::{JobOutcome, PipelineError, TranscodePipeline};

pub type JobQueue = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Fixed set of workers draining the shared job channel.
pub struct WorkerPool {
  workers: usize,
}

impl WorkerPool {
  pub fn new(workers: usize) -> Self {
    Self { workers: workers.max(1) }
  }

  pub fn size(&self) -> usize {
    self.workers
  }

  pub fn spawn(
    &self,
    tasks: &mut JoinSet<()>,
    queue: JobQueue,
    pipeline: Arc<TranscodePipeline>,
    events: Arc<Broker<Job>>,
    cancel: CancellationToken,
  ) {
    info!("Starting worker pool with {} workers", self.workers);
    for worker_id in 0..self.workers {
      tasks.spawn(run_worker(
        worker_id,
        queue.clone(),
        pipeline.clone(),
        events.clone(),
        cancel.clone(),
      ));
    }
  }
}

async fn run_worker(
  worker_id: usize,
  queue: JobQueue,
  pipeline: Arc<TranscodePipeline>,
  events: Arc<Broker<Job>>,
  cancel: CancellationToken,
) {
  debug!(worker_id, "Worker started");
  loop {
    let job = tokio::select! {
      _ = cancel.cancelled() => break,
      job = async { queue.lock().await.recv().await } => match job {
        Some(job) => job,
        None => break,
      },
    };

    info!(worker_id, node_id = %job.node_id, "Processing job");
    match pipeline.run(job, worker_id, &cancel).await {
      Ok(JobOutcome::Persisted(artifact)) => {
        info!(worker_id, node_id = %job.node_id, artifact_id = %artifact.id, "Job completed");
      }
      Ok(JobOutcome::Unrecorded { storage_key }) => {
        warn!(worker_id, node_id = %job.node_id, %storage_key, "Job finished without an artifact record");
      }
      Err(PipelineError::Cancelled) => {
        info!(worker_id, node_id = %job.node_id, "Job interrupted, returning it to pending");
        if let Err(e) = pipeline.ledger().release(job.node_id).await {
          error!(worker_id, node_id = %job.node_id, "Failed to release job: {e:#}");
        }
        break;
      }
      Err(e) => {
        error!(worker_id, node_id = %job.node_id, "Job failed: {e}");
        if let Err(e) = pipeline.ledger().mark_failed(job.node_id).await {
          error!(worker_id, node_id = %job.node_id, "Failed to mark job as failed: {e:#}");
        }
      }
    }
    events.publish(JOB_COMPLETED_TOPIC, job);
  }
  debug!(worker_id, "Worker stopped");
}
