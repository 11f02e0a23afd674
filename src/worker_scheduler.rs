use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ledger::JobLedger;
use crate::models::Job;

/// Feeds the bounded worker channel from "new job" and "job completed" events.
pub struct Scheduler {
  ledger: Arc<dyn JobLedger>,
  queue: mpsc::Sender<Job>,
  /// New jobs that arrived while every slot was taken; not yet in the ledger.
  deferred: VecDeque<Job>,
}

impl Scheduler {
  pub fn new(ledger: Arc<dyn JobLedger>, queue: mpsc::Sender<Job>) -> Self {
    Self {
      ledger,
      queue,
      deferred: VecDeque::new(),
    }
  }

  pub fn deferred_len(&self) -> usize {
    self.deferred.len()
  }

  pub async fn run(
    mut self,
    mut new_jobs: mpsc::Receiver<Job>,
    mut completed: mpsc::Receiver<Job>,
    cancel: CancellationToken,
  ) {
    // Rows left Processing by a crash have no worker; nothing is running yet.
    match self.ledger.requeue_processing().await {
      Ok(0) => {}
      Ok(requeued) => warn!(requeued, "Returned orphaned processing jobs to pending"),
      Err(e) => error!("Error requeueing orphaned jobs: {e:#}"),
    }

    let mut drained = 0usize;
    while self.fill_queue(None).await {
      drained += 1;
    }
    if drained > 0 {
      info!(drained, "Dispatched jobs left pending by a previous run");
    }

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        job = new_jobs.recv() => {
          let Some(job) = job else { break };
          debug!(node_id = %job.node_id, "New job event");
          self.fill_queue(Some(job)).await;
        }
        done = completed.recv() => {
          let Some(done) = done else { break };
          debug!(node_id = %done.node_id, "Job completed event");
          // Completion events can be dropped by the broker, so refill every free slot.
          while self.fill_queue(None).await {}
        }
      }
    }
    info!("Scheduler stopped");
  }

  /// One admission step. Returns whether a job was handed to the workers.
  pub async fn fill_queue(&mut self, job: Option<Job>) -> bool {
    if self.queue.capacity() == 0 {
      if let Some(job) = job {
        self.deferred.push_back(job);
      }
      return false;
    }

    if let Err(e) = self.register_deferred().await {
      error!("Error registering deferred jobs: {e:#}");
    }

    let result = match job {
      Some(job) => self.admit_new(job).await,
      None => self.admit_oldest().await,
    };
    match result {
      Ok(dispatched) => dispatched,
      Err(e) => {
        error!("Error in job admission: {e:#}");
        false
      }
    }
  }

  async fn register_deferred(&mut self) -> Result<()> {
    while let Some(job) = self.deferred.front().copied() {
      self.ledger.register(job.node_id).await?;
      self.deferred.pop_front();
    }
    Ok(())
  }

  async fn admit_new(&mut self, job: Job) -> Result<bool> {
    if !self.ledger.register(job.node_id).await? {
      debug!(node_id = %job.node_id, "Job already tracked, not dispatching again");
      return Ok(false);
    }
    // Row stays Pending when no slot is free; a later completion tick claims it.
    let Ok(permit) = self.queue.try_reserve() else {
      return Ok(false);
    };
    if !self.ledger.claim(job.node_id).await? {
      return Ok(false);
    }
    permit.send(job);
    Ok(true)
  }

  async fn admit_oldest(&mut self) -> Result<bool> {
    let Ok(permit) = self.queue.try_reserve() else {
      return Ok(false);
    };
    match self.ledger.claim_next().await? {
      Some(node_id) => {
        permit.send(Job { node_id });
        Ok(true)
      }
      None => Ok(false),
    }
  }
}
