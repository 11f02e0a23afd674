//! Durable per-node job bookkeeping.
//!
//! Claiming relies on `FOR UPDATE SKIP LOCKED` so that concurrent claimers each walk away
//! with a distinct row without waiting on one another.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{JobRecord, JobStatus, TranscodeArtifact};

#[async_trait]
pub trait JobLedger: Send + Sync {
  /// Records a Pending row for `node_id`.
  ///
  /// Returns `false` when the node already has a Pending or Processing row. A Failed row is
  /// reset to Pending, which is how a job gets resubmitted.
  async fn register(&self, node_id: Uuid) -> Result<bool>;

  /// Flips this node's row from Pending to Processing; `false` if it was not Pending.
  async fn claim(&self, node_id: Uuid) -> Result<bool>;

  /// Claims the oldest Pending row by (accessed_at, created_at).
  async fn claim_next(&self) -> Result<Option<Uuid>>;

  async fn mark_failed(&self, node_id: Uuid) -> Result<()>;

  /// Puts an interrupted Processing row back to Pending.
  async fn release(&self, node_id: Uuid) -> Result<()>;

  /// Returns every Processing row to Pending. Only valid while no worker holds a job.
  async fn requeue_processing(&self) -> Result<u64>;

  /// Inserts the artifact and deletes the job row in one transaction.
  async fn complete(&self, artifact: &TranscodeArtifact) -> Result<()>;

  async fn find(&self, node_id: Uuid) -> Result<Option<JobRecord>>;
}

pub struct PgLedger {
  pool: PgPool,
}

impl PgLedger {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  async fn set_status(&self, node_id: Uuid, from: JobStatus, to: JobStatus) -> Result<bool> {
    let result = sqlx::query(
      "UPDATE video_processing_jobs SET status = $1, accessed_at = $2 WHERE node_id = $3 AND status = $4",
    )
      .bind(to.as_str())
      .bind(Utc::now())
      .bind(node_id)
      .bind(from.as_str())
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() == 1)
  }
}

#[async_trait]
impl JobLedger for PgLedger {
  async fn register(&self, node_id: Uuid) -> Result<bool> {
    let now = Utc::now();
    let inserted = sqlx::query_scalar::<_, Uuid>(
      "INSERT INTO video_processing_jobs (node_id, status, created_at, accessed_at)
       VALUES ($1, $2, $3, $3)
       ON CONFLICT (node_id) DO UPDATE
         SET status = EXCLUDED.status, created_at = EXCLUDED.created_at, accessed_at = EXCLUDED.accessed_at
         WHERE video_processing_jobs.status = $4
       RETURNING node_id",
    )
      .bind(node_id)
      .bind(JobStatus::Pending.as_str())
      .bind(now)
      .bind(JobStatus::Failed.as_str())
      .fetch_optional(&self.pool)
      .await?;
    Ok(inserted.is_some())
  }

  async fn claim(&self, node_id: Uuid) -> Result<bool> {
    self.set_status(node_id, JobStatus::Pending, JobStatus::Processing).await
  }

  async fn claim_next(&self) -> Result<Option<Uuid>> {
    let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
    let candidate = sqlx::query_scalar::<_, Uuid>(
      "SELECT node_id FROM video_processing_jobs
       WHERE status = $1
       ORDER BY accessed_at ASC, created_at ASC
       FOR UPDATE SKIP LOCKED
       LIMIT 1",
    )
      .bind(JobStatus::Pending.as_str())
      .fetch_optional(&mut *tx)
      .await?;

    let Some(node_id) = candidate else {
      tx.rollback().await?;
      return Ok(None);
    };

    sqlx::query("UPDATE video_processing_jobs SET status = $1, accessed_at = $2 WHERE node_id = $3")
      .bind(JobStatus::Processing.as_str())
      .bind(Utc::now())
      .bind(node_id)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;
    Ok(Some(node_id))
  }

  async fn mark_failed(&self, node_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE video_processing_jobs SET status = $1 WHERE node_id = $2")
      .bind(JobStatus::Failed.as_str())
      .bind(node_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn release(&self, node_id: Uuid) -> Result<()> {
    self.set_status(node_id, JobStatus::Processing, JobStatus::Pending).await?;
    Ok(())
  }

  async fn requeue_processing(&self) -> Result<u64> {
    let result = sqlx::query("UPDATE video_processing_jobs SET status = $1, accessed_at = $2 WHERE status = $3")
      .bind(JobStatus::Pending.as_str())
      .bind(Utc::now())
      .bind(JobStatus::Processing.as_str())
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected())
  }

  async fn complete(&self, artifact: &TranscodeArtifact) -> Result<()> {
    let mut tx = self.pool.begin().await?;
    sqlx::query(
      "INSERT INTO video_artifacts (id, node_id, object_storage_key, size_bytes, last_accessed_at, metadata)
       VALUES ($1, $2, $3, $4, $5, $6)",
    )
      .bind(artifact.id)
      .bind(artifact.node_id)
      .bind(&artifact.storage_key)
      .bind(artifact.size_bytes)
      .bind(artifact.last_accessed_at)
      .bind(&artifact.metadata)
      .execute(&mut *tx)
      .await?;
    sqlx::query("DELETE FROM video_processing_jobs WHERE node_id = $1")
      .bind(artifact.node_id)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;
    Ok(())
  }

  async fn find(&self, node_id: Uuid) -> Result<Option<JobRecord>> {
    let record = sqlx::query_as::<_, JobRecord>(
      "SELECT node_id, status, created_at, accessed_at FROM video_processing_jobs WHERE node_id = $1",
    )
      .bind(node_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(record)
  }
}

/// Ledger kept in process memory. The mutex makes every claim atomic, which stands in for
/// row locking when no database is around.
#[derive(Default)]
pub struct MemoryLedger {
  state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
  jobs: HashMap<Uuid, JobRecord>,
  artifacts: Vec<TranscodeArtifact>,
}

impl MemoryLedger {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seeds a row as-is, overwriting any existing row for that node.
  pub fn insert_record(&self, record: JobRecord) {
    self.state.lock().jobs.insert(record.node_id, record);
  }

  pub fn artifacts(&self) -> Vec<TranscodeArtifact> {
    self.state.lock().artifacts.clone()
  }

  pub fn records(&self) -> Vec<JobRecord> {
    self.state.lock().jobs.values().cloned().collect()
  }
}

#[async_trait]
impl JobLedger for MemoryLedger {
  async fn register(&self, node_id: Uuid) -> Result<bool> {
    let now = Utc::now();
    let mut state = self.state.lock();
    if let Some(existing) = state.jobs.get(&node_id) {
      if existing.status != JobStatus::Failed {
        return Ok(false);
      }
    }
    state.jobs.insert(node_id, JobRecord {
      node_id,
      status: JobStatus::Pending,
      created_at: now,
      accessed_at: now,
    });
    Ok(true)
  }

  async fn claim(&self, node_id: Uuid) -> Result<bool> {
    let mut state = self.state.lock();
    match state.jobs.get_mut(&node_id) {
      Some(record) if record.status == JobStatus::Pending => {
        record.status = JobStatus::Processing;
        record.accessed_at = Utc::now();
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn claim_next(&self) -> Result<Option<Uuid>> {
    let mut state = self.state.lock();
    let oldest = state.jobs
      .values_mut()
      .filter(|r| r.status == JobStatus::Pending)
      .min_by_key(|r| (r.accessed_at, r.created_at));
    Ok(oldest.map(|record| {
      record.status = JobStatus::Processing;
      record.accessed_at = Utc::now();
      record.node_id
    }))
  }

  async fn mark_failed(&self, node_id: Uuid) -> Result<()> {
    if let Some(record) = self.state.lock().jobs.get_mut(&node_id) {
      record.status = JobStatus::Failed;
    }
    Ok(())
  }

  async fn release(&self, node_id: Uuid) -> Result<()> {
    if let Some(record) = self.state.lock().jobs.get_mut(&node_id) {
      if record.status == JobStatus::Processing {
        record.status = JobStatus::Pending;
        record.accessed_at = Utc::now();
      }
    }
    Ok(())
  }

  async fn requeue_processing(&self) -> Result<u64> {
    let now = Utc::now();
    let mut requeued = 0;
    for record in self.state.lock().jobs.values_mut() {
      if record.status == JobStatus::Processing {
        record.status = JobStatus::Pending;
        record.accessed_at = now;
        requeued += 1;
      }
    }
    Ok(requeued)
  }

  async fn complete(&self, artifact: &TranscodeArtifact) -> Result<()> {
    let mut state = self.state.lock();
    state.artifacts.push(artifact.clone());
    state.jobs.remove(&artifact.node_id);
    Ok(())
  }

  async fn find(&self, node_id: Uuid) -> Result<Option<JobRecord>> {
    Ok(self.state.lock().jobs.get(&node_id).cloned())
  }
}
