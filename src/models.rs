use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

/// In-flight transcode request. Lives only on the worker channel and as an event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
  pub node_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
  pub node_id: Uuid,
  pub percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Pending,
  Processing,
  Failed,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Pending => "pending",
      JobStatus::Processing => "processing",
      JobStatus::Failed => "failed",
    }
  }
}

impl TryFrom<String> for JobStatus {
  type Error = String;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    match value.as_str() {
      "pending" => Ok(JobStatus::Pending),
      "processing" => Ok(JobStatus::Processing),
      "failed" => Ok(JobStatus::Failed),
      other => Err(format!("unknown job status '{other}'")),
    }
  }
}

/// Ledger row; at most one per node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
  pub node_id: Uuid,
  #[sqlx(try_from = "String")]
  pub status: JobStatus,
  pub created_at: DateTime<Utc>,
  pub accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
  pub duration_seconds: f64,
  pub width: u32,
  pub height: u32,
  /// h264, hevc, vp9, ...
  pub codec: String,
  pub bit_rate: u64,
  pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TranscodeArtifact {
  pub id: Uuid,
  pub node_id: Uuid,
  #[serde(skip_serializing)]
  #[sqlx(rename = "object_storage_key")]
  pub storage_key: String,
  pub size_bytes: Option<i64>,
  pub last_accessed_at: DateTime<Utc>,
  pub metadata: Json<VideoMetadata>,
}

impl TranscodeArtifact {
  pub fn new(node_id: Uuid, storage_key: String, size_bytes: Option<i64>, metadata: VideoMetadata) -> Self {
    Self {
      id: Uuid::new_v4(),
      node_id,
      storage_key,
      size_bytes,
      last_accessed_at: Utc::now(),
      metadata: Json(metadata),
    }
  }
}

/// What the file-tree service tells us about a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
  pub name: String,
  pub size_bytes: Option<i64>,
  pub storage_key: String,
}
