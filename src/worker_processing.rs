use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ledger::JobLedger;
use crate::messaging::{Broker, PROGRESS_TOPIC};
use crate::models::{Job, JobProgress, Node, TranscodeArtifact, VideoMetadata};
use crate::storage::{NodeRepository, ObjectStore};
use crate::transcode::{TranscodeError, Transcoder};

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("fetch failed: {0:#}")]
  Fetch(anyhow::Error),
  #[error("probe failed: {0}")]
  Probe(#[source] TranscodeError),
  #[error("encode failed: {0}")]
  Encode(#[source] TranscodeError),
  #[error("publish failed: {0:#}")]
  Publish(anyhow::Error),
  #[error("cancelled")]
  Cancelled,
}

impl PipelineError {
  fn from_transcode(err: TranscodeError, wrap: fn(TranscodeError) -> PipelineError) -> Self {
    match err {
      TranscodeError::Cancelled => PipelineError::Cancelled,
      other => wrap(other),
    }
  }
}

/// How a job that got through encode and publish ended up.
#[derive(Debug)]
pub enum JobOutcome {
  Persisted(TranscodeArtifact),
  /// Bytes are in object storage but the database never recorded them.
  Unrecorded { storage_key: String },
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
  pub scratch_dir: PathBuf,
  pub source_bucket: String,
  pub hls_bucket: String,
}

pub struct TranscodePipeline {
  nodes: Arc<dyn NodeRepository>,
  store: Arc<dyn ObjectStore>,
  ledger: Arc<dyn JobLedger>,
  transcoder: Arc<dyn Transcoder>,
  progress: Arc<Broker<JobProgress>>,
  settings: PipelineSettings,
}

impl TranscodePipeline {
  pub fn new(
    nodes: Arc<dyn NodeRepository>,
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn JobLedger>,
    transcoder: Arc<dyn Transcoder>,
    progress: Arc<Broker<JobProgress>>,
    settings: PipelineSettings,
  ) -> Self {
    Self { nodes, store, ledger, transcoder, progress, settings }
  }

  pub fn ledger(&self) -> &Arc<dyn JobLedger> {
    &self.ledger
  }

  /// Fetch, probe, encode, publish, persist. Scratch files are removed on every path.
  pub async fn run(&self, job: Job, worker_id: usize, cancel: &CancellationToken) -> Result<JobOutcome, PipelineError> {
    let node = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
      node = self.nodes.fetch_node(job.node_id) => node.map_err(PipelineError::Fetch)?,
    };
    let scratch = Scratch::new(&self.settings.scratch_dir, worker_id, &node.name);

    let fetched = tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(PipelineError::Cancelled),
      res = self.fetch(&node, &scratch.input) => res.map_err(PipelineError::Fetch),
    };
    if let Err(e) = fetched {
      scratch.cleanup().await;
      return Err(e);
    }

    let result = self.process(job, &node, &scratch, worker_id, cancel).await;
    scratch.cleanup().await;
    result
  }

  async fn fetch(&self, node: &Node, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent).await?;
    }
    let mut stream = self.store.get(&self.settings.source_bucket, &node.storage_key).await?;
    let mut file = fs::File::create(dest)
      .await
      .with_context(|| format!("cannot create scratch file {}", dest.display()))?;
    tokio::io::copy(&mut stream, &mut file).await?;
    file.flush().await?;
    Ok(())
  }

  async fn process(
    &self,
    job: Job,
    node: &Node,
    scratch: &Scratch,
    worker_id: usize,
    cancel: &CancellationToken,
  ) -> Result<JobOutcome, PipelineError> {
    let metadata = self.transcoder
      .probe(&scratch.input, cancel)
      .await
      .map_err(|e| PipelineError::from_transcode(e, PipelineError::Probe))?;
    debug!(node_id = %job.node_id, worker_id, ?metadata, "Probed source");

    let progress = self.progress.clone();
    let report = move |percent: f64| {
      debug!(node_id = %job.node_id, worker_id, percent, "Transcode progress");
      progress.publish(PROGRESS_TOPIC, JobProgress { node_id: job.node_id, percent });
    };
    self.transcoder
      .encode(&scratch.input, &scratch.output_dir, &metadata, &report, cancel)
      .await
      .map_err(|e| PipelineError::from_transcode(e, PipelineError::Encode))?;

    let storage_key = Uuid::new_v4().to_string();
    info!(node_id = %job.node_id, worker_id, %storage_key, "Uploading HLS package");
    self.publish(&scratch.output_dir, &storage_key, cancel).await?;

    Ok(self.persist(job, node, storage_key, metadata).await)
  }

  /// Uploads every file under `dir` as `<storage_key>/<relative path>`. A failed or cancelled
  /// upload removes the objects already written for this key.
  async fn publish(&self, dir: &Path, storage_key: &str, cancel: &CancellationToken) -> Result<(), PipelineError> {
    let mut uploaded = Vec::new();
    let result = tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(PipelineError::Cancelled),
      res = self.upload_all(dir, storage_key, &mut uploaded) => res.map_err(PipelineError::Publish),
    };
    if result.is_err() {
      for key in &uploaded {
        if let Err(e) = self.store.delete(&self.settings.hls_bucket, key).await {
          warn!(%key, "Failed to remove partial upload: {e:#}");
        }
      }
    }
    result
  }

  async fn upload_all(&self, dir: &Path, storage_key: &str, uploaded: &mut Vec<String>) -> anyhow::Result<()> {
    for path in walk_files(dir).await? {
      let relative = path.strip_prefix(dir)?;
      let key = object_key(storage_key, relative);
      let file = fs::File::open(&path).await?;
      let size = file.metadata().await?.len();
      self.store
        .put(&self.settings.hls_bucket, &key, Box::pin(file), size)
        .await
        .with_context(|| format!("upload of {key} failed"))?;
      uploaded.push(key);
    }
    Ok(())
  }

  async fn persist(&self, job: Job, node: &Node, storage_key: String, metadata: VideoMetadata) -> JobOutcome {
    let artifact = TranscodeArtifact::new(job.node_id, storage_key, node.size_bytes, metadata);
    match self.ledger.complete(&artifact).await {
      Ok(()) => JobOutcome::Persisted(artifact),
      Err(e) => {
        error!(
          node_id = %job.node_id,
          storage_key = %artifact.storage_key,
          "Artifact uploaded but not recorded: {e:#}"
        );
        JobOutcome::Unrecorded { storage_key: artifact.storage_key }
      }
    }
  }
}

/// Worker-scoped scratch paths.
struct Scratch {
  input: PathBuf,
  output_dir: PathBuf,
}

impl Scratch {
  fn new(root: &Path, worker_id: usize, node_name: &str) -> Self {
    let file_name = Path::new(node_name)
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| "source".into());
    let input = root.join(format!("{worker_id}_{file_name}"));
    let stem = Path::new(&file_name)
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| file_name.clone());
    let output_dir = root.join(format!("{worker_id}_{stem}_hls"));
    Self { input, output_dir }
  }

  async fn cleanup(&self) {
    if let Err(e) = fs::remove_file(&self.input).await {
      if e.kind() != std::io::ErrorKind::NotFound {
        warn!(path = %self.input.display(), "Failed to remove scratch input: {e}");
      }
    }
    if let Err(e) = fs::remove_dir_all(&self.output_dir).await {
      if e.kind() != std::io::ErrorKind::NotFound {
        warn!(path = %self.output_dir.display(), "Failed to remove scratch output: {e}");
      }
    }
  }
}

async fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  let mut pending = vec![root.to_path_buf()];
  while let Some(dir) = pending.pop() {
    let mut entries = fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
      if entry.file_type().await?.is_dir() {
        pending.push(entry.path());
      } else {
        files.push(entry.path());
      }
    }
  }
  files.sort();
  Ok(files)
}

fn object_key(storage_key: &str, relative: &Path) -> String {
  let suffix = relative
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/");
  format!("{storage_key}/{suffix}")
}
