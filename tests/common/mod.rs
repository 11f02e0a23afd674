#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vtqs::ledger::{JobLedger, MemoryLedger};
use vtqs::messaging::Broker;
use vtqs::models::{JobProgress, JobRecord, Node, TranscodeArtifact, VideoMetadata};
use vtqs::storage::{ByteStream, NodeRepository, ObjectStore};
use vtqs::transcode::{MASTER_PLAYLIST, TranscodeError, Transcoder};
use vtqs::worker_processing::{PipelineSettings, TranscodePipeline};

pub const SOURCE_BUCKET: &str = "cloud-drive";
pub const HLS_BUCKET: &str = "cloud-drive-hls";

#[derive(Default)]
pub struct MemoryNodeRepository {
  nodes: Mutex<HashMap<Uuid, Node>>,
}

impl MemoryNodeRepository {
  pub fn insert(&self, id: Uuid, node: Node) {
    self.nodes.lock().insert(id, node);
  }
}

#[async_trait]
impl NodeRepository for MemoryNodeRepository {
  async fn fetch_node(&self, id: Uuid) -> Result<Node> {
    self.nodes
      .lock()
      .get(&id)
      .cloned()
      .ok_or_else(|| anyhow!("node {id} not found"))
  }
}

#[derive(Default)]
pub struct MemoryObjectStore {
  objects: Mutex<HashMap<(String, String), Vec<u8>>>,
  /// Remaining successful puts; `None` means unlimited.
  put_budget: Mutex<Option<usize>>,
  stall_gets: AtomicBool,
  stall_puts: AtomicBool,
  /// Signalled when a call starts stalling.
  pub stalled: Notify,
}

impl MemoryObjectStore {
  pub fn stall_gets(&self) {
    self.stall_gets.store(true, Ordering::SeqCst);
  }

  pub fn stall_puts(&self) {
    self.stall_puts.store(true, Ordering::SeqCst);
  }

  async fn stall(&self) {
    self.stalled.notify_one();
    std::future::pending::<()>().await;
  }

  pub fn fail_after(&self, puts: usize) {
    *self.put_budget.lock() = Some(puts);
  }

  pub fn insert(&self, bucket: &str, key: &str, data: &[u8]) {
    self.objects.lock().insert((bucket.into(), key.into()), data.to_vec());
  }

  pub fn keys(&self, bucket: &str) -> Vec<String> {
    let mut keys: Vec<String> = self.objects
      .lock()
      .keys()
      .filter(|(b, _)| b == bucket)
      .map(|(_, k)| k.clone())
      .collect();
    keys.sort();
    keys
  }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
  async fn get(&self, bucket: &str, key: &str) -> Result<ByteStream> {
    if self.stall_gets.load(Ordering::SeqCst) {
      self.stall().await;
    }
    let data = self.objects
      .lock()
      .get(&(bucket.to_string(), key.to_string()))
      .cloned()
      .ok_or_else(|| anyhow!("object {bucket}/{key} not found"))?;
    Ok(Box::pin(std::io::Cursor::new(data)))
  }

  async fn put(&self, bucket: &str, key: &str, mut data: ByteStream, _size: u64) -> Result<()> {
    if self.stall_puts.load(Ordering::SeqCst) {
      self.stall().await;
    }
    if let Some(budget) = self.put_budget.lock().as_mut() {
      if *budget == 0 {
        return Err(anyhow!("object store unavailable"));
      }
      *budget -= 1;
    }
    let mut buf = Vec::new();
    data.read_to_end(&mut buf).await?;
    self.insert(bucket, key, &buf);
    Ok(())
  }

  async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
    self.objects.lock().remove(&(bucket.to_string(), key.to_string()));
    Ok(())
  }
}

/// Writes a plausible HLS tree without touching ffmpeg.
pub struct FakeTranscoder {
  pub metadata: VideoMetadata,
  pub fail_probe: bool,
  pub fail_encode: bool,
  pub levels: usize,
  /// Encode blocks until cancelled instead of producing output.
  pub hang: bool,
  pub started: Notify,
  pub encodes: AtomicUsize,
}

impl FakeTranscoder {
  pub fn new() -> Self {
    Self {
      metadata: VideoMetadata {
        duration_seconds: 10.0,
        width: 1280,
        height: 720,
        codec: "h264".into(),
        bit_rate: 2_000_000,
        has_audio: true,
      },
      fail_probe: false,
      fail_encode: false,
      levels: 3,
      hang: false,
      started: Notify::new(),
      encodes: AtomicUsize::new(0),
    }
  }

  pub fn failing_probe() -> Self {
    Self { fail_probe: true, ..Self::new() }
  }

  pub fn failing_encode() -> Self {
    Self { fail_encode: true, ..Self::new() }
  }

  pub fn hanging() -> Self {
    Self { hang: true, ..Self::new() }
  }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
  async fn probe(&self, input: &Path, _cancel: &CancellationToken) -> Result<VideoMetadata, TranscodeError> {
    if self.fail_probe {
      return Err(TranscodeError::NoVideoStream);
    }
    assert!(input.exists(), "source should be fetched before probing");
    Ok(self.metadata.clone())
  }

  async fn encode(
    &self,
    _input: &Path,
    output_dir: &Path,
    _metadata: &VideoMetadata,
    progress: &(dyn Fn(f64) + Send + Sync),
    cancel: &CancellationToken,
  ) -> Result<(), TranscodeError> {
    self.encodes.fetch_add(1, Ordering::SeqCst);
    if self.hang {
      self.started.notify_one();
      cancel.cancelled().await;
      return Err(TranscodeError::Cancelled);
    }
    if self.fail_encode {
      tokio::fs::create_dir_all(output_dir.join("0")).await?;
      tokio::fs::write(output_dir.join("0").join("segment_000.ts"), [0u8; 188]).await?;
      return Err(TranscodeError::Malformed("corrupt frame".into()));
    }
    tokio::fs::create_dir_all(output_dir).await?;
    let mut master = String::from("#EXTM3U\n");
    for i in 0..self.levels {
      let dir = output_dir.join(i.to_string());
      tokio::fs::create_dir_all(&dir).await?;
      tokio::fs::write(dir.join("index.m3u8"), "#EXTM3U\n#EXTINF:6.0,\nsegment_000.ts\n").await?;
      tokio::fs::write(dir.join("segment_000.ts"), [0u8; 188]).await?;
      master.push_str(&format!("#EXT-X-STREAM-INF:BANDWIDTH=1000000\n{i}/index.m3u8\n"));
    }
    progress(50.0);
    tokio::fs::write(output_dir.join(MASTER_PLAYLIST), master).await?;
    progress(100.0);
    Ok(())
  }
}

/// Delegates to a [`MemoryLedger`] but can never record an artifact.
pub struct UnrecordableLedger(pub Arc<MemoryLedger>);

#[async_trait]
impl JobLedger for UnrecordableLedger {
  async fn register(&self, node_id: Uuid) -> Result<bool> {
    self.0.register(node_id).await
  }
  async fn claim(&self, node_id: Uuid) -> Result<bool> {
    self.0.claim(node_id).await
  }
  async fn claim_next(&self) -> Result<Option<Uuid>> {
    self.0.claim_next().await
  }
  async fn mark_failed(&self, node_id: Uuid) -> Result<()> {
    self.0.mark_failed(node_id).await
  }
  async fn release(&self, node_id: Uuid) -> Result<()> {
    self.0.release(node_id).await
  }
  async fn requeue_processing(&self) -> Result<u64> {
    self.0.requeue_processing().await
  }
  async fn complete(&self, _: &TranscodeArtifact) -> Result<()> {
    Err(anyhow!("connection reset during commit"))
  }
  async fn find(&self, node_id: Uuid) -> Result<Option<JobRecord>> {
    self.0.find(node_id).await
  }
}

pub struct Harness {
  pub nodes: Arc<MemoryNodeRepository>,
  pub store: Arc<MemoryObjectStore>,
  pub ledger: Arc<MemoryLedger>,
  pub transcoder: Arc<FakeTranscoder>,
  pub progress: Arc<Broker<JobProgress>>,
  pub pipeline: Arc<TranscodePipeline>,
  pub scratch: tempfile::TempDir,
}

impl Harness {
  pub fn new(transcoder: FakeTranscoder) -> Self {
    Self::build(transcoder, false)
  }

  /// Every artifact commit fails.
  pub fn unrecordable(transcoder: FakeTranscoder) -> Self {
    Self::build(transcoder, true)
  }

  fn build(transcoder: FakeTranscoder, unrecordable: bool) -> Self {
    let nodes = Arc::new(MemoryNodeRepository::default());
    let store = Arc::new(MemoryObjectStore::default());
    let ledger = Arc::new(MemoryLedger::new());
    let transcoder = Arc::new(transcoder);
    let progress = Arc::new(Broker::new(16));
    let scratch = tempfile::tempdir().expect("scratch dir");
    let pipeline_ledger: Arc<dyn JobLedger> = if unrecordable {
      Arc::new(UnrecordableLedger(ledger.clone()))
    } else {
      ledger.clone()
    };
    let pipeline = Arc::new(TranscodePipeline::new(
      nodes.clone(),
      store.clone(),
      pipeline_ledger,
      transcoder.clone(),
      progress.clone(),
      PipelineSettings {
        scratch_dir: scratch.path().to_path_buf(),
        source_bucket: SOURCE_BUCKET.into(),
        hls_bucket: HLS_BUCKET.into(),
      },
    ));
    Self { nodes, store, ledger, transcoder, progress, pipeline, scratch }
  }

  /// Adds a node whose source bytes live in the source bucket.
  pub fn add_video(&self, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    let key = format!("sources/{id}");
    self.store.insert(SOURCE_BUCKET, &key, b"not really a video");
    self.nodes.insert(id, Node {
      name: name.into(),
      size_bytes: Some(18),
      storage_key: key,
    });
    id
  }

  pub fn scratch_entries(&self) -> Vec<PathBuf> {
    std::fs::read_dir(self.scratch.path())
      .expect("scratch dir readable")
      .filter_map(|e| e.ok().map(|e| e.path()))
      .collect()
  }
}
