use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vtqs::config::Config;
use vtqs::database::setup_database;
use vtqs::encoder::select_encoder;
use vtqs::ledger::{JobLedger, PgLedger};
use vtqs::messaging::Broker;
use vtqs::models::{Job, JobProgress};
use vtqs::routes::routes;
use vtqs::service::TranscodeService;
use vtqs::storage::{LocalObjectStore, PgNodeRepository};
use vtqs::transcode::FfmpegTranscoder;
use vtqs::worker_processing::{PipelineSettings, TranscodePipeline};

#[tokio::main]
async fn main() -> Result<()> {
  dotenvy::dotenv().ok();
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url).await?;

  let encoder = match config.video_encoder {
    Some(encoder) => {
      info!(%encoder, "Using configured video encoder");
      encoder
    }
    None => select_encoder().await,
  };

  let job_events = Arc::new(Broker::<Job>::new(config.job_event_buffer));
  let progress = Arc::new(Broker::<JobProgress>::new(config.progress_event_buffer));
  let ledger: Arc<dyn JobLedger> = Arc::new(PgLedger::new(db_pool.clone()));

  let transcoder = FfmpegTranscoder::new(encoder)
    .with_tools(&config.ffmpeg_path, &config.ffprobe_path)
    .with_max_levels(config.max_ladder_levels);
  let pipeline = Arc::new(TranscodePipeline::new(
    Arc::new(PgNodeRepository::new(db_pool)),
    Arc::new(LocalObjectStore::new(&config.object_store_root)),
    ledger.clone(),
    Arc::new(transcoder),
    progress.clone(),
    PipelineSettings {
      scratch_dir: config.scratch_dir.clone(),
      source_bucket: config.source_bucket.clone(),
      hls_bucket: config.hls_bucket.clone(),
    },
  ));

  let cancel = CancellationToken::new();
  let service = TranscodeService::new(pipeline, job_events.clone(), config.worker_count);
  let handle = service.start(cancel.clone());

  let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
  let shutdown = cancel.clone();
  let (bound, server) = warp::serve(routes(ledger, job_events, progress))
    .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })
    .with_context(|| format!("Failed to bind {addr}"))?;
  info!(%bound, workers = config.worker_count, "Transcode server listening");
  let server = tokio::spawn(server);

  tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
  info!("Shutdown requested");
  handle.shutdown();
  handle.join().await;
  if let Err(e) = server.await {
    error!("HTTP server ended abnormally: {e}");
  }
  Ok(())
}
