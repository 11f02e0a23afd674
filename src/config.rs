use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::encoder::VideoEncoder;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub server_port: u16,
  /// Worker-pool size, also the capacity of the shared job channel.
  pub worker_count: usize,
  pub job_event_buffer: usize,
  pub progress_event_buffer: usize,
  pub scratch_dir: PathBuf,
  pub object_store_root: PathBuf,
  pub source_bucket: String,
  pub hls_bucket: String,
  pub ffmpeg_path: PathBuf,
  pub ffprobe_path: PathBuf,
  pub video_encoder: Option<VideoEncoder>,
  pub max_ladder_levels: usize,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Ok(Self {
      database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
      server_port: parse_or("SERVER_PORT", 8080),
      worker_count: parse_or("WORKER_COUNT", 5),
      job_event_buffer: parse_or("JOB_EVENT_BUFFER", 2),
      progress_event_buffer: parse_or("PROGRESS_EVENT_BUFFER", 5),
      scratch_dir: env::var("SCRATCH_DIR").unwrap_or_else(|_| "videos".into()).into(),
      object_store_root: env::var("OBJECT_STORE_ROOT").unwrap_or_else(|_| "data/objects".into()).into(),
      source_bucket: env::var("SOURCE_BUCKET").unwrap_or_else(|_| "cloud-drive".into()),
      hls_bucket: env::var("HLS_BUCKET").unwrap_or_else(|_| "cloud-drive-hls".into()),
      ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".into()).into(),
      ffprobe_path: env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".into()).into(),
      video_encoder: match env::var("VIDEO_ENCODER") {
        Ok(raw) => Some(raw.parse().context("invalid VIDEO_ENCODER")?),
        Err(_) => None,
      },
      max_ladder_levels: parse_or("MAX_LADDER_LEVELS", 3),
    })
  }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
  env::var(key)
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(default)
}
