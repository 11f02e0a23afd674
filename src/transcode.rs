use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::encoder::VideoEncoder;
use crate::models::VideoMetadata;

pub const STANDARD_HEIGHTS: [u32; 7] = [2160, 1440, 1080, 720, 480, 360, 240];
pub const DEFAULT_MAX_LEVELS: usize = 3;
pub const SEGMENT_SECONDS: u32 = 6;
pub const MASTER_PLAYLIST: &str = "master.m3u8";
const AUDIO_BITRATE: &str = "128k";
const STDERR_TAIL_LINES: usize = 20;

static PROGRESS_TIME: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("progress regex is valid"));

#[derive(Debug, Error)]
pub enum TranscodeError {
  #[error("failed to run {tool}: {source}")]
  Spawn {
    tool: &'static str,
    #[source]
    source: std::io::Error,
  },
  #[error("{tool} exited with {status}: {stderr}")]
  Failed {
    tool: &'static str,
    status: ExitStatus,
    stderr: String,
  },
  #[error("unreadable probe output: {0}")]
  ProbeOutput(#[from] serde_json::Error),
  #[error("no video stream found")]
  NoVideoStream,
  #[error("malformed media: {0}")]
  Malformed(String),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("cancelled")]
  Cancelled,
}

/// Media toolchain used by the pipeline.
#[async_trait]
pub trait Transcoder: Send + Sync {
  async fn probe(&self, input: &Path, cancel: &CancellationToken) -> Result<VideoMetadata, TranscodeError>;

  /// Packages `input` as HLS into `output_dir`, reporting percent complete through `progress`.
  async fn encode(
    &self,
    input: &Path,
    output_dir: &Path,
    metadata: &VideoMetadata,
    progress: &(dyn Fn(f64) + Send + Sync),
    cancel: &CancellationToken,
  ) -> Result<(), TranscodeError>;
}

pub struct FfmpegTranscoder {
  ffmpeg: PathBuf,
  ffprobe: PathBuf,
  encoder: VideoEncoder,
  max_levels: usize,
}

impl FfmpegTranscoder {
  pub fn new(encoder: VideoEncoder) -> Self {
    Self {
      ffmpeg: "ffmpeg".into(),
      ffprobe: "ffprobe".into(),
      encoder,
      max_levels: DEFAULT_MAX_LEVELS,
    }
  }

  pub fn with_tools(mut self, ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
    self.ffmpeg = ffmpeg.into();
    self.ffprobe = ffprobe.into();
    self
  }

  pub fn with_max_levels(mut self, max_levels: usize) -> Self {
    self.max_levels = max_levels.max(1);
    self
  }

  pub fn encoder(&self) -> VideoEncoder {
    self.encoder
  }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
  async fn probe(&self, input: &Path, cancel: &CancellationToken) -> Result<VideoMetadata, TranscodeError> {
    let mut cmd = Command::new(&self.ffprobe);
    cmd
      .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
      .arg(input)
      .stdin(Stdio::null())
      .kill_on_drop(true);

    let output = tokio::select! {
      _ = cancel.cancelled() => return Err(TranscodeError::Cancelled),
      out = cmd.output() => out.map_err(|source| TranscodeError::Spawn { tool: "ffprobe", source })?,
    };

    if !output.status.success() {
      return Err(TranscodeError::Failed {
        tool: "ffprobe",
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    parse_probe_output(&output.stdout)
  }

  async fn encode(
    &self,
    input: &Path,
    output_dir: &Path,
    metadata: &VideoMetadata,
    progress: &(dyn Fn(f64) + Send + Sync),
    cancel: &CancellationToken,
  ) -> Result<(), TranscodeError> {
    let mut levels = compute_ladder(self.max_levels, metadata.height);
    if levels.is_empty() {
      // Below the smallest rung: keep the source height, rounded to what encoders accept.
      let height = metadata.height & !1;
      if height == 0 {
        return Err(TranscodeError::Malformed("video stream has no height".into()));
      }
      levels.push(height);
    }

    for i in 0..levels.len() {
      tokio::fs::create_dir_all(output_dir.join(i.to_string())).await?;
    }

    let args = build_ffmpeg_args(self.encoder, input, output_dir, &levels, metadata.has_audio);
    debug!(?levels, encoder = %self.encoder, "Starting ffmpeg");

    let mut child = Command::new(&self.ffmpeg)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| TranscodeError::Spawn { tool: "ffmpeg", source })?;

    let stderr = child
      .stderr
      .take()
      .ok_or_else(|| TranscodeError::Io(std::io::Error::other("ffmpeg stderr was not captured")))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let duration = metadata.duration_seconds;

    tokio::select! {
      _ = cancel.cancelled() => {
        let _ = child.kill().await;
        return Err(TranscodeError::Cancelled);
      }
      read = async {
        while let Some(line) = lines.next_line().await? {
          if let Some(elapsed) = parse_progress_seconds(&line) {
            if duration > 0.0 {
              progress((elapsed / duration * 100.0).clamp(0.0, 100.0));
            }
          } else if !is_progress_field(&line) {
            if tail.len() == STDERR_TAIL_LINES {
              tail.pop_front();
            }
            tail.push_back(line);
          }
        }
        Ok::<_, std::io::Error>(())
      } => read?,
    }

    let status = child.wait().await?;
    if !status.success() {
      return Err(TranscodeError::Failed {
        tool: "ffmpeg",
        status,
        stderr: Vec::from(tail).join("\n"),
      });
    }
    Ok(())
  }
}

#[derive(Deserialize)]
struct ProbeOutput {
  #[serde(default)]
  streams: Vec<ProbeStream>,
  #[serde(default)]
  format: ProbeFormat,
}

#[derive(Deserialize)]
struct ProbeStream {
  codec_type: Option<String>,
  codec_name: Option<String>,
  width: Option<u32>,
  height: Option<u32>,
  duration: Option<String>,
  bit_rate: Option<String>,
}

#[derive(Deserialize, Default)]
struct ProbeFormat {
  duration: Option<String>,
  bit_rate: Option<String>,
}

/// Reads `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe_output(raw: &[u8]) -> Result<VideoMetadata, TranscodeError> {
  let probe: ProbeOutput = serde_json::from_slice(raw)?;

  let video = probe
    .streams
    .iter()
    .find(|s| s.codec_type.as_deref() == Some("video"))
    .ok_or(TranscodeError::NoVideoStream)?;
  let has_audio = probe.streams.iter().any(|s| s.codec_type.as_deref() == Some("audio"));

  let (Some(width), Some(height)) = (video.width, video.height) else {
    return Err(TranscodeError::Malformed("video stream has no dimensions".into()));
  };

  let duration_seconds = parse_number(probe.format.duration.as_deref(), video.duration.as_deref(), "duration")?;
  let bit_rate = parse_number(probe.format.bit_rate.as_deref(), video.bit_rate.as_deref(), "bit_rate")?;

  Ok(VideoMetadata {
    duration_seconds: duration_seconds.unwrap_or(0.0),
    width,
    height,
    codec: video.codec_name.clone().unwrap_or_default(),
    bit_rate: bit_rate.map(|b: f64| b as u64).unwrap_or(0),
    has_audio,
  })
}

fn parse_number(primary: Option<&str>, fallback: Option<&str>, field: &str) -> Result<Option<f64>, TranscodeError> {
  match primary.or(fallback) {
    None | Some("N/A") => Ok(None),
    Some(raw) => raw
      .parse::<f64>()
      .map(Some)
      .map_err(|_| TranscodeError::Malformed(format!("{field} '{raw}' is not a number"))),
  }
}

/// Standard heights at or below the source, tallest first, at most `max_levels` of them.
pub fn compute_ladder(max_levels: usize, source_height: u32) -> Vec<u32> {
  STANDARD_HEIGHTS
    .iter()
    .copied()
    .filter(|&h| h <= source_height)
    .take(max_levels)
    .collect()
}

pub fn bitrate_for(height: u32) -> &'static str {
  match height {
    2160 => "12000k",
    1440 => "6000k",
    1080 => "3000k",
    720 => "1800k",
    480 => "1000k",
    360 => "700k",
    240 => "400k",
    _ => "1000k",
  }
}

/// `[0:v]split=N[v0]..;[v0]<scale>[v0o];..`
pub fn build_filter_complex(encoder: VideoEncoder, levels: &[u32]) -> String {
  let mut graph = format!("[0:v]split={}", levels.len());
  for i in 0..levels.len() {
    graph.push_str(&format!("[v{i}]"));
  }
  for (i, &height) in levels.iter().enumerate() {
    graph.push_str(&format!(";[v{i}]{}[v{i}o]", encoder.scale_filter(height)));
  }
  graph
}

pub fn build_ffmpeg_args(
  encoder: VideoEncoder,
  input: &Path,
  output_dir: &Path,
  levels: &[u32],
  has_audio: bool,
) -> Vec<String> {
  let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into()];
  args.extend(encoder.hwaccel_args().iter().map(|a| a.to_string()));
  args.extend([
    "-i".to_string(),
    input.to_string_lossy().into_owned(),
    "-filter_complex".into(),
    build_filter_complex(encoder, levels),
  ]);

  for (i, &height) in levels.iter().enumerate() {
    args.extend(["-map".to_string(), format!("[v{i}o]")]);
    if has_audio {
      args.extend(["-map".to_string(), "0:a:0".to_string()]);
    }
    args.extend([
      format!("-c:v:{i}"),
      encoder.codec().into(),
      format!("-b:v:{i}"),
      bitrate_for(height).into(),
    ]);
    if has_audio {
      args.extend([
        format!("-c:a:{i}"),
        "aac".into(),
        format!("-b:a:{i}"),
        AUDIO_BITRATE.into(),
      ]);
    }
  }

  let stream_map = (0..levels.len())
    .map(|i| if has_audio { format!("v:{i},a:{i}") } else { format!("v:{i}") })
    .collect::<Vec<_>>()
    .join(" ");

  args.extend([
    "-f".to_string(),
    "hls".into(),
    "-hls_time".into(),
    SEGMENT_SECONDS.to_string(),
    "-hls_playlist_type".into(),
    "vod".into(),
    "-master_pl_name".into(),
    MASTER_PLAYLIST.into(),
    "-hls_segment_filename".into(),
    output_dir.join("%v").join("segment_%03d.ts").to_string_lossy().into_owned(),
    "-var_stream_map".into(),
    stream_map,
    "-progress".into(),
    "pipe:2".into(),
    "-nostats".into(),
    output_dir.join("%v").join("index.m3u8").to_string_lossy().into_owned(),
  ]);
  args
}

/// Elapsed seconds from a `time=HH:MM:SS.frac` marker (also matches `out_time=`).
pub fn parse_progress_seconds(line: &str) -> Option<f64> {
  let caps = PROGRESS_TIME.captures(line)?;
  let hours: f64 = caps[1].parse().ok()?;
  let minutes: f64 = caps[2].parse().ok()?;
  let seconds: f64 = caps[3].parse().ok()?;
  Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// `key=value` lines emitted by `-progress`.
fn is_progress_field(line: &str) -> bool {
  line
    .split_once('=')
    .is_some_and(|(key, _)| !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ladder_caps_by_source_and_count() {
    assert_eq!(compute_ladder(3, 1080), vec![1080, 720, 480]);
    assert_eq!(compute_ladder(3, 240), vec![240]);
    assert_eq!(compute_ladder(3, 2160), vec![2160, 1440, 1080]);
    assert_eq!(compute_ladder(3, 1000), vec![720, 480, 360]);
    assert_eq!(compute_ladder(5, 720), vec![720, 480, 360, 240]);
    assert!(compute_ladder(3, 144).is_empty());
  }

  #[test]
  fn bitrates() {
    assert_eq!(bitrate_for(720), "1800k");
    assert_eq!(bitrate_for(2160), "12000k");
    assert_eq!(bitrate_for(9999), "1000k");
  }

  #[test]
  fn software_filter_graph() {
    assert_eq!(
      build_filter_complex(VideoEncoder::X264, &[720, 480]),
      "[0:v]split=2[v0][v1];[v0]scale=-2:720[v0o];[v1]scale=-2:480[v1o]"
    );
  }

  #[test]
  fn cuda_filter_graph() {
    assert_eq!(
      build_filter_complex(VideoEncoder::Nvenc, &[1080]),
      "[0:v]split=1[v0];[v0]scale_cuda=-2:1080[v0o]"
    );
  }

  #[test]
  fn ffmpeg_args_with_audio() {
    let args = build_ffmpeg_args(
      VideoEncoder::X264,
      Path::new("in.mp4"),
      Path::new("out"),
      &[720, 480, 360],
      true,
    );
    let joined = args.join(" ");
    assert!(joined.starts_with("-y -hide_banner -i in.mp4 -filter_complex "));
    assert!(joined.contains("-c:v:1 libx264 -b:v:1 1000k -c:a:1 aac -b:a:1 128k"));
    assert!(joined.contains("-hls_time 6"));
    assert!(joined.contains("-master_pl_name master.m3u8"));
    let map_at = args.iter().position(|a| a == "-var_stream_map").unwrap();
    assert_eq!(args[map_at + 1], "v:0,a:0 v:1,a:1 v:2,a:2");
    assert_eq!(args.iter().filter(|a| *a == "0:a:0").count(), 3);
    assert_eq!(args.last().map(String::as_str), Some(Path::new("out").join("%v").join("index.m3u8").to_str().unwrap()));
  }

  #[test]
  fn ffmpeg_args_without_audio() {
    let args = build_ffmpeg_args(VideoEncoder::QuickSync, Path::new("in.mp4"), Path::new("out"), &[480], false);
    assert_eq!(&args[2..6], &["-hwaccel", "qsv", "-hwaccel_output_format", "qsv"]);
    assert!(!args.iter().any(|a| a.starts_with("-c:a")));
    let map_at = args.iter().position(|a| a == "-var_stream_map").unwrap();
    assert_eq!(args[map_at + 1], "v:0");
  }

  #[test]
  fn progress_markers() {
    assert_eq!(
      parse_progress_seconds("frame=  240 fps=120 q=28.0 size=512kB time=00:01:02.50 bitrate=1000kbits/s"),
      Some(62.5)
    );
    assert_eq!(parse_progress_seconds("out_time=01:00:00.000000"), Some(3600.0));
    assert_eq!(parse_progress_seconds("out_time=N/A"), None);
    assert_eq!(parse_progress_seconds("Stream mapping:"), None);
    assert!(is_progress_field("progress=continue"));
    assert!(!is_progress_field("Error opening output file out/0/index.m3u8."));
  }

  #[test]
  fn probe_output_takes_first_video_and_notes_audio() {
    let raw = br#"{
      "streams": [
        {"codec_type": "audio", "codec_name": "aac"},
        {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720},
        {"codec_type": "video", "codec_name": "mjpeg", "width": 300, "height": 300}
      ],
      "format": {"duration": "10.010000", "bit_rate": "2500000"}
    }"#;
    let meta = parse_probe_output(raw).unwrap();
    assert_eq!(meta.codec, "h264");
    assert_eq!((meta.width, meta.height), (1280, 720));
    assert!((meta.duration_seconds - 10.01).abs() < 1e-9);
    assert_eq!(meta.bit_rate, 2_500_000);
    assert!(meta.has_audio);
  }

  #[test]
  fn probe_output_falls_back_to_stream_fields() {
    let raw = br#"{"streams": [{"codec_type": "video", "codec_name": "vp9", "width": 640, "height": 360, "duration": "4.5", "bit_rate": "N/A"}], "format": {}}"#;
    let meta = parse_probe_output(raw).unwrap();
    assert_eq!(meta.duration_seconds, 4.5);
    assert_eq!(meta.bit_rate, 0);
    assert!(!meta.has_audio);
  }

  #[test]
  fn probe_output_without_video_is_rejected() {
    let raw = br#"{"streams": [{"codec_type": "audio", "codec_name": "mp3"}], "format": {"duration": "3.0"}}"#;
    assert!(matches!(parse_probe_output(raw), Err(TranscodeError::NoVideoStream)));
    assert!(matches!(parse_probe_output(b"not json"), Err(TranscodeError::ProbeOutput(_))));
  }
}
