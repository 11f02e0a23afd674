use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
  Nvidia,
  Amd,
  Intel,
  None,
}

/// Encoder chosen for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoEncoder {
  Nvenc,
  QuickSync,
  Amf,
  X264,
}

impl From<GpuVendor> for VideoEncoder {
  fn from(vendor: GpuVendor) -> Self {
    match vendor {
      GpuVendor::Nvidia => VideoEncoder::Nvenc,
      GpuVendor::Intel => VideoEncoder::QuickSync,
      GpuVendor::Amd => VideoEncoder::Amf,
      GpuVendor::None => VideoEncoder::X264,
    }
  }
}

impl VideoEncoder {
  /// ffmpeg codec name.
  pub fn codec(&self) -> &'static str {
    match self {
      VideoEncoder::Nvenc => "h264_nvenc",
      VideoEncoder::QuickSync => "h264_qsv",
      VideoEncoder::Amf => "h264_amf",
      VideoEncoder::X264 => "libx264",
    }
  }

  pub fn is_hardware(&self) -> bool {
    !matches!(self, VideoEncoder::X264)
  }

  /// Decoder-side acceleration so frames stay on the device for scaling.
  pub fn hwaccel_args(&self) -> &'static [&'static str] {
    match self {
      VideoEncoder::Nvenc => &["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"],
      VideoEncoder::QuickSync => &["-hwaccel", "qsv", "-hwaccel_output_format", "qsv"],
      VideoEncoder::Amf | VideoEncoder::X264 => &[],
    }
  }

  /// Scale filter to `height`, keeping aspect ratio with an even width.
  pub fn scale_filter(&self, height: u32) -> String {
    match self {
      VideoEncoder::Nvenc => format!("scale_cuda=-2:{height}"),
      VideoEncoder::QuickSync => format!("vpp_qsv=w=-2:h={height}"),
      // AMF decodes in system memory, so the software scaler applies.
      VideoEncoder::Amf | VideoEncoder::X264 => format!("scale=-2:{height}"),
    }
  }
}

impl fmt::Display for VideoEncoder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.codec())
  }
}

impl FromStr for VideoEncoder {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "nvenc" | "h264_nvenc" | "nvidia" => Ok(VideoEncoder::Nvenc),
      "qsv" | "h264_qsv" | "quicksync" | "intel" => Ok(VideoEncoder::QuickSync),
      "amf" | "h264_amf" | "amd" => Ok(VideoEncoder::Amf),
      "x264" | "libx264" | "software" | "none" => Ok(VideoEncoder::X264),
      other => Err(anyhow!("unknown video encoder '{other}'")),
    }
  }
}

/// Probes the host and picks an encoder. Any probe failure means software encoding.
pub async fn select_encoder() -> VideoEncoder {
  let vendor = detect_gpu_vendor().await;
  let encoder = VideoEncoder::from(vendor);
  info!(?vendor, %encoder, "Selected video encoder");
  encoder
}

pub async fn detect_gpu_vendor() -> GpuVendor {
  if cfg!(target_os = "linux") {
    match command_output("lspci", &["-nn"]).await {
      Some(out) => classify_lspci(&out),
      None => GpuVendor::None,
    }
  } else if cfg!(target_os = "windows") {
    match command_output("wmic", &["path", "win32_videocontroller", "get", "PNPDeviceID"]).await {
      Some(out) => classify_pnp_ids(&out),
      None => GpuVendor::None,
    }
  } else {
    GpuVendor::None
  }
}

async fn command_output(program: &str, args: &[&str]) -> Option<String> {
  match Command::new(program).args(args).kill_on_drop(true).output().await {
    Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
    Ok(out) => {
      debug!(program, status = %out.status, "GPU probe exited unsuccessfully");
      None
    }
    Err(e) => {
      debug!(program, "GPU probe failed to run: {e}");
      None
    }
  }
}

/// Classifies `lspci -nn` output by the first display controller's PCI vendor id.
pub fn classify_lspci(output: &str) -> GpuVendor {
  output
    .lines()
    .map(str::to_ascii_lowercase)
    .filter(|line| line.contains("vga compatible controller") || line.contains("3d controller"))
    .find_map(|line| {
      if line.contains("[10de:") {
        Some(GpuVendor::Nvidia)
      } else if line.contains("[1002:") {
        Some(GpuVendor::Amd)
      } else if line.contains("[8086:") {
        Some(GpuVendor::Intel)
      } else {
        None
      }
    })
    .unwrap_or(GpuVendor::None)
}

/// Classifies Windows PNP device ids (`PCI\VEN_10DE&DEV_...`).
pub fn classify_pnp_ids(output: &str) -> GpuVendor {
  let output = output.to_ascii_uppercase();
  if output.contains("VEN_10DE") {
    GpuVendor::Nvidia
  } else if output.contains("VEN_1002") {
    GpuVendor::Amd
  } else if output.contains("VEN_8086") {
    GpuVendor::Intel
  } else {
    GpuVendor::None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const LSPCI_NVIDIA: &str = "\
00:00.0 Host bridge [0600]: Intel Corporation 8th Gen Core Processor Host Bridge [8086:3ec2] (rev 07)
01:00.0 VGA compatible controller [0300]: NVIDIA Corporation TU106 [GeForce RTX 2060] [10de:1f08] (rev a1)
01:00.1 Audio device [0403]: NVIDIA Corporation TU106 High Definition Audio Controller [10de:10f9] (rev a1)";

  #[test]
  fn lspci_ignores_non_display_devices() {
    // The Intel host bridge comes first but is not a display controller.
    assert_eq!(classify_lspci(LSPCI_NVIDIA), GpuVendor::Nvidia);
  }

  #[test]
  fn lspci_vendors() {
    assert_eq!(
      classify_lspci("00:02.0 VGA compatible controller [0300]: Intel Corporation UHD Graphics 630 [8086:3e92]"),
      GpuVendor::Intel
    );
    assert_eq!(
      classify_lspci("03:00.0 VGA compatible controller [0300]: Advanced Micro Devices, Inc. [AMD/ATI] Navi 10 [1002:731f]"),
      GpuVendor::Amd
    );
    assert_eq!(
      classify_lspci("65:00.0 3D controller [0302]: NVIDIA Corporation GA100 [A100 PCIe 40GB] [10de:20f1]"),
      GpuVendor::Nvidia
    );
    assert_eq!(classify_lspci(""), GpuVendor::None);
  }

  #[test]
  fn pnp_ids() {
    let out = "PNPDeviceID\r\nPCI\\VEN_1002&DEV_731F&SUBSYS_E4111DA2&REV_C1\\6&1B2A1E1C&0&00000019\r\n";
    assert_eq!(classify_pnp_ids(out), GpuVendor::Amd);
    assert_eq!(classify_pnp_ids("PCI\\ven_10de&dev_1f08"), GpuVendor::Nvidia);
    assert_eq!(classify_pnp_ids("ROOT\\BASICDISPLAY\\0000"), GpuVendor::None);
  }

  #[test]
  fn vendor_to_encoder() {
    assert_eq!(VideoEncoder::from(GpuVendor::Nvidia).codec(), "h264_nvenc");
    assert_eq!(VideoEncoder::from(GpuVendor::Intel).codec(), "h264_qsv");
    assert_eq!(VideoEncoder::from(GpuVendor::Amd).codec(), "h264_amf");
    assert_eq!(VideoEncoder::from(GpuVendor::None).codec(), "libx264");
    assert!(!VideoEncoder::X264.is_hardware());
    assert!(VideoEncoder::Amf.is_hardware());
  }

  #[test]
  fn scale_filters() {
    assert_eq!(VideoEncoder::Nvenc.scale_filter(720), "scale_cuda=-2:720");
    assert_eq!(VideoEncoder::QuickSync.scale_filter(480), "vpp_qsv=w=-2:h=480");
    assert_eq!(VideoEncoder::X264.scale_filter(360), "scale=-2:360");
    assert!(VideoEncoder::X264.hwaccel_args().is_empty());
  }

  #[test]
  fn parse_override() {
    assert_eq!("NVENC".parse::<VideoEncoder>().unwrap(), VideoEncoder::Nvenc);
    assert_eq!(" libx264 ".parse::<VideoEncoder>().unwrap(), VideoEncoder::X264);
    assert!("vp9".parse::<VideoEncoder>().is_err());
  }
}
