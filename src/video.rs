use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ModerationError, Result};

/// Video information extracted from file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    pub path: PathBuf,
    pub filename: String,
    pub duration: Duration,
    pub width: u32,
    pub height: u32,
    /// Native frame rate; 0.0 when ffprobe could not determine it
    pub fps: f64,
    /// Total frame count when the container records it
    pub frame_count: Option<u64>,
    pub format: String,
    pub file_size: u64,
}

impl VideoInfo {
    /// Build video information from `ffprobe -print_format json` output
    pub fn from_ffprobe(path: &Path, probe: &serde_json::Value, file_size: u64) -> Result<Self> {
        let format = &probe["format"];
        let streams = probe["streams"]
            .as_array()
            .ok_or_else(|| ModerationError::InvalidSource("ffprobe returned no streams".into()))?;

        let video_stream = streams
            .iter()
            .find(|s| s["codec_type"] == "video")
            .ok_or_else(|| ModerationError::InvalidSource("No video stream found".into()))?;

        // avg_frame_rate is "0/0" for some streams, r_frame_rate is the fallback
        let fps = parse_frame_rate(video_stream["avg_frame_rate"].as_str())
            .filter(|fps| *fps > 0.0)
            .or_else(|| parse_frame_rate(video_stream["r_frame_rate"].as_str()))
            .unwrap_or(0.0);

        let duration_seconds: f64 = format["duration"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);

        let frame_count = video_stream["nb_frames"]
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|n| *n > 0);

        Ok(Self {
            path: path.to_path_buf(),
            filename: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            duration: Duration::from_secs_f64(duration_seconds.max(0.0)),
            width: video_stream["width"].as_u64().unwrap_or(0) as u32,
            height: video_stream["height"].as_u64().unwrap_or(0) as u32,
            fps,
            frame_count,
            format: format["format_name"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
            file_size,
        })
    }
}

/// Parse an ffprobe rate such as "30000/1001" or "25"
pub fn parse_frame_rate(rate: Option<&str>) -> Option<f64> {
    let rate = rate?;
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => rate.trim().parse().ok(),
    }
}

/// Fit `width`x`height` inside `max_edge`, keeping aspect ratio and even dimensions
pub fn scaled_dimensions(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_edge || longest == 0 {
        return (width, height);
    }

    let scale = max_edge as f64 / longest as f64;
    let even = |v: u32| -> u32 {
        let scaled = (v as f64 * scale).round() as u32;
        (scaled - scaled % 2).max(2)
    };
    (even(width), even(height))
}

/// Probes videos with ffprobe
#[derive(Clone)]
pub struct VideoProcessor {
    /// Supported video extensions
    supported_extensions: Vec<String>,
}

impl VideoProcessor {
    pub fn new() -> Self {
        Self {
            supported_extensions: vec![
                "mp4".to_string(),
                "mkv".to_string(),
                "avi".to_string(),
                "mov".to_string(),
                "webm".to_string(),
                "m4v".to_string(),
            ],
        }
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.supported_extensions.contains(&ext.to_lowercase()))
            .unwrap_or(false)
    }

    /// Extract video information using ffprobe
    pub async fn get_video_info(&self, video_path: &Path) -> Result<VideoInfo> {
        if !video_path.exists() {
            return Err(ModerationError::InvalidSource(format!(
                "{} does not exist",
                video_path.display()
            )));
        }

        let output = tokio::process::Command::new("ffprobe")
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(video_path)
            .output()
            .await
            .map_err(|e| ModerationError::InvalidSource(format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(ModerationError::InvalidSource(format!(
                "ffprobe failed for {}",
                video_path.display()
            )));
        }

        let probe: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let file_size = tokio::fs::metadata(video_path).await?.len();
        let video_info = VideoInfo::from_ffprobe(video_path, &probe, file_size)?;

        info!("📹 Analyzed video: {} ({}x{}, {:.1}fps, {:.1}s)",
              video_info.filename,
              video_info.width,
              video_info.height,
              video_info.fps,
              video_info.duration.as_secs_f64());

        Ok(video_info)
    }
}

impl Default for VideoProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// A decodable, forward-only stream of RGB24 frames
#[async_trait]
pub trait VideoSource: Send {
    /// Native frame rate, if the container reports one
    fn native_fps(&self) -> Option<f64>;

    /// Total number of frames, if known up front
    fn frame_count(&self) -> Option<u64>;

    /// Width and height of every frame this source yields
    fn dimensions(&self) -> (u32, u32);

    /// Read the next frame; `Ok(None)` at end of stream
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>>;

    /// Release the underlying decoder
    async fn close(&mut self) -> Result<()>;
}

/// Frames decoded by an `ffmpeg` child process writing rawvideo to stdout
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    stderr_task: Option<JoinHandle<String>>,
    fps: f64,
    frame_count: Option<u64>,
    width: u32,
    height: u32,
    finished: bool,
}

impl FfmpegSource {
    /// Start decoding `info.path`, downscaled so the longest edge fits `max_edge`
    pub fn open(info: &VideoInfo, max_edge: u32) -> Result<Self> {
        if info.width == 0 || info.height == 0 {
            return Err(ModerationError::InvalidSource(format!(
                "{} has no frame dimensions",
                info.filename
            )));
        }

        let (width, height) = scaled_dimensions(info.width, info.height, max_edge);
        let scale_arg = format!("scale={}:{}", width, height);

        let mut cmd = tokio::process::Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(&info.path)
            .args([
                "-an",
                "-fps_mode", "passthrough", // one output frame per decoded frame
                "-vf", scale_arg.as_str(),
                "-pix_fmt", "rgb24",
                "-f", "rawvideo",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ModerationError::InvalidSource(format!("failed to start ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ModerationError::InvalidSource("failed to capture ffmpeg stdout".into()))?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        debug!("Decoding {} at {}x{}", info.filename, width, height);

        Ok(Self {
            child,
            stdout,
            stderr_task,
            fps: info.fps,
            frame_count: info.frame_count,
            width,
            height,
            finished: false,
        })
    }

    fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    async fn take_stderr(&mut self) -> String {
        match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default().trim().to_string(),
            None => String::new(),
        }
    }
}

#[async_trait]
impl VideoSource for FfmpegSource {
    fn native_fps(&self) -> Option<f64> {
        Some(self.fps).filter(|fps| fps.is_finite() && *fps > 0.0)
    }

    fn frame_count(&self) -> Option<u64> {
        self.frame_count
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }

        let frame_bytes = self.frame_bytes();
        let mut buffer = vec![0u8; frame_bytes];
        let mut filled = 0;

        while filled < frame_bytes {
            let read = self.stdout.read(&mut buffer[filled..]).await.map_err(|e| {
                ModerationError::Decode {
                    message: format!("failed to read ffmpeg output: {}", e),
                    last_index: None,
                }
            })?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        if filled == frame_bytes {
            return Ok(Some(buffer));
        }

        self.finished = true;
        let status = self.child.wait().await?;
        let stderr = self.take_stderr().await;

        if filled > 0 {
            return Err(ModerationError::Decode {
                message: format!("truncated frame: {} of {} bytes", filled, frame_bytes),
                last_index: None,
            });
        }

        if !status.success() {
            return Err(ModerationError::Decode {
                message: format!("ffmpeg exited with {}: {}", status, stderr),
                last_index: None,
            });
        }

        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.finished {
            self.finished = true;
            if let Err(e) = self.child.start_kill() {
                warn!("Failed to stop ffmpeg: {}", e);
            }
            let _ = self.child.wait().await;
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        Ok(())
    }
}
