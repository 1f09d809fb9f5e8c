use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::aggregate::{AggregateVerdict, ResultAggregator, VerdictCounts};
use crate::cancel::CancelToken;
use crate::classifier::{classification_or_indeterminate, create_classifier, Classifier, Verdict};
use crate::config::Config;
use crate::error::{ModerationError, Result};
use crate::pipeline::{FramePipeline, ProgressCallback};
use crate::sampler::FrameSampler;
use crate::storage::FrameStore;
use crate::video::{FfmpegSource, VideoInfo, VideoProcessor, VideoSource};

/// Image extensions accepted for image moderation
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp"];

/// Moderation result for a single video
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoReport {
    pub video_info: VideoInfo,
    pub target_fps: f64,
    pub stride: u64,
    pub verdict: AggregateVerdict,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_warnings: Vec<String>,
    pub processing_time: Duration,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReport {
    pub path: PathBuf,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Moderation results for every image under a directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchImageReport {
    pub root: PathBuf,
    /// Sorted by path
    pub images: Vec<ImageReport>,
    pub counts: VerdictCounts,
    pub total_time: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextReport {
    pub characters: usize,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Entry point for video, image and text moderation
pub struct ModerationService {
    config: Config,
    video_processor: VideoProcessor,
    classifier: Arc<dyn Classifier>,
    pipeline: FramePipeline,
}

impl ModerationService {
    /// Build the service with the classifier described by `config`
    pub fn new(config: Config) -> Result<Self> {
        let classifier = create_classifier(&config.classifier)?;
        Self::with_classifier(config, classifier)
    }

    pub fn with_classifier(config: Config, classifier: Arc<dyn Classifier>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ModerationError::Config(e.to_string()))?;
        let pipeline = FramePipeline::from_config(&config.pipeline)?;

        info!("🔧 Moderation service ready: classifier '{}', {} workers",
              classifier.name(), pipeline.max_workers());

        Ok(Self {
            config,
            video_processor: VideoProcessor::new(),
            classifier,
            pipeline,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sample, classify and aggregate a video file
    pub async fn moderate_video(
        &self,
        path: &Path,
        cancel: &CancelToken,
        progress: Option<ProgressCallback>,
    ) -> Result<VideoReport> {
        if !self.video_processor.is_supported(path) {
            debug!("Unrecognised video extension, letting ffmpeg decide: {}", path.display());
        }

        let video_info = self.video_processor.get_video_info(path).await?;
        let source = FfmpegSource::open(&video_info, self.config.sampling.max_edge)?;
        self.moderate_source(video_info, source, cancel, progress).await
    }

    /// Moderate frames from an already opened source
    pub async fn moderate_source<S: VideoSource + 'static>(
        &self,
        video_info: VideoInfo,
        source: S,
        cancel: &CancelToken,
        progress: Option<ProgressCallback>,
    ) -> Result<VideoReport> {
        let start_time = Instant::now();
        let sampling = &self.config.sampling;

        let store = Arc::new(FrameStore::new(sampling.frame_dir.as_deref(), sampling.jpeg_quality)?);
        let sampler = FrameSampler::new(source, sampling.target_fps, store)?;

        info!("🎬 Moderating {}", video_info.filename);
        let outcome = self
            .pipeline
            .run(sampler, Arc::clone(&self.classifier), cancel, progress)
            .await?;

        for warning in &outcome.storage_warnings {
            warn!("⚠️ Frame storage: {}", warning);
        }

        let verdict = ResultAggregator::aggregate_with_warning(&outcome.results, outcome.decode_warning);

        if verdict.compliant {
            info!("✅ {} is compliant ({} frames, {} indeterminate)",
                  video_info.filename, verdict.frames.len(), verdict.counts.indeterminate);
        } else {
            warn!("🚫 {} is non-compliant, first at frame {:?}",
                  video_info.filename, verdict.first_non_compliant_index);
        }

        Ok(VideoReport {
            video_info,
            target_fps: sampling.target_fps,
            stride: outcome.stride,
            verdict,
            storage_warnings: outcome.storage_warnings,
            processing_time: start_time.elapsed(),
            created_at: Utc::now(),
        })
    }

    pub async fn moderate_image(&self, path: &Path) -> Result<ImageReport> {
        if !is_image(path) {
            return Err(ModerationError::InvalidInput(format!(
                "unsupported image type: {}",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(ModerationError::InvalidInput(format!("{} does not exist", path.display())));
        }

        self.classifier.prepare().await?;
        Ok(self.classify_image_file(path.to_path_buf()).await)
    }

    /// Moderate every supported image under `dir`, recursively
    pub async fn moderate_images(&self, dir: &Path) -> Result<BatchImageReport> {
        if !dir.is_dir() {
            return Err(ModerationError::InvalidInput(format!("{} is not a directory", dir.display())));
        }

        let start_time = Instant::now();
        let paths = discover_images(dir);
        info!("🖼️ Found {} images in {}", paths.len(), dir.display());

        if !paths.is_empty() {
            self.classifier.prepare().await?;
        }

        let mut images: Vec<ImageReport> = stream::iter(paths)
            .map(|path| self.classify_image_file(path))
            .buffer_unordered(self.pipeline.max_workers())
            .collect()
            .await;
        images.sort_by(|a, b| a.path.cmp(&b.path));

        let counts = images.iter().map(|image| image.verdict).collect();

        Ok(BatchImageReport {
            root: dir.to_path_buf(),
            images,
            counts,
            total_time: start_time.elapsed(),
        })
    }

    pub async fn moderate_text(&self, text: &str) -> Result<TextReport> {
        if text.trim().is_empty() {
            return Err(ModerationError::InvalidInput("text is empty".into()));
        }

        self.classifier.prepare().await?;
        let (classification, error) = classification_or_indeterminate(self.classify_text_bounded(text).await);
        if let Some(ref e) = error {
            warn!("Text classification failed: {}", e);
        }

        Ok(TextReport {
            characters: text.chars().count(),
            verdict: classification.verdict,
            raw: Some(classification.raw).filter(|raw| !raw.is_null()),
            error,
        })
    }

    /// Write a report as JSON under `output.report_dir`; `None` when disabled
    pub async fn save_report<T: Serialize>(&self, name: &str, report: &T) -> Result<Option<PathBuf>> {
        let Some(ref report_dir) = self.config.output.report_dir else {
            return Ok(None);
        };

        tokio::fs::create_dir_all(report_dir).await?;
        let stem: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = report_dir.join(format!("{}_{}.json", stem, Utc::now().format("%Y%m%d_%H%M%S")));

        let json_data = serde_json::to_string_pretty(report)?;
        tokio::fs::write(&path, json_data).await?;

        info!("💾 Report saved to: {}", path.display());
        Ok(Some(path))
    }

    async fn classify_image_file(&self, path: PathBuf) -> ImageReport {
        let result = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                match tokio::time::timeout(self.config.pipeline.request_timeout(), self.classifier.classify_image(&bytes)).await {
                    Ok(result) => result,
                    Err(_) => Err(ModerationError::Classifier("classification timed out".into())),
                }
            }
            Err(e) => Err(ModerationError::Io(e)),
        };

        let (classification, error) = classification_or_indeterminate(result);
        if let Some(ref e) = error {
            warn!("Image {} classification failed: {}", path.display(), e);
        }

        ImageReport {
            path,
            verdict: classification.verdict,
            raw: Some(classification.raw).filter(|raw| !raw.is_null()),
            error,
        }
    }

    async fn classify_text_bounded(&self, text: &str) -> Result<crate::classifier::Classification> {
        tokio::time::timeout(self.config.pipeline.request_timeout(), self.classifier.classify_text(text))
            .await
            .unwrap_or_else(|_| Err(ModerationError::Classifier("classification timed out".into())))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn discover_images(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();
    paths
}
