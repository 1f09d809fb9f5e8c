/// Content Moderator
///
/// Samples frames from videos, classifies them concurrently against a remote
/// content-review service and folds the per-frame verdicts into one decision.
/// Images and text go through the same classifier.

pub mod aggregate;
pub mod cancel;
pub mod classifier;
pub mod config;
pub mod error;
pub mod moderation;
pub mod pipeline;
pub mod sampler;
pub mod storage;
pub mod users;
pub mod video;

// Re-export main types for easy access
pub use crate::aggregate::{AggregateVerdict, ResultAggregator, VerdictCounts};
pub use crate::cancel::CancelToken;
pub use crate::classifier::{
    BaiduClassifier, CachingClassifier, Classification, ClassificationResult, Classifier, Verdict,
};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{DecodeWarning, ModerationError, Result};
pub use crate::moderation::{BatchImageReport, ImageReport, ModerationService, TextReport, VideoReport};
pub use crate::pipeline::{FramePipeline, PipelineOutcome, PipelineProgress, ProgressCallback};
pub use crate::sampler::{FrameSampler, SampledFrame};
pub use crate::storage::{FrameSlot, FrameStore};
pub use crate::users::{AccountError, AccountService, JsonUserStore, SessionContext, UserStore};
pub use crate::video::{FfmpegSource, VideoInfo, VideoProcessor, VideoSource};
