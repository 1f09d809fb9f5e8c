use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::classifier::{ClassificationResult, Classifier};
use crate::config::PipelineConfig;
use crate::error::{DecodeWarning, ModerationError, Result};
use crate::sampler::{FrameSampler, FrameStorage, SampledFrame};
use crate::storage::FrameSlot;
use crate::video::VideoSource;

/// Progress snapshot published after every completed frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PipelineProgress {
    pub completed: usize,
    pub submitted: usize,
    /// Total frames the sampler will emit, when the source length is known
    pub expected: Option<usize>,
}

impl PipelineProgress {
    pub fn fraction(&self) -> f64 {
        let total = self
            .expected
            .unwrap_or(self.submitted)
            .max(self.submitted)
            .max(self.completed);
        if total == 0 {
            0.0
        } else {
            self.completed as f64 / total as f64
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(PipelineProgress) + Send + Sync>;

/// Everything the pipeline produced for one video
#[derive(Debug)]
pub struct PipelineOutcome {
    /// One result per sampled frame, in completion order
    pub results: Vec<ClassificationResult>,
    pub stride: u64,
    pub decode_warning: Option<DecodeWarning>,
    pub storage_warnings: Vec<String>,
    pub elapsed: Duration,
}

/// What a worker hands back for one frame
#[derive(Debug)]
struct FrameReport {
    /// `None` when the frame was abandoned after cancellation
    result: Option<ClassificationResult>,
    storage_warning: Option<String>,
}

#[derive(Debug, Default)]
struct ProducerSummary {
    submitted: usize,
    last_submitted: Option<u64>,
    decode_error: Option<ModerationError>,
    cancelled: bool,
}

/// Bounded-concurrency classification of sampled frames
pub struct FramePipeline {
    max_workers: usize,
    request_timeout: Duration,
}

impl FramePipeline {
    pub fn new(max_workers: usize, request_timeout: Duration) -> Result<Self> {
        if max_workers == 0 {
            return Err(ModerationError::Config("max_workers must be at least 1".into()));
        }
        Ok(Self {
            max_workers,
            request_timeout,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(config.max_workers, config.request_timeout())
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Classify every frame the sampler emits.
    ///
    /// Per-frame failures become indeterminate results. The call fails only
    /// when the classifier cannot be prepared, nothing was sampled, or the
    /// token was cancelled. Temporary frame storage is removed on every path.
    pub async fn run<S: VideoSource + 'static>(
        &self,
        mut sampler: FrameSampler<S>,
        classifier: Arc<dyn Classifier>,
        cancel: &CancelToken,
        progress: Option<ProgressCallback>,
    ) -> Result<PipelineOutcome> {
        let started = Instant::now();
        let store = Arc::clone(sampler.store());
        let stride = sampler.stride();
        let expected = sampler.expected_frames();

        if let Err(e) = classifier.prepare().await {
            error!("❌ Classifier '{}' unavailable: {}", classifier.name(), e);
            sampler.close().await;
            if let Err(cleanup) = store.cleanup() {
                warn!("{}", cleanup);
            }
            return Err(match e {
                ModerationError::ClassifierUnavailable(_) => e,
                other => ModerationError::ClassifierUnavailable(other.to_string()),
            });
        }

        info!("🚀 Classifying frames with {} workers (expected: {:?})", self.max_workers, expected);

        let (tx, mut rx) = mpsc::channel::<FrameReport>(self.max_workers * 2);
        let submitted = Arc::new(AtomicUsize::new(0));

        let producer = tokio::spawn(produce(
            sampler,
            classifier,
            Arc::new(Semaphore::new(self.max_workers)),
            tx,
            cancel.clone(),
            self.request_timeout,
            Arc::clone(&submitted),
        ));

        let mut results = Vec::new();
        let mut storage_warnings = Vec::new();

        while let Some(report) = rx.recv().await {
            if let Some(warning) = report.storage_warning {
                storage_warnings.push(warning);
            }
            if let Some(result) = report.result {
                debug!("Frame {} → {}", result.frame_index, result.verdict);
                results.push(result);

                if let Some(ref callback) = progress {
                    callback(PipelineProgress {
                        completed: results.len(),
                        submitted: submitted.load(Ordering::SeqCst),
                        expected,
                    });
                }
            }
        }

        let summary = producer.await.map_err(|e| {
            ModerationError::Io(std::io::Error::other(format!("frame producer failed: {}", e)))
        });

        if let Err(e) = store.cleanup() {
            warn!("⚠️ {}", e);
            storage_warnings.push(e.to_string());
        }
        let summary = summary?;

        if summary.cancelled || cancel.is_cancelled() {
            info!("🛑 Pipeline cancelled after {} submitted frames", summary.submitted);
            return Err(ModerationError::Cancelled {
                last_index: summary.last_submitted,
            });
        }

        if results.is_empty() {
            return Err(summary.decode_error.unwrap_or(ModerationError::NoFrames));
        }

        let decode_warning = match summary.decode_error {
            Some(ModerationError::Decode { message, last_index }) => Some(DecodeWarning { message, last_index }),
            Some(other) => Some(DecodeWarning {
                message: other.to_string(),
                last_index: summary.last_submitted,
            }),
            None => None,
        };

        let elapsed = started.elapsed();
        info!("✅ Classified {} frames in {:.2}s", results.len(), elapsed.as_secs_f64());

        Ok(PipelineOutcome {
            results,
            stride,
            decode_warning,
            storage_warnings,
            elapsed,
        })
    }
}

/// Drain the sampler, spawning one classification task per frame
async fn produce<S: VideoSource + 'static>(
    mut sampler: FrameSampler<S>,
    classifier: Arc<dyn Classifier>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<FrameReport>,
    cancel: CancelToken,
    request_timeout: Duration,
    submitted: Arc<AtomicUsize>,
) -> ProducerSummary {
    let mut summary = ProducerSummary::default();

    loop {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }

        let frame = match sampler.next_frame().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                summary.decode_error = Some(e);
                break;
            }
            None => break,
        };

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        // Dropping the frame here releases its slot
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }

        summary.submitted += 1;
        summary.last_submitted = Some(frame.index);
        submitted.fetch_add(1, Ordering::SeqCst);

        let index = frame.index;
        let timestamp_secs = frame.timestamp_secs;
        let classifier = Arc::clone(&classifier);
        let tx = tx.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let task = tokio::spawn(async move {
                classify_frame(frame, classifier.as_ref(), &cancel, request_timeout).await
            });

            // A panicking classifier still yields a result for its frame
            let report = match task.await {
                Ok(report) => report,
                Err(e) => {
                    error!("❌ Frame {} task failed: {}", index, e);
                    FrameReport {
                        result: Some(ClassificationResult::indeterminate(
                            index,
                            timestamp_secs,
                            format!("frame task failed: {}", e),
                        )),
                        storage_warning: None,
                    }
                }
            };
            drop(permit);

            if let Err(e) = tx.send(report).await {
                error!("Failed to send frame result: {}", e);
            }
        });
    }

    sampler.close().await;
    summary
}

async fn classify_frame(
    frame: SampledFrame,
    classifier: &dyn Classifier,
    cancel: &CancelToken,
    request_timeout: Duration,
) -> FrameReport {
    let SampledFrame {
        index,
        timestamp_secs,
        storage,
        ..
    } = frame;

    let slot = match storage {
        FrameStorage::Stored(slot) => slot,
        FrameStorage::Failed(reason) => {
            return FrameReport {
                result: Some(ClassificationResult::indeterminate(
                    index,
                    timestamp_secs,
                    format!("frame not stored: {}", reason),
                )),
                storage_warning: Some(format!("frame {}: {}", index, reason)),
            };
        }
    };

    if cancel.is_cancelled() {
        debug!("Abandoning frame {} after cancellation", index);
        return FrameReport {
            result: None,
            storage_warning: release(slot),
        };
    }

    let result = match slot.read().await {
        Ok(bytes) => match tokio::time::timeout(request_timeout, classifier.classify_image(&bytes)).await {
            Ok(Ok(classification)) => ClassificationResult::from_classification(index, timestamp_secs, classification),
            Ok(Err(e)) => {
                warn!("Frame {} classification failed: {}", index, e);
                ClassificationResult::indeterminate(index, timestamp_secs, e.to_string())
            }
            Err(_) => {
                warn!("Frame {} classification timed out", index);
                ClassificationResult::indeterminate(
                    index,
                    timestamp_secs,
                    format!("classification timed out after {:?}", request_timeout),
                )
            }
        },
        Err(e) => ClassificationResult::indeterminate(index, timestamp_secs, e.to_string()),
    };

    FrameReport {
        result: Some(result),
        storage_warning: release(slot),
    }
}

fn release(slot: FrameSlot) -> Option<String> {
    slot.release().err().map(|e| e.to_string())
}
