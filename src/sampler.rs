use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ModerationError, Result};
use crate::storage::{FrameSlot, FrameStore};
use crate::video::VideoSource;

/// Default number of frames per second retained for classification
pub const DEFAULT_TARGET_FPS: f64 = 2.0;

/// Where a sampled frame's encoded bytes live
#[derive(Debug)]
pub enum FrameStorage {
    Stored(FrameSlot),
    /// Materialization failed; the frame is still reported, as indeterminate
    Failed(String),
}

/// One frame selected for classification
#[derive(Debug)]
pub struct SampledFrame {
    /// Zero-based index in the original stream
    pub index: u64,
    /// Position in the video in seconds
    pub timestamp_secs: f64,
    pub width: u32,
    pub height: u32,
    /// RGB24 pixels
    pub pixels: Vec<u8>,
    pub storage: FrameStorage,
}

/// Frame interval for the given rates: `max(1, round(native / target))`
pub fn compute_stride(native_fps: f64, target_fps: f64) -> Result<u64> {
    if !(native_fps.is_finite() && native_fps > 0.0) {
        return Err(ModerationError::InvalidSource(format!(
            "unusable native frame rate: {}",
            native_fps
        )));
    }
    if !(target_fps.is_finite() && target_fps > 0.0) {
        return Err(ModerationError::Config(format!(
            "target_fps must be positive, got {}",
            target_fps
        )));
    }

    Ok(((native_fps / target_fps).round() as u64).max(1))
}

/// Emits every `stride`-th frame of a video source, materialized to disk
pub struct FrameSampler<S> {
    source: S,
    store: Arc<FrameStore>,
    native_fps: f64,
    stride: u64,
    cursor: u64,
    last_emitted: Option<u64>,
    finished: bool,
}

impl<S: VideoSource> FrameSampler<S> {
    pub fn new(source: S, target_fps: f64, store: Arc<FrameStore>) -> Result<Self> {
        let native_fps = source.native_fps().ok_or_else(|| {
            ModerationError::InvalidSource("native frame rate could not be determined".into())
        })?;
        let stride = compute_stride(native_fps, target_fps)?;

        info!("🎞️ Sampling at {:.2}fps from {:.2}fps source (stride {})",
              target_fps, native_fps, stride);

        Ok(Self {
            source,
            store,
            native_fps,
            stride,
            cursor: 0,
            last_emitted: None,
            finished: false,
        })
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    /// Number of frames this sampler will emit, when the source length is known
    pub fn expected_frames(&self) -> Option<usize> {
        self.source
            .frame_count()
            .map(|count| count.div_ceil(self.stride) as usize)
    }

    /// Next sampled frame; `None` once the stream ended or failed
    pub async fn next_frame(&mut self) -> Option<Result<SampledFrame>> {
        while !self.finished {
            let pixels = match self.source.read_frame().await {
                Ok(Some(pixels)) => pixels,
                Ok(None) => {
                    debug!("End of stream after {} frames", self.cursor);
                    self.finish().await;
                    return None;
                }
                Err(e) => {
                    self.finish().await;
                    let message = match e {
                        ModerationError::Decode { message, .. } => message,
                        other => other.to_string(),
                    };
                    warn!("Decode failed after frame {:?}: {}", self.last_emitted, message);
                    return Some(Err(ModerationError::Decode {
                        message,
                        last_index: self.last_emitted,
                    }));
                }
            };

            let index = self.cursor;
            self.cursor += 1;
            if index % self.stride != 0 {
                continue;
            }

            let (width, height) = self.source.dimensions();
            let storage = match self.store.write_frame(index, width, height, &pixels).await {
                Ok(slot) => FrameStorage::Stored(slot),
                Err(e) => {
                    warn!("Frame {} could not be stored: {}", index, e);
                    FrameStorage::Failed(e.to_string())
                }
            };

            self.last_emitted = Some(index);

            return Some(Ok(SampledFrame {
                index,
                timestamp_secs: index as f64 / self.native_fps,
                width,
                height,
                pixels,
                storage,
            }));
        }

        None
    }

    async fn finish(&mut self) {
        self.finished = true;
        if let Err(e) = self.source.close().await {
            warn!("Failed to close video source: {}", e);
        }
    }

    /// Stop reading early (e.g. on cancellation)
    pub async fn close(&mut self) {
        if !self.finished {
            self.finish().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// In-memory source producing `total` tiny frames, optionally failing at `fail_at`
    pub(crate) struct SyntheticSource {
        pub fps: Option<f64>,
        pub total: u64,
        pub fail_at: Option<u64>,
        /// Bytes per frame; 12 matches the 2x2 RGB dimensions
        pub frame_len: usize,
        pub read: u64,
        pub closed: bool,
    }

    impl SyntheticSource {
        pub(crate) fn new(fps: f64, total: u64) -> Self {
            Self {
                fps: Some(fps),
                total,
                fail_at: None,
                frame_len: 12,
                read: 0,
                closed: false,
            }
        }
    }

    #[async_trait]
    impl VideoSource for SyntheticSource {
        fn native_fps(&self) -> Option<f64> {
            self.fps
        }

        fn frame_count(&self) -> Option<u64> {
            Some(self.total)
        }

        fn dimensions(&self) -> (u32, u32) {
            (2, 2)
        }

        async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
            if Some(self.read) == self.fail_at {
                return Err(ModerationError::Decode {
                    message: "corrupt packet".into(),
                    last_index: None,
                });
            }
            if self.read >= self.total {
                return Ok(None);
            }
            let index = self.read;
            self.read += 1;
            // Gray level encodes the index so scripted classifiers can tell frames apart
            Ok(Some(vec![((index % 25) * 10) as u8; self.frame_len]))
        }

        async fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn store() -> Arc<FrameStore> {
        Arc::new(FrameStore::new(None, 80).unwrap())
    }

    async fn drain(sampler: &mut FrameSampler<SyntheticSource>) -> (Vec<SampledFrame>, Option<ModerationError>) {
        let mut frames = Vec::new();
        while let Some(item) = sampler.next_frame().await {
            match item {
                Ok(frame) => frames.push(frame),
                Err(e) => return (frames, Some(e)),
            }
        }
        (frames, None)
    }

    #[test]
    fn test_compute_stride() {
        assert_eq!(compute_stride(10.0, 2.0).unwrap(), 5);
        assert_eq!(compute_stride(30.0, 2.0).unwrap(), 15);
        assert_eq!(compute_stride(29.97, 2.0).unwrap(), 15);
        assert_eq!(compute_stride(1.0, 2.0).unwrap(), 1);
        assert_eq!(compute_stride(25.0, 25.0).unwrap(), 1);
        assert!(matches!(compute_stride(0.0, 2.0), Err(ModerationError::InvalidSource(_))));
        assert!(matches!(compute_stride(-5.0, 2.0), Err(ModerationError::InvalidSource(_))));
        assert!(compute_stride(30.0, 0.0).is_err());
    }

    #[tokio::test]
    async fn test_samples_every_stride_frame() {
        let mut sampler = FrameSampler::new(SyntheticSource::new(10.0, 23), 2.0, store()).unwrap();
        assert_eq!(sampler.stride(), 5);
        assert_eq!(sampler.expected_frames(), Some(5));

        let (frames, err) = drain(&mut sampler).await;
        assert!(err.is_none());

        let indices: Vec<u64> = frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 5, 10, 15, 20]);
        assert_eq!(frames[1].timestamp_secs, 0.5);
        assert!(sampler.source.closed);
    }

    #[tokio::test]
    async fn test_sample_count_tracks_duration() {
        // 30fps for 60 seconds at 2fps -> ~120 frames
        let mut sampler = FrameSampler::new(SyntheticSource::new(30.0, 1800), 2.0, store()).unwrap();
        let (frames, _) = drain(&mut sampler).await;

        let expected = 60.0 * 2.0;
        assert!((frames.len() as f64 - expected).abs() <= 1.0);
    }

    #[tokio::test]
    async fn test_indices_strictly_increase_and_files_are_unique() {
        let mut sampler = FrameSampler::new(SyntheticSource::new(24.0, 100), 3.0, store()).unwrap();
        let (frames, _) = drain(&mut sampler).await;

        for pair in frames.windows(2) {
            assert!(pair[0].index < pair[1].index);
        }

        let paths: HashSet<_> = frames
            .iter()
            .filter_map(|f| match &f.storage {
                FrameStorage::Stored(slot) => Some(slot.path().to_path_buf()),
                FrameStorage::Failed(_) => None,
            })
            .collect();
        assert_eq!(paths.len(), frames.len());
    }

    #[tokio::test]
    async fn test_missing_frame_rate_is_invalid_source() {
        let mut source = SyntheticSource::new(10.0, 10);
        source.fps = None;
        let err = FrameSampler::new(source, 2.0, store()).err().unwrap();
        assert!(matches!(err, ModerationError::InvalidSource(_)));

        let err = FrameSampler::new(SyntheticSource::new(0.0, 10), 2.0, store()).err().unwrap();
        assert!(matches!(err, ModerationError::InvalidSource(_)));
    }

    #[tokio::test]
    async fn test_decode_error_keeps_emitted_frames() {
        let mut source = SyntheticSource::new(10.0, 50);
        source.fail_at = Some(12);
        let mut sampler = FrameSampler::new(source, 2.0, store()).unwrap();

        let (frames, err) = drain(&mut sampler).await;
        assert_eq!(frames.iter().map(|f| f.index).collect::<Vec<_>>(), vec![0, 5, 10]);
        match err {
            Some(ModerationError::Decode { last_index, message }) => {
                assert_eq!(last_index, Some(10));
                assert_eq!(message, "corrupt packet");
            }
            other => panic!("expected decode error, got {:?}", other),
        }

        // The sequence is not restartable
        assert!(sampler.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_stream_terminates_cleanly() {
        let mut sampler = FrameSampler::new(SyntheticSource::new(10.0, 0), 2.0, store()).unwrap();
        let (frames, err) = drain(&mut sampler).await;
        assert!(frames.is_empty());
        assert!(err.is_none());
    }
}
