//! Temporary on-disk storage for sampled frames.
//!
//! Every pipeline invocation gets its own directory; every frame gets its own
//! file named after its original frame index.

use image::{DynamicImage, RgbImage};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{ModerationError, Result};

/// Pipeline-scoped directory holding materialized frames
#[derive(Debug)]
pub struct FrameStore {
    dir: TempDir,
    jpeg_quality: u8,
}

impl FrameStore {
    /// Create a fresh frame directory under `parent` (or the system temp dir)
    pub fn new(parent: Option<&Path>, jpeg_quality: u8) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("frames-");
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| ModerationError::Storage(format!("cannot create frame directory: {}", e)))?;

        debug!("📁 Frame directory: {}", dir.path().display());
        Ok(Self { dir, jpeg_quality })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Location of the frame with the given original index
    pub fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.path().join(format!("frame_{:08}.jpg", index))
    }

    /// Encode an RGB24 frame as JPEG and write it to its slot
    pub async fn write_frame(
        &self,
        index: u64,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<FrameSlot> {
        let path = self.frame_path(index);
        let quality = self.jpeg_quality;
        let pixels = pixels.to_vec();

        let encoded = tokio::task::spawn_blocking(move || encode_jpeg(width, height, pixels, quality))
            .await
            .map_err(|e| ModerationError::Storage(format!("frame {} encoder panicked: {}", index, e)))??;

        tokio::fs::write(&path, encoded)
            .await
            .map_err(|e| ModerationError::Storage(format!("cannot write frame {}: {}", index, e)))?;

        Ok(FrameSlot::new(index, path))
    }

    /// Remove the directory and anything still in it
    pub fn cleanup(&self) -> Result<()> {
        let path = self.dir.path();
        if path.exists() {
            std::fs::remove_dir_all(path).map_err(|e| {
                ModerationError::Storage(format!("cannot remove {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}

fn encode_jpeg(width: u32, height: u32, pixels: Vec<u8>, quality: u8) -> Result<Vec<u8>> {
    let image = RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
        ModerationError::Storage(format!("pixel buffer does not match {}x{}", width, height))
    })?;

    let mut encoded = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, quality);
    DynamicImage::ImageRgb8(image)
        .write_with_encoder(encoder)
        .map_err(|e| ModerationError::Storage(format!("JPEG encoding failed: {}", e)))?;

    Ok(encoded)
}

/// One frame's file. Released exactly once, either explicitly or on drop.
#[derive(Debug)]
pub struct FrameSlot {
    index: u64,
    path: PathBuf,
    released: bool,
}

impl FrameSlot {
    fn new(index: u64, path: PathBuf) -> Self {
        Self {
            index,
            path,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| ModerationError::Storage(format!("cannot read frame {}: {}", self.index, e)))
    }

    /// Delete the frame file, reporting failure instead of swallowing it
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_frame_file(&self.path)
            .map_err(|e| ModerationError::Storage(format!("cannot remove frame {}: {}", self.index, e)))
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = remove_frame_file(&self.path) {
                warn!("Failed to remove frame {}: {}", self.index, e);
            }
        }
    }
}

fn remove_frame_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
