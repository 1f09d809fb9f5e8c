pub mod baidu;
pub mod cache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ClassifierConfig;
use crate::error::Result;

pub use baidu::BaiduClassifier;
pub use cache::CachingClassifier;

/// Classification outcome for one unit of content
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Compliant,
    NonCompliant,
    /// The provider could not decide, or the call failed
    Indeterminate,
}

impl Verdict {
    pub fn is_definitive(&self) -> bool {
        !matches!(self, Verdict::Indeterminate)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Verdict::Compliant => "compliant",
            Verdict::NonCompliant => "non-compliant",
            Verdict::Indeterminate => "indeterminate",
        };
        f.write_str(label)
    }
}

/// A classifier's answer for one payload
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub verdict: Verdict,
    /// Provider response, kept opaque
    pub raw: serde_json::Value,
}

/// Outcome of classifying one frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub frame_index: u64,
    pub timestamp_secs: f64,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
    /// Why the frame ended up indeterminate, if it failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClassificationResult {
    pub fn from_classification(frame_index: u64, timestamp_secs: f64, classification: Classification) -> Self {
        Self {
            frame_index,
            timestamp_secs,
            verdict: classification.verdict,
            raw: Some(classification.raw),
            error: None,
        }
    }

    /// Result recorded when a frame could not be classified
    pub fn indeterminate(frame_index: u64, timestamp_secs: f64, error: impl Into<String>) -> Self {
        Self {
            frame_index,
            timestamp_secs,
            verdict: Verdict::Indeterminate,
            raw: None,
            error: Some(error.into()),
        }
    }
}

/// External capability turning raw content into a verdict
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Acquire whatever the classifier needs before the first call
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn classify_image(&self, image: &[u8]) -> Result<Classification>;

    async fn classify_text(&self, text: &str) -> Result<Classification>;

    fn name(&self) -> &str;
}

/// Create the configured classifier, wrapped in a result cache if enabled
pub fn create_classifier(config: &ClassifierConfig) -> Result<Arc<dyn Classifier>> {
    let baidu = BaiduClassifier::new(config.baidu.clone())?;
    if config.cache_results {
        Ok(Arc::new(CachingClassifier::new(baidu)))
    } else {
        Ok(Arc::new(baidu))
    }
}

/// Classification helper for one-off payloads: failures become indeterminate
pub(crate) fn classification_or_indeterminate(result: Result<Classification>) -> (Classification, Option<String>) {
    match result {
        Ok(classification) => (classification, None),
        Err(e) => (
            Classification {
                verdict: Verdict::Indeterminate,
                raw: serde_json::Value::Null,
            },
            Some(e.to_string()),
        ),
    }
}
