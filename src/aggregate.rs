use serde::{Deserialize, Serialize};

use crate::classifier::{ClassificationResult, Verdict};
use crate::error::DecodeWarning;

/// Number of results per verdict
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerdictCounts {
    pub compliant: usize,
    pub non_compliant: usize,
    pub indeterminate: usize,
}

impl VerdictCounts {
    pub fn record(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Compliant => self.compliant += 1,
            Verdict::NonCompliant => self.non_compliant += 1,
            Verdict::Indeterminate => self.indeterminate += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.compliant + self.non_compliant + self.indeterminate
    }
}

impl FromIterator<Verdict> for VerdictCounts {
    fn from_iter<I: IntoIterator<Item = Verdict>>(iter: I) -> Self {
        let mut counts = Self::default();
        for verdict in iter {
            counts.record(verdict);
        }
        counts
    }
}

/// Whole-video decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateVerdict {
    pub compliant: bool,
    /// Per-frame results sorted by frame index
    pub frames: Vec<ClassificationResult>,
    pub first_non_compliant_index: Option<u64>,
    pub indeterminate_indices: Vec<u64>,
    pub counts: VerdictCounts,
    /// Set when decoding stopped early and the verdict covers a prefix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decode_warning: Option<DecodeWarning>,
}

impl AggregateVerdict {
    /// Compliant overall, but some frames could not be checked
    pub fn needs_review(&self) -> bool {
        self.compliant && (!self.indeterminate_indices.is_empty() || self.decode_warning.is_some())
    }
}

/// Folds per-frame results (in any order) into an [`AggregateVerdict`]
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn aggregate(results: &[ClassificationResult]) -> AggregateVerdict {
        let mut frames = results.to_vec();
        frames.sort_by_key(|r| r.frame_index);

        let first_non_compliant_index = frames
            .iter()
            .find(|r| r.verdict == Verdict::NonCompliant)
            .map(|r| r.frame_index);

        let indeterminate_indices = frames
            .iter()
            .filter(|r| r.verdict == Verdict::Indeterminate)
            .map(|r| r.frame_index)
            .collect();

        let counts = frames.iter().map(|r| r.verdict).collect();

        AggregateVerdict {
            compliant: first_non_compliant_index.is_none(),
            frames,
            first_non_compliant_index,
            indeterminate_indices,
            counts,
            decode_warning: None,
        }
    }

    pub fn aggregate_with_warning(
        results: &[ClassificationResult],
        decode_warning: Option<DecodeWarning>,
    ) -> AggregateVerdict {
        AggregateVerdict {
            decode_warning,
            ..Self::aggregate(results)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(index: u64, verdict: Verdict) -> ClassificationResult {
        ClassificationResult {
            frame_index: index,
            timestamp_secs: index as f64 / 10.0,
            verdict,
            raw: Some(json!({ "conclusionType": 1 })),
            error: None,
        }
    }

    #[test]
    fn test_sorts_completion_order_by_index() {
        let arrived = vec![
            result(5, Verdict::NonCompliant),
            result(0, Verdict::Compliant),
            result(10, Verdict::Compliant),
        ];

        let verdict = ResultAggregator::aggregate(&arrived);

        let order: Vec<u64> = verdict.frames.iter().map(|r| r.frame_index).collect();
        assert_eq!(order, vec![0, 5, 10]);
        assert!(!verdict.compliant);
        assert_eq!(verdict.first_non_compliant_index, Some(5));
        assert_eq!(verdict.counts.non_compliant, 1);
        assert_eq!(verdict.counts.total(), 3);
    }

    #[test]
    fn test_reports_smallest_non_compliant_index() {
        let arrived = vec![
            result(30, Verdict::NonCompliant),
            result(15, Verdict::NonCompliant),
            result(0, Verdict::Compliant),
        ];
        assert_eq!(ResultAggregator::aggregate(&arrived).first_non_compliant_index, Some(15));
    }

    #[test]
    fn test_indeterminate_does_not_flip_verdict() {
        let arrived = vec![
            result(0, Verdict::Compliant),
            ClassificationResult::indeterminate(5, 0.5, "timed out"),
            ClassificationResult::indeterminate(10, 1.0, "HTTP 503"),
        ];

        let verdict = ResultAggregator::aggregate(&arrived);
        assert!(verdict.compliant);
        assert_eq!(verdict.indeterminate_indices, vec![5, 10]);
        assert!(verdict.needs_review());
    }

    #[test]
    fn test_idempotent_under_reordering() {
        let mut arrived: Vec<_> = (0..20)
            .map(|i| {
                let verdict = if i % 7 == 3 { Verdict::NonCompliant } else { Verdict::Compliant };
                result(i * 5, verdict)
            })
            .collect();

        let forward = ResultAggregator::aggregate(&arrived);
        arrived.reverse();
        let reversed = ResultAggregator::aggregate(&arrived);
        arrived.rotate_left(7);
        let rotated = ResultAggregator::aggregate(&arrived);

        assert_eq!(forward, reversed);
        assert_eq!(forward, rotated);
        assert_eq!(ResultAggregator::aggregate(&forward.frames), forward);
    }

    #[test]
    fn test_empty_input_is_compliant() {
        let verdict = ResultAggregator::aggregate(&[]);
        assert!(verdict.compliant);
        assert!(verdict.frames.is_empty());
        assert!(!verdict.needs_review());
    }

    #[test]
    fn test_decode_warning_is_attached() {
        let warning = DecodeWarning {
            message: "truncated".into(),
            last_index: Some(10),
        };
        let verdict = ResultAggregator::aggregate_with_warning(&[result(0, Verdict::Compliant)], Some(warning.clone()));
        assert_eq!(verdict.decode_warning, Some(warning));
        assert!(verdict.needs_review());
    }
}
