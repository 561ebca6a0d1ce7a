//! Job configuration.
//!
//! `JobDescriptor` is *library-level configuration*, not CLI flags: frontends
//! (apps, services, tests, batch tools) construct one programmatically and
//! hand it to the pool or to `summarize_file`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::progress::CancelHandle;

/// How a window of samples is collapsed into one amplitude point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Root mean square of the window. Best default for perceived loudness.
    Rms,
    /// Maximum absolute sample. Preserves transients.
    Peak,
    /// Mean absolute sample.
    Average,
    /// Median absolute sample. Robust against clicks.
    Median,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Rms => "rms",
            Algorithm::Peak => "peak",
            Algorithm::Average => "average",
            Algorithm::Median => "median",
        }
    }
}

/// Whole-sequence normalization applied once, when the summary is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Leave amplitudes as produced.
    None,
    /// Scale so the largest point becomes 1.0.
    Peak,
    /// Scale so the sequence RMS lands on a fixed reference level.
    Rms,
    /// Map the observed [min, max] range onto [0, 1].
    MinMax,
}

/// Pointwise curve applied after smoothing, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingCurve {
    Linear,
    /// Decibel-like curve; lifts quiet detail.
    Log,
    /// Exponential curve; emphasizes loud sections.
    Exp,
    /// Square root; a gentler lift than `Log`.
    Sqrt,
}

/// Everything needed to run one waveform summary job.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    /// Input file. Format is detected from magic bytes, never the extension.
    pub path: PathBuf,

    /// Required number of amplitude points in the output.
    pub resolution: usize,

    pub algorithm: Algorithm,
    pub normalization: Normalization,
    pub scaling_curve: ScalingCurve,

    /// Moving-average window over the finished points; 0 disables smoothing.
    pub smoothing_window: usize,

    /// Preferred byte-chunk size. Clamped to the format's valid range; the
    /// pipeline may shrink it further under memory pressure.
    pub chunk_size_hint: Option<usize>,

    /// Per-job soft memory ceiling (bytes) for in-flight chunk data.
    pub memory_budget: Option<usize>,

    /// Wall-clock limit; on expiry the job resolves with `Deadline`.
    pub deadline: Option<Duration>,

    /// External cancellation handle. When `None`, `submit` creates one and
    /// returns it on the job handle.
    pub cancel: Option<CancelHandle>,

    /// How many consecutive chunk decode failures are skipped before the job
    /// aborts with `PartialFailure`.
    pub max_consecutive_failures: u32,

    /// Attach un-normalized partial amplitude snapshots to progress records.
    pub report_partial: bool,
}

impl JobDescriptor {
    /// A descriptor with the documented defaults: RMS amplitudes, no
    /// normalization, linear scale, no smoothing, three-strike recovery.
    pub fn new(path: impl Into<PathBuf>, resolution: usize) -> Self {
        Self {
            path: path.into(),
            resolution,
            algorithm: Algorithm::Rms,
            normalization: Normalization::None,
            scaling_curve: ScalingCurve::Linear,
            smoothing_window: 0,
            chunk_size_hint: None,
            memory_budget: None,
            deadline: None,
            cancel: None,
            max_consecutive_failures: 3,
            report_partial: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let job = JobDescriptor::new("/tmp/a.flac", 500);
        assert_eq!(job.resolution, 500);
        assert_eq!(job.algorithm, Algorithm::Rms);
        assert_eq!(job.normalization, Normalization::None);
        assert_eq!(job.scaling_curve, ScalingCurve::Linear);
        assert_eq!(job.max_consecutive_failures, 3);
        assert!(job.cancel.is_none());
        assert!(!job.report_partial);
    }

    #[test]
    fn algorithm_wire_names_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&Algorithm::Rms).expect("serialize"),
            "\"rms\""
        );
        assert_eq!(Algorithm::Median.as_str(), "median");
        let parsed: Algorithm = serde_json::from_str("\"peak\"").expect("deserialize");
        assert_eq!(parsed, Algorithm::Peak);
    }
}
