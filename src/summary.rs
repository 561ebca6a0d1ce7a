//! The finished waveform artifact and its JSON interchange form.
//!
//! `AudioSummary` is frozen at construction: the pipeline's terminal step
//! builds it, readers only inspect it. The JSON layout below is the normative
//! external representation; round-tripping yields a value equal to the
//! original within 1e-6 per amplitude.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::Algorithm;

/// A fixed-resolution amplitude summary of one audio stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSummary {
    amplitudes: Vec<f32>,
    duration: Duration,
    sample_rate: u32,
    channel_count: u16,
    algorithm: Algorithm,
    normalized: bool,
    generated_at: DateTime<Utc>,
}

impl AudioSummary {
    pub(crate) fn new(
        amplitudes: Vec<f32>,
        duration: Duration,
        sample_rate: u32,
        channel_count: u16,
        algorithm: Algorithm,
        normalized: bool,
    ) -> Self {
        Self {
            amplitudes,
            duration,
            sample_rate,
            channel_count,
            algorithm,
            normalized,
            generated_at: Utc::now(),
        }
    }

    /// Amplitude points in [0, 1], ordered by stream time.
    pub fn amplitudes(&self) -> &[f32] {
        &self.amplitudes
    }

    /// Output resolution; always `amplitudes().len()`.
    pub fn resolution(&self) -> usize {
        self.amplitudes.len()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn normalized(&self) -> bool {
        self.normalized
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Serialize to the interchange JSON form.
    pub fn to_json(&self) -> Result<String> {
        let wire = SummaryWire {
            amplitudes: self.amplitudes.clone(),
            duration_us: self.duration.as_micros() as u64,
            sample_rate: self.sample_rate,
            channel_count: self.channel_count,
            metadata: MetadataWire {
                resolution: self.amplitudes.len(),
                algorithm: self.algorithm,
                normalized: self.normalized,
                generated_at: self.generated_at,
            },
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Deserialize from the interchange JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        let wire: SummaryWire = serde_json::from_str(json)?;
        if wire.metadata.resolution != wire.amplitudes.len() {
            return Err(Error::Other(format!(
                "summary resolution {} does not match {} amplitudes",
                wire.metadata.resolution,
                wire.amplitudes.len()
            )));
        }
        Ok(Self {
            amplitudes: wire.amplitudes,
            duration: Duration::from_micros(wire.duration_us),
            sample_rate: wire.sample_rate,
            channel_count: wire.channel_count,
            algorithm: wire.metadata.algorithm,
            normalized: wire.metadata.normalized,
            generated_at: wire.metadata.generated_at,
        })
    }

    /// Equality within a per-amplitude tolerance, ignoring `generated_at`.
    /// This is the comparison the round-trip guarantee is stated in.
    pub fn approx_eq(&self, other: &Self, tolerance: f32) -> bool {
        self.amplitudes.len() == other.amplitudes.len()
            && self.duration == other.duration
            && self.sample_rate == other.sample_rate
            && self.channel_count == other.channel_count
            && self.algorithm == other.algorithm
            && self.normalized == other.normalized
            && self
                .amplitudes
                .iter()
                .zip(&other.amplitudes)
                .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

#[derive(Serialize, Deserialize)]
struct SummaryWire {
    amplitudes: Vec<f32>,
    duration_us: u64,
    sample_rate: u32,
    channel_count: u16,
    metadata: MetadataWire,
}

#[derive(Serialize, Deserialize)]
struct MetadataWire {
    resolution: usize,
    algorithm: Algorithm,
    normalized: bool,
    generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_summary() -> AudioSummary {
        AudioSummary::new(
            vec![0.0, 0.25, 0.5, 0.75, 1.0],
            Duration::from_millis(2500),
            44100,
            2,
            Algorithm::Peak,
            true,
        )
    }

    #[test]
    fn json_round_trip_preserves_value() -> anyhow::Result<()> {
        let summary = sample_summary();
        let json = summary.to_json()?;
        let back = AudioSummary::from_json(&json)?;

        assert!(summary.approx_eq(&back, 1e-6));
        assert_eq!(back.resolution(), 5);
        assert_eq!(back.generated_at(), summary.generated_at());
        Ok(())
    }

    #[test]
    fn json_layout_matches_interchange_schema() -> anyhow::Result<()> {
        let json = sample_summary().to_json()?;
        let value: serde_json::Value = serde_json::from_str(&json)?;

        assert_eq!(value["duration_us"], 2_500_000);
        assert_eq!(value["sample_rate"], 44100);
        assert_eq!(value["channel_count"], 2);
        assert_eq!(value["metadata"]["resolution"], 5);
        assert_eq!(value["metadata"]["algorithm"], "peak");
        assert_eq!(value["metadata"]["normalized"], true);
        assert!(value["metadata"]["generated_at"].is_string());
        Ok(())
    }

    #[test]
    fn from_json_rejects_resolution_mismatch() {
        let json = r#"{
            "amplitudes": [0.1, 0.2],
            "duration_us": 1000,
            "sample_rate": 8000,
            "channel_count": 1,
            "metadata": {
                "resolution": 3,
                "algorithm": "rms",
                "normalized": false,
                "generated_at": "2026-01-05T00:00:00Z"
            }
        }"#;
        let err = AudioSummary::from_json(json).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
