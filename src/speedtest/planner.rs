use std::fmt;
use tracing::debug;

use super::error::{Result, SpeedTestError};
use super::Direction;

const MB: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Small,
    Medium,
    Large,
    ExtraLarge,
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Band::Small => "small",
            Band::Medium => "medium",
            Band::Large => "large",
            Band::ExtraLarge => "extra-large",
        };
        f.write_str(name)
    }
}

/// A band covers `[min_mbps, next band's min_mbps)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BandSpec {
    pub band: Band,
    pub min_mbps: f64,
    pub download_bytes: u64,
    pub upload_bytes: u64,
}

pub fn default_bands() -> Vec<BandSpec> {
    vec![
        BandSpec { band: Band::Small, min_mbps: 0.0, download_bytes: 5 * MB, upload_bytes: 2 * MB },
        BandSpec { band: Band::Medium, min_mbps: 10.0, download_bytes: 20 * MB, upload_bytes: 10 * MB },
        BandSpec { band: Band::Large, min_mbps: 50.0, download_bytes: 50 * MB, upload_bytes: 20 * MB },
        BandSpec { band: Band::ExtraLarge, min_mbps: 200.0, download_bytes: 100 * MB, upload_bytes: 50 * MB },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub band: Band,
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub stream_count: usize,
}

impl TransferPlan {
    /// Per-stream payload for one direction.
    pub fn payload_bytes(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Download => self.download_bytes,
            Direction::Upload => self.upload_bytes,
        }
    }
}

/// Maps a rough speed estimate onto a payload/parallelism plan.
///
/// Stream count is a constant of the planner, not derived from the
/// estimate: one connection cannot fill a fast link, and many
/// connections only add overhead on a slow one.
#[derive(Debug, Clone)]
pub struct AdaptivePlanner {
    bands: Vec<BandSpec>,
    stream_count: usize,
}

impl AdaptivePlanner {
    pub fn new(bands: Vec<BandSpec>, stream_count: usize) -> Result<Self> {
        if stream_count == 0 {
            return Err(SpeedTestError::InvalidConfig("stream count must be at least 1".into()));
        }
        match bands.first() {
            None => return Err(SpeedTestError::InvalidConfig("no bands configured".into())),
            Some(first) if first.min_mbps != 0.0 => {
                return Err(SpeedTestError::InvalidConfig(format!(
                    "lowest band must start at 0 Mbps, starts at {}",
                    first.min_mbps
                )))
            }
            Some(_) => {}
        }
        if let Some(pair) = bands.windows(2).find(|w| !(w[1].min_mbps > w[0].min_mbps)) {
            return Err(SpeedTestError::InvalidConfig(format!(
                "band thresholds must ascend: {} then {}",
                pair[0].min_mbps, pair[1].min_mbps
            )));
        }
        if let Some(band_spec) = bands.iter().find(|b| b.download_bytes == 0 || b.upload_bytes == 0) {
            return Err(SpeedTestError::InvalidConfig(format!("{} band has an empty payload", band_spec.band)));
        }

        Ok(Self { bands, stream_count })
    }

    pub fn plan(&self, estimated_mbps: f64) -> TransferPlan {
        let chosen = if estimated_mbps.is_finite() && estimated_mbps >= 0.0 {
            self.bands
                .iter()
                .rev()
                .find(|b| estimated_mbps >= b.min_mbps)
                .unwrap_or(&self.bands[0])
        } else {
            self.fallback_band()
        };

        let plan = TransferPlan {
            band: chosen.band,
            download_bytes: chosen.download_bytes,
            upload_bytes: chosen.upload_bytes,
            stream_count: self.stream_count,
        };
        debug!(estimated_mbps, band = %plan.band, "selected transfer plan");
        plan
    }

    fn fallback_band(&self) -> &BandSpec {
        self.bands
            .iter()
            .find(|b| b.band == Band::Medium)
            .unwrap_or(&self.bands[0])
    }
}

impl Default for AdaptivePlanner {
    fn default() -> Self {
        Self {
            bands: default_bands(),
            stream_count: 3,
        }
    }
}
