//! Along-track extents shared by the surface fit and canopy metrics passes

use crate::types::{pflags, PhotonError, PhotonResult};
use serde::{Deserialize, Serialize};

/// Along-track windowing shared by the fit and metrics passes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtentParams {
    /// Extent length (meters)
    pub extent_length: f64,
    /// Distance between extent starts (meters)
    pub extent_step: f64,
    /// Minimum photons for an extent to be valid
    pub min_photon_count: usize,
    /// Minimum along-track spread for an extent to be valid (meters)
    pub min_along_track_spread: f64,
    /// Process flagged extents anyway
    pub pass_invalid: bool,
}

impl Default for ExtentParams {
    fn default() -> Self {
        Self {
            extent_length: 40.0,          // ATL06 segment pair length
            extent_step: 20.0,            // half overlap
            min_photon_count: 10,
            min_along_track_spread: 20.0,
            pass_invalid: false,
        }
    }
}

impl ExtentParams {
    pub fn validate(&self) -> PhotonResult<()> {
        if !(self.extent_length > 0.0) {
            return Err(PhotonError::Config(format!(
                "extent length must be positive, got {}",
                self.extent_length
            )));
        }
        if !(self.extent_step > 0.0) {
            return Err(PhotonError::Config(format!(
                "extent step must be positive, got {}",
                self.extent_step
            )));
        }
        Ok(())
    }
}

/// Rows `[start, start + count)` of a table forming one extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: usize,
    pub count: usize,
    /// SPREAD_TOO_SHORT and TOO_FEW_PHOTONS as found before any processing
    pub pflags: u16,
}

impl Extent {
    pub fn end(&self) -> usize {
        self.start + self.count
    }

    pub fn center(&self) -> usize {
        self.start + self.count / 2
    }

    pub fn is_valid(&self) -> bool {
        self.pflags == 0
    }
}

/// Walks ordered along-track positions and yields overlapping extents
///
/// An extent covers every row within `extent_length` of its first row. The
/// next extent starts at the first row at least `extent_step` past the
/// previous start. A step that fails to move forward yields a
/// `PhotonError::Partition` and ends the walk.
pub struct ExtentPartitioner<'a> {
    x_atc: &'a [f64],
    params: &'a ExtentParams,
    i0: usize,
    stalled: bool,
}

impl<'a> ExtentPartitioner<'a> {
    pub fn new(x_atc: &'a [f64], params: &'a ExtentParams) -> Self {
        Self {
            x_atc,
            params,
            i0: 0,
            stalled: false,
        }
    }
}

impl Iterator for ExtentPartitioner<'_> {
    type Item = PhotonResult<Extent>;

    fn next(&mut self) -> Option<Self::Item> {
        let x = self.x_atc;
        let len = x.len();

        if self.stalled {
            self.stalled = false;
            self.i0 = len;
            return Some(Err(PhotonError::Partition(
                "failed to move to next extent in track".to_string(),
            )));
        }
        if self.i0 >= len {
            return None;
        }

        let i0 = self.i0;
        let mut i1 = i0;
        while i1 + 1 < len && x[i1 + 1] - x[i0] < self.params.extent_length {
            i1 += 1;
        }

        let mut flags = 0;
        if x[i1] - x[i0] < self.params.min_along_track_spread {
            flags |= pflags::SPREAD_TOO_SHORT;
        }
        let count = i1 - i0 + 1;
        if count < self.params.min_photon_count {
            flags |= pflags::TOO_FEW_PHOTONS;
        }

        let mut next = i0;
        while next < len && x[next] - x[i0] < self.params.extent_step {
            next += 1;
        }
        if next == i0 {
            self.stalled = true;
        }
        self.i0 = next;

        Some(Ok(Extent {
            start: i0,
            count,
            pflags: flags,
        }))
    }
}
