//! YAPC photon density scoring
//!
//! Each photon gets a byte score in `[0, 255]` from the vertical proximity
//! of its along-track neighbours. Version 3 windows every photon locally;
//! versions 1 and 2 window by ATL03 segment.

use crate::types::{PhotonError, PhotonResult};
use serde::{Deserialize, Serialize};

/// YAPC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YapcParams {
    /// Minimum score for a photon to be kept
    pub score: u8,
    /// 0 reads `weight_ph` from the granule, 1 to 3 compute it
    pub version: u8,
    /// Neighbour count for versions 1 and 2, 0 derives it per segment
    pub knn: usize,
    /// Minimum neighbour count for version 3
    pub min_knn: usize,
    /// Vertical window (meters)
    pub win_h: f64,
    /// Along-track window (meters)
    pub win_x: f64,
}

impl Default for YapcParams {
    fn default() -> Self {
        Self {
            score: 0,
            version: 3,
            knn: 0,
            min_knn: 5,
            win_h: 6.0,
            win_x: 15.0,
        }
    }
}

impl YapcParams {
    pub fn validate(&self) -> PhotonResult<()> {
        if self.version > 3 {
            return Err(PhotonError::Config(format!(
                "invalid YAPC version specified: {}",
                self.version
            )));
        }
        if !(self.win_x > 0.0) {
            return Err(PhotonError::Config(format!(
                "YAPC along-track window must be positive, got {}",
                self.win_x
            )));
        }
        if self.version == 3 && !(self.win_h > 0.0) {
            return Err(PhotonError::Config(format!(
                "YAPC version 3 needs a positive height window, got {}",
                self.win_h
            )));
        }
        if self.win_h < 0.0 {
            return Err(PhotonError::Config(format!(
                "YAPC height window is negative: {}",
                self.win_h
            )));
        }
        Ok(())
    }
}

/// Beam columns the scorer reads, aligned with the photon window
#[derive(Debug, Clone, Copy)]
pub struct YapcInputs<'a> {
    pub segment_ph_cnt: &'a [u32],
    /// Along-track distance of each segment start
    pub segment_dist_x: &'a [f64],
    /// Along-track distance of each photon from its segment start
    pub dist_ph_along: &'a [f64],
    pub h_ph: &'a [f64],
}

impl YapcInputs<'_> {
    fn check(&self) -> PhotonResult<()> {
        let segments = self.segment_ph_cnt.len();
        if self.segment_dist_x.len() != segments {
            return Err(PhotonError::DataConsistency(format!(
                "{} segment distances for {} segments",
                self.segment_dist_x.len(),
                segments
            )));
        }
        let photons: usize = self.segment_ph_cnt.iter().map(|&c| c as usize).sum();
        if self.dist_ph_along.len() != photons || self.h_ph.len() != photons {
            return Err(PhotonError::DataConsistency(format!(
                "segment counts total {} photons, got {} distances and {} heights",
                photons,
                self.dist_ph_along.len(),
                self.h_ph.len()
            )));
        }
        Ok(())
    }

    /// Absolute along-track position of every photon
    fn photon_distance(&self) -> Vec<f64> {
        let mut distance = Vec::with_capacity(self.dist_ph_along.len());
        let mut photon = 0;
        for (&count, &start) in self.segment_ph_cnt.iter().zip(self.segment_dist_x) {
            for _ in 0..count {
                distance.push(start + self.dist_ph_along[photon]);
                photon += 1;
            }
        }
        distance
    }
}

/// Scores photons with the configured YAPC version
#[derive(Debug, Clone)]
pub struct YapcScorer {
    params: YapcParams,
    min_photon_count: usize,
}

impl YapcScorer {
    const MAX_KNN: usize = 25;
    const MAXIMUM_HSPREAD: f64 = 15000.0;
    const HSPREAD_BINSIZE: f64 = 1.0;

    /// `min_photon_count` gates segments for versions 1 and 2
    pub fn new(params: YapcParams, min_photon_count: usize) -> PhotonResult<Self> {
        params.validate()?;
        if params.version == 0 {
            return Err(PhotonError::Config(
                "YAPC version 0 reads scores from the granule".to_string(),
            ));
        }
        Ok(Self {
            params,
            min_photon_count,
        })
    }

    pub fn params(&self) -> &YapcParams {
        &self.params
    }

    pub fn score(&self, inputs: &YapcInputs<'_>) -> PhotonResult<Vec<u8>> {
        inputs.check()?;
        let scores = match self.params.version {
            3 => self.score_local(inputs),
            1 | 2 => self.score_segments(inputs),
            other => {
                return Err(PhotonError::Config(format!(
                    "invalid YAPC version specified: {}",
                    other
                )))
            }
        };
        log::debug!(
            "YAPC v{} scored {} photons",
            self.params.version,
            scores.len()
        );
        Ok(scores)
    }

    /// Versions 1 and 2: neighbours come from the previous, current and next segment
    fn score_segments(&self, inputs: &YapcInputs<'_>) -> Vec<u8> {
        let counts = inputs.segment_ph_cnt;
        let h = inputs.h_ph;
        let x = inputs.photon_distance();
        let mut scores = vec![0u8; h.len()];
        let half_win_x = self.params.win_x / 2.0;
        let mut nearest = [0.0f64; Self::MAX_KNN];

        let mut c0 = 0usize;
        for (segment, &count) in counts.iter().enumerate() {
            let n = count as usize;
            let c1 = c0 + n;
            let b0 = c0 - if segment > 0 { counts[segment - 1] as usize } else { 0 };
            let b1 = c1 + counts.get(segment + 1).map_or(0, |&c| c as usize);

            let knn = if self.params.knn != 0 {
                self.params.knn
            } else {
                (((n as f64).sqrt() / 2.0).round() as usize).max(1)
            }
            .min(Self::MAX_KNN);

            if n <= knn || n < self.min_photon_count {
                c0 = c1;
                continue;
            }

            let (min_h, max_h) = min_max(&h[c0..c1]);
            let (min_x, max_x) = min_max(&x[c0..c1]);
            let hspread = max_h - min_h;
            let xspread = max_x - min_x;
            if hspread <= 0.0 || hspread > Self::MAXIMUM_HSPREAD || xspread <= 0.0 {
                log::error!(
                    "Unable to perform YAPC selection due to invalid photon spread: {}, {}",
                    hspread,
                    xspread
                );
                c0 = c1;
                continue;
            }

            let num_bins = (hspread / Self::HSPREAD_BINSIZE) as usize + 1;
            let mut bins = vec![false; num_bins];
            for &height in &h[c0..c1] {
                let bin = ((height - min_h) / Self::HSPREAD_BINSIZE) as usize;
                bins[bin.min(num_bins - 1)] = true;
            }
            let occupied = bins.iter().filter(|&&b| b).count();
            let h_span = occupied as f64 * Self::HSPREAD_BINSIZE / n as f64 * knn as f64;

            let half_win_h = if self.params.win_h != 0.0 {
                self.params.win_h / 2.0
            } else {
                h_span / 2.0
            };

            for y in c0..c1 {
                let mut smallest = f64::MAX;
                let mut smallest_index = 0;
                let mut found = 0;

                for neighbor in b0..b1 {
                    if neighbor == y || (x[neighbor] - x[y]).abs() > half_win_x {
                        continue;
                    }
                    let proximity = half_win_h - (h[neighbor] - h[y]).abs();

                    if found < knn {
                        if proximity < smallest {
                            smallest = proximity;
                            smallest_index = found;
                        }
                        nearest[found] = proximity;
                        found += 1;
                    } else if proximity > smallest {
                        nearest[smallest_index] = proximity;
                        smallest = proximity;
                        for (k, &value) in nearest[..knn].iter().enumerate() {
                            if value < smallest {
                                smallest = value;
                                smallest_index = k;
                            }
                        }
                    }
                }

                let sum: f64 = nearest[..found].iter().filter(|&&p| p > 0.0).sum();
                let mean = sum / knn as f64;
                scores[y] = to_score(mean / half_win_h);
            }

            c0 = c1;
        }

        scores
    }

    /// Version 3: neighbours within a window centred on each photon
    fn score_local(&self, inputs: &YapcInputs<'_>) -> Vec<u8> {
        let half_win_x = self.params.win_x / 2.0;
        let half_win_h = self.params.win_h / 2.0;
        let min_knn = self.params.min_knn;
        let h = inputs.h_ph;
        let x = inputs.photon_distance();
        let num_photons = h.len();
        let mut scores = vec![0u8; num_photons];
        let mut proximities: Vec<f64> = Vec::new();

        let mut photon = 0usize;
        for &count in inputs.segment_ph_cnt {
            let start = photon;
            let mut weights = Vec::with_capacity(count as usize);
            let mut max_knn = min_knn;

            for _ in 0..count {
                proximities.clear();

                for neighbor in (0..photon).rev() {
                    let x_dist = x[photon] - x[neighbor];
                    if x_dist <= half_win_x {
                        let proximity = (h[photon] - h[neighbor]).abs();
                        if proximity <= half_win_h {
                            proximities.push(proximity);
                        }
                    }
                    if x_dist >= half_win_x + 1.0 {
                        break;
                    }
                }
                for neighbor in photon + 1..num_photons {
                    let x_dist = x[neighbor] - x[photon];
                    if x_dist <= half_win_x {
                        let proximity = (h[photon] - h[neighbor]).abs();
                        if proximity <= half_win_h {
                            proximities.push(proximity);
                        }
                    }
                    if x_dist >= half_win_x + 1.0 {
                        break;
                    }
                }

                proximities.sort_by(|a, b| a.total_cmp(b));

                let knn = ((proximities.len() as f64).sqrt().round() as usize).max(min_knn);
                max_knn = max_knn.max(knn);

                let weight: f64 = proximities
                    .iter()
                    .take(knn)
                    .map(|p| half_win_h - p)
                    .sum();
                weights.push(weight);
                photon += 1;
            }

            let norm = half_win_h * max_knn.max(1) as f64;
            for (offset, weight) in weights.into_iter().enumerate() {
                scores[start + offset] = to_score(weight / norm);
            }
        }

        scores
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

fn to_score(fraction: f64) -> u8 {
    (fraction * 255.0).clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three 20 m segments of 20 photons on a flat surface, with one far outlier
    fn flat_track() -> (Vec<u32>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let counts = vec![20, 20, 20];
        let segment_dist_x = vec![0.0, 20.0, 40.0];
        let mut along = Vec::new();
        let mut heights = Vec::new();
        for _ in 0..3 {
            for j in 0..20 {
                along.push(j as f64);
                heights.push(10.0 + 0.1 * (j % 3) as f64);
            }
        }
        heights[30] = 100.0;
        (counts, segment_dist_x, along, heights)
    }

    #[test]
    fn test_segment_window_scores() {
        let (counts, dist_x, along, h) = flat_track();
        let inputs = YapcInputs {
            segment_ph_cnt: &counts,
            segment_dist_x: &dist_x,
            dist_ph_along: &along,
            h_ph: &h,
        };
        let params = YapcParams {
            version: 2,
            ..Default::default()
        };

        let scores = YapcScorer::new(params, 10).unwrap().score(&inputs).unwrap();
        assert_eq!(scores.len(), 60);
        assert_eq!(scores[30], 0);
        assert!(scores[5] > 200, "surface photon scored {}", scores[5]);
        assert!(scores[45] > 200, "surface photon scored {}", scores[45]);
    }

    #[test]
    fn test_segment_window_skips_small_segments() {
        let (counts, dist_x, along, h) = flat_track();
        let inputs = YapcInputs {
            segment_ph_cnt: &counts,
            segment_dist_x: &dist_x,
            dist_ph_along: &along,
            h_ph: &h,
        };
        let params = YapcParams {
            version: 1,
            ..Default::default()
        };

        let scores = YapcScorer::new(params, 50).unwrap().score(&inputs).unwrap();
        assert!(scores.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_local_window_scores() {
        let (counts, dist_x, along, h) = flat_track();
        let inputs = YapcInputs {
            segment_ph_cnt: &counts,
            segment_dist_x: &dist_x,
            dist_ph_along: &along,
            h_ph: &h,
        };

        let scores = YapcScorer::new(YapcParams::default(), 10)
            .unwrap()
            .score(&inputs)
            .unwrap();
        assert_eq!(scores[30], 0);
        assert!(scores[10] > 200, "surface photon scored {}", scores[10]);
        assert!(scores[50] > 200, "surface photon scored {}", scores[50]);
    }

    #[test]
    fn test_isolated_photon_scores_zero() {
        let counts = vec![2];
        let dist_x = vec![0.0];
        let along = vec![0.0, 100.0];
        let h = vec![5.0, 5.0];
        let inputs = YapcInputs {
            segment_ph_cnt: &counts,
            segment_dist_x: &dist_x,
            dist_ph_along: &along,
            h_ph: &h,
        };

        let scores = YapcScorer::new(YapcParams::default(), 10)
            .unwrap()
            .score(&inputs)
            .unwrap();
        assert_eq!(scores, vec![0, 0]);
    }

    #[test]
    fn test_invalid_version() {
        let params = YapcParams {
            version: 7,
            ..Default::default()
        };
        assert!(matches!(
            YapcScorer::new(params, 10),
            Err(PhotonError::Config(_))
        ));

        let params = YapcParams {
            version: 0,
            ..Default::default()
        };
        assert!(YapcScorer::new(params, 10).is_err());
    }

    #[test]
    fn test_mismatched_inputs() {
        let inputs = YapcInputs {
            segment_ph_cnt: &[3],
            segment_dist_x: &[0.0],
            dist_ph_along: &[0.0, 1.0],
            h_ph: &[1.0, 1.0],
        };
        let scorer = YapcScorer::new(YapcParams::default(), 10).unwrap();
        assert!(matches!(
            scorer.score(&inputs),
            Err(PhotonError::DataConsistency(_))
        ));
    }
}
