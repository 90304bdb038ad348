//! Along-track surface elevation fitting
//!
//! Each extent of a photon table is fitted with a line in height versus
//! along-track distance. The fit is refined by shrinking a residual window
//! around the line until the photon set stops changing.

use crate::core::extent::{Extent, ExtentParams, ExtentPartitioner};
use crate::core::table::{ElevationRecord, ElevationTable, PhotonTable};
use crate::types::{pflags, PhotonResult};
use serde::{Deserialize, Serialize};

/// Speed of light (m/s)
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;
/// Laser pulse repetition frequency (Hz)
pub const PULSE_REPETITION_FREQUENCY: f64 = 10_000.0;
/// Ratio between the 25-75 percentile spread and sigma of a gaussian
pub const RDE_SCALE_FACTOR: f64 = 1.3490;
/// Expected footprint sigma (meters)
pub const SIGMA_BEAM: f64 = 4.25;
/// Expected transmit pulse sigma (seconds)
pub const SIGMA_XMIT: f64 = 0.000_000_000_68;

/// Iterative fit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitParams {
    /// Iteration cap of the window refinement
    pub max_iterations: usize,
    /// Minimum window height (meters)
    pub min_window: f64,
    /// Cap on the robust dispersion estimate (meters)
    pub max_robust_dispersion: f64,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            min_window: 3.0,
            max_robust_dispersion: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Point {
    /// Row in the photon table
    p: usize,
    /// Along-track offset from the extent centre
    x: f64,
    /// Residual of the latest fit
    r: f64,
}

/// Inverse of the 2x2 normal matrix of `h = a + b·x`
#[derive(Debug, Clone, Copy)]
enum NormalInverse {
    Line { i11: f64, i12: f64, i22: f64 },
    /// Too little along-track spread to resolve a slope
    Constant { n: usize },
}

impl NormalInverse {
    fn from_points(points: &[Point]) -> Self {
        let g11 = points.len() as f64;
        let g12: f64 = points.iter().map(|pt| pt.x).sum();
        let g22: f64 = points.iter().map(|pt| pt.x * pt.x).sum();

        let det = g11 * g22 - g12 * g12;
        let scale = g11 * g22;
        if points.is_empty() || !det.is_finite() || det <= 1e-12 * scale {
            return NormalInverse::Constant { n: points.len() };
        }

        NormalInverse::Line {
            i11: g22 / det,
            i12: -g12 / det,
            i22: g11 / det,
        }
    }

    /// Rows of the generalized inverse for a photon at `x`
    fn weights(&self, x: f64) -> (f64, f64) {
        match *self {
            NormalInverse::Line { i11, i12, i22 } => (i11 + i12 * x, i12 + i22 * x),
            NormalInverse::Constant { n: 0 } => (0.0, 0.0),
            NormalInverse::Constant { n } => (1.0 / n as f64, 0.0),
        }
    }

    fn is_degenerate(&self) -> bool {
        matches!(self, NormalInverse::Constant { .. })
    }
}

/// Iterative robust line fit of photon heights, one record per extent
///
/// Each extent is fit with a least squares line, its residuals drive a
/// robust estimate of the signal spread, and photons outside the resulting
/// window are dropped before refitting. The final weights are reused to
/// place the record in time and space.
#[derive(Debug, Clone, Default)]
pub struct SurfaceFitter {
    params: FitParams,
    extent: ExtentParams,
}

impl SurfaceFitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: FitParams, extent: ExtentParams) -> PhotonResult<Self> {
        extent.validate()?;
        Ok(Self { params, extent })
    }

    pub fn fit_table(&self, table: &PhotonTable) -> PhotonResult<ElevationTable> {
        let mut elevations = ElevationTable::new(table.metadata.clone());
        let mut skipped = 0;

        for extent in ExtentPartitioner::new(&table.x_atc, &self.extent) {
            let extent = extent?;
            if !extent.is_valid() && !self.extent.pass_invalid {
                skipped += 1;
                continue;
            }
            let record = self.iterative_fit(table, &extent);
            elevations.push(&record);
        }

        log::info!(
            "Surface fit of {} {}: {} elevations from {} photons, {} extents skipped",
            table.metadata.granule,
            table.metadata.beam,
            elevations.len(),
            table.len(),
            skipped
        );
        Ok(elevations)
    }

    /// Fit a batch of independent tables
    pub fn fit_tables(&self, tables: &[PhotonTable]) -> Vec<PhotonResult<ElevationTable>> {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            tables.par_iter().map(|table| self.fit_table(table)).collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            tables.iter().map(|table| self.fit_table(table)).collect()
        }
    }

    fn iterative_fit(&self, table: &PhotonTable, extent: &Extent) -> ElevationRecord {
        let params = &self.params;
        let start = extent.start;
        let min_photons = self.extent.min_photon_count;
        let mut record = ElevationRecord {
            pflags: extent.pflags,
            ..Default::default()
        };

        let velocity = table.spacecraft_velocity[start] as f64;
        let pulses_in_extent = self.extent.extent_length * PULSE_REPETITION_FREQUENCY / velocity;
        let background_density =
            pulses_in_extent * table.background_rate[start] as f64 / (SPEED_OF_LIGHT / 2.0);

        let center = extent.center();
        record.x_atc = table.x_atc[center];

        let mut photons: Vec<Point> = (start..extent.end())
            .map(|p| Point {
                p,
                x: table.x_atc[p] - record.x_atc,
                r: 0.0,
            })
            .collect();

        let sigma_expected_xmit = (SPEED_OF_LIGHT / 2.0 * SIGMA_XMIT).powi(2);
        let mut window_height = 0.0f64;
        let mut h_sigma;
        let mut inverse;
        let mut iteration = 0;

        loop {
            inverse = NormalInverse::from_points(&photons);
            let (h_mean, slope, y_sigma) = fit_heights(table, &mut photons, &inverse);
            record.h_mean = h_mean;
            record.dh_fit_dx = slope as f32;
            h_sigma = y_sigma;

            if inverse.is_degenerate() {
                log::debug!(
                    "Degenerate along-track spread at x_atc {:.1}, using mean height",
                    record.x_atc
                );
                record.pflags |= pflags::DEGENERATE_FIT;
                break;
            }

            photons.sort_by(|a, b| a.r.total_cmp(&b.r));
            let n = photons.len();

            let (lower, upper, background_count) = if iteration == 0 {
                let lower = photons[0].r;
                let upper = photons[n - 1].r;
                (lower, upper, background_density * (upper - lower))
            } else {
                (
                    -window_height / 2.0,
                    window_height / 2.0,
                    background_density * window_height,
                )
            };

            let width = upper - lower;
            let background_rate = if width > 0.0 {
                background_count / width
            } else {
                0.0
            };
            let signal_count = n as f64 - background_count;

            let mut sigma_r = 0.0;
            if signal_count <= 1.0 {
                sigma_r = width / n as f64;
            } else {
                match percentile_bounds(&photons, signal_count, lower, background_rate) {
                    Some((i0, i1)) => sigma_r = (photons[i1].r - photons[i0].r) / RDE_SCALE_FACTOR,
                    None => {
                        log::warn!(
                            "Out of bounds percentiles for {} photons at x_atc {:.1}",
                            n,
                            record.x_atc
                        );
                        record.pflags |= pflags::OUT_OF_BOUNDS;
                    }
                }
            }

            let sigma_expected =
                (sigma_expected_xmit + (SIGMA_BEAM * slope).powi(2)).sqrt();
            let sigma_r = sigma_r.min(params.max_robust_dispersion);
            let new_window = params
                .min_window
                .max(6.0 * sigma_expected)
                .max(6.0 * sigma_r);
            window_height = new_window.max(0.75 * window_height);
            let half_window = window_height / 2.0;

            let mut next_count = 0;
            let mut x_min = f64::MAX;
            let mut x_max = f64::MIN;
            for pt in photons.iter().filter(|pt| pt.r.abs() < half_window) {
                next_count += 1;
                let x = table.x_atc[pt.p];
                x_min = x_min.min(x);
                x_max = x_max.max(x);
            }

            if next_count < min_photons {
                record.pflags |= pflags::TOO_FEW_PHOTONS;
                break;
            } else if x_max - x_min < self.extent.min_along_track_spread {
                record.pflags |= pflags::SPREAD_TOO_SHORT;
                break;
            } else if next_count == n {
                break;
            }

            iteration += 1;
            if iteration >= params.max_iterations {
                record.pflags |= pflags::MAX_ITERATIONS_REACHED;
                break;
            }

            photons.retain(|pt| pt.r.abs() < half_window);
        }

        record.window_height = window_height as f32;

        if !photons.is_empty() {
            let sum_sq: f64 = photons.iter().map(|pt| pt.r * pt.r).sum();
            let rms = (sum_sq / photons.len() as f64).sqrt();
            record.rms_misfit = rms as f32;
            record.h_sigma = (rms * h_sigma) as f32;
        }

        locate(table, &photons, &inverse, &mut record);
        record.photon_start = table.ph_index[start];
        record.photon_count = photons.len() as u32;
        record
    }
}

/// Least squares height fit; updates residuals and returns (height, slope, y_sigma)
fn fit_heights(table: &PhotonTable, photons: &mut [Point], inverse: &NormalInverse) -> (f64, f64, f64) {
    let mut height = 0.0;
    let mut slope = 0.0;
    let mut y_sigma = 0.0;

    for pt in photons.iter() {
        let (g1, g2) = inverse.weights(pt.x);
        let h = table.height[pt.p] as f64;
        height += g1 * h;
        slope += g2 * h;
        y_sigma += g1 * g1;
    }

    for pt in photons.iter_mut() {
        pt.r = table.height[pt.p] as f64 - (height + pt.x * slope);
    }

    (height, slope, y_sigma.sqrt())
}

/// Indices of the 25th and 75th signal percentiles in residual-sorted photons
fn percentile_bounds(
    photons: &[Point],
    signal_count: f64,
    lower: f64,
    background_rate: f64,
) -> Option<(usize, usize)> {
    let n = photons.len() as i64;

    let mut i0: i64 = 0;
    while i0 < n {
        let spp = 0.25 * signal_count + (photons[i0 as usize].r - lower) * background_rate;
        if (i0 as f64) + 1.5 < spp {
            i0 += 1;
        } else {
            break;
        }
    }

    let mut i1: i64 = n - 1;
    while i1 >= 0 {
        let spp = 0.75 * signal_count + (photons[i1 as usize].r - lower) * background_rate;
        if (i1 as f64) - 0.5 > spp {
            i1 -= 1;
        } else {
            break;
        }
    }

    if i1 < i0 {
        let spp0 = n as f64 / 2.0 - signal_count / 4.0;
        i0 = (spp0 + 0.5) as i64 - 1;
        let spp1 = n as f64 / 2.0 + signal_count / 4.0;
        i1 = (spp1 + 0.5) as i64;
    }

    if i0 >= 0 && i1 < n && i0 <= i1 {
        Some((i0 as usize, i1 as usize))
    } else {
        None
    }
}

/// Place the record with the final height weights
fn locate(table: &PhotonTable, photons: &[Point], inverse: &NormalInverse, record: &mut ElevationRecord) {
    let Some(first) = photons.first() else { return };

    let shift_lon = table.longitude[first.p].abs() > 150.0;
    let mut latitude = 0.0;
    let mut longitude = 0.0;
    let mut time_ns = 0.0;
    let mut y_atc = 0.0;

    for pt in photons {
        let (g1, _) = inverse.weights(pt.x);
        let mut lon = table.longitude[pt.p];
        if shift_lon {
            lon = (lon + 360.0) % 360.0;
        }
        latitude += g1 * table.latitude[pt.p];
        longitude += g1 * lon;
        time_ns += g1 * table.time_ns[pt.p] as f64;
        y_atc += g1 * table.y_atc[pt.p] as f64;
    }

    if shift_lon {
        longitude = (longitude + 180.0) % 360.0 - 180.0;
    }

    record.latitude = latitude;
    record.longitude = longitude;
    record.time_ns = time_ns as i64;
    record.y_atc = y_atc as f32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::table::{PhotonRow, TableMetadata};
    use crate::types::Beam;
    use approx::assert_abs_diff_eq;

    fn line_table(n: usize, height: impl Fn(f64) -> f64, longitude: f64) -> PhotonTable {
        let mut table = PhotonTable::new(TableMetadata::new("ATL03_test.h5", Beam::Gt1l));
        for i in 0..n {
            let x = i as f64;
            let row = PhotonRow {
                time_ns: 1_000_000 * i as i64,
                latitude: 60.0 + x * 1e-5,
                longitude,
                x_atc: x,
                height: height(x) as f32,
                spacecraft_velocity: 7000.0,
                background_rate: 0.0,
                ph_index: 100 + i as u32,
                ..Default::default()
            };
            table.append(&row).unwrap();
        }
        table
    }

    #[test]
    fn test_noiseless_line_converges() {
        let table = line_table(40, |x| 2.0 + 0.1 * x, 10.0);
        let elevations = SurfaceFitter::new().fit_table(&table).unwrap();

        // the trailing extent is too short and skipped
        assert_eq!(elevations.len(), 1);
        assert_eq!(elevations.pflags[0], 0);
        assert_abs_diff_eq!(elevations.dh_fit_dx[0], 0.1, epsilon = 1e-4);
        assert_abs_diff_eq!(elevations.rms_misfit[0], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(elevations.h_mean[0], 4.0, epsilon = 1e-4);
        assert_abs_diff_eq!(elevations.x_atc[0], 20.0);
        assert_eq!(elevations.photon_start[0], 100);
        assert_eq!(elevations.photon_count[0], 40);
        assert_abs_diff_eq!(elevations.window_height[0], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_outlier_is_rejected() {
        let mut table = line_table(40, |_| 10.0, 10.0);
        table.height[7] = 60.0;
        let elevations = SurfaceFitter::new().fit_table(&table).unwrap();

        assert_eq!(elevations.len(), 1);
        assert_eq!(elevations.photon_count[0], 39);
        assert_abs_diff_eq!(elevations.h_mean[0], 10.0, epsilon = 1e-3);
    }

    #[test]
    fn test_longitude_wraparound() {
        let table = line_table(40, |_| 5.0, 179.9);
        let mut wrapped = table.clone();
        for (i, lon) in wrapped.longitude.iter_mut().enumerate() {
            *lon = if i % 2 == 0 { 179.9 } else { -179.9 };
        }
        let elevations = SurfaceFitter::new().fit_table(&wrapped).unwrap();
        let lon = elevations.longitude[0];
        assert!(lon.abs() > 179.0, "longitude {} did not wrap", lon);
        assert!((-180.0..180.0).contains(&lon));
    }

    #[test]
    fn test_degenerate_spread() {
        let mut table = line_table(12, |_| 3.0, 10.0);
        for x in table.x_atc.iter_mut() {
            *x = 50.0;
        }
        let fitter = SurfaceFitter::with_params(
            FitParams::default(),
            ExtentParams {
                pass_invalid: true,
                ..Default::default()
            },
        )
        .unwrap();

        let elevations = fitter.fit_table(&table).unwrap();
        assert_eq!(elevations.len(), 1);
        assert_ne!(elevations.pflags[0] & pflags::DEGENERATE_FIT, 0);
        assert_abs_diff_eq!(elevations.h_mean[0], 3.0, epsilon = 1e-9);
        assert_eq!(elevations.dh_fit_dx[0], 0.0);
        assert!(elevations.latitude[0].is_finite());
    }

    #[test]
    fn test_fit_tables() {
        let tables = vec![
            line_table(40, |x| 2.0 + 0.1 * x, 10.0),
            line_table(40, |_| 7.0, 20.0),
        ];
        let results = SurfaceFitter::new().fit_tables(&tables);
        assert_eq!(results.len(), 2);
        let second = results[1].as_ref().unwrap();
        assert_abs_diff_eq!(second.h_mean[0], 7.0, epsilon = 1e-6);
    }
}
