//! Canopy and terrain metrics over classified photons (PhoREAL)

use crate::core::extent::{Extent, ExtentParams, ExtentPartitioner};
use crate::core::table::{CanopyRecord, CanopyTable, PhotonTable};
use crate::types::{pflags, Atl08Class, PhotonError, PhotonResult};
use serde::{Deserialize, Serialize};

/// Upper bound on histogram bins per extent
pub const MAX_BINS: usize = 1000;

/// Where an extent's record is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Geolocation {
    Mean,
    #[default]
    Median,
    /// Centre of the bounding box
    Center,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhorealParams {
    /// Relief histogram bin size (meters)
    pub binsize: f64,
    pub geoloc: Geolocation,
    /// Use absolute photon heights instead of ATL08 relief
    pub use_abs_h: bool,
    /// Reclassify low-sun strong-beam photons as top of canopy
    pub above_classifier: bool,
    /// Ascending canopy height percentiles to report
    pub percentiles: Vec<f64>,
}

impl Default for PhorealParams {
    fn default() -> Self {
        Self {
            binsize: 1.0,
            geoloc: Geolocation::Median,
            use_abs_h: false,
            above_classifier: false,
            percentiles: (1..=19).map(|i| i as f64 * 5.0).collect(),
        }
    }
}

impl PhorealParams {
    pub fn validate(&self) -> PhotonResult<()> {
        if !(self.binsize > 0.0) {
            return Err(PhotonError::Config(format!(
                "PhoREAL bin size must be positive, got {}",
                self.binsize
            )));
        }
        if self.percentiles.iter().any(|p| !(*p > 0.0 && *p <= 100.0)) {
            return Err(PhotonError::Config(
                "PhoREAL percentiles must lie in (0, 100]".to_string(),
            ));
        }
        if self.percentiles.windows(2).any(|w| w[1] < w[0]) {
            return Err(PhotonError::Config(
                "PhoREAL percentiles must be ascending".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-extent canopy metrics over a classified photon table
#[derive(Debug, Clone, Default)]
pub struct CanopyMetricsExtractor {
    params: PhorealParams,
    extent: ExtentParams,
}

impl CanopyMetricsExtractor {
    const CANOPY_PERCENTILE: f64 = 98.0;

    pub fn new(params: PhorealParams, extent: ExtentParams) -> PhotonResult<Self> {
        params.validate()?;
        extent.validate()?;
        Ok(Self { params, extent })
    }

    pub fn run(&self, table: &PhotonTable) -> PhotonResult<CanopyTable> {
        let mut metrics = CanopyTable::new(table.metadata.clone(), self.params.percentiles.clone());

        for extent in ExtentPartitioner::new(&table.x_atc, &self.extent) {
            let extent = extent?;
            if !extent.is_valid() && !self.extent.pass_invalid {
                continue;
            }
            metrics.push(self.extent_metrics(table, &extent));
        }

        log::info!(
            "Canopy metrics of {} {}: {} extents from {} photons",
            table.metadata.granule,
            table.metadata.beam,
            metrics.len(),
            table.len()
        );
        Ok(metrics)
    }

    /// Run a batch of independent tables
    pub fn run_tables(&self, tables: &[PhotonTable]) -> Vec<PhotonResult<CanopyTable>> {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            tables.par_iter().map(|table| self.run(table)).collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            tables.iter().map(|table| self.run(table)).collect()
        }
    }

    fn extent_metrics(&self, table: &PhotonTable, extent: &Extent) -> CanopyRecord {
        let center = extent.center();
        let mut record = CanopyRecord {
            pflags: extent.pflags,
            photon_start: table.ph_index[extent.start],
            photon_count: extent.count as u32,
            landcover: table.landcover[center],
            snowcover: table.snowcover[center],
            solar_elevation: table.solar_elevation[center],
            canopy_h_metrics: vec![0.0; self.params.percentiles.len()],
            ..Default::default()
        };

        self.geolocate(table, extent, &mut record);
        self.canopy(table, extent, &mut record);
        record
    }

    fn geolocate(&self, table: &PhotonTable, extent: &Extent, record: &mut CanopyRecord) {
        let rows = extent.start..extent.end();
        let n = extent.count as f64;

        match self.params.geoloc {
            Geolocation::Center => {
                record.time_ns = midrange(rows.clone().map(|i| table.time_ns[i] as f64)) as i64;
                record.latitude = midrange(rows.clone().map(|i| table.latitude[i]));
                record.longitude = midrange(rows.clone().map(|i| table.longitude[i]));
                record.x_atc = midrange(rows.clone().map(|i| table.x_atc[i]));
                record.y_atc = midrange(rows.map(|i| table.y_atc[i] as f64)) as f32;
            }
            Geolocation::Mean => {
                record.time_ns = (rows.clone().map(|i| table.time_ns[i] as f64).sum::<f64>() / n) as i64;
                record.latitude = rows.clone().map(|i| table.latitude[i]).sum::<f64>() / n;
                record.longitude = rows.clone().map(|i| table.longitude[i]).sum::<f64>() / n;
                record.x_atc = rows.clone().map(|i| table.x_atc[i]).sum::<f64>() / n;
                record.y_atc = (rows.map(|i| table.y_atc[i] as f64).sum::<f64>() / n) as f32;
            }
            Geolocation::Median => {
                let c = extent.center();
                if extent.count % 2 == 1 {
                    record.time_ns = table.time_ns[c];
                    record.latitude = table.latitude[c];
                    record.longitude = table.longitude[c];
                    record.x_atc = table.x_atc[c];
                    record.y_atc = table.y_atc[c];
                } else {
                    record.time_ns = (table.time_ns[c] + table.time_ns[c - 1]) / 2;
                    record.latitude = (table.latitude[c] + table.latitude[c - 1]) / 2.0;
                    record.longitude = (table.longitude[c] + table.longitude[c - 1]) / 2.0;
                    record.x_atc = (table.x_atc[c] + table.x_atc[c - 1]) / 2.0;
                    record.y_atc = (table.y_atc[c] + table.y_atc[c - 1]) / 2.0;
                }
            }
        }
    }

    fn canopy(&self, table: &PhotonTable, extent: &Extent, record: &mut CanopyRecord) {
        let rows = extent.start..extent.end();
        let mut ground: Vec<usize> = rows
            .clone()
            .filter(|&i| Atl08Class::is_ground(table.atl08_class[i]))
            .collect();
        let mut vegetation: Vec<usize> = rows
            .filter(|&i| Atl08Class::is_vegetation(table.atl08_class[i]))
            .collect();

        ground.sort_by(|&a, &b| table.height[a].total_cmp(&table.height[b]));
        vegetation.sort_by(|&a, &b| table.relief[a].total_cmp(&table.relief[b]));

        record.ground_photon_count = ground.len() as u32;
        record.vegetation_photon_count = vegetation.len() as u32;
        record.h_te_median = median(&ground, &table.height);

        let veg_count = vegetation.len();
        if veg_count == 0 {
            return;
        }

        let relief = |k: usize| table.relief[vegetation[k]] as f64;
        let min_h = relief(0);
        let max_h = relief(veg_count - 1);
        let mean_h = (0..veg_count).map(relief).sum::<f64>() / veg_count as f64;
        let variance = (0..veg_count)
            .map(|k| (relief(k) - mean_h).powi(2))
            .sum::<f64>()
            / veg_count as f64;

        record.h_min_canopy = min_h as f32;
        record.h_max_canopy = max_h as f32;
        record.h_mean_canopy = mean_h as f32;
        record.canopy_openness = variance.sqrt() as f32;

        let binsize = self.params.binsize;
        let raw_bins = ((max_h - min_h) / binsize).ceil();
        let num_bins = if raw_bins > MAX_BINS as f64 {
            log::warn!(
                "Maximum number of bins truncated from {} to maximum allowed of {}",
                raw_bins,
                MAX_BINS
            );
            record.pflags |= pflags::BIN_OVERFLOW;
            MAX_BINS
        } else if raw_bins <= 0.0 {
            record.pflags |= pflags::BIN_UNDERFLOW;
            1
        } else {
            raw_bins as usize
        };

        let mut cumulative = vec![0usize; num_bins];
        for k in 0..veg_count {
            let bin = ((relief(k) - min_h) / binsize).floor().max(0.0) as usize;
            cumulative[bin.min(num_bins - 1)] += 1;
        }
        for b in 1..num_bins {
            cumulative[b] += cumulative[b - 1];
        }

        // a single forward cursor serves every percentile, then the canopy height
        let mut b = 0;
        let mut lookup = |percentile: f64| -> f32 {
            while b < num_bins {
                let fraction = cumulative[b] as f64 / veg_count as f64 * 100.0;
                if fraction >= percentile && cumulative[b] > 0 {
                    return table.relief[vegetation[cumulative[b] - 1]];
                }
                b += 1;
            }
            0.0
        };

        for (slot, &percentile) in record.canopy_h_metrics.iter_mut().zip(&self.params.percentiles) {
            *slot = lookup(percentile);
        }
        record.h_canopy = lookup(Self::CANOPY_PERCENTILE);
    }
}

fn midrange(values: impl Iterator<Item = f64>) -> f64 {
    let (lo, hi) = values.fold((f64::MAX, f64::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
    (lo + hi) / 2.0
}

fn median(sorted_rows: &[usize], values: &[f32]) -> f32 {
    let n = sorted_rows.len();
    if n == 0 {
        0.0
    } else if n % 2 == 0 {
        (values[sorted_rows[n / 2 - 1]] + values[sorted_rows[n / 2]]) / 2.0
    } else {
        values[sorted_rows[n / 2]]
    }
}
