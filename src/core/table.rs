//! Column-oriented output tables
//!
//! Every column of a table has the same length at all times: a row is
//! committed by pushing one value to every column in a single call.

use crate::types::{Beam, PhotonError, PhotonResult, ReferenceFrame, SpacecraftOrientation};
use serde::{Deserialize, Serialize};

/// Scalar metadata shared by every row of a beam's tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub granule: String,
    pub beam: Beam,
    /// 1 to 6, 0 when the spacecraft is in transition
    pub spot: u8,
    /// 10 to 60, 0 when the spacecraft is in transition
    pub ground_track: u8,
    pub cycle: Option<u8>,
    pub rgt: Option<u16>,
    pub region: Option<u8>,
    pub spacecraft_orientation: Option<SpacecraftOrientation>,
    pub reference_frame: ReferenceFrame,
}

impl TableMetadata {
    pub fn new(granule: &str, beam: Beam) -> Self {
        Self {
            granule: granule.to_string(),
            beam,
            spot: 0,
            ground_track: 0,
            cycle: None,
            rgt: None,
            region: None,
            spacecraft_orientation: None,
            reference_frame: ReferenceFrame::Itrf2014,
        }
    }

    pub fn set_orientation(&mut self, orientation: SpacecraftOrientation) {
        self.spacecraft_orientation = Some(orientation);
        self.spot = self.beam.spot(orientation);
        self.ground_track = self.beam.ground_track(orientation);
    }
}

/// One photon to commit
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PhotonRow {
    pub time_ns: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub x_atc: f64,
    pub y_atc: f32,
    pub height: f32,
    pub relief: f32,
    pub landcover: u8,
    pub snowcover: u8,
    pub atl08_class: u8,
    pub atl03_cnf: i8,
    pub quality_ph: i8,
    pub yapc_score: u8,
    pub segment_id: u32,
    pub ph_index: u32,
    pub solar_elevation: f32,
    pub spacecraft_velocity: f32,
    pub background_rate: f32,
    /// Values of the table's ancillary columns, in declaration order
    pub ancillary: Vec<f64>,
}

/// Borrowed view of a named column
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnRef<'a> {
    I64(&'a [i64]),
    F64(&'a [f64]),
    F32(&'a [f32]),
    U32(&'a [u32]),
    U8(&'a [u8]),
    I8(&'a [i8]),
}

impl ColumnRef<'_> {
    pub fn len(&self) -> usize {
        match self {
            ColumnRef::I64(c) => c.len(),
            ColumnRef::F64(c) => c.len(),
            ColumnRef::F32(c) => c.len(),
            ColumnRef::U32(c) => c.len(),
            ColumnRef::U8(c) => c.len(),
            ColumnRef::I8(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element widened to f64
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        match self {
            ColumnRef::I64(c) => c.get(index).map(|&v| v as f64),
            ColumnRef::F64(c) => c.get(index).copied(),
            ColumnRef::F32(c) => c.get(index).map(|&v| v as f64),
            ColumnRef::U32(c) => c.get(index).map(|&v| v as f64),
            ColumnRef::U8(c) => c.get(index).map(|&v| v as f64),
            ColumnRef::I8(c) => c.get(index).map(|&v| v as f64),
        }
    }
}

/// Per-photon output of a beam
#[derive(Debug, Clone, PartialEq)]
pub struct PhotonTable {
    pub metadata: TableMetadata,
    pub time_ns: Vec<i64>,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub x_atc: Vec<f64>,
    pub y_atc: Vec<f32>,
    pub height: Vec<f32>,
    pub relief: Vec<f32>,
    pub landcover: Vec<u8>,
    pub snowcover: Vec<u8>,
    pub atl08_class: Vec<u8>,
    pub atl03_cnf: Vec<i8>,
    pub quality_ph: Vec<i8>,
    pub yapc_score: Vec<u8>,
    pub segment_id: Vec<u32>,
    pub ph_index: Vec<u32>,
    pub solar_elevation: Vec<f32>,
    pub spacecraft_velocity: Vec<f32>,
    pub background_rate: Vec<f32>,
    ancillary: Vec<(String, Vec<f64>)>,
}

impl PhotonTable {
    pub fn new(metadata: TableMetadata) -> Self {
        Self {
            metadata,
            time_ns: Vec::new(),
            latitude: Vec::new(),
            longitude: Vec::new(),
            x_atc: Vec::new(),
            y_atc: Vec::new(),
            height: Vec::new(),
            relief: Vec::new(),
            landcover: Vec::new(),
            snowcover: Vec::new(),
            atl08_class: Vec::new(),
            atl03_cnf: Vec::new(),
            quality_ph: Vec::new(),
            yapc_score: Vec::new(),
            segment_id: Vec::new(),
            ph_index: Vec::new(),
            solar_elevation: Vec::new(),
            spacecraft_velocity: Vec::new(),
            background_rate: Vec::new(),
            ancillary: Vec::new(),
        }
    }

    /// Declare ancillary columns; only allowed while the table is empty
    pub fn with_ancillary<S: AsRef<str>>(mut self, names: &[S]) -> PhotonResult<Self> {
        if !self.is_empty() {
            return Err(PhotonError::DataConsistency(
                "ancillary columns must be declared before rows are added".to_string(),
            ));
        }
        for name in names {
            let name = name.as_ref();
            if self.column(name).is_some() {
                return Err(PhotonError::Config(format!("duplicate column name: {}", name)));
            }
            self.ancillary.push((name.to_string(), Vec::new()));
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.time_ns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ns.is_empty()
    }

    pub fn ancillary_names(&self) -> impl Iterator<Item = &str> {
        self.ancillary.iter().map(|(name, _)| name.as_str())
    }

    /// Commit one row to every column
    pub fn append(&mut self, row: &PhotonRow) -> PhotonResult<()> {
        if row.ancillary.len() != self.ancillary.len() {
            return Err(PhotonError::DataConsistency(format!(
                "row carries {} ancillary values for {} ancillary columns",
                row.ancillary.len(),
                self.ancillary.len()
            )));
        }

        self.time_ns.push(row.time_ns);
        self.latitude.push(row.latitude);
        self.longitude.push(row.longitude);
        self.x_atc.push(row.x_atc);
        self.y_atc.push(row.y_atc);
        self.height.push(row.height);
        self.relief.push(row.relief);
        self.landcover.push(row.landcover);
        self.snowcover.push(row.snowcover);
        self.atl08_class.push(row.atl08_class);
        self.atl03_cnf.push(row.atl03_cnf);
        self.quality_ph.push(row.quality_ph);
        self.yapc_score.push(row.yapc_score);
        self.segment_id.push(row.segment_id);
        self.ph_index.push(row.ph_index);
        self.solar_elevation.push(row.solar_elevation);
        self.spacecraft_velocity.push(row.spacecraft_velocity);
        self.background_rate.push(row.background_rate);
        for ((_, column), &value) in self.ancillary.iter_mut().zip(&row.ancillary) {
            column.push(value);
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<ColumnRef<'_>> {
        let column = match name {
            "time_ns" => ColumnRef::I64(&self.time_ns),
            "latitude" => ColumnRef::F64(&self.latitude),
            "longitude" => ColumnRef::F64(&self.longitude),
            "x_atc" => ColumnRef::F64(&self.x_atc),
            "y_atc" => ColumnRef::F32(&self.y_atc),
            "height" => ColumnRef::F32(&self.height),
            "relief" => ColumnRef::F32(&self.relief),
            "landcover" => ColumnRef::U8(&self.landcover),
            "snowcover" => ColumnRef::U8(&self.snowcover),
            "atl08_class" => ColumnRef::U8(&self.atl08_class),
            "atl03_cnf" => ColumnRef::I8(&self.atl03_cnf),
            "quality_ph" => ColumnRef::I8(&self.quality_ph),
            "yapc_score" => ColumnRef::U8(&self.yapc_score),
            "segment_id" => ColumnRef::U32(&self.segment_id),
            "ph_index" => ColumnRef::U32(&self.ph_index),
            "solar_elevation" => ColumnRef::F32(&self.solar_elevation),
            "spacecraft_velocity" => ColumnRef::F32(&self.spacecraft_velocity),
            "background_rate" => ColumnRef::F32(&self.background_rate),
            other => {
                return self
                    .ancillary
                    .iter()
                    .find(|(name, _)| name == other)
                    .map(|(_, values)| ColumnRef::F64(values))
            }
        };
        Some(column)
    }
}

/// Surface fit of one extent
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ElevationRecord {
    pub time_ns: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub h_mean: f64,
    pub x_atc: f64,
    pub y_atc: f32,
    pub dh_fit_dx: f32,
    pub window_height: f32,
    pub rms_misfit: f32,
    pub h_sigma: f32,
    pub photon_start: u32,
    pub photon_count: u32,
    pub pflags: u16,
}

/// Per-extent surface fits of a beam
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationTable {
    pub metadata: TableMetadata,
    pub time_ns: Vec<i64>,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub h_mean: Vec<f64>,
    pub x_atc: Vec<f64>,
    pub y_atc: Vec<f32>,
    pub dh_fit_dx: Vec<f32>,
    pub window_height: Vec<f32>,
    pub rms_misfit: Vec<f32>,
    pub h_sigma: Vec<f32>,
    pub photon_start: Vec<u32>,
    pub photon_count: Vec<u32>,
    pub pflags: Vec<u16>,
}

impl ElevationTable {
    pub fn new(metadata: TableMetadata) -> Self {
        Self {
            metadata,
            time_ns: Vec::new(),
            latitude: Vec::new(),
            longitude: Vec::new(),
            h_mean: Vec::new(),
            x_atc: Vec::new(),
            y_atc: Vec::new(),
            dh_fit_dx: Vec::new(),
            window_height: Vec::new(),
            rms_misfit: Vec::new(),
            h_sigma: Vec::new(),
            photon_start: Vec::new(),
            photon_count: Vec::new(),
            pflags: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.time_ns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ns.is_empty()
    }

    pub fn push(&mut self, record: &ElevationRecord) {
        self.time_ns.push(record.time_ns);
        self.latitude.push(record.latitude);
        self.longitude.push(record.longitude);
        self.h_mean.push(record.h_mean);
        self.x_atc.push(record.x_atc);
        self.y_atc.push(record.y_atc);
        self.dh_fit_dx.push(record.dh_fit_dx);
        self.window_height.push(record.window_height);
        self.rms_misfit.push(record.rms_misfit);
        self.h_sigma.push(record.h_sigma);
        self.photon_start.push(record.photon_start);
        self.photon_count.push(record.photon_count);
        self.pflags.push(record.pflags);
    }
}

/// Canopy and terrain metrics of one extent
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanopyRecord {
    pub time_ns: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub x_atc: f64,
    pub y_atc: f32,
    pub photon_start: u32,
    pub photon_count: u32,
    pub pflags: u16,
    pub ground_photon_count: u32,
    pub vegetation_photon_count: u32,
    pub landcover: u8,
    pub snowcover: u8,
    pub solar_elevation: f32,
    pub h_te_median: f32,
    pub h_max_canopy: f32,
    pub h_min_canopy: f32,
    pub h_mean_canopy: f32,
    /// 98th percentile of canopy relief
    pub h_canopy: f32,
    /// Standard deviation of canopy relief
    pub canopy_openness: f32,
    /// Canopy relief at each configured percentile
    pub canopy_h_metrics: Vec<f32>,
}

/// Per-extent canopy metrics of a beam
#[derive(Debug, Clone, PartialEq)]
pub struct CanopyTable {
    pub metadata: TableMetadata,
    pub percentiles: Vec<f64>,
    pub time_ns: Vec<i64>,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub x_atc: Vec<f64>,
    pub y_atc: Vec<f32>,
    pub photon_start: Vec<u32>,
    pub photon_count: Vec<u32>,
    pub pflags: Vec<u16>,
    pub ground_photon_count: Vec<u32>,
    pub vegetation_photon_count: Vec<u32>,
    pub landcover: Vec<u8>,
    pub snowcover: Vec<u8>,
    pub solar_elevation: Vec<f32>,
    pub h_te_median: Vec<f32>,
    pub h_max_canopy: Vec<f32>,
    pub h_min_canopy: Vec<f32>,
    pub h_mean_canopy: Vec<f32>,
    pub h_canopy: Vec<f32>,
    pub canopy_openness: Vec<f32>,
    pub canopy_h_metrics: Vec<Vec<f32>>,
}

impl CanopyTable {
    pub fn new(metadata: TableMetadata, percentiles: Vec<f64>) -> Self {
        Self {
            metadata,
            percentiles,
            time_ns: Vec::new(),
            latitude: Vec::new(),
            longitude: Vec::new(),
            x_atc: Vec::new(),
            y_atc: Vec::new(),
            photon_start: Vec::new(),
            photon_count: Vec::new(),
            pflags: Vec::new(),
            ground_photon_count: Vec::new(),
            vegetation_photon_count: Vec::new(),
            landcover: Vec::new(),
            snowcover: Vec::new(),
            solar_elevation: Vec::new(),
            h_te_median: Vec::new(),
            h_max_canopy: Vec::new(),
            h_min_canopy: Vec::new(),
            h_mean_canopy: Vec::new(),
            h_canopy: Vec::new(),
            canopy_openness: Vec::new(),
            canopy_h_metrics: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.time_ns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ns.is_empty()
    }

    pub fn push(&mut self, record: CanopyRecord) {
        self.time_ns.push(record.time_ns);
        self.latitude.push(record.latitude);
        self.longitude.push(record.longitude);
        self.x_atc.push(record.x_atc);
        self.y_atc.push(record.y_atc);
        self.photon_start.push(record.photon_start);
        self.photon_count.push(record.photon_count);
        self.pflags.push(record.pflags);
        self.ground_photon_count.push(record.ground_photon_count);
        self.vegetation_photon_count.push(record.vegetation_photon_count);
        self.landcover.push(record.landcover);
        self.snowcover.push(record.snowcover);
        self.solar_elevation.push(record.solar_elevation);
        self.h_te_median.push(record.h_te_median);
        self.h_max_canopy.push(record.h_max_canopy);
        self.h_min_canopy.push(record.h_min_canopy);
        self.h_mean_canopy.push(record.h_mean_canopy);
        self.h_canopy.push(record.h_canopy);
        self.canopy_openness.push(record.canopy_openness);
        self.canopy_h_metrics.push(record.canopy_h_metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(x: f64, anc: f64) -> PhotonRow {
        PhotonRow {
            x_atc: x,
            height: (x * 2.0) as f32,
            ancillary: vec![anc],
            ..Default::default()
        }
    }

    #[test]
    fn test_append_preserves_order() {
        let mut table = PhotonTable::new(TableMetadata::new("ATL03_test.h5", Beam::Gt1l))
            .with_ancillary(&["h_ph_uncorrected"])
            .unwrap();

        for i in 0..25 {
            table.append(&row(i as f64, -(i as f64))).unwrap();
        }

        assert_eq!(table.len(), 25);
        assert_eq!(table.x_atc[7], 7.0);
        assert_eq!(table.height[24], 48.0);
        assert_eq!(table.column("h_ph_uncorrected").unwrap().get_f64(3), Some(-3.0));
        for name in ["time_ns", "x_atc", "atl08_class", "background_rate", "h_ph_uncorrected"] {
            assert_eq!(table.column(name).unwrap().len(), 25, "column {}", name);
        }
        assert!(table.column("nonexistent").is_none());
    }

    #[test]
    fn test_append_rejects_misaligned_row() {
        let mut table = PhotonTable::new(TableMetadata::new("ATL03_test.h5", Beam::Gt1l));
        let result = table.append(&row(1.0, 0.0));
        assert!(result.is_err());
        assert_eq!(table.len(), 0);
        assert_eq!(table.x_atc.len(), 0);
    }

    #[test]
    fn test_duplicate_ancillary_column() {
        let table = PhotonTable::new(TableMetadata::new("ATL03_test.h5", Beam::Gt1l));
        assert!(table.with_ancillary(&["height"]).is_err());
    }

    #[test]
    fn test_metadata_orientation() {
        let mut metadata = TableMetadata::new("ATL03_test.h5", Beam::Gt2l);
        metadata.set_orientation(SpacecraftOrientation::Forward);
        assert_eq!(metadata.spot, 4);
        assert_eq!(metadata.ground_track, 30);
        assert_eq!(metadata.reference_frame.epsg(), 7912);
    }
}
