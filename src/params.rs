//! Request parameters
//!
//! Parameters are read from JSON with every field optional. `normalized()`
//! applies the cross-field rules (track override, stage enables, class
//! defaults) and validates the result; the subsetter only accepts
//! normalized parameters.

use crate::core::canopy_metrics::PhorealParams;
use crate::core::extent::ExtentParams;
use crate::core::geo::{Polygon, RasterMask};
use crate::core::region::RegionTest;
use crate::core::surface_fit::FitParams;
use crate::core::yapc::YapcParams;
use crate::types::{
    Atl08Class, Beam, PhotonError, PhotonQuality, PhotonResult, SignalConfidence, SurfaceType,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Spatial test applied to segment reference photons
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialFilter {
    #[default]
    None,
    Polygon(Polygon),
    Raster(RasterMask),
}

/// Signal confidence selection
///
/// A single level selects that level and every higher one; a list selects
/// exactly the listed levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfidenceSelection {
    AtLeast(i8),
    Levels(Vec<i8>),
}

impl Default for ConfidenceSelection {
    fn default() -> Self {
        ConfidenceSelection::AtLeast(SignalConfidence::SurfaceLow as i8)
    }
}

/// Extra datasets appended to every row, by group
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AncillaryFields {
    /// `geolocation/*`, one value per segment
    pub geo: Vec<String>,
    /// `geophys_corr/*`, one value per segment
    pub corr: Vec<String>,
    /// `heights/*`, one value per photon
    pub photon: Vec<String>,
    /// ATL08 `land_segments/*`, one value per land segment
    pub atl08: Vec<String>,
}

impl AncillaryFields {
    pub fn is_empty(&self) -> bool {
        self.geo.is_empty() && self.corr.is_empty() && self.photon.is_empty() && self.atl08.is_empty()
    }

    /// Column names in row order
    pub fn column_names(&self) -> Vec<String> {
        self.geo
            .iter()
            .chain(&self.corr)
            .chain(&self.photon)
            .cloned()
            .chain(self.atl08.iter().map(|name| format!("atl08_{}", name)))
            .collect()
    }
}

/// Processing stages switched on by normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stages {
    pub atl08: bool,
    pub yapc: bool,
    pub fit: bool,
    pub phoreal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsetParams {
    pub spatial_filter: SpatialFilter,
    /// Inclusive ATL03 segment id range applied before the spatial test
    pub segment_id_range: Option<(u32, u32)>,
    pub surface_type: SurfaceType,
    pub atl03_cnf: ConfidenceSelection,
    pub quality_ph: Vec<i8>,
    /// ATL08 classes to keep; any entry enables classification
    pub atl08_class: Vec<u8>,
    pub beams: Vec<Beam>,
    /// Reference pair track 1..=3 overriding `beams`, 0 for all
    pub track: u8,
    pub yapc: Option<YapcParams>,
    pub extent: ExtentParams,
    pub fit: Option<FitParams>,
    pub phoreal: Option<PhorealParams>,
    pub ancillary: AncillaryFields,
    /// Seconds to wait on any single dataset read
    pub read_timeout: u64,
    #[serde(skip)]
    pub stages: Stages,
}

impl Default for SubsetParams {
    fn default() -> Self {
        Self {
            spatial_filter: SpatialFilter::None,
            segment_id_range: None,
            surface_type: SurfaceType::Land,
            atl03_cnf: ConfidenceSelection::default(),
            quality_ph: vec![PhotonQuality::Nominal as i8],
            atl08_class: Vec::new(),
            beams: Beam::ALL.to_vec(),
            track: 0,
            yapc: None,
            extent: ExtentParams::default(),
            fit: None,
            phoreal: None,
            ancillary: AncillaryFields::default(),
            read_timeout: 600,
            stages: Stages::default(),
        }
    }
}

impl SubsetParams {
    const ALL_TRACKS: u8 = 0;

    /// Parse and normalize JSON parameters
    pub fn from_json_str(json: &str) -> PhotonResult<Self> {
        let params: SubsetParams = serde_json::from_str(json)?;
        params.normalized()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> PhotonResult<Self> {
        let path = path.as_ref();
        log::info!("Loading subset parameters from {}", path.display());
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Apply the cross-field rules and validate
    pub fn normalized(mut self) -> PhotonResult<Self> {
        if self.track != Self::ALL_TRACKS {
            if self.track > 3 {
                return Err(PhotonError::Config(format!(
                    "invalid track {}, expected 1 to 3",
                    self.track
                )));
            }
            self.beams = Beam::ALL
                .iter()
                .copied()
                .filter(|beam| beam.track() == self.track)
                .collect();
        }
        self.beams.sort_by_key(|beam| beam.index());
        self.beams.dedup();

        let mut stages = Stages {
            yapc: self.yapc.is_some(),
            atl08: !self.atl08_class.is_empty(),
            fit: self.fit.is_some(),
            phoreal: false,
        };

        if self.phoreal.is_some() {
            stages.phoreal = true;
            if !stages.atl08 {
                stages.atl08 = true;
                self.atl08_class = vec![
                    Atl08Class::Ground as u8,
                    Atl08Class::Canopy as u8,
                    Atl08Class::TopOfCanopy as u8,
                ];
            }
        }

        if !self.ancillary.atl08.is_empty() && !stages.atl08 {
            stages.atl08 = true;
            self.atl08_class = vec![
                Atl08Class::Noise as u8,
                Atl08Class::Ground as u8,
                Atl08Class::Canopy as u8,
                Atl08Class::TopOfCanopy as u8,
            ];
        }

        self.stages = stages;
        self.validate()?;

        log::debug!(
            "Normalized parameters: beams {:?}, stages {:?}",
            self.beams,
            self.stages
        );
        Ok(self)
    }

    pub fn validate(&self) -> PhotonResult<()> {
        if self.beams.is_empty() {
            return Err(PhotonError::Config("no beams selected".to_string()));
        }

        match &self.atl03_cnf {
            ConfidenceSelection::AtLeast(level) => check_confidence(*level)?,
            ConfidenceSelection::Levels(levels) => {
                for &level in levels {
                    check_confidence(level)?;
                }
            }
        }
        if let Some(&bad) = self
            .quality_ph
            .iter()
            .find(|&&q| PhotonQuality::from_code(q).is_none())
        {
            return Err(PhotonError::Config(format!("invalid photon quality level {}", bad)));
        }
        if let Some(&bad) = self
            .atl08_class
            .iter()
            .find(|&&c| Atl08Class::from_code(c).is_none())
        {
            return Err(PhotonError::Config(format!("invalid ATL08 class {}", bad)));
        }

        match &self.spatial_filter {
            SpatialFilter::Polygon(polygon) => {
                Polygon::new(polygon.vertices().to_vec())?;
            }
            SpatialFilter::Raster(raster) => {
                RasterMask::new(raster.mask.clone(), raster.lon_min, raster.lat_max, raster.cell_size)?;
            }
            SpatialFilter::None => {}
        }
        if let Some((lo, hi)) = self.segment_id_range {
            if lo > hi {
                return Err(PhotonError::Config(format!(
                    "segment id range [{}, {}] is reversed",
                    lo, hi
                )));
            }
        }

        if let Some(yapc) = &self.yapc {
            yapc.validate()?;
        }
        if let Some(phoreal) = &self.phoreal {
            phoreal.validate()?;
        }
        self.extent.validate()?;

        if self.read_timeout == 0 {
            return Err(PhotonError::Config("read timeout must be positive".to_string()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    /// Enabled signal confidence levels, indexed by `SignalConfidence::index`
    pub fn confidence_mask(&self) -> [bool; SignalConfidence::COUNT] {
        let mut mask = [false; SignalConfidence::COUNT];
        match &self.atl03_cnf {
            ConfidenceSelection::AtLeast(level) => {
                if let Some(cnf) = SignalConfidence::from_code(*level) {
                    mask[cnf.index()..].iter_mut().for_each(|m| *m = true);
                }
            }
            ConfidenceSelection::Levels(levels) => {
                for cnf in levels.iter().filter_map(|&l| SignalConfidence::from_code(l)) {
                    mask[cnf.index()] = true;
                }
            }
        }
        mask
    }

    pub fn quality_mask(&self) -> [bool; PhotonQuality::COUNT] {
        let mut mask = [false; PhotonQuality::COUNT];
        for quality in self.quality_ph.iter().filter_map(|&q| PhotonQuality::from_code(q)) {
            mask[quality.index()] = true;
        }
        mask
    }

    pub fn class_mask(&self) -> [bool; Atl08Class::COUNT] {
        let mut mask = [false; Atl08Class::COUNT];
        for class in self.atl08_class.iter().filter_map(|&c| Atl08Class::from_code(c)) {
            mask[class.index()] = true;
        }
        mask
    }

    pub fn region_test(&self) -> RegionTest<'_> {
        match &self.spatial_filter {
            SpatialFilter::None => RegionTest::All,
            SpatialFilter::Polygon(polygon) => RegionTest::Polygon(polygon),
            SpatialFilter::Raster(raster) => RegionTest::Raster(raster),
        }
    }

    /// Whether photon relief comes from absolute heights
    pub fn use_abs_h(&self) -> bool {
        self.phoreal.as_ref().map_or(false, |p| p.use_abs_h)
    }

    pub fn above_classifier(&self) -> bool {
        self.phoreal.as_ref().map_or(false, |p| p.above_classifier)
    }
}

fn check_confidence(level: i8) -> PhotonResult<()> {
    SignalConfidence::from_code(level)
        .map(|_| ())
        .ok_or_else(|| PhotonError::Config(format!("invalid signal confidence level {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let params = SubsetParams::default().normalized().unwrap();
        assert_eq!(params.beams.len(), 6);
        assert_eq!(params.stages, Stages::default());
        assert_eq!(
            params.confidence_mask(),
            [false, false, false, false, true, true, true]
        );
        assert_eq!(params.quality_mask(), [true, false, false, false]);
    }

    #[test]
    fn test_confidence_levels() {
        let params = SubsetParams {
            atl03_cnf: ConfidenceSelection::Levels(vec![0, 4]),
            ..Default::default()
        };
        assert_eq!(
            params.confidence_mask(),
            [false, false, true, false, false, false, true]
        );

        let bad = SubsetParams {
            atl03_cnf: ConfidenceSelection::AtLeast(5),
            ..Default::default()
        };
        assert!(matches!(bad.normalized(), Err(PhotonError::Config(_))));
    }

    #[test]
    fn test_track_override() {
        let params = SubsetParams {
            track: 2,
            ..Default::default()
        }
        .normalized()
        .unwrap();
        assert_eq!(params.beams, vec![Beam::Gt2l, Beam::Gt2r]);

        let none = SubsetParams {
            beams: Vec::new(),
            ..Default::default()
        };
        assert!(none.normalized().is_err());
    }

    #[test]
    fn test_stage_normalization() {
        let phoreal = SubsetParams {
            phoreal: Some(PhorealParams::default()),
            ..Default::default()
        }
        .normalized()
        .unwrap();
        assert!(phoreal.stages.phoreal);
        assert!(phoreal.stages.atl08);
        assert_eq!(phoreal.class_mask(), [false, true, true, true, false]);

        let ancillary = SubsetParams {
            ancillary: AncillaryFields {
                atl08: vec!["h_te_best_fit".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
        .normalized()
        .unwrap();
        assert!(ancillary.stages.atl08);
        assert_eq!(ancillary.class_mask(), [true, true, true, true, false]);

        let explicit = SubsetParams {
            atl08_class: vec![1],
            phoreal: Some(PhorealParams::default()),
            yapc: Some(YapcParams::default()),
            ..Default::default()
        }
        .normalized()
        .unwrap();
        assert_eq!(explicit.class_mask(), [false, true, false, false, false]);
        assert!(explicit.stages.yapc);
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "spatial_filter": {"polygon": {"vertices": [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]]}},
            "atl03_cnf": 3,
            "surface_type": "land_ice",
            "beams": ["gt1l", "gt3r"],
            "yapc": {"version": 2, "score": 100},
            "read_timeout": 30
        }"#;
        let params = SubsetParams::from_json_str(json).unwrap();
        assert_eq!(params.surface_type, SurfaceType::LandIce);
        assert_eq!(params.atl03_cnf, ConfidenceSelection::AtLeast(3));
        assert_eq!(params.beams, vec![Beam::Gt1l, Beam::Gt3r]);
        assert_eq!(params.yapc.as_ref().map(|y| y.score), Some(100));
        assert!(params.stages.yapc);
        assert_eq!(params.read_timeout(), Duration::from_secs(30));
        assert!(matches!(params.region_test(), RegionTest::Polygon(_)));

        assert!(SubsetParams::from_json_str(r#"{"atl08_class": [9]}"#).is_err());
        assert!(matches!(
            SubsetParams::from_json_str("{not json"),
            Err(PhotonError::Json(_))
        ));
    }
}
