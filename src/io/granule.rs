//! ATLAS granules: dataset paths, name parsing and the ATL08 companion

use crate::io::array::ArrayStore;
use crate::types::{Beam, PhotonError, PhotonResult};
use chrono::NaiveDateTime;
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// Dataset paths relative to a beam group
pub mod paths {
    pub const REFERENCE_PHOTON_LAT: &str = "geolocation/reference_photon_lat";
    pub const REFERENCE_PHOTON_LON: &str = "geolocation/reference_photon_lon";
    pub const SEGMENT_PH_CNT: &str = "geolocation/segment_ph_cnt";
    pub const SEGMENT_ID: &str = "geolocation/segment_id";
    pub const SEGMENT_DELTA_TIME: &str = "geolocation/delta_time";
    pub const SEGMENT_DIST_X: &str = "geolocation/segment_dist_x";
    pub const SOLAR_ELEVATION: &str = "geolocation/solar_elevation";
    pub const VELOCITY_SC: &str = "geolocation/velocity_sc";

    pub const DIST_PH_ALONG: &str = "heights/dist_ph_along";
    pub const DIST_PH_ACROSS: &str = "heights/dist_ph_across";
    pub const H_PH: &str = "heights/h_ph";
    pub const SIGNAL_CONF_PH: &str = "heights/signal_conf_ph";
    pub const QUALITY_PH: &str = "heights/quality_ph";
    pub const WEIGHT_PH: &str = "heights/weight_ph";
    pub const LAT_PH: &str = "heights/lat_ph";
    pub const LON_PH: &str = "heights/lon_ph";
    pub const PH_DELTA_TIME: &str = "heights/delta_time";

    pub const BCKGRD_DELTA_TIME: &str = "bckgrd_atlas/delta_time";
    pub const BCKGRD_RATE: &str = "bckgrd_atlas/bckgrd_rate";

    /// Granule-level, not under a beam group
    pub const SC_ORIENT: &str = "/orbit_info/sc_orient";

    pub const ATL08_PH_SEGMENT_ID: &str = "signal_photons/ph_segment_id";
    pub const ATL08_CLASSED_PC_INDX: &str = "signal_photons/classed_pc_indx";
    pub const ATL08_CLASSED_PC_FLAG: &str = "signal_photons/classed_pc_flag";
    pub const ATL08_PH_H: &str = "signal_photons/ph_h";
    pub const ATL08_SEGMENT_ID_BEG: &str = "land_segments/segment_id_beg";
    pub const ATL08_SEGMENT_LANDCOVER: &str = "land_segments/segment_landcover";
    pub const ATL08_SEGMENT_SNOWCOVER: &str = "land_segments/segment_snowcover";

    pub const GEOLOCATION_GROUP: &str = "geolocation";
    pub const GEOPHYS_CORR_GROUP: &str = "geophys_corr";
    pub const HEIGHTS_GROUP: &str = "heights";
    pub const LAND_SEGMENTS_GROUP: &str = "land_segments";
}

/// Full path of a beam dataset
pub fn beam_dataset(beam: Beam, relative: &str) -> String {
    format!("{}/{}", beam.prefix(), relative)
}

fn granule_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^ATL(\d{2})_(\d{14})_(\d{4})(\d{2})(\d{2})_(\d{3})_(\d{2})").ok()
        })
        .as_ref()
}

/// Fields encoded in an ATLAS granule name
///
/// `ATLxx_YYYYMMDDHHMMSS_ttttccrr_vvv_ee.h5`: product, acquisition time,
/// reference ground track, cycle, region, version and revision. Names that
/// don't follow the convention keep the raw name with every field unset.
#[derive(Debug, Clone, PartialEq)]
pub struct GranuleName {
    pub name: String,
    pub product: Option<u8>,
    pub acquired: Option<NaiveDateTime>,
    pub rgt: Option<u16>,
    pub cycle: Option<u8>,
    pub region: Option<u8>,
    pub version: Option<u16>,
    pub revision: Option<u8>,
}

impl GranuleName {
    pub fn parse(name: &str) -> Self {
        let mut parsed = Self {
            name: name.to_string(),
            product: None,
            acquired: None,
            rgt: None,
            cycle: None,
            region: None,
            version: None,
            revision: None,
        };

        if let Some(caps) = granule_pattern().and_then(|re| re.captures(name)) {
            parsed.product = caps[1].parse().ok();
            parsed.acquired = NaiveDateTime::parse_from_str(&caps[2], "%Y%m%d%H%M%S").ok();
            parsed.rgt = caps[3].parse().ok();
            parsed.cycle = caps[4].parse().ok();
            parsed.region = caps[5].parse().ok();
            parsed.version = caps[6].parse().ok();
            parsed.revision = caps[7].parse().ok();
        } else {
            log::debug!("Granule name {} does not follow the ATLAS convention", name);
        }

        parsed
    }

    /// Name of the same granule for another product, e.g. ATL03 to ATL08
    pub fn companion(&self, product: u8) -> PhotonResult<String> {
        if self.product.is_none() {
            return Err(PhotonError::Config(format!(
                "cannot derive ATL{:02} companion of {}",
                product, self.name
            )));
        }
        Ok(format!("ATL{:02}{}", product, &self.name[5..]))
    }
}

/// An ATL03 granule and, when classification is wanted, its ATL08 companion
#[derive(Clone)]
pub struct Granule {
    pub name: GranuleName,
    pub atl03: Arc<dyn ArrayStore>,
    pub atl08: Option<Arc<dyn ArrayStore>>,
}

impl Granule {
    pub fn new(atl03: Arc<dyn ArrayStore>) -> Self {
        Self {
            name: GranuleName::parse(atl03.name()),
            atl03,
            atl08: None,
        }
    }

    pub fn with_atl08(mut self, atl08: Arc<dyn ArrayStore>) -> Self {
        if let Ok(expected) = self.name.companion(8) {
            if expected != atl08.name() {
                log::warn!(
                    "ATL08 resource {} does not match expected companion {}",
                    atl08.name(),
                    expected
                );
            }
        }
        self.atl08 = Some(atl08);
        self
    }

    /// ATL08 store, or a configuration error when classification needs it
    pub fn atl08_store(&self) -> PhotonResult<&Arc<dyn ArrayStore>> {
        self.atl08.as_ref().ok_or_else(|| {
            PhotonError::Config(format!("no ATL08 granule supplied for {}", self.name.name))
        })
    }
}

impl std::fmt::Debug for Granule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Granule")
            .field("name", &self.name.name)
            .field("atl08", &self.atl08.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_granule_name() {
        let name = GranuleName::parse("ATL03_20181019065445_03150111_006_02.h5");
        assert_eq!(name.product, Some(3));
        assert_eq!(name.rgt, Some(315));
        assert_eq!(name.cycle, Some(1));
        assert_eq!(name.region, Some(11));
        assert_eq!(name.version, Some(6));
        assert_eq!(name.revision, Some(2));

        let acquired = name.acquired.unwrap();
        assert_eq!(acquired.year(), 2018);
        assert_eq!(acquired.month(), 10);
        assert_eq!(acquired.hour(), 6);

        assert_eq!(
            name.companion(8).unwrap(),
            "ATL08_20181019065445_03150111_006_02.h5"
        );
    }

    #[test]
    fn test_unconventional_name() {
        let name = GranuleName::parse("synthetic.h5");
        assert_eq!(name.name, "synthetic.h5");
        assert!(name.rgt.is_none());
        assert!(name.version.is_none());
        assert!(name.companion(8).is_err());
    }

    #[test]
    fn test_beam_dataset() {
        assert_eq!(
            beam_dataset(Beam::Gt2r, paths::H_PH),
            "/gt2r/heights/h_ph"
        );
    }
}
