//! Core types for ATLAS photon processing

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Seconds to add to ATLAS delta times to get GPS seconds
pub const ATLAS_SDP_EPOCH_GPS: i64 = 1_198_800_018;

/// Number of ground tracks (spots) per granule
pub const NUM_SPOTS: usize = 6;

/// Marker for per-photon flags that could not be populated (landcover, snowcover)
pub const INVALID_FLAG: u8 = 0xFF;

/// Marker for a photon with no corresponding ATL08 land segment
pub const INVALID_INDEX: i32 = -1;

/// Extent processing flags
pub mod pflags {
    /// Along-track spread of the extent is below the configured minimum
    pub const SPREAD_TOO_SHORT: u16 = 0x0001;
    /// Photon count of the extent is below the configured minimum
    pub const TOO_FEW_PHOTONS: u16 = 0x0002;
    /// Surface fit hit the iteration cap before converging
    pub const MAX_ITERATIONS_REACHED: u16 = 0x0004;
    /// Robust dispersion percentiles fell outside the photon set
    pub const OUT_OF_BOUNDS: u16 = 0x0008;
    /// Relief histogram had no bins
    pub const BIN_UNDERFLOW: u16 = 0x0010;
    /// Relief histogram was truncated to the maximum bin count
    pub const BIN_OVERFLOW: u16 = 0x0020;
    /// Along-track distances were collinear; a constant model was fit instead of a line
    pub const DEGENERATE_FIT: u16 = 0x0040;
}

/// Error severity carried by every error and alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Error code carried by every error and alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    EmptySubset,
    InvalidConfig,
    InvalidData,
    Timeout,
    ResourceDoesNotExist,
    Failure,
}

/// Error types for photon processing
#[derive(Debug, thiserror::Error)]
pub enum PhotonError {
    #[error("empty spatial region: {0}")]
    EmptySubset(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data consistency error: {0}")]
    DataConsistency(String),

    #[error("timeout reading {0}")]
    Timeout(String),

    #[error("dataset does not exist: {0}")]
    MissingDataset(String),

    #[error("extent partitioning error: {0}")]
    Partition(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PhotonError {
    /// Severity used when the error is raised as an alert
    pub fn severity(&self) -> Severity {
        match self {
            PhotonError::EmptySubset(_) => Severity::Debug,
            PhotonError::Timeout(_) | PhotonError::MissingDataset(_) | PhotonError::Io(_) => {
                Severity::Error
            }
            PhotonError::Partition(_) => Severity::Error,
            PhotonError::Config(_) | PhotonError::DataConsistency(_) | PhotonError::Json(_) => {
                Severity::Critical
            }
        }
    }

    /// Code used when the error is raised as an alert
    pub fn code(&self) -> ErrorCode {
        match self {
            PhotonError::EmptySubset(_) => ErrorCode::EmptySubset,
            PhotonError::Config(_) | PhotonError::Json(_) => ErrorCode::InvalidConfig,
            PhotonError::DataConsistency(_) => ErrorCode::InvalidData,
            PhotonError::Timeout(_) => ErrorCode::Timeout,
            PhotonError::MissingDataset(_) => ErrorCode::ResourceDoesNotExist,
            PhotonError::Partition(_) | PhotonError::Io(_) => ErrorCode::Failure,
        }
    }

    /// True for the one condition that is reported as a successful, zero-row completion
    pub fn is_empty_subset(&self) -> bool {
        matches!(self, PhotonError::EmptySubset(_))
    }
}

/// Result type for photon operations
pub type PhotonResult<T> = Result<T, PhotonError>;

/// Signal confidence per photon (ATL03 `signal_conf_ph`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalConfidence {
    PossibleTep = -2,
    NotConsidered = -1,
    Background = 0,
    Within10m = 1,
    SurfaceLow = 2,
    SurfaceMedium = 3,
    SurfaceHigh = 4,
}

impl SignalConfidence {
    pub const COUNT: usize = 7;

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            -2 => Some(SignalConfidence::PossibleTep),
            -1 => Some(SignalConfidence::NotConsidered),
            0 => Some(SignalConfidence::Background),
            1 => Some(SignalConfidence::Within10m),
            2 => Some(SignalConfidence::SurfaceLow),
            3 => Some(SignalConfidence::SurfaceMedium),
            4 => Some(SignalConfidence::SurfaceHigh),
            _ => None,
        }
    }

    /// Position in a confidence enable set
    pub fn index(self) -> usize {
        (self as i8 + 2) as usize
    }
}

/// Photon quality level (ATL03 `quality_ph`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhotonQuality {
    Nominal = 0,
    PossibleAfterpulse = 1,
    PossibleImpulseResponse = 2,
    PossibleTep = 3,
}

impl PhotonQuality {
    pub const COUNT: usize = 4;

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(PhotonQuality::Nominal),
            1 => Some(PhotonQuality::PossibleAfterpulse),
            2 => Some(PhotonQuality::PossibleImpulseResponse),
            3 => Some(PhotonQuality::PossibleTep),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// ATL08 surface classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Atl08Class {
    Noise = 0,
    Ground = 1,
    Canopy = 2,
    TopOfCanopy = 3,
    Unclassified = 4,
}

impl Atl08Class {
    pub const COUNT: usize = 5;

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Atl08Class::Noise),
            1 => Some(Atl08Class::Ground),
            2 => Some(Atl08Class::Canopy),
            3 => Some(Atl08Class::TopOfCanopy),
            4 => Some(Atl08Class::Unclassified),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_ground(code: u8) -> bool {
        code == Atl08Class::Ground as u8
    }

    pub fn is_vegetation(code: u8) -> bool {
        code == Atl08Class::Canopy as u8 || code == Atl08Class::TopOfCanopy as u8
    }
}

/// Surface type used to select the signal confidence column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceType {
    /// Highest confidence across all surface types
    Dynamic,
    Land,
    Ocean,
    SeaIce,
    LandIce,
    InlandWater,
}

impl SurfaceType {
    pub const NUM_COLUMNS: usize = 5;

    /// Column of `signal_conf_ph` to read, or `None` for all columns
    pub fn column(self) -> Option<usize> {
        match self {
            SurfaceType::Dynamic => None,
            SurfaceType::Land => Some(0),
            SurfaceType::Ocean => Some(1),
            SurfaceType::SeaIce => Some(2),
            SurfaceType::LandIce => Some(3),
            SurfaceType::InlandWater => Some(4),
        }
    }
}

/// Spacecraft orientation (`/orbit_info/sc_orient`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpacecraftOrientation {
    Backward = 0,
    Forward = 1,
    Transition = 2,
}

impl SpacecraftOrientation {
    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(SpacecraftOrientation::Backward),
            1 => Some(SpacecraftOrientation::Forward),
            2 => Some(SpacecraftOrientation::Transition),
            _ => None,
        }
    }
}

/// Laser ground track of a granule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Beam {
    Gt1l,
    Gt1r,
    Gt2l,
    Gt2r,
    Gt3l,
    Gt3r,
}

impl Beam {
    pub const ALL: [Beam; NUM_SPOTS] = [
        Beam::Gt1l,
        Beam::Gt1r,
        Beam::Gt2l,
        Beam::Gt2r,
        Beam::Gt3l,
        Beam::Gt3r,
    ];

    /// Reference pair track, 1 to 3
    pub fn track(self) -> u8 {
        (self as u8) / 2 + 1
    }

    /// 0 for the left beam of the pair, 1 for the right
    pub fn pair(self) -> u8 {
        (self as u8) % 2
    }

    /// Index into a six-element beam set
    pub fn index(self) -> usize {
        self as usize
    }

    /// Dataset path prefix for this beam
    pub fn prefix(self) -> String {
        format!("/{}", self)
    }

    /// Spot number 1 to 6 for the given orientation, 0 during transition
    pub fn spot(self, orientation: SpacecraftOrientation) -> u8 {
        match orientation {
            SpacecraftOrientation::Backward => self as u8 + 1,
            SpacecraftOrientation::Forward => NUM_SPOTS as u8 - self as u8,
            SpacecraftOrientation::Transition => 0,
        }
    }

    /// Ground track code 10 to 60, 0 during transition
    pub fn ground_track(self, orientation: SpacecraftOrientation) -> u8 {
        match orientation {
            SpacecraftOrientation::Transition => 0,
            _ => (self as u8 + 1) * 10,
        }
    }
}

impl std::fmt::Display for Beam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = if self.pair() == 0 { 'l' } else { 'r' };
        write!(f, "gt{}{}", self.track(), side)
    }
}

impl std::str::FromStr for Beam {
    type Err = PhotonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gt1l" => Ok(Beam::Gt1l),
            "gt1r" => Ok(Beam::Gt1r),
            "gt2l" => Ok(Beam::Gt2l),
            "gt2r" => Ok(Beam::Gt2r),
            "gt3l" => Ok(Beam::Gt3l),
            "gt3r" => Ok(Beam::Gt3r),
            _ => Err(PhotonError::Config(format!("invalid beam: {}", s))),
        }
    }
}

/// Reference frame tag attached to output tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceFrame {
    /// ITRF2014 geographic latitude, longitude and ellipsoidal height
    Itrf2014,
}

impl ReferenceFrame {
    pub fn epsg(self) -> u32 {
        match self {
            ReferenceFrame::Itrf2014 => 7912,
        }
    }
}

impl Default for ReferenceFrame {
    fn default() -> Self {
        ReferenceFrame::Itrf2014
    }
}

/// UTC dates on which GPS time gained a leap second over UTC
const LEAP_SECOND_DATES: [(i32, u32); 18] = [
    (1981, 7),
    (1982, 7),
    (1983, 7),
    (1985, 7),
    (1988, 1),
    (1990, 1),
    (1991, 1),
    (1992, 7),
    (1993, 7),
    (1994, 7),
    (1996, 1),
    (1997, 7),
    (1999, 1),
    (2006, 1),
    (2009, 1),
    (2012, 7),
    (2015, 7),
    (2017, 1),
];

/// Unix time of the GPS epoch, 1980-01-06T00:00:00Z
pub const GPS_EPOCH_UNIX: i64 = 315_964_800;

fn leap_seconds_before(unix_seconds: i64) -> i64 {
    LEAP_SECOND_DATES
        .iter()
        .filter_map(|(year, month)| NaiveDate::from_ymd_opt(*year, *month, 1))
        .filter_map(|date| date.and_hms_opt(0, 0, 0))
        .filter(|date| unix_seconds >= date.and_utc().timestamp())
        .count() as i64
}

/// Convert an ATLAS delta time (seconds since the ATLAS SDP epoch) to
/// nanoseconds since the Unix epoch with leap seconds removed
pub fn delta_time_to_unix_ns(delta_time: f64) -> i64 {
    let gps_seconds = delta_time + ATLAS_SDP_EPOCH_GPS as f64;
    let gps_ns = (gps_seconds * 1e9).round() as i64;
    let unaligned_ns = GPS_EPOCH_UNIX * 1_000_000_000 + gps_ns;
    let leap_seconds = leap_seconds_before(unaligned_ns.div_euclid(1_000_000_000));
    unaligned_ns - leap_seconds * 1_000_000_000
}

/// Convert nanoseconds since the Unix epoch into a UTC timestamp
pub fn unix_ns_to_datetime(ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beam_geometry() {
        assert_eq!(Beam::Gt1l.track(), 1);
        assert_eq!(Beam::Gt2r.track(), 2);
        assert_eq!(Beam::Gt2r.pair(), 1);
        assert_eq!(Beam::Gt3l.to_string(), "gt3l");
        assert_eq!(Beam::Gt3l.prefix(), "/gt3l");
        assert_eq!("GT2L".parse::<Beam>().unwrap(), Beam::Gt2l);
        assert!("gt4l".parse::<Beam>().is_err());
    }

    #[test]
    fn test_spot_lookup() {
        assert_eq!(Beam::Gt1l.spot(SpacecraftOrientation::Backward), 1);
        assert_eq!(Beam::Gt3r.spot(SpacecraftOrientation::Backward), 6);
        assert_eq!(Beam::Gt1l.spot(SpacecraftOrientation::Forward), 6);
        assert_eq!(Beam::Gt3r.spot(SpacecraftOrientation::Forward), 1);
        assert_eq!(Beam::Gt2l.spot(SpacecraftOrientation::Transition), 0);
        assert_eq!(Beam::Gt2r.ground_track(SpacecraftOrientation::Forward), 40);
    }

    #[test]
    fn test_confidence_codes() {
        assert_eq!(SignalConfidence::from_code(-2), Some(SignalConfidence::PossibleTep));
        assert_eq!(SignalConfidence::SurfaceHigh.index(), 6);
        assert!(SignalConfidence::from_code(5).is_none());
        assert!(PhotonQuality::from_code(4).is_none());
        assert!(Atl08Class::is_vegetation(3));
        assert!(!Atl08Class::is_vegetation(1));
    }

    #[test]
    fn test_delta_time_conversion() {
        // 2018-01-01T00:00:00Z is the ATLAS SDP epoch
        let ns = delta_time_to_unix_ns(0.0);
        let date = unix_ns_to_datetime(ns);
        assert_eq!(date.to_rfc3339(), "2018-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_error_taxonomy() {
        let empty = PhotonError::EmptySubset("gt1l".to_string());
        assert!(empty.is_empty_subset());
        assert_eq!(empty.code(), ErrorCode::EmptySubset);

        let bad = PhotonError::DataConsistency("invalid atl03 signal confidence: 9".to_string());
        assert_eq!(bad.severity(), Severity::Critical);
        assert_eq!(bad.code(), ErrorCode::InvalidData);
    }
}
