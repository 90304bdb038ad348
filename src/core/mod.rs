//! Core photon processing modules

pub mod geo;
pub mod region;
pub mod control;
pub mod table;
pub mod extent;
pub mod classify;
pub mod yapc;
pub mod surface_fit;
pub mod canopy_metrics;
pub mod subsetter;

// Re-export main types
pub use geo::{Inclusion, Polygon, RasterMask};
pub use region::{AreaOfInterest, RegionTest, SegmentGeometry};
pub use control::{Alert, BeamCompletion, BeamStatus, CancellationToken};
pub use table::{
    CanopyRecord, CanopyTable, ColumnRef, ElevationRecord, ElevationTable, PhotonRow,
    PhotonTable, TableMetadata,
};
pub use extent::{Extent, ExtentParams, ExtentPartitioner};
pub use classify::{Atl08Classifier, ClassificationScratch};
pub use yapc::{YapcParams, YapcScorer};
pub use surface_fit::{FitParams, SurfaceFitter};
pub use canopy_metrics::{CanopyMetricsExtractor, Geolocation, PhorealParams};
pub use subsetter::{Atl03Subsetter, BeamOutcome, SubsetHandle, SubsetReport};
