//! atlas-photon: ICESat-2 ATL03 photon subsetting
//!
//! Turns ATL03 geolocated photon granules into per-beam photon tables
//! restricted to a region of interest, optionally joined with ATL08 land
//! classifications and scored for signal density, and derives along-track
//! surface elevations and canopy height metrics from those tables.

pub mod types;
pub mod params;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    Atl08Class, Beam, PhotonError, PhotonQuality, PhotonResult, SignalConfidence,
    SpacecraftOrientation, SurfaceType,
};
pub use params::{AncillaryFields, ConfidenceSelection, SpatialFilter, SubsetParams};
pub use io::{ArrayStore, Granule, GranuleName, MemoryStore};
pub use crate::core::{
    Atl03Subsetter, CancellationToken, CanopyMetricsExtractor, PhotonTable, SubsetReport,
    SurfaceFitter,
};
