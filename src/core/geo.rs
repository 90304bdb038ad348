//! Point-in-region tests over longitude/latitude

use crate::types::{PhotonError, PhotonResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Point-in-region test over geographic coordinates
pub trait Inclusion: Send + Sync {
    fn includes(&self, lon: f64, lat: f64) -> bool;
}

impl<F> Inclusion for F
where
    F: Fn(f64, f64) -> bool + Send + Sync,
{
    fn includes(&self, lon: f64, lat: f64) -> bool {
        self(lon, lat)
    }
}

/// Closed polygon of (longitude, latitude) vertices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    vertices: Vec<(f64, f64)>,
}

impl Polygon {
    pub fn new(vertices: Vec<(f64, f64)>) -> PhotonResult<Self> {
        if vertices.len() < 3 {
            return Err(PhotonError::Config(format!(
                "polygon needs at least 3 vertices, got {}",
                vertices.len()
            )));
        }
        Ok(Self { vertices })
    }

    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.vertices
    }
}

impl Inclusion for Polygon {
    /// Even-odd ray casting in plate carrée coordinates
    fn includes(&self, lon: f64, lat: f64) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.vertices[i];
            let (xj, yj) = self.vertices[j];
            if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

/// Boolean raster over a regular lon/lat grid
///
/// Row 0 is the northern edge. Points outside the grid are excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterMask {
    pub mask: Array2<bool>,
    /// Longitude of the western edge
    pub lon_min: f64,
    /// Latitude of the northern edge
    pub lat_max: f64,
    /// Cell size in degrees
    pub cell_size: f64,
}

impl RasterMask {
    pub fn new(mask: Array2<bool>, lon_min: f64, lat_max: f64, cell_size: f64) -> PhotonResult<Self> {
        if !(cell_size > 0.0) {
            return Err(PhotonError::Config(format!(
                "raster cell size must be positive, got {}",
                cell_size
            )));
        }
        Ok(Self {
            mask,
            lon_min,
            lat_max,
            cell_size,
        })
    }
}

impl Inclusion for RasterMask {
    fn includes(&self, lon: f64, lat: f64) -> bool {
        let col = ((lon - self.lon_min) / self.cell_size).floor();
        let row = ((self.lat_max - lat) / self.cell_size).floor();
        if !(col >= 0.0 && row >= 0.0) {
            return false;
        }
        self.mask
            .get((row as usize, col as usize))
            .copied()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_polygon_inclusion() {
        let square = Polygon::new(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]).unwrap();
        assert!(square.includes(5.0, 5.0));
        assert!(!square.includes(15.0, 5.0));
        assert!(!square.includes(5.0, -1.0));
        assert!(Polygon::new(vec![(0.0, 0.0), (1.0, 1.0)]).is_err());
    }

    #[test]
    fn test_raster_inclusion() {
        let raster = RasterMask::new(array![[true, false], [false, true]], -10.0, 10.0, 10.0).unwrap();
        assert!(raster.includes(-5.0, 5.0));
        assert!(!raster.includes(5.0, 5.0));
        assert!(raster.includes(5.0, -5.0));
        assert!(!raster.includes(25.0, 5.0));
        assert!(!raster.includes(-15.0, 5.0));
    }

    #[test]
    fn test_closure_inclusion() {
        let north = |_lon: f64, lat: f64| lat > 0.0;
        assert!(north.includes(0.0, 1.0));
        assert!(!north.includes(0.0, -1.0));
    }
}
