//! Spatial region resolution over ordered along-track segments
//!
//! Segments arrive in along-track order, each with a reference photon
//! location and the number of photons it holds. The resolver turns a
//! spatial test into a contiguous segment range, the matching photon range,
//! and for raster tests a per-segment mask over that range.

use crate::core::geo::Inclusion;
use crate::types::{PhotonError, PhotonResult};

/// How segments are tested against the requested region
#[derive(Clone, Copy)]
pub enum RegionTest<'a> {
    /// Whole range
    All,
    /// First run of segments inside the polygon
    Polygon(&'a dyn Inclusion),
    /// Envelope of every included segment, with a mask for the gaps
    Raster(&'a dyn Inclusion),
}

/// Per-segment reference geometry of a beam
#[derive(Debug, Clone, Copy)]
pub struct SegmentGeometry<'a> {
    pub latitude: &'a [f64],
    pub longitude: &'a [f64],
    pub photon_count: &'a [u32],
    /// ATL03 segment ids, needed only for an id prefilter
    pub segment_id: Option<&'a [u32]>,
}

/// Resolved segment and photon range of a beam
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterest {
    pub first_segment: usize,
    pub num_segments: usize,
    pub first_photon: usize,
    pub num_photons: usize,
    /// Per-segment inclusion aligned to `[first_segment, first_segment + num_segments)`
    pub inclusion_mask: Option<Vec<bool>>,
    /// Photon counts aligned the same way
    pub segment_ph_cnt: Vec<u32>,
}

impl AreaOfInterest {
    /// Whether photons of the segment at `offset` from `first_segment` are kept
    pub fn includes_segment(&self, offset: usize) -> bool {
        match &self.inclusion_mask {
            Some(mask) => mask.get(offset).copied().unwrap_or(false),
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct Span {
    first_segment: usize,
    num_segments: usize,
    first_photon: usize,
    num_photons: usize,
    mask: Option<Vec<bool>>,
}

/// Resolve the area of interest of one beam
///
/// `segment_id_range` is an inclusive prefilter on ATL03 segment ids applied
/// before the spatial test. An area with no photons is reported as
/// `PhotonError::EmptySubset`.
pub fn resolve(
    geometry: &SegmentGeometry<'_>,
    segment_id_range: Option<(u32, u32)>,
    test: RegionTest<'_>,
) -> PhotonResult<AreaOfInterest> {
    let n = geometry.photon_count.len();
    if geometry.latitude.len() != n || geometry.longitude.len() != n {
        return Err(PhotonError::DataConsistency(format!(
            "segment geometry lengths differ: {} lat, {} lon, {} counts",
            geometry.latitude.len(),
            geometry.longitude.len(),
            n
        )));
    }

    let (lo, hi) = match segment_id_range {
        Some(range) => prefilter(geometry, range)?,
        None => (0, n),
    };

    let counts = &geometry.photon_count[lo..hi];
    let lat = &geometry.latitude[lo..hi];
    let lon = &geometry.longitude[lo..hi];
    let skipped: usize = geometry.photon_count[..lo].iter().map(|&c| c as usize).sum();

    let span = match test {
        RegionTest::All => Span {
            first_segment: 0,
            num_segments: counts.len(),
            first_photon: 0,
            num_photons: counts.iter().map(|&c| c as usize).sum(),
            mask: None,
        },
        RegionTest::Polygon(region) => polygon_span(lat, lon, counts, region),
        RegionTest::Raster(region) => raster_span(lat, lon, counts, region),
    };

    if span.num_photons == 0 {
        return Err(PhotonError::EmptySubset("empty spatial region".to_string()));
    }

    let first_segment = lo + span.first_segment;
    let area = AreaOfInterest {
        first_segment,
        num_segments: span.num_segments,
        first_photon: skipped + span.first_photon,
        num_photons: span.num_photons,
        inclusion_mask: span.mask,
        segment_ph_cnt: geometry.photon_count[first_segment..first_segment + span.num_segments].to_vec(),
    };

    log::debug!(
        "Resolved region: segments [{}, +{}), photons [{}, +{}), masked={}",
        area.first_segment,
        area.num_segments,
        area.first_photon,
        area.num_photons,
        area.inclusion_mask.is_some()
    );

    Ok(area)
}

/// Index range of segments whose id lies in the inclusive `range`
fn prefilter(geometry: &SegmentGeometry<'_>, range: (u32, u32)) -> PhotonResult<(usize, usize)> {
    let ids = geometry.segment_id.ok_or_else(|| {
        PhotonError::Config("segment id prefilter requested without segment ids".to_string())
    })?;
    if ids.len() != geometry.photon_count.len() {
        return Err(PhotonError::DataConsistency(format!(
            "{} segment ids for {} segments",
            ids.len(),
            geometry.photon_count.len()
        )));
    }

    let lo = ids.partition_point(|&id| id < range.0);
    let hi = ids.partition_point(|&id| id <= range.1);
    if lo >= hi {
        return Err(PhotonError::EmptySubset(format!(
            "no segments in id range [{}, {}]",
            range.0, range.1
        )));
    }
    Ok((lo, hi))
}

/// Assumes the track crosses the polygon once; a later re-entry is ignored
fn polygon_span(lat: &[f64], lon: &[f64], counts: &[u32], region: &dyn Inclusion) -> Span {
    let mut span = Span::default();
    let mut first_found = false;

    let mut segment = 0;
    while segment < counts.len() {
        let inside = region.includes(lon[segment], lat[segment]);
        let count = counts[segment] as usize;

        if !first_found {
            // empty segments can carry placeholder coordinates
            if inside && count != 0 {
                first_found = true;
                span.first_segment = segment;
                span.num_photons = count;
            } else {
                span.first_photon += count;
            }
        } else if !inside && count != 0 {
            break;
        } else {
            span.num_photons += count;
        }

        segment += 1;
    }

    if first_found {
        span.num_segments = segment - span.first_segment;
    } else {
        span.num_photons = 0;
    }
    span
}

fn raster_span(lat: &[f64], lon: &[f64], counts: &[u32], region: &dyn Inclusion) -> Span {
    let mut span = Span::default();
    let mut mask = vec![false; counts.len()];
    let mut first: Option<usize> = None;
    let mut last = 0;
    let mut running = 0usize;

    for segment in 0..counts.len() {
        let count = counts[segment] as usize;
        if count == 0 {
            continue;
        }

        let inside = region.includes(lon[segment], lat[segment]);
        mask[segment] = inside;

        match first {
            None if inside => {
                first = Some(segment);
                last = segment;
                running = count;
                span.num_photons = running;
            }
            None => span.first_photon += count,
            Some(_) => {
                running += count;
                if inside {
                    span.num_photons = running;
                    last = segment;
                }
            }
        }
    }

    match first {
        Some(first) => {
            span.first_segment = first;
            span.num_segments = last - first + 1;
            span.mask = Some(mask[first..=last].to_vec());
        }
        None => span.num_photons = 0,
    }
    span
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_geometry(n: usize) -> (Vec<f64>, Vec<f64>, Vec<u32>) {
        let lat = (0..n).map(|i| i as f64).collect();
        let lon = vec![0.0; n];
        let counts = vec![1; n];
        (lat, lon, counts)
    }

    #[test]
    fn test_polygon_region() {
        let (lat, lon, counts) = line_geometry(10);
        let geometry = SegmentGeometry {
            latitude: &lat,
            longitude: &lon,
            photon_count: &counts,
            segment_id: None,
        };
        let inside = |_lon: f64, lat: f64| (3.0..7.0).contains(&lat);

        let area = resolve(&geometry, None, RegionTest::Polygon(&inside)).unwrap();
        assert_eq!(area.first_segment, 3);
        assert_eq!(area.num_segments, 4);
        assert_eq!(area.first_photon, 3);
        assert_eq!(area.num_photons, 4);
        assert!(area.inclusion_mask.is_none());
        assert_eq!(area.segment_ph_cnt.len(), 4);
    }

    #[test]
    fn test_polygon_skips_empty_segments() {
        let lat = vec![0.0, 5.0, 5.0, 5.0, 9.0, 5.0];
        let lon = vec![0.0; 6];
        let counts = vec![2, 0, 3, 1, 0, 4];
        let geometry = SegmentGeometry {
            latitude: &lat,
            longitude: &lon,
            photon_count: &counts,
            segment_id: None,
        };
        let inside = |_lon: f64, lat: f64| lat == 5.0;

        // segment 1 is inside but empty; segment 4 is outside but empty
        let area = resolve(&geometry, None, RegionTest::Polygon(&inside)).unwrap();
        assert_eq!(area.first_segment, 2);
        assert_eq!(area.first_photon, 2);
        assert_eq!(area.num_segments, 4);
        assert_eq!(area.num_photons, 8);
    }

    #[test]
    fn test_raster_region() {
        let (lat, lon, counts) = line_geometry(10);
        let geometry = SegmentGeometry {
            latitude: &lat,
            longitude: &lon,
            photon_count: &counts,
            segment_id: None,
        };
        let inside = |_lon: f64, lat: f64| lat == 2.0 || lat == 5.0 || lat == 7.0;

        let area = resolve(&geometry, None, RegionTest::Raster(&inside)).unwrap();
        assert_eq!(area.first_segment, 2);
        assert_eq!(area.num_segments, 6);
        assert_eq!(area.first_photon, 2);
        assert_eq!(area.num_photons, 6);
        assert_eq!(
            area.inclusion_mask,
            Some(vec![true, false, false, true, false, true])
        );
        assert!(area.includes_segment(3));
        assert!(!area.includes_segment(4));
    }

    #[test]
    fn test_empty_region() {
        let (lat, lon, counts) = line_geometry(5);
        let geometry = SegmentGeometry {
            latitude: &lat,
            longitude: &lon,
            photon_count: &counts,
            segment_id: None,
        };
        let nowhere = |_lon: f64, _lat: f64| false;

        let polygon = resolve(&geometry, None, RegionTest::Polygon(&nowhere));
        assert!(matches!(polygon, Err(PhotonError::EmptySubset(_))));
        let raster = resolve(&geometry, None, RegionTest::Raster(&nowhere));
        assert!(matches!(raster, Err(PhotonError::EmptySubset(_))));
    }

    #[test]
    fn test_whole_range_with_prefilter() {
        let (lat, lon, _) = line_geometry(6);
        let counts = vec![1, 2, 3, 4, 5, 6];
        let ids = vec![100, 101, 102, 103, 104, 105];
        let geometry = SegmentGeometry {
            latitude: &lat,
            longitude: &lon,
            photon_count: &counts,
            segment_id: Some(&ids),
        };

        let area = resolve(&geometry, Some((102, 103)), RegionTest::All).unwrap();
        assert_eq!(area.first_segment, 2);
        assert_eq!(area.num_segments, 2);
        assert_eq!(area.first_photon, 3);
        assert_eq!(area.num_photons, 7);

        let none = resolve(&geometry, Some((200, 300)), RegionTest::All);
        assert!(matches!(none, Err(PhotonError::EmptySubset(_))));
    }
}
