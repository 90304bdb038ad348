//! ATL08 photon classification joined onto ATL03 photons
//!
//! ATL03 photons are keyed by (segment id, 1-based index within segment).
//! ATL08 signal photons carry the same key as (ph_segment_id,
//! classed_pc_indx). Both sequences are ordered, so a single forward merge
//! assigns every ATL03 photon its class or marks it unclassified.

use crate::types::{Atl08Class, PhotonError, PhotonResult, SignalConfidence, INVALID_FLAG, INVALID_INDEX};

/// Per-photon output of the join, aligned with the ATL03 photon window
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassificationScratch {
    pub classification: Vec<u8>,
    /// ATL08 `ph_h`, present when canopy attributes were requested
    pub relief: Option<Vec<f32>>,
    pub landcover: Option<Vec<u8>>,
    pub snowcover: Option<Vec<u8>>,
    /// Index into ATL08 land segments, `INVALID_INDEX` when unmatched
    pub land_segment: Option<Vec<i32>>,
}

/// ATL03 side of the join
#[derive(Debug, Clone, Copy)]
pub struct Atl03Segments<'a> {
    pub segment_id: &'a [u32],
    pub segment_ph_cnt: &'a [u32],
}

/// ATL08 side of the join
#[derive(Debug, Clone, Copy)]
pub struct Atl08SignalPhotons<'a> {
    pub ph_segment_id: &'a [u32],
    pub classed_pc_indx: &'a [u32],
    pub classed_pc_flag: &'a [u8],
    pub ph_h: Option<&'a [f32]>,
}

/// ATL08 land segment attributes
#[derive(Debug, Clone, Copy)]
pub struct Atl08LandSegments<'a> {
    pub segment_id_beg: &'a [u32],
    pub landcover: Option<&'a [u8]>,
    pub snowcover: Option<&'a [u8]>,
}

/// Inputs of the low-sun reclassification to top of canopy
#[derive(Debug, Clone, Copy)]
pub struct AboveInputs<'a> {
    pub spot: u8,
    /// Per ATL03 segment
    pub solar_elevation: &'a [f32],
    /// Per ATL03 photon
    pub signal_conf: &'a [i8],
}

impl AboveInputs<'_> {
    const MAX_SOLAR_ELEVATION: f32 = 5.0;
    const MAX_RELIEF: f32 = 35.0;

    fn reclassify(&self, segment: usize, photon: usize, relief: f32) -> bool {
        let strong_odd_spot = matches!(self.spot, 1 | 3 | 5);
        strong_odd_spot
            && self.solar_elevation.get(segment).map_or(false, |&e| e <= Self::MAX_SOLAR_ELEVATION)
            && self.signal_conf.get(photon) == Some(&(SignalConfidence::SurfaceHigh as i8))
            && (0.0..Self::MAX_RELIEF).contains(&relief)
    }
}

/// Forward-merge classifier
#[derive(Debug, Clone, Default)]
pub struct Atl08Classifier<'a> {
    land_segments: Option<Atl08LandSegments<'a>>,
    above: Option<AboveInputs<'a>>,
}

impl<'a> Atl08Classifier<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach per-land-segment attributes and the land segment index
    pub fn with_land_segments(mut self, land_segments: Atl08LandSegments<'a>) -> Self {
        self.land_segments = Some(land_segments);
        self
    }

    /// Enable the low-sun top-of-canopy reclassification
    pub fn with_above(mut self, above: AboveInputs<'a>) -> Self {
        self.above = Some(above);
        self
    }

    pub fn classify(
        &self,
        atl03: &Atl03Segments<'_>,
        atl08: &Atl08SignalPhotons<'_>,
    ) -> PhotonResult<ClassificationScratch> {
        check_inputs(atl03, atl08, self.land_segments.as_ref())?;

        let num_photons: usize = atl03.segment_ph_cnt.iter().map(|&c| c as usize).sum();
        let want_relief = atl08.ph_h.is_some();
        let land = self.land_segments.as_ref();
        let want_landcover = land.map_or(false, |l| l.landcover.is_some());
        let want_snowcover = land.map_or(false, |l| l.snowcover.is_some());

        let mut scratch = ClassificationScratch {
            classification: Vec::with_capacity(num_photons),
            relief: want_relief.then(|| Vec::with_capacity(num_photons)),
            landcover: want_landcover.then(|| Vec::with_capacity(num_photons)),
            snowcover: want_snowcover.then(|| Vec::with_capacity(num_photons)),
            land_segment: land.map(|_| Vec::with_capacity(num_photons)),
        };

        let num_atl08 = atl08.ph_segment_id.len();
        let mut atl08_photon = 0usize;
        let mut land_index = 0usize;
        let mut photon = 0usize;

        for (segment_index, (&segment, &count)) in atl03
            .segment_id
            .iter()
            .zip(atl03.segment_ph_cnt)
            .enumerate()
        {
            if let Some(land) = land {
                while land_index + 1 < land.segment_id_beg.len()
                    && land.segment_id_beg[land_index + 1] <= segment
                {
                    land_index += 1;
                }
            }
            let land_valid = land.map_or(false, |l| land_index < l.segment_id_beg.len());

            for ph_count in 1..=count {
                while atl08_photon < num_atl08 && atl08.ph_segment_id[atl08_photon] < segment {
                    atl08_photon += 1;
                }
                while atl08_photon < num_atl08
                    && atl08.ph_segment_id[atl08_photon] == segment
                    && atl08.classed_pc_indx[atl08_photon] < ph_count
                {
                    atl08_photon += 1;
                }

                let matched = atl08_photon < num_atl08
                    && atl08.ph_segment_id[atl08_photon] == segment
                    && atl08.classed_pc_indx[atl08_photon] == ph_count;

                if matched {
                    let mut class = atl08.classed_pc_flag[atl08_photon];
                    let relief = atl08.ph_h.map(|h| h[atl08_photon]);

                    if let (Some(above), Some(relief)) = (&self.above, relief) {
                        if class != Atl08Class::TopOfCanopy as u8
                            && above.reclassify(segment_index, photon, relief)
                        {
                            class = Atl08Class::TopOfCanopy as u8;
                        }
                    }

                    scratch.classification.push(class);
                    if let (Some(column), Some(relief)) = (scratch.relief.as_mut(), relief) {
                        column.push(relief);
                    }
                    push_land_attributes(&mut scratch, land, land_index, land_valid);
                    atl08_photon += 1;
                } else {
                    scratch.classification.push(Atl08Class::Unclassified as u8);
                    if let Some(column) = scratch.relief.as_mut() {
                        column.push(0.0);
                    }
                    push_land_attributes(&mut scratch, land, land_index, false);
                }

                photon += 1;
            }
        }

        log::debug!(
            "Classified {} photons against {} ATL08 photons",
            photon,
            num_atl08
        );
        Ok(scratch)
    }
}

fn push_land_attributes(
    scratch: &mut ClassificationScratch,
    land: Option<&Atl08LandSegments<'_>>,
    land_index: usize,
    valid: bool,
) {
    let Some(land) = land else { return };

    if let Some(column) = scratch.land_segment.as_mut() {
        column.push(if valid { land_index as i32 } else { INVALID_INDEX });
    }
    if let (Some(column), Some(values)) = (scratch.landcover.as_mut(), land.landcover) {
        column.push(if valid { values[land_index] } else { INVALID_FLAG });
    }
    if let (Some(column), Some(values)) = (scratch.snowcover.as_mut(), land.snowcover) {
        column.push(if valid { values[land_index] } else { INVALID_FLAG });
    }
}

/// The merge never backtracks, so out-of-order keys would silently misclassify
fn check_inputs(
    atl03: &Atl03Segments<'_>,
    atl08: &Atl08SignalPhotons<'_>,
    land: Option<&Atl08LandSegments<'_>>,
) -> PhotonResult<()> {
    if atl03.segment_id.len() != atl03.segment_ph_cnt.len() {
        return Err(PhotonError::DataConsistency(format!(
            "{} ATL03 segment ids for {} segment counts",
            atl03.segment_id.len(),
            atl03.segment_ph_cnt.len()
        )));
    }
    let n = atl08.ph_segment_id.len();
    if atl08.classed_pc_indx.len() != n
        || atl08.classed_pc_flag.len() != n
        || atl08.ph_h.map_or(false, |h| h.len() != n)
    {
        return Err(PhotonError::DataConsistency(
            "ATL08 signal photon datasets differ in length".to_string(),
        ));
    }

    if let Some(i) = atl03.segment_id.windows(2).position(|w| w[1] < w[0]) {
        return Err(PhotonError::DataConsistency(format!(
            "ATL03 segment ids decrease at segment {}",
            i + 1
        )));
    }
    let keys = atl08.ph_segment_id.iter().zip(atl08.classed_pc_indx);
    let mut previous: Option<(u32, u32)> = None;
    for (i, (&segment, &index)) in keys.enumerate() {
        if previous.map_or(false, |p| (segment, index) < p) {
            return Err(PhotonError::DataConsistency(format!(
                "ATL08 photon keys decrease at photon {}",
                i
            )));
        }
        previous = Some((segment, index));
    }

    if let Some(land) = land {
        let m = land.segment_id_beg.len();
        if land.landcover.map_or(false, |v| v.len() != m) || land.snowcover.map_or(false, |v| v.len() != m) {
            return Err(PhotonError::DataConsistency(
                "ATL08 land segment datasets differ in length".to_string(),
            ));
        }
        if let Some(i) = land.segment_id_beg.windows(2).position(|w| w[1] < w[0]) {
            return Err(PhotonError::DataConsistency(format!(
                "ATL08 land segment ids decrease at segment {}",
                i + 1
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_join() {
        // segment 10 has 3 photons, segment 11 has 2
        let atl03 = Atl03Segments {
            segment_id: &[10, 11],
            segment_ph_cnt: &[3, 2],
        };
        let atl08 = Atl08SignalPhotons {
            ph_segment_id: &[9, 10, 10, 11],
            classed_pc_indx: &[1, 1, 3, 2],
            classed_pc_flag: &[2, 1, 3, 2],
            ph_h: None,
        };

        let scratch = Atl08Classifier::new().classify(&atl03, &atl08).unwrap();
        assert_eq!(scratch.classification, vec![1, 4, 3, 4, 2]);
        assert!(scratch.relief.is_none());
        assert!(scratch.land_segment.is_none());
    }

    #[test]
    fn test_no_matching_keys() {
        let atl03 = Atl03Segments {
            segment_id: &[100, 101],
            segment_ph_cnt: &[3, 2],
        };
        let atl08 = Atl08SignalPhotons {
            ph_segment_id: &[5, 6],
            classed_pc_indx: &[1, 1],
            classed_pc_flag: &[1, 1],
            ph_h: Some(&[1.0, 2.0]),
        };
        let land = Atl08LandSegments {
            segment_id_beg: &[1],
            landcover: Some(&[111]),
            snowcover: Some(&[1]),
        };

        let scratch = Atl08Classifier::new()
            .with_land_segments(land)
            .classify(&atl03, &atl08)
            .unwrap();
        assert_eq!(scratch.classification, vec![4; 5]);
        assert_eq!(scratch.relief.unwrap(), vec![0.0; 5]);
        assert_eq!(scratch.landcover.unwrap(), vec![INVALID_FLAG; 5]);
        assert_eq!(scratch.land_segment.unwrap(), vec![INVALID_INDEX; 5]);
    }

    #[test]
    fn test_land_segment_attributes() {
        let atl03 = Atl03Segments {
            segment_id: &[1, 2, 3, 4, 5, 6],
            segment_ph_cnt: &[1, 1, 1, 1, 1, 1],
        };
        let atl08 = Atl08SignalPhotons {
            ph_segment_id: &[1, 2, 3, 4, 5, 6],
            classed_pc_indx: &[1, 1, 1, 1, 1, 1],
            classed_pc_flag: &[1, 1, 2, 2, 3, 3],
            ph_h: Some(&[0.0, 0.1, 5.0, 6.0, 10.0, 12.0]),
        };
        let land = Atl08LandSegments {
            segment_id_beg: &[1, 4],
            landcover: Some(&[20, 30]),
            snowcover: Some(&[1, 2]),
        };

        let scratch = Atl08Classifier::new()
            .with_land_segments(land)
            .classify(&atl03, &atl08)
            .unwrap();
        assert_eq!(scratch.landcover.unwrap(), vec![20, 20, 20, 30, 30, 30]);
        assert_eq!(scratch.snowcover.unwrap(), vec![1, 1, 1, 2, 2, 2]);
        assert_eq!(scratch.land_segment.unwrap(), vec![0, 0, 0, 1, 1, 1]);
        assert_eq!(scratch.relief.unwrap()[4], 10.0);
    }

    #[test]
    fn test_above_reclassification() {
        let atl03 = Atl03Segments {
            segment_id: &[1, 2],
            segment_ph_cnt: &[2, 1],
        };
        let atl08 = Atl08SignalPhotons {
            ph_segment_id: &[1, 1, 2],
            classed_pc_indx: &[1, 2, 1],
            classed_pc_flag: &[2, 1, 2],
            ph_h: Some(&[3.0, 40.0, 3.0]),
        };
        let above = AboveInputs {
            spot: 3,
            solar_elevation: &[-10.0, 20.0],
            signal_conf: &[4, 4, 4],
        };

        let scratch = Atl08Classifier::new()
            .with_above(above)
            .classify(&atl03, &atl08)
            .unwrap();
        // relief out of range on photon 1; sun too high in segment 2
        assert_eq!(scratch.classification, vec![3, 1, 2]);

        let weak = AboveInputs { spot: 2, ..above };
        let scratch = Atl08Classifier::new()
            .with_above(weak)
            .classify(&atl03, &atl08)
            .unwrap();
        assert_eq!(scratch.classification, vec![2, 1, 2]);
    }

    #[test]
    fn test_rejects_unordered_keys() {
        let atl03 = Atl03Segments {
            segment_id: &[1, 2],
            segment_ph_cnt: &[1, 1],
        };
        let atl08 = Atl08SignalPhotons {
            ph_segment_id: &[2, 1],
            classed_pc_indx: &[1, 1],
            classed_pc_flag: &[1, 1],
            ph_h: None,
        };
        let result = Atl08Classifier::new().classify(&atl03, &atl08);
        assert!(matches!(result, Err(PhotonError::DataConsistency(_))));

        let unordered03 = Atl03Segments {
            segment_id: &[2, 1],
            segment_ph_cnt: &[1, 1],
        };
        let ordered08 = Atl08SignalPhotons {
            ph_segment_id: &[1, 2],
            ..atl08
        };
        let result = Atl08Classifier::new().classify(&unordered03, &ordered08);
        assert!(matches!(result, Err(PhotonError::DataConsistency(_))));
    }
}
