//! Per-beam streaming construction of photon tables
//!
//! A request runs one thread per selected beam. Each unit resolves its area
//! of interest, reads the windowed datasets, scores and classifies photons,
//! then walks the photons in storage order and commits those passing every
//! filter. Units share only the cancellation token and the completion and
//! alert channels; whatever happens, each unit sends exactly one completion.

use crate::core::canopy_metrics::CanopyMetricsExtractor;
use crate::core::classify::{
    AboveInputs, Atl03Segments, Atl08Classifier, Atl08LandSegments, Atl08SignalPhotons,
    ClassificationScratch,
};
use crate::core::control::{Alert, BeamCompletion, BeamStatus, CancellationToken};
use crate::core::region::{self, AreaOfInterest, SegmentGeometry};
use crate::core::surface_fit::SurfaceFitter;
use crate::core::table::{PhotonRow, PhotonTable, TableMetadata};
use crate::core::yapc::{YapcInputs, YapcScorer};
use crate::io::granule::paths;
use crate::io::{beam_dataset, read_array, ArrayStore, ColumnSelect, DataArray, Granule, PendingArray, ReadWindow};
use crate::params::SubsetParams;
use crate::types::{
    delta_time_to_unix_ns, Atl08Class, Beam, PhotonError, PhotonQuality, PhotonResult,
    SignalConfidence, SpacecraftOrientation, INVALID_FLAG, INVALID_INDEX,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use ndarray::Axis;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Rows of one beam and whether production stopped on cancellation
#[derive(Debug)]
pub struct BeamOutcome {
    pub table: PhotonTable,
    pub cancelled: bool,
}

/// ATL03 photon subsetter
#[derive(Debug, Clone)]
pub struct Atl03Subsetter {
    params: Arc<SubsetParams>,
}

impl Atl03Subsetter {
    /// Normalizes and validates `params`
    pub fn new(params: SubsetParams) -> PhotonResult<Self> {
        Ok(Self {
            params: Arc::new(params.normalized()?),
        })
    }

    pub fn params(&self) -> &SubsetParams {
        &self.params
    }

    /// Start one unit per selected beam
    pub fn run(&self, granule: Arc<Granule>, token: CancellationToken) -> PhotonResult<SubsetHandle> {
        if self.params.stages.atl08 {
            granule.atl08_store()?;
        }

        let (completion_tx, completion_rx) = unbounded();
        let (alert_tx, alert_rx) = unbounded();
        let mut workers = Vec::with_capacity(self.params.beams.len());

        log::info!(
            "Subsetting {} over beams {:?}",
            granule.name.name,
            self.params.beams
        );

        for &beam in &self.params.beams {
            let subsetter = self.clone();
            let granule = Arc::clone(&granule);
            let token = token.clone();
            let completions = completion_tx.clone();
            let alerts = alert_tx.clone();

            let worker = thread::Builder::new()
                .name(format!("subset-{}", beam))
                .spawn(move || {
                    let mut guard = CompletionGuard::new(beam, &granule, completions, alerts.clone());
                    let (status, table) = subsetter.run_unit(&granule, beam, &token, &alerts);
                    guard.complete(status, table);
                })?;
            workers.push(worker);
        }

        Ok(SubsetHandle {
            completions: completion_rx,
            alerts: alert_rx,
            workers,
            token,
        })
    }

    /// Surface fitter for the finished tables, when fitting was requested
    pub fn surface_fitter(&self) -> PhotonResult<Option<SurfaceFitter>> {
        match &self.params.fit {
            Some(fit) if self.params.stages.fit => Ok(Some(SurfaceFitter::with_params(
                fit.clone(),
                self.params.extent.clone(),
            )?)),
            _ => Ok(None),
        }
    }

    /// Canopy metrics extractor for the finished tables, when PhoREAL was requested
    pub fn canopy_extractor(&self) -> PhotonResult<Option<CanopyMetricsExtractor>> {
        match &self.params.phoreal {
            Some(phoreal) if self.params.stages.phoreal => Ok(Some(CanopyMetricsExtractor::new(
                phoreal.clone(),
                self.params.extent.clone(),
            )?)),
            _ => Ok(None),
        }
    }

    fn run_unit(
        &self,
        granule: &Granule,
        beam: Beam,
        token: &CancellationToken,
        alerts: &Sender<Alert>,
    ) -> (BeamStatus, PhotonTable) {
        match self.subset_beam(granule, beam, token) {
            Ok(BeamOutcome { table, cancelled }) => {
                let rows = table.len();
                log::info!(
                    "Completed processing resource {} beam {}: {} rows{}",
                    granule.name.name,
                    beam,
                    rows,
                    if cancelled { " (cancelled)" } else { "" }
                );
                let status = if cancelled {
                    BeamStatus::Cancelled { rows }
                } else {
                    BeamStatus::Complete { rows }
                };
                (status, table)
            }
            Err(e) if e.is_empty_subset() => {
                log::info!("No photons for {} beam {}: {}", granule.name.name, beam, e);
                (BeamStatus::Empty, PhotonTable::new(beam_metadata(granule, beam)))
            }
            Err(e) => {
                log::warn!("Failure on resource {} beam {}: {}", granule.name.name, beam, e);
                // the receiver may already be gone
                let _ = alerts.send(Alert::from_error(&e, &granule.name.name, beam));
                (BeamStatus::Failed(e), PhotonTable::new(beam_metadata(granule, beam)))
            }
        }
    }

    /// Build the photon table of one beam on the calling thread
    pub fn subset_beam(
        &self,
        granule: &Granule,
        beam: Beam,
        token: &CancellationToken,
    ) -> PhotonResult<BeamOutcome> {
        let params = &*self.params;
        let timeout = params.read_timeout();
        let store = &*granule.atl03;

        let mut table = PhotonTable::new(beam_metadata(granule, beam))
            .with_ancillary(&params.ancillary.column_names())?;
        if !token.is_active() {
            return Ok(BeamOutcome {
                table,
                cancelled: true,
            });
        }

        let atl08_reads = if params.stages.atl08 {
            Some(Atl08Reads::issue(&**granule.atl08_store()?, beam, params))
        } else {
            None
        };

        let area = resolve_area(store, beam, params, timeout)?;
        let read_weights = params.stages.yapc
            && params.yapc.as_ref().map_or(false, |y| y.version == 0)
            && granule.name.version.map_or(false, |v| v >= 6);
        let atl03 = Atl03Data::read(store, beam, &area, params, read_weights, timeout)?;

        if let Some(orientation) = atl03
            .sc_orient
            .first()
            .and_then(|&code| SpacecraftOrientation::from_code(code))
        {
            table.metadata.set_orientation(orientation);
        } else {
            log::warn!("Unknown spacecraft orientation for {} beam {}", granule.name.name, beam);
        }

        let scores = self.score_photons(&area, &atl03)?;

        let atl08 = match atl08_reads {
            Some(reads) => Some(reads.join(timeout)?),
            None => None,
        };
        let scratch = match &atl08 {
            Some(atl08) => Some(classify(atl08, &area, &atl03, params, table.metadata.spot)?),
            None => None,
        };

        let cancelled = self.build_rows(&mut table, &area, &atl03, atl08.as_ref(), scratch.as_ref(), scores.as_deref(), token)?;
        Ok(BeamOutcome { table, cancelled })
    }

    fn score_photons(&self, area: &AreaOfInterest, atl03: &Atl03Data) -> PhotonResult<Option<Vec<u8>>> {
        let params = &*self.params;
        let yapc = match &params.yapc {
            Some(yapc) if params.stages.yapc => yapc,
            _ => return Ok(None),
        };

        if yapc.version == 0 {
            return Ok(atl03.weight_ph.clone());
        }

        let scorer = YapcScorer::new(yapc.clone(), params.extent.min_photon_count)?;
        let inputs = YapcInputs {
            segment_ph_cnt: &area.segment_ph_cnt,
            segment_dist_x: &atl03.segment_dist_x,
            dist_ph_along: &atl03.dist_ph_along,
            h_ph: &atl03.h_ph,
        };
        scorer.score(&inputs).map(Some)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_rows(
        &self,
        table: &mut PhotonTable,
        area: &AreaOfInterest,
        atl03: &Atl03Data,
        atl08: Option<&Atl08Data>,
        scratch: Option<&ClassificationScratch>,
        scores: Option<&[u8]>,
        token: &CancellationToken,
    ) -> PhotonResult<bool> {
        let params = &*self.params;
        let cnf_mask = params.confidence_mask();
        let quality_mask = params.quality_mask();
        let class_mask = params.class_mask();
        let yapc_threshold = params.yapc.as_ref().map_or(0, |y| y.score);
        let phoreal = params.stages.phoreal;
        let use_abs_h = params.use_abs_h();
        let counts = &area.segment_ph_cnt;

        let mut background = BackgroundCursor::new(&atl03.bckgrd_delta_time, &atl03.bckgrd_rate)?;
        let mut segment = 0usize;
        let mut in_segment = 0u32;

        for photon in 0..area.num_photons {
            if !token.is_active() {
                log::debug!("Cancelled {} after {} rows", table.metadata.beam, table.len());
                return Ok(true);
            }

            in_segment += 1;
            while segment < counts.len() && in_segment > counts[segment] {
                in_segment = 1;
                segment += 1;
            }
            if segment >= counts.len() {
                return Err(PhotonError::DataConsistency(format!(
                    "photons with no segments detected in {} beam {} (segment {} of {})",
                    table.metadata.granule,
                    table.metadata.beam,
                    segment,
                    counts.len()
                )));
            }

            if !area.includes_segment(segment) {
                continue;
            }

            let atl03_cnf = atl03.confidence[photon];
            let confidence = SignalConfidence::from_code(atl03_cnf).ok_or_else(|| {
                PhotonError::DataConsistency(format!("invalid atl03 signal confidence: {}", atl03_cnf))
            })?;
            if !cnf_mask[confidence.index()] {
                continue;
            }

            let quality_ph = atl03.quality_ph[photon];
            let quality = PhotonQuality::from_code(quality_ph).ok_or_else(|| {
                PhotonError::DataConsistency(format!("invalid atl03 photon quality: {}", quality_ph))
            })?;
            if !quality_mask[quality.index()] {
                continue;
            }

            let mut atl08_class = Atl08Class::Unclassified as u8;
            if let Some(scratch) = scratch {
                atl08_class = scratch.classification[photon];
                let class = Atl08Class::from_code(atl08_class).ok_or_else(|| {
                    PhotonError::DataConsistency(format!("invalid atl08 classification: {}", atl08_class))
                })?;
                if !class_mask[class.index()] {
                    continue;
                }
            }

            let mut yapc_score = 0;
            if let Some(scores) = scores {
                yapc_score = scores[photon];
                if yapc_score < yapc_threshold {
                    continue;
                }
            }

            let mut relief = 0.0;
            let mut landcover = INVALID_FLAG;
            let mut snowcover = INVALID_FLAG;
            if let (true, Some(scratch)) = (phoreal, scratch) {
                relief = if use_abs_h {
                    atl03.h_ph[photon] as f32
                } else {
                    scratch.relief.as_ref().map_or(0.0, |r| r[photon])
                };
                landcover = scratch.landcover.as_ref().map_or(INVALID_FLAG, |c| c[photon]);
                snowcover = scratch.snowcover.as_ref().map_or(INVALID_FLAG, |c| c[photon]);
            }

            let velocity = atl03.velocity_sc.row(segment);
            let spacecraft_velocity = velocity.iter().map(|v| v * v).sum::<f64>().sqrt() as f32;
            let background_rate = background.rate_at(atl03.segment_delta_time[segment]);

            let mut ancillary = Vec::with_capacity(table.ancillary_names().count());
            ancillary.extend(atl03.anc_segment.iter().map(|values| values[segment]));
            ancillary.extend(atl03.anc_photon.iter().map(|values| values[photon]));
            if let Some(atl08) = atl08 {
                let land_segment = scratch
                    .and_then(|s| s.land_segment.as_ref())
                    .map_or(INVALID_INDEX, |index| index[photon]);
                ancillary.extend(atl08.ancillary.iter().map(|values| {
                    usize::try_from(land_segment)
                        .ok()
                        .and_then(|i| values.get(i).copied())
                        .unwrap_or(f64::NAN)
                }));
            }

            let row = PhotonRow {
                time_ns: delta_time_to_unix_ns(atl03.delta_time[photon]),
                latitude: atl03.lat_ph[photon],
                longitude: atl03.lon_ph[photon],
                x_atc: atl03.dist_ph_along[photon] + atl03.segment_dist_x[segment],
                y_atc: atl03.dist_ph_across[photon],
                height: atl03.h_ph[photon] as f32,
                relief,
                landcover,
                snowcover,
                atl08_class,
                atl03_cnf,
                quality_ph,
                yapc_score,
                segment_id: atl03.segment_id[segment],
                ph_index: (area.first_photon + photon) as u32,
                solar_elevation: atl03.solar_elevation[segment],
                spacecraft_velocity,
                background_rate: background_rate as f32,
                ancillary,
            };
            table.append(&row)?;
        }

        Ok(false)
    }
}

/// Sends the unit's completion exactly once, including on unwinding
///
/// A unit that never reached `complete` is reported as failed, both as its
/// completion and on the alert channel.
struct CompletionGuard {
    beam: Beam,
    resource: String,
    metadata: Option<TableMetadata>,
    sender: Sender<BeamCompletion>,
    alerts: Sender<Alert>,
    completion: Option<(BeamStatus, PhotonTable)>,
}

impl CompletionGuard {
    fn new(
        beam: Beam,
        granule: &Granule,
        sender: Sender<BeamCompletion>,
        alerts: Sender<Alert>,
    ) -> Self {
        Self {
            beam,
            resource: granule.name.name.clone(),
            metadata: Some(beam_metadata(granule, beam)),
            sender,
            alerts,
            completion: None,
        }
    }

    fn complete(&mut self, status: BeamStatus, table: PhotonTable) {
        self.completion = Some((status, table));
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let (status, table) = match self.completion.take() {
            Some(completion) => completion,
            None => {
                let error = PhotonError::DataConsistency(format!(
                    "beam {} unit ended without completing",
                    self.beam
                ));
                log::error!("Failure on resource {} beam {}: {}", self.resource, self.beam, error);
                let _ = self
                    .alerts
                    .send(Alert::from_error(&error, &self.resource, self.beam));

                let metadata = self
                    .metadata
                    .take()
                    .unwrap_or_else(|| TableMetadata::new(&self.resource, self.beam));
                (BeamStatus::Failed(error), PhotonTable::new(metadata))
            }
        };
        let _ = self.sender.send(BeamCompletion {
            beam: self.beam,
            status,
            table,
        });
    }
}

/// Running request: collects completions and alerts from the beam units
pub struct SubsetHandle {
    completions: Receiver<BeamCompletion>,
    alerts: Receiver<Alert>,
    workers: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

/// Everything a finished request produced
#[derive(Debug)]
pub struct SubsetReport {
    /// One per beam unit, in beam order
    pub completions: Vec<BeamCompletion>,
    pub alerts: Vec<Alert>,
}

impl SubsetReport {
    pub fn total_rows(&self) -> usize {
        self.completions.iter().map(|c| c.table.len()).sum()
    }

    /// Tables of the beams that produced rows
    pub fn tables(&self) -> Vec<&PhotonTable> {
        self.completions
            .iter()
            .filter(|c| !c.table.is_empty())
            .map(|c| &c.table)
            .collect()
    }
}

impl SubsetHandle {
    /// Ask every unit to stop; each still reports its completion
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Alerts raised so far
    pub fn pending_alerts(&self) -> Vec<Alert> {
        self.alerts.try_iter().collect()
    }

    /// Block until every unit has completed
    pub fn wait(self) -> SubsetReport {
        let expected = self.workers.len();
        let mut completions = Vec::with_capacity(expected);
        while completions.len() < expected {
            match self.completions.recv() {
                Ok(completion) => completions.push(completion),
                Err(_) => break,
            }
        }

        for worker in self.workers {
            let name = worker.thread().name().unwrap_or("subset").to_string();
            if worker.join().is_err() {
                log::error!("Beam unit {} panicked", name);
            }
        }

        completions.sort_by_key(|c: &BeamCompletion| c.beam.index());
        let alerts = self.alerts.try_iter().collect();
        SubsetReport { completions, alerts }
    }
}

fn beam_metadata(granule: &Granule, beam: Beam) -> TableMetadata {
    let mut metadata = TableMetadata::new(&granule.name.name, beam);
    metadata.cycle = granule.name.cycle;
    metadata.rgt = granule.name.rgt;
    metadata.region = granule.name.region;
    metadata
}

fn resolve_area(
    store: &dyn ArrayStore,
    beam: Beam,
    params: &SubsetParams,
    timeout: Duration,
) -> PhotonResult<AreaOfInterest> {
    let whole = ReadWindow::all();
    let first = ColumnSelect::Index(0);

    let latitude = read_array::<f64>(store, &beam_dataset(beam, paths::REFERENCE_PHOTON_LAT), first, whole);
    let longitude = read_array::<f64>(store, &beam_dataset(beam, paths::REFERENCE_PHOTON_LON), first, whole);
    let photon_count = read_array::<u32>(store, &beam_dataset(beam, paths::SEGMENT_PH_CNT), first, whole);
    let segment_id = params
        .segment_id_range
        .map(|_| read_array::<u32>(store, &beam_dataset(beam, paths::SEGMENT_ID), first, whole));

    let latitude = latitude.join(timeout)?.to_vec();
    let longitude = longitude.join(timeout)?.to_vec();
    let photon_count = photon_count.join(timeout)?.to_vec();
    let segment_id = match segment_id {
        Some(pending) => Some(pending.join(timeout)?.to_vec()),
        None => None,
    };

    let geometry = SegmentGeometry {
        latitude: &latitude,
        longitude: &longitude,
        photon_count: &photon_count,
        segment_id: segment_id.as_deref(),
    };
    region::resolve(&geometry, params.segment_id_range, params.region_test())
}

/// ATL03 datasets of one beam, windowed to its area of interest
struct Atl03Data {
    segment_id: Vec<u32>,
    segment_delta_time: Vec<f64>,
    segment_dist_x: Vec<f64>,
    solar_elevation: Vec<f32>,
    velocity_sc: DataArray<f64>,
    dist_ph_along: Vec<f64>,
    dist_ph_across: Vec<f32>,
    h_ph: Vec<f64>,
    /// Signal confidence of the configured surface type
    confidence: Vec<i8>,
    quality_ph: Vec<i8>,
    lat_ph: Vec<f64>,
    lon_ph: Vec<f64>,
    delta_time: Vec<f64>,
    weight_ph: Option<Vec<u8>>,
    bckgrd_delta_time: Vec<f64>,
    bckgrd_rate: Vec<f64>,
    sc_orient: Vec<i8>,
    /// Segment-rate ancillary fields, geolocation then geophys_corr
    anc_segment: Vec<Vec<f64>>,
    anc_photon: Vec<Vec<f64>>,
}

impl Atl03Data {
    fn read(
        store: &dyn ArrayStore,
        beam: Beam,
        area: &AreaOfInterest,
        params: &SubsetParams,
        read_weights: bool,
        timeout: Duration,
    ) -> PhotonResult<Self> {
        let segments = ReadWindow::rows(area.first_segment, area.num_segments);
        let photons = ReadWindow::rows(area.first_photon, area.num_photons);
        let first = ColumnSelect::Index(0);
        let path = |relative: &str| beam_dataset(beam, relative);
        let confidence_column = match params.surface_type.column() {
            Some(column) => ColumnSelect::Index(column),
            None => ColumnSelect::All,
        };

        let segment_id = read_array::<u32>(store, &path(paths::SEGMENT_ID), first, segments);
        let segment_delta_time = read_array::<f64>(store, &path(paths::SEGMENT_DELTA_TIME), first, segments);
        let segment_dist_x = read_array::<f64>(store, &path(paths::SEGMENT_DIST_X), first, segments);
        let solar_elevation = read_array::<f32>(store, &path(paths::SOLAR_ELEVATION), first, segments);
        let velocity_sc = read_array::<f64>(store, &path(paths::VELOCITY_SC), ColumnSelect::All, segments);
        let dist_ph_along = read_array::<f64>(store, &path(paths::DIST_PH_ALONG), first, photons);
        let dist_ph_across = read_array::<f32>(store, &path(paths::DIST_PH_ACROSS), first, photons);
        let h_ph = read_array::<f64>(store, &path(paths::H_PH), first, photons);
        let signal_conf_ph = read_array::<i8>(store, &path(paths::SIGNAL_CONF_PH), confidence_column, photons);
        let quality_ph = read_array::<i8>(store, &path(paths::QUALITY_PH), first, photons);
        let lat_ph = read_array::<f64>(store, &path(paths::LAT_PH), first, photons);
        let lon_ph = read_array::<f64>(store, &path(paths::LON_PH), first, photons);
        let delta_time = read_array::<f64>(store, &path(paths::PH_DELTA_TIME), first, photons);
        let weight_ph = read_weights.then(|| read_array::<u8>(store, &path(paths::WEIGHT_PH), first, photons));
        let bckgrd_delta_time = read_array::<f64>(store, &path(paths::BCKGRD_DELTA_TIME), first, ReadWindow::all());
        let bckgrd_rate = read_array::<f64>(store, &path(paths::BCKGRD_RATE), first, ReadWindow::all());
        let sc_orient = read_array::<i8>(store, paths::SC_ORIENT, first, ReadWindow::all());

        let anc_segment: Vec<PendingArray<f64>> = params
            .ancillary
            .geo
            .iter()
            .map(|name| (paths::GEOLOCATION_GROUP, name))
            .chain(params.ancillary.corr.iter().map(|name| (paths::GEOPHYS_CORR_GROUP, name)))
            .map(|(group, name)| read_array(store, &path(&format!("{}/{}", group, name)), first, segments))
            .collect();
        let anc_photon: Vec<PendingArray<f64>> = params
            .ancillary
            .photon
            .iter()
            .map(|name| read_array(store, &path(&format!("{}/{}", paths::HEIGHTS_GROUP, name)), first, photons))
            .collect();

        let signal_conf_ph = signal_conf_ph.join(timeout)?;

        Ok(Self {
            segment_id: segment_id.join(timeout)?.to_vec(),
            segment_delta_time: segment_delta_time.join(timeout)?.to_vec(),
            segment_dist_x: segment_dist_x.join(timeout)?.to_vec(),
            solar_elevation: solar_elevation.join(timeout)?.to_vec(),
            velocity_sc: velocity_sc.join(timeout)?,
            dist_ph_along: dist_ph_along.join(timeout)?.to_vec(),
            dist_ph_across: dist_ph_across.join(timeout)?.to_vec(),
            h_ph: h_ph.join(timeout)?.to_vec(),
            confidence: resolve_confidence(&signal_conf_ph),
            quality_ph: quality_ph.join(timeout)?.to_vec(),
            lat_ph: lat_ph.join(timeout)?.to_vec(),
            lon_ph: lon_ph.join(timeout)?.to_vec(),
            delta_time: delta_time.join(timeout)?.to_vec(),
            weight_ph: match weight_ph {
                Some(pending) => Some(pending.join(timeout)?.to_vec()),
                None => None,
            },
            bckgrd_delta_time: bckgrd_delta_time.join(timeout)?.to_vec(),
            bckgrd_rate: bckgrd_rate.join(timeout)?.to_vec(),
            sc_orient: sc_orient.join(timeout)?.to_vec(),
            anc_segment: join_all(anc_segment, timeout)?,
            anc_photon: join_all(anc_photon, timeout)?,
        })
    }
}

/// Highest confidence across the columns read; a single column passes through
fn resolve_confidence(signal_conf_ph: &DataArray<i8>) -> Vec<i8> {
    signal_conf_ph
        .as_array()
        .map_axis(Axis(1), |row| {
            row.iter()
                .copied()
                .max()
                .unwrap_or(SignalConfidence::PossibleTep as i8)
        })
        .to_vec()
}

fn join_all(pending: Vec<PendingArray<f64>>, timeout: Duration) -> PhotonResult<Vec<Vec<f64>>> {
    pending
        .into_iter()
        .map(|read| read.join(timeout).map(|data| data.to_vec()))
        .collect()
}

/// ATL08 reads, issued before the area of interest is resolved
struct Atl08Reads {
    ph_segment_id: PendingArray<u32>,
    classed_pc_indx: PendingArray<u32>,
    classed_pc_flag: PendingArray<u8>,
    ph_h: Option<PendingArray<f32>>,
    segment_id_beg: Option<PendingArray<u32>>,
    landcover: Option<PendingArray<u8>>,
    snowcover: Option<PendingArray<u8>>,
    ancillary: Vec<PendingArray<f64>>,
}

struct Atl08Data {
    ph_segment_id: Vec<u32>,
    classed_pc_indx: Vec<u32>,
    classed_pc_flag: Vec<u8>,
    ph_h: Option<Vec<f32>>,
    segment_id_beg: Option<Vec<u32>>,
    landcover: Option<Vec<u8>>,
    snowcover: Option<Vec<u8>>,
    /// Per land segment
    ancillary: Vec<Vec<f64>>,
}

impl Atl08Reads {
    fn issue(store: &dyn ArrayStore, beam: Beam, params: &SubsetParams) -> Self {
        let whole = ReadWindow::all();
        let first = ColumnSelect::Index(0);
        let path = |relative: &str| beam_dataset(beam, relative);
        let phoreal = params.stages.phoreal;
        let land_segments = phoreal || !params.ancillary.atl08.is_empty();

        Self {
            ph_segment_id: read_array(store, &path(paths::ATL08_PH_SEGMENT_ID), first, whole),
            classed_pc_indx: read_array(store, &path(paths::ATL08_CLASSED_PC_INDX), first, whole),
            classed_pc_flag: read_array(store, &path(paths::ATL08_CLASSED_PC_FLAG), first, whole),
            ph_h: phoreal.then(|| read_array(store, &path(paths::ATL08_PH_H), first, whole)),
            segment_id_beg: land_segments
                .then(|| read_array(store, &path(paths::ATL08_SEGMENT_ID_BEG), first, whole)),
            landcover: phoreal.then(|| read_array(store, &path(paths::ATL08_SEGMENT_LANDCOVER), first, whole)),
            snowcover: phoreal.then(|| read_array(store, &path(paths::ATL08_SEGMENT_SNOWCOVER), first, whole)),
            ancillary: params
                .ancillary
                .atl08
                .iter()
                .map(|name| {
                    read_array(
                        store,
                        &path(&format!("{}/{}", paths::LAND_SEGMENTS_GROUP, name)),
                        first,
                        whole,
                    )
                })
                .collect(),
        }
    }

    fn join(self, timeout: Duration) -> PhotonResult<Atl08Data> {
        fn optional<T: num_traits::NumCast + Copy>(
            read: Option<PendingArray<T>>,
            timeout: Duration,
        ) -> PhotonResult<Option<Vec<T>>> {
            match read {
                Some(pending) => Ok(Some(pending.join(timeout)?.to_vec())),
                None => Ok(None),
            }
        }

        Ok(Atl08Data {
            ph_segment_id: self.ph_segment_id.join(timeout)?.to_vec(),
            classed_pc_indx: self.classed_pc_indx.join(timeout)?.to_vec(),
            classed_pc_flag: self.classed_pc_flag.join(timeout)?.to_vec(),
            ph_h: optional(self.ph_h, timeout)?,
            segment_id_beg: optional(self.segment_id_beg, timeout)?,
            landcover: optional(self.landcover, timeout)?,
            snowcover: optional(self.snowcover, timeout)?,
            ancillary: join_all(self.ancillary, timeout)?,
        })
    }
}

fn classify(
    atl08: &Atl08Data,
    area: &AreaOfInterest,
    atl03: &Atl03Data,
    params: &SubsetParams,
    spot: u8,
) -> PhotonResult<ClassificationScratch> {
    let segments = Atl03Segments {
        segment_id: &atl03.segment_id,
        segment_ph_cnt: &area.segment_ph_cnt,
    };
    let photons = Atl08SignalPhotons {
        ph_segment_id: &atl08.ph_segment_id,
        classed_pc_indx: &atl08.classed_pc_indx,
        classed_pc_flag: &atl08.classed_pc_flag,
        ph_h: atl08.ph_h.as_deref(),
    };

    let mut classifier = Atl08Classifier::new();
    if let Some(segment_id_beg) = &atl08.segment_id_beg {
        classifier = classifier.with_land_segments(Atl08LandSegments {
            segment_id_beg,
            landcover: atl08.landcover.as_deref(),
            snowcover: atl08.snowcover.as_deref(),
        });
    }
    if params.above_classifier() {
        classifier = classifier.with_above(AboveInputs {
            spot,
            solar_elevation: &atl03.solar_elevation,
            signal_conf: &atl03.confidence,
        });
    }

    classifier.classify(&segments, &photons)
}

/// Background rate interpolated at segment times, which only move forward
struct BackgroundCursor<'a> {
    time: &'a [f64],
    rate: &'a [f64],
    index: usize,
}

impl<'a> BackgroundCursor<'a> {
    fn new(time: &'a [f64], rate: &'a [f64]) -> PhotonResult<Self> {
        if rate.is_empty() || time.len() != rate.len() {
            return Err(PhotonError::DataConsistency(format!(
                "background rate has {} samples for {} times",
                rate.len(),
                time.len()
            )));
        }
        Ok(Self {
            time,
            rate,
            index: 0,
        })
    }

    fn rate_at(&mut self, segment_time: f64) -> f64 {
        while self.index < self.rate.len() {
            let current_time = self.time[self.index];
            if current_time >= segment_time {
                if self.index == 0 {
                    return self.rate[0];
                }
                let previous_time = self.time[self.index - 1];
                let previous_rate = self.rate[self.index - 1];
                let run = current_time - previous_time;
                let rise = self.rate[self.index] - previous_rate;
                return rise / run * (segment_time - previous_time) + previous_rate;
            }
            self.index += 1;
        }
        self.rate[self.rate.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_background_interpolation() {
        let time = [10.0, 20.0, 30.0];
        let rate = [100.0, 200.0, 400.0];
        let mut cursor = BackgroundCursor::new(&time, &rate).unwrap();

        assert_abs_diff_eq!(cursor.rate_at(5.0), 100.0);
        assert_abs_diff_eq!(cursor.rate_at(15.0), 150.0);
        assert_abs_diff_eq!(cursor.rate_at(25.0), 300.0);
        assert_abs_diff_eq!(cursor.rate_at(35.0), 400.0);
    }

    #[test]
    fn test_background_requires_samples() {
        assert!(BackgroundCursor::new(&[], &[]).is_err());
    }

    #[test]
    fn test_unfinished_unit_reports_failure() {
        let granule = Granule::new(Arc::new(crate::io::MemoryStore::new(
            "ATL03_20181019065445_03150111_006_02.h5",
        )));
        let (completion_tx, completion_rx) = unbounded();
        let (alert_tx, alert_rx) = unbounded();

        drop(CompletionGuard::new(Beam::Gt2l, &granule, completion_tx, alert_tx));

        let completion = completion_rx.try_recv().unwrap();
        assert_eq!(completion.beam, Beam::Gt2l);
        assert!(matches!(
            completion.status,
            BeamStatus::Failed(PhotonError::DataConsistency(_))
        ));
        assert!(completion.table.is_empty());
        assert_eq!(completion.table.metadata.rgt, Some(315));
        assert!(completion_rx.try_recv().is_err());

        let alert = alert_rx.try_recv().unwrap();
        assert_eq!(alert.beam, Some(Beam::Gt2l));
        assert!(alert.message.contains("ATL03_20181019065445"));
        assert!(alert_rx.try_recv().is_err());
    }

    #[test]
    fn test_completed_unit_raises_no_alert() {
        let granule = Granule::new(Arc::new(crate::io::MemoryStore::new("granule")));
        let (completion_tx, completion_rx) = unbounded();
        let (alert_tx, alert_rx) = unbounded();

        let mut guard = CompletionGuard::new(Beam::Gt1r, &granule, completion_tx, alert_tx);
        guard.complete(BeamStatus::Empty, PhotonTable::new(beam_metadata(&granule, Beam::Gt1r)));
        drop(guard);

        assert!(matches!(completion_rx.try_recv().unwrap().status, BeamStatus::Empty));
        assert!(alert_rx.try_recv().is_err());
    }

    #[test]
    fn test_dynamic_confidence() {
        let conf = DataArray::new(ndarray::arr2(&[[0i8, 4, 1, -1, 2], [-2, -1, -1, -1, -1]]));
        assert_eq!(resolve_confidence(&conf), vec![4, -1]);

        let single = DataArray::from_vec(vec![3i8, 0]);
        assert_eq!(resolve_confidence(&single), vec![3, 0]);
    }
}
