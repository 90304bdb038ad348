//! Cancellation and completion reporting for beam units

use crate::core::table::PhotonTable;
use crate::types::{Beam, ErrorCode, PhotonError, Severity};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation shared by every beam unit of a request
#[derive(Debug, Clone)]
pub struct CancellationToken {
    active: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Ask every unit to stop producing rows
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Side-channel report of a beam failure
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub severity: Severity,
    pub code: ErrorCode,
    pub message: String,
    pub beam: Option<Beam>,
}

impl Alert {
    pub fn from_error(error: &PhotonError, resource: &str, beam: Beam) -> Self {
        Self {
            severity: error.severity(),
            code: error.code(),
            message: format!("Failure on resource {} beam {}: {}", resource, beam, error),
            beam: Some(beam),
        }
    }
}

/// Terminal state of one beam unit
#[derive(Debug)]
pub enum BeamStatus {
    Complete { rows: usize },
    /// The region held no photons for this beam
    Empty,
    Cancelled { rows: usize },
    Failed(PhotonError),
}

impl BeamStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, BeamStatus::Failed(_))
    }
}

/// Completion signal of one beam unit, carrying the rows it produced
#[derive(Debug)]
pub struct BeamCompletion {
    pub beam: Beam,
    pub status: BeamStatus,
    pub table: PhotonTable,
}
