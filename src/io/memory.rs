//! Array store backed by datasets held in memory

use crate::io::array::{ArrayStore, ColumnSelect, ReadWindow};
use crate::types::{PhotonError, PhotonResult};
use crossbeam_channel::{bounded, Receiver};
use ndarray::{s, Array2};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// In-memory array store
///
/// Holds every dataset as a two-dimensional `f64` array keyed by its full
/// path. Reads can be delayed to simulate a remote store, and individual
/// paths can be configured to fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    name: String,
    datasets: HashMap<String, Arc<Array2<f64>>>,
    latency: Option<Duration>,
    failures: HashSet<String>,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Add a two-dimensional dataset
    pub fn with_dataset(mut self, path: &str, data: Array2<f64>) -> Self {
        self.insert(path, data);
        self
    }

    /// Add a one-dimensional dataset
    pub fn with_column<T: Copy + Into<f64>>(mut self, path: &str, values: &[T]) -> Self {
        self.insert_column(path, values);
        self
    }

    /// Delay every read by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every read of `path` fail
    pub fn with_failure(mut self, path: &str) -> Self {
        self.failures.insert(path.to_string());
        self
    }

    pub fn insert(&mut self, path: &str, data: Array2<f64>) {
        self.datasets.insert(path.to_string(), Arc::new(data));
    }

    pub fn insert_column<T: Copy + Into<f64>>(&mut self, path: &str, values: &[T]) {
        let data = Array2::from_shape_fn((values.len(), 1), |(row, _)| values[row].into());
        self.insert(path, data);
    }

    fn slice(
        path: &str,
        data: &Array2<f64>,
        column: ColumnSelect,
        window: ReadWindow,
    ) -> PhotonResult<Array2<f64>> {
        let rows = data.nrows();
        let end = match window.count {
            Some(count) => window.start + count,
            None => rows,
        };
        if window.start > rows || end > rows {
            return Err(PhotonError::DataConsistency(format!(
                "read window [{}, {}) exceeds {} rows of {}",
                window.start, end, rows, path
            )));
        }

        match column {
            ColumnSelect::All => Ok(data.slice(s![window.start..end, ..]).to_owned()),
            ColumnSelect::Index(col) if col < data.ncols() => {
                Ok(data.slice(s![window.start..end, col..col + 1]).to_owned())
            }
            ColumnSelect::Index(col) => Err(PhotonError::DataConsistency(format!(
                "column {} exceeds {} columns of {}",
                col,
                data.ncols(),
                path
            ))),
        }
    }
}

impl ArrayStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(
        &self,
        path: &str,
        column: ColumnSelect,
        window: ReadWindow,
    ) -> Receiver<PhotonResult<Array2<f64>>> {
        let (tx, rx) = bounded(1);

        let result = if self.failures.contains(path) {
            Err(PhotonError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("failed to read {} from {}", path, self.name),
            )))
        } else {
            match self.datasets.get(path) {
                Some(data) => Self::slice(path, data, column, window),
                None => Err(PhotonError::MissingDataset(format!("{}:{}", self.name, path))),
            }
        };

        match self.latency {
            Some(latency) => {
                std::thread::spawn(move || {
                    std::thread::sleep(latency);
                    // the reader may have timed out and gone away
                    let _ = tx.send(result);
                });
            }
            None => {
                let _ = tx.send(result);
            }
        }

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::array::read_array;
    use ndarray::array;

    #[test]
    fn test_windowed_reads() {
        let store = MemoryStore::new("ATL03_test.h5")
            .with_column("/gt1l/heights/h_ph", &[1.0, 2.0, 3.0, 4.0, 5.0])
            .with_dataset("/gt1l/geolocation/velocity_sc", array![[1.0, 2.0, 2.0], [0.0, 3.0, 4.0]]);

        let h = read_array::<f64>(&store, "/gt1l/heights/h_ph", ColumnSelect::Index(0), ReadWindow::rows(1, 3))
            .join(Duration::from_secs(1))
            .unwrap();
        assert_eq!(h.to_vec(), vec![2.0, 3.0, 4.0]);

        let v = read_array::<f64>(&store, "/gt1l/geolocation/velocity_sc", ColumnSelect::All, ReadWindow::rows(1, 1))
            .join(Duration::from_secs(1))
            .unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(v.ncols(), 3);
        assert_eq!(v.get(0, 2), Some(4.0));
    }

    #[test]
    fn test_missing_and_failing_reads() {
        let store = MemoryStore::new("ATL03_test.h5")
            .with_column("/gt1l/heights/h_ph", &[1.0])
            .with_failure("/gt1l/heights/h_ph");

        let failed = read_array::<f64>(&store, "/gt1l/heights/h_ph", ColumnSelect::Index(0), ReadWindow::all())
            .join(Duration::from_secs(1));
        assert!(matches!(failed, Err(PhotonError::Io(_))));

        let missing = read_array::<f64>(&store, "/gt2l/heights/h_ph", ColumnSelect::Index(0), ReadWindow::all())
            .join(Duration::from_secs(1));
        assert!(matches!(missing, Err(PhotonError::MissingDataset(_))));
    }

    #[test]
    fn test_window_out_of_range() {
        let store = MemoryStore::new("ATL03_test.h5").with_column("/gt1l/heights/h_ph", &[1.0, 2.0]);
        let result = read_array::<f64>(&store, "/gt1l/heights/h_ph", ColumnSelect::Index(0), ReadWindow::rows(1, 5))
            .join(Duration::from_secs(1));
        assert!(matches!(result, Err(PhotonError::DataConsistency(_))));
    }

    #[test]
    fn test_latency_exceeding_timeout() {
        let store = MemoryStore::new("ATL03_slow.h5")
            .with_column("/gt1l/heights/h_ph", &[1.0])
            .with_latency(Duration::from_millis(500));
        let result = read_array::<f64>(&store, "/gt1l/heights/h_ph", ColumnSelect::Index(0), ReadWindow::all())
            .join(Duration::from_millis(10));
        assert!(matches!(result, Err(PhotonError::Timeout(_))));
    }
}
