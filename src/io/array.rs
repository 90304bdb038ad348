//! Array-store interface and typed dataset contents
//!
//! Reads are issued first and joined later, so every dataset a beam needs
//! can be in flight at once.

use crate::types::{PhotonError, PhotonResult};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use ndarray::{Array2, ArrayView1, Axis};
use num_traits::NumCast;
use std::ops::Index;
use std::time::Duration;

/// Columns of a two-dimensional dataset to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSelect {
    /// Every column; rows keep their full width
    All,
    /// A single column
    Index(usize),
}

/// Row window of a dataset to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWindow {
    pub start: usize,
    /// Number of rows, or `None` for everything from `start`
    pub count: Option<usize>,
}

impl ReadWindow {
    /// The whole dataset
    pub fn all() -> Self {
        Self { start: 0, count: None }
    }

    pub fn rows(start: usize, count: usize) -> Self {
        Self {
            start,
            count: Some(count),
        }
    }
}

impl Default for ReadWindow {
    fn default() -> Self {
        Self::all()
    }
}

/// Chunked, range-addressable array store
///
/// Implementations start the read and hand back a channel on which exactly
/// one result is delivered. The caller decides how long to wait for it.
pub trait ArrayStore: Send + Sync {
    /// Name of the resource this store serves, used in messages
    fn name(&self) -> &str;

    /// Start reading `path` restricted to `column` and `window`
    fn submit(
        &self,
        path: &str,
        column: ColumnSelect,
        window: ReadWindow,
    ) -> Receiver<PhotonResult<Array2<f64>>>;
}

/// Start a typed read against a store
pub fn read_array<T: NumCast + Copy>(
    store: &dyn ArrayStore,
    path: &str,
    column: ColumnSelect,
    window: ReadWindow,
) -> PendingArray<T> {
    log::debug!("Reading {} from {} ({:?}, {:?})", path, store.name(), column, window);
    PendingArray {
        path: format!("{}:{}", store.name(), path),
        receiver: store.submit(path, column, window),
        _marker: std::marker::PhantomData,
    }
}

/// A read that has been issued but not yet joined
pub struct PendingArray<T> {
    path: String,
    receiver: Receiver<PhotonResult<Array2<f64>>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: NumCast + Copy> PendingArray<T> {
    /// Block until the read completes or `timeout` elapses
    pub fn join(self, timeout: Duration) -> PhotonResult<DataArray<T>> {
        let raw = match self.receiver.recv_timeout(timeout) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => return Err(PhotonError::Timeout(self.path)),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PhotonError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    format!("read of {} was abandoned", self.path),
                )))
            }
        };
        DataArray::from_raw(&self.path, raw)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Typed, row-indexable dataset contents
#[derive(Debug, Clone)]
pub struct DataArray<T> {
    data: Array2<T>,
}

impl<T: NumCast + Copy> DataArray<T> {
    fn from_raw(path: &str, raw: Array2<f64>) -> PhotonResult<Self> {
        let (rows, cols) = raw.dim();
        let mut values = Vec::with_capacity(rows * cols);
        for &v in raw.iter() {
            match T::from(v) {
                Some(t) => values.push(t),
                None => {
                    return Err(PhotonError::DataConsistency(format!(
                        "value {} in {} does not fit the requested type",
                        v, path
                    )))
                }
            }
        }

        let data = Array2::from_shape_vec((rows, cols), values)
            .map_err(|e| PhotonError::DataConsistency(format!("{}: {}", path, e)))?;
        Ok(Self { data })
    }
}

impl<T: Copy> DataArray<T> {
    /// Wrap an owned array
    pub fn new(data: Array2<T>) -> Self {
        Self { data }
    }

    /// Build a single-column array from values
    pub fn from_vec(values: Vec<T>) -> Self {
        let data = Array2::from_shape_fn((values.len(), 1), |(row, _)| values[row]);
        Self { data }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        self.data.get((row, col)).copied()
    }

    pub fn row(&self, row: usize) -> ArrayView1<'_, T> {
        self.data.row(row)
    }

    /// First column as a contiguous vector
    pub fn to_vec(&self) -> Vec<T> {
        self.data.column(0).to_vec()
    }

    /// Drop the first `start` rows
    pub fn trim(&mut self, start: usize) {
        let start = start.min(self.data.nrows());
        if start > 0 {
            let kept = self
                .data
                .slice_axis(Axis(0), ndarray::Slice::from(start..))
                .to_owned();
            self.data = kept;
        }
    }

    pub fn as_array(&self) -> &Array2<T> {
        &self.data
    }
}

impl<T> Index<usize> for DataArray<T> {
    type Output = T;

    /// Element in the first column
    fn index(&self, row: usize) -> &T {
        &self.data[[row, 0]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use ndarray::array;

    struct FixedStore {
        data: Array2<f64>,
    }

    impl ArrayStore for FixedStore {
        fn name(&self) -> &str {
            "fixed"
        }

        fn submit(
            &self,
            _path: &str,
            _column: ColumnSelect,
            _window: ReadWindow,
        ) -> Receiver<PhotonResult<Array2<f64>>> {
            let (tx, rx) = bounded(1);
            let _ = tx.send(Ok(self.data.clone()));
            rx
        }
    }

    struct SilentStore;

    impl ArrayStore for SilentStore {
        fn name(&self) -> &str {
            "silent"
        }

        fn submit(
            &self,
            _path: &str,
            _column: ColumnSelect,
            _window: ReadWindow,
        ) -> Receiver<PhotonResult<Array2<f64>>> {
            let (tx, rx) = bounded(1);
            std::mem::forget(tx);
            rx
        }
    }

    #[test]
    fn test_join_converts_types() {
        let store = FixedStore {
            data: array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]],
        };
        let array: DataArray<i32> = read_array(&store, "/gt1l/x", ColumnSelect::All, ReadWindow::all())
            .join(Duration::from_secs(1))
            .unwrap();
        assert_eq!(array.len(), 3);
        assert_eq!(array.ncols(), 2);
        assert_eq!(array[2], 5);
        assert_eq!(array.get(1, 1), Some(4));
    }

    #[test]
    fn test_join_rejects_unrepresentable_values() {
        let store = FixedStore {
            data: array![[1.0], [-3.0]],
        };
        let result = read_array::<u32>(&store, "/gt1l/counts", ColumnSelect::Index(0), ReadWindow::all())
            .join(Duration::from_secs(1));
        assert!(matches!(result, Err(PhotonError::DataConsistency(_))));
    }

    #[test]
    fn test_join_times_out() {
        let result = read_array::<f64>(&SilentStore, "/gt1l/h_ph", ColumnSelect::Index(0), ReadWindow::all())
            .join(Duration::from_millis(20));
        assert!(matches!(result, Err(PhotonError::Timeout(_))));
    }

    #[test]
    fn test_trim() {
        let mut array = DataArray::from_vec(vec![1u32, 2, 3, 4]);
        array.trim(1);
        assert_eq!(array.to_vec(), vec![2, 3, 4]);
        array.trim(10);
        assert!(array.is_empty());
    }
}
