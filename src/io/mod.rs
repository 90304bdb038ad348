//! Granule access: the array-store interface, an in-memory store and dataset naming

pub mod array;
pub mod granule;
pub mod memory;

pub use array::{read_array, ArrayStore, ColumnSelect, DataArray, PendingArray, ReadWindow};
pub use granule::{beam_dataset, Granule, GranuleName};
pub use memory::MemoryStore;
