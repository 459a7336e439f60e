//! External merge sort for record streams.
//!
//! The sorting process:
//!
//! 1. **Accumulate**: records are buffered until a count or memory limit trips
//! 2. **Sort**: stable in-memory sort, parallel on a dedicated sort pool for
//!    large buffers
//! 3. **Spill**: each sorted run is written to a temp file
//! 4. **Merge**: a single k-way merge over the runs, keyed by the active
//!    comparator with run order breaking ties
//!
//! Runs that fit entirely in memory skip the spill and merge phases.

pub mod external;
pub mod keys;

pub use external::{ExternalSorter, SortedStream, SorterConfig, new_sort_pool};
pub use keys::{CoordinateKey, QuerynameKey, SortKey, SortOrder};
