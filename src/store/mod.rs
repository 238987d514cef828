//! Result store: one numbered directory per measurement run.
//!
//! Layout under the configured base directory:
//!
//! ```text
//! <basedir>/<run_id>/data.tsv        (during acquisition)
//! <basedir>/<run_id>/data.tsv.lz4    (after finalize)
//! <basedir>/<run_id>/metadata.json
//! ```
//!
//! Run IDs are the smallest unused non-negative integers; directory creation
//! is the atomic arbitration point, so two processes racing over one basedir
//! can never allocate the same run. Each run directory is exclusively owned
//! by its writer; there is no cross-run locking.

mod reader;
mod writer;

pub use reader::{list_runs, run_info, RunReader};
pub use writer::RunWriter;

/// Uncompressed data file name, present while a run is being acquired.
pub const DATA_FILE: &str = "data.tsv";
/// Compressed data file name, produced at finalize.
pub const DATA_FILE_COMPRESSED: &str = "data.tsv.lz4";
/// Metadata sidecar name.
pub const METADATA_FILE: &str = "metadata.json";
