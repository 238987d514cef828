//! Readback of finished (or crashed) runs.

use lz4_flex::frame::FrameDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use super::{DATA_FILE, DATA_FILE_COMPRESSED, METADATA_FILE};
use crate::error::{AppResult, SweepError};
use crate::metadata::RunMetadata;

/// Reads the files written by a [`RunWriter`](super::RunWriter).
///
/// Accepts both finalized runs (`data.tsv.lz4`) and runs that never
/// finalized (`data.tsv` left behind by a crash); partial data is always
/// discoverable.
pub struct RunReader {
    id: u64,
    dir: PathBuf,
    metadata: RunMetadata,
}

impl RunReader {
    /// Open run `id` under `basedir`.
    pub fn open(basedir: &Path, id: u64) -> AppResult<Self> {
        let dir = basedir.join(id.to_string());
        let metadata = read_metadata(&dir)?;
        Ok(Self { id, dir, metadata })
    }

    /// Run ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Metadata sidecar contents.
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Path of the data file actually present on disk.
    pub fn data_path(&self) -> AppResult<PathBuf> {
        let compressed = self.dir.join(DATA_FILE_COMPRESSED);
        if compressed.exists() {
            return Ok(compressed);
        }
        let plain = self.dir.join(DATA_FILE);
        if plain.exists() {
            return Ok(plain);
        }
        Err(SweepError::Storage(format!(
            "no data file in {}",
            self.dir.display()
        )))
    }

    /// Read back a named byte attachment stored with
    /// [`RunWriter::add_blob`](super::RunWriter::add_blob).
    pub fn blob(&self, name: &str) -> AppResult<Vec<u8>> {
        Ok(fs::read(self.dir.join(name))?)
    }

    /// Load every row as `f64` values, in acquisition order.
    pub fn all_data(&self) -> AppResult<Vec<Vec<f64>>> {
        let path = self.data_path()?;
        let file = File::open(&path)?;
        if path.extension().map(|e| e == "lz4").unwrap_or(false) {
            parse_rows(FrameDecoder::new(file))
        } else {
            parse_rows(file)
        }
    }
}

fn read_metadata(dir: &Path) -> AppResult<RunMetadata> {
    let json = fs::read_to_string(dir.join(METADATA_FILE))?;
    Ok(serde_json::from_str(&json)?)
}

fn parse_rows<R: Read>(reader: R) -> AppResult<Vec<Vec<f64>>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_reader(reader);

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        let row = record
            .iter()
            .map(|field| {
                field.parse::<f64>().map_err(|e| {
                    SweepError::Storage(format!("bad value '{field}' in data file: {e}"))
                })
            })
            .collect::<AppResult<Vec<f64>>>()?;
        rows.push(row);
    }
    Ok(rows)
}

/// Fetch metadata for one run without opening its data.
pub fn run_info(basedir: &Path, id: u64) -> AppResult<RunMetadata> {
    read_metadata(&basedir.join(id.to_string()))
}

/// Enumerate all runs under `basedir` with their metadata, ordered by ID.
///
/// Directories without a readable metadata sidecar (e.g. a run that crashed
/// before its first metadata write) are skipped.
pub fn list_runs(basedir: &Path) -> AppResult<Vec<(u64, RunMetadata)>> {
    let mut runs = Vec::new();
    for entry in fs::read_dir(basedir)? {
        let entry = entry?;
        let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
        else {
            continue;
        };
        if let Ok(metadata) = read_metadata(&entry.path()) {
            runs.push((id, metadata));
        }
    }
    runs.sort_by_key(|(id, _)| *id);
    Ok(runs)
}
