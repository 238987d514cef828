//! Run allocation and the append-only data writer.

use lz4_flex::frame::FrameEncoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{DATA_FILE, DATA_FILE_COMPRESSED, METADATA_FILE};
use crate::error::{AppResult, SweepError};
use crate::metadata::RunMetadata;

/// Writes one measurement run: a tab-delimited data file plus the
/// `metadata.json` sidecar, inside an exclusively owned run directory.
///
/// Rows are durably flushed every `flush_every` appends so a concurrent
/// reader or a post-crash inspection sees everything except, at worst, the
/// row in flight. At [`finalize`](RunWriter::finalize) the data file is
/// lz4-compressed, verified against a digest of the original, and the
/// uncompressed copy removed.
#[derive(Debug)]
pub struct RunWriter {
    id: u64,
    dir: PathBuf,
    writer: csv::Writer<File>,
    /// Duplicate handle onto the data file, kept for fsync.
    sync_handle: File,
    flush_every: usize,
    rows_since_sync: usize,
    rows_written: u64,
}

impl RunWriter {
    /// Allocate the smallest unused run ID under `basedir` and open its
    /// data file.
    ///
    /// Directory creation arbitrates concurrent allocation: an
    /// `AlreadyExists` answer means another writer owns that ID and the
    /// next one is tried. IDs above `max_run_id` are a storage error.
    pub fn allocate(basedir: &Path, max_run_id: u64, flush_every: usize) -> AppResult<Self> {
        fs::create_dir_all(basedir)?;

        let mut id = 0u64;
        let dir = loop {
            if id > max_run_id {
                return Err(SweepError::Storage(format!(
                    "no free run ID under {} (max {})",
                    basedir.display(),
                    max_run_id
                )));
            }
            let candidate = basedir.join(id.to_string());
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => id += 1,
                Err(e) => return Err(e.into()),
            }
        };

        let data_path = dir.join(DATA_FILE);
        let file = File::create(&data_path)?;
        let sync_handle = file.try_clone()?;
        let writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);

        debug!(run = id, dir = %dir.display(), "allocated run directory");
        Ok(Self {
            id,
            dir,
            writer,
            sync_handle,
            flush_every: flush_every.max(1),
            rows_since_sync: 0,
            rows_written: 0,
        })
    }

    /// Run ID of this writer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run directory owned by this writer.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the data file in its current (uncompressed) form.
    pub fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    /// Rows appended so far.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Serialize the metadata sidecar, replacing any previous version.
    ///
    /// Called once right after allocation (status `Running`) and again by
    /// [`finalize`](RunWriter::finalize) with the terminal status.
    pub fn write_metadata(&self, metadata: &RunMetadata) -> AppResult<()> {
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(self.dir.join(METADATA_FILE), json)?;
        Ok(())
    }

    /// Store a named byte attachment next to the data file, e.g. a rendered
    /// plot image. The data, compressed-data, and metadata file names are
    /// reserved; blob names must be plain file names.
    pub fn add_blob(&self, name: &str, bytes: &[u8]) -> AppResult<()> {
        if name.is_empty()
            || name.contains(std::path::is_separator)
            || matches!(name, DATA_FILE | DATA_FILE_COMPRESSED | METADATA_FILE)
        {
            return Err(SweepError::Storage(format!(
                "invalid or reserved blob name '{name}'"
            )));
        }
        fs::write(self.dir.join(name), bytes)?;
        Ok(())
    }

    /// Append one row of values.
    pub fn add_row(&mut self, row: &[f64]) -> AppResult<()> {
        self.writer
            .write_record(row.iter().map(|v| v.to_string()))?;
        self.rows_written += 1;
        self.rows_since_sync += 1;
        if self.rows_since_sync >= self.flush_every {
            self.sync()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        self.sync_handle.sync_data()?;
        self.rows_since_sync = 0;
        Ok(())
    }

    /// Close the run: write the final metadata, durably flush the data
    /// file, compress it, verify the compressed copy, and remove the
    /// uncompressed original.
    ///
    /// If verification fails both files are left in place so no data is
    /// lost.
    pub fn finalize(mut self, metadata: &RunMetadata) -> AppResult<()> {
        self.write_metadata(metadata)?;
        self.sync()?;
        // Close the csv writer so the file is complete before compression.
        drop(self.writer);

        let data_path = self.dir.join(DATA_FILE);
        let compressed_path = self.dir.join(DATA_FILE_COMPRESSED);
        compress_file(&data_path, &compressed_path)?;

        if !compressed_matches(&data_path, &compressed_path)? {
            warn!(
                run = self.id,
                "compressed data does not match original, keeping both files"
            );
            return Err(SweepError::Storage(format!(
                "compressed data mismatch in {}",
                self.dir.display()
            )));
        }
        fs::remove_file(&data_path)?;

        info!(
            run = self.id,
            rows = self.rows_written,
            status = %metadata.status,
            "run finalized"
        );
        Ok(())
    }
}

fn compress_file(src: &Path, dst: &Path) -> AppResult<()> {
    let mut input = File::open(src)?;
    let out = File::create(dst)?;
    let mut encoder = FrameEncoder::new(out);
    io::copy(&mut input, &mut encoder)?;
    let mut out = encoder
        .finish()
        .map_err(|e| SweepError::Storage(format!("lz4 compression failed: {e}")))?;
    out.flush()?;
    out.sync_data()?;
    Ok(())
}

/// Compare digests of the original file and the decompressed copy.
fn compressed_matches(src: &Path, dst: &Path) -> AppResult<bool> {
    let original = digest_reader(File::open(src)?)?;
    let decoded = digest_reader(lz4_flex::frame::FrameDecoder::new(File::open(dst)?))?;
    Ok(original == decoded)
}

fn digest_reader<R: Read>(mut reader: R) -> AppResult<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{RunStatus, SweepType};

    fn metadata() -> RunMetadata {
        RunMetadata::new(SweepType::Measure, vec!["time".into()], vec![])
    }

    #[test]
    fn test_allocate_picks_smallest_unused() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("0")).unwrap();
        fs::create_dir(dir.path().join("2")).unwrap();

        let w = RunWriter::allocate(dir.path(), 1_000, 10).unwrap();
        assert_eq!(w.id(), 1);
        let w2 = RunWriter::allocate(dir.path(), 1_000, 10).unwrap();
        assert_eq!(w2.id(), 3);
    }

    #[test]
    fn test_allocate_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("0")).unwrap();
        fs::create_dir(dir.path().join("1")).unwrap();
        let err = RunWriter::allocate(dir.path(), 1, 10).unwrap_err();
        assert!(matches!(err, SweepError::Storage(_)));
    }

    #[test]
    fn test_concurrent_allocation_never_collides() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let base = base.clone();
                std::thread::spawn(move || RunWriter::allocate(&base, 1_000, 10).unwrap().id())
            })
            .collect();

        let mut ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..8).collect::<Vec<u64>>());
    }

    #[test]
    fn test_finalize_compresses_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = RunWriter::allocate(dir.path(), 1_000, 2).unwrap();
        let run_dir = w.dir().to_path_buf();
        for i in 0..5 {
            w.add_row(&[i as f64, i as f64 * 2.0]).unwrap();
        }
        let mut md = metadata();
        md.finish(RunStatus::Completed);
        w.finalize(&md).unwrap();

        assert!(!run_dir.join(DATA_FILE).exists());
        assert!(run_dir.join(DATA_FILE_COMPRESSED).exists());
        assert!(run_dir.join(METADATA_FILE).exists());
    }

    #[test]
    fn test_blob_names_validated() {
        let dir = tempfile::tempdir().unwrap();
        let w = RunWriter::allocate(dir.path(), 1_000, 10).unwrap();
        w.add_blob("plot.png", b"not really a png").unwrap();
        assert!(w.dir().join("plot.png").exists());

        assert!(w.add_blob(DATA_FILE, b"x").is_err());
        assert!(w.add_blob(METADATA_FILE, b"x").is_err());
        assert!(w.add_blob("sub/dir.bin", b"x").is_err());
        assert!(w.add_blob("", b"x").is_err());
    }

    #[test]
    fn test_rows_visible_before_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = RunWriter::allocate(dir.path(), 1_000, 1).unwrap();
        w.add_row(&[0.0, 1.0]).unwrap();
        w.add_row(&[1.0, 2.0]).unwrap();

        // flush_every = 1, so both rows are on disk while the run is open.
        let contents = fs::read_to_string(w.data_path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
