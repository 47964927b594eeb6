//! The archive handle.
//!
//! An [`Rrd`] owns one memory-mapped archive file. Mutating operations take
//! `&mut self`, so a handle has a single writer; reads take `&self`.
//! Exclusion between processes is left to the caller.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use rrdkit::{ArchiveDef, ArchiveSpec, ConsolidationFn, DataSourceDef, Rrd};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let spec = ArchiveSpec {
//!     start: 1_700_000_000,
//!     step: 300,
//!     data_sources: vec![DataSourceDef::counter("in", 600, Some(0.0), None)],
//!     archives: vec![ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 1, 288)],
//! };
//! let mut rrd = Rrd::create("traffic.rrd", &spec, false)?;
//!
//! rrd.update(1_700_000_300, &[1_000.0])?;
//!
//! // Cached updates are applied in one go.
//! rrd.cache_update(1_700_000_600, vec![4_000.0])?;
//! rrd.cache_update(1_700_000_900, vec![7_000.0])?;
//! rrd.flush_cache()?;
//!
//! let result = rrd.fetch(ConsolidationFn::Average, 1_700_000_000, 1_700_000_900, 300)?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use crate::create::create_file;
use crate::dump::{self, Dump};
use crate::error::Result;
use crate::file::RrdFile;
use crate::info::{self, InfoValue};
use crate::query::{self, FetchResult};
use crate::schema::{ArchiveSpec, ConsolidationFn};
use crate::update::Ingestor;

/// Handle to an open round-robin archive.
#[derive(Debug)]
pub struct Rrd {
    /// The mapped file.
    file: RrdFile,
    /// Compiled ingestion rules.
    ingestor: Ingestor,
    /// Cached updates not yet applied, in arrival order.
    pending: Vec<(u64, Vec<f64>)>,
}

impl Rrd {
    /// Creates a new archive file at `path` and opens it.
    ///
    /// # Arguments
    ///
    /// * `path` - Where to write the archive
    /// * `spec` - Data sources, archives, base step and start time
    /// * `overwrite` - Replace an existing file instead of failing
    ///
    /// # Errors
    ///
    /// Returns [`CreateError::InvalidSpec`](crate::error::CreateError::InvalidSpec)
    /// if `spec` is invalid (nothing is written),
    /// [`CreateError::AlreadyExists`](crate::error::CreateError::AlreadyExists)
    /// if the file exists and `overwrite` is false, or a
    /// [`FileIoError`](crate::error::FileIoError) if the file cannot be written.
    pub fn create<P: AsRef<Path>>(path: P, spec: &ArchiveSpec, overwrite: bool) -> Result<Self> {
        let file = create_file(path.as_ref(), spec, overwrite)?;
        Self::from_file(file)
    }

    /// Opens an existing archive.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::ReadFailed`](crate::error::FileIoError::ReadFailed)
    /// if the file cannot be mapped, or
    /// [`FileIoError::CorruptedArchive`](crate::error::FileIoError::CorruptedArchive)
    /// if its header or definitions are inconsistent.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use rrdkit::Rrd;
    /// let rrd = Rrd::open("traffic.rrd")?;
    /// println!("last update at {}", rrd.last_update());
    /// # Ok::<(), rrdkit::RrdError>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = RrdFile::open(path.as_ref())?;
        tracing::debug!(
            path = file.path(),
            data_sources = file.spec().data_sources.len(),
            archives = file.spec().archives.len(),
            last_update = file.last_update(),
            "opened archive"
        );
        Self::from_file(file)
    }

    /// Wraps an already mapped file.
    pub(crate) fn from_file(file: RrdFile) -> Result<Self> {
        let ingestor = Ingestor::new(file.spec())?;
        Ok(Self {
            file,
            ingestor,
            pending: Vec::new(),
        })
    }

    pub(crate) fn file(&self) -> &RrdFile {
        &self.file
    }

    /// Path the archive was opened from.
    pub fn path(&self) -> &str {
        self.file.path()
    }

    /// Base step in seconds.
    pub fn step(&self) -> u64 {
        self.file.step()
    }

    /// Timestamp of the last applied update.
    pub fn last_update(&self) -> u64 {
        self.file.last_update()
    }

    /// Definitions the archive was created with.
    pub fn spec(&self) -> &ArchiveSpec {
        self.file.spec()
    }

    /// Names of all data sources, in definition order.
    pub fn data_source_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.file.spec().data_sources.iter().map(|ds| ds.name.as_str())
    }

    /// Applies one reading per input data source at `timestamp`.
    ///
    /// Values are given in definition order, skipping COMPUTE data sources.
    /// `NaN` marks a reading as UNKNOWN.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::NonMonotonicUpdate`](crate::error::UpdateError::NonMonotonicUpdate)
    /// if `timestamp` is not after [`Rrd::last_update`],
    /// [`UpdateError::ValueCount`](crate::error::UpdateError::ValueCount) on
    /// an arity mismatch, or
    /// [`UpdateError::InvalidValue`](crate::error::UpdateError::InvalidValue)
    /// for an infinite reading. The archive is unchanged on error.
    pub fn update(&mut self, timestamp: u64, values: &[f64]) -> Result<()> {
        self.ingestor.apply(&mut self.file, timestamp, values)
    }

    /// Applies readings for the named data sources; the others get UNKNOWN.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::UnknownDataSource`](crate::error::UpdateError::UnknownDataSource)
    /// if a name is not an input data source, plus the errors of
    /// [`Rrd::update`].
    pub fn update_with_template(&mut self, timestamp: u64, names: &[&str], values: &[f64]) -> Result<()> {
        let full = self.ingestor.expand_template(self.file.spec(), names, values)?;
        self.update(timestamp, &full)
    }

    /// Queues an update for [`Rrd::flush_cache`].
    ///
    /// Arity and finiteness are checked now; ordering is checked at flush.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ValueCount`](crate::error::UpdateError::ValueCount)
    /// or [`UpdateError::InvalidValue`](crate::error::UpdateError::InvalidValue).
    pub fn cache_update(&mut self, timestamp: u64, values: Vec<f64>) -> Result<()> {
        self.ingestor.check_values(self.file.spec(), &values)?;
        self.pending.push((timestamp, values));
        Ok(())
    }

    /// Number of queued updates.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Applies every queued update in order and empties the queue.
    ///
    /// Returns the number of updates applied.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::StaleUpdate`](crate::error::UpdateError::StaleUpdate)
    /// for an entry not newer than the last update as it stood when the
    /// flush began, or [`UpdateError::NonMonotonicUpdate`](crate::error::UpdateError::NonMonotonicUpdate)
    /// for entries out of order among themselves. Entries applied before
    /// the failure stay applied; the rest are discarded.
    pub fn flush_cache(&mut self) -> Result<usize> {
        let batch = std::mem::take(&mut self.pending);
        self.ingestor.flush(&mut self.file, batch)
    }

    /// Returns the archive metadata keyed by rrdtool `info` names.
    pub fn info(&self) -> BTreeMap<String, InfoValue> {
        info::collect(&self.file)
    }

    /// Reads `(start, end]` consolidated with `cf` at roughly `step` seconds
    /// per row. A `step` of zero asks for the base step.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidTimeRange`](crate::error::QueryError::InvalidTimeRange)
    /// if `start >= end`, or
    /// [`QueryError::NoMatchingArchive`](crate::error::QueryError::NoMatchingArchive)
    /// if no archive serves `cf`.
    pub fn fetch(&self, cf: ConsolidationFn, start: u64, end: u64, step: u64) -> Result<FetchResult> {
        query::fetch(&self.file, cf, start, end, step)
    }

    /// Iterates every row of the first archive serving `cf`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::NoMatchingArchive`](crate::error::QueryError::NoMatchingArchive)
    /// if no archive serves `cf`.
    pub fn dump(&self, cf: ConsolidationFn) -> Result<Dump<'_>> {
        dump::dump(&self.file, cf)
    }

    /// Flushes the mapping to disk.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::SyncFailed`](crate::error::FileIoError::SyncFailed).
    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RrdError, UpdateError};
    use crate::schema::{ArchiveDef, DataSourceDef};
    use tempfile::TempDir;

    fn spec() -> ArchiveSpec {
        ArchiveSpec {
            start: 1000,
            step: 10,
            data_sources: vec![
                DataSourceDef::gauge("a", 20, None, None),
                DataSourceDef::gauge("b", 20, None, None),
                DataSourceDef::compute("sum", "a,b,+"),
            ],
            archives: vec![ArchiveDef::consolidated(ConsolidationFn::Last, 0.5, 1, 5)],
        }
    }

    #[test]
    fn test_handle_accessors() {
        let dir = TempDir::new().unwrap();
        let rrd = Rrd::create(dir.path().join("h.rrd"), &spec(), false).unwrap();
        assert_eq!(rrd.step(), 10);
        assert_eq!(rrd.last_update(), 1000);
        assert_eq!(rrd.data_source_names().collect::<Vec<_>>(), vec!["a", "b", "sum"]);
        assert!(rrd.path().ends_with("h.rrd"));
    }

    #[test]
    fn test_cache_checks_arity_immediately() {
        let dir = TempDir::new().unwrap();
        let mut rrd = Rrd::create(dir.path().join("c.rrd"), &spec(), false).unwrap();

        let err = rrd.cache_update(1010, vec![1.0]).unwrap_err();
        assert!(matches!(err, RrdError::Update(UpdateError::ValueCount { expected: 2, actual: 1 })));
        assert_eq!(rrd.pending(), 0);

        rrd.cache_update(1010, vec![1.0, 2.0]).unwrap();
        rrd.cache_update(1020, vec![3.0, 4.0]).unwrap();
        assert_eq!(rrd.pending(), 2);
        assert_eq!(rrd.flush_cache().unwrap(), 2);
        assert_eq!(rrd.pending(), 0);
        assert_eq!(rrd.last_update(), 1020);
    }

    #[test]
    fn test_template_update() {
        let dir = TempDir::new().unwrap();
        let mut rrd = Rrd::create(dir.path().join("t.rrd"), &spec(), false).unwrap();
        rrd.update_with_template(1010, &["b"], &[5.0]).unwrap();

        let result = rrd.fetch(ConsolidationFn::Last, 1000, 1010, 10).unwrap();
        let row = result.row(result.rows() - 1);
        assert!(row[0].is_nan());
        assert_eq!(row[1], 5.0);
        assert!(row[2].is_nan());

        assert!(rrd.update_with_template(1020, &["sum"], &[1.0]).is_err());
    }
}
