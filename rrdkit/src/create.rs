//! Archive creation.
//!
//! [`Creator`] collects a start time, a base step and the data source and
//! archive definitions, validates them as a whole and only then writes the
//! file. A failed validation never leaves a partial archive behind.

use std::path::{Path, PathBuf};

use crate::archive::Rrd;
use crate::consolidate;
use crate::error::Result;
use crate::file::{DsState, RrdFile};
use crate::schema::{ArchiveDef, ArchiveSpec, DataSourceDef};

/// Builder for a new archive file.
///
/// # Examples
///
/// ```rust,no_run
/// use rrdkit::Creator;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let rrd = Creator::new("traffic.rrd", 1_700_000_000, 300)
///     .parse_data_source("DS:in:COUNTER:600:0:U")?
///     .parse_data_source("DS:out:COUNTER:600:0:U")?
///     .parse_archive("RRA:AVERAGE:0.5:1:288")?
///     .parse_archive("RRA:MAX:0.5:12:168")?
///     .create(false)?;
/// assert_eq!(rrd.step(), 300);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Creator {
    path: PathBuf,
    spec: ArchiveSpec,
}

impl Creator {
    /// Starts a definition for an archive at `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Where the archive file will be written
    /// * `start` - Creation time in seconds; the first update must be later
    /// * `step` - Base step in seconds
    pub fn new<P: AsRef<Path>>(path: P, start: u64, step: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            spec: ArchiveSpec {
                start,
                step,
                data_sources: Vec::new(),
                archives: Vec::new(),
            },
        }
    }

    /// Starts from a complete spec, e.g. one loaded from JSON.
    pub fn from_spec<P: AsRef<Path>>(path: P, spec: ArchiveSpec) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            spec,
        }
    }

    /// Adds a data source.
    #[must_use]
    pub fn data_source(mut self, def: DataSourceDef) -> Self {
        self.spec.data_sources.push(def);
        self
    }

    /// Adds an archive.
    #[must_use]
    pub fn archive(mut self, def: ArchiveDef) -> Self {
        self.spec.archives.push(def);
        self
    }

    /// Adds a data source given as `DS:name:TYPE:...`.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError::InvalidSpec`](crate::error::CreateError::InvalidSpec)
    /// if the text does not parse.
    pub fn parse_data_source(self, text: &str) -> Result<Self> {
        Ok(self.data_source(text.parse()?))
    }

    /// Adds an archive given as `RRA:CF:xff:steps:rows` or
    /// `RRA:HWPREDICT:rows:alpha:beta:period`.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError::InvalidSpec`](crate::error::CreateError::InvalidSpec)
    /// if the text does not parse.
    pub fn parse_archive(self, text: &str) -> Result<Self> {
        Ok(self.archive(text.parse()?))
    }

    /// Returns the definitions collected so far.
    pub fn spec(&self) -> &ArchiveSpec {
        &self.spec
    }

    /// Validates the definitions and writes the archive.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError::InvalidSpec`](crate::error::CreateError::InvalidSpec)
    /// if the definitions are invalid,
    /// [`CreateError::AlreadyExists`](crate::error::CreateError::AlreadyExists)
    /// if the file exists and `overwrite` is false, or a
    /// [`FileIoError`](crate::error::FileIoError) if writing fails.
    pub fn create(self, overwrite: bool) -> Result<Rrd> {
        let file = create_file(&self.path, &self.spec, overwrite)?;
        Rrd::from_file(file)
    }
}

/// Validates `spec`, allocates the file and writes the initial state.
pub(crate) fn create_file(path: &Path, spec: &ArchiveSpec, overwrite: bool) -> Result<RrdFile> {
    spec.validate()?;

    let mut file = RrdFile::allocate(path, spec, overwrite)?;
    for ds in 0..spec.data_sources.len() {
        file.set_ds_state(
            ds,
            DsState {
                last_ds: f64::NAN,
                scratch: 0.0,
                unknown_sec: spec.start % spec.step,
            },
        );
    }
    consolidate::initialize(&mut file);
    file.sync()?;

    tracing::debug!(
        path = %path.display(),
        data_sources = spec.data_sources.len(),
        archives = spec.archives.len(),
        "created archive"
    );
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CreateError, RrdError};
    use crate::schema::ConsolidationFn;
    use tempfile::TempDir;

    #[test]
    fn test_initial_state() {
        let dir = TempDir::new().unwrap();
        let spec = ArchiveSpec {
            start: 1005,
            step: 10,
            data_sources: vec![DataSourceDef::gauge("g", 20, None, None)],
            archives: vec![ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 3, 4)],
        };
        let file = create_file(&dir.path().join("c.rrd"), &spec, false).unwrap();

        assert_eq!(file.last_update(), 1005);
        let state = file.ds_state(0);
        assert!(state.last_ds.is_nan());
        assert_eq!(state.unknown_sec, 5);
        assert_eq!(file.cur_row(0), 3);
        // 100 PDPs before start, 100 % 3 of them in the open row.
        assert_eq!(file.cdp(0, 0, consolidate::CDP_UNKNOWN), 1.0);
    }

    #[test]
    fn test_invalid_spec_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.rrd");

        let err = Creator::new(&path, 0, 0)
            .data_source(DataSourceDef::gauge("g", 20, None, None))
            .archive(ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 1, 10))
            .create(false)
            .unwrap_err();
        assert!(matches!(err, RrdError::Create(CreateError::InvalidSpec { .. })));
        assert!(!path.exists());
    }

    #[test]
    fn test_textual_definitions() {
        let dir = TempDir::new().unwrap();
        let creator = Creator::new(dir.path().join("t.rrd"), 0, 60)
            .parse_data_source("DS:temp:GAUGE:120:U:U")
            .unwrap()
            .parse_archive("RRA:LAST:0:1:10")
            .unwrap();
        assert_eq!(creator.spec().data_sources[0].name, "temp");

        assert!(creator.clone().parse_data_source("DS:temp").is_err());
        assert!(creator.parse_archive("RRA:LAST:0:1").is_err());
    }
}
