//! Fetch: reading a time window out of one archive.
//!
//! A fetch names a consolidation function, a window and a preferred
//! resolution. Among the archives using that function the engine picks one
//! (see [`select_archive`]), aligns the window to the archive's row
//! boundaries and returns a dense grid with one column per data source.
//!
//! # Row timestamps
//!
//! Row `k` of a result covers `(start + k * step, start + (k + 1) * step]`
//! and is labelled with its end time. Rows the archive no longer holds, or
//! never held, are UNKNOWN (`NaN`).
//!
//! ```rust,no_run
//! # use rrdkit::{Rrd, ConsolidationFn};
//! # let rrd = Rrd::open("traffic.rrd")?;
//! let result = rrd.fetch(ConsolidationFn::Average, 1_700_000_000, 1_700_003_600, 300)?;
//! for (timestamp, row) in result.iter() {
//!     println!("{timestamp}: {row:?}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{QueryError, Result};
use crate::file::RrdFile;
use crate::schema::{ArchiveDef, ConsolidationFn};

/// Result of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    /// Aligned window start (exclusive: the first row ends one step later).
    pub start: u64,
    /// Aligned window end; the last row ends here.
    pub end: u64,
    /// Seconds per row.
    pub step: u64,
    /// Column names, one per data source.
    pub ds_names: Vec<String>,
    /// Row-major values, `rows() * ds_names.len()` long.
    pub data: Vec<f64>,
    /// Index of the archive the rows came from.
    pub archive_used: usize,
}

impl FetchResult {
    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.data.len().checked_div(self.ds_names.len()).unwrap_or(0)
    }

    /// End timestamp of row `row`.
    pub fn timestamp(&self, row: usize) -> u64 {
        self.start + (row as u64 + 1) * self.step
    }

    /// Values of row `row`.
    pub fn row(&self, row: usize) -> &[f64] {
        let width = self.ds_names.len();
        &self.data[row * width..(row + 1) * width]
    }

    /// Value of `column` in row `row`.
    pub fn value_at(&self, row: usize, column: usize) -> f64 {
        self.data[row * self.ds_names.len() + column]
    }

    /// Copies the column named `name`, if present.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let col = self.ds_names.iter().position(|n| n == name)?;
        Some((0..self.rows()).map(|row| self.value_at(row, col)).collect())
    }

    /// Iterates `(timestamp, values)` per row.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[f64])> + '_ {
        (0..self.rows()).map(|row| (self.timestamp(row), self.row(row)))
    }
}

/// End time of the newest row an archive with `rra_step` can hold.
pub(crate) fn newest_row_time(last_update: u64, rra_step: u64) -> u64 {
    last_update - last_update % rra_step
}

/// Picks the archive a fetch reads from.
///
/// Candidates are the archives serving `cf`. If some candidate still holds
/// `start`, the one whose resolution is closest to `requested_step` wins;
/// ties prefer a resolution that evenly divides the request, then fewer rows,
/// then definition order. If none reaches back to `start`, the candidate
/// reaching furthest back wins, with the same tie-break.
///
/// # Errors
///
/// Returns [`QueryError::NoMatchingArchive`] if no archive serves `cf`.
pub(crate) fn select_archive(
    file: &RrdFile,
    cf: ConsolidationFn,
    start: u64,
    requested_step: u64,
) -> Result<usize> {
    let step = file.step();
    let requested = if requested_step == 0 { step } else { requested_step };
    let last_update = file.last_update();

    let candidates: Vec<(usize, u64, u64, u64)> = file
        .spec()
        .archives
        .iter()
        .enumerate()
        .filter(|(_, archive)| archive.serves(cf))
        .map(|(index, archive)| {
            let rra_step = step * archive.steps();
            let first = newest_row_time(last_update, rra_step)
                .saturating_sub(archive.rows() * rra_step);
            (index, rra_step, archive.rows(), first)
        })
        .collect();

    let tie_break = |rra_step: u64, rows: u64, index: usize| {
        (requested % rra_step != 0, rows, index)
    };

    let covering = candidates.iter().filter(|(_, _, _, first)| *first <= start);
    let chosen = match covering
        .min_by_key(|(index, rra_step, rows, _)| {
            (rra_step.abs_diff(requested), tie_break(*rra_step, *rows, *index))
        })
        .or_else(|| {
            candidates.iter().min_by_key(|(index, rra_step, rows, first)| {
                (*first, tie_break(*rra_step, *rows, *index))
            })
        }) {
        Some((index, ..)) => *index,
        None => {
            return Err(QueryError::NoMatchingArchive { cf: cf.to_string() }.into());
        }
    };

    tracing::debug!(path = file.path(), %cf, start, requested, archive = chosen, "selected archive");
    Ok(chosen)
}

/// Reads `(start, end]` from the archive best matching `cf` and `step`.
///
/// # Errors
///
/// Returns [`QueryError::InvalidTimeRange`] if `start >= end`, or
/// [`QueryError::NoMatchingArchive`] if no archive serves `cf`.
pub(crate) fn fetch(
    file: &RrdFile,
    cf: ConsolidationFn,
    start: u64,
    end: u64,
    step: u64,
) -> Result<FetchResult> {
    if start >= end {
        return Err(QueryError::InvalidTimeRange { start, end }.into());
    }
    let rra = select_archive(file, cf, start, step)?;
    Ok(read_archive(file, rra, cf, start, end))
}

/// Reads `(start, end]` from archive `rra`, widening the window to its row
/// boundaries.
///
/// For a HWPREDICT archive, `cf` picks the forecast (`HWPREDICT`) or the
/// deviation (`DEVPREDICT`) column of each data source.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn read_archive(
    file: &RrdFile,
    rra: usize,
    cf: ConsolidationFn,
    start: u64,
    end: u64,
) -> FetchResult {
    let archive = &file.spec().archives[rra];
    let rra_step = file.step() * archive.steps();

    let start = start - start % rra_step;
    let end = end.div_ceil(rra_step) * rra_step;
    let rows = ((end - start) / rra_step) as usize;

    let ds_names: Vec<String> = file
        .spec()
        .data_sources
        .iter()
        .map(|ds| ds.name.clone())
        .collect();
    let columns_per_ds = archive.columns_per_ds();
    // HWPREDICT rows hold [forecast, deviation] per data source.
    let column_offset = usize::from(matches!(
        (archive, cf),
        (ArchiveDef::HwPredict { .. }, ConsolidationFn::DevPredict)
    ));

    let ring = file.ring(rra);
    let newest = newest_row_time(file.last_update(), rra_step);
    let mut data = Vec::with_capacity(rows * ds_names.len());
    for k in 0..rows as u64 {
        let t = start + (k + 1) * rra_step;
        let age = if t <= newest {
            Some(((newest - t) / rra_step) as usize).filter(|age| *age < ring.rows())
        } else {
            None
        };
        for ds in 0..ds_names.len() {
            let value = age.map_or(f64::NAN, |age| {
                ring.value_at_age(age, ds * columns_per_ds + column_offset)
            });
            data.push(value);
        }
    }

    FetchResult {
        start,
        end,
        step: rra_step,
        ds_names,
        data,
        archive_used: rra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::create_file;
    use crate::schema::{ArchiveSpec, DataSourceDef};
    use tempfile::TempDir;

    fn archive(dir: &TempDir, archives: Vec<ArchiveDef>) -> RrdFile {
        let spec = ArchiveSpec {
            start: 10_000,
            step: 10,
            data_sources: vec![DataSourceDef::gauge("g", 20, None, None)],
            archives,
        };
        create_file(&dir.path().join("q.rrd"), &spec, false).unwrap()
    }

    #[test]
    fn test_selection_prefers_covering_closest_step() {
        let dir = TempDir::new().unwrap();
        let mut file = archive(
            &dir,
            vec![
                ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 1, 10),
                ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 6, 100),
                ArchiveDef::consolidated(ConsolidationFn::Max, 0.5, 1, 1000),
            ],
        );
        file.set_last_update(20_000);

        // Only the 60s archive covers 15_000.
        assert_eq!(select_archive(&file, ConsolidationFn::Average, 15_000, 10).unwrap(), 1);
        // Both cover 19_950; the 10s archive matches the request exactly.
        assert_eq!(select_archive(&file, ConsolidationFn::Average, 19_950, 10).unwrap(), 0);
        assert_eq!(select_archive(&file, ConsolidationFn::Average, 19_950, 60).unwrap(), 1);
        // Nothing covers 0: the one reaching furthest back wins.
        assert_eq!(select_archive(&file, ConsolidationFn::Average, 0, 10).unwrap(), 1);
        assert_eq!(select_archive(&file, ConsolidationFn::Max, 0, 60).unwrap(), 2);
    }

    #[test]
    fn test_selection_tie_break() {
        let dir = TempDir::new().unwrap();
        let mut file = archive(
            &dir,
            vec![
                ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 9, 10),
                ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 3, 100),
                ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 3, 50),
                ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 3, 50),
            ],
        );
        file.set_last_update(20_000);

        // 30s and 90s are both 30s away from 60s; 30s divides it, then the
        // smaller ring, then the earlier definition.
        assert_eq!(select_archive(&file, ConsolidationFn::Average, 19_500, 60).unwrap(), 2);
        assert_eq!(select_archive(&file, ConsolidationFn::Average, 19_500, 90).unwrap(), 0);
    }

    #[test]
    fn test_no_matching_archive() {
        let dir = TempDir::new().unwrap();
        let file = archive(
            &dir,
            vec![ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 1, 10)],
        );
        let err = fetch(&file, ConsolidationFn::Min, 0, 100, 10).unwrap_err();
        assert!(err.to_string().contains("MIN"));
        assert!(fetch(&file, ConsolidationFn::Average, 100, 100, 10).is_err());
    }

    #[test]
    fn test_fetch_alignment() {
        let dir = TempDir::new().unwrap();
        let file = archive(
            &dir,
            vec![ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 6, 10)],
        );

        let result = fetch(&file, ConsolidationFn::Average, 10_005, 10_130, 60).unwrap();
        assert_eq!(result.step, 60);
        assert_eq!(result.start, 9_960);
        assert_eq!(result.end, 10_140);
        assert_eq!(result.rows(), 3);
        assert_eq!(result.timestamp(0), 10_020);
        assert!(result.data.iter().all(|v| v.is_nan()));
    }
}
