//! Streaming dump of every row of one archive.

use crate::error::{QueryError, Result};
use crate::file::RrdFile;
use crate::query::newest_row_time;
use crate::ring::Ring;
use crate::schema::ConsolidationFn;

/// One archive row with its end timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpRow {
    /// End time of the row.
    pub timestamp: u64,
    /// One value per ring column.
    pub values: Vec<f64>,
}

/// Iterator over the rows of an archive, oldest first.
///
/// Created by [`Rrd::dump`](crate::Rrd::dump).
#[derive(Debug)]
pub struct Dump<'a> {
    ring: Ring<'a>,
    newest: u64,
    rra_step: u64,
    /// Age of the next row to yield; counts down to zero.
    next_age: Option<usize>,
}

impl Dump<'_> {
    /// Time span of one row.
    pub fn step(&self) -> u64 {
        self.rra_step
    }
}

impl Iterator for Dump<'_> {
    type Item = DumpRow;

    fn next(&mut self) -> Option<Self::Item> {
        let age = self.next_age?;
        self.next_age = age.checked_sub(1);
        Some(DumpRow {
            timestamp: self.newest.saturating_sub(age as u64 * self.rra_step),
            values: self.ring.row_at_age(age),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.next_age.map_or(0, |age| age + 1);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Dump<'_> {}

/// Opens a dump of the first archive serving `cf`.
///
/// # Errors
///
/// Returns [`QueryError::NoMatchingArchive`] if no archive serves `cf`.
pub(crate) fn dump(file: &RrdFile, cf: ConsolidationFn) -> Result<Dump<'_>> {
    let rra = file
        .spec()
        .archives
        .iter()
        .position(|archive| archive.serves(cf))
        .ok_or_else(|| QueryError::NoMatchingArchive { cf: cf.to_string() })?;

    let rra_step = file.step() * file.spec().archives[rra].steps();
    let ring = file.ring(rra);
    Ok(Dump {
        newest: newest_row_time(file.last_update(), rra_step),
        rra_step,
        next_age: ring.rows().checked_sub(1),
        ring,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidate::absorb_run;
    use crate::create::create_file;
    use crate::schema::{ArchiveDef, ArchiveSpec, DataSourceDef};
    use tempfile::TempDir;

    #[test]
    fn test_dump_oldest_first() {
        let dir = TempDir::new().unwrap();
        let spec = ArchiveSpec {
            start: 1000,
            step: 10,
            data_sources: vec![DataSourceDef::gauge("g", 20, None, None)],
            archives: vec![ArchiveDef::consolidated(ConsolidationFn::Last, 0.5, 1, 3)],
        };
        let mut file = create_file(&dir.path().join("d.rrd"), &spec, false).unwrap();
        for (i, v) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            absorb_run(&mut file, &[v], 1, 1010 + i as u64 * 10);
        }
        file.set_last_update(1040);

        let rows: Vec<DumpRow> = dump(&file, ConsolidationFn::Last).unwrap().collect();
        assert_eq!(
            rows,
            vec![
                DumpRow { timestamp: 1020, values: vec![2.0] },
                DumpRow { timestamp: 1030, values: vec![3.0] },
                DumpRow { timestamp: 1040, values: vec![4.0] },
            ]
        );

        assert!(dump(&file, ConsolidationFn::Max).is_err());
    }
}
