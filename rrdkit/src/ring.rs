//! Ring buffer addressing over an archive's row storage.
//!
//! Each archive owns one fixed-capacity ring of rows. A row holds one cell per
//! column (one column per data source, two for HWPREDICT archives). The ring
//! remembers only the index of the newest row, `cur_row`; writes go to
//! `(cur_row + 1) % rows`, overwriting the oldest row.
//!
//! Rows are addressed by *age*: age 0 is the newest row, age `rows - 1` the
//! oldest. Callers translate ages to timestamps from the archive's last update,
//! so the ring itself never stores time.

use crate::file::{read_f64, write_f64};

/// Read-only view of one archive's ring.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ring<'a> {
    cells: &'a [u8],
    rows: usize,
    width: usize,
    cur_row: usize,
}

impl<'a> Ring<'a> {
    /// Wraps `cells`, which must hold exactly `rows * width` encoded values.
    pub(crate) fn new(cells: &'a [u8], rows: usize, width: usize, cur_row: usize) -> Self {
        debug_assert_eq!(cells.len(), rows * width * 8);
        debug_assert!(cur_row < rows);
        Self {
            cells,
            rows,
            width,
            cur_row,
        }
    }

    /// Ring capacity.
    pub(crate) fn rows(&self) -> usize {
        self.rows
    }

    /// Physical index of the row at `age`.
    #[inline]
    pub(crate) fn index_at_age(&self, age: usize) -> usize {
        (self.cur_row + self.rows - age % self.rows) % self.rows
    }

    /// Value of `column` in the row at `age`.
    #[inline]
    pub(crate) fn value_at_age(&self, age: usize, column: usize) -> f64 {
        self.value(self.index_at_age(age), column)
    }

    /// Value of `column` in the row stored at physical `index`.
    #[inline]
    pub(crate) fn value(&self, index: usize, column: usize) -> f64 {
        read_f64(self.cells, (index * self.width + column) * 8)
    }

    /// Copies the row at `age`.
    pub(crate) fn row_at_age(&self, age: usize) -> Vec<f64> {
        let index = self.index_at_age(age);
        (0..self.width).map(|col| self.value(index, col)).collect()
    }
}

/// Mutable view used by the consolidation path to append rows.
#[derive(Debug)]
pub(crate) struct RingMut<'a> {
    cells: &'a mut [u8],
    rows: usize,
    width: usize,
}

impl<'a> RingMut<'a> {
    pub(crate) fn new(cells: &'a mut [u8], rows: usize, width: usize) -> Self {
        debug_assert_eq!(cells.len(), rows * width * 8);
        Self { cells, rows, width }
    }

    /// Sets every cell to `value`.
    pub(crate) fn fill(&mut self, value: f64) {
        for cell in 0..self.rows * self.width {
            write_f64(self.cells, cell * 8, value);
        }
    }

    /// Writes `values` into the slot after `cur_row` and returns that slot's
    /// index, which becomes the new `cur_row`.
    ///
    /// The row is written in full before the caller publishes the new index.
    pub(crate) fn push(&mut self, cur_row: usize, values: &[f64]) -> usize {
        debug_assert_eq!(values.len(), self.width);
        let next = (cur_row + 1) % self.rows;
        let base = next * self.width;
        for (col, value) in values.iter().enumerate() {
            write_f64(self.cells, (base + col) * 8, *value);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(rows: usize, width: usize) -> Vec<u8> {
        let mut cells = vec![0u8; rows * width * 8];
        RingMut::new(&mut cells, rows, width).fill(f64::NAN);
        cells
    }

    #[test]
    fn test_empty_ring_is_unknown() {
        let cells = buffer(4, 2);
        let ring = Ring::new(&cells, 4, 2, 3);
        assert_eq!(ring.rows(), 4);
        assert_eq!(ring.row_at_age(0).len(), 2);
        for age in 0..4 {
            assert!(ring.row_at_age(age).iter().all(|v| v.is_nan()));
        }
    }

    #[test]
    fn test_push_advances_index() {
        let mut cells = buffer(3, 1);
        let mut ring = RingMut::new(&mut cells, 3, 1);

        let mut cur = 2;
        cur = ring.push(cur, &[1.0]);
        assert_eq!(cur, 0);
        cur = ring.push(cur, &[2.0]);
        assert_eq!(cur, 1);

        let view = Ring::new(&cells, 3, 1, cur);
        assert_eq!(view.value_at_age(0, 0), 2.0);
        assert_eq!(view.value_at_age(1, 0), 1.0);
        assert!(view.value_at_age(2, 0).is_nan());
    }

    #[test]
    fn test_wraparound_overwrites_oldest() {
        let mut cells = buffer(3, 2);
        let mut ring = RingMut::new(&mut cells, 3, 2);

        let mut cur = 2;
        for i in 0..5 {
            let v = f64::from(i);
            cur = ring.push(cur, &[v, v * 10.0]);
        }

        let view = Ring::new(&cells, 3, 2, cur);
        let rows: Vec<Vec<f64>> = (0..3).rev().map(|age| view.row_at_age(age)).collect();
        assert_eq!(rows, vec![vec![2.0, 20.0], vec![3.0, 30.0], vec![4.0, 40.0]]);
    }
}
