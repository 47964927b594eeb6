//! Consolidation engine: folds primary data points into archive rows.
//!
//! Every completed PDP vector (one value per data source) is offered to every
//! archive. Consolidated archives accumulate `steps` PDPs in their CDP prep
//! area and then write one row; HWPREDICT archives write one forecast row per
//! PDP and update their Holt-Winters state.
//!
//! # Runs
//!
//! Ingestion hands PDPs over as *runs*: `count` consecutive PDPs with the same
//! values. A long gap between updates therefore costs work proportional to the
//! archive capacity, not to the length of the gap:
//!
//! ```text
//! [partial row] [full rows ... capped at capacity] [partial row]
//! ```
//!
//! # Row alignment
//!
//! Rows of a consolidated archive end on multiples of `step * steps`. Creation
//! seeds each CDP with the PDPs of the first row that precede the archive's
//! start, counted as UNKNOWN (see [`initialize`]).

use crate::file::RrdFile;
use crate::schema::{ArchiveDef, ConsolidationFn};

/// CDP slot: accumulated value (`NaN` while no known PDP was absorbed).
pub(crate) const CDP_VALUE: usize = 0;
/// CDP slot: UNKNOWN PDPs absorbed into the current row.
pub(crate) const CDP_UNKNOWN: usize = 1;
/// CDP slot: PDPs absorbed into the current row.
pub(crate) const CDP_ABSORBED: usize = 2;

/// HWPREDICT slot: smoothed baseline.
pub(crate) const HW_INTERCEPT: usize = 0;
/// HWPREDICT slot: smoothed slope.
pub(crate) const HW_SLOPE: usize = 1;
/// HWPREDICT slot: 1.0 once the first known observation was absorbed.
pub(crate) const HW_INITIALIZED: usize = 2;
/// HWPREDICT slot: first seasonal coefficient. Deviations follow the
/// coefficients.
pub(crate) const HW_SEASONAL: usize = 3;

/// Seeds the CDP prep area and row pointers of a freshly allocated file.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub(crate) fn initialize(file: &mut RrdFile) {
    let spec = file.spec().clone();
    let ds_count = spec.data_sources.len();

    for (rra, archive) in spec.archives.iter().enumerate() {
        file.set_cur_row(rra, archive.rows() as usize - 1);

        match archive {
            ArchiveDef::Consolidated { steps, .. } => {
                let leading = (spec.start / spec.step) % steps;
                for ds in 0..ds_count {
                    file.set_cdp(rra, ds, CDP_VALUE, f64::NAN);
                    file.set_cdp(rra, ds, CDP_UNKNOWN, leading as f64);
                    file.set_cdp(rra, ds, CDP_ABSORBED, leading as f64);
                }
            }
            ArchiveDef::HwPredict {
                seasonal_period, ..
            } => {
                for ds in 0..ds_count {
                    file.set_cdp(rra, ds, HW_INTERCEPT, 0.0);
                    file.set_cdp(rra, ds, HW_SLOPE, 0.0);
                    file.set_cdp(rra, ds, HW_INITIALIZED, 0.0);
                    for slot in 0..2 * (*seasonal_period as usize) {
                        file.set_cdp(rra, ds, HW_SEASONAL + slot, 0.0);
                    }
                }
            }
        }
    }
}

/// Folds `count` consecutive PDP vectors equal to `pdps` into every archive.
///
/// `first_end` is the end time of the first PDP of the run; each following
/// PDP ends one base step later.
pub(crate) fn absorb_run(file: &mut RrdFile, pdps: &[f64], count: u64, first_end: u64) {
    if count == 0 {
        return;
    }
    tracing::trace!(count, first_end, "absorbing PDP run");

    let archives = file.spec().archives.clone();
    for (rra, archive) in archives.iter().enumerate() {
        match *archive {
            ArchiveDef::Consolidated {
                cf,
                xff,
                steps,
                rows,
            } => consolidated_run(file, rra, cf, xff, steps, rows, pdps, count),
            ArchiveDef::HwPredict {
                rows,
                alpha,
                beta,
                seasonal_period,
            } => {
                let params = HoltWinters {
                    alpha,
                    beta,
                    period: seasonal_period,
                };
                hw_run(file, rra, &params, rows, pdps, count, first_end);
            }
        }
    }
}

#[allow(
    clippy::too_many_arguments,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn consolidated_run(
    file: &mut RrdFile,
    rra: usize,
    cf: ConsolidationFn,
    xff: f64,
    steps: u64,
    rows: u64,
    pdps: &[f64],
    count: u64,
) {
    let absorbed = file.cdp(rra, 0, CDP_ABSORBED) as u64;
    let to_boundary = steps - absorbed.min(steps - 1);
    if count < to_boundary {
        fold(file, rra, cf, pdps, count);
        return;
    }

    fold(file, rra, cf, pdps, to_boundary);
    let row: Vec<f64> = (0..pdps.len())
        .map(|ds| finalize(file, rra, ds, cf, xff, steps))
        .collect();
    file.push_row(rra, &row);

    let remaining = count - to_boundary;
    let full_rows = remaining / steps;
    if full_rows > 0 {
        // Every PDP of these rows is the same, so each row consolidates to
        // the PDP itself (or UNKNOWN, since xff < 1).
        for _ in 0..full_rows.min(rows) {
            file.push_row(rra, pdps);
        }
    }
    fold(file, rra, cf, pdps, remaining % steps);
}

/// Absorbs `n` copies of `pdps` into the open row without finalizing it.
#[allow(clippy::cast_precision_loss)]
fn fold(file: &mut RrdFile, rra: usize, cf: ConsolidationFn, pdps: &[f64], n: u64) {
    if n == 0 {
        return;
    }
    let n_f = n as f64;
    for (ds, &pdp) in pdps.iter().enumerate() {
        let absorbed = file.cdp(rra, ds, CDP_ABSORBED);
        file.set_cdp(rra, ds, CDP_ABSORBED, absorbed + n_f);

        if pdp.is_nan() {
            let unknown = file.cdp(rra, ds, CDP_UNKNOWN);
            file.set_cdp(rra, ds, CDP_UNKNOWN, unknown + n_f);
            continue;
        }

        let current = file.cdp(rra, ds, CDP_VALUE);
        let next = match cf {
            ConsolidationFn::Average if current.is_nan() => pdp * n_f,
            ConsolidationFn::Average => current + pdp * n_f,
            ConsolidationFn::Min if current.is_nan() => pdp,
            ConsolidationFn::Min => current.min(pdp),
            ConsolidationFn::Max if current.is_nan() => pdp,
            ConsolidationFn::Max => current.max(pdp),
            _ => pdp,
        };
        file.set_cdp(rra, ds, CDP_VALUE, next);
    }
}

/// Produces the row value for one data source and resets its CDP.
#[allow(clippy::cast_precision_loss)]
fn finalize(file: &mut RrdFile, rra: usize, ds: usize, cf: ConsolidationFn, xff: f64, steps: u64) -> f64 {
    let value = file.cdp(rra, ds, CDP_VALUE);
    let unknown = file.cdp(rra, ds, CDP_UNKNOWN);
    let steps_f = steps as f64;

    file.set_cdp(rra, ds, CDP_VALUE, f64::NAN);
    file.set_cdp(rra, ds, CDP_UNKNOWN, 0.0);
    file.set_cdp(rra, ds, CDP_ABSORBED, 0.0);

    if unknown > xff * steps_f || value.is_nan() {
        return f64::NAN;
    }
    match cf {
        ConsolidationFn::Average => value / (steps_f - unknown),
        _ => value,
    }
}

/// Holt-Winters smoothing parameters of one archive.
#[derive(Debug, Clone, Copy)]
struct HoltWinters {
    alpha: f64,
    beta: f64,
    period: u64,
}

#[allow(clippy::cast_possible_truncation)]
fn hw_run(
    file: &mut RrdFile,
    rra: usize,
    params: &HoltWinters,
    rows: u64,
    pdps: &[f64],
    count: u64,
    first_end: u64,
) {
    let step = file.step();

    // UNKNOWN observations leave the state untouched, so only the rows that
    // remain in the ring need computing.
    let skip = if count > rows && pdps.iter().all(|v| v.is_nan()) {
        count - rows
    } else {
        0
    };

    let mut row = Vec::with_capacity(pdps.len() * 2);
    for i in skip..count {
        let end = first_end + i * step;
        let slot = ((end / step) % params.period) as usize;
        row.clear();
        for (ds, &observed) in pdps.iter().enumerate() {
            let (forecast, deviation) = hw_observe(file, rra, ds, params, slot, observed);
            row.push(forecast);
            row.push(deviation);
        }
        file.push_row(rra, &row);
    }
}

/// Forecasts seasonal slot `slot`, then absorbs `observed`.
///
/// Returns the forecast and the slot's deviation as they stood before the
/// observation.
#[allow(clippy::cast_possible_truncation)]
fn hw_observe(
    file: &mut RrdFile,
    rra: usize,
    ds: usize,
    params: &HoltWinters,
    slot: usize,
    observed: f64,
) -> (f64, f64) {
    let HoltWinters { alpha, beta, period } = *params;
    let seasonal_slot = HW_SEASONAL + slot;
    let deviation_slot = HW_SEASONAL + period as usize + slot;

    if file.cdp(rra, ds, HW_INITIALIZED) == 0.0 {
        if !observed.is_nan() {
            file.set_cdp(rra, ds, HW_INTERCEPT, observed);
            file.set_cdp(rra, ds, HW_SLOPE, 0.0);
            file.set_cdp(rra, ds, HW_INITIALIZED, 1.0);
        }
        return (f64::NAN, f64::NAN);
    }

    let intercept = file.cdp(rra, ds, HW_INTERCEPT);
    let slope = file.cdp(rra, ds, HW_SLOPE);
    let seasonal = file.cdp(rra, ds, seasonal_slot);
    let deviation = file.cdp(rra, ds, deviation_slot);
    let forecast = intercept + slope + seasonal;

    if !observed.is_nan() {
        let next_intercept = alpha * (observed - seasonal) + (1.0 - alpha) * (intercept + slope);
        let next_slope = beta * (next_intercept - intercept) + (1.0 - beta) * slope;
        let next_seasonal = alpha * (observed - next_intercept) + (1.0 - alpha) * seasonal;
        let next_deviation = alpha * (observed - forecast).abs() + (1.0 - alpha) * deviation;

        file.set_cdp(rra, ds, HW_INTERCEPT, next_intercept);
        file.set_cdp(rra, ds, HW_SLOPE, next_slope);
        file.set_cdp(rra, ds, seasonal_slot, next_seasonal);
        file.set_cdp(rra, ds, deviation_slot, next_deviation);
    }

    (forecast, deviation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ArchiveSpec, DataSourceDef};
    use tempfile::TempDir;

    fn open_file(dir: &TempDir, archives: Vec<ArchiveDef>) -> RrdFile {
        let spec = ArchiveSpec {
            start: 1000,
            step: 10,
            data_sources: vec![DataSourceDef::gauge("x", 20, None, None)],
            archives,
        };
        let mut file = RrdFile::allocate(&dir.path().join("c.rrd"), &spec, false).unwrap();
        initialize(&mut file);
        file
    }

    fn newest(file: &RrdFile, rra: usize) -> Vec<f64> {
        file.ring(rra).row_at_age(0)
    }

    #[test]
    fn test_xff_boundary() {
        let dir = TempDir::new().unwrap();
        let mut file = open_file(
            &dir,
            vec![ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 4, 10)],
        );

        // 2 unknown of 4 is exactly xff * steps: still known.
        for (i, v) in [1.0, f64::NAN, 2.0, f64::NAN].into_iter().enumerate() {
            absorb_run(&mut file, &[v], 1, 1010 + i as u64 * 10);
        }
        assert_eq!(newest(&file, 0), vec![1.5]);

        // 3 unknown of 4 exceeds it.
        for (i, v) in [f64::NAN, 5.0, f64::NAN, f64::NAN].into_iter().enumerate() {
            absorb_run(&mut file, &[v], 1, 1050 + i as u64 * 10);
        }
        assert!(newest(&file, 0)[0].is_nan());
    }

    #[test]
    fn test_consolidation_functions() {
        let dir = TempDir::new().unwrap();
        let mut file = open_file(
            &dir,
            vec![
                ArchiveDef::consolidated(ConsolidationFn::Min, 0.5, 3, 10),
                ArchiveDef::consolidated(ConsolidationFn::Max, 0.5, 3, 10),
                ArchiveDef::consolidated(ConsolidationFn::Last, 0.5, 3, 10),
                ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 3, 10),
            ],
        );
        // start 1000 / step 10 = 100 PDPs; 100 % 3 = 1 leading unknown PDP.
        assert_eq!(file.cdp(0, 0, CDP_UNKNOWN), 1.0);

        for (i, v) in [4.0, 2.0, 9.0, 3.0, 6.0].into_iter().enumerate() {
            absorb_run(&mut file, &[v], 1, 1010 + i as u64 * 10);
        }
        // First row: leading unknown, 4, 2. Second row: 9, 3, 6.
        assert_eq!(file.ring(0).row_at_age(1), vec![2.0]);
        assert_eq!(newest(&file, 0), vec![3.0]);
        assert_eq!(file.ring(1).row_at_age(1), vec![4.0]);
        assert_eq!(newest(&file, 1), vec![9.0]);
        assert_eq!(newest(&file, 2), vec![6.0]);
        assert_eq!(file.ring(3).row_at_age(1), vec![3.0]);
        assert_eq!(newest(&file, 3), vec![6.0]);
    }

    #[test]
    fn test_long_run_is_capped_at_capacity() {
        let dir = TempDir::new().unwrap();
        let mut file = open_file(
            &dir,
            vec![ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 2, 4)],
        );

        absorb_run(&mut file, &[7.0], 1_000_000_001, 1010);

        let ring = file.ring(0);
        for age in 0..4 {
            assert_eq!(ring.value_at_age(age, 0), 7.0);
        }
        // An odd number of PDPs leaves one in the open row.
        assert_eq!(file.cdp(0, 0, CDP_ABSORBED), 1.0);
    }

    #[test]
    fn test_holt_winters_constant_series() {
        let dir = TempDir::new().unwrap();
        let mut file = open_file(&dir, vec![ArchiveDef::hw_predict(8, 0.5, 0.5, 3)]);

        absorb_run(&mut file, &[10.0], 6, 1010);

        let ring = file.ring(0);
        // The first row only initializes the model.
        assert!(ring.value_at_age(5, 0).is_nan());
        for age in 0..5 {
            assert_eq!(ring.row_at_age(age), vec![10.0, 0.0]);
        }
    }

    #[test]
    fn test_holt_winters_deviation_tracks_surprise() {
        let dir = TempDir::new().unwrap();
        let mut file = open_file(&dir, vec![ArchiveDef::hw_predict(8, 0.5, 0.5, 2)]);

        absorb_run(&mut file, &[10.0], 3, 1010);
        absorb_run(&mut file, &[20.0], 1, 1040);
        // Forecast before the jump was 10, so the slot's deviation becomes 5.
        assert_eq!(newest(&file, 0), vec![10.0, 0.0]);

        // Two PDPs later the same seasonal slot reports its deviation.
        absorb_run(&mut file, &[f64::NAN], 2, 1050);
        let row = newest(&file, 0);
        assert!(row[0] > 10.0);
        assert_eq!(row[1], 5.0);
    }
}
