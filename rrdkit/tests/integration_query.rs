//! Integration tests for the read path: archive selection, alignment,
//! forecasting archives, metadata and dumps.

use rrdkit::error::{QueryError, RrdError};
use rrdkit::rpn::RowContext;
use rrdkit::{ArchiveDef, ArchiveSpec, ConsolidationFn, DataSourceDef, Expression, InfoValue, Reduction, Rrd};
use tempfile::tempdir;

const START: u64 = 10_000;

/// Helper: a gauge archive with 10s and 60s averages fed with `value = t / 10`.
fn filled_archive(dir: &tempfile::TempDir) -> Rrd {
    let spec = ArchiveSpec {
        start: START,
        step: 10,
        data_sources: vec![DataSourceDef::gauge("g", 20, None, None)],
        archives: vec![
            ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 1, 30),
            ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 6, 50),
            ArchiveDef::consolidated(ConsolidationFn::Max, 0.5, 6, 50),
        ],
    };
    let mut rrd = Rrd::create(dir.path().join("filled.rrd"), &spec, false).unwrap();
    for t in (START + 10..=START + 1200).step_by(10) {
        rrd.update(t, &[(t / 10) as f64]).unwrap();
    }
    rrd
}

#[test]
fn test_fetch_alignment() {
    let temp_dir = tempdir().unwrap();
    let rrd = filled_archive(&temp_dir);

    // Unaligned window at 60s: start rounds down, end rounds up.
    let result = rrd.fetch(ConsolidationFn::Average, 11_005, 11_130, 60).unwrap();
    assert_eq!(result.archive_used, 1);
    assert_eq!((result.start, result.end, result.step), (10_980, 11_160, 60));
    assert_eq!(result.rows(), 3);
    assert_eq!(result.timestamp(0), 11_040);

    // The row ending 11_040 averages the PDPs ending 10_990 ..= 11_040.
    assert_eq!(result.value_at(0, 0), (1_099.0 + 1_100.0 + 1_101.0 + 1_102.0 + 1_103.0 + 1_104.0) / 6.0);
    let max = rrd.fetch(ConsolidationFn::Max, 11_005, 11_130, 60).unwrap();
    assert_eq!(max.value_at(0, 0), 1_104.0);
}

#[test]
fn test_fetch_selects_covering_archive() {
    let temp_dir = tempdir().unwrap();
    let rrd = filled_archive(&temp_dir);

    // The 10s archive holds the last 300 seconds only.
    let recent = rrd.fetch(ConsolidationFn::Average, 11_000, 11_200, 10).unwrap();
    assert_eq!(recent.archive_used, 0);
    assert_eq!(recent.step, 10);
    assert_eq!(recent.value_at(0, 0), 1_101.0);

    let older = rrd.fetch(ConsolidationFn::Average, 10_500, 11_200, 10).unwrap();
    assert_eq!(older.archive_used, 1);
    assert_eq!(older.step, 60);

    // Step 0 asks for the base step.
    let base = rrd.fetch(ConsolidationFn::Average, 11_100, 11_200, 0).unwrap();
    assert_eq!(base.step, 10);
}

#[test]
fn test_fetch_errors() {
    let temp_dir = tempdir().unwrap();
    let rrd = filled_archive(&temp_dir);

    let err = rrd.fetch(ConsolidationFn::Last, 10_000, 11_000, 10).unwrap_err();
    assert!(matches!(err, RrdError::Query(QueryError::NoMatchingArchive { ref cf }) if cf == "LAST"));

    let err = rrd.fetch(ConsolidationFn::Average, 11_000, 11_000, 10).unwrap_err();
    assert!(matches!(
        err,
        RrdError::Query(QueryError::InvalidTimeRange { start: 11_000, end: 11_000 })
    ));
}

#[test]
fn test_future_rows_are_unknown() {
    let temp_dir = tempdir().unwrap();
    let rrd = filled_archive(&temp_dir);

    let result = rrd.fetch(ConsolidationFn::Average, 11_180, 11_240, 10).unwrap();
    let values = result.column("g").unwrap();
    assert_eq!(&values[..2], &[1_119.0, 1_120.0]);
    assert!(values[2..].iter().all(|v| v.is_nan()));
}

#[test]
fn test_holt_winters_fetch() {
    let temp_dir = tempdir().unwrap();
    let spec = ArchiveSpec {
        start: 1000,
        step: 10,
        data_sources: vec![DataSourceDef::gauge("level", 20, None, None)],
        archives: vec![
            ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 1, 10),
            ArchiveDef::hw_predict(10, 0.5, 0.1, 2),
        ],
    };
    let mut rrd = Rrd::create(temp_dir.path().join("hw.rrd"), &spec, false).unwrap();
    for t in (1010..=1100).step_by(10) {
        rrd.update(t, &[5.0]).unwrap();
    }

    let forecast = rrd.fetch(ConsolidationFn::HwPredict, 1000, 1100, 10).unwrap();
    assert_eq!(forecast.archive_used, 1);
    let values = forecast.column("level").unwrap();
    // The first observation only seeds the model.
    assert!(values[0].is_nan());
    assert!(values[1..].iter().all(|v| *v == 5.0));

    let deviation = rrd.fetch(ConsolidationFn::DevPredict, 1000, 1100, 10).unwrap();
    let values = deviation.column("level").unwrap();
    assert!(values[0].is_nan());
    assert!(values[1..].iter().all(|v| *v == 0.0));

    let info = rrd.info();
    assert_eq!(info["rra[1].cf"], InfoValue::Text("HWPREDICT".into()));
    assert_eq!(info["rra[1].cdp_prep[0].intercept"], InfoValue::Float(5.0));
    assert_eq!(info["rra[1].cdp_prep[0].slope"], InfoValue::Float(0.0));
}

#[test]
fn test_info_after_updates() {
    let temp_dir = tempdir().unwrap();
    let spec = ArchiveSpec {
        start: 990,
        step: 10,
        data_sources: vec![
            DataSourceDef::counter("in", 30, Some(0.0), None),
            DataSourceDef::compute("bits", "in,8,*"),
        ],
        archives: vec![ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 3, 10)],
    };
    let mut rrd = Rrd::create(temp_dir.path().join("info.rrd"), &spec, false).unwrap();
    rrd.update(1000, &[100.0]).unwrap();
    rrd.update(1010, &[300.0]).unwrap();
    rrd.update(1015, &[400.0]).unwrap();

    let info = rrd.info();
    assert_eq!(info["step"], InfoValue::Count(10));
    assert_eq!(info["last_update"], InfoValue::Timestamp(1015));
    assert_eq!(info["ds[in].index"], InfoValue::Count(0));
    assert_eq!(info["ds[in].type"], InfoValue::Text("COUNTER".into()));
    assert_eq!(info["ds[in].last_ds"], InfoValue::Text("400".into()));
    // Rate 20/s over the five seconds of the open step.
    assert_eq!(info["ds[in].value"], InfoValue::Float(100.0));
    assert_eq!(info["ds[in].unknown_sec"], InfoValue::Count(0));
    assert_eq!(info["ds[bits].type"], InfoValue::Text("COMPUTE".into()));
    assert_eq!(info["rra[0].pdp_per_row"], InfoValue::Count(3));
    assert_eq!(info["rra[0].xff"], InfoValue::Float(0.5));
    // Two PDPs absorbed into the open row, the first unknown.
    assert_eq!(info["rra[0].cdp_prep[0].unknown_datapoints"], InfoValue::Count(1));
    assert_eq!(info["rra[0].cdp_prep[0].value"], InfoValue::Float(20.0));
    assert_eq!(info["rra[0].cdp_prep[1].value"], InfoValue::Float(160.0));

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["step"], 10);
    assert_eq!(json["ds[in].type"], "COUNTER");
}

#[test]
fn test_dump_rows() {
    let temp_dir = tempdir().unwrap();
    let rrd = filled_archive(&temp_dir);

    let dump = rrd.dump(ConsolidationFn::Max).unwrap();
    assert_eq!(dump.step(), 60);
    assert_eq!(dump.len(), 50);

    let rows: Vec<_> = dump.collect();
    let newest = rows.last().unwrap();
    // 11_170 ..= 11_200 are still in the open row.
    assert_eq!(newest.timestamp, 11_160);
    assert_eq!(newest.values, vec![1_116.0]);
    assert!(rows.windows(2).all(|w| w[1].timestamp == w[0].timestamp + 60));
    // Rows from before the archive start were never written.
    assert!(rows[0].values[0].is_nan());
}

#[test]
fn test_evaluator_purity() {
    let add = Expression::parse("a,b,+").unwrap();
    let div = Expression::parse("a,0,/").unwrap();
    let mut stack = Vec::new();
    let lookup = |name: &str| match name {
        "a" => 3.0,
        "b" => 4.0,
        _ => f64::NAN,
    };

    for _ in 0..3 {
        assert_eq!(add.evaluate(RowContext::default(), lookup, &mut stack), 7.0);
        assert!(div.evaluate(RowContext::default(), lookup, &mut stack).is_nan());
    }
    assert!(add.evaluate(RowContext::default(), |_| f64::NAN, &mut stack).is_nan());

    let series = add.evaluate_series(0, 10, 3, |name, row| if name == "a" { row as f64 } else { 1.0 });
    assert_eq!(series, vec![1.0, 2.0, 3.0]);

    let total = Reduction::parse("x,TOTAL").unwrap();
    let scalar = total.reduce(&[1.0, f64::NAN, 2.0], 0, 10);
    assert_eq!(scalar.value, 30.0);

    assert!(Expression::parse("a,+").is_err());
    assert!(Expression::parse("a,b,FROB").is_err());
    assert!(Expression::parse("").is_err());
}
