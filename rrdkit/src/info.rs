//! Archive metadata as a flat, typed key/value map.
//!
//! Keys follow rrdtool's `info` naming, e.g. `step`, `ds[in].type`,
//! `rra[0].cf` or `rra[1].cdp_prep[0].unknown_datapoints`.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::consolidate::{CDP_UNKNOWN, CDP_VALUE, HW_INTERCEPT, HW_SLOPE};
use crate::file::{FORMAT_VERSION, RrdFile};
use crate::schema::{ArchiveDef, DataSourceKind};

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InfoValue {
    /// A count, size or index.
    Count(u64),
    /// A floating point value; `NaN` stands for UNKNOWN.
    Float(f64),
    /// Seconds since the epoch.
    Timestamp(u64),
    /// Free text.
    Text(String),
}

impl fmt::Display for InfoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(v) | Self::Timestamp(v) => write!(f, "{v}"),
            Self::Float(v) if v.is_nan() => f.write_str("NaN"),
            Self::Float(v) => write!(f, "{v:e}"),
            Self::Text(s) => write!(f, "\"{s}\""),
        }
    }
}

/// Collects the metadata of an open archive.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn collect(file: &RrdFile) -> BTreeMap<String, InfoValue> {
    let spec = file.spec();
    let mut info = BTreeMap::new();
    let mut put = |key: String, value: InfoValue| {
        info.insert(key, value);
    };

    put("filename".into(), InfoValue::Text(file.path().to_string()));
    put("rrd_version".into(), InfoValue::Text(format!("{FORMAT_VERSION:04}")));
    put("step".into(), InfoValue::Count(spec.step));
    put("last_update".into(), InfoValue::Timestamp(file.last_update()));
    put("header_size".into(), InfoValue::Count(file.header_size() as u64));

    for (index, ds) in spec.data_sources.iter().enumerate() {
        let key = |field: &str| format!("ds[{}].{field}", ds.name);
        put(key("index"), InfoValue::Count(index as u64));
        put(key("type"), InfoValue::Text(ds.kind.type_name().to_string()));

        match &ds.kind {
            DataSourceKind::Compute { expression } => {
                put(key("cdef"), InfoValue::Text(expression.clone()));
            }
            kind => {
                if let Some(params) = kind.input() {
                    put(key("minimal_heartbeat"), InfoValue::Count(params.heartbeat));
                    put(key("min"), InfoValue::Float(params.min.unwrap_or(f64::NAN)));
                    put(key("max"), InfoValue::Float(params.max.unwrap_or(f64::NAN)));
                }
                let state = file.ds_state(index);
                let last_ds = if state.last_ds.is_nan() {
                    "U".to_string()
                } else {
                    state.last_ds.to_string()
                };
                put(key("last_ds"), InfoValue::Text(last_ds));
                put(key("value"), InfoValue::Float(state.scratch));
                put(key("unknown_sec"), InfoValue::Count(state.unknown_sec));
            }
        }
    }

    for (rra, archive) in spec.archives.iter().enumerate() {
        let key = |field: &str| format!("rra[{rra}].{field}");
        put(key("cf"), InfoValue::Text(archive.cf().to_string()));
        put(key("rows"), InfoValue::Count(archive.rows()));
        put(key("cur_row"), InfoValue::Count(file.cur_row(rra) as u64));
        put(key("pdp_per_row"), InfoValue::Count(archive.steps()));

        match archive {
            ArchiveDef::Consolidated { xff, .. } => {
                put(key("xff"), InfoValue::Float(*xff));
                for ds in 0..spec.data_sources.len() {
                    put(
                        key(&format!("cdp_prep[{ds}].value")),
                        InfoValue::Float(file.cdp(rra, ds, CDP_VALUE)),
                    );
                    put(
                        key(&format!("cdp_prep[{ds}].unknown_datapoints")),
                        InfoValue::Count(file.cdp(rra, ds, CDP_UNKNOWN) as u64),
                    );
                }
            }
            ArchiveDef::HwPredict {
                alpha,
                beta,
                seasonal_period,
                ..
            } => {
                put(key("alpha"), InfoValue::Float(*alpha));
                put(key("beta"), InfoValue::Float(*beta));
                put(key("seasonal_period"), InfoValue::Count(*seasonal_period));
                for ds in 0..spec.data_sources.len() {
                    put(
                        key(&format!("cdp_prep[{ds}].intercept")),
                        InfoValue::Float(file.cdp(rra, ds, HW_INTERCEPT)),
                    );
                    put(
                        key(&format!("cdp_prep[{ds}].slope")),
                        InfoValue::Float(file.cdp(rra, ds, HW_SLOPE)),
                    );
                }
            }
        }
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::create_file;
    use crate::schema::{ArchiveSpec, ConsolidationFn, DataSourceDef};
    use tempfile::TempDir;

    #[test]
    fn test_info_keys() {
        let dir = TempDir::new().unwrap();
        let spec = ArchiveSpec {
            start: 1000,
            step: 300,
            data_sources: vec![
                DataSourceDef::counter("in", 600, Some(0.0), None),
                DataSourceDef::compute("bits", "in,8,*"),
            ],
            archives: vec![
                ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 1, 10),
                ArchiveDef::hw_predict(20, 0.1, 0.01, 4),
            ],
        };
        let file = create_file(&dir.path().join("i.rrd"), &spec, false).unwrap();
        let info = collect(&file);

        assert_eq!(info["step"], InfoValue::Count(300));
        assert_eq!(info["last_update"], InfoValue::Timestamp(1000));
        assert_eq!(info["ds[in].type"], InfoValue::Text("COUNTER".into()));
        assert_eq!(info["ds[in].minimal_heartbeat"], InfoValue::Count(600));
        assert_eq!(info["ds[in].last_ds"], InfoValue::Text("U".into()));
        assert_eq!(info["ds[in].unknown_sec"], InfoValue::Count(100));
        assert_eq!(info["ds[bits].cdef"], InfoValue::Text("in,8,*".into()));
        assert_eq!(info["rra[0].cf"], InfoValue::Text("AVERAGE".into()));
        assert_eq!(info["rra[0].cur_row"], InfoValue::Count(9));
        assert_eq!(info["rra[0].cdp_prep[1].unknown_datapoints"], InfoValue::Count(0));
        assert_eq!(info["rra[1].cf"], InfoValue::Text("HWPREDICT".into()));
        assert_eq!(info["rra[1].seasonal_period"], InfoValue::Count(4));
        assert!(matches!(info["ds[in].max"], InfoValue::Float(v) if v.is_nan()));
    }

    #[test]
    fn test_info_value_json() {
        let json = serde_json::to_string(&vec![
            InfoValue::Count(3),
            InfoValue::Float(f64::NAN),
            InfoValue::Text("x".into()),
        ])
        .unwrap();
        assert_eq!(json, r#"[3,null,"x"]"#);
    }
}
