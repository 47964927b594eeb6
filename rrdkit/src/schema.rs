//! Archive layout definitions: data sources, round-robin archives, and the
//! creation spec that combines them.
//!
//! These types fix the on-disk layout of an archive at creation time. Both
//! data sources and archives are tagged unions: input data sources carry a
//! heartbeat and valid range, COMPUTE sources carry an RPN expression instead;
//! consolidated archives carry an xff and step count, HWPREDICT archives carry
//! their smoothing parameters.
//!
//! Every definition also round-trips through the rrdtool argument syntax:
//!
//! ```rust
//! use rrdkit::schema::{ArchiveDef, DataSourceDef};
//!
//! let ds: DataSourceDef = "DS:requests:COUNTER:600:0:U".parse().unwrap();
//! assert_eq!(ds.name, "requests");
//! assert_eq!(ds.to_string(), "DS:requests:COUNTER:600:0:U");
//!
//! let rra: ArchiveDef = "RRA:AVERAGE:0.5:12:240".parse().unwrap();
//! assert_eq!(rra.steps(), 12);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CreateError;
use crate::rpn::Expression;

/// Maximum length of a data source name.
pub const MAX_DS_NAME_LEN: usize = 19;

/// Upper bound on rows per archive, guarding against absurd allocations.
const MAX_ROWS: u64 = 1_000_000_000;

/// Consolidation function of an archive, also used to select archives on
/// fetch.
///
/// `HwPredict` and `DevPredict` both address a HWPREDICT archive: the first
/// reads its forecast column, the second its seasonal deviation column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsolidationFn {
    /// Arithmetic mean of known PDPs.
    Average,
    /// Smallest known PDP.
    Min,
    /// Largest known PDP.
    Max,
    /// Most recent known PDP.
    Last,
    /// Holt-Winters forecast.
    #[serde(rename = "HWPREDICT")]
    HwPredict,
    /// Holt-Winters seasonal deviation.
    #[serde(rename = "DEVPREDICT")]
    DevPredict,
}

impl ConsolidationFn {
    /// Returns the rrdtool name of this function.
    pub fn name(self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Last => "LAST",
            Self::HwPredict => "HWPREDICT",
            Self::DevPredict => "DEVPREDICT",
        }
    }

    /// Returns true for functions a consolidated (non-HWPREDICT) archive may use.
    pub fn is_simple(self) -> bool {
        matches!(self, Self::Average | Self::Min | Self::Max | Self::Last)
    }

    /// Applies this function to a slice of values, ignoring `NaN`.
    ///
    /// Returns `NaN` if no value is known. Prediction series are averaged.
    ///
    /// ```rust
    /// use rrdkit::schema::ConsolidationFn;
    ///
    /// let values = [1.0, 2.0, f64::NAN, 4.0];
    /// assert!((ConsolidationFn::Average.apply(&values) - 7.0 / 3.0).abs() < 1e-10);
    /// assert_eq!(ConsolidationFn::Min.apply(&values), 1.0);
    /// assert_eq!(ConsolidationFn::Last.apply(&values), 4.0);
    /// ```
    #[allow(clippy::cast_precision_loss)]
    pub fn apply(self, values: &[f64]) -> f64 {
        let mut known = values.iter().copied().filter(|v| !v.is_nan());
        let Some(first) = known.next() else {
            return f64::NAN;
        };

        match self {
            Self::Min => known.fold(first, f64::min),
            Self::Max => known.fold(first, f64::max),
            Self::Last => known.last().unwrap_or(first),
            Self::Average | Self::HwPredict | Self::DevPredict => {
                let (sum, count) = known.fold((first, 1usize), |(s, c), v| (s + v, c + 1));
                sum / count as f64
            }
        }
    }
}

impl fmt::Display for ConsolidationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConsolidationFn {
    type Err = CreateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVERAGE" => Ok(Self::Average),
            "MIN" => Ok(Self::Min),
            "MAX" => Ok(Self::Max),
            "LAST" => Ok(Self::Last),
            "HWPREDICT" => Ok(Self::HwPredict),
            "DEVPREDICT" => Ok(Self::DevPredict),
            other => Err(CreateError::invalid(format!(
                "unknown consolidation function '{other}'"
            ))),
        }
    }
}

/// Heartbeat and valid range of an input data source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputParams {
    /// Maximum seconds between updates before the interval becomes UNKNOWN.
    pub heartbeat: u64,
    /// Smallest valid rate, or unbounded.
    pub min: Option<f64>,
    /// Largest valid rate, or unbounded.
    pub max: Option<f64>,
}

impl InputParams {
    /// Creates input parameters.
    pub fn new(heartbeat: u64, min: Option<f64>, max: Option<f64>) -> Self {
        Self { heartbeat, min, max }
    }

    /// Returns true if `value` is within `[min, max]`.
    #[inline]
    pub fn in_range(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// Type of a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum DataSourceKind {
    /// Stores the reading as-is (temperature, queue length).
    Gauge(InputParams),
    /// Monotonic counter; stores the per-second rate of increase and handles
    /// 32/64-bit wraparound.
    Counter(InputParams),
    /// Like COUNTER but permits negative rates and does not wrap.
    Derive(InputParams),
    /// Counter that resets on every read; stores reading / elapsed seconds.
    Absolute(InputParams),
    /// Computed from other data sources of the same PDP.
    Compute {
        /// RPN expression over previously defined data source names.
        expression: String,
    },
}

impl DataSourceKind {
    /// Returns the rrdtool type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Gauge(_) => "GAUGE",
            Self::Counter(_) => "COUNTER",
            Self::Derive(_) => "DERIVE",
            Self::Absolute(_) => "ABSOLUTE",
            Self::Compute { .. } => "COMPUTE",
        }
    }

    /// Returns the input parameters, or `None` for COMPUTE.
    pub fn input(&self) -> Option<&InputParams> {
        match self {
            Self::Gauge(p) | Self::Counter(p) | Self::Derive(p) | Self::Absolute(p) => Some(p),
            Self::Compute { .. } => None,
        }
    }
}

/// A named data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceDef {
    /// Unique name, `[A-Za-z0-9_]{1,19}`.
    pub name: String,
    /// Type and type-specific parameters.
    #[serde(flatten)]
    pub kind: DataSourceKind,
}

impl DataSourceDef {
    /// Creates a GAUGE data source.
    pub fn gauge(name: impl Into<String>, heartbeat: u64, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            name: name.into(),
            kind: DataSourceKind::Gauge(InputParams::new(heartbeat, min, max)),
        }
    }

    /// Creates a COUNTER data source.
    pub fn counter(name: impl Into<String>, heartbeat: u64, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            name: name.into(),
            kind: DataSourceKind::Counter(InputParams::new(heartbeat, min, max)),
        }
    }

    /// Creates a DERIVE data source.
    pub fn derive(name: impl Into<String>, heartbeat: u64, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            name: name.into(),
            kind: DataSourceKind::Derive(InputParams::new(heartbeat, min, max)),
        }
    }

    /// Creates an ABSOLUTE data source.
    pub fn absolute(name: impl Into<String>, heartbeat: u64, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            name: name.into(),
            kind: DataSourceKind::Absolute(InputParams::new(heartbeat, min, max)),
        }
    }

    /// Creates a COMPUTE data source.
    pub fn compute(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DataSourceKind::Compute {
                expression: expression.into(),
            },
        }
    }

    /// Returns true unless this is a COMPUTE data source.
    pub fn is_input(&self) -> bool {
        self.kind.input().is_some()
    }
}

impl fmt::Display for DataSourceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DataSourceKind::Compute { expression } => {
                write!(f, "DS:{}:COMPUTE:{expression}", self.name)
            }
            kind => {
                let params = kind.input().copied().unwrap_or(InputParams::new(0, None, None));
                write!(
                    f,
                    "DS:{}:{}:{}:{}:{}",
                    self.name,
                    kind.type_name(),
                    params.heartbeat,
                    format_bound(params.min),
                    format_bound(params.max)
                )
            }
        }
    }
}

impl FromStr for DataSourceDef {
    type Err = CreateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix("DS:")
            .ok_or_else(|| CreateError::invalid(format!("'{s}' does not start with DS:")))?;
        let mut parts = body.splitn(3, ':');
        let name = parts.next().unwrap_or_default();
        let kind = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default();

        if kind == "COMPUTE" {
            return Ok(Self::compute(name, rest));
        }

        let fields: Vec<&str> = rest.split(':').collect();
        let [heartbeat, min, max] = fields.as_slice() else {
            return Err(CreateError::invalid(format!(
                "'{s}': expected DS:name:TYPE:heartbeat:min:max"
            )));
        };
        let heartbeat: u64 = heartbeat
            .parse()
            .map_err(|_| CreateError::invalid(format!("'{s}': invalid heartbeat '{heartbeat}'")))?;
        let params = InputParams::new(heartbeat, parse_bound(s, min)?, parse_bound(s, max)?);

        let kind = match kind {
            "GAUGE" => DataSourceKind::Gauge(params),
            "COUNTER" => DataSourceKind::Counter(params),
            "DERIVE" => DataSourceKind::Derive(params),
            "ABSOLUTE" => DataSourceKind::Absolute(params),
            other => {
                return Err(CreateError::invalid(format!(
                    "'{s}': unknown data source type '{other}'"
                )));
            }
        };

        Ok(Self {
            name: name.to_string(),
            kind,
        })
    }
}

fn parse_bound(def: &str, field: &str) -> Result<Option<f64>, CreateError> {
    if field == "U" {
        return Ok(None);
    }
    field
        .parse::<f64>()
        .map(Some)
        .map_err(|_| CreateError::invalid(format!("'{def}': invalid bound '{field}'")))
}

fn format_bound(bound: Option<f64>) -> String {
    bound.map_or_else(|| "U".to_string(), |v| v.to_string())
}

/// Definition of one round-robin archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchiveDef {
    /// Consolidates `steps` PDPs into one row with a simple function.
    Consolidated {
        /// AVERAGE, MIN, MAX or LAST.
        cf: ConsolidationFn,
        /// Tolerated fraction of UNKNOWN PDPs per row, `0 <= xff < 1`.
        xff: f64,
        /// PDPs per row.
        steps: u64,
        /// Ring buffer capacity.
        rows: u64,
    },
    /// Holt-Winters forecasting over single PDPs.
    HwPredict {
        /// Ring buffer capacity.
        rows: u64,
        /// Baseline (and seasonal) smoothing constant.
        alpha: f64,
        /// Slope smoothing constant.
        beta: f64,
        /// Rows per season.
        seasonal_period: u64,
    },
}

impl ArchiveDef {
    /// Creates a consolidated archive definition.
    pub fn consolidated(cf: ConsolidationFn, xff: f64, steps: u64, rows: u64) -> Self {
        Self::Consolidated { cf, xff, steps, rows }
    }

    /// Creates a HWPREDICT archive definition.
    pub fn hw_predict(rows: u64, alpha: f64, beta: f64, seasonal_period: u64) -> Self {
        Self::HwPredict {
            rows,
            alpha,
            beta,
            seasonal_period,
        }
    }

    /// Returns the ring buffer capacity.
    pub fn rows(&self) -> u64 {
        match self {
            Self::Consolidated { rows, .. } | Self::HwPredict { rows, .. } => *rows,
        }
    }

    /// Returns the number of PDPs per row.
    pub fn steps(&self) -> u64 {
        match self {
            Self::Consolidated { steps, .. } => *steps,
            Self::HwPredict { .. } => 1,
        }
    }

    /// Returns the consolidation function stored in the definition.
    pub fn cf(&self) -> ConsolidationFn {
        match self {
            Self::Consolidated { cf, .. } => *cf,
            Self::HwPredict { .. } => ConsolidationFn::HwPredict,
        }
    }

    /// Returns true if a fetch for `cf` may read this archive.
    pub fn serves(&self, cf: ConsolidationFn) -> bool {
        match self {
            Self::Consolidated { cf: own, .. } => *own == cf,
            Self::HwPredict { .. } => {
                matches!(cf, ConsolidationFn::HwPredict | ConsolidationFn::DevPredict)
            }
        }
    }

    /// Returns the number of ring columns stored per data source.
    pub(crate) fn columns_per_ds(&self) -> usize {
        match self {
            Self::Consolidated { .. } => 1,
            Self::HwPredict { .. } => 2,
        }
    }

    /// Validates this definition on its own.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError::InvalidSpec`] describing the first problem found.
    pub fn validate(&self) -> Result<(), CreateError> {
        let rows = self.rows();
        if rows == 0 {
            return Err(CreateError::invalid("archive row count must be > 0"));
        }
        if rows > MAX_ROWS {
            return Err(CreateError::invalid(format!(
                "archive row count {rows} exceeds {MAX_ROWS}"
            )));
        }

        match self {
            Self::Consolidated { cf, xff, steps, .. } => {
                if !cf.is_simple() {
                    return Err(CreateError::invalid(format!(
                        "{cf} is not a valid consolidation function for this archive"
                    )));
                }
                if !(0.0..1.0).contains(xff) {
                    return Err(CreateError::invalid(format!(
                        "xff {xff} must be within [0, 1)"
                    )));
                }
                if *steps == 0 {
                    return Err(CreateError::invalid("archive steps must be > 0"));
                }
            }
            Self::HwPredict {
                alpha,
                beta,
                seasonal_period,
                ..
            } => {
                for (label, value) in [("alpha", alpha), ("beta", beta)] {
                    if !(*value > 0.0 && *value < 1.0) {
                        return Err(CreateError::invalid(format!(
                            "HWPREDICT {label} {value} must be within (0, 1)"
                        )));
                    }
                }
                if *seasonal_period == 0 {
                    return Err(CreateError::invalid("HWPREDICT seasonal period must be > 0"));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ArchiveDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consolidated { cf, xff, steps, rows } => {
                write!(f, "RRA:{cf}:{xff}:{steps}:{rows}")
            }
            Self::HwPredict {
                rows,
                alpha,
                beta,
                seasonal_period,
            } => write!(f, "RRA:HWPREDICT:{rows}:{alpha}:{beta}:{seasonal_period}"),
        }
    }
}

impl FromStr for ArchiveDef {
    type Err = CreateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix("RRA:")
            .ok_or_else(|| CreateError::invalid(format!("'{s}' does not start with RRA:")))?;
        let fields: Vec<&str> = body.split(':').collect();

        let number = |field: &str| -> Result<f64, CreateError> {
            field
                .parse::<f64>()
                .map_err(|_| CreateError::invalid(format!("'{s}': invalid number '{field}'")))
        };
        let count = |field: &str| -> Result<u64, CreateError> {
            field
                .parse::<u64>()
                .map_err(|_| CreateError::invalid(format!("'{s}': invalid count '{field}'")))
        };

        match fields.as_slice() {
            ["HWPREDICT", rows, alpha, beta, period] => Ok(Self::hw_predict(
                count(rows)?,
                number(alpha)?,
                number(beta)?,
                count(period)?,
            )),
            [cf, xff, steps, rows] => Ok(Self::consolidated(
                cf.parse()?,
                number(xff)?,
                count(steps)?,
                count(rows)?,
            )),
            _ => Err(CreateError::invalid(format!(
                "'{s}': expected RRA:CF:xff:steps:rows or RRA:HWPREDICT:rows:alpha:beta:period"
            ))),
        }
    }
}

/// Complete definition of a new archive.
///
/// This is the configuration surface of the crate: it serializes to and from
/// JSON so archive layouts can be kept in files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSpec {
    /// Creation timestamp (seconds since the epoch); the first update must be later.
    pub start: u64,
    /// Base step: seconds per primary data point.
    pub step: u64,
    /// Data sources in storage order.
    pub data_sources: Vec<DataSourceDef>,
    /// Archives in storage order.
    pub archives: Vec<ArchiveDef>,
}

impl ArchiveSpec {
    /// Validates the whole spec.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError::InvalidSpec`] if the step is zero, a data source
    /// is malformed or duplicated, a COMPUTE expression is invalid or refers
    /// to an undefined or later data source, or an archive is invalid.
    pub fn validate(&self) -> Result<(), CreateError> {
        if self.step == 0 {
            return Err(CreateError::invalid("step must be > 0"));
        }
        if self.data_sources.is_empty() {
            return Err(CreateError::invalid("at least one data source is required"));
        }
        if self.archives.is_empty() {
            return Err(CreateError::invalid("at least one archive is required"));
        }

        let mut defined: HashSet<&str> = HashSet::new();
        for ds in &self.data_sources {
            validate_ds_name(&ds.name)?;

            match &ds.kind {
                DataSourceKind::Compute { expression } => {
                    let expr = Expression::parse(expression).map_err(|e| {
                        CreateError::invalid(format!("data source '{}': {e}", ds.name))
                    })?;
                    if expr.uses_row_context() {
                        return Err(CreateError::invalid(format!(
                            "data source '{}': TIME, PREV and COUNT are not available to COMPUTE",
                            ds.name
                        )));
                    }
                    if let Some(missing) = expr.references().find(|r| !defined.contains(r)) {
                        return Err(CreateError::invalid(format!(
                            "data source '{}' references undefined or later data source '{missing}'",
                            ds.name
                        )));
                    }
                }
                kind => {
                    let params = kind.input().copied().unwrap_or(InputParams::new(0, None, None));
                    if params.heartbeat == 0 {
                        return Err(CreateError::invalid(format!(
                            "data source '{}': heartbeat must be > 0",
                            ds.name
                        )));
                    }
                    if let (Some(min), Some(max)) = (params.min, params.max)
                        && min > max
                    {
                        return Err(CreateError::invalid(format!(
                            "data source '{}': min {min} > max {max}",
                            ds.name
                        )));
                    }
                }
            }

            if !defined.insert(ds.name.as_str()) {
                return Err(CreateError::invalid(format!(
                    "duplicate data source name '{}'",
                    ds.name
                )));
            }
        }

        for archive in &self.archives {
            archive.validate()?;
        }
        Ok(())
    }

    /// Returns the number of data sources that take update values.
    pub fn input_count(&self) -> usize {
        self.data_sources.iter().filter(|ds| ds.is_input()).count()
    }
}

fn validate_ds_name(name: &str) -> Result<(), CreateError> {
    if name.is_empty()
        || name.len() > MAX_DS_NAME_LEN
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(CreateError::invalid(format!(
            "invalid data source name '{name}': expected 1-{MAX_DS_NAME_LEN} characters of [A-Za-z0-9_]"
        )));
    }
    Ok(())
}
