//! Sample ingestion: turns timestamped readings into primary data points.
//!
//! For each update every input data source yields a *rate* (the reading
//! itself for GAUGE, a per-second rate for the counter types). The rate is
//! spread over the seconds since the previous update and cut at every base
//! step boundary:
//!
//! ```text
//!   last_update        boundary   boundary   boundary        timestamp
//!        |---- head ------|-- full --|-- full --|---- tail ------|
//!        closes open PDP   PDP run of identical rates            opens next PDP
//! ```
//!
//! The open PDP keeps its partial state (`scratch`, `unknown_sec`) in the
//! file between updates. A PDP is UNKNOWN when its unknown seconds exceed the
//! heartbeat or when it has no known seconds at all.

use std::collections::HashMap;

use crate::consolidate;
use crate::error::{ExprError, Result, UpdateError};
use crate::file::{DsState, RrdFile};
use crate::rpn::{Expression, RowContext};
use crate::schema::{ArchiveSpec, DataSourceKind, InputParams};

/// 2^32, the wrap modulus of a 32-bit counter.
const WRAP_32: f64 = 4_294_967_296.0;

/// 2^64 - 2^32, added when a wrap is not explained by a 32-bit counter.
const WRAP_64_REST: f64 = 18_446_744_069_414_584_320.0;

/// Compiled ingestion rules of one archive.
#[derive(Debug, Clone)]
pub(crate) struct Ingestor {
    /// Indices of non-COMPUTE data sources, in definition order.
    inputs: Vec<usize>,
    /// COMPUTE data sources and their parsed expressions, in definition order.
    computes: Vec<(usize, Expression)>,
    /// Data source name to index.
    index: HashMap<String, usize>,
}

impl Ingestor {
    /// Compiles the ingestion rules of `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::InvalidExpression`] if a COMPUTE expression does
    /// not parse.
    pub(crate) fn new(spec: &ArchiveSpec) -> std::result::Result<Self, ExprError> {
        let mut inputs = Vec::new();
        let mut computes = Vec::new();
        let mut index = HashMap::new();

        for (i, ds) in spec.data_sources.iter().enumerate() {
            index.insert(ds.name.clone(), i);
            match &ds.kind {
                DataSourceKind::Compute { expression } => {
                    computes.push((i, Expression::parse(expression)?));
                }
                _ => inputs.push(i),
            }
        }

        Ok(Self {
            inputs,
            computes,
            index,
        })
    }

    /// Checks arity and finiteness of an update's values.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ValueCount`] or [`UpdateError::InvalidValue`].
    pub(crate) fn check_values(&self, spec: &ArchiveSpec, values: &[f64]) -> Result<()> {
        if values.len() != self.inputs.len() {
            return Err(UpdateError::ValueCount {
                expected: self.inputs.len(),
                actual: values.len(),
            }
            .into());
        }
        if let Some((pos, value)) = values.iter().enumerate().find(|(_, v)| v.is_infinite()) {
            return Err(UpdateError::InvalidValue {
                data_source: spec.data_sources[self.inputs[pos]].name.clone(),
                value: *value,
                reason: "infinite readings cannot be stored".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Expands a template update into a full input vector.
    ///
    /// Input data sources not named by the template receive UNKNOWN.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::ValueCount`] if `names` and `values` differ in
    /// length, or [`UpdateError::UnknownDataSource`] if a name is not an
    /// input data source.
    pub(crate) fn expand_template(
        &self,
        spec: &ArchiveSpec,
        names: &[&str],
        values: &[f64],
    ) -> Result<Vec<f64>> {
        if names.len() != values.len() {
            return Err(UpdateError::ValueCount {
                expected: names.len(),
                actual: values.len(),
            }
            .into());
        }

        let mut full = vec![f64::NAN; self.inputs.len()];
        for (name, value) in names.iter().zip(values) {
            let pos = self
                .inputs
                .iter()
                .position(|&ds| spec.data_sources[ds].name == *name)
                .ok_or_else(|| UpdateError::UnknownDataSource {
                    name: (*name).to_string(),
                })?;
            full[pos] = *value;
        }
        Ok(full)
    }

    /// Applies one update to `file`.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::NonMonotonicUpdate`] if `timestamp` is not
    /// after the last update, or the errors of [`Ingestor::check_values`].
    /// A rejected update leaves the file untouched.
    pub(crate) fn apply(&self, file: &mut RrdFile, timestamp: u64, values: &[f64]) -> Result<()> {
        let last_update = file.last_update();
        if timestamp <= last_update {
            return Err(UpdateError::NonMonotonicUpdate {
                timestamp,
                last_update,
            }
            .into());
        }
        let spec = file.spec().clone();
        self.check_values(&spec, values)?;

        let step = spec.step;
        let elapsed = timestamp - last_update;
        let ds_count = spec.data_sources.len();

        let mut states: Vec<DsState> = (0..ds_count).map(|ds| file.ds_state(ds)).collect();
        let mut rates = vec![f64::NAN; ds_count];
        for (pos, &ds) in self.inputs.iter().enumerate() {
            let def = &spec.data_sources[ds];
            let Some(params) = def.kind.input() else {
                continue;
            };
            let raw = values[pos];
            let rate = input_rate(&def.kind, params, states[ds].last_ds, raw, elapsed);
            if params.in_range(rate) {
                rates[ds] = rate;
            } else if !rate.is_nan() {
                tracing::debug!(data_source = %def.name, rate, "rate outside valid range");
            }
            if let DataSourceKind::Counter(_) = def.kind
                && raw < states[ds].last_ds
            {
                tracing::warn!(
                    data_source = %def.name,
                    previous = states[ds].last_ds,
                    raw,
                    "counter wrapped"
                );
            }
            states[ds].last_ds = raw;
        }

        let boundary = last_update - last_update % step + step;
        if timestamp < boundary {
            self.accumulate(&mut states, &rates, elapsed);
            self.store(file, &states, timestamp);
            return Ok(());
        }

        // Close the PDP that was open at the last update.
        self.accumulate(&mut states, &rates, boundary - last_update);
        let mut head = vec![f64::NAN; ds_count];
        for &ds in &self.inputs {
            let Some(params) = spec.data_sources[ds].kind.input() else {
                continue;
            };
            head[ds] = close_pdp(&states[ds], params, step);
            states[ds].scratch = 0.0;
            states[ds].unknown_sec = 0;
        }
        self.compute(&mut head);
        consolidate::absorb_run(file, &head, 1, boundary);

        let last_boundary = timestamp - timestamp % step;
        let full = (last_boundary - boundary) / step;
        if full > 0 {
            let mut run = rates.clone();
            self.compute(&mut run);
            consolidate::absorb_run(file, &run, full, boundary + step);
        }

        self.accumulate(&mut states, &rates, timestamp - last_boundary);
        self.store(file, &states, timestamp);
        Ok(())
    }

    /// Replays a cache batch in order.
    ///
    /// Entries not newer than the archive's last update as it stood when the
    /// flush began were overtaken by a direct update and fail with
    /// [`UpdateError::StaleUpdate`]. Entries before a failure stay applied.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered.
    pub(crate) fn flush(&self, file: &mut RrdFile, batch: Vec<(u64, Vec<f64>)>) -> Result<usize> {
        let snapshot = file.last_update();
        tracing::debug!(path = file.path(), entries = batch.len(), "flushing cached updates");

        let mut applied = 0;
        for (timestamp, values) in batch {
            if timestamp <= snapshot {
                return Err(UpdateError::StaleUpdate {
                    timestamp,
                    last_update: snapshot,
                }
                .into());
            }
            self.apply(file, timestamp, &values)?;
            applied += 1;
        }
        Ok(applied)
    }

    #[allow(clippy::cast_precision_loss)]
    fn accumulate(&self, states: &mut [DsState], rates: &[f64], seconds: u64) {
        if seconds == 0 {
            return;
        }
        for &ds in &self.inputs {
            let rate = rates[ds];
            if rate.is_nan() {
                states[ds].unknown_sec += seconds;
            } else {
                states[ds].scratch += rate * seconds as f64;
            }
        }
    }

    fn store(&self, file: &mut RrdFile, states: &[DsState], timestamp: u64) {
        for &ds in &self.inputs {
            file.set_ds_state(ds, states[ds]);
        }
        file.set_last_update(timestamp);
    }

    /// Fills in COMPUTE values of a PDP vector from the input values.
    fn compute(&self, pdps: &mut [f64]) {
        let mut stack = Vec::new();
        for (ds, expr) in &self.computes {
            let value = expr.evaluate(
                RowContext::default(),
                |name| self.index.get(name).map_or(f64::NAN, |&i| pdps[i]),
                &mut stack,
            );
            pdps[*ds] = value;
        }
    }
}

/// Converts a raw reading into the rate it contributes over `elapsed` seconds.
#[allow(clippy::cast_precision_loss)]
fn input_rate(kind: &DataSourceKind, params: &InputParams, last_ds: f64, raw: f64, elapsed: u64) -> f64 {
    if raw.is_nan() || elapsed > params.heartbeat {
        return f64::NAN;
    }
    let seconds = elapsed as f64;
    match kind {
        DataSourceKind::Gauge(_) => raw,
        DataSourceKind::Counter(_) => {
            let mut delta = raw - last_ds;
            if delta < 0.0 {
                delta += WRAP_32;
                if delta < 0.0 {
                    delta += WRAP_64_REST;
                }
            }
            delta / seconds
        }
        DataSourceKind::Derive(_) => (raw - last_ds) / seconds,
        DataSourceKind::Absolute(_) => raw / seconds,
        DataSourceKind::Compute { .. } => f64::NAN,
    }
}

/// Value of a completed PDP from its accumulated state.
#[allow(clippy::cast_precision_loss)]
fn close_pdp(state: &DsState, params: &InputParams, step: u64) -> f64 {
    let known = step.saturating_sub(state.unknown_sec);
    if state.unknown_sec > params.heartbeat || known == 0 {
        return f64::NAN;
    }
    let value = state.scratch / known as f64;
    if params.in_range(value) { value } else { f64::NAN }
}
