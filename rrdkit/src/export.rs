//! Export: evaluating definitions over one or more archives.
//!
//! A request is a set of named definitions:
//!
//! - **DEF** reads one data source of one archive with a consolidation function,
//! - **CDEF** derives a series row by row with an RPN [`Expression`],
//! - **VDEF** reduces a series to a [`Scalar`] with a [`Reduction`].
//!
//! Definitions may refer to each other in any order; they are resolved in
//! dependency order and rejected before any archive is read if a name is
//! undefined or the references form a cycle.
//!
//! # Resolution
//!
//! ```text
//! validate graph ─► fetch DEFs ─► common grid ─► re-consolidate DEFs ─► CDEFs/VDEFs
//! ```
//!
//! The common grid's step is the least common multiple of the steps of the
//! archives the DEFs read from (rounded up to a multiple of the requested
//! step, if coarser). Each DEF is folded onto that grid with its own
//! consolidation function.
//!
//! # Example
//!
//! ```rust,no_run
//! use rrdkit::{ConsolidationFn, Exporter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let result = Exporter::new(1_700_000_000, 1_700_086_400)
//!     .def("in", "traffic.rrd", "in", ConsolidationFn::Average)
//!     .def("out", "traffic.rrd", "out", ConsolidationFn::Average)
//!     .cdef("total", "in,out,+,8,*")
//!     .vdef("peak", "total,MAXIMUM")
//!     .column("total", "bits per second")
//!     .xport()?;
//! println!("{} rows of {}s, peak {}", result.rows(), result.step, result.scalars["peak"].value);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::archive::Rrd;
use crate::error::{ExprError, QueryError, Result};
use crate::query::{read_archive, select_archive};
use crate::rpn::{Expression, Reduction, Scalar, is_identifier};
use crate::schema::ConsolidationFn;

/// A series read from an archive.
#[derive(Debug, Clone, PartialEq)]
pub struct Def {
    /// Name the series is known by.
    pub name: String,
    /// Archive file.
    pub path: PathBuf,
    /// Data source inside the archive.
    pub data_source: String,
    /// Consolidation function to fetch and re-consolidate with.
    pub cf: ConsolidationFn,
}

/// Named DEF, CDEF and VDEF definitions shared by export and graph requests.
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    defs: Vec<Def>,
    cdefs: Vec<(String, String)>,
    vdefs: Vec<(String, String)>,
}

/// A validated node of the definition graph.
#[derive(Debug)]
enum Node {
    Def(usize),
    Cdef(Expression),
    Vdef(Reduction),
}

/// Definitions in dependency order.
#[derive(Debug)]
pub(crate) struct Plan {
    order: Vec<(String, Node)>,
    series: HashSet<String>,
    scalars: HashSet<String>,
}

impl Plan {
    /// Returns true if `name` resolves to a series (DEF or CDEF).
    pub(crate) fn is_series(&self, name: &str) -> bool {
        self.series.contains(name)
    }

    /// Returns true if `name` resolves to a scalar (VDEF).
    pub(crate) fn is_scalar(&self, name: &str) -> bool {
        self.scalars.contains(name)
    }
}

/// Series and scalars on a common time grid.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Resolved {
    pub start: u64,
    pub end: u64,
    pub step: u64,
    pub rows: usize,
    pub series: BTreeMap<String, Vec<f64>>,
    pub scalars: BTreeMap<String, Scalar>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl Definitions {
    /// Creates an empty set of definitions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a DEF.
    pub fn def<P: AsRef<Path>>(&mut self, name: &str, path: P, data_source: &str, cf: ConsolidationFn) {
        self.defs.push(Def {
            name: name.to_string(),
            path: path.as_ref().to_path_buf(),
            data_source: data_source.to_string(),
            cf,
        });
    }

    /// Adds a CDEF.
    pub fn cdef(&mut self, name: &str, expression: &str) {
        self.cdefs.push((name.to_string(), expression.to_string()));
    }

    /// Adds a VDEF (`series,REDUCER` or `series,p,PERCENT`).
    pub fn vdef(&mut self, name: &str, expression: &str) {
        self.vdefs.push((name.to_string(), expression.to_string()));
    }

    /// DEFs in insertion order.
    pub fn defs(&self) -> &[Def] {
        &self.defs
    }

    /// Parses every expression and orders the graph. Reads no archive.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::InvalidExpression`] for malformed expressions,
    /// invalid or duplicate names, undefined references, or a VDEF over a
    /// scalar; [`ExprError::CyclicExpression`] if references form a cycle.
    pub(crate) fn plan(&self) -> std::result::Result<Plan, ExprError> {
        let mut nodes: Vec<(String, Node)> = Vec::new();
        let mut series = HashSet::new();
        let mut scalars = HashSet::new();

        for (i, def) in self.defs.iter().enumerate() {
            nodes.push((def.name.clone(), Node::Def(i)));
            series.insert(def.name.clone());
        }
        for (name, text) in &self.cdefs {
            nodes.push((name.clone(), Node::Cdef(Expression::parse(text)?)));
            series.insert(name.clone());
        }
        for (name, text) in &self.vdefs {
            nodes.push((name.clone(), Node::Vdef(Reduction::parse(text)?)));
            scalars.insert(name.clone());
        }

        let mut seen = HashSet::new();
        for (name, _) in &nodes {
            if !is_identifier(name) {
                return Err(ExprError::invalid(name, "invalid definition name"));
            }
            if !seen.insert(name.as_str()) {
                return Err(ExprError::invalid(name, "duplicate definition name"));
            }
        }

        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, node) in &nodes {
            let deps: Vec<&str> = match node {
                Node::Def(_) => Vec::new(),
                Node::Cdef(expr) => {
                    let deps: Vec<&str> = expr.references().collect();
                    if let Some(missing) = deps.iter().find(|d| !seen.contains(*d)) {
                        return Err(ExprError::invalid(
                            expr.as_str(),
                            format!("undefined name '{missing}'"),
                        ));
                    }
                    deps
                }
                Node::Vdef(reduction) => {
                    let target = reduction.series();
                    if !series.contains(target) {
                        return Err(ExprError::invalid(
                            reduction.as_str(),
                            format!("'{target}' is not a defined series"),
                        ));
                    }
                    vec![target]
                }
            };
            edges.insert(name.as_str(), deps);
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack = Vec::new();
        let mut sorted = Vec::with_capacity(nodes.len());
        for (name, _) in &nodes {
            visit(name, &edges, &mut marks, &mut stack, &mut sorted)?;
        }

        let position: HashMap<String, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, name)| ((*name).to_string(), i))
            .collect();
        nodes.sort_by_key(|(name, _)| position[name]);

        Ok(Plan {
            order: nodes,
            series,
            scalars,
        })
    }

    /// Fetches every DEF and evaluates the graph over `(start, end]`.
    ///
    /// `step` is the finest resolution wanted (0 for the finest available).
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Definitions::plan`], plus
    /// [`QueryError::InvalidTimeRange`] if `start >= end`,
    /// [`QueryError::UnknownDataSource`] if a DEF names a missing data source,
    /// and any error opening or fetching an archive.
    pub(crate) fn resolve(&self, plan: &Plan, start: u64, end: u64, step: u64) -> Result<Resolved> {
        if start >= end {
            return Err(QueryError::InvalidTimeRange { start, end }.into());
        }
        if self.defs.is_empty() {
            return Err(ExprError::invalid("", "at least one DEF is required").into());
        }

        // Each distinct archive is opened once.
        let mut archives: HashMap<&Path, Rrd> = HashMap::new();
        for def in &self.defs {
            if !archives.contains_key(def.path.as_path()) {
                archives.insert(def.path.as_path(), Rrd::open(&def.path)?);
            }
        }

        let mut selected = Vec::with_capacity(self.defs.len());
        for def in &self.defs {
            let rrd = &archives[def.path.as_path()];
            let column = rrd
                .data_source_names()
                .position(|name| name == def.data_source)
                .ok_or_else(|| QueryError::UnknownDataSource {
                    path: def.path.display().to_string(),
                    name: def.data_source.clone(),
                })?;
            let rra = select_archive(rrd.file(), def.cf, start, step)?;
            let rra_step = rrd.step() * rrd.spec().archives[rra].steps();
            selected.push((column, rra, rra_step));
        }

        let mut common = selected.iter().fold(1, |acc, (_, _, s)| lcm(acc, *s));
        if step > common {
            common = step.div_ceil(common) * common;
        }
        let start = start - start % common;
        let end = end.div_ceil(common) * common;
        #[allow(clippy::cast_possible_truncation)]
        let rows = ((end - start) / common) as usize;

        let mut series: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (def, (column, rra, rra_step)) in self.defs.iter().zip(&selected) {
            let rrd = &archives[def.path.as_path()];
            let fetched = read_archive(rrd.file(), *rra, def.cf, start, end);
            #[allow(clippy::cast_possible_truncation)]
            let factor = (common / rra_step) as usize;
            let values: Vec<f64> = (0..rows)
                .map(|row| {
                    let chunk: Vec<f64> = (row * factor..(row + 1) * factor)
                        .map(|src| fetched.value_at(src, *column))
                        .collect();
                    if factor == 1 { chunk[0] } else { def.cf.apply(&chunk) }
                })
                .collect();
            series.insert(def.name.clone(), values);
        }

        let mut scalars: BTreeMap<String, Scalar> = BTreeMap::new();
        for (name, node) in &plan.order {
            match node {
                Node::Def(_) => {}
                Node::Cdef(expr) => {
                    let values = expr.evaluate_series(start, common, rows, |reference, row| {
                        series
                            .get(reference)
                            .map(|s| s[row])
                            .or_else(|| scalars.get(reference).map(|s| s.value))
                            .unwrap_or(f64::NAN)
                    });
                    series.insert(name.clone(), values);
                }
                Node::Vdef(reduction) => {
                    let values = series
                        .get(reduction.series())
                        .map_or(&[][..], Vec::as_slice);
                    let scalar = reduction.reduce(values, start, common);
                    scalars.insert(name.clone(), scalar);
                }
            }
        }

        tracing::debug!(start, end, step = common, rows, "resolved definitions");
        Ok(Resolved {
            start,
            end,
            step: common,
            rows,
            series,
            scalars,
        })
    }
}

fn visit<'a>(
    name: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    sorted: &mut Vec<&'a str>,
) -> std::result::Result<(), ExprError> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let from = stack.iter().position(|n| *n == name).unwrap_or(0);
            let mut path: Vec<String> = stack[from..].iter().map(|n| (*n).to_string()).collect();
            path.push(name.to_string());
            return Err(ExprError::CyclicExpression { path });
        }
        None => {}
    }

    marks.insert(name, Mark::Visiting);
    stack.push(name);
    for dep in edges.get(name).into_iter().flatten() {
        visit(*dep, edges, marks, stack, sorted)?;
    }
    stack.pop();
    marks.insert(name, Mark::Done);
    sorted.push(name);
    Ok(())
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// Result of an export.
#[derive(Debug, Clone, PartialEq)]
pub struct XportResult {
    /// Aligned window start; the first row ends one step later.
    pub start: u64,
    /// Aligned window end.
    pub end: u64,
    /// Seconds per row.
    pub step: u64,
    /// One legend per column.
    pub legends: Vec<String>,
    /// Row-major values.
    pub data: Vec<f64>,
    /// Every VDEF result by name.
    pub scalars: BTreeMap<String, Scalar>,
}

impl XportResult {
    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.data.len().checked_div(self.legends.len()).unwrap_or(0)
    }

    /// End timestamp of row `row`.
    pub fn timestamp(&self, row: usize) -> u64 {
        self.start + (row as u64 + 1) * self.step
    }

    /// Value of `column` in row `row`.
    pub fn value_at(&self, row: usize, column: usize) -> f64 {
        self.data[row * self.legends.len() + column]
    }

    /// Iterates `(timestamp, values)` per row.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[f64])> + '_ {
        let width = self.legends.len();
        (0..self.rows()).map(move |row| (self.timestamp(row), &self.data[row * width..(row + 1) * width]))
    }
}

/// Builder and entry point for exports.
#[derive(Debug, Clone)]
pub struct Exporter {
    start: u64,
    end: u64,
    step: u64,
    definitions: Definitions,
    columns: Vec<(String, String)>,
}

impl Exporter {
    /// Starts an export of `(start, end]`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            step: 0,
            definitions: Definitions::new(),
            columns: Vec::new(),
        }
    }

    /// Starts from existing definitions.
    pub fn with_definitions(start: u64, end: u64, definitions: Definitions) -> Self {
        Self {
            definitions,
            ..Self::new(start, end)
        }
    }

    /// Sets the finest resolution wanted, in seconds.
    #[must_use]
    pub fn step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    /// Adds a DEF.
    #[must_use]
    pub fn def<P: AsRef<Path>>(mut self, name: &str, path: P, data_source: &str, cf: ConsolidationFn) -> Self {
        self.definitions.def(name, path, data_source, cf);
        self
    }

    /// Adds a CDEF.
    #[must_use]
    pub fn cdef(mut self, name: &str, expression: &str) -> Self {
        self.definitions.cdef(name, expression);
        self
    }

    /// Adds a VDEF.
    #[must_use]
    pub fn vdef(mut self, name: &str, expression: &str) -> Self {
        self.definitions.vdef(name, expression);
        self
    }

    /// Adds an output column for the series `name`.
    #[must_use]
    pub fn column(mut self, name: &str, legend: &str) -> Self {
        self.columns.push((name.to_string(), legend.to_string()));
        self
    }

    /// Runs the export.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError`] if the definitions are invalid or a column does
    /// not name a DEF or CDEF (checked before any archive is read), or the
    /// errors of fetching the DEFs.
    pub fn xport(&self) -> Result<XportResult> {
        let plan = self.definitions.plan()?;
        if self.columns.is_empty() {
            return Err(ExprError::invalid("", "no columns to export").into());
        }
        if let Some((name, _)) = self.columns.iter().find(|(name, _)| !plan.is_series(name)) {
            return Err(ExprError::invalid(name, "exported column is not a defined series").into());
        }

        let resolved = self.definitions.resolve(&plan, self.start, self.end, self.step)?;

        let mut data = Vec::with_capacity(resolved.rows * self.columns.len());
        for row in 0..resolved.rows {
            for (name, _) in &self.columns {
                data.push(resolved.series.get(name).map_or(f64::NAN, |s| s[row]));
            }
        }

        Ok(XportResult {
            start: resolved.start,
            end: resolved.end,
            step: resolved.step,
            legends: self.columns.iter().map(|(_, legend)| legend.clone()).collect(),
            data,
            scalars: resolved.scalars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RrdError;

    #[test]
    fn test_plan_orders_forward_references() {
        let mut defs = Definitions::new();
        defs.cdef("c", "b,2,*");
        defs.cdef("b", "a,1,+");
        defs.def("a", "/nonexistent.rrd", "x", ConsolidationFn::Average);
        defs.vdef("top", "c,MAXIMUM");

        let plan = defs.plan().unwrap();
        let order: Vec<&str> = plan.order.iter().map(|(n, _)| n.as_str()).collect();
        let pos = |n: &str| order.iter().position(|o| *o == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert!(pos("c") < pos("top"));
        assert!(plan.is_series("c"));
        assert!(plan.is_scalar("top"));
    }

    #[test]
    fn test_plan_rejects_cycles() {
        let mut defs = Definitions::new();
        defs.def("a", "/nonexistent.rrd", "x", ConsolidationFn::Average);
        defs.cdef("x1", "x2,a,+");
        defs.cdef("x2", "x1,1,+");

        let err = defs.plan().unwrap_err();
        let ExprError::CyclicExpression { path } = err else {
            panic!("expected a cycle, got {err}");
        };
        assert_eq!(path, vec!["x1", "x2", "x1"]);
    }

    #[test]
    fn test_plan_rejects_undefined_names() {
        let mut defs = Definitions::new();
        defs.cdef("c", "missing,1,+");
        assert!(defs.plan().unwrap_err().to_string().contains("missing"));

        let mut defs = Definitions::new();
        defs.def("a", "/nonexistent.rrd", "x", ConsolidationFn::Average);
        defs.vdef("v", "a,MAXIMUM");
        defs.vdef("w", "v,MINIMUM");
        assert!(defs.plan().is_err());

        let mut defs = Definitions::new();
        defs.def("a", "/nonexistent.rrd", "x", ConsolidationFn::Average);
        defs.def("a", "/nonexistent.rrd", "y", ConsolidationFn::Average);
        assert!(defs.plan().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_validation_precedes_io() {
        // The archive does not exist, so any I/O would fail with a file error.
        let err = Exporter::new(0, 100)
            .def("a", "/nonexistent/archive.rrd", "x", ConsolidationFn::Average)
            .cdef("b", "a,nope,+")
            .column("b", "b")
            .xport()
            .unwrap_err();
        assert!(matches!(err, RrdError::Expr(ExprError::InvalidExpression { .. })));

        let err = Exporter::new(0, 100)
            .def("a", "/nonexistent/archive.rrd", "x", ConsolidationFn::Average)
            .vdef("v", "a,LAST")
            .column("v", "scalar")
            .xport()
            .unwrap_err();
        assert!(matches!(err, RrdError::Expr(_)));
    }

    #[test]
    fn test_lcm() {
        assert_eq!(lcm(1, 300), 300);
        assert_eq!(lcm(300, 3600), 3600);
        assert_eq!(lcm(40, 60), 120);
    }
}
