//! Graph requests and the rendering collaborator seam.
//!
//! The engine never draws. A [`Grapher`] resolves its definitions exactly as
//! an export does, then hands a [`Scene`] (canvas, labels, resolved series
//! and scalars, drawing directives and the value range) to a
//! [`RenderBackend`]. Whatever the backend returns is passed back unchanged.
//!
//! ```rust,no_run
//! use rrdkit::ConsolidationFn;
//! use rrdkit::graph::{Grapher, RenderBackend, RenderOutput, Scene};
//! use rrdkit::error::RenderError;
//!
//! struct Null;
//!
//! impl RenderBackend for Null {
//!     fn render(&mut self, _scene: &Scene<'_>) -> Result<RenderOutput, RenderError> {
//!         Ok(RenderOutput { info: Default::default(), image: Vec::new() })
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let _output = Grapher::new(1_700_000_000, 1_700_086_400)
//!     .title("Traffic")
//!     .def("in", "traffic.rrd", "in", ConsolidationFn::Average)
//!     .line(1.0, "in", "#00ff00", Some("inbound"))
//!     .graph(&mut Null)?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{RenderError, Result};
use crate::export::Definitions;
use crate::info::InfoValue;
use crate::rpn::Scalar;
use crate::schema::ConsolidationFn;

/// A drawing or printing instruction, in the order given.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Draws series `name` as a line.
    Line {
        /// Stroke width in pixels.
        width: f64,
        /// Series to draw.
        name: String,
        /// Color, e.g. `#ff0000`.
        color: String,
        /// Legend text.
        legend: Option<String>,
    },
    /// Fills the area under series `name`.
    Area {
        /// Series to draw.
        name: String,
        /// Fill color.
        color: String,
        /// Legend text.
        legend: Option<String>,
    },
    /// Reports scalar `name` in the render metadata using a printf-style format.
    Print {
        /// Scalar to print.
        name: String,
        /// Value format.
        format: String,
    },
    /// Prints scalar `name` on the image using a printf-style format.
    GPrint {
        /// Scalar to print.
        name: String,
        /// Value format.
        format: String,
    },
    /// Reports the timestamp of scalar `name` with a strftime-style format.
    PrintTime {
        /// Scalar whose timestamp is printed.
        name: String,
        /// Time format.
        format: String,
    },
    /// Prints the timestamp of scalar `name` on the image with a strftime-style format.
    GPrintTime {
        /// Scalar whose timestamp is printed.
        name: String,
        /// Time format.
        format: String,
    },
}

impl Directive {
    /// Name the directive refers to.
    pub fn name(&self) -> &str {
        match self {
            Self::Line { name, .. }
            | Self::Area { name, .. }
            | Self::Print { name, .. }
            | Self::GPrint { name, .. }
            | Self::PrintTime { name, .. }
            | Self::GPrintTime { name, .. } => name,
        }
    }

    /// Returns true if the directive draws a series rather than a scalar.
    pub fn draws_series(&self) -> bool {
        matches!(self, Self::Line { .. } | Self::Area { .. })
    }
}

/// Canvas size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canvas {
    /// Width of the plotting area.
    pub width: u32,
    /// Height of the plotting area.
    pub height: u32,
}

impl Default for Canvas {
    fn default() -> Self {
        Self {
            width: 400,
            height: 100,
        }
    }
}

/// Time grid shared by every series of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Grid start; the first row ends one step later.
    pub start: u64,
    /// Grid end.
    pub end: u64,
    /// Seconds per row.
    pub step: u64,
}

/// Everything a backend needs to draw one graph.
#[derive(Debug, Clone, Copy)]
pub struct Scene<'a> {
    /// Requested canvas.
    pub canvas: Canvas,
    /// Title, if any.
    pub title: Option<&'a str>,
    /// Vertical axis label, if any.
    pub vertical_label: Option<&'a str>,
    /// Watermark text, if any.
    pub watermark: Option<&'a str>,
    /// Time grid of the series.
    pub window: Window,
    /// Every DEF and CDEF by name.
    pub series: &'a BTreeMap<String, Vec<f64>>,
    /// Every VDEF by name.
    pub scalars: &'a BTreeMap<String, Scalar>,
    /// Directives in request order.
    pub directives: &'a [Directive],
    /// Smallest and largest known value over the drawn series, if any is known.
    pub value_range: Option<(f64, f64)>,
}

/// What a backend produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderOutput {
    /// Backend metadata (image size, printed values, ...).
    pub info: BTreeMap<String, InfoValue>,
    /// Encoded image.
    pub image: Vec<u8>,
}

/// An external renderer.
pub trait RenderBackend {
    /// Draws `scene`.
    ///
    /// # Errors
    ///
    /// Returns a [`RenderError`] if the image cannot be produced.
    fn render(&mut self, scene: &Scene<'_>) -> std::result::Result<RenderOutput, RenderError>;
}

/// Builder and entry point for graph requests.
#[derive(Debug, Clone)]
pub struct Grapher {
    start: u64,
    end: u64,
    step: u64,
    canvas: Canvas,
    title: Option<String>,
    vertical_label: Option<String>,
    watermark: Option<String>,
    definitions: Definitions,
    directives: Vec<Directive>,
}

impl Grapher {
    /// Starts a graph of `(start, end]`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            step: 0,
            canvas: Canvas::default(),
            title: None,
            vertical_label: None,
            watermark: None,
            definitions: Definitions::new(),
            directives: Vec::new(),
        }
    }

    /// Sets the finest resolution wanted, in seconds.
    #[must_use]
    pub fn step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    /// Sets the canvas size.
    #[must_use]
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.canvas = Canvas { width, height };
        self
    }

    /// Sets the title.
    #[must_use]
    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    /// Sets the vertical axis label.
    #[must_use]
    pub fn vertical_label(mut self, label: &str) -> Self {
        self.vertical_label = Some(label.to_string());
        self
    }

    /// Sets the watermark.
    #[must_use]
    pub fn watermark(mut self, text: &str) -> Self {
        self.watermark = Some(text.to_string());
        self
    }

    /// Replaces the definitions.
    #[must_use]
    pub fn definitions(mut self, definitions: Definitions) -> Self {
        self.definitions = definitions;
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

    /// Adds a directive.
    #[must_use]
    pub fn directive(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }

    /// Adds a LINE directive.
    #[must_use]
    pub fn line(self, width: f64, name: &str, color: &str, legend: Option<&str>) -> Self {
        self.directive(Directive::Line {
            width,
            name: name.to_string(),
            color: color.to_string(),
            legend: legend.map(str::to_string),
        })
    }

    /// Adds an AREA directive.
    #[must_use]
    pub fn area(self, name: &str, color: &str, legend: Option<&str>) -> Self {
        self.directive(Directive::Area {
            name: name.to_string(),
            color: color.to_string(),
            legend: legend.map(str::to_string),
        })
    }

    /// Adds a GPRINT directive.
    #[must_use]
    pub fn gprint(self, name: &str, format: &str) -> Self {
        self.directive(Directive::GPrint {
            name: name.to_string(),
            format: format.to_string(),
        })
    }

    /// Adds a PRINT directive.
    #[must_use]
    pub fn print(self, name: &str, format: &str) -> Self {
        self.directive(Directive::Print {
            name: name.to_string(),
            format: format.to_string(),
        })
    }

    /// Resolves the definitions and renders them with `backend`.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError`](crate::error::ExprError) for invalid definitions
    /// and [`RenderError::UndefinedName`] for a directive naming an unknown
    /// series or scalar, both before any archive is read. Fetch errors and
    /// backend failures are returned as they occur.
    pub fn graph<B: RenderBackend + ?Sized>(&self, backend: &mut B) -> Result<RenderOutput> {
        let plan = self.definitions.plan()?;
        for directive in &self.directives {
            let name = directive.name();
            let defined = if directive.draws_series() {
                plan.is_series(name)
            } else {
                plan.is_scalar(name)
            };
            if !defined {
                return Err(RenderError::UndefinedName {
                    name: name.to_string(),
                }
                .into());
            }
        }

        let resolved = self.definitions.resolve(&plan, self.start, self.end, self.step)?;

        let value_range = self
            .directives
            .iter()
            .filter(|d| d.draws_series())
            .filter_map(|d| resolved.series.get(d.name()))
            .flatten()
            .filter(|v| v.is_finite())
            .fold(None, |range: Option<(f64, f64)>, &v| match range {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            });

        let scene = Scene {
            canvas: self.canvas,
            title: self.title.as_deref(),
            vertical_label: self.vertical_label.as_deref(),
            watermark: self.watermark.as_deref(),
            window: Window {
                start: resolved.start,
                end: resolved.end,
                step: resolved.step,
            },
            series: &resolved.series,
            scalars: &resolved.scalars,
            directives: &self.directives,
            value_range,
        };

        tracing::debug!(directives = self.directives.len(), rows = resolved.rows, "rendering graph");
        Ok(backend.render(&scene)?)
    }

    /// Renders like [`Grapher::graph`] and writes the image to `path`.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Grapher::graph`], or
    /// [`RenderError::WriteImage`] if the image cannot be written.
    pub fn save_graph<B, P>(&self, backend: &mut B, path: P) -> Result<RenderOutput>
    where
        B: RenderBackend + ?Sized,
        P: AsRef<Path>,
    {
        let output = self.graph(backend)?;
        let path = path.as_ref();
        fs::write(path, &output.image).map_err(|e| RenderError::WriteImage {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(output)
    }
}
