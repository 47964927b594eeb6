//! # rrdkit
//!
//! Round-robin time-series archives in a single memory-mapped file.
//!
//! rrdkit keeps fixed-size histories of periodic measurements in the style of
//! rrdtool: readings are normalized into primary data points at a fixed base
//! step, folded into consolidated rows for every archive, and stored in ring
//! buffers whose size never changes after creation.
//!
//! ## Key Properties
//!
//! - Bounded storage: file size is fixed by the definitions, not by data volume
//! - GAUGE, COUNTER, DERIVE, ABSOLUTE and computed data sources
//! - AVERAGE, MIN, MAX and LAST consolidation with an xfiles factor
//! - Holt-Winters forecasting archives (HWPREDICT / DEVPREDICT)
//! - RPN expressions for derived series (CDEF) and reductions (VDEF)
//! - No background threads; a handle is mutated through `&mut`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rrdkit::{ConsolidationFn, Creator, DataSourceDef, ArchiveDef};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 5 minute step, one day of 5 minute averages.
//! let mut rrd = Creator::new("traffic.rrd", 1_700_000_000, 300)
//!     .data_source(DataSourceDef::counter("in", 600, Some(0.0), None))
//!     .archive(ArchiveDef::consolidated(ConsolidationFn::Average, 0.5, 1, 288))
//!     .create(false)?;
//!
//! rrd.update(1_700_000_300, &[12_345.0])?;
//! rrd.update(1_700_000_600, &[15_345.0])?;
//!
//! let result = rrd.fetch(ConsolidationFn::Average, 1_700_000_000, 1_700_000_600, 300)?;
//! for (timestamp, values) in result.iter() {
//!     println!("{timestamp}: {values:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Rrd`]: Open archive handle; update, fetch, info, dump
//! - [`Creator`]: Builds an [`ArchiveSpec`] and writes a new archive
//! - [`Exporter`]: Joins series from several archives on one time grid
//! - [`Grapher`]: Resolves a graph request for a [`RenderBackend`]
//!
//! ## Modules
//!
//! - [`archive`]: The archive handle
//! - [`create`]: Archive creation
//! - [`schema`]: Data source and archive definitions
//! - [`query`]: Fetch results and archive selection
//! - [`info`]: Metadata map
//! - [`dump`]: Row-by-row dump
//! - [`rpn`]: Expression evaluator
//! - [`export`]: DEF/CDEF/VDEF resolution and export
//! - [`graph`]: Graph requests and the rendering seam
//! - [`error`]: Error types

pub mod archive;
pub mod create;
pub mod dump;
pub mod error;
pub mod export;
pub mod graph;
pub mod info;
pub mod query;
pub mod rpn;
pub mod schema;

mod consolidate;
mod file;
mod ring;
mod update;

// Re-export primary API types at crate root for convenience.
pub use archive::Rrd;
pub use create::Creator;
pub use dump::{Dump, DumpRow};
pub use error::{Result, RrdError};
pub use export::{Definitions, Exporter, XportResult};
pub use graph::{Directive, Grapher, RenderBackend, RenderOutput, Scene};
pub use info::InfoValue;
pub use query::FetchResult;
pub use rpn::{Expression, Reduction, Scalar};
pub use schema::{ArchiveDef, ArchiveSpec, ConsolidationFn, DataSourceDef, DataSourceKind};
