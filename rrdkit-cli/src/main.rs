//! CLI for rrdkit round-robin archives.
//!
//! Provides commands for creating, updating, inspecting and exporting
//! archives, using the rrdtool textual syntax for definitions.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use rrdkit::{ArchiveSpec, ConsolidationFn, Creator, Exporter, Rrd};
use tracing_subscriber::EnvFilter;

/// rrdkit: round-robin time-series archives.
#[derive(Parser)]
#[command(name = "rrdkit", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create a new archive from DS:/RRA: definitions or a JSON spec.
    Create {
        /// Path of the archive to create.
        path: PathBuf,

        /// Definitions such as "DS:in:COUNTER:600:0:U" or "RRA:AVERAGE:0.5:1:288".
        definitions: Vec<String>,

        /// Load the whole spec from a JSON file instead.
        #[arg(long, conflicts_with = "definitions")]
        spec: Option<PathBuf>,

        /// Start time ("now", "now-1d" or seconds since the epoch).
        #[arg(long, default_value = "now-10s")]
        start: String,

        /// Base step in seconds.
        #[arg(long, default_value = "300")]
        step: u64,

        /// Replace an existing archive.
        #[arg(long)]
        overwrite: bool,
    },

    /// Apply updates given as "timestamp:value[:value...]" ("N" = now, "U" = unknown).
    Update {
        /// Path of the archive.
        path: PathBuf,

        /// Updates in time order.
        #[arg(required = true)]
        updates: Vec<String>,

        /// Colon-separated data source names the values are for.
        #[arg(long)]
        template: Option<String>,

        /// Queue the updates and apply them in one flush.
        #[arg(long)]
        cache: bool,
    },

    /// Display archive metadata.
    Info {
        /// Path of the archive.
        path: PathBuf,

        /// Print JSON instead of "key = value" lines.
        #[arg(long)]
        json: bool,
    },

    /// Fetch consolidated rows from an archive.
    Fetch {
        /// Path of the archive.
        path: PathBuf,

        /// Consolidation function (AVERAGE, MIN, MAX, LAST, HWPREDICT, DEVPREDICT).
        cf: ConsolidationFn,

        /// Window start ("now", "now-1d" or seconds since the epoch).
        #[arg(long, default_value = "now-1d")]
        start: String,

        /// Window end.
        #[arg(long, default_value = "now")]
        end: String,

        /// Preferred seconds per row (0 = base step).
        #[arg(long, default_value = "0")]
        resolution: u64,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Print every row of the first archive using a consolidation function.
    Dump {
        /// Path of the archive.
        path: PathBuf,

        /// Consolidation function.
        cf: ConsolidationFn,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Export DEF/CDEF/VDEF results on a common time grid.
    Xport {
        /// "DEF:name=path:ds:CF", "CDEF:name=expr", "VDEF:name=expr" or "XPORT:name[:legend]".
        #[arg(required = true)]
        definitions: Vec<String>,

        /// Window start.
        #[arg(long, default_value = "now-1d")]
        start: String,

        /// Window end.
        #[arg(long, default_value = "now")]
        end: String,

        /// Minimum seconds per row.
        #[arg(long, default_value = "0")]
        step: u64,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },
}

/// Output format for row data.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON document.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Create {
            path,
            definitions,
            spec,
            start,
            step,
            overwrite,
        } => cmd_create(&path, &definitions, spec.as_deref(), &start, step, overwrite),
        Commands::Update {
            path,
            updates,
            template,
            cache,
        } => cmd_update(&path, &updates, template.as_deref(), cache),
        Commands::Info { path, json } => cmd_info(&path, json),
        Commands::Fetch {
            path,
            cf,
            start,
            end,
            resolution,
            format,
        } => cmd_fetch(&path, cf, &start, &end, resolution, &format),
        Commands::Dump { path, cf, format } => cmd_dump(&path, cf, &format),
        Commands::Xport {
            definitions,
            start,
            end,
            step,
            format,
        } => cmd_xport(&definitions, &start, &end, step, &format),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `rrdkit create`.
fn cmd_create(
    path: &Path,
    definitions: &[String],
    spec_path: Option<&Path>,
    start: &str,
    step: u64,
    overwrite: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let creator = if let Some(spec_path) = spec_path {
        let spec: ArchiveSpec = serde_json::from_str(&std::fs::read_to_string(spec_path)?)?;
        Creator::from_spec(path, spec)
    } else {
        let mut creator = Creator::new(path, parse_time(start, now()?)?, step);
        for definition in definitions {
            creator = if definition.starts_with("DS:") {
                creator.parse_data_source(definition)?
            } else if definition.starts_with("RRA:") {
                creator.parse_archive(definition)?
            } else {
                return Err(format!("'{definition}' is neither a DS: nor an RRA: definition").into());
            };
        }
        creator
    };

    let rrd = creator.create(overwrite)?;
    println!(
        "Created {} (step {}s, {} data sources, {} archives)",
        rrd.path(),
        rrd.step(),
        rrd.spec().data_sources.len(),
        rrd.spec().archives.len()
    );
    Ok(())
}

/// Implements `rrdkit update`.
fn cmd_update(
    path: &Path,
    updates: &[String],
    template: Option<&str>,
    cache: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut rrd = Rrd::open(path)?;
    let names: Option<Vec<&str>> = template.map(|t| t.split(':').collect());
    let now = now()?;

    for update in updates {
        let (timestamp, values) = parse_update(update, now)?;
        match (&names, cache) {
            (Some(names), false) => rrd.update_with_template(timestamp, names, &values)?,
            (None, false) => rrd.update(timestamp, &values)?,
            (Some(_), true) => return Err("--template cannot be combined with --cache".into()),
            (None, true) => rrd.cache_update(timestamp, values)?,
        }
    }

    if cache {
        let applied = rrd.flush_cache()?;
        tracing::info!(applied, "flushed cached updates");
    }
    rrd.sync()?;
    Ok(())
}

/// Implements `rrdkit info`.
fn cmd_info(path: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let rrd = Rrd::open(path)?;
    let info = rrd.info();

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        for (key, value) in &info {
            println!("{key} = {value}");
        }
    }
    Ok(())
}

/// Implements `rrdkit fetch`.
fn cmd_fetch(
    path: &Path,
    cf: ConsolidationFn,
    start: &str,
    end: &str,
    resolution: u64,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let rrd = Rrd::open(path)?;
    let now = now()?;
    let end = parse_time(end, now)?;
    let start = parse_time(start, end)?;

    let result = rrd.fetch(cf, start, end, resolution)?;
    print_rows(
        format,
        &result.ds_names,
        result.step,
        result.iter(),
        serde_json::json!({ "archive": result.archive_used }),
    )
}

/// Implements `rrdkit dump`.
fn cmd_dump(path: &Path, cf: ConsolidationFn, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let rrd = Rrd::open(path)?;
    let names: Vec<String> = rrd.data_source_names().map(str::to_string).collect();
    let dump = rrd.dump(cf)?;
    let step = dump.step();

    // A HWPREDICT archive stores a forecast and a deviation per data source.
    let names = if matches!(cf, ConsolidationFn::HwPredict | ConsolidationFn::DevPredict) {
        names
            .iter()
            .flat_map(|n| [format!("{n}_forecast"), format!("{n}_deviation")])
            .collect()
    } else {
        names
    };

    let rows: Vec<_> = dump.collect();
    print_rows(
        format,
        &names,
        step,
        rows.iter().map(|row| (row.timestamp, row.values.as_slice())),
        serde_json::json!({ "cf": cf.name() }),
    )
}

/// Implements `rrdkit xport`.
fn cmd_xport(
    definitions: &[String],
    start: &str,
    end: &str,
    step: u64,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let now = now()?;
    let end = parse_time(end, now)?;
    let start = parse_time(start, end)?;

    let mut exporter = Exporter::new(start, end).step(step);
    for definition in definitions {
        exporter = apply_definition(exporter, definition)?;
    }

    let result = exporter.xport()?;
    let scalars: serde_json::Map<String, serde_json::Value> = result
        .scalars
        .iter()
        .map(|(name, scalar)| {
            (
                name.clone(),
                serde_json::json!({ "value": scalar.value, "timestamp": scalar.timestamp }),
            )
        })
        .collect();
    print_rows(
        format,
        &result.legends,
        result.step,
        result.iter(),
        serde_json::json!({ "scalars": scalars }),
    )
}

/// Prints `(timestamp, values)` rows as CSV or JSON.
fn print_rows<'a>(
    format: &OutputFormat,
    columns: &[String],
    step: u64,
    rows: impl Iterator<Item = (u64, &'a [f64])>,
    extra: serde_json::Value,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Csv => {
            println!("# step={step}, {extra}");
            println!("timestamp,{}", columns.join(","));
            for (timestamp, values) in rows {
                let cells: Vec<String> = values
                    .iter()
                    .map(|v| if v.is_nan() { "U".to_string() } else { v.to_string() })
                    .collect();
                println!("{timestamp},{}", cells.join(","));
            }
        }
        OutputFormat::Json => {
            let data: Vec<serde_json::Value> = rows
                .map(|(timestamp, values)| {
                    serde_json::json!({
                        "timestamp": timestamp,
                        "values": values,
                    })
                })
                .collect();

            let output = serde_json::json!({
                "step": step,
                "columns": columns,
                "count": data.len(),
                "meta": extra,
                "data": data,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Adds one textual export definition to `exporter`.
fn apply_definition(exporter: Exporter, definition: &str) -> Result<Exporter, Box<dyn std::error::Error>> {
    let (kind, rest) = definition
        .split_once(':')
        .ok_or_else(|| format!("'{definition}' has no definition type"))?;

    match kind {
        "DEF" => {
            let (name, source) = rest
                .split_once('=')
                .ok_or_else(|| format!("'{definition}': expected DEF:name=path:ds:CF"))?;
            // The path may itself contain colons, so split from the right.
            let mut parts = source.rsplitn(3, ':');
            let (Some(cf), Some(ds), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(format!("'{definition}': expected DEF:name=path:ds:CF").into());
            };
            Ok(exporter.def(name, path, ds, cf.parse()?))
        }
        "CDEF" | "VDEF" => {
            let (name, expression) = rest
                .split_once('=')
                .ok_or_else(|| format!("'{definition}': expected {kind}:name=expression"))?;
            Ok(if kind == "CDEF" {
                exporter.cdef(name, expression)
            } else {
                exporter.vdef(name, expression)
            })
        }
        "XPORT" => {
            let (name, legend) = rest.split_once(':').unwrap_or((rest, rest));
            Ok(exporter.column(name, legend))
        }
        other => Err(format!("unknown definition type '{other}'").into()),
    }
}

/// Parses "timestamp:value[:value...]".
fn parse_update(update: &str, now: u64) -> Result<(u64, Vec<f64>), Box<dyn std::error::Error>> {
    let mut parts = update.split(':');
    let timestamp = match parts.next() {
        Some("N") => now,
        Some(ts) => ts.parse()?,
        None => return Err(format!("empty update '{update}'").into()),
    };

    let values = parts
        .map(|v| if v == "U" { Ok(f64::NAN) } else { v.parse::<f64>() })
        .collect::<Result<Vec<_>, _>>()?;
    if values.is_empty() {
        return Err(format!("update '{update}' carries no values").into());
    }
    Ok((timestamp, values))
}

/// Parses "now", "now-<duration>", "end-<duration>", "-<duration>" or epoch seconds.
///
/// Relative forms without "now" are taken relative to `reference`.
fn parse_time(s: &str, reference: u64) -> Result<u64, Box<dyn std::error::Error>> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix("now") {
        return offset(now()?, rest);
    }
    if let Some(rest) = s.strip_prefix("end") {
        return offset(reference, rest);
    }
    if s.starts_with('-') {
        return offset(reference, s);
    }
    Ok(s.parse()?)
}

fn offset(base: u64, rest: &str) -> Result<u64, Box<dyn std::error::Error>> {
    match rest.strip_prefix('-') {
        None if rest.is_empty() => Ok(base),
        Some(duration) => Ok(base.saturating_sub(parse_duration(duration)?)),
        None => Err(format!("invalid time offset '{rest}'").into()),
    }
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d") to seconds.
fn parse_duration(s: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str.parse()?;

    let secs = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "d" => num * 86400,
        "w" => num * 604_800,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, d or w.").into()),
    };

    Ok(secs)
}

/// Current time in seconds since the epoch.
fn now() -> Result<u64, Box<dyn std::error::Error>> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
