//! Memory-mapped archive file format.
//!
//! An archive is a single pre-sized file. Nothing in it ever grows: updates
//! rewrite live state and ring rows in place.
//!
//! # File Format
//!
//! All integers and floats are little endian.
//!
//! ```text
//! [0..64)     Header: magic "RRDK", version, step, start, last_update,
//!             ds_count, rra_count, definition length
//! [64..D)     Definition block (JSON of data sources and archives), 8-byte padded
//! [D..L)      Live data source state: last_ds, scratch (f64), unknown_sec (u64)
//! [L..P)      Archive pointers: cur_row (u64 per archive)
//! [P..R)      CDP prep per (archive, data source)
//! [R..)       Ring rows per archive: rows x columns x f64
//! ```
//!
//! A consolidated archive keeps three CDP slots per data source (accumulated
//! value, unknown PDP count, absorbed PDP count). A HWPREDICT archive keeps
//! intercept, slope and an initialized flag followed by one seasonal
//! coefficient and one seasonal deviation per slot of the seasonal period.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use crate::error::{CreateError, FileIoError, Result, RrdError};
use crate::ring::{Ring, RingMut};
use crate::schema::{ArchiveDef, ArchiveSpec, DataSourceDef};

/// Magic bytes identifying an archive file.
const MAGIC: [u8; 4] = *b"RRDK";

/// Current file format version.
pub(crate) const FORMAT_VERSION: u32 = 1;

/// Size of the fixed header in bytes.
const HEADER_SIZE: usize = 64;

/// Bytes per stored cell.
const CELL: usize = 8;

/// Live state cells per data source.
const DS_STATE_CELLS: usize = 3;

/// CDP cells per data source of a consolidated archive.
pub(crate) const CDP_CELLS: usize = 3;

/// Fixed CDP cells per data source of a HWPREDICT archive, before the
/// seasonal arrays.
pub(crate) const HW_FIXED_CELLS: usize = 3;

// Header field offsets.
const OFF_VERSION: usize = 4;
const OFF_STEP: usize = 8;
const OFF_START: usize = 16;
const OFF_LAST_UPDATE: usize = 24;
const OFF_DS_COUNT: usize = 32;
const OFF_RRA_COUNT: usize = 36;
const OFF_DEF_LEN: usize = 40;

/// Reads a little-endian `f64` at `offset`.
#[inline]
pub(crate) fn read_f64(bytes: &[u8], offset: usize) -> f64 {
    f64::from_bits(read_u64(bytes, offset))
}

/// Writes a little-endian `f64` at `offset`.
#[inline]
pub(crate) fn write_f64(bytes: &mut [u8], offset: usize, value: f64) {
    write_u64(bytes, offset, value.to_bits());
}

#[inline]
fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

#[inline]
fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

/// Definitions persisted in the JSON block.
#[derive(Debug, Serialize, Deserialize)]
struct Definitions {
    data_sources: Vec<DataSourceDef>,
    archives: Vec<ArchiveDef>,
}

/// Ingestion state of one data source between updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DsState {
    /// Last raw reading, `NaN` if unknown.
    pub last_ds: f64,
    /// Rate x seconds accumulated in the current PDP interval.
    pub scratch: f64,
    /// Unknown seconds accumulated in the current PDP interval.
    pub unknown_sec: u64,
}

/// Byte offsets of every region, derived from the definitions.
#[derive(Debug, Clone)]
struct Layout {
    state_offset: usize,
    pointer_offset: usize,
    /// Per archive: offset of its CDP block and cells per data source.
    cdp: Vec<(usize, usize)>,
    /// Per archive: offset of its ring, row count and row width.
    rings: Vec<(usize, usize, usize)>,
    file_size: usize,
}

impl Layout {
    // Row counts are bounded at validation time, so the casts cannot truncate
    // on 64-bit targets.
    #[allow(clippy::cast_possible_truncation)]
    fn new(data_sources: &[DataSourceDef], archives: &[ArchiveDef], def_len: usize) -> Self {
        let ds_count = data_sources.len();
        let state_offset = HEADER_SIZE + def_len.next_multiple_of(CELL);
        let pointer_offset = state_offset + ds_count * DS_STATE_CELLS * CELL;

        let mut offset = pointer_offset + archives.len() * CELL;
        let mut cdp = Vec::with_capacity(archives.len());
        for archive in archives {
            let cells = match archive {
                ArchiveDef::Consolidated { .. } => CDP_CELLS,
                ArchiveDef::HwPredict {
                    seasonal_period, ..
                } => HW_FIXED_CELLS + 2 * (*seasonal_period as usize),
            };
            cdp.push((offset, cells));
            offset += ds_count * cells * CELL;
        }

        let mut rings = Vec::with_capacity(archives.len());
        for archive in archives {
            let rows = archive.rows() as usize;
            let width = ds_count * archive.columns_per_ds();
            rings.push((offset, rows, width));
            offset += rows * width * CELL;
        }

        Self {
            state_offset,
            pointer_offset,
            cdp,
            rings,
            file_size: offset,
        }
    }
}

/// An open archive file.
///
/// All mutation goes through `&mut self`, so a handle has a single writer.
/// Cross-process exclusion is left to the caller.
#[derive(Debug)]
pub(crate) struct RrdFile {
    mmap: MmapMut,
    layout: Layout,
    spec: ArchiveSpec,
    path: String,
}

impl RrdFile {
    /// Allocates a new archive file for a validated `spec`.
    ///
    /// Ring cells are set to UNKNOWN; every other region is zeroed and left
    /// for the caller to initialize.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError::AlreadyExists`] if the path exists and
    /// `overwrite` is false, or a [`FileIoError`] if the file cannot be
    /// written.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn allocate(path: &Path, spec: &ArchiveSpec, overwrite: bool) -> Result<Self> {
        let path_str = path.to_string_lossy().to_string();

        let definitions = serde_json::to_vec(&Definitions {
            data_sources: spec.data_sources.clone(),
            archives: spec.archives.clone(),
        })
        .map_err(FileIoError::from)?;
        let layout = Layout::new(&spec.data_sources, &spec.archives, definitions.len());

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(path).map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                RrdError::from(CreateError::AlreadyExists {
                    path: path_str.clone(),
                })
            } else {
                RrdError::from(FileIoError::WriteFailed {
                    path: path_str.clone(),
                    source: e,
                })
            }
        })?;

        file.set_len(layout.file_size as u64)
            .map_err(|e| FileIoError::WriteFailed {
                path: path_str.clone(),
                source: e,
            })?;

        // SAFETY: The file was just created with the exact layout size and this
        // handle is its only user.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| FileIoError::WriteFailed {
                path: path_str.clone(),
                source: e,
            })?
        };

        let header = &mut mmap[..HEADER_SIZE];
        header[..4].copy_from_slice(&MAGIC);
        header[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        write_u64(header, OFF_STEP, spec.step);
        write_u64(header, OFF_START, spec.start);
        write_u64(header, OFF_LAST_UPDATE, spec.start);
        header[OFF_DS_COUNT..OFF_DS_COUNT + 4]
            .copy_from_slice(&(spec.data_sources.len() as u32).to_le_bytes());
        header[OFF_RRA_COUNT..OFF_RRA_COUNT + 4]
            .copy_from_slice(&(spec.archives.len() as u32).to_le_bytes());
        write_u64(header, OFF_DEF_LEN, definitions.len() as u64);
        mmap[HEADER_SIZE..HEADER_SIZE + definitions.len()].copy_from_slice(&definitions);

        let mut rrd = Self {
            mmap,
            layout,
            spec: spec.clone(),
            path: path_str,
        };
        for rra in 0..rrd.spec.archives.len() {
            rrd.ring_mut(rra).fill(f64::NAN);
        }
        Ok(rrd)
    }

    /// Opens and validates an existing archive file.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::ReadFailed`] if the file cannot be opened or
    /// mapped, or [`FileIoError::CorruptedArchive`] if its header, definition
    /// block or size do not describe a valid archive.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let path_str = path.to_string_lossy().to_string();
        let corrupted = |reason: String| FileIoError::CorruptedArchive {
            path: path_str.clone(),
            reason,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| FileIoError::ReadFailed {
                path: path_str.clone(),
                source: e,
            })?;

        // SAFETY: The file is opened read/write and the mapping is owned by
        // this handle; its size is validated below before any region is read.
        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| FileIoError::ReadFailed {
                path: path_str.clone(),
                source: e,
            })?
        };

        if mmap.len() < HEADER_SIZE {
            return Err(corrupted(format!(
                "file too small: {} bytes, expected at least {HEADER_SIZE}",
                mmap.len()
            ))
            .into());
        }
        if mmap[..4] != MAGIC {
            return Err(corrupted(format!("invalid magic bytes: {:?}", &mmap[..4])).into());
        }
        let version = read_u32(&mmap, OFF_VERSION);
        if version != FORMAT_VERSION {
            return Err(corrupted(format!(
                "unsupported version: expected {FORMAT_VERSION}, found {version}"
            ))
            .into());
        }

        let def_len = read_u64(&mmap, OFF_DEF_LEN) as usize;
        let def_end = HEADER_SIZE.saturating_add(def_len);
        if def_end > mmap.len() {
            return Err(corrupted(format!("definition block of {def_len} bytes overruns file")).into());
        }
        let definitions: Definitions = serde_json::from_slice(&mmap[HEADER_SIZE..def_end])
            .map_err(|e| corrupted(format!("unreadable definition block: {e}")))?;

        let ds_count = read_u32(&mmap, OFF_DS_COUNT) as usize;
        let rra_count = read_u32(&mmap, OFF_RRA_COUNT) as usize;
        if ds_count != definitions.data_sources.len() || rra_count != definitions.archives.len() {
            return Err(corrupted(format!(
                "header declares {ds_count} data sources and {rra_count} archives, definitions hold {} and {}",
                definitions.data_sources.len(),
                definitions.archives.len()
            ))
            .into());
        }

        let spec = ArchiveSpec {
            start: read_u64(&mmap, OFF_START),
            step: read_u64(&mmap, OFF_STEP),
            data_sources: definitions.data_sources,
            archives: definitions.archives,
        };
        spec.validate()
            .map_err(|e| corrupted(format!("invalid definitions: {e}")))?;

        let layout = Layout::new(&spec.data_sources, &spec.archives, def_len);
        if mmap.len() != layout.file_size {
            return Err(corrupted(format!(
                "file size mismatch: {} bytes, expected {}",
                mmap.len(),
                layout.file_size
            ))
            .into());
        }

        let rrd = Self {
            mmap,
            layout,
            spec,
            path: path_str.clone(),
        };
        for rra in 0..rrd.spec.archives.len() {
            let rows = rrd.spec.archives[rra].rows() as usize;
            if rrd.cur_row(rra) >= rows {
                return Err(corrupted(format!(
                    "archive {rra} row pointer {} is outside {rows} rows",
                    rrd.cur_row(rra)
                ))
                .into());
            }
        }
        Ok(rrd)
    }

    /// Path the archive was opened from.
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    /// Creation spec (start, step and definitions).
    pub(crate) fn spec(&self) -> &ArchiveSpec {
        &self.spec
    }

    /// Base step in seconds.
    pub(crate) fn step(&self) -> u64 {
        self.spec.step
    }

    /// Time of the last applied update.
    pub(crate) fn last_update(&self) -> u64 {
        read_u64(&self.mmap, OFF_LAST_UPDATE)
    }

    pub(crate) fn set_last_update(&mut self, timestamp: u64) {
        write_u64(&mut self.mmap, OFF_LAST_UPDATE, timestamp);
    }

    /// Bytes preceding the ring rows.
    pub(crate) fn header_size(&self) -> usize {
        self.layout
            .rings
            .first()
            .map_or(self.layout.file_size, |(offset, _, _)| *offset)
    }

    pub(crate) fn ds_state(&self, ds: usize) -> DsState {
        let base = self.layout.state_offset + ds * DS_STATE_CELLS * CELL;
        DsState {
            last_ds: read_f64(&self.mmap, base),
            scratch: read_f64(&self.mmap, base + CELL),
            unknown_sec: read_u64(&self.mmap, base + 2 * CELL),
        }
    }

    pub(crate) fn set_ds_state(&mut self, ds: usize, state: DsState) {
        let base = self.layout.state_offset + ds * DS_STATE_CELLS * CELL;
        write_f64(&mut self.mmap, base, state.last_ds);
        write_f64(&mut self.mmap, base + CELL, state.scratch);
        write_u64(&mut self.mmap, base + 2 * CELL, state.unknown_sec);
    }

    /// Index of the newest row of archive `rra`.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn cur_row(&self, rra: usize) -> usize {
        read_u64(&self.mmap, self.layout.pointer_offset + rra * CELL) as usize
    }

    pub(crate) fn set_cur_row(&mut self, rra: usize, row: usize) {
        write_u64(&mut self.mmap, self.layout.pointer_offset + rra * CELL, row as u64);
    }

    /// Reads CDP cell `slot` of (`rra`, `ds`).
    pub(crate) fn cdp(&self, rra: usize, ds: usize, slot: usize) -> f64 {
        read_f64(&self.mmap, self.cdp_offset(rra, ds, slot))
    }

    pub(crate) fn set_cdp(&mut self, rra: usize, ds: usize, slot: usize, value: f64) {
        let offset = self.cdp_offset(rra, ds, slot);
        write_f64(&mut self.mmap, offset, value);
    }

    fn cdp_offset(&self, rra: usize, ds: usize, slot: usize) -> usize {
        let (offset, cells) = self.layout.cdp[rra];
        debug_assert!(slot < cells);
        offset + (ds * cells + slot) * CELL
    }

    /// Read-only view of the ring of archive `rra`.
    pub(crate) fn ring(&self, rra: usize) -> Ring<'_> {
        let (offset, rows, width) = self.layout.rings[rra];
        Ring::new(
            &self.mmap[offset..offset + rows * width * CELL],
            rows,
            width,
            self.cur_row(rra),
        )
    }

    fn ring_mut(&mut self, rra: usize) -> RingMut<'_> {
        let (offset, rows, width) = self.layout.rings[rra];
        RingMut::new(&mut self.mmap[offset..offset + rows * width * CELL], rows, width)
    }

    /// Appends a completed row to archive `rra`, then advances its pointer.
    pub(crate) fn push_row(&mut self, rra: usize, values: &[f64]) {
        let cur = self.cur_row(rra);
        let next = self.ring_mut(rra).push(cur, values);
        self.set_cur_row(rra, next);
    }

    /// Flushes outstanding changes to disk.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError::SyncFailed`] if the flush fails.
    pub(crate) fn sync(&self) -> Result<()> {
        self.mmap.flush().map_err(|e| FileIoError::SyncFailed {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(())
    }
}
