use crate::encoding::{crc32, read_u32, read_u64, write_u32, write_u64};
use crate::error::DbError;
use crate::series::Series;

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const SERIES_MAGIC: &[u8; 8] = b"TSCSER01";
const SERIES_VERSION: u32 = 1;

const SNAP_MAGIC: &[u8; 8] = b"TSCSNP01";
const SNAP_VERSION: u32 = 1;

fn corruption(details: String) -> DbError {
    DbError::Corruption {
        details,
        series: None,
    }
}

fn read_header<R: Read>(r: &mut R, magic: &[u8; 8], version: u32, what: &str) -> Result<(), DbError> {
    let mut m = [0u8; 8];
    r.read_exact(&mut m)?;
    if &m != magic {
        return Err(corruption(format!("Bad {what} magic")));
    }
    let v = read_u32(r)?;
    if v != version {
        return Err(corruption(format!("Unsupported {what} version {v}")));
    }
    Ok(())
}

/// Reads `len u64 | crc u32 | payload` and verifies the checksum.
fn read_checked_payload<R: Read>(r: &mut R, what: &str) -> Result<Vec<u8>, DbError> {
    let len = read_u64(r)?;
    let expected_crc = read_u32(r)?;
    let mut payload = Vec::new();
    r.take(len).read_to_end(&mut payload)?;
    if payload.len() as u64 != len {
        return Err(corruption(format!(
            "{what} payload truncated: expected {len} bytes, got {}",
            payload.len()
        )));
    }
    if crc32(&payload) != expected_crc {
        return Err(corruption(format!("{what} payload CRC mismatch")));
    }
    Ok(payload)
}

fn write_checked_payload(buf: &mut Vec<u8>, payload: &[u8]) {
    write_u64(buf, payload.len() as u64);
    write_u32(buf, crc32(payload));
    buf.extend_from_slice(payload);
}

/// Serializes one series (samples, rules with their open accumulators, labels, settings)
/// into a versioned, checksummed blob.
pub fn encode_series(series: &Series) -> Result<Vec<u8>, DbError> {
    let payload = bincode::serialize(series)?;
    let mut out = Vec::with_capacity(payload.len() + 24);
    out.extend_from_slice(SERIES_MAGIC);
    write_u32(&mut out, SERIES_VERSION);
    write_checked_payload(&mut out, &payload);
    Ok(out)
}

/// Inverse of [`encode_series`].
pub fn decode_series(bytes: &[u8]) -> Result<Series, DbError> {
    let mut cur = std::io::Cursor::new(bytes);
    read_header(&mut cur, SERIES_MAGIC, SERIES_VERSION, "series")?;
    let payload = read_checked_payload(&mut cur, "series")?;
    let series: Series = bincode::deserialize(&payload)?;
    Ok(series)
}

/// Writes and loads whole-engine snapshots.
///
/// File layout: magic, version u32, timestamp u64, payload len u64, crc32 u32, payload
/// (bincode `Vec<Series>`).
#[derive(Debug)]
pub struct Snapshotter {
    snapshot_dir: PathBuf,
}

impl Snapshotter {
    pub fn new<P: AsRef<Path>>(snapshot_dir: P) -> Result<Self, DbError> {
        let dir_path = snapshot_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir_path)?;
        Ok(Snapshotter {
            snapshot_dir: dir_path,
        })
    }

    /// Writes `series` as `snapshot_<timestamp>.bin`.
    pub fn create_snapshot(&self, series: &[&Series], timestamp: u64) -> Result<PathBuf, DbError> {
        let payload = bincode::serialize(series)?;

        // Atomic install: write to temp, fsync, rename, fsync dir.
        let final_path = self.snapshot_dir.join(format!("snapshot_{}.bin", timestamp));
        let tmp_path = self
            .snapshot_dir
            .join(format!(".tmp_snapshot_{}.bin", timestamp));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut header = Vec::with_capacity(32);
        header.extend_from_slice(SNAP_MAGIC);
        write_u32(&mut header, SNAP_VERSION);
        write_u64(&mut header, timestamp);
        write_u64(&mut header, payload.len() as u64);
        write_u32(&mut header, crc32(&payload));

        let mut w = BufWriter::new(file);
        w.write_all(&header)?;
        w.write_all(&payload)?;
        w.flush()?;
        w.get_ref().sync_data()?;
        drop(w);

        fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.snapshot_dir)?;
        Ok(final_path)
    }

    /// Loads the newest snapshot, if any.
    pub fn load_latest_snapshot(&self) -> Result<Option<(PathBuf, Vec<Series>)>, DbError> {
        let mut snaps = list_snapshots(&self.snapshot_dir)?;
        snaps.sort_by(|a, b| b.0.cmp(&a.0));
        let Some((_, latest_path)) = snaps.into_iter().next() else {
            return Ok(None);
        };
        let series = read_snapshot(&latest_path)?;
        Ok(Some((latest_path, series)))
    }

    /// Deletes all but the newest `keep` snapshots. Returns how many were removed.
    pub fn prune(&self, keep: usize) -> Result<usize, DbError> {
        let mut snaps = list_snapshots(&self.snapshot_dir)?;
        snaps.sort_by(|a, b| b.0.cmp(&a.0));
        let mut removed = 0;
        for (_, path) in snaps.into_iter().skip(keep.max(1)) {
            fs::remove_file(path)?;
            removed += 1;
        }
        if removed > 0 {
            sync_dir(&self.snapshot_dir)?;
        }
        Ok(removed)
    }
}

fn read_snapshot(path: &Path) -> Result<Vec<Series>, DbError> {
    let mut reader = BufReader::new(File::open(path)?);
    read_header(&mut reader, SNAP_MAGIC, SNAP_VERSION, "snapshot").map_err(|e| with_path(e, path))?;
    let _timestamp = read_u64(&mut reader)?;
    let payload = read_checked_payload(&mut reader, "snapshot").map_err(|e| with_path(e, path))?;
    let series: Vec<Series> = bincode::deserialize(&payload)?;
    Ok(series)
}

fn with_path(e: DbError, path: &Path) -> DbError {
    match e {
        DbError::Corruption { details, series } => DbError::Corruption {
            details: format!("{details} in {:?}", path),
            series,
        },
        other => other,
    }
}

fn list_snapshots(dir: &Path) -> Result<Vec<(u64, PathBuf)>, DbError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(ts_str) = name
            .strip_prefix("snapshot_")
            .and_then(|s| s.strip_suffix(".bin"))
        else {
            continue;
        };
        let Ok(ts) = ts_str.parse::<u64>() else { continue };
        out.push((ts, entry.path()));
    }
    Ok(out)
}

fn sync_dir(dir: &Path) -> Result<(), DbError> {
    let d = File::open(dir)?;
    d.sync_data()?;
    Ok(())
}
