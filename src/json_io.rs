//! Deterministic JSON writer (spec §4.1): sorted keys, compact separators,
//! UTF-8, LF endings, NaN/Inf rejected, atomic tmp -> fsync -> rename.
//!
//! Every artifact the engine emits (iteration summaries, the cumulative
//! tuning report, the runtime overrides file) goes through
//! [`write_atomic`], and every signature the engine computes goes through
//! [`sha256`] — both built on the same [`canonical_bytes`] so a signature
//! and a written file are provably the same canonicalisation.

use serde::Serialize;
use serde_json::ser::{CompactFormatter, Formatter, Serializer};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::errors::EngineError;

/// A `serde_json::ser::Formatter` that rejects non-finite floats at the
/// point they would otherwise be written. `serde_json::to_value` silently
/// turns `NaN`/`Inf` into `Value::Null` (`Number::from_f64` returns `None`
/// for them), which loses the fact a number was ever there — by the time a
/// `Value` tree is walked, a non-finite field is indistinguishable from a
/// legitimately absent one. Catching it here, during the original
/// serialisation of `T`, is the only point the distinction still exists.
struct FiniteCheckFormatter(CompactFormatter);

impl Formatter for FiniteCheckFormatter {
    fn write_f32<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f32) -> io::Result<()> {
        if !value.is_finite() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "non-finite f32"));
        }
        self.0.write_f32(writer, value)
    }

    fn write_f64<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f64) -> io::Result<()> {
        if !value.is_finite() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "non-finite f64"));
        }
        self.0.write_f64(writer, value)
    }
}

/// Serialises `value` once through [`FiniteCheckFormatter`], discarding the
/// bytes, solely to surface a `NumericDomain` error before any NaN/Inf can
/// be laundered into `null`.
fn reject_non_finite<T: Serialize>(value: &T) -> Result<(), EngineError> {
    let mut sink = Vec::new();
    let mut ser = Serializer::with_formatter(&mut sink, FiniteCheckFormatter(CompactFormatter));
    value
        .serialize(&mut ser)
        .map_err(|e| EngineError::NumericDomain(e.to_string()))
}

/// Serialises `value` with sorted map keys and compact separators, LF-only,
/// UTF-8. This is the single source of truth for "canonical JSON" used by
/// both [`write_atomic`] and [`sha256`].
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    reject_non_finite(value)?;
    let as_value = serde_json::to_value(value)?;
    // serde_json::Value serialises maps in BTreeMap order only when the
    // `preserve_order` feature is off; this crate does not enable it, so
    // `Value::Object` is already a `BTreeMap` underneath and keys come out
    // sorted. `to_vec` (compact, no pretty-printer) gives the tightest
    // separators with no trailing newline; we add exactly one LF so files
    // are diff-friendly and still byte-stable.
    let mut bytes = serde_json::to_vec(&as_value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// `sha256(value)` — hex digest of the canonical byte stream. Used for
/// `RuntimeOverrides` signatures (§4.6) and artifact manifest hashes.
pub fn sha256<T: Serialize>(value: &T) -> Result<String, EngineError> {
    let bytes = canonical_bytes(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Writes `value` to `path` atomically: serialise to canonical bytes, write
/// to `<path>.tmp`, flush, fsync the file, rename over `path`, fsync the
/// parent directory. Readers of `path` always observe either the previous
/// complete file or the new one, never a partial write.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), EngineError> {
    let bytes = canonical_bytes(value)?;
    let tmp_path = tmp_path_for(path);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    {
        let mut tmp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp_file.write_all(&bytes)?;
        tmp_file.flush()?;
        tmp_file.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;
    fsync_parent_dir(path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    std::path::PathBuf::from(tmp)
}

fn fsync_parent_dir(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        // Directory fsync is a best-effort durability measure; not every
        // platform supports opening a directory for read, so a failure
        // here is swallowed rather than treated as a write failure — the
        // rename itself already succeeded.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Reads and parses a canonical JSON artifact. Returns `Ok(None)` if the
/// file does not exist (callers treat "absent" as "use defaults", per the
/// `RuntimeOverrides` contract).
pub fn read_json_opt<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, EngineError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let value = serde_json::from_slice(&bytes)?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    #[test]
    fn canonical_bytes_sorts_keys_and_is_compact() {
        let value = json!({ "b": 1, "a": 2 });
        let bytes = canonical_bytes(&value).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "{\"a\":2,\"b\":1}\n");
    }

    #[test]
    fn canonicalisation_is_idempotent() {
        let value = json!({ "z": 1.5, "a": [1, 2, 3] });
        let once = canonical_bytes(&value).unwrap();
        let reparsed: Value = serde_json::from_slice(&once).unwrap();
        let twice = canonical_bytes(&reparsed).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn hashing_is_deterministic_for_equal_values() {
        let a = json!({ "x": 1, "y": 2 });
        let b = json!({ "y": 2, "x": 1 });
        assert_eq!(sha256(&a).unwrap(), sha256(&b).unwrap());
    }

    #[test]
    fn rejects_nan_and_infinite() {
        #[derive(Serialize)]
        struct Bad {
            v: f64,
        }
        let bad = Bad { v: f64::NAN };
        let err = canonical_bytes(&bad).unwrap_err();
        assert!(matches!(err, EngineError::NumericDomain(_)));

        let bad_inf = Bad { v: f64::INFINITY };
        assert!(canonical_bytes(&bad_inf).is_err());
    }

    #[test]
    fn write_atomic_round_trips_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime_overrides.json");
        let value = json!({ "min_interval_ms": 60.0, "base_spread_bps_delta": 0.0 });

        write_atomic(&path, &value).unwrap();
        let first_bytes = fs::read(&path).unwrap();

        write_atomic(&path, &value).unwrap();
        let second_bytes = fs::read(&path).unwrap();

        assert_eq!(first_bytes, second_bytes);
        assert!(!dir.path().join("runtime_overrides.json.tmp").exists());

        let read_back: Value = read_json_opt(&path).unwrap().unwrap();
        assert_eq!(read_back, value);
    }

    #[test]
    fn read_json_opt_returns_none_for_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let read_back: Option<Value> = read_json_opt(&path).unwrap();
        assert!(read_back.is_none());
    }
}
