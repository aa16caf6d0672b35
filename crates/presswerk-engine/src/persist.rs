// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Option Persistence (component J "Persisted state files").
//
// `key=value\n`-delimited snapshots, one file per queue plus the two
// default-printer marker files. Plain synchronous file I/O behind
// `tokio::task::spawn_blocking` at call sites that need to stay off the
// event loop.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Save `options` to `path` as `key=value\n` lines, sorted by key so the
/// file is stable across runs (easier diffing, and deterministic for tests).
pub fn save_options(path: &Path, options: &HashMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut keys: Vec<&String> = options.keys().collect();
    keys.sort();
    let mut body = String::new();
    for key in keys {
        body.push_str(key);
        body.push('=');
        body.push_str(&options[key]);
        body.push('\n');
    }
    std::fs::write(path, body)?;
    debug!(path = %path.display(), count = options.len(), "persisted per-queue options");
    Ok(())
}

/// Load a previously-saved `key=value` snapshot. A missing file is not an
/// error: it means no prior session left any options, so an empty map is
/// returned.
pub fn load_options(path: &Path) -> Result<HashMap<String, String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(parse_kv(&contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(EngineError::from(e)),
    }
}

fn parse_kv(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.to_string(), value.to_string());
        } else {
            warn!(line, "skipping malformed options line");
        }
    }
    map
}

/// Record that `queue_name` was the pre-existing local default printer
/// before it was superseded by a managed queue of the same name.
pub fn record_local_default(path: &Path, queue_name: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, queue_name)?;
    Ok(())
}

pub fn read_local_default(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EngineError::from(e)),
    }
}

pub fn clear_local_default(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options-lab-printer");
        let mut options = HashMap::new();
        options.insert("media".to_string(), "iso_a4_210x297mm".to_string());
        options.insert("sides".to_string(), "two-sided-long-edge".to_string());

        save_options(&path, &options).unwrap();
        let loaded = load_options(&path).unwrap();
        assert_eq!(loaded, options);
    }

    #[test]
    fn load_missing_file_returns_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        assert!(load_options(&path).unwrap().is_empty());
    }

    #[test]
    fn local_default_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local-default-printer");
        record_local_default(&path, "HP_LaserJet").unwrap();
        assert_eq!(read_local_default(&path).unwrap().as_deref(), Some("HP_LaserJet"));
        clear_local_default(&path).unwrap();
        assert_eq!(read_local_default(&path).unwrap(), None);
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let parsed = parse_kv("media=iso_a4\nnot-a-kv-line\nsides=one-sided\n");
        assert_eq!(parsed.len(), 2);
    }
}
