use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::params::Hyperparameters;
use crate::error::{EngineError, EngineResult};

/// Model metadata entry.
pub const METADATA: &str = "metadata";
/// User factor entry.
pub const USER_FACTORS: &str = "userFactors";
/// Item factor entry.
pub const ITEM_FACTORS: &str = "itemFactors";
/// Entries every model directory must contain.
pub const REQUIRED_ENTRIES: [&str; 3] = [ITEM_FACTORS, USER_FACTORS, METADATA];
/// Current on-disk format.
pub const FORMAT_VERSION: u32 = 1;

/// Contents of the `metadata` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// On-disk format version.
    pub format_version: u32,
    /// Model class that wrote the directory.
    pub class: String,
    /// Model identifier.
    pub uid: Uuid,
    /// Save time.
    pub timestamp: DateTime<Utc>,
    /// Latent factor count.
    pub rank: usize,
    /// Rows in `userFactors`.
    pub num_users: usize,
    /// Rows in `itemFactors`.
    pub num_items: usize,
    /// Training hyperparameters.
    pub params: Hyperparameters,
}

/// One line of a factor entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactorRow {
    /// User or item identifier.
    pub id: u32,
    /// Latent vector.
    pub features: Vec<f32>,
}

/// Fails unless every required entry exists under `dir`.
pub fn check_layout(dir: &Path) -> EngineResult<()> {
    if !dir.is_dir() {
        return Err(EngineError::persistence(dir, "model directory does not exist"));
    }
    let missing: Vec<&str> = REQUIRED_ENTRIES
        .iter()
        .copied()
        .filter(|entry| !dir.join(entry).exists())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::persistence(
            dir,
            format!("missing model entries: {}", missing.join(", ")),
        ))
    }
}

/// Writes metadata and both factor entries, replacing any previous contents.
pub fn write_layout<'a>(
    dir: &Path,
    metadata: &ModelMetadata,
    users: impl Iterator<Item = (u32, &'a [f32])>,
    items: impl Iterator<Item = (u32, &'a [f32])>,
) -> EngineResult<()> {
    let io_err = |err: std::io::Error| EngineError::persistence(dir, err);
    fs::create_dir_all(dir).map_err(io_err)?;
    write_factors(dir, USER_FACTORS, users)?;
    write_factors(dir, ITEM_FACTORS, items)?;
    let data = serde_json::to_vec_pretty(metadata).map_err(|err| EngineError::persistence(dir, err))?;
    fs::write(dir.join(METADATA), data).map_err(io_err)
}

fn write_factors<'a>(
    dir: &Path,
    entry: &str,
    rows: impl Iterator<Item = (u32, &'a [f32])>,
) -> EngineResult<()> {
    let path = dir.join(entry);
    let fail = |err: &dyn std::fmt::Display| EngineError::persistence(&path, err);
    let mut writer = BufWriter::new(File::create(&path).map_err(|err| fail(&err))?);
    for (id, features) in rows {
        let row = FactorRow {
            id,
            features: features.to_vec(),
        };
        serde_json::to_writer(&mut writer, &row).map_err(|err| fail(&err))?;
        writer.write_all(b"\n").map_err(|err| fail(&err))?;
    }
    writer.flush().map_err(|err| fail(&err))
}

/// Reads the `metadata` entry.
pub fn read_metadata(dir: &Path) -> EngineResult<ModelMetadata> {
    let path = dir.join(METADATA);
    let data = fs::read(&path).map_err(|err| EngineError::persistence(&path, err))?;
    let metadata: ModelMetadata =
        serde_json::from_slice(&data).map_err(|err| EngineError::persistence(&path, err))?;
    if metadata.format_version > FORMAT_VERSION {
        return Err(EngineError::persistence(
            &path,
            format!(
                "format version {} is newer than supported version {FORMAT_VERSION}",
                metadata.format_version
            ),
        ));
    }
    Ok(metadata)
}

/// Reads a factor entry, checking every vector has `rank` components.
pub fn read_factors(dir: &Path, entry: &str, rank: usize) -> EngineResult<Vec<FactorRow>> {
    let path = dir.join(entry);
    let file = File::open(&path).map_err(|err| EngineError::persistence(&path, err))?;
    let mut rows = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| EngineError::persistence(&path, err))?;
        if line.trim().is_empty() {
            continue;
        }
        let row: FactorRow = serde_json::from_str(&line).map_err(|err| {
            EngineError::persistence(&path, format!("line {}: {err}", idx + 1))
        })?;
        if row.features.len() != rank {
            return Err(EngineError::persistence(
                &path,
                format!(
                    "line {}: expected {rank} factors, found {}",
                    idx + 1,
                    row.features.len()
                ),
            ));
        }
        rows.push(row);
    }
    Ok(rows)
}
