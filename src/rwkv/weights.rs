// SPDX-License-Identifier: MIT OR Apache-2.0

//! Safetensors discovery and `VarBuilder` construction for a local model
//! directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::error::{ChainError, Result};

/// Index file of a sharded checkpoint.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name → shard filename.
    weight_map: HashMap<String, String>,
}

/// Safetensors files of the model in `dir`.
///
/// Prefers `model.safetensors.index.json` (sharded) and falls back to a
/// single `model.safetensors`.
///
/// # Errors
///
/// Returns [`ChainError::ModelLoad`] if neither exists, the index is
/// malformed, or a shard it names is missing.
pub fn resolve_safetensors_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = dir.join("model.safetensors.index.json");
    if index_path.is_file() {
        let index_str = std::fs::read_to_string(&index_path).map_err(|e| {
            ChainError::ModelLoad(format!("read {}: {e}", index_path.display()))
        })?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str).map_err(|e| {
            ChainError::ModelLoad(format!("parse {}: {e}", index_path.display()))
        })?;

        let mut shard_names: Vec<&String> = index.weight_map.values().collect();
        shard_names.sort();
        shard_names.dedup();

        let mut paths = Vec::with_capacity(shard_names.len());
        for shard_name in shard_names {
            let path = dir.join(shard_name);
            if !path.is_file() {
                return Err(ChainError::ModelLoad(format!(
                    "shard {shard_name} listed in the index is missing"
                )));
            }
            paths.push(path);
        }
        return Ok(paths);
    }

    let single = dir.join("model.safetensors");
    if single.is_file() {
        Ok(vec![single])
    } else {
        Err(ChainError::ModelLoad(format!(
            "no model.safetensors or model.safetensors.index.json in {}",
            dir.display()
        )))
    }
}

/// Create a `VarBuilder` over `paths`.
///
/// Buffered loading by default; memory-mapped with the `mmap` feature.
///
/// # Errors
///
/// Returns [`ChainError::ModelLoad`] if a file cannot be read or parsed.
pub fn create_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Read the whole checkpoint into RAM. Single-file checkpoints only.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let [path] = paths else {
        return Err(ChainError::ModelLoad(format!(
            "{} safetensors shards found; sharded checkpoints require the `mmap` feature",
            paths.len()
        )));
    };
    let data = std::fs::read(path)
        .map_err(|e| ChainError::ModelLoad(format!("read {}: {e}", path.display())))?;
    VarBuilder::from_buffered_safetensors(data, dtype, device)
        .map_err(|e| ChainError::ModelLoad(format!("parse {}: {e}", path.display())))
}

/// Memory-map every shard.
///
/// # Safety
///
/// The safetensors files must not be modified while the model is loaded.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    // SAFETY: safetensors files must not be modified while loaded.
    unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device) }
        .map_err(|e| ChainError::ModelLoad(format!("map safetensors: {e}")))
}
