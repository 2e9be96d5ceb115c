//! On-disk snapshot of computed encodings, so a fresh matcher does not re-encode
//! every stored image.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CACHE_FILE: &str = ".encodings.bin";

const FORMAT_VERSION: u32 = 2;

/// Identifies one version of a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub len: u64,
    pub modified_secs: u64,
    pub modified_nanos: u32,
}

impl Fingerprint {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        let modified = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Self {
            len: meta.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEncoding {
    pub identity_id: String,
    pub file_name: String,
    pub fingerprint: Fingerprint,
    /// `None` records that the image held no detectable face.
    pub vector: Option<Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    /// Recognizer that produced the vectors, see [`FaceOracle::model_id`](crate::oracle::FaceOracle::model_id).
    model: String,
    /// Length shared by every stored vector.
    dimension: Option<usize>,
    entries: Vec<CachedEncoding>,
}

pub fn cache_path(gallery_root: &Path) -> PathBuf {
    gallery_root.join(CACHE_FILE)
}

/// Cached encodings keyed by identity id. A missing file is an empty cache, and
/// so is one written for another model.
pub fn load(gallery_root: &Path, model: &str) -> Result<HashMap<String, CachedEncoding>> {
    let path = cache_path(gallery_root);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let file: CacheFile =
        postcard::from_bytes(&data).with_context(|| format!("decoding {}", path.display()))?;
    if file.version != FORMAT_VERSION {
        log::info!(
            "discarding encoding cache v{} (expected v{})",
            file.version,
            FORMAT_VERSION
        );
        return Ok(HashMap::new());
    }
    if file.model != model {
        log::info!(
            "discarding encoding cache built by {} (now {})",
            file.model,
            model
        );
        return Ok(HashMap::new());
    }

    let dimension = file.dimension;
    Ok(file
        .entries
        .into_iter()
        .filter(|e| match (&e.vector, dimension) {
            (Some(v), Some(dim)) => v.len() == dim,
            (Some(_), None) => false,
            (None, _) => true,
        })
        .map(|e| (e.identity_id.clone(), e))
        .collect())
}

pub fn save(gallery_root: &Path, model: &str, entries: Vec<CachedEncoding>) -> Result<()> {
    let mut lengths = entries.iter().filter_map(|e| e.vector.as_ref().map(Vec::len));
    let dimension = lengths.next();
    if let Some(dim) = dimension {
        if lengths.any(|len| len != dim) {
            anyhow::bail!("refusing to cache vectors of mixed lengths");
        }
    }

    let path = cache_path(gallery_root);
    let data = postcard::to_allocvec(&CacheFile {
        version: FORMAT_VERSION,
        model: model.to_string(),
        dimension,
        entries,
    })?;
    let tmp = path.with_extension("part");
    fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
