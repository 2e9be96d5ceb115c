//! The registered-identities directory: one `<identity_id>.<ext>` image per identity.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use uuid::Uuid;

use crate::error::{MatchError, Result};

pub const DEFAULT_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Extension used when the source image has none.
const FALLBACK_EXTENSION: &str = "jpg";

/// Longest file name, in bytes, common filesystems accept.
const MAX_FILE_NAME: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFace {
    pub identity_id: String,
    pub path: PathBuf,
}

impl StoredFace {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Why an image file in the gallery is not part of the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The file stem is not valid UTF-8 or not a valid identity id.
    InvalidName,
    /// Another file already holds this identity.
    Duplicate(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    /// File stem, lossily decoded.
    pub identity_id: String,
    pub path: PathBuf,
    pub reason: Rejection,
}

/// Result of reading the gallery directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    /// One image per identity, ordered by file name.
    pub faces: Vec<StoredFace>,
    pub rejected: Vec<Rejected>,
}

#[derive(Debug, Clone)]
pub struct Gallery {
    root: PathBuf,
    extensions: Vec<String>,
}

/// Reject ids that cannot be used verbatim as a file stem.
pub fn validate_identity(identity_id: &str) -> Result<()> {
    let bad = identity_id.is_empty()
        || identity_id.len() > MAX_FILE_NAME - 2
        || identity_id.starts_with('.')
        || identity_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control());
    if bad {
        return Err(MatchError::InvalidIdentity(identity_id.to_string()));
    }
    Ok(())
}

fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

impl Gallery {
    /// Open the directory, creating it if needed.
    pub fn open<S: AsRef<str>>(root: impl Into<PathBuf>, extensions: &[S]) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| MatchError::storage(&root, e))?;
        let extensions = extensions
            .iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Ok(Self { root, extensions })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn accepts(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e == ext)
    }

    pub fn canonical_path(&self, identity_id: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{}", identity_id, ext))
    }

    /// Move `image` into the gallery as the sole image for `identity_id`.
    ///
    /// On failure the image is left at its original path.
    pub fn store(&self, identity_id: &str, image: &Path) -> Result<PathBuf> {
        validate_identity(identity_id)?;

        let ext = lowercase_extension(image).unwrap_or_else(|| FALLBACK_EXTENSION.to_string());
        if !self.accepts(&ext) {
            return Err(MatchError::UnsupportedFormat {
                path: image.to_path_buf(),
            });
        }
        if identity_id.len() + 1 + ext.len() > MAX_FILE_NAME {
            return Err(MatchError::InvalidIdentity(identity_id.to_string()));
        }

        let meta = fs::metadata(image).map_err(|e| MatchError::storage(image, e))?;
        if !meta.is_file() {
            return Err(MatchError::storage(
                image,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let staging = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        move_file(image, &staging)?;

        let dest = self.canonical_path(identity_id, &ext);
        if let Err(e) = fs::rename(&staging, &dest) {
            if let Err(restore) = move_file(&staging, image) {
                warn!(
                    "could not return {} to its original path ({}); it is kept at {}",
                    image.display(),
                    restore,
                    staging.display()
                );
            }
            return Err(MatchError::storage(&dest, e));
        }

        // the new image is in place; leftovers only cost disk space
        match self.siblings(identity_id) {
            Ok(siblings) => {
                for stale in siblings.into_iter().filter(|p| !same_file(p, &dest)) {
                    match fs::remove_file(&stale) {
                        Ok(()) => debug!("removed superseded {}", stale.display()),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => warn!("could not remove superseded {}: {}", stale.display(), e),
                    }
                }
            }
            Err(e) => warn!("could not look for superseded images of {}: {}", identity_id, e),
        }

        Ok(dest)
    }

    /// Delete every stored image for `identity_id`. Returns whether anything was removed.
    pub fn remove(&self, identity_id: &str) -> Result<bool> {
        validate_identity(identity_id)?;
        let mut removed = false;
        for path in self.siblings(identity_id).map_err(|e| MatchError::storage(&self.root, e))? {
            if !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(MatchError::storage(&path, e)),
            }
        }
        Ok(removed)
    }

    /// Stored images ordered by file name, one per identity.
    pub fn list(&self) -> Result<Vec<StoredFace>> {
        Ok(self.scan()?.faces)
    }

    /// Like [`list`](Self::list), also reporting image files that were left out.
    pub fn scan(&self) -> Result<Scan> {
        let entries = fs::read_dir(&self.root).map_err(|e| MatchError::storage(&self.root, e))?;

        let mut candidates = Vec::new();
        let mut rejected = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MatchError::storage(&self.root, e))?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            match entry.file_type() {
                Ok(t) if t.is_file() => {}
                _ => continue,
            }
            let path = entry.path();
            match lowercase_extension(&path) {
                Some(ext) if self.accepts(&ext) => {}
                _ => continue,
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if validate_identity(stem).is_ok() => candidates.push(StoredFace {
                    identity_id: stem.to_string(),
                    path,
                }),
                _ => {
                    warn!("ignoring {}: not a usable identity name", path.display());
                    rejected.push(Rejected {
                        identity_id: path
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        path,
                        reason: Rejection::InvalidName,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| a.path.cmp(&b.path));
        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        let mut faces = Vec::with_capacity(candidates.len());
        for face in candidates {
            if let Some(first) = seen.get(&face.identity_id) {
                warn!(
                    "ignoring {}: identity {} already stored as {}",
                    face.path.display(),
                    face.identity_id,
                    first.display()
                );
                rejected.push(Rejected {
                    identity_id: face.identity_id,
                    path: face.path,
                    reason: Rejection::Duplicate(first.clone()),
                });
                continue;
            }
            seen.insert(face.identity_id.clone(), face.path.clone());
            faces.push(face);
        }
        Ok(Scan { faces, rejected })
    }

    /// Entries named `<identity_id>.<ext>` for any accepted extension, in any letter case.
    fn siblings(&self, identity_id: &str) -> io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.file_stem().and_then(|s| s.to_str()) != Some(identity_id) {
                continue;
            }
            if lowercase_extension(&path).is_some_and(|ext| self.accepts(&ext)) {
                found.push(path);
            }
        }
        Ok(found)
    }
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(a: &Path, b: &Path) -> bool {
    a.as_os_str().eq_ignore_ascii_case(b.as_os_str())
}

/// Rename, falling back to copy + delete across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| {
        let _ = fs::remove_file(to);
        MatchError::storage(from, e)
    })?;
    if let Err(e) = fs::remove_file(from) {
        warn!("copied {} but could not remove it: {}", from.display(), e);
    }
    Ok(())
}
