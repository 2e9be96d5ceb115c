use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::cache::{self, CachedEncoding, Fingerprint};
use crate::error::{MatchError, Result};
use crate::oracle::FaceOracle;
use crate::storage::{Gallery, Rejected, Rejection, StoredFace, DEFAULT_EXTENSIONS};
use crate::Embedding;

/// Outcome of an authentication call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "identity", rename_all = "snake_case")]
pub enum MatchResult {
    Identity(String),
    NoMatch,
}

/// Like [`MatchResult`], but tells an undetectable probe face apart from a non-match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "identity", rename_all = "snake_case")]
pub enum MatchOutcome {
    Identity(String),
    NoMatch,
    NoFaceDetected,
}

impl From<Rejected> for Diagnostic {
    fn from(rejected: Rejected) -> Self {
        let reason = match rejected.reason {
            Rejection::InvalidName => SkipReason::InvalidName,
            Rejection::Duplicate(first) => SkipReason::Duplicate(first),
        };
        Self {
            identity_id: rejected.identity_id,
            path: rejected.path,
            reason,
        }
    }
}

impl From<MatchOutcome> for MatchResult {
    fn from(outcome: MatchOutcome) -> Self {
        match outcome {
            MatchOutcome::Identity(id) => MatchResult::Identity(id),
            MatchOutcome::NoMatch | MatchOutcome::NoFaceDetected => MatchResult::NoMatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoFace,
    Unreadable(String),
    /// The file name does not decode to a valid identity id.
    InvalidName,
    /// The identity is already stored in the given file.
    Duplicate(PathBuf),
}

/// A stored image that could not be turned into an encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub identity_id: String,
    pub path: PathBuf,
    pub reason: SkipReason,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            SkipReason::NoFace => write!(
                f,
                "{} ({}): no face detected",
                self.identity_id,
                self.path.display()
            ),
            SkipReason::Unreadable(msg) => {
                write!(f, "{} ({}): {}", self.identity_id, self.path.display(), msg)
            }
            SkipReason::InvalidName => write!(
                f,
                "{} ({}): file name is not a valid identity id",
                self.identity_id,
                self.path.display()
            ),
            SkipReason::Duplicate(first) => write!(
                f,
                "{} ({}): identity already stored as {}",
                self.identity_id,
                self.path.display(),
                first.display()
            ),
        }
    }
}

#[derive(Debug, Clone)]
enum Encoding {
    Face(Embedding),
    NoFace,
    Failed,
}

#[derive(Debug, Clone)]
struct IndexedIdentity {
    face: StoredFace,
    fingerprint: Option<Fingerprint>,
    encoding: Encoding,
}

impl IndexedIdentity {
    fn cache_entry(&self) -> Option<CachedEncoding> {
        let vector = match &self.encoding {
            Encoding::Face(e) => Some(e.to_vec()),
            Encoding::NoFace => None,
            Encoding::Failed => return None,
        };
        Some(CachedEncoding {
            identity_id: self.face.identity_id.clone(),
            file_name: self.face.file_name().to_string(),
            fingerprint: self.fingerprint?,
            vector,
        })
    }
}

/// Decides whether a probe image shows any registered identity.
///
/// Encodings of stored images are computed when the gallery is opened or an
/// identity is registered, and kept in registration order. Authentication
/// only encodes the probe.
pub struct IdentityMatcher<O> {
    gallery: Gallery,
    oracle: O,
    index: Vec<IndexedIdentity>,
    diagnostics: Vec<Diagnostic>,
}

impl<O: FaceOracle> IdentityMatcher<O> {
    /// Open a gallery directory with the default image extensions.
    pub fn open(gallery_dir: impl Into<PathBuf>, oracle: O) -> Result<Self> {
        Self::with_gallery(Gallery::open(gallery_dir, &DEFAULT_EXTENSIONS)?, oracle)
    }

    pub fn with_gallery(gallery: Gallery, oracle: O) -> Result<Self> {
        let mut matcher = Self {
            gallery,
            oracle,
            index: Vec::new(),
            diagnostics: Vec::new(),
        };
        matcher.refresh()?;
        Ok(matcher)
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Registered identity ids in match order.
    pub fn identities(&self) -> Vec<&str> {
        self.index
            .iter()
            .map(|e| e.face.identity_id.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Stored images skipped by the last refresh or registration, including
    /// gallery files that were never indexed.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Rebuild the index from the gallery directory, reusing cached encodings
    /// of unchanged files.
    pub fn refresh(&mut self) -> Result<()> {
        let scan = self.gallery.scan()?;
        let mut cached = cache::load(self.gallery.root(), self.oracle.model_id())
            .unwrap_or_else(|e| {
                warn!("ignoring encoding cache: {:#}", e);
                Default::default()
            });

        self.diagnostics = scan.rejected.into_iter().map(Diagnostic::from).collect();
        let mut index = Vec::with_capacity(scan.faces.len());
        let mut reused = 0usize;
        for face in scan.faces {
            let hit = cached.remove(&face.identity_id);
            let (entry, from_cache) = self.index_entry(face, hit.as_ref());
            if from_cache {
                reused += 1;
            }
            index.push(entry);
        }
        self.index = index;

        info!(
            "indexed {} identities from {} ({} from cache, {} skipped)",
            self.index.len(),
            self.gallery.root().display(),
            reused,
            self.diagnostics.len()
        );
        self.persist_cache();
        Ok(())
    }

    /// Store `image` as the face of `identity_id`, replacing any earlier one.
    ///
    /// The image is moved into the gallery. If it cannot be encoded the
    /// identity is still stored but stays unmatchable; the reason is
    /// available from [`diagnostics`](Self::diagnostics).
    pub fn register(&mut self, identity_id: &str, image: &Path) -> Result<PathBuf> {
        let path = self.gallery.store(identity_id, image)?;
        info!("registered {} at {}", identity_id, path.display());

        self.diagnostics.clear();
        let (entry, _) = self.index_entry(
            StoredFace {
                identity_id: identity_id.to_string(),
                path: path.clone(),
            },
            None,
        );
        match self
            .index
            .iter()
            .position(|e| e.face.identity_id == identity_id)
        {
            Some(pos) => self.index[pos] = entry,
            None => self.index.push(entry),
        }

        self.persist_cache();
        Ok(path)
    }

    /// Forget an identity and delete its stored image.
    pub fn remove(&mut self, identity_id: &str) -> Result<bool> {
        let removed = self.gallery.remove(identity_id)?;
        let before = self.index.len();
        self.index.retain(|e| e.face.identity_id != identity_id);
        let known = removed || self.index.len() != before;
        if known {
            info!("removed {}", identity_id);
            self.persist_cache();
        }
        Ok(known)
    }

    /// Match the probe, folding "no face in probe" into [`MatchResult::NoMatch`].
    pub fn authenticate(&mut self, image: &Path) -> Result<MatchResult> {
        self.authenticate_detailed(image).map(MatchResult::from)
    }

    /// Match the probe against every registered identity in index order and
    /// return the first one the oracle accepts.
    pub fn authenticate_detailed(&mut self, image: &Path) -> Result<MatchOutcome> {
        let probe = self
            .oracle
            .detect_and_encode(image)
            .map_err(MatchError::Decode)?;
        let Some(probe) = probe else {
            info!("no face detected in {}", image.display());
            return Ok(MatchOutcome::NoFaceDetected);
        };

        for entry in &self.index {
            let Encoding::Face(known) = &entry.encoding else {
                continue;
            };
            if known.len() != probe.len() {
                debug!(
                    "{}: encoding length {} differs from probe's {}",
                    entry.face.identity_id,
                    known.len(),
                    probe.len()
                );
                continue;
            }
            if self.oracle.compare(known, &probe) {
                debug!(
                    "{} matched {} (similarity {:.3})",
                    image.display(),
                    entry.face.identity_id,
                    self.oracle.similarity(known, &probe)
                );
                return Ok(MatchOutcome::Identity(entry.face.identity_id.clone()));
            }
        }

        debug!(
            "{} matched none of {} identities",
            image.display(),
            self.index.len()
        );
        Ok(MatchOutcome::NoMatch)
    }

    /// Encode one stored face, or reuse `cached` if it still describes the file.
    fn index_entry(
        &mut self,
        face: StoredFace,
        cached: Option<&CachedEncoding>,
    ) -> (IndexedIdentity, bool) {
        let fingerprint = match Fingerprint::of(&face.path) {
            Ok(fp) => Some(fp),
            Err(e) => {
                debug!("cannot stat {}: {}", face.path.display(), e);
                None
            }
        };

        let reusable = cached.filter(|c| {
            fingerprint == Some(c.fingerprint) && c.file_name == face.file_name()
        });
        let from_cache = reusable.is_some();
        let encoding = match reusable {
            Some(c) => match &c.vector {
                Some(v) => Encoding::Face(Embedding::from_vec(v.clone())),
                None => Encoding::NoFace,
            },
            None => match self.oracle.detect_and_encode(&face.path) {
                Ok(Some(e)) => Encoding::Face(e),
                Ok(None) => Encoding::NoFace,
                Err(e) => {
                    self.skip(&face, SkipReason::Unreadable(e.to_string()));
                    Encoding::Failed
                }
            },
        };
        if matches!(encoding, Encoding::NoFace) {
            self.skip(&face, SkipReason::NoFace);
        }

        let entry = IndexedIdentity {
            face,
            fingerprint,
            encoding,
        };
        (entry, from_cache)
    }

    fn skip(&mut self, face: &StoredFace, reason: SkipReason) {
        let diagnostic = Diagnostic {
            identity_id: face.identity_id.clone(),
            path: face.path.clone(),
            reason,
        };
        warn!("skipping stored face {}", diagnostic);
        self.diagnostics.push(diagnostic);
    }

    fn persist_cache(&self) {
        let entries = self
            .index
            .iter()
            .filter_map(IndexedIdentity::cache_entry)
            .collect();
        if let Err(e) = cache::save(self.gallery.root(), self.oracle.model_id(), entries) {
            warn!("could not write encoding cache: {:#}", e);
        }
    }
}

impl<O> fmt::Debug for IdentityMatcher<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMatcher")
            .field("gallery", &self.gallery.root())
            .field("identities", &self.index.len())
            .field("diagnostics", &self.diagnostics.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_face_folds_into_no_match() {
        assert_eq!(
            MatchResult::from(MatchOutcome::NoFaceDetected),
            MatchResult::NoMatch
        );
        assert_eq!(
            MatchResult::from(MatchOutcome::Identity("a".into())),
            MatchResult::Identity("a".into())
        );
    }

    #[test]
    fn outcomes_serialize_with_tag() {
        let json = serde_json::to_string(&MatchOutcome::Identity("alice".into())).unwrap();
        assert_eq!(json, r#"{"result":"identity","identity":"alice"}"#);
        let json = serde_json::to_string(&MatchOutcome::NoFaceDetected).unwrap();
        assert_eq!(json, r#"{"result":"no_face_detected"}"#);
    }

    #[test]
    fn diagnostic_display_names_identity_and_reason() {
        let d = Diagnostic {
            identity_id: "bob".into(),
            path: PathBuf::from("/g/bob.jpg"),
            reason: SkipReason::NoFace,
        };
        assert_eq!(d.to_string(), "bob (/g/bob.jpg): no face detected");
    }

    #[test]
    fn rejected_files_become_diagnostics() {
        let d = Diagnostic::from(Rejected {
            identity_id: "dave".into(),
            path: PathBuf::from("/g/dave.png"),
            reason: Rejection::Duplicate(PathBuf::from("/g/dave.jpg")),
        });
        assert_eq!(d.reason, SkipReason::Duplicate(PathBuf::from("/g/dave.jpg")));
        assert_eq!(
            d.to_string(),
            "dave (/g/dave.png): identity already stored as /g/dave.jpg"
        );
    }
}
