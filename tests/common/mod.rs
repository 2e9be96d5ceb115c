use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use facegate::{face, Embedding, FaceOracle, OracleError};

/// Reads "images" that are text files: `face:x,y,z` or `noface`.
/// Anything else is treated as an undecodable image.
pub struct FakeOracle {
    pub encodes: usize,
    pub compares: Cell<usize>,
    pub model: String,
}

impl Default for FakeOracle {
    fn default() -> Self {
        Self::with_model("fake-v1")
    }
}

impl FakeOracle {
    pub fn with_model(model: &str) -> Self {
        Self {
            encodes: 0,
            compares: Cell::new(0),
            model: model.to_string(),
        }
    }
}

impl FaceOracle for FakeOracle {
    fn detect_and_encode(&mut self, image: &Path) -> Result<Option<Embedding>, OracleError> {
        self.encodes += 1;
        let corrupt = |message: &str| OracleError::Inference {
            path: image.to_path_buf(),
            message: message.to_string(),
        };
        let body = fs::read_to_string(image).map_err(|e| corrupt(&e.to_string()))?;
        let body = body.trim();
        if body == "noface" {
            return Ok(None);
        }
        let values = body
            .strip_prefix("face:")
            .ok_or_else(|| corrupt("not an image"))?
            .split(',')
            .map(|v| v.trim().parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| corrupt(&e.to_string()))?;
        Ok(Some(Embedding::from_vec(values)))
    }

    fn similarity(&self, a: &Embedding, b: &Embedding) -> f32 {
        face::match_embedding(a, b)
    }

    fn compare(&self, a: &Embedding, b: &Embedding) -> bool {
        self.compares.set(self.compares.get() + 1);
        self.similarity(a, b) >= 0.99
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

pub struct Scratch {
    pub dir: tempfile::TempDir,
}

impl Scratch {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn gallery(&self) -> PathBuf {
        self.dir.path().join("faces")
    }

    /// Write an upload/probe file outside the gallery.
    pub fn image(&self, name: &str, body: &str) -> PathBuf {
        let uploads = self.dir.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        let path = uploads.join(name);
        fs::write(&path, body).unwrap();
        path
    }
}
