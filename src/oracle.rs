//! The face detection, encoding and comparison capability the matcher relies on.

use std::path::Path;

use facegate_vision::{face, Embedding, Pipeline};

use crate::cache::Fingerprint;
use crate::config::Config;
use crate::error::OracleError;

pub trait FaceOracle {
    /// Encode the most prominent face in `image`.
    ///
    /// `Ok(None)` means the image decoded fine but contains no detectable face.
    fn detect_and_encode(&mut self, image: &Path) -> Result<Option<Embedding>, OracleError>;

    /// Raw similarity score between two encodings.
    fn similarity(&self, a: &Embedding, b: &Embedding) -> f32;

    /// Whether two encodings belong to the same person.
    fn compare(&self, a: &Embedding, b: &Embedding) -> bool;

    /// Names the recognizer. Encodings from different models are not comparable.
    fn model_id(&self) -> &str;
}

impl<O: FaceOracle + ?Sized> FaceOracle for Box<O> {
    fn detect_and_encode(&mut self, image: &Path) -> Result<Option<Embedding>, OracleError> {
        (**self).detect_and_encode(image)
    }

    fn similarity(&self, a: &Embedding, b: &Embedding) -> f32 {
        (**self).similarity(a, b)
    }

    fn compare(&self, a: &Embedding, b: &Embedding) -> bool {
        (**self).compare(a, b)
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

/// YuNet + SFace running on ONNX Runtime.
pub struct OnnxOracle {
    pipeline: Pipeline,
    threshold: f32,
    model_id: String,
}

impl OnnxOracle {
    pub fn new(pipeline: Pipeline, threshold: f32, model_id: impl Into<String>) -> Self {
        Self {
            pipeline,
            threshold,
            model_id: model_id.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let paths = cfg.model_paths();
        let pipeline =
            Pipeline::new(&paths)?.with_thresholds(cfg.score_threshold, cfg.nms_threshold);
        let model_id = recognizer_id(&paths.recognizer)?;
        Ok(Self::new(pipeline, cfg.threshold, model_id))
    }
}

/// The recognizer file's path, size and mtime. Swapping the model file changes it.
fn recognizer_id(path: &Path) -> anyhow::Result<String> {
    let fp = Fingerprint::of(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
    Ok(format!(
        "{}:{}:{}.{:09}",
        path.display(),
        fp.len,
        fp.modified_secs,
        fp.modified_nanos
    ))
}

impl FaceOracle for OnnxOracle {
    fn detect_and_encode(&mut self, image: &Path) -> Result<Option<Embedding>, OracleError> {
        let img = image::open(image).map_err(|source| OracleError::Image {
            path: image.to_path_buf(),
            source,
        })?;
        self.pipeline
            .extract_embedding(&img)
            .map_err(|e| OracleError::Inference {
                path: image.to_path_buf(),
                message: format!("{:#}", e),
            })
    }

    fn similarity(&self, a: &Embedding, b: &Embedding) -> f32 {
        face::match_embedding(a, b)
    }

    fn compare(&self, a: &Embedding, b: &Embedding) -> bool {
        a.len() == b.len() && self.similarity(a, b) >= self.threshold
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizer_id_follows_the_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sface.onnx");
        std::fs::write(&path, "v1").unwrap();
        let first = recognizer_id(&path).unwrap();
        std::fs::write(&path, "v2 weights").unwrap();
        let second = recognizer_id(&path).unwrap();

        assert!(first.starts_with(&path.display().to_string()));
        assert_ne!(first, second);
        assert!(recognizer_id(&dir.path().join("missing.onnx")).is_err());
    }
}
