use anyhow::Result;
use facegate_vision::{face, ModelPaths, Pipeline};
use std::path::PathBuf;

/// Models are large and not vendored; point FACEGATE_MODEL_DIR at a directory
/// holding the YuNet and SFace exports to run these.
fn model_paths() -> Option<ModelPaths> {
    let dir = PathBuf::from(std::env::var_os("FACEGATE_MODEL_DIR")?);
    let paths = ModelPaths::in_dir(&dir);
    (paths.detector.exists() && paths.recognizer.exists()).then_some(paths)
}

#[test]
fn test_pipeline_initialization() -> Result<()> {
    env_logger::try_init().ok();
    let Some(paths) = model_paths() else {
        eprintln!("Skipping: FACEGATE_MODEL_DIR not set");
        return Ok(());
    };
    let _pipeline = Pipeline::new(&paths)?;
    Ok(())
}

#[test]
fn blank_image_has_no_face() -> Result<()> {
    env_logger::try_init().ok();
    let Some(paths) = model_paths() else {
        eprintln!("Skipping: FACEGATE_MODEL_DIR not set");
        return Ok(());
    };
    let mut pipeline = Pipeline::new(&paths)?;
    let blank = image::DynamicImage::new_rgb8(320, 240);
    assert!(pipeline.extract_embedding(&blank)?.is_none());
    Ok(())
}

#[test]
fn same_image_encodes_identically() -> Result<()> {
    env_logger::try_init().ok();
    let Some(paths) = model_paths() else {
        eprintln!("Skipping: FACEGATE_MODEL_DIR not set");
        return Ok(());
    };
    let Some(sample) = std::env::var_os("FACEGATE_SAMPLE_FACE") else {
        eprintln!("Skipping: FACEGATE_SAMPLE_FACE not set");
        return Ok(());
    };

    let mut pipeline = Pipeline::new(&paths)?;
    let img = image::open(sample)?;
    let a = pipeline
        .extract_embedding(&img)?
        .expect("sample image should contain a face");
    let b = pipeline
        .extract_embedding(&img)?
        .expect("sample image should contain a face");

    assert_eq!(a.len(), 128);
    assert!(face::match_embedding(&a, &b) > 0.99);
    Ok(())
}
