//! YuNet detector post-processing.
//!
//! The 2023mar export emits twelve tensors, four heads for each of the
//! strides 8, 16 and 32, in this order:
//! `cls_8, cls_16, cls_32, obj_8, obj_16, obj_32, bbox_8, bbox_16, bbox_32,
//! kps_8, kps_16, kps_32`.
//!
//! Every grid cell predicts one face. Decoding per cell `(row, col)`:
//! - score = sqrt(clamp(cls) * clamp(obj))
//! - cx = (col + dx) * stride, cy = (row + dy) * stride
//! - w = exp(dw) * stride, h = exp(dh) * stride
//! - landmark k = ((col + kx) * stride, (row + ky) * stride)
//!
//! Coordinates are returned normalised to `[0, 1]` of the network input.

use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView2};

pub const STRIDES: [usize; 3] = [8, 16, 32];

#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h (normalized)
    pub score: f32,
    pub landmarks: [f32; 10], // 5 points, x/y interleaved (normalized)
}

/// Heads belonging to a single stride.
#[derive(Debug, Clone)]
pub struct ScaleOutputs {
    pub stride: usize,
    pub cls: Array2<f32>,
    pub obj: Array2<f32>,
    pub bbox: Array2<f32>,
    pub kps: Array2<f32>,
}

impl ScaleOutputs {
    fn grid(&self, input_size: usize) -> usize {
        input_size / self.stride
    }
}

fn head(
    outputs: &[(&[i64], &[f32])],
    index: usize,
    cells: usize,
    width: usize,
    name: &str,
) -> Result<Array2<f32>> {
    let Some((shape, data)) = outputs.get(index) else {
        bail!("missing {} output at index {}", name, index);
    };
    let expected = [1, cells as i64, width as i64];
    if *shape != expected {
        bail!(
            "unexpected {} shape at index {}: {:?}, expected {:?}",
            name,
            index,
            shape,
            expected
        );
    }
    Ok(Array2::from_shape_vec((cells, width), data.to_vec())?)
}

/// Split raw network outputs into per-stride heads, validating shapes.
pub fn parse_outputs(
    outputs: &[(&[i64], &[f32])],
    input_size: usize,
) -> Result<Vec<ScaleOutputs>> {
    if outputs.len() < 12 {
        bail!("YuNet produced {} outputs, expected 12", outputs.len());
    }

    STRIDES
        .iter()
        .enumerate()
        .map(|(i, &stride)| {
            let side = input_size / stride;
            let cells = side * side;
            Ok(ScaleOutputs {
                stride,
                cls: head(outputs, i, cells, 1, "cls")?,
                obj: head(outputs, i + 3, cells, 1, "obj")?,
                bbox: head(outputs, i + 6, cells, 4, "bbox")?,
                kps: head(outputs, i + 9, cells, 10, "kps")?,
            })
        })
        .collect()
}

fn cell_score(cls: f32, obj: f32) -> f32 {
    (cls.clamp(0.0, 1.0) * obj.clamp(0.0, 1.0)).sqrt()
}

fn decode_cell(
    bbox: ArrayView2<'_, f32>,
    kps: ArrayView2<'_, f32>,
    idx: usize,
    row: usize,
    col: usize,
    stride: f32,
    input_size: f32,
) -> ([f32; 4], [f32; 10]) {
    let cx = (col as f32 + bbox[[idx, 0]]) * stride;
    let cy = (row as f32 + bbox[[idx, 1]]) * stride;
    let w = bbox[[idx, 2]].exp() * stride;
    let h = bbox[[idx, 3]].exp() * stride;

    let rect = [
        (cx - w / 2.0) / input_size,
        (cy - h / 2.0) / input_size,
        w / input_size,
        h / input_size,
    ];

    let mut landmarks = [0.0f32; 10];
    for k in 0..5 {
        landmarks[k * 2] = (col as f32 + kps[[idx, k * 2]]) * stride / input_size;
        landmarks[k * 2 + 1] = (row as f32 + kps[[idx, k * 2 + 1]]) * stride / input_size;
    }
    (rect, landmarks)
}

/// Decode every grid cell scoring at least `score_threshold`.
pub fn decode_detections(
    scales: &[ScaleOutputs],
    score_threshold: f32,
    input_size: usize,
) -> Result<Vec<RawDetection>> {
    let mut detections = Vec::new();

    for scale in scales {
        let side = scale.grid(input_size);
        if scale.cls.nrows() != side * side {
            bail!(
                "expected {} cells for stride {} ({}x{} grid), got {}",
                side * side,
                scale.stride,
                side,
                side,
                scale.cls.nrows()
            );
        }

        for row in 0..side {
            for col in 0..side {
                let idx = row * side + col;
                let score = cell_score(scale.cls[[idx, 0]], scale.obj[[idx, 0]]);
                if score < score_threshold {
                    continue;
                }
                let (bbox, landmarks) = decode_cell(
                    scale.bbox.view(),
                    scale.kps.view(),
                    idx,
                    row,
                    col,
                    scale.stride as f32,
                    input_size as f32,
                );
                detections.push(RawDetection {
                    bbox,
                    score,
                    landmarks,
                });
            }
        }
    }

    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn empty_scales(input_size: usize) -> Vec<ScaleOutputs> {
        STRIDES
            .iter()
            .map(|&stride| {
                let cells = (input_size / stride).pow(2);
                ScaleOutputs {
                    stride,
                    cls: Array2::zeros((cells, 1)),
                    obj: Array2::zeros((cells, 1)),
                    bbox: Array2::zeros((cells, 4)),
                    kps: Array2::zeros((cells, 10)),
                }
            })
            .collect()
    }

    #[test]
    fn score_is_geometric_mean_of_heads() {
        assert_relative_eq!(cell_score(0.81, 1.0), 0.9, epsilon = 1e-6);
        assert_relative_eq!(cell_score(1.5, 0.25), 0.5, epsilon = 1e-6);
        assert_eq!(cell_score(-0.2, 0.9), 0.0);
    }

    #[test]
    fn decodes_single_cell_on_coarsest_grid() {
        let input_size = 640;
        let mut scales = empty_scales(input_size);
        let coarse = &mut scales[2];
        // row 10, col 10 on the 20x20 grid
        let idx = 10 * 20 + 10;
        coarse.cls[[idx, 0]] = 0.81;
        coarse.obj[[idx, 0]] = 1.0;
        coarse.bbox[[idx, 0]] = 0.5;
        coarse.bbox[[idx, 1]] = 0.25;
        coarse.bbox[[idx, 2]] = 4.0f32.ln();
        coarse.bbox[[idx, 3]] = 4.0f32.ln();

        let detections = decode_detections(&scales, 0.5, input_size).unwrap();
        assert_eq!(detections.len(), 1);
        let det = &detections[0];

        // cx = 10.5 * 32 = 336, cy = 10.25 * 32 = 328, w = h = 128
        assert_relative_eq!(det.bbox[0], (336.0 - 64.0) / 640.0, epsilon = 1e-5);
        assert_relative_eq!(det.bbox[1], (328.0 - 64.0) / 640.0, epsilon = 1e-5);
        assert_relative_eq!(det.bbox[2], 0.2, epsilon = 1e-5);
        assert_relative_eq!(det.bbox[3], 0.2, epsilon = 1e-5);
        assert_relative_eq!(det.score, 0.9, epsilon = 1e-5);
        assert_relative_eq!(det.landmarks[0], 0.5, epsilon = 1e-5);
        assert_relative_eq!(det.landmarks[1], 0.5, epsilon = 1e-5);
    }

    #[test]
    fn below_threshold_cells_are_dropped() {
        let mut scales = empty_scales(320);
        scales[0].cls[[0, 0]] = 0.1;
        scales[0].obj[[0, 0]] = 0.1;
        assert!(decode_detections(&scales, 0.5, 320).unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_wrong_shapes() {
        let shape: [i64; 3] = [1, 3, 1];
        let data = [0.0f32; 3];
        let outputs: Vec<(&[i64], &[f32])> = (0..12).map(|_| (&shape[..], &data[..])).collect();
        let err = parse_outputs(&outputs, 640).unwrap_err();
        assert!(err.to_string().contains("cls"));
    }

    #[test]
    fn parse_rejects_short_output_list() {
        assert!(parse_outputs(&[], 640).is_err());
    }
}
