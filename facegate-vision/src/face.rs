use crate::yunet;
use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, RgbImage};
use ndarray::{Array1, Array4};
use ort::{session::Session, value::Tensor};

/// YuNet input resolution.
pub const DETECTOR_INPUT: u32 = 640;
/// SFace input resolution.
pub const ALIGNED_SIZE: u32 = 112;

/// Detection result from YuNet, in source image pixels
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // right eye, left eye, nose, mouth right, mouth left
}

/// Face feature vector produced by the recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Array1<f32>,
}

impl Embedding {
    pub fn from_vec(values: Vec<f32>) -> Self {
        Self {
            vector: Array1::from(values),
        }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.vector.to_vec()
    }

    pub fn len(&self) -> usize {
        self.vector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }

    /// Scale to unit length. Zero vectors are left untouched.
    pub fn normalized(mut self) -> Self {
        let norm = self.vector.dot(&self.vector).sqrt();
        if norm > 0.0 {
            self.vector.mapv_inplace(|x| x / norm);
        }
        self
    }
}

/// Square canvas the detector runs on, plus the mapping back to the source.
struct Letterbox {
    canvas: RgbImage,
    scale: f32,
    offset_x: f32,
    offset_y: f32,
}

impl Letterbox {
    fn new(img: &DynamicImage, size: u32) -> Self {
        let (w, h) = img.dimensions();
        let scale = size as f32 / w.max(h).max(1) as f32;
        let new_w = ((w as f32 * scale) as u32).clamp(1, size);
        let new_h = ((h as f32 * scale) as u32).clamp(1, size);
        let resized = img
            .resize_exact(new_w, new_h, image::imageops::FilterType::Triangle)
            .to_rgb8();

        let offset_x = (size - new_w) / 2;
        let offset_y = (size - new_h) / 2;
        let mut canvas = RgbImage::new(size, size);
        image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

        Self {
            canvas,
            scale,
            offset_x: offset_x as f32,
            offset_y: offset_y as f32,
        }
    }

    /// Map a normalized canvas coordinate back to source pixels.
    fn unmap(&self, v: f32, offset: f32) -> f32 {
        (v * self.canvas.width() as f32 - offset) / self.scale
    }

    fn restore(&self, raw: yunet::RawDetection) -> Detection {
        let mut landmarks = [0.0f32; 10];
        for (i, lm) in raw.landmarks.iter().enumerate() {
            let offset = if i % 2 == 0 { self.offset_x } else { self.offset_y };
            landmarks[i] = self.unmap(*lm, offset);
        }
        let side = self.canvas.width() as f32 / self.scale;
        Detection {
            bbox: [
                self.unmap(raw.bbox[0], self.offset_x),
                self.unmap(raw.bbox[1], self.offset_y),
                raw.bbox[2] * side,
                raw.bbox[3] * side,
            ],
            score: raw.score,
            landmarks,
        }
    }
}

/// Planar BGR `[1, 3, H, W]` tensor with raw 0..255 values, as both models expect.
pub fn bgr_planes(img: &RgbImage) -> Result<Array4<f32>> {
    let (w, h) = img.dimensions();
    let pixel_count = (w * h) as usize;
    let mut data = vec![0.0f32; 3 * pixel_count];
    let (b, rest) = data.split_at_mut(pixel_count);
    let (g, r) = rest.split_at_mut(pixel_count);

    for (i, px) in img.as_raw().chunks_exact(3).enumerate() {
        r[i] = px[0] as f32;
        g[i] = px[1] as f32;
        b[i] = px[2] as f32;
    }

    Ok(Array4::from_shape_vec((1, 3, h as usize, w as usize), data)?)
}

/// Detect faces in an image using the YuNet detector
pub fn detect_faces(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    let letterbox = Letterbox::new(img, DETECTOR_INPUT);
    let input = Tensor::from_array(bgr_planes(&letterbox.canvas)?)?;
    let outputs = session.run(ort::inputs![input])?;

    let mut raw_outputs: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        raw_outputs.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let refs: Vec<(&[i64], &[f32])> = raw_outputs
        .iter()
        .map(|(s, d)| (s.as_slice(), d.as_slice()))
        .collect();

    let scales = yunet::parse_outputs(&refs, DETECTOR_INPUT as usize)?;
    let raw = yunet::decode_detections(&scales, score_threshold, DETECTOR_INPUT as usize)?;
    log::debug!("yunet: {} candidate(s) above {:.2}", raw.len(), score_threshold);

    let detections: Vec<Detection> = raw.into_iter().map(|d| letterbox.restore(d)).collect();

    if nms_threshold < 1.0 {
        Ok(nms(&detections, nms_threshold))
    } else {
        Ok(detections)
    }
}

/// Apply non-maximum suppression to remove overlapping detections
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in sorted {
        if keep
            .iter()
            .all(|kept| compute_iou(&kept.bbox, &candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

pub fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    inter / (a[2] * a[3] + b[2] * b[3] - inter)
}

/// Similarity transform `out = M * in + t` stored as `[a, b, tx, c, d, ty]`.
fn eye_transform(detection: &Detection, size: u32) -> Option<[f32; 6]> {
    // ArcFace reference eye positions for a 112x112 crop
    const REF_LEFT: (f32, f32) = (38.2946, 51.6963);
    const REF_RIGHT: (f32, f32) = (73.5318, 51.5014);

    // YuNet emits the subject's right eye first, which sits on the image left
    let left = (detection.landmarks[0], detection.landmarks[1]);
    let right = (detection.landmarks[2], detection.landmarks[3]);

    let dx = right.0 - left.0;
    let dy = right.1 - left.1;
    let actual = (dx * dx + dy * dy).sqrt();
    if actual < f32::EPSILON {
        return None;
    }

    let unit = size as f32 / ALIGNED_SIZE as f32;
    let ref_dx = (REF_RIGHT.0 - REF_LEFT.0) * unit;
    let ref_dy = (REF_RIGHT.1 - REF_LEFT.1) * unit;
    let ref_dist = (ref_dx * ref_dx + ref_dy * ref_dy).sqrt();

    let scale = ref_dist / actual;
    let angle = ref_dy.atan2(ref_dx) - dy.atan2(dx);
    let (sin, cos) = angle.sin_cos();

    let a = scale * cos;
    let b = -scale * sin;
    let c = scale * sin;
    let d = scale * cos;

    let src_center = ((left.0 + right.0) / 2.0, (left.1 + right.1) / 2.0);
    let dst_center = (
        (REF_LEFT.0 + REF_RIGHT.0) / 2.0 * unit,
        (REF_LEFT.1 + REF_RIGHT.1) / 2.0 * unit,
    );
    let tx = dst_center.0 - (a * src_center.0 + b * src_center.1);
    let ty = dst_center.1 - (c * src_center.0 + d * src_center.1);
    Some([a, b, tx, c, d, ty])
}

fn bilinear(img: &RgbImage, x: f32, y: f32) -> [u8; 3] {
    let (w, h) = img.dimensions();
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let weights = [
        (x0, y0, (1.0 - fx) * (1.0 - fy)),
        (x1, y0, fx * (1.0 - fy)),
        (x0, y1, (1.0 - fx) * fy),
        (x1, y1, fx * fy),
    ];

    let mut acc = [0.0f32; 3];
    for (px, py, wgt) in weights {
        let p = img.get_pixel(px, py);
        for ch in 0..3 {
            acc[ch] += p[ch] as f32 * wgt;
        }
    }
    acc.map(|v| v.round().clamp(0.0, 255.0) as u8)
}

/// Warp the face so its eyes land on the ArcFace reference points.
pub fn align_face(img: &DynamicImage, detection: &Detection, size: u32) -> Result<DynamicImage> {
    let [a, b, tx, c, d, ty] =
        eye_transform(detection, size).context("degenerate eye landmarks")?;
    let det = a * d - b * c;

    let src = img.to_rgb8();
    let (w, h) = src.dimensions();
    let mut output = RgbImage::new(size, size);

    for out_y in 0..size {
        for out_x in 0..size {
            let px = out_x as f32 - tx;
            let py = out_y as f32 - ty;
            let in_x = (d * px - b * py) / det;
            let in_y = (-c * px + a * py) / det;

            // outside the source stays black
            if in_x >= 0.0 && in_x < w as f32 && in_y >= 0.0 && in_y < h as f32 {
                output.put_pixel(out_x, out_y, image::Rgb(bilinear(&src, in_x, in_y)));
            }
        }
    }

    Ok(DynamicImage::ImageRgb8(output))
}

/// Encode an aligned face with SFace. The result is L2-normalized.
pub fn encode_face(session: &mut Session, face_img: &DynamicImage) -> Result<Embedding> {
    let face = face_img
        .resize_exact(ALIGNED_SIZE, ALIGNED_SIZE, image::imageops::FilterType::Triangle)
        .to_rgb8();
    let input = Tensor::from_array(bgr_planes(&face)?)?;

    let outputs = session.run(ort::inputs![input])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    // Expecting shape [1, 128]
    let len = if shape.len() == 2 {
        shape[1] as usize
    } else {
        data.len()
    };
    if len == 0 || len > data.len() {
        anyhow::bail!("recognizer returned malformed output {:?}", shape);
    }

    Ok(Embedding::from_vec(data[..len].to_vec()).normalized())
}

/// Cosine similarity in `[-1, 1]`.
///
/// Encodings of different lengths come from different recognizers and score 0.
pub fn match_embedding(a: &Embedding, b: &Embedding) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let norms = (a.vector.dot(&a.vector) * b.vector.dot(&b.vector)).sqrt();
    if norms <= 0.0 {
        return 0.0;
    }
    (a.vector.dot(&b.vector) / norms).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn detection(bbox: [f32; 4], score: f32) -> Detection {
        Detection {
            bbox,
            score,
            landmarks: [0.0; 10],
        }
    }

    #[test]
    fn test_iou() {
        let a = [10.0, 10.0, 20.0, 20.0];
        let b = [15.0, 15.0, 20.0, 20.0];
        let iou = compute_iou(&a, &b);
        assert_relative_eq!(iou, 225.0 / 575.0, epsilon = 1e-6);

        // No overlap
        let c = [100.0, 100.0, 10.0, 10.0];
        assert_eq!(compute_iou(&a, &c), 0.0);
    }

    #[test]
    fn test_nms() {
        let detections = vec![
            detection([10.0, 10.0, 20.0, 20.0], 0.8),
            detection([12.0, 12.0, 20.0, 20.0], 0.9),
            detection([100.0, 100.0, 20.0, 20.0], 0.85),
        ];

        let result = nms(&detections, 0.3);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].score, 0.9);
        assert_eq!(result[1].score, 0.85);
    }

    #[test]
    fn cosine_similarity_bounds() {
        let a = Embedding::from_vec(vec![1.0, 0.0, 0.0]);
        let b = Embedding::from_vec(vec![2.0, 0.0, 0.0]);
        let c = Embedding::from_vec(vec![0.0, 3.0, 0.0]);
        let d = Embedding::from_vec(vec![-1.0, 0.0, 0.0]);

        assert_relative_eq!(match_embedding(&a, &b), 1.0, epsilon = 1e-6);
        assert_relative_eq!(match_embedding(&a, &c), 0.0, epsilon = 1e-6);
        assert_relative_eq!(match_embedding(&a, &d), -1.0, epsilon = 1e-6);
    }

    #[test]
    fn zero_vectors_never_match() {
        let zero = Embedding::from_vec(vec![0.0; 4]);
        let one = Embedding::from_vec(vec![1.0; 4]);
        assert_eq!(match_embedding(&zero, &one), 0.0);
        assert_eq!(match_embedding(&Embedding::from_vec(vec![]), &one), 0.0);
    }

    #[test]
    fn different_lengths_never_match() {
        let short = Embedding::from_vec(vec![1.0, 0.0, 0.0]);
        let long = Embedding::from_vec(vec![1.0, 0.0, 0.0, 0.0, 0.0, 9.0, 9.0, 9.0]);
        assert_eq!(match_embedding(&short, &long), 0.0);
        assert_eq!(match_embedding(&long, &short), 0.0);
    }

    #[test]
    fn normalized_has_unit_length() {
        let e = Embedding::from_vec(vec![3.0, 4.0]).normalized();
        assert_relative_eq!(e.vector[0], 0.6, epsilon = 1e-6);
        assert_relative_eq!(e.vector[1], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn bgr_planes_swaps_channel_order() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgb([10, 20, 30]));
        img.put_pixel(1, 0, image::Rgb([40, 50, 60]));

        let t = bgr_planes(&img).unwrap();
        assert_eq!(t.shape(), &[1, 3, 1, 2]);
        assert_eq!(t[[0, 0, 0, 0]], 30.0);
        assert_eq!(t[[0, 1, 0, 1]], 50.0);
        assert_eq!(t[[0, 2, 0, 1]], 40.0);
    }

    #[test]
    fn letterbox_round_trips_coordinates() {
        let img = DynamicImage::new_rgb8(1280, 640);
        let lb = Letterbox::new(&img, DETECTOR_INPUT);
        assert_relative_eq!(lb.scale, 0.5);
        assert_relative_eq!(lb.offset_y, 160.0);

        // canvas center maps to source center
        assert_relative_eq!(lb.unmap(0.5, lb.offset_x), 640.0, epsilon = 1e-3);
        assert_relative_eq!(lb.unmap(0.5, lb.offset_y), 320.0, epsilon = 1e-3);
    }

    #[test]
    fn alignment_places_eyes_on_reference_points() {
        let mut det = detection([0.0, 0.0, 200.0, 200.0], 0.9);
        det.landmarks[..4].copy_from_slice(&[60.0, 90.0, 140.0, 90.0]);

        let [a, b, tx, c, d, ty] = eye_transform(&det, ALIGNED_SIZE).unwrap();
        let map = |x: f32, y: f32| (a * x + b * y + tx, c * x + d * y + ty);

        let (lx, ly) = map(60.0, 90.0);
        let (rx, ry) = map(140.0, 90.0);
        assert_relative_eq!(lx, 38.2946, epsilon = 0.2);
        assert_relative_eq!(ly, 51.6963, epsilon = 0.2);
        assert_relative_eq!(rx, 73.5318, epsilon = 0.2);
        assert_relative_eq!(ry, 51.5014, epsilon = 0.2);
    }

    #[test]
    fn coincident_eyes_cannot_be_aligned() {
        let img = DynamicImage::new_rgb8(32, 32);
        let det = detection([0.0, 0.0, 32.0, 32.0], 0.9);
        assert!(align_face(&img, &det, ALIGNED_SIZE).is_err());
    }

    #[test]
    fn aligned_output_has_requested_size() {
        let img = DynamicImage::new_rgb8(200, 200);
        let mut det = detection([0.0, 0.0, 200.0, 200.0], 0.9);
        det.landmarks[..4].copy_from_slice(&[60.0, 90.0, 140.0, 90.0]);
        let out = align_face(&img, &det, ALIGNED_SIZE).unwrap();
        assert_eq!(out.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }
}
