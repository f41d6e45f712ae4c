//! YuNet detector: input preparation and output decoding.
//!
//! YuNet (2023mar) is anchor-free. For each stride in 8, 16, 32 it emits four
//! heads over an `(640 / stride)^2` grid, named `cls_{s}`, `obj_{s}`,
//! `bbox_{s}` and `kps_{s}`. A cell at row `r`, column `c` decodes as
//!
//! ```text
//! score = sqrt(clamp(cls) * clamp(obj))
//! cx    = (c + dx) * stride          w = exp(dw) * stride
//! cy    = (r + dy) * stride          h = exp(dh) * stride
//! kp_n  = ((c + kx_n) * stride, (r + ky_n) * stride)
//! ```

use std::collections::HashMap;

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::Array4;
use ort::{session::Session, value::Value};

use crate::face::{self, Detection};

pub const INPUT_SIZE: u32 = 640;
const STRIDES: [usize; 3] = [8, 16, 32];

/// Raw head outputs keyed by tensor name.
pub type HeadOutputs = HashMap<String, Vec<f32>>;

/// Scale the image into the top-left corner of a black 640x640 canvas and
/// lay it out as a `[1, 3, 640, 640]` BGR tensor. Returns the tensor and the
/// scale factor applied to the source.
pub fn prepare_input(img: &DynamicImage) -> (Array4<f32>, f32) {
    let (width, height) = img.dimensions();
    let scale = INPUT_SIZE as f32 / width.max(height).max(1) as f32;
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let resized = img
        .resize_exact(new_w, new_h, FilterType::Triangle)
        .to_rgb8();

    let side = INPUT_SIZE as usize;
    let mut input = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        input[[0, 0, y, x]] = pixel[2] as f32;
        input[[0, 1, y, x]] = pixel[1] as f32;
        input[[0, 2, y, x]] = pixel[0] as f32;
    }
    (input, scale)
}

fn head<'a>(
    outputs: &'a HeadOutputs,
    kind: &str,
    stride: usize,
    cells: usize,
    width: usize,
) -> Result<&'a [f32]> {
    let name = format!("{kind}_{stride}");
    let data = outputs
        .get(&name)
        .with_context(|| format!("detector output {name} missing"))?;
    anyhow::ensure!(
        data.len() == cells * width,
        "detector output {name} has {} values, expected {}",
        data.len(),
        cells * width
    );
    Ok(data)
}

/// Decode every cell scoring at least `score_threshold` into a detection in
/// network input pixels (640x640 space). No NMS is applied here.
pub fn decode(outputs: &HeadOutputs, score_threshold: f32) -> Result<Vec<Detection>> {
    let mut detections = Vec::new();

    for stride in STRIDES {
        let grid = INPUT_SIZE as usize / stride;
        let cells = grid * grid;
        let cls = head(outputs, "cls", stride, cells, 1)?;
        let obj = head(outputs, "obj", stride, cells, 1)?;
        let bbox = head(outputs, "bbox", stride, cells, 4)?;
        let kps = head(outputs, "kps", stride, cells, 10)?;
        let s = stride as f32;

        for idx in 0..cells {
            let score = (cls[idx].clamp(0.0, 1.0) * obj[idx].clamp(0.0, 1.0)).sqrt();
            if score < score_threshold {
                continue;
            }
            let (row, col) = ((idx / grid) as f32, (idx % grid) as f32);

            let b = &bbox[idx * 4..idx * 4 + 4];
            let cx = (col + b[0]) * s;
            let cy = (row + b[1]) * s;
            let w = b[2].exp() * s;
            let h = b[3].exp() * s;

            let k = &kps[idx * 10..idx * 10 + 10];
            let mut landmarks = [0.0f32; 10];
            for n in 0..5 {
                landmarks[n * 2] = (col + k[n * 2]) * s;
                landmarks[n * 2 + 1] = (row + k[n * 2 + 1]) * s;
            }

            detections.push(Detection {
                bbox: [cx - w / 2.0, cy - h / 2.0, w, h],
                score,
                landmarks,
            });
        }
    }

    Ok(detections)
}

/// Map a detection from network input space back onto the source image.
pub fn rescale(detection: Detection, scale: f32) -> Detection {
    let mut out = detection;
    out.bbox.iter_mut().for_each(|v| *v /= scale);
    out.landmarks.iter_mut().for_each(|v| *v /= scale);
    out
}

/// Detect faces in an image with the YuNet session.
pub fn detect_faces(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    let (input, scale) = prepare_input(img);
    let outputs = session.run(ort::inputs![Value::from_array(input)?])?;

    let mut heads = HeadOutputs::new();
    for (name, value) in outputs.iter() {
        let (_shape, data) = value
            .try_extract_tensor::<f32>()
            .with_context(|| format!("reading detector output {name}"))?;
        heads.insert(name.to_string(), data.to_vec());
    }

    let raw = decode(&heads, score_threshold)?;
    log::debug!("yunet: {} candidates above {:.2}", raw.len(), score_threshold);

    let kept = face::nms(&raw, nms_threshold);
    Ok(kept.into_iter().map(|d| rescale(d, scale)).collect())
}
