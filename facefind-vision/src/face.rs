use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::{Array1, Array4};
use ort::{session::Session, value::Value};

use crate::align::ALIGNED_SIZE;

/// A detected face in source image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    // right eye, left eye, nose tip, right mouth corner, left mouth corner
    pub landmarks: [f32; 10],
}

impl Detection {
    pub fn area(&self) -> f32 {
        self.bbox[2].max(0.0) * self.bbox[3].max(0.0)
    }
}

/// Face embedding (SFace output), L2-normalised.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Array1<f32>,
}

impl Embedding {
    pub fn new(vector: Array1<f32>) -> Self {
        Self { vector }
    }

    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}

/// Same-person cutoff for SFace embeddings under [`distance`]: OpenCV's
/// published L2 threshold, equivalent to cosine similarity 0.363.
pub const SAME_PERSON_DISTANCE: f32 = 1.128;

/// Euclidean distance between two embeddings, `None` when dimensions differ.
///
/// For unit vectors this is `sqrt(2 - 2 cos)`, so 0 means identical and 2
/// means opposite.
pub fn distance(a: &Embedding, b: &Embedding) -> Option<f32> {
    if a.dim() != b.dim() {
        return None;
    }
    let sum: f32 = a
        .vector
        .iter()
        .zip(b.vector.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    Some(sum.sqrt())
}

pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Greedy non-maximum suppression, highest score first.
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::with_capacity(sorted.len());
    for candidate in sorted {
        if keep
            .iter()
            .all(|kept| iou(&kept.bbox, &candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let w = (a[0] + a[2]).min(b[0] + b[2]) - a[0].max(b[0]);
    let h = (a[1] + a[3]).min(b[1] + b[3]) - a[1].max(b[1]);
    if w <= 0.0 || h <= 0.0 {
        return 0.0;
    }
    let inter = w * h;
    inter / (a[2] * a[3] + b[2] * b[3] - inter)
}

/// Encode an aligned 112x112 face crop with SFace.
pub fn encode_face(session: &mut Session, face: &RgbImage) -> Result<Embedding> {
    let side = ALIGNED_SIZE as usize;
    anyhow::ensure!(
        face.width() == ALIGNED_SIZE && face.height() == ALIGNED_SIZE,
        "aligned face must be {side}x{side}, got {}x{}",
        face.width(),
        face.height()
    );

    // SFace takes planar RGB in raw 0..255 range
    let mut input = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = pixel[c] as f32;
        }
    }

    let outputs = session.run(ort::inputs![Value::from_array(input)?])?;
    let (_shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .context("reading recognizer output")?;

    let mut vector = data.to_vec();
    anyhow::ensure!(!vector.is_empty(), "recognizer returned an empty embedding");
    l2_normalize(&mut vector);

    Ok(Embedding::new(Array1::from(vector)))
}
