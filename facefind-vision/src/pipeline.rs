use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;

use crate::face::{self, Detection, Embedding};
use crate::{align, model, yunet};

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.6;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.3;

/// Full pipeline: detect faces → align → encode
pub struct Pipeline {
    detector: Session,
    encoder: Session,
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl Pipeline {
    /// Build from the weight files in `model_dir`.
    pub fn from_dir(model_dir: &Path) -> Result<Self> {
        Ok(Self {
            detector: model::detector_session(model_dir)?,
            encoder: model::recog_session(model_dir)?,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        })
    }

    pub fn with_thresholds(mut self, score_threshold: f32, nms_threshold: f32) -> Self {
        self.score_threshold = score_threshold;
        self.nms_threshold = nms_threshold;
        self
    }

    pub fn detect(&mut self, img: &DynamicImage) -> Result<Vec<Detection>> {
        yunet::detect_faces(
            &mut self.detector,
            img,
            self.score_threshold,
            self.nms_threshold,
        )
        .context("detecting faces")
    }

    /// Every detected face with its embedding, highest score first.
    pub fn describe_all(&mut self, img: &DynamicImage) -> Result<Vec<(Detection, Embedding)>> {
        let detections = self.detect(img)?;
        let mut faces = Vec::with_capacity(detections.len());
        for detection in detections {
            let crop = align::align_face(img, &detection).context("aligning face")?;
            let embedding =
                face::encode_face(&mut self.encoder, &crop).context("encoding face")?;
            faces.push((detection, embedding));
        }
        Ok(faces)
    }

    /// Embedding of the highest scoring face, `None` when nothing is detected.
    pub fn describe_best(&mut self, img: &DynamicImage) -> Result<Option<(Detection, Embedding)>> {
        let best = self
            .detect(img)?
            .into_iter()
            .max_by(|a, b| a.score.total_cmp(&b.score));
        let Some(detection) = best else {
            return Ok(None);
        };
        let crop = align::align_face(img, &detection).context("aligning face")?;
        let embedding = face::encode_face(&mut self.encoder, &crop).context("encoding face")?;
        Ok(Some((detection, embedding)))
    }
}
