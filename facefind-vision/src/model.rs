use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ort::{
    ep::{self, ExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
};

/// An ONNX weight file and where it lives relative to the model CDN root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelAsset {
    pub file_name: &'static str,
    pub remote_path: &'static str,
}

pub const DETECTOR: ModelAsset = ModelAsset {
    file_name: "face_detection_yunet_2023mar.onnx",
    remote_path: "face_detection_yunet/face_detection_yunet_2023mar.onnx",
};

pub const RECOGNIZER: ModelAsset = ModelAsset {
    file_name: "face_recognition_sface_2021dec.onnx",
    remote_path: "face_recognition_sface/face_recognition_sface_2021dec.onnx",
};

pub const ASSETS: [ModelAsset; 2] = [DETECTOR, RECOGNIZER];

pub const DEFAULT_MODEL_BASE_URL: &str =
    "https://media.githubusercontent.com/media/opencv/opencv_zoo/main/models";

impl ModelAsset {
    pub fn local_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name)
    }

    pub fn remote_url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.remote_path)
    }
}

/// Returns the assets not yet present in `dir`.
pub fn missing_assets(dir: &Path) -> Vec<ModelAsset> {
    ASSETS
        .iter()
        .copied()
        .filter(|asset| !asset.local_path(dir).is_file())
        .collect()
}

pub fn session_builder() -> Result<SessionBuilder> {
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    #[cfg(feature = "openvino")]
    {
        let ep = ep::OpenVINO::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("openvino feature is enabled, onnx runtime not compiled with openvino")
        }
    }

    #[cfg(feature = "cuda")]
    {
        let ep = ep::CUDA::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("cuda feature is enabled, onnx runtime not compiled with cuda")
        }
    }

    Ok(builder)
}

fn session_from(dir: &Path, asset: ModelAsset) -> Result<Session> {
    let path = asset.local_path(dir);
    session_builder()?
        .commit_from_file(&path)
        .with_context(|| format!("load {}", path.display()))
}

pub fn detector_session(dir: &Path) -> Result<Session> {
    session_from(dir, DETECTOR)
}

pub fn recog_session(dir: &Path) -> Result<Session> {
    session_from(dir, RECOGNIZER)
}
