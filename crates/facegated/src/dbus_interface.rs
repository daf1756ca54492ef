use crate::config::DetectorKind;
use crate::enrollment::{self, EnrollmentError};
use facegate_core::{Descriptor, Embedder, FaceDetector, FaceEngine, FaceError, RawImage, RecognitionResult};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use zbus::interface;

pub const BUS_NAME: &str = "org.facegate.Engine1";
pub const OBJECT_PATH: &str = "/org/facegate/Engine1";

/// Engine with backends chosen at runtime.
pub type Engine = FaceEngine<Box<dyn FaceDetector>, Box<dyn Embedder>>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("cannot open image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("blocking file task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
    #[error("malformed request: {0}")]
    Request(#[from] serde_json::Error),
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(e: ServiceError) -> Self {
        let caller_fault = match &e {
            ServiceError::Image { .. } | ServiceError::Request(_) => true,
            ServiceError::Face(face) => !face.is_backend_failure(),
            ServiceError::Blocking(_) | ServiceError::Enrollment(_) => false,
        };
        if caller_fault {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        } else {
            tracing::error!(error = %e, "request failed");
            zbus::fdo::Error::Failed(e.to_string())
        }
    }
}

/// Reply of `IdentifyImage`.
#[derive(Debug, Serialize)]
struct Identification {
    face_found: bool,
    #[serde(flatten)]
    result: RecognitionResult,
}

/// D-Bus interface for the facegate recognition daemon.
///
/// Bus name: org.facegate.Engine1
/// Object path: /org/facegate/Engine1
pub struct FacegateService {
    engine: Arc<Engine>,
    enrollment_file: PathBuf,
    detector: DetectorKind,
}

impl FacegateService {
    pub fn new(engine: Arc<Engine>, enrollment_file: PathBuf, detector: DetectorKind) -> Self {
        Self { engine, enrollment_file, detector }
    }

    /// Replace the engine cache with the contents of the enrollment file.
    pub fn load_enrollment_file(&self) -> Result<usize, ServiceError> {
        let list = enrollment::read(&self.enrollment_file)?;
        Ok(self.engine.update_descriptors(enrollment::descriptor_pairs(list))?)
    }

    /// [`load_enrollment_file`](Self::load_enrollment_file) with the read and
    /// parse moved off the async task.
    async fn reload_from_file(&self) -> Result<usize, ServiceError> {
        let path = self.enrollment_file.clone();
        let list = tokio::task::spawn_blocking(move || enrollment::read(&path)).await??;
        Ok(self.engine.update_descriptors(enrollment::descriptor_pairs(list))?)
    }

    async fn descriptor_json(&self, image_path: &str) -> Result<String, ServiceError> {
        let image = open_image(image_path).await?;
        let descriptor = self.engine.descriptor_from_image(image).await?;
        Ok(serde_json::to_string(&descriptor)?)
    }

    async fn check_face_json(&self, image_path: &str) -> Result<String, ServiceError> {
        let image = open_image(image_path).await?;
        if !self.engine.check_image_normalized(&image) {
            return Err(FaceError::InvalidImage(format!(
                "{image_path} is not a {0}x{0} 8-bit face crop",
                facegate_core::CANONICAL_SIZE
            ))
            .into());
        }
        let result = self.engine.recognize(image).await?;
        Ok(serde_json::to_string(&result)?)
    }

    async fn identify_json(&self, image_path: &str) -> Result<String, ServiceError> {
        let image = open_image(image_path).await?;
        let reply = match self.engine.identify(image).await? {
            Some(result) => Identification { face_found: true, result },
            None => Identification { face_found: false, result: RecognitionResult::unknown(None) },
        };
        Ok(serde_json::to_string(&reply)?)
    }

    fn check_descriptor_json(&self, descriptor_json: &str) -> Result<String, ServiceError> {
        let descriptor: Descriptor = serde_json::from_str(descriptor_json)?;
        let result = self.engine.recognize_by_descriptor(&descriptor)?;
        Ok(serde_json::to_string(&result)?)
    }

    fn replace_descriptors(&self, enrollments_json: &str) -> Result<usize, ServiceError> {
        let list = enrollment::parse(enrollments_json)?;
        Ok(self.engine.update_descriptors(enrollment::descriptor_pairs(list))?)
    }

    fn status_json(&self) -> String {
        let recognizer = self.engine.recognizer();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "detector": self.detector.as_str(),
            "workers": self.engine.workers(),
            "descriptor_dimension": recognizer.dimension(),
            "match_threshold": recognizer.threshold(),
            "enrolled": recognizer.snapshot().len(),
            "enrollment_file": self.enrollment_file.display().to_string(),
        })
        .to_string()
    }
}

#[interface(name = "org.facegate.Engine1")]
impl FacegateService {
    /// Descriptor of the largest face in an image, as a JSON array.
    async fn calculate_descriptor(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, "calculate_descriptor requested");
        Ok(self.descriptor_json(image_path).await?)
    }

    /// Match an already normalized 112×112 face crop.
    async fn check_face(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, "check_face requested");
        Ok(self.check_face_json(image_path).await?)
    }

    /// Detect, normalize and match a raw image.
    async fn identify_image(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, "identify_image requested");
        Ok(self.identify_json(image_path).await?)
    }

    /// Match a JSON descriptor.
    async fn check_descriptor(&self, descriptor_json: &str) -> zbus::fdo::Result<String> {
        tracing::info!("check_descriptor requested");
        Ok(self.check_descriptor_json(descriptor_json)?)
    }

    /// Replace all enrolled descriptors with a JSON enrollment list.
    async fn update_descriptors(&self, enrollments_json: &str) -> zbus::fdo::Result<u32> {
        tracing::info!("update_descriptors requested");
        let count = self.replace_descriptors(enrollments_json)?;
        Ok(count as u32)
    }

    /// Re-read the enrollment file.
    async fn reload_enrollments(&self) -> zbus::fdo::Result<u32> {
        tracing::info!(path = %self.enrollment_file.display(), "reload_enrollments requested");
        let count = self.reload_from_file().await?;
        Ok(count as u32)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json())
    }
}

async fn open_image(path: &str) -> Result<RawImage, ServiceError> {
    let owned = path.to_string();
    let decoded = tokio::task::spawn_blocking(move || image::open(owned)).await?;
    decoded
        .map(RawImage::from)
        .map_err(|source| ServiceError::Image { path: path.to_string(), source })
}
