use crate::detector::DetectorError;
use crate::embedder::EmbedderError;
use thiserror::Error;

/// Everything a recognition request can end in, short of a result.
#[derive(Error, Debug)]
pub enum FaceError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("no face found in image")]
    NoFaceFound,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("backend lock poisoned: {0}")]
    Poisoned(&'static str),
    #[error("engine worker pool stopped")]
    EngineStopped,
    #[error("failed to start engine worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

impl FaceError {
    /// True for faults inside the engine; false for outcomes caused by the input.
    pub fn is_backend_failure(&self) -> bool {
        !matches!(
            self,
            FaceError::InvalidImage(_) | FaceError::InvalidDescriptor(_) | FaceError::NoFaceFound
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_classification() {
        assert!(!FaceError::NoFaceFound.is_backend_failure());
        assert!(!FaceError::InvalidImage("rank".into()).is_backend_failure());
        assert!(!FaceError::InvalidDescriptor("len".into()).is_backend_failure());
        assert!(FaceError::EngineStopped.is_backend_failure());
        assert!(FaceError::from(DetectorError::InferenceFailed("x".into())).is_backend_failure());
    }
}
