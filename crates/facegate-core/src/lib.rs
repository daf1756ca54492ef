//! facegate-core: face detection, normalization and recognition engine.
//!
//! A raw image is validated, its largest face is cropped and aligned to
//! 112×112, embedded with ArcFace and matched against an in-memory set of
//! enrolled descriptors. Detection runs either SCRFD (ONNX Runtime) or a
//! SeetaFace cascade; all inference happens on a dedicated worker pool.

pub mod alignment;
pub mod cache;
pub mod cascade;
pub mod detector;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod normalizer;
pub mod recognizer;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cascade::{CascadeDetector, CascadeParams};
pub use detector::{FaceDetector, ScrfdDetector};
pub use embedder::{ArcFaceEmbedder, Embedder};
pub use engine::{FaceEngine, WorkerPool, DEFAULT_WORKERS};
pub use error::FaceError;
pub use normalizer::FaceImageNormalizer;
pub use recognizer::{FaceRecognizer, DEFAULT_MATCH_THRESHOLD};
pub use types::{
    Descriptor, DescriptorId, EnrolledDescriptor, Image, OwnerId, RawImage, RecognitionResult, Rectangle,
    CANONICAL_SIZE,
};
