//! Descriptor extraction + matching against the enrolled descriptor cache.

use crate::cache::{DescriptorCache, Snapshot};
use crate::embedder::{Embedder, EmbedderError};
use crate::error::FaceError;
use crate::types::{Descriptor, DescriptorId, Image, RawImage, RecognitionResult, CANONICAL_SIZE};
use std::sync::{Arc, Mutex};

/// Euclidean acceptance threshold for unit-length ArcFace descriptors
/// (≈ cosine similarity 0.395).
pub const DEFAULT_MATCH_THRESHOLD: f32 = 1.10;

/// Owns the embedder and the only copy of the descriptor cache.
pub struct FaceRecognizer<E> {
    embedder: Mutex<E>,
    dimension: usize,
    threshold: f32,
    cache: DescriptorCache,
}

impl<E: Embedder> FaceRecognizer<E> {
    /// Start with an empty cache; load it with [`update_descriptors`](Self::update_descriptors).
    pub fn new(embedder: E, threshold: f32) -> Self {
        let dimension = embedder.dimension();
        tracing::info!(dimension, threshold, "face recognizer ready");
        Self {
            embedder: Mutex::new(embedder),
            dimension,
            threshold,
            cache: DescriptorCache::default(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Read-only view of the enrolled descriptors.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.cache.snapshot()
    }

    pub fn check_descriptor_valid(&self, descriptor: &Descriptor) -> bool {
        descriptor.is_valid(self.dimension)
    }

    /// Raw-image validity plus the canonical crop size.
    pub fn check_image_normalized(&self, image: &RawImage) -> bool {
        image.validate().is_ok() && {
            let shape = image.shape();
            shape[0] == CANONICAL_SIZE && shape[1] == CANONICAL_SIZE
        }
    }

    fn ensure_normalized(&self, image: &Image) -> Result<(), FaceError> {
        if image.width() != CANONICAL_SIZE || image.height() != CANONICAL_SIZE {
            return Err(FaceError::InvalidImage(format!(
                "expected a {CANONICAL_SIZE}x{CANONICAL_SIZE} face crop, got {}x{}",
                image.width(),
                image.height()
            )));
        }
        Ok(())
    }

    /// Embed a normalized crop.
    pub fn calculate_descriptor(&self, image: &Image) -> Result<Descriptor, FaceError> {
        self.ensure_normalized(image)?;
        let descriptor = {
            let mut embedder = self.embedder.lock().map_err(|_| FaceError::Poisoned("embedder"))?;
            embedder.calculate_descriptor(image)?
        };
        if !self.check_descriptor_valid(&descriptor) {
            return Err(EmbedderError::InferenceFailed(format!(
                "backend produced an invalid descriptor (len {}, expected {})",
                descriptor.len(),
                self.dimension
            ))
            .into());
        }
        Ok(descriptor)
    }

    /// Embed a normalized crop and match it.
    pub fn recognize(&self, image: &Image) -> Result<RecognitionResult, FaceError> {
        let descriptor = self.calculate_descriptor(image)?;
        self.recognize_by_descriptor(&descriptor)
    }

    /// Match a descriptor against the current cache snapshot.
    pub fn recognize_by_descriptor(&self, descriptor: &Descriptor) -> Result<RecognitionResult, FaceError> {
        if !self.check_descriptor_valid(descriptor) {
            return Err(FaceError::InvalidDescriptor(format!(
                "expected {} finite values, got {}",
                self.dimension,
                descriptor.len()
            )));
        }
        let snapshot = self.cache.snapshot();
        let result = snapshot.match_descriptor(descriptor, self.threshold);
        tracing::debug!(
            enrolled = snapshot.len(),
            known = result.is_known_face,
            matched_id = ?result.matched_id,
            distance = ?result.distance,
            "descriptor matched"
        );
        Ok(result)
    }

    /// Replace the whole cache with `pairs`.
    ///
    /// The batch is rejected as a whole, leaving the cache untouched, if any
    /// descriptor has the wrong length or a non-finite value.
    pub fn update_descriptors(
        &self,
        pairs: impl IntoIterator<Item = (DescriptorId, Descriptor)>,
    ) -> Result<usize, FaceError> {
        let pairs: Vec<(DescriptorId, Descriptor)> = pairs.into_iter().collect();
        if let Some((id, bad)) = pairs.iter().find(|(_, d)| !self.check_descriptor_valid(d)) {
            tracing::warn!(id, len = bad.len(), "descriptor update rejected");
            return Err(FaceError::InvalidDescriptor(format!(
                "descriptor {id}: expected {} finite values, got {}",
                self.dimension,
                bad.len()
            )));
        }
        let count = self.cache.replace(Snapshot::from_pairs(pairs));
        tracing::info!(count, "descriptor cache replaced");
        Ok(count)
    }
}
