//! Detector + aligner composition: raw image in, canonical face crop out.

use crate::alignment::Aligner;
use crate::detector::FaceDetector;
use crate::error::FaceError;
use crate::types::{Image, RawImage, Rectangle};
use std::sync::Mutex;

/// Turns a validated image into the canonical crop of its largest face.
///
/// The detector sits behind a mutex so one instance can serve several worker
/// threads; calls are synchronous and CPU-bound.
pub struct FaceImageNormalizer<D> {
    detector: Mutex<D>,
    aligner: Aligner,
}

impl<D: FaceDetector> FaceImageNormalizer<D> {
    pub fn new(detector: D) -> Self {
        Self::with_aligner(detector, Aligner::default())
    }

    pub fn with_aligner(detector: D, aligner: Aligner) -> Self {
        Self { detector: Mutex::new(detector), aligner }
    }

    pub fn aligner(&self) -> &Aligner {
        &self.aligner
    }

    /// Sample type u8, rank 3, 1 or 3 channels. Pure predicate.
    pub fn check_image_valid(&self, image: &RawImage) -> bool {
        image.validate().is_ok()
    }

    /// Run the detector alone.
    pub fn find_faces(&self, image: &Image) -> Result<Vec<Rectangle>, FaceError> {
        let mut detector = self.detector.lock().map_err(|_| FaceError::Poisoned("detector"))?;
        Ok(detector.find_faces(image)?)
    }

    /// Detect, keep the largest face and align it.
    ///
    /// `Ok(None)` means the image has no face, which is not an error.
    pub fn normalize(&self, image: &Image) -> Result<Option<Image>, FaceError> {
        let faces = self.find_faces(image)?;
        let Some(face) = self.aligner.select_face(&faces) else {
            tracing::debug!(width = image.width(), height = image.height(), "no face detected");
            return Ok(None);
        };

        tracing::debug!(
            candidates = faces.len(),
            x = face.x,
            y = face.y,
            width = face.width,
            height = face.height,
            landmarks = face.landmarks.is_some(),
            "face selected for normalization"
        );
        Ok(Some(self.aligner.align(image, face)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gray_image, FailingDetector, FixedDetector};
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_check_image_valid() {
        let normalizer = FaceImageNormalizer::new(FixedDetector::new(vec![]));
        assert!(normalizer.check_image_valid(&RawImage::U8(ArrayD::zeros(IxDyn(&[8, 8, 3])))));
        assert!(!normalizer.check_image_valid(&RawImage::U8(ArrayD::zeros(IxDyn(&[8, 8, 4])))));
        assert!(!normalizer.check_image_valid(&RawImage::U8(ArrayD::zeros(IxDyn(&[8, 8])))));
        assert!(!normalizer.check_image_valid(&RawImage::F32(ArrayD::zeros(IxDyn(&[8, 8, 1])))));
    }

    #[test]
    fn test_no_face_is_not_an_error() {
        let normalizer = FaceImageNormalizer::new(FixedDetector::new(vec![]));
        let result = normalizer.normalize(&gray_image(64, 64, 10)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_picks_largest_face() {
        // Left quadrant dark, right quadrant bright; the bright face is larger.
        let (w, h) = (200usize, 100usize);
        let data: Vec<u8> = (0..w * h).map(|i| if i % w < 100 { 20 } else { 220 }).collect();
        let image = Image::from_gray(w, h, data).unwrap();

        let normalizer = FaceImageNormalizer::new(FixedDetector::new(vec![
            Rectangle::new(10, 10, 40, 40),
            Rectangle::new(120, 10, 60, 60),
        ]));
        let crop = normalizer.normalize(&image).unwrap().unwrap();
        assert_eq!((crop.width(), crop.height()), (112, 112));
        assert!(crop.pixels().iter().all(|&p| p == 220));
    }

    #[test]
    fn test_area_tie_picks_first_returned() {
        let (w, h) = (200usize, 100usize);
        let data: Vec<u8> = (0..w * h).map(|i| if i % w < 100 { 20 } else { 220 }).collect();
        let image = Image::from_gray(w, h, data).unwrap();

        let normalizer = FaceImageNormalizer::new(FixedDetector::new(vec![
            Rectangle::new(10, 10, 50, 40),
            Rectangle::new(130, 10, 40, 50),
        ]));
        let crop = normalizer.normalize(&image).unwrap().unwrap();
        assert!(crop.pixels().iter().all(|&p| p == 20));
    }

    #[test]
    fn test_backend_fault_propagates() {
        let normalizer = FaceImageNormalizer::new(FailingDetector);
        let err = normalizer.normalize(&gray_image(32, 32, 0)).unwrap_err();
        assert!(matches!(err, FaceError::Detector(_)));
        assert!(err.is_backend_failure());
    }
}
