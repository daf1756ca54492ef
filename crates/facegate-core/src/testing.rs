//! Deterministic backends for driving the pipeline without model files.

use crate::detector::{DetectorError, FaceDetector};
use crate::embedder::{Embedder, EmbedderError};
use crate::types::{Descriptor, Image, Rectangle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const GRID: usize = 4;

pub fn gray_image(width: usize, height: usize, value: u8) -> Image {
    Image::from_gray(width, height, vec![value; width * height]).unwrap()
}

/// Returns the same rectangles for every image and counts its calls.
#[derive(Clone)]
pub struct FixedDetector {
    faces: Vec<Rectangle>,
    pub calls: Arc<AtomicUsize>,
}

impl FixedDetector {
    pub fn new(faces: Vec<Rectangle>) -> Self {
        Self { faces, calls: Arc::new(AtomicUsize::new(0)) }
    }
}

impl FaceDetector for FixedDetector {
    fn find_faces(&mut self, _image: &Image) -> Result<Vec<Rectangle>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.faces.clone())
    }
}

pub struct FailingDetector;

impl FaceDetector for FailingDetector {
    fn find_faces(&mut self, _image: &Image) -> Result<Vec<Rectangle>, DetectorError> {
        Err(DetectorError::InferenceFailed("model exploded".into()))
    }
}

/// Mean intensity of each cell of a 4×4 grid, scaled to [0, 1].
pub struct GridEmbedder;

impl Embedder for GridEmbedder {
    fn dimension(&self) -> usize {
        GRID * GRID
    }

    fn calculate_descriptor(&mut self, image: &Image) -> Result<Descriptor, EmbedderError> {
        let (cw, ch) = (image.width() / GRID, image.height() / GRID);
        let mut values = Vec::with_capacity(GRID * GRID);
        for gy in 0..GRID {
            for gx in 0..GRID {
                let mut sum = 0u64;
                for y in gy * ch..(gy + 1) * ch {
                    for x in gx * cw..(gx + 1) * cw {
                        sum += (0..image.channels()).map(|c| image.at(x, y, c) as u64).sum::<u64>();
                    }
                }
                let n = (cw * ch * image.channels()).max(1) as f32;
                values.push(sum as f32 / n / 255.0);
            }
        }
        Ok(Descriptor::new(values))
    }
}

/// [`GridEmbedder`] that counts its calls.
#[derive(Clone, Default)]
pub struct CountingEmbedder {
    pub calls: Arc<AtomicUsize>,
}

impl Embedder for CountingEmbedder {
    fn dimension(&self) -> usize {
        GridEmbedder.dimension()
    }

    fn calculate_descriptor(&mut self, image: &Image) -> Result<Descriptor, EmbedderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        GridEmbedder.calculate_descriptor(image)
    }
}

/// Produces descriptors of the wrong dimension.
pub struct WrongLengthEmbedder;

impl Embedder for WrongLengthEmbedder {
    fn dimension(&self) -> usize {
        8
    }

    fn calculate_descriptor(&mut self, _image: &Image) -> Result<Descriptor, EmbedderError> {
        Ok(Descriptor::new(vec![0.0; 3]))
    }
}
