use image::{ColorType, DynamicImage};
use ndarray::{Array3, ArrayD, Ix3, IxDyn};
use serde::{Deserialize, Serialize};

/// Side length, in pixels, of every normalized face crop.
pub const CANONICAL_SIZE: usize = 112;

/// Persistent key of an enrolled descriptor.
pub type DescriptorId = i64;

/// Persistent key of the user owning a descriptor.
pub type OwnerId = i64;

/// Decoded image data as handed over by the owning service.
///
/// The element type and shape are whatever the decoder produced; nothing is
/// guaranteed until [`RawImage::validate`] has passed.
#[derive(Debug, Clone)]
pub enum RawImage {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    F32(ArrayD<f32>),
}

impl RawImage {
    pub fn shape(&self) -> &[usize] {
        match self {
            RawImage::U8(a) => a.shape(),
            RawImage::U16(a) => a.shape(),
            RawImage::F32(a) => a.shape(),
        }
    }

    /// Name of the sample type, for diagnostics.
    pub fn sample_type(&self) -> &'static str {
        match self {
            RawImage::U8(_) => "u8",
            RawImage::U16(_) => "u16",
            RawImage::F32(_) => "f32",
        }
    }

    /// Check sample type, rank and channel count.
    ///
    /// Returns the reason for rejection; never panics on malformed input.
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self, RawImage::U8(_)) {
            return Err(format!("expected u8 samples, got {}", self.sample_type()));
        }
        let shape = self.shape();
        if shape.len() != 3 {
            return Err(format!("expected rank 3 (rows, cols, channels), got rank {}", shape.len()));
        }
        if shape[2] != 1 && shape[2] != 3 {
            return Err(format!("expected 1 or 3 channels, got {}", shape[2]));
        }
        Ok(())
    }
}

impl From<DynamicImage> for RawImage {
    /// Keep the decoder's sample type and channel layout so that the
    /// validity check sees exactly what the client sent (RGBA stays 4-channel).
    fn from(img: DynamicImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let channels = img.color().channel_count() as usize;
        let shape = IxDyn(&[h, w, channels]);
        match img.color() {
            ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8 => {
                RawImage::U8(shaped(shape, img.into_bytes()))
            }
            ColorType::Rgb32F => RawImage::F32(shaped(shape, img.into_rgb32f().into_raw())),
            ColorType::Rgba32F => RawImage::F32(shaped(shape, img.into_rgba32f().into_raw())),
            ColorType::L16 => RawImage::U16(shaped(shape, img.into_luma16().into_raw())),
            ColorType::La16 => RawImage::U16(shaped(shape, img.into_luma_alpha16().into_raw())),
            ColorType::Rgb16 => RawImage::U16(shaped(shape, img.into_rgb16().into_raw())),
            _ => RawImage::U16(shaped(
                IxDyn(&[h, w, 4]),
                img.into_rgba16().into_raw(),
            )),
        }
    }
}

/// Reshape decoder output; a length mismatch yields an empty rank-1 array
/// that the validity check rejects.
fn shaped<T: Clone + Default>(shape: IxDyn, samples: Vec<T>) -> ArrayD<T> {
    ArrayD::from_shape_vec(shape, samples).unwrap_or_else(|_| ArrayD::default(IxDyn(&[0])))
}

/// A validated 8-bit image laid out as rows × cols × channels, with 1 or 3 channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pixels: Array3<u8>,
}

impl Image {
    /// Build a grayscale image from row-major bytes.
    pub fn from_gray(width: usize, height: usize, data: Vec<u8>) -> Option<Self> {
        Self::from_samples(width, height, 1, data)
    }

    /// Build an RGB image from interleaved row-major bytes.
    pub fn from_rgb(width: usize, height: usize, data: Vec<u8>) -> Option<Self> {
        Self::from_samples(width, height, 3, data)
    }

    fn from_samples(width: usize, height: usize, channels: usize, data: Vec<u8>) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Array3::from_shape_vec((height, width, channels), data)
            .ok()
            .map(|pixels| Self { pixels })
    }

    /// Wrap an array the crate built itself (always 1 or 3 channels, non-empty).
    pub(crate) fn from_pixels(pixels: Array3<u8>) -> Self {
        debug_assert!(matches!(pixels.shape()[2], 1 | 3));
        Self { pixels }
    }

    pub fn width(&self) -> usize {
        self.pixels.shape()[1]
    }

    pub fn height(&self) -> usize {
        self.pixels.shape()[0]
    }

    pub fn channels(&self) -> usize {
        self.pixels.shape()[2]
    }

    pub fn pixels(&self) -> &Array3<u8> {
        &self.pixels
    }

    /// Sample at (x, y, channel). Callers keep coordinates in bounds.
    pub fn at(&self, x: usize, y: usize, c: usize) -> u8 {
        self.pixels[[y, x, c]]
    }

    /// Row-major luma plane (BT.601 weights for RGB input).
    pub fn luma(&self) -> Vec<u8> {
        if self.channels() == 1 {
            return self.pixels.iter().copied().collect();
        }
        self.pixels
            .outer_iter()
            .flat_map(|row| {
                row.outer_iter()
                    .map(|px| {
                        let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                        y.round().clamp(0.0, 255.0) as u8
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl TryFrom<RawImage> for Image {
    type Error = String;

    /// A valid raw image may still be empty; the backends need at least one pixel.
    fn try_from(raw: RawImage) -> Result<Self, Self::Error> {
        raw.validate()?;
        let pixels = match raw {
            RawImage::U8(array) => array
                .into_dimensionality::<Ix3>()
                .map_err(|e| format!("reshape failed: {e}"))?,
            other => return Err(format!("expected u8 samples, got {}", other.sample_type())),
        };
        if pixels.is_empty() {
            let (h, w, _) = pixels.dim();
            return Err(format!("image has zero extent: {w}x{h}"));
        }
        Ok(Self { pixels })
    }
}

/// Axis-aligned face region in pixel coordinates, inside the image it was found in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl Rectangle {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height, landmarks: None }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clip floating-point box edges to an image of `width` × `height`.
    ///
    /// Returns `None` when nothing with positive area is left.
    pub fn clipped(x1: f32, y1: f32, x2: f32, y2: f32, width: usize, height: usize) -> Option<Self> {
        let (w, h) = (width as f32, height as f32);
        let left = x1.max(0.0).min(w).floor();
        let top = y1.max(0.0).min(h).floor();
        let right = x2.max(0.0).min(w).ceil();
        let bottom = y2.max(0.0).min(h).ceil();
        if right - left < 1.0 || bottom - top < 1.0 {
            return None;
        }
        Some(Self::new(left as u32, top as u32, (right - left) as u32, (bottom - top) as u32))
    }
}

/// Face descriptor (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Length is `dimension` and every component is finite.
    pub fn is_valid(&self, dimension: usize) -> bool {
        self.values.len() == dimension && self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two descriptors.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// An enrolled descriptor bound to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledDescriptor {
    pub id: DescriptorId,
    pub owner_id: OwnerId,
    pub features: Descriptor,
}

/// Outcome of matching a query against the descriptor cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub is_known_face: bool,
    pub matched_id: Option<DescriptorId>,
    /// Distance to the nearest enrolled descriptor (absent for an empty cache).
    pub distance: Option<f32>,
}

impl RecognitionResult {
    pub fn unknown(distance: Option<f32>) -> Self {
        Self { is_known_face: false, matched_id: None, distance }
    }
}
