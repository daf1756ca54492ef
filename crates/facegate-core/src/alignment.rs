//! Face selection and alignment to the canonical crop geometry.
//!
//! With landmarks available the face is warped by the least-squares similarity
//! transform (scale, rotation, translation) onto the five ArcFace reference
//! landmarks. Without landmarks the detected rectangle is cropped and resized.

use crate::detector::bilinear_sample;
use crate::types::{Image, Rectangle, CANONICAL_SIZE};
use ndarray::Array3;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Picks the face to keep and maps it onto a square crop of fixed size.
#[derive(Debug, Clone)]
pub struct Aligner {
    output_size: usize,
}

impl Default for Aligner {
    fn default() -> Self {
        Self { output_size: CANONICAL_SIZE }
    }
}

impl Aligner {
    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Select the face with the largest area; the earliest one wins a tie.
    pub fn select_face<'a>(&self, faces: &'a [Rectangle]) -> Option<&'a Rectangle> {
        faces.iter().fold(None, |best: Option<&Rectangle>, face| match best {
            Some(b) if b.area() >= face.area() => Some(b),
            _ => Some(face),
        })
    }

    /// Produce the canonical crop for `face`, keeping the image's channel count.
    pub fn align(&self, image: &Image, face: &Rectangle) -> Image {
        let pixels = match &face.landmarks {
            Some(landmarks) => {
                let reference = scaled_reference(self.output_size);
                let transform = Similarity::fit(landmarks, &reference);
                warp_affine(image, &transform, self.output_size)
            }
            None => crop_resize(image, face, self.output_size),
        };
        Image::from_pixels(pixels)
    }
}

/// Reference landmarks rescaled to the requested output size.
fn scaled_reference(size: usize) -> [(f32, f32); 5] {
    let s = size as f32 / 112.0;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * s, y * s))
}

/// 4-DOF similarity: `p' = R·s·p + t`, stored as `a = s·cosθ`, `b = s·sinθ`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    ///
    /// Degenerate input (all source points coincide) yields a pure translation.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (px, py) = (sx - msx, sy - msy);
            let (qx, qy) = (dx - mdx, dy - mdy);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            norm += px * px + py * py;
        }

        let (a, b) = if norm > 1e-12 { (dot / norm, cross / norm) } else { (1.0, 0.0) };
        Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    /// Source point that maps onto `(x, y)`, or `None` for a singular transform.
    fn invert(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (self.a * dy - self.b * dx) / det))
    }
}

/// Warp `image` through `transform` into an `out_size` square; uncovered pixels stay black.
fn warp_affine(image: &Image, transform: &Similarity, out_size: usize) -> Array3<u8> {
    let (src_w, src_h) = (image.width() as f32, image.height() as f32);
    let mut output = Array3::<u8>::zeros((out_size, out_size, image.channels()));

    for ((oy, ox, c), value) in output.indexed_iter_mut() {
        let Some((sx, sy)) = transform.invert(ox as f32, oy as f32) else {
            continue;
        };
        if sx < -1.0 || sy < -1.0 || sx > src_w || sy > src_h {
            continue;
        }
        *value = sample_or_black(image, sx, sy, c).round().clamp(0.0, 255.0) as u8;
    }
    output
}

/// Bilinear sample treating everything outside the image as black.
fn sample_or_black(image: &Image, sx: f32, sy: f32, c: usize) -> f32 {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let sample = |x: i64, y: i64| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            image.at(x as usize, y as usize, c) as f32
        } else {
            0.0
        }
    };

    sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + sample(x0 + 1, y0) * fx * (1.0 - fy)
        + sample(x0, y0 + 1) * (1.0 - fx) * fy
        + sample(x0 + 1, y0 + 1) * fx * fy
}

/// Crop `rect` and resize it to `out_size` × `out_size` with bilinear interpolation.
fn crop_resize(image: &Image, rect: &Rectangle, out_size: usize) -> Array3<u8> {
    let channels = image.channels();
    let scale_x = rect.width.max(1) as f32 / out_size as f32;
    let scale_y = rect.height.max(1) as f32 / out_size as f32;

    Array3::from_shape_fn((out_size, out_size, channels), |(oy, ox, c)| {
        let src_x = rect.x as f32 + (ox as f32 + 0.5) * scale_x - 0.5;
        let src_y = rect.y as f32 + (oy as f32 + 0.5) * scale_y - 0.5;
        bilinear_sample(image, src_x, src_y, c).round().clamp(0.0, 255.0) as u8
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: u32, y: u32, w: u32, h: u32) -> Rectangle {
        Rectangle::new(x, y, w, h)
    }

    #[test]
    fn test_select_face_largest_area() {
        let faces = vec![rect(0, 0, 10, 10), rect(50, 50, 40, 30), rect(10, 10, 20, 20)];
        let chosen = Aligner::default().select_face(&faces).unwrap();
        assert_eq!(chosen, &faces[1]);
    }

    #[test]
    fn test_select_face_tie_keeps_first() {
        // 20x30 and 30x20 have the same area; the detector's first wins.
        let faces = vec![rect(5, 5, 10, 10), rect(100, 0, 20, 30), rect(0, 100, 30, 20)];
        let chosen = Aligner::default().select_face(&faces).unwrap();
        assert_eq!(chosen, &faces[1]);
    }

    #[test]
    fn test_select_face_empty() {
        assert!(Aligner::default().select_face(&[]).is_none());
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_fit_identity() {
        let t = Similarity::fit(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        assert!(close(t.a, 1.0) && close(t.b, 0.0), "{t:?}");
        assert!(close(t.tx, 0.0) && close(t.ty, 0.0), "{t:?}");
    }

    #[test]
    fn test_fit_recovers_scale_rotation_translation() {
        // Rotate 90°, halve, shift by (10, -4).
        let src = REFERENCE_LANDMARKS_112;
        let dst = src.map(|(x, y)| (-0.5 * y + 10.0, 0.5 * x - 4.0));
        let t = Similarity::fit(&src, &dst);
        assert!(close(t.a, 0.0) && close(t.b, 0.5), "{t:?}");
        assert!(close(t.tx, 10.0) && close(t.ty, -4.0), "{t:?}");

        let (x, y) = t.invert(dst[2].0, dst[2].1).unwrap();
        assert!(close(x, src[2].0) && close(y, src[2].1));
    }

    #[test]
    fn test_fit_degenerate_landmarks() {
        let t = Similarity::fit(&[(5.0, 5.0); 5], &REFERENCE_LANDMARKS_112);
        assert_eq!((t.a, t.b), (1.0, 0.0));
        assert!(t.invert(0.0, 0.0).is_some());
    }

    #[test]
    fn test_align_output_geometry_keeps_channels() {
        let aligner = Aligner::default();
        let gray = Image::from_gray(640, 480, vec![128u8; 640 * 480]).unwrap();
        let rgb = Image::from_rgb(64, 48, vec![90u8; 64 * 48 * 3]).unwrap();

        let mut with_landmarks = rect(0, 0, 112, 112);
        with_landmarks.landmarks = Some(REFERENCE_LANDMARKS_112);

        let a = aligner.align(&gray, &with_landmarks);
        assert_eq!((a.width(), a.height(), a.channels()), (112, 112, 1));

        let b = aligner.align(&rgb, &rect(8, 8, 32, 32));
        assert_eq!((b.width(), b.height(), b.channels()), (112, 112, 3));
        assert!(b.pixels().iter().all(|&p| p == 90));
    }

    #[test]
    fn test_crop_resize_takes_rectangle_contents() {
        // Left half dark, right half bright; crop well inside the bright half.
        let (w, h) = (40usize, 20usize);
        let data: Vec<u8> = (0..w * h).map(|i| if i % w < 20 { 0 } else { 250 }).collect();
        let image = Image::from_gray(w, h, data).unwrap();
        let crop = crop_resize(&image, &rect(24, 0, 12, 20), 112);
        assert!(crop.iter().all(|&p| p == 250));
    }

    #[test]
    fn test_landmark_roundtrip() {
        // A bright patch at the left eye must land near the reference left eye.
        let (w, h) = (200usize, 200usize);
        let mut frame = vec![0u8; w * h];

        let src_landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        let (lx, ly) = (src_landmarks[0].0 as usize, src_landmarks[0].1 as usize);
        for dy in 0..5 {
            for dx in 0..5 {
                frame[(ly - 2 + dy) * w + (lx - 2 + dx)] = 255;
            }
        }

        let image = Image::from_gray(w, h, frame).unwrap();
        let mut face = rect(60, 40, 80, 90);
        face.landmarks = Some(src_landmarks);
        let aligned = Aligner::default().align(&image, &face);

        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as usize;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as usize;

        let mut max_val = 0u8;
        for y in ref_y - 1..=ref_y + 1 {
            for x in ref_x - 1..=ref_x + 1 {
                max_val = max_val.max(aligned.at(x, y, 0));
            }
        }
        assert!(max_val > 100, "expected bright patch near ({ref_x}, {ref_y}), max={max_val}");
    }
}
