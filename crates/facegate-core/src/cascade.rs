//! Classical multi-scale cascade detector backed by `rustface` (SeetaFace engine).
//!
//! A single cascade scan produces plenty of one-off hits on textured
//! backgrounds. The detector therefore scans the image several times with
//! different pyramid scale factors and keeps only the regions that enough scans
//! agree on, in the spirit of OpenCV's `minNeighbors`.

use crate::detector::{DetectorError, FaceDetector};
use crate::types::{Image, Rectangle};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Tuning knobs for [`CascadeDetector`].
#[derive(Debug, Clone)]
pub struct CascadeParams {
    /// Smallest face side length to scan for, in pixels (rustface requires ≥ 20).
    pub min_face_size: u32,
    /// Per-window classifier score threshold.
    pub score_thresh: f64,
    /// One scan is run per pyramid scale factor; each scan casts one vote per hit.
    pub pyramid_scale_factors: Vec<f32>,
    /// Sliding window step in pixels (both axes).
    pub slide_window_step: u32,
    /// Minimum number of votes a grouped region needs to be reported.
    pub min_neighbors: usize,
    /// Relative edge tolerance used when grouping hits into one region.
    pub group_eps: f32,
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            min_face_size: 20,
            score_thresh: 2.0,
            pyramid_scale_factors: vec![0.8, 0.83, 0.86, 0.89, 0.92],
            slide_window_step: 4,
            min_neighbors: 3,
            group_eps: 0.2,
        }
    }
}

/// Face detector backed by the SeetaFace funnel-structured cascade.
pub struct CascadeDetector {
    model: rustface::Model,
    params: CascadeParams,
}

impl CascadeDetector {
    /// Load a SeetaFace model file (e.g. `seeta_fd_frontal_v1.0.bin`).
    pub fn load(model_path: &str, params: CascadeParams) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }
        let model = rustface::read_model(BufReader::new(File::open(model_path)?))?;

        tracing::info!(
            path = model_path,
            passes = params.pyramid_scale_factors.len(),
            min_neighbors = params.min_neighbors,
            "loaded SeetaFace cascade model"
        );

        Ok(Self { model, params })
    }

    fn scan(&self, gray: &[u8], width: u32, height: u32, scale_factor: f32) -> Vec<Rectangle> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.params.min_face_size.max(20));
        detector.set_score_thresh(self.params.score_thresh.max(f64::EPSILON));
        detector.set_pyramid_scale_factor(scale_factor.clamp(0.01, 0.99));
        detector.set_slide_window_step(self.params.slide_window_step, self.params.slide_window_step);

        detector
            .detect(&rustface::ImageData::new(gray, width, height))
            .iter()
            .filter_map(|face| {
                let bbox = face.bbox();
                let x1 = bbox.x() as f32;
                let y1 = bbox.y() as f32;
                Rectangle::clipped(
                    x1,
                    y1,
                    x1 + bbox.width() as f32,
                    y1 + bbox.height() as f32,
                    width as usize,
                    height as usize,
                )
            })
            .collect()
    }
}

impl FaceDetector for CascadeDetector {
    fn find_faces(&mut self, image: &Image) -> Result<Vec<Rectangle>, DetectorError> {
        let gray = image.luma();
        let (width, height) = (image.width() as u32, image.height() as u32);

        let hits: Vec<Rectangle> = self
            .params
            .pyramid_scale_factors
            .iter()
            .flat_map(|&factor| self.scan(&gray, width, height, factor))
            .collect();

        let faces = group_rectangles(&hits, self.params.min_neighbors, self.params.group_eps);
        tracing::debug!(hits = hits.len(), faces = faces.len(), "cascade detection finished");
        Ok(faces)
    }
}

/// Two rectangles describe the same region when every edge lies within
/// `eps` of the mean of their smaller sides.
fn similar(a: &Rectangle, b: &Rectangle, eps: f32) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f32 * 0.5;
    let close = |p: u32, q: u32| (p as f32 - q as f32).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

/// Cluster raw hits into regions and keep those with at least `min_neighbors` votes.
///
/// Each kept region is the average of its members. Output is ordered by votes
/// (descending), then by the position of the region's first hit.
pub fn group_rectangles(hits: &[Rectangle], min_neighbors: usize, eps: f32) -> Vec<Rectangle> {
    // Union-find over the similarity relation.
    let mut parent: Vec<usize> = (0..hits.len()).collect();
    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }
    for i in 0..hits.len() {
        for j in (i + 1)..hits.len() {
            if similar(&hits[i], &hits[j], eps) {
                let (ri, rj) = (root(&mut parent, i), root(&mut parent, j));
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    // (first index, votes, sum x, sum y, sum w, sum h) per cluster, in first-hit order.
    let mut clusters: Vec<(usize, usize, u64, u64, u64, u64)> = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        let r = root(&mut parent, i);
        let slot = match clusters.iter().position(|c| c.0 == r) {
            Some(pos) => pos,
            None => {
                clusters.push((r, 0, 0, 0, 0, 0));
                clusters.len() - 1
            }
        };
        let c = &mut clusters[slot];
        c.1 += 1;
        c.2 += hit.x as u64;
        c.3 += hit.y as u64;
        c.4 += hit.width as u64;
        c.5 += hit.height as u64;
    }

    clusters.retain(|c| c.1 >= min_neighbors.max(1));
    // Stable sort keeps first-hit order among equal vote counts.
    clusters.sort_by(|a, b| b.1.cmp(&a.1));

    clusters
        .into_iter()
        .map(|(_, n, sx, sy, sw, sh)| {
            let n = n as u64;
            let avg = |s: u64| ((s + n / 2) / n) as u32;
            Rectangle::new(avg(sx), avg(sy), avg(sw), avg(sh))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_drops_regions_below_vote_threshold() {
        let hits = vec![
            Rectangle::new(100, 100, 50, 50),
            Rectangle::new(102, 98, 52, 50),
            Rectangle::new(99, 101, 50, 49),
            // Lone hit far away: a false positive.
            Rectangle::new(10, 10, 30, 30),
        ];
        let faces = group_rectangles(&hits, 3, 0.2);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0], Rectangle::new(100, 100, 51, 50));
    }

    #[test]
    fn test_group_orders_by_votes_then_first_hit() {
        let hits = vec![
            Rectangle::new(0, 0, 40, 40),
            Rectangle::new(200, 0, 40, 40),
            Rectangle::new(200, 0, 40, 40),
            Rectangle::new(400, 0, 40, 40),
        ];
        let faces = group_rectangles(&hits, 1, 0.2);
        let xs: Vec<u32> = faces.iter().map(|f| f.x).collect();
        assert_eq!(xs, vec![200, 0, 400]);
    }

    #[test]
    fn test_group_merges_transitively() {
        // a~b and b~c, but a and c are too far apart on their own.
        let hits = vec![
            Rectangle::new(100, 100, 100, 100),
            Rectangle::new(115, 100, 100, 100),
            Rectangle::new(130, 100, 100, 100),
        ];
        assert!(!similar(&hits[0], &hits[2], 0.2));
        let faces = group_rectangles(&hits, 3, 0.2);
        assert_eq!(faces, vec![Rectangle::new(115, 100, 100, 100)]);
    }

    #[test]
    fn test_group_empty() {
        assert!(group_rectangles(&[], 3, 0.2).is_empty());
    }

    #[test]
    fn test_missing_model_is_reported() {
        let err = CascadeDetector::load("/nonexistent/seeta.bin", CascadeParams::default()).err();
        assert!(matches!(err, Some(DetectorError::ModelNotFound(_))));
    }
}
