//! Embedded square-marker detector.
//!
//! A compact detection pipeline for the supported 4x4/5x5/6x6 dictionaries:
//! global threshold, dark connected components, quad corner extraction,
//! perspective grid sampling, border validation, and id decoding. The id is
//! the row-major payload word (white cell = 1), taken as the minimum over
//! the four rotations so orientation does not matter; ids at or above the
//! dictionary capacity are rejected.
//!
//! The pipeline is deliberately small: it handles the printed markers this
//! service is calibrated for (frontal to moderately oblique views on a
//! reasonably lit wall). Anything smarter can be plugged in through
//! [`MarkerDetector`].

use crate::error::{Error, Result};
use image::GrayImage;
use serde::Serialize;
use std::collections::VecDeque;

/// Supported marker dictionaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dictionary {
    Dict4x4_50,
    Dict4x4_100,
    Dict5x5_50,
    Dict6x6_50,
}

impl Dictionary {
    /// Parse the OpenCV-style dictionary name used in configuration.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "DICT_4X4_50" => Some(Self::Dict4x4_50),
            "DICT_4X4_100" => Some(Self::Dict4x4_100),
            "DICT_5X5_50" => Some(Self::Dict5x5_50),
            "DICT_6X6_50" => Some(Self::Dict6x6_50),
            _ => None,
        }
    }

    /// Payload grid edge length in cells.
    pub fn grid(self) -> usize {
        match self {
            Self::Dict4x4_50 | Self::Dict4x4_100 => 4,
            Self::Dict5x5_50 => 5,
            Self::Dict6x6_50 => 6,
        }
    }

    /// Number of distinct ids.
    pub fn capacity(self) -> u32 {
        match self {
            Self::Dict4x4_50 | Self::Dict5x5_50 | Self::Dict6x6_50 => 50,
            Self::Dict4x4_100 => 100,
        }
    }
}

/// One detected marker in image coordinates.
#[derive(Debug, Clone, Serialize)]
pub struct MarkerObservation {
    pub id: u32,
    /// Image-plane corners, pixels.
    pub corners: [[f64; 2]; 4],
    /// Image-plane centroid of the corners.
    pub center: [f64; 2],
    /// Quadrilateral area in square pixels.
    pub area_px: f64,
}

/// Detector seam: the worker only needs observations out of a gray image.
pub trait MarkerDetector: Send {
    fn detect(&self, gray: &GrayImage) -> Result<Vec<MarkerObservation>>;
}

/// The built-in detector (see module docs).
pub struct GridDetector {
    dictionary: Dictionary,
}

/// Smallest component accepted as a marker candidate, pixels.
const MIN_COMPONENT_AREA: usize = 64;
/// Border sample cells allowed to read light before a candidate is dropped.
const MAX_BORDER_DEFECTS: usize = 2;

impl GridDetector {
    pub fn new(dictionary: Dictionary) -> Self {
        Self { dictionary }
    }

    fn threshold(gray: &GrayImage) -> u8 {
        // Isodata: start at the midpoint, iterate the two-class mean.
        let mut threshold = 128u8;
        for _ in 0..8 {
            let (mut dark_sum, mut dark_n, mut light_sum, mut light_n) = (0u64, 0u64, 0u64, 0u64);
            for p in gray.pixels() {
                let v = p.0[0] as u64;
                if v < threshold as u64 {
                    dark_sum += v;
                    dark_n += 1;
                } else {
                    light_sum += v;
                    light_n += 1;
                }
            }
            if dark_n == 0 || light_n == 0 {
                break;
            }
            let next = ((dark_sum / dark_n + light_sum / light_n) / 2) as u8;
            if next == threshold {
                break;
            }
            threshold = next;
        }
        threshold
    }

    /// Collect dark connected components (4-connectivity) as pixel lists.
    fn components(gray: &GrayImage, threshold: u8) -> Vec<Vec<(u32, u32)>> {
        let (w, h) = gray.dimensions();
        let mut visited = vec![false; (w * h) as usize];
        let mut components = Vec::new();

        for y in 0..h {
            for x in 0..w {
                let idx = (y * w + x) as usize;
                if visited[idx] || gray.get_pixel(x, y).0[0] >= threshold {
                    continue;
                }
                let mut pixels = Vec::new();
                let mut queue = VecDeque::new();
                visited[idx] = true;
                queue.push_back((x, y));
                while let Some((cx, cy)) = queue.pop_front() {
                    pixels.push((cx, cy));
                    let neighbours = [
                        (cx.wrapping_sub(1), cy),
                        (cx + 1, cy),
                        (cx, cy.wrapping_sub(1)),
                        (cx, cy + 1),
                    ];
                    for (nx, ny) in neighbours {
                        if nx >= w || ny >= h {
                            continue;
                        }
                        let nidx = (ny * w + nx) as usize;
                        if !visited[nidx] && gray.get_pixel(nx, ny).0[0] < threshold {
                            visited[nidx] = true;
                            queue.push_back((nx, ny));
                        }
                    }
                }
                if pixels.len() >= MIN_COMPONENT_AREA {
                    components.push(pixels);
                }
            }
        }
        components
    }

    /// Extreme points along the two diagonals give the quad corners for a
    /// convex marker outline; ordered by angle around the centroid.
    fn quad_corners(pixels: &[(u32, u32)]) -> [[f64; 2]; 4] {
        let mut best = [[0.0f64; 2]; 4];
        let mut scores = [f64::NEG_INFINITY; 4];
        for &(x, y) in pixels {
            let (x, y) = (x as f64, y as f64);
            let candidates = [x + y, x - y, -x - y, y - x];
            for (i, score) in candidates.iter().enumerate() {
                if *score > scores[i] {
                    scores[i] = *score;
                    best[i] = [x, y];
                }
            }
        }
        let cx = best.iter().map(|p| p[0]).sum::<f64>() / 4.0;
        let cy = best.iter().map(|p| p[1]).sum::<f64>() / 4.0;
        best.sort_by(|a, b| {
            let aa = (a[1] - cy).atan2(a[0] - cx);
            let ab = (b[1] - cy).atan2(b[0] - cx);
            aa.partial_cmp(&ab).unwrap_or(std::cmp::Ordering::Equal)
        });
        best
    }

    /// Bilinear point on the quad for unit-square coordinates (u, v).
    fn quad_point(corners: &[[f64; 2]; 4], u: f64, v: f64) -> (f64, f64) {
        let [c0, c1, c2, c3] = corners;
        let x = (1.0 - u) * (1.0 - v) * c0[0]
            + u * (1.0 - v) * c1[0]
            + u * v * c2[0]
            + (1.0 - u) * v * c3[0];
        let y = (1.0 - u) * (1.0 - v) * c0[1]
            + u * (1.0 - v) * c1[1]
            + u * v * c2[1]
            + (1.0 - u) * v * c3[1];
        (x, y)
    }

    /// Sample the (grid+2)² cell centres; true = dark.
    fn sample_cells(
        gray: &GrayImage,
        corners: &[[f64; 2]; 4],
        cells: usize,
        threshold: u8,
    ) -> Vec<bool> {
        let (w, h) = gray.dimensions();
        let mut dark = Vec::with_capacity(cells * cells);
        for row in 0..cells {
            for col in 0..cells {
                let u = (col as f64 + 0.5) / cells as f64;
                let v = (row as f64 + 0.5) / cells as f64;
                let (x, y) = Self::quad_point(corners, u, v);
                let (xi, yi) = (x.round() as i64, y.round() as i64);
                let value = if xi < 0 || yi < 0 || xi >= w as i64 || yi >= h as i64 {
                    255
                } else {
                    gray.get_pixel(xi as u32, yi as u32).0[0]
                };
                dark.push(value < threshold);
            }
        }
        dark
    }

    /// Decode the payload word, minimal over the four rotations.
    fn decode_id(&self, cells: &[bool], cells_per_side: usize) -> Option<u32> {
        let n = self.dictionary.grid();

        // Border must be dark.
        let mut defects = 0;
        for i in 0..cells_per_side {
            for (r, c) in [
                (0, i),
                (cells_per_side - 1, i),
                (i, 0),
                (i, cells_per_side - 1),
            ] {
                if !cells[r * cells_per_side + c] {
                    defects += 1;
                }
            }
        }
        if defects > MAX_BORDER_DEFECTS {
            return None;
        }

        // Payload bits: white = 1, row-major, MSB first.
        let bit = |r: usize, c: usize| -> u64 {
            u64::from(!cells[(r + 1) * cells_per_side + (c + 1)])
        };
        let mut best: Option<u64> = None;
        for rotation in 0..4 {
            let mut word = 0u64;
            for r in 0..n {
                for c in 0..n {
                    let (sr, sc) = match rotation {
                        0 => (r, c),
                        1 => (c, n - 1 - r),
                        2 => (n - 1 - r, n - 1 - c),
                        _ => (n - 1 - c, r),
                    };
                    word = (word << 1) | bit(sr, sc);
                }
            }
            best = Some(best.map_or(word, |b: u64| b.min(word)));
        }
        let id = best? as u32;
        (id < self.dictionary.capacity()).then_some(id)
    }
}

/// Shoelace area of an angle-ordered quad.
fn quad_area(corners: &[[f64; 2]; 4]) -> f64 {
    let mut sum = 0.0;
    for i in 0..4 {
        let a = corners[i];
        let b = corners[(i + 1) % 4];
        sum += a[0] * b[1] - b[0] * a[1];
    }
    (sum * 0.5).abs()
}

impl MarkerDetector for GridDetector {
    fn detect(&self, gray: &GrayImage) -> Result<Vec<MarkerObservation>> {
        let (w, h) = gray.dimensions();
        if w < 8 || h < 8 {
            return Err(Error::Other("frame too small".to_string()));
        }
        let threshold = Self::threshold(gray);
        let cells_per_side = self.dictionary.grid() + 2;
        let mut observations = Vec::new();

        for pixels in Self::components(gray, threshold) {
            let corners = Self::quad_corners(&pixels);
            let area = quad_area(&corners);
            if area < MIN_COMPONENT_AREA as f64 {
                continue;
            }
            // A filled quad and its pixel count should roughly agree;
            // elongated blobs (shadows, cables) fail this.
            if (pixels.len() as f64) < area * 0.5 {
                continue;
            }
            let cells = Self::sample_cells(gray, &corners, cells_per_side, threshold);
            if let Some(id) = self.decode_id(&cells, cells_per_side) {
                let center = [
                    corners.iter().map(|c| c[0]).sum::<f64>() / 4.0,
                    corners.iter().map(|c| c[1]).sum::<f64>() / 4.0,
                ];
                observations.push(MarkerObservation {
                    id,
                    corners,
                    center,
                    area_px: area,
                });
            }
        }
        Ok(observations)
    }
}

/// Render a marker into a gray image (simulator and test helper).
///
/// Draws the black border and the payload bits of `id` at rotation zero on a
/// white background with a `margin_px` quiet zone.
pub fn render_marker(id: u32, dictionary: Dictionary, cell_px: u32, margin_px: u32) -> GrayImage {
    let n = dictionary.grid();
    let cells = n + 2;
    let side = cells as u32 * cell_px + 2 * margin_px;
    let mut img = GrayImage::from_pixel(side, side, image::Luma([255u8]));

    let mut paint_cell = |row: usize, col: usize, value: u8| {
        let x0 = margin_px + col as u32 * cell_px;
        let y0 = margin_px + row as u32 * cell_px;
        for y in y0..y0 + cell_px {
            for x in x0..x0 + cell_px {
                img.put_pixel(x, y, image::Luma([value]));
            }
        }
    };

    for row in 0..cells {
        for col in 0..cells {
            let border = row == 0 || col == 0 || row == cells - 1 || col == cells - 1;
            let value = if border {
                0
            } else {
                let (r, c) = (row - 1, col - 1);
                let bit_index = n * n - 1 - (r * n + c);
                let white = (id >> bit_index) & 1 == 1;
                if white {
                    255
                } else {
                    0
                }
            };
            paint_cell(row, col, value);
        }
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dictionary_names() {
        assert_eq!(Dictionary::parse("DICT_4X4_50"), Some(Dictionary::Dict4x4_50));
        assert_eq!(Dictionary::parse("DICT_6X6_50"), Some(Dictionary::Dict6x6_50));
        assert_eq!(Dictionary::parse("DICT_7X7_1000"), None);
    }

    #[test]
    fn test_detects_rendered_marker() {
        let img = render_marker(7, Dictionary::Dict4x4_50, 20, 40);
        let detector = GridDetector::new(Dictionary::Dict4x4_50);
        let observations = detector.detect(&img).unwrap();
        assert_eq!(observations.len(), 1);
        let obs = &observations[0];
        assert_eq!(obs.id, 7);
        // Marker occupies the centre of the canvas.
        let mid = img.width() as f64 / 2.0;
        assert!((obs.center[0] - mid).abs() < 2.0);
        assert!((obs.center[1] - mid).abs() < 2.0);
        // 6 cells * 20px = 120px outline.
        assert!((obs.area_px.sqrt() - 120.0).abs() < 6.0);
    }

    #[test]
    fn test_detects_multiple_markers() {
        let a = render_marker(7, Dictionary::Dict4x4_50, 16, 24);
        let b = render_marker(9, Dictionary::Dict4x4_50, 16, 24);
        let mut canvas = GrayImage::from_pixel(
            a.width() + b.width() + 60,
            a.height() + 40,
            image::Luma([255u8]),
        );
        image::imageops::overlay(&mut canvas, &a, 10, 20);
        image::imageops::overlay(&mut canvas, &b, a.width() as i64 + 40, 20);

        let detector = GridDetector::new(Dictionary::Dict4x4_50);
        let mut ids: Vec<u32> = detector
            .detect(&canvas)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![7, 9]);
    }

    #[test]
    fn test_blank_frame_detects_nothing() {
        let img = GrayImage::from_pixel(320, 240, image::Luma([200u8]));
        let detector = GridDetector::new(Dictionary::Dict4x4_50);
        assert!(detector.detect(&img).unwrap().is_empty());
    }

    #[test]
    fn test_id_above_capacity_rejected() {
        // id 60 is outside DICT_4X4_50 but inside DICT_4X4_100.
        let img = render_marker(60, Dictionary::Dict4x4_50, 20, 40);
        let strict = GridDetector::new(Dictionary::Dict4x4_50);
        assert!(strict.detect(&img).unwrap().is_empty());
        let wide = GridDetector::new(Dictionary::Dict4x4_100);
        let observations = wide.detect(&img).unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].id, 60);
    }
}
