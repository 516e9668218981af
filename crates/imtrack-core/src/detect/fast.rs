use image::GrayImage;
use log::trace;

const CIRCLE_OFFSETS: [(isize, isize); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// FAST-9: nine contiguous circle pixels brighter or darker than the centre.
const ARC_LENGTH: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corner {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

/// Grid-bucketed FAST-9 corners with 3x3 non-maximum suppression, strongest
/// first. Only pixels at least `border` away from every edge are examined.
pub fn detect_corners(
    image: &GrayImage,
    threshold: f32,
    border: u32,
    cell_size: usize,
    per_cell_cap: usize,
    max_corners: usize,
) -> Vec<Corner> {
    let (width, height) = image.dimensions();
    let border = border.max(3);
    if width <= border * 2 || height <= border * 2 {
        return Vec::new();
    }

    let w = width as usize;
    let mut score_map = vec![0.0f32; w * height as usize];
    let mut candidates = Vec::new();
    for y in border..height - border {
        for x in border..width - border {
            if let Some(score) = corner_score(image, x, y, threshold) {
                score_map[y as usize * w + x as usize] = score;
                candidates.push(Corner { x, y, score });
            }
        }
    }
    trace!(
        target: "imtrack_core::detect",
        "FAST found {} raw corners above {:.1}",
        candidates.len(),
        threshold
    );

    let cell = cell_size.max(4);
    let cells_x = (w).div_ceil(cell);
    let cells_y = (height as usize).div_ceil(cell);
    let mut buckets: Vec<Vec<Corner>> = vec![Vec::new(); cells_x * cells_y];
    for corner in candidates {
        if !is_local_max(&score_map, w, height as usize, &corner) {
            continue;
        }
        let bucket = &mut buckets[(corner.y as usize / cell) * cells_x + corner.x as usize / cell];
        let pos = bucket.partition_point(|c| c.score >= corner.score);
        bucket.insert(pos, corner);
        bucket.truncate(per_cell_cap.max(1));
    }

    let mut corners: Vec<Corner> = buckets.into_iter().flatten().collect();
    corners.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });
    corners.truncate(max_corners);
    corners
}

fn corner_score(image: &GrayImage, x: u32, y: u32, threshold: f32) -> Option<f32> {
    let center = image.get_pixel(x, y).0[0] as f32;
    let high = center + threshold;
    let low = center - threshold;
    let sample = |(dx, dy): (isize, isize)| -> f32 {
        image
            .get_pixel((x as isize + dx) as u32, (y as isize + dy) as u32)
            .0[0] as f32
    };

    // Compass test: a 9-arc covers at least 2 of the 4 compass points.
    let mut brighter = 0;
    let mut darker = 0;
    for idx in [0usize, 4, 8, 12] {
        let v = sample(CIRCLE_OFFSETS[idx]);
        if v > high {
            brighter += 1;
        } else if v < low {
            darker += 1;
        }
    }
    if brighter < 2 && darker < 2 {
        return None;
    }

    let mut values = [0.0f32; 16];
    for (i, &offset) in CIRCLE_OFFSETS.iter().enumerate() {
        values[i] = sample(offset);
    }

    let mut best = None::<f32>;
    for sign in [1.0f32, -1.0] {
        let mut run = 0usize;
        let mut sum = 0.0f32;
        // Walk the circle twice so arcs wrapping past index 15 are counted.
        for i in 0..32 {
            let diff = sign * (values[i % 16] - center);
            if diff > threshold {
                run += 1;
                sum += diff - threshold;
                if run >= ARC_LENGTH {
                    best = Some(best.map_or(sum, |b: f32| b.max(sum)));
                }
                if run == 16 {
                    break;
                }
            } else {
                run = 0;
                sum = 0.0;
            }
        }
    }
    best.map(|s| s + threshold)
}

fn is_local_max(score_map: &[f32], width: usize, height: usize, corner: &Corner) -> bool {
    let x = corner.x as usize;
    let y = corner.y as usize;
    for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
        for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
            if (nx, ny) == (x, y) {
                continue;
            }
            let neighbour = score_map[ny * width + nx];
            // Ties go to the earlier pixel in raster order.
            if neighbour > corner.score || (neighbour == corner.score && (ny, nx) < (y, x)) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn finds_square_corners() {
        let image = GrayImage::from_fn(64, 64, |x, y| {
            if (20..44).contains(&x) && (20..44).contains(&y) {
                Luma([220])
            } else {
                Luma([30])
            }
        });
        let corners = detect_corners(&image, 20.0, 4, 16, 4, 100);
        assert!(!corners.is_empty());
        assert!(corners.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(
            corners
                .iter()
                .any(|c| (c.x as i32 - 20).abs() <= 2 && (c.y as i32 - 20).abs() <= 2)
        );
    }

    #[test]
    fn flat_image_has_no_corners() {
        let image = GrayImage::from_pixel(48, 48, Luma([90]));
        assert!(detect_corners(&image, 10.0, 4, 16, 4, 100).is_empty());
    }
}
