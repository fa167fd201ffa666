//! Grayscale image operations used to find the mirror ball and its reflections.

use image::{ImageBuffer, Luma, imageops};
use nalgebra::Point2;
use rayon::prelude::*;

/// A single channel floating point frame.
pub type GrayFrame = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Converts any decoded image into a [`GrayFrame`] with values on [0, 1].
pub fn gray_frame(image: &image::DynamicImage) -> GrayFrame {
    image.to_luma32f()
}

/// Gaussian blur with standard deviation `sigma`. Non-positive sigma leaves the frame untouched.
pub fn denoise(frame: &GrayFrame, sigma: f32) -> GrayFrame {
    match sigma > 0.0 {
        true => imageops::blur(frame, sigma),
        false => frame.clone(),
    }
}

/// Sobel gradient magnitude thinned with non-maximum suppression.
///
/// Each pixel survives only if its magnitude is at least that of both neighbours
/// along the gradient direction, quantized to 0, 45, 90 or 135 degrees. Borders
/// are clamped.
pub fn edges(frame: &GrayFrame) -> GrayFrame {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return GrayFrame::new(width, height);
    }

    let at = |x: i64, y: i64| -> f32 {
        let x = x.clamp(0, width as i64 - 1) as u32;
        let y = y.clamp(0, height as i64 - 1) as u32;
        frame.get_pixel(x, y).0[0]
    };

    let mut gradients = vec![(0.0f32, 0.0f32); (width * height) as usize];
    gradients
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as i64;
            for (x, gradient) in row.iter_mut().enumerate() {
                let x = x as i64;
                let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
                let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
                *gradient = (gx, gy);
            }
        });

    let magnitude = |x: i64, y: i64| -> f32 {
        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
            return 0.0;
        }
        let (gx, gy) = gradients[(y * width as i64 + x) as usize];
        gx.hypot(gy)
    };

    let mut thinned = vec![0.0f32; (width * height) as usize];
    thinned
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as i64;
            for (x, out) in row.iter_mut().enumerate() {
                let x = x as i64;
                let (gx, gy) = gradients[(y * width as i64 + x) as usize];
                let m = gx.hypot(gy);
                if m == 0.0 {
                    continue;
                }

                let angle = gy.atan2(gx).to_degrees().rem_euclid(180.0);
                let (dx, dy) = match angle {
                    a if !(22.5..157.5).contains(&a) => (1, 0),
                    a if a < 67.5 => (1, 1),
                    a if a < 112.5 => (0, 1),
                    _ => (-1, 1),
                };

                if m >= magnitude(x + dx, y + dy) && m >= magnitude(x - dx, y - dy) {
                    *out = m;
                }
            }
        });

    GrayFrame::from_raw(width, height, thinned).unwrap_or_else(|| GrayFrame::new(width, height))
}

/// Attenuates the lower part of a frame where the stand holding the ball usually is.
///
/// Rows below `1 - fraction` of the height are zeroed, and the `ramp` (also a
/// fraction of the height) above that cutoff fades linearly from one to zero.
pub fn apply_stand_mask(frame: &mut GrayFrame, fraction: f32, ramp: f32) {
    if fraction <= 0.0 {
        return;
    }

    let height = frame.height() as f32;
    let cutoff = 1.0 - fraction.min(1.0);
    for (_, y, pixel) in frame.enumerate_pixels_mut() {
        let t = y as f32 / height;
        let weight = if t >= cutoff {
            0.0
        } else if ramp > 0.0 && t > cutoff - ramp {
            (cutoff - t) / ramp
        } else {
            1.0
        };
        pixel.0[0] *= weight;
    }
}

/// Largest sample value in `frame`, optionally restricted to a disk.
pub fn max_value(frame: &GrayFrame, within: Option<&Circle>) -> f32 {
    frame
        .enumerate_pixels()
        .filter(|(x, y, _)| within.is_none_or(|circle| circle.contains_pixel(*x, *y)))
        .map(|(_, _, pixel)| pixel.0[0])
        .fold(0.0, f32::max)
}

/// A thresholded frame.
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl BinaryMask {
    /// Sets every pixel whose value is at least `threshold`, optionally only inside a disk.
    pub fn threshold(frame: &GrayFrame, threshold: f32, within: Option<&Circle>) -> Self {
        let (width, height) = frame.dimensions();
        let bits = frame
            .enumerate_pixels()
            .map(|(x, y, pixel)| {
                pixel.0[0] >= threshold
                    && within.is_none_or(|circle| circle.contains_pixel(x, y))
            })
            .collect();

        Self {
            width,
            height,
            bits,
        }
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.bits[(y * self.width + x) as usize]
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|bit| **bit).count()
    }

    /// Centers of every set pixel in raster order.
    pub fn points(&self) -> Vec<Point2<f64>> {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, bit)| **bit)
            .map(|(i, _)| {
                Point2::new(
                    (i as u32 % self.width) as f64,
                    (i as u32 / self.width) as f64,
                )
            })
            .collect()
    }

    /// Splits the set pixels into 8-connected regions.
    ///
    /// Regions are ordered by their first pixel in raster order, which keeps the
    /// output deterministic.
    pub fn regions(&self) -> Vec<Vec<Point2<f64>>> {
        let mut visited = vec![false; self.bits.len()];
        let mut regions = Vec::new();
        let mut stack = Vec::new();

        for start in 0..self.bits.len() {
            if !self.bits[start] || visited[start] {
                continue;
            }

            let mut region = Vec::new();
            visited[start] = true;
            stack.push(start);
            while let Some(index) = stack.pop() {
                let x = (index as u32 % self.width) as i64;
                let y = (index as u32 / self.width) as i64;
                region.push(Point2::new(x as f64, y as f64));

                for (dx, dy) in NEIGHBOURS {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= self.height as i64 {
                        continue;
                    }

                    let neighbour = (ny * self.width as i64 + nx) as usize;
                    if self.bits[neighbour] && !visited[neighbour] {
                        visited[neighbour] = true;
                        stack.push(neighbour);
                    }
                }
            }

            regions.push(region);
        }

        regions
    }
}

const NEIGHBOURS: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// A circle in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Circle {
    center: Point2<f64>,
    radius: f64,
}

impl Circle {
    pub fn new(center: Point2<f64>, radius: f64) -> Self {
        Self { center, radius }
    }

    pub fn center(&self) -> Point2<f64> {
        self.center
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn contains(&self, point: &Point2<f64>) -> bool {
        (point - self.center).norm() <= self.radius + CIRCLE_EPSILON * self.radius.max(1.0)
    }

    pub fn contains_pixel(&self, x: u32, y: u32) -> bool {
        let dx = x as f64 - self.center.x;
        let dy = y as f64 - self.center.y;
        dx * dx + dy * dy <= self.radius * self.radius
    }

    fn through_two(a: &Point2<f64>, b: &Point2<f64>) -> Self {
        Self::new(nalgebra::center(a, b), (a - b).norm() / 2.0)
    }

    fn through_three(a: &Point2<f64>, b: &Point2<f64>, c: &Point2<f64>) -> Self {
        let (bx, by) = (b.x - a.x, b.y - a.y);
        let (cx, cy) = (c.x - a.x, c.y - a.y);
        let d = 2.0 * (bx * cy - by * cx);

        if d.abs() <= CIRCLE_EPSILON {
            // Collinear, so the widest pair spans the circle.
            return [
                Self::through_two(a, b),
                Self::through_two(a, c),
                Self::through_two(b, c),
            ]
            .into_iter()
            .fold(Self::new(*a, 0.0), |widest, circle| {
                match circle.radius > widest.radius {
                    true => circle,
                    false => widest,
                }
            });
        }

        let b2 = bx * bx + by * by;
        let c2 = cx * cx + cy * cy;
        let ux = (cy * b2 - by * c2) / d;
        let uy = (bx * c2 - cx * b2) / d;
        Self::new(Point2::new(a.x + ux, a.y + uy), ux.hypot(uy))
    }
}

const CIRCLE_EPSILON: f64 = 1e-9;

/// Smallest circle containing every point, or `None` for an empty slice.
///
/// The points are reduced to their convex hull first and the hull is processed in
/// a fixed order, so identical input always gives an identical circle.
pub fn min_enclosing_circle(points: &[Point2<f64>]) -> Option<Circle> {
    let hull = convex_hull(points);
    let first = hull.first()?;

    let mut circle = Circle::new(*first, 0.0);
    for i in 1..hull.len() {
        if circle.contains(&hull[i]) {
            continue;
        }

        circle = Circle::new(hull[i], 0.0);
        for j in 0..i {
            if circle.contains(&hull[j]) {
                continue;
            }

            circle = Circle::through_two(&hull[i], &hull[j]);
            for k in 0..j {
                if !circle.contains(&hull[k]) {
                    circle = Circle::through_three(&hull[i], &hull[j], &hull[k]);
                }
            }
        }
    }

    Some(circle)
}

/// Andrew's monotone chain. Collinear points on the hull are dropped.
fn convex_hull(points: &[Point2<f64>]) -> Vec<Point2<f64>> {
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    sorted.dedup();
    if sorted.len() < 3 {
        return sorted;
    }

    let cross = |o: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>| {
        (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
    };

    let reversed: Vec<_> = sorted.iter().rev().copied().collect();
    let mut hull: Vec<Point2<f64>> = Vec::with_capacity(sorted.len() * 2);
    for pass in [&sorted, &reversed] {
        let floor = hull.len();
        for point in pass.iter() {
            while hull.len() >= floor + 2
                && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], point) <= 0.0
            {
                hull.pop();
            }
            hull.push(*point);
        }
        // The last point of each chain starts the next one.
        hull.pop();
    }

    hull
}
