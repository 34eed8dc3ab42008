//! Ball detection: colour mask → largest 8-connected region → minimal
//! enclosing circle of its outline.

use std::collections::VecDeque;

use balltrack_core::{Coordinate, Frame, PixelFormat};

use crate::color::ColorModel;

/// A detected ball.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Circle centre, rounded to the nearest pixel.
    pub center: Coordinate,
    pub radius: f32,
    /// Pixels in the matched region.
    pub area: usize,
}

#[derive(Debug, Clone)]
pub struct BallDetector {
    model: ColorModel,
    min_area: usize,
}

impl BallDetector {
    pub fn new(min_area: usize) -> Self {
        Self::with_model(ColorModel::red(), min_area)
    }

    pub fn with_model(model: ColorModel, min_area: usize) -> Self {
        Self { model, min_area: min_area.max(1) }
    }

    /// `None` when no region of at least `min_area` pixels matches.
    pub fn detect(&self, frame: &Frame) -> Option<Detection> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let mask = self.mask(frame);

        let region = largest_region(&mask, width, height)?;
        if region.len() < self.min_area {
            return None;
        }

        let outline = outline(&region, &mask, width, height);
        let hull = convex_hull(outline);
        let circle = enclosing_circle(&hull);

        Some(Detection {
            center: Coordinate::new(circle.x.round() as i32, circle.y.round() as i32),
            radius: circle.r as f32,
            area: region.len(),
        })
    }

    fn mask(&self, frame: &Frame) -> Vec<bool> {
        frame
            .data
            .chunks_exact(3)
            .map(|p| {
                let bgr = match frame.format {
                    PixelFormat::Bgr24 => [p[0], p[1], p[2]],
                    PixelFormat::Rgb24 => [p[2], p[1], p[0]],
                };
                self.model.matches_bgr(bgr)
            })
            .collect()
    }
}

const NEIGHBOURS: [(isize, isize); 8] = [(-1, -1), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1)];

/// Pixel indices of the largest 8-connected region of the mask.
fn largest_region(mask: &[bool], width: usize, height: usize) -> Option<Vec<usize>> {
    let mut seen = vec![false; mask.len()];
    let mut best: Option<Vec<usize>> = None;
    let mut queue = VecDeque::new();

    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        queue.push_back(start);
        let mut region = Vec::new();

        while let Some(i) = queue.pop_front() {
            region.push(i);
            let (x, y) = ((i % width) as isize, (i / width) as isize);
            for (dx, dy) in NEIGHBOURS {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                    continue;
                }
                let n = ny as usize * width + nx as usize;
                if mask[n] && !seen[n] {
                    seen[n] = true;
                    queue.push_back(n);
                }
            }
        }

        if best.as_ref().map_or(true, |b| region.len() > b.len()) {
            best = Some(region);
        }
    }
    best
}

/// Region pixels with a 4-neighbour outside the mask or the frame.
fn outline(region: &[usize], mask: &[bool], width: usize, height: usize) -> Vec<(i64, i64)> {
    region
        .iter()
        .filter_map(|&i| {
            let (x, y) = (i % width, i / width);
            let edge = x == 0
                || y == 0
                || x + 1 == width
                || y + 1 == height
                || !mask[i - 1]
                || !mask[i + 1]
                || !mask[i - width]
                || !mask[i + width];
            edge.then_some((x as i64, y as i64))
        })
        .collect()
}

// ── Geometry ──────────────────────────────────────────────────────────────────

fn cross(o: (i64, i64), a: (i64, i64), b: (i64, i64)) -> i64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

/// Monotone chain; returns the hull vertices counter-clockwise.
fn convex_hull(mut points: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    points.sort_unstable();
    points.dedup();
    if points.len() < 3 {
        return points;
    }

    let mut hull: Vec<(i64, i64)> = Vec::with_capacity(points.len() * 2);
    for &p in &points {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0 {
            hull.pop();
        }
        hull.push(p);
    }
    let lower = hull.len() + 1;
    for &p in points.iter().rev().skip(1) {
        while hull.len() >= lower && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0 {
            hull.pop();
        }
        hull.push(p);
    }
    hull.pop();
    hull
}

#[derive(Debug, Clone, Copy)]
struct Circle {
    x: f64,
    y: f64,
    r: f64,
}

impl Circle {
    const EPS: f64 = 1e-7;

    fn contains(&self, p: (f64, f64)) -> bool {
        (p.0 - self.x).hypot(p.1 - self.y) <= self.r + Self::EPS
    }

    fn from_two(a: (f64, f64), b: (f64, f64)) -> Self {
        let (x, y) = ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0);
        Self { x, y, r: (a.0 - x).hypot(a.1 - y) }
    }

    fn from_three(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> Self {
        let (bx, by) = (b.0 - a.0, b.1 - a.1);
        let (cx, cy) = (c.0 - a.0, c.1 - a.1);
        let d = 2.0 * (bx * cy - by * cx);
        if d.abs() < Self::EPS {
            // Collinear: the widest pair spans the circle.
            let pairs = [Self::from_two(a, b), Self::from_two(a, c), Self::from_two(b, c)];
            return pairs.into_iter().fold(pairs[0], |widest, p| if p.r > widest.r { p } else { widest });
        }
        let ux = (cy * (bx * bx + by * by) - by * (cx * cx + cy * cy)) / d;
        let uy = (bx * (cx * cx + cy * cy) - cx * (bx * bx + by * by)) / d;
        Self { x: ux + a.0, y: uy + a.1, r: ux.hypot(uy) }
    }
}

/// Minimal circle enclosing `points` (incremental Welzl).
fn enclosing_circle(points: &[(i64, i64)]) -> Circle {
    let pts: Vec<(f64, f64)> = points.iter().map(|&(x, y)| (x as f64, y as f64)).collect();
    let Some(&first) = pts.first() else {
        return Circle { x: 0.0, y: 0.0, r: 0.0 };
    };

    let mut c = Circle { x: first.0, y: first.1, r: 0.0 };
    for i in 1..pts.len() {
        if c.contains(pts[i]) {
            continue;
        }
        c = Circle { x: pts[i].0, y: pts[i].1, r: 0.0 };
        for j in 0..i {
            if c.contains(pts[j]) {
                continue;
            }
            c = Circle::from_two(pts[i], pts[j]);
            for k in 0..j {
                if !c.contains(pts[k]) {
                    c = Circle::from_three(pts[i], pts[j], pts[k]);
                }
            }
        }
    }
    c
}
