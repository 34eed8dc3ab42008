//! HSV colour model in the 8-bit convention (H 0–180, S and V 0–255).

/// Inclusive box in HSV space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsvRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl HsvRange {
    pub const fn new(lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|i| self.lower[i] <= hsv[i] && hsv[i] <= self.upper[i])
    }
}

/// Union of HSV ranges describing the target colour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorModel {
    ranges: Vec<HsvRange>,
    /// Smallest V any range accepts; darker pixels skip the conversion.
    min_value: u8,
}

impl ColorModel {
    pub fn new(ranges: Vec<HsvRange>) -> Self {
        let min_value = ranges.iter().map(|r| r.lower[2]).min().unwrap_or(u8::MAX);
        Self { ranges, min_value }
    }

    /// Red wraps around hue 0, so it needs two ranges.
    pub fn red() -> Self {
        Self::new(vec![
            HsvRange::new([0, 120, 70], [10, 255, 255]),
            HsvRange::new([170, 120, 70], [180, 255, 255]),
        ])
    }

    pub fn ranges(&self) -> &[HsvRange] {
        &self.ranges
    }

    pub fn matches_bgr(&self, bgr: [u8; 3]) -> bool {
        let max = bgr[0].max(bgr[1]).max(bgr[2]);
        if max < self.min_value {
            return false;
        }
        let hsv = bgr_to_hsv(bgr);
        self.ranges.iter().any(|r| r.contains(hsv))
    }
}

impl Default for ColorModel {
    fn default() -> Self {
        Self::red()
    }
}

/// BGR → HSV with hue halved to fit a byte.
pub fn bgr_to_hsv(bgr: [u8; 3]) -> [u8; 3] {
    let [b, g, r] = bgr.map(f32::from);
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = v - min;

    let s = if v > 0.0 { diff * 255.0 / v } else { 0.0 };
    let mut h = if diff == 0.0 {
        0.0
    } else if v == r {
        60.0 * (g - b) / diff
    } else if v == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }

    [(h / 2.0).round().min(180.0) as u8, s.round() as u8, v as u8]
}
