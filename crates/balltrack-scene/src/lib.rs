//! Scene generation for the producing peer.
//!
//! A [`SceneGenerator`] renders the frame for a given tick and remembers the
//! object position it drew, which the producer treats as ground truth when
//! the consumer reports its estimate back.

use balltrack_core::{Coordinate, Frame, FrameError, PixelFormat, Resolution, SceneConfig, TimeBase};
use bytes::BytesMut;
use tracing::debug;

// MARK: - SceneGenerator trait

pub trait SceneGenerator: Send {
    /// Renders the scene at `tick` and records its ground truth.
    fn next_frame(&mut self, tick: u64) -> Frame;

    /// Position drawn by the most recent `next_frame`.
    fn current_ground_truth(&self) -> Coordinate;

    fn resolution(&self) -> Resolution;
}

// MARK: - BouncingBall

/// BGR red, the colour the consumer's detector is tuned for.
pub const BALL_COLOR_BGR: [u8; 3] = [0, 0, 255];

/// A filled circle bouncing elastically off the frame edges.
///
/// The position is a pure function of the tick, so frames can be rendered in
/// any order and a tick always maps to the same picture.
#[derive(Debug, Clone)]
pub struct BouncingBall {
    resolution: Resolution,
    frame_len: usize,
    radius: u32,
    start: Coordinate,
    velocity: Coordinate,
    fps: u32,
    color: [u8; 3],
    ground_truth: Coordinate,
}

impl BouncingBall {
    /// Fails when the configured resolution cannot be allocated.
    pub fn new(config: &SceneConfig) -> Result<Self, FrameError> {
        let resolution = config.resolution();
        let frame_len = Frame::buffer_len(resolution.width, resolution.height, PixelFormat::Bgr24)
            .ok_or(FrameError::TooLarge { width: resolution.width, height: resolution.height })?;
        let start = Coordinate::new(config.start_x, config.start_y);
        Ok(Self {
            resolution,
            frame_len,
            radius: config.radius,
            start,
            velocity: Coordinate::new(config.velocity_x, config.velocity_y),
            fps: config.fps.max(1),
            color: BALL_COLOR_BGR,
            ground_truth: start,
        })
    }

    pub fn with_color(mut self, bgr: [u8; 3]) -> Self {
        self.color = bgr;
        self
    }

    pub fn radius(&self) -> u32 {
        self.radius
    }

    /// Centre of the ball at `tick`.
    pub fn position_at(&self, tick: u64) -> Coordinate {
        let r = self.radius as i64;
        Coordinate::new(
            reflect(self.start.x as i64, self.velocity.x as i64, tick, r, self.resolution.width as i64 - r),
            reflect(self.start.y as i64, self.velocity.y as i64, tick, r, self.resolution.height as i64 - r),
        )
    }

    /// Presentation timestamp of `tick` on the 90 kHz clock.
    pub fn pts_for(&self, tick: u64) -> i64 {
        (tick as i64) * TimeBase::VIDEO_CLOCK.den as i64 / self.fps as i64
    }

    fn render(&self, center: Coordinate) -> BytesMut {
        let (w, h) = (self.resolution.width as i64, self.resolution.height as i64);
        let mut buf = BytesMut::zeroed(self.frame_len);
        let r = self.radius as i64;
        let (cx, cy) = (center.x as i64, center.y as i64);

        for y in (cy - r).max(0)..=(cy + r).min(h - 1) {
            for x in (cx - r).max(0)..=(cx + r).min(w - 1) {
                let (dx, dy) = (x - cx, y - cy);
                if dx * dx + dy * dy <= r * r {
                    let i = ((y * w + x) * 3) as usize;
                    buf[i..i + 3].copy_from_slice(&self.color);
                }
            }
        }
        buf
    }
}

impl SceneGenerator for BouncingBall {
    fn next_frame(&mut self, tick: u64) -> Frame {
        let center = self.position_at(tick);
        self.ground_truth = center;
        if tick % 300 == 0 {
            debug!("Scene tick {} ball at {}", tick, center);
        }
        Frame {
            data: self.render(center).freeze(),
            width: self.resolution.width,
            height: self.resolution.height,
            format: PixelFormat::Bgr24,
            pts: self.pts_for(tick),
            time_base: TimeBase::VIDEO_CLOCK,
        }
    }

    fn current_ground_truth(&self) -> Coordinate {
        self.ground_truth
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

/// Position after `tick` steps of `velocity` from `start`, reflecting off `lo`
/// and `hi`.
fn reflect(start: i64, velocity: i64, tick: u64, lo: i64, hi: i64) -> i32 {
    let span = hi - lo;
    if span <= 0 {
        return lo as i32;
    }
    let period = 2 * span;
    let unfolded = (start - lo + velocity * tick as i64).rem_euclid(period);
    let offset = if unfolded <= span { unfolded } else { period - unfolded };
    (lo + offset) as i32
}
