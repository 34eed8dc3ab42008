use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{CoordinateParseError, FrameError};

// MARK: - Resolution

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const VGA: Self = Self { width: 640, height: 480 };
    pub const QVGA: Self = Self { width: 320, height: 240 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - PixelFormat

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Bgr24,
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        3
    }
}

// MARK: - TimeBase

/// Rational unit of a frame's presentation timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    /// 90 kHz RTP video clock.
    pub const VIDEO_CLOCK: Self = Self { num: 1, den: 90_000 };

    pub fn seconds(&self, pts: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        pts as f64 * self.num as f64 / self.den as f64
    }
}

// MARK: - Frame

/// A raster image with its presentation timestamp.
///
/// The pixel buffer is immutable `Bytes`; a clone handed to another pipeline
/// stage can never observe a mutation made by the first one.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pts: i64,
    pub time_base: TimeBase,
}

impl Frame {
    pub fn new(
        data: Bytes,
        width: u32,
        height: u32,
        format: PixelFormat,
        pts: i64,
        time_base: TimeBase,
    ) -> Result<Self, FrameError> {
        let expected = Self::buffer_len(width, height, format).ok_or(FrameError::TooLarge { width, height })?;
        if data.len() != expected {
            return Err(FrameError::SizeMismatch { expected, actual: data.len() });
        }
        Ok(Self { data, width, height, format, pts, time_base })
    }

    /// All-black frame.
    pub fn blank(resolution: Resolution, format: PixelFormat) -> Result<Self, FrameError> {
        let Resolution { width, height } = resolution;
        let len = Self::buffer_len(width, height, format).ok_or(FrameError::TooLarge { width, height })?;
        Ok(Self {
            data: Bytes::from(vec![0u8; len]),
            width,
            height,
            format,
            pts: 0,
            time_base: TimeBase::VIDEO_CLOCK,
        })
    }

    /// Bytes a `width`×`height` buffer needs, or `None` if that does not fit
    /// in `usize`.
    pub fn buffer_len(width: u32, height: u32, format: PixelFormat) -> Option<usize> {
        usize::try_from(width)
            .ok()?
            .checked_mul(usize::try_from(height).ok()?)?
            .checked_mul(format.bytes_per_pixel())
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Pixel at `(x, y)` as `[b, g, r]`, whatever the stored order.
    pub fn bgr(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        let p = &self.data[i..i + 3];
        Some(match self.format {
            PixelFormat::Bgr24 => [p[0], p[1], p[2]],
            PixelFormat::Rgb24 => [p[2], p[1], p[0]],
        })
    }

    pub fn timestamp_secs(&self) -> f64 {
        self.time_base.seconds(self.pts)
    }

    /// Pixel data in RGB order, copying only when the frame is BGR.
    pub fn to_rgb24(&self) -> Bytes {
        match self.format {
            PixelFormat::Rgb24 => self.data.clone(),
            PixelFormat::Bgr24 => {
                let mut rgb = self.data.to_vec();
                for px in rgb.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                Bytes::from(rgb)
            }
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("pts", &self.pts)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// MARK: - Coordinate

/// Object position in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: i32,
    pub y: i32,
}

impl Coordinate {
    pub const ORIGIN: Self = Self { x: 0, y: 0 };

    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Signed per-axis difference `self - other`.
    ///
    /// Fails when either axis leaves the `i32` range, which only happens for
    /// values no frame could contain.
    pub fn offset_from(&self, other: Coordinate) -> Result<Coordinate, CoordinateParseError> {
        let out_of_range = || CoordinateParseError { message: other.to_string(), reason: "out of range" };
        let x = self.x.checked_sub(other.x).ok_or_else(out_of_range)?;
        let y = self.y.checked_sub(other.y).ok_or_else(out_of_range)?;
        Ok(Coordinate::new(x, y))
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

impl FromStr for Coordinate {
    type Err = CoordinateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| CoordinateParseError { message: s.to_owned(), reason };
        let (x, y) = s.trim().split_once(',').ok_or_else(|| err("missing ','"))?;
        let x = x.trim().parse::<i32>().map_err(|_| err("x is not an integer"))?;
        let y = y.trim().parse::<i32>().map_err(|_| err("y is not an integer"))?;
        Ok(Self { x, y })
    }
}

// MARK: - Session descriptors

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
        }
    }
}

/// One half of the offer/answer exchange. The `sdp` body is only
/// interpreted by the transport that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// Incremental route descriptor trickled after the descriptors.
///
/// The default (empty `candidate`) marks end-of-candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectivityCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", alias = "sdp_mid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        alias = "sdp_mline_index",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        alias = "username_fragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}
