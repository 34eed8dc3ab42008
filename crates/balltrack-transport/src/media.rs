//! Video track payload: each frame is a PNG picture split across RTP packets
//! that share the frame's timestamp. The last packet of a frame carries the
//! marker bit.

use balltrack_core::{Frame, FrameError, PixelFormat, TimeBase};
use bytes::{Bytes, BytesMut};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder, ImageFormat};
use tracing::debug;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters};

pub(crate) const MIME_TYPE: &str = "video/x-balltrack-png";
pub(crate) const PAYLOAD_TYPE: u8 = 96;
/// Payload bytes per packet, leaving room for RTP and SRTP overhead.
pub(crate) const MAX_PAYLOAD: usize = 1_200;
/// Reassembly drops anything larger.
pub(crate) const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub(crate) fn capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE.to_owned(),
        clock_rate: TimeBase::VIDEO_CLOCK.den,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

pub(crate) fn codec_parameters() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters { capability: capability(), payload_type: PAYLOAD_TYPE, ..Default::default() }
}

// MARK: - Picture codec

pub(crate) fn encode_frame(frame: &Frame) -> Result<Bytes, FrameError> {
    let rgb = frame.to_rgb24();
    let mut png = Vec::with_capacity(rgb.len() / 16);
    PngEncoder::new_with_quality(&mut png, CompressionType::Fast, FilterType::Sub)
        .write_image(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| FrameError::Codec { reason: e.to_string() })?;
    Ok(Bytes::from(png))
}

/// Decodes to an `Rgb24` frame stamped with `pts` on the video clock.
pub(crate) fn decode_frame(png: &[u8], pts: i64) -> Result<Frame, FrameError> {
    let image = image::load_from_memory_with_format(png, ImageFormat::Png)
        .map_err(|e| FrameError::Codec { reason: e.to_string() })?
        .into_rgb8();
    let (width, height) = image.dimensions();
    Frame::new(Bytes::from(image.into_raw()), width, height, PixelFormat::Rgb24, pts, TimeBase::VIDEO_CLOCK)
}

// MARK: - Packetization

/// Splits encoded frames into consecutively numbered packets. SSRC and
/// payload type are filled in by the track when it writes them.
#[derive(Debug, Default)]
pub(crate) struct Packetizer {
    sequence: u16,
}

impl Packetizer {
    pub(crate) fn packetize(&mut self, payload: &Bytes, timestamp: u32) -> Vec<Packet> {
        let count = payload.len().div_ceil(MAX_PAYLOAD).max(1);
        (0..count)
            .map(|i| {
                let start = i * MAX_PAYLOAD;
                let end = (start + MAX_PAYLOAD).min(payload.len());
                let sequence_number = self.sequence;
                self.sequence = self.sequence.wrapping_add(1);
                Packet {
                    header: Header {
                        version: 2,
                        marker: i + 1 == count,
                        payload_type: PAYLOAD_TYPE,
                        sequence_number,
                        timestamp,
                        ..Default::default()
                    },
                    payload: payload.slice(start..end),
                }
            })
            .collect()
    }
}

/// Rebuilds frames from packets in arrival order. A gap in sequence numbers
/// spoils the frame in progress; the next timestamp starts a fresh one.
#[derive(Debug, Default)]
pub(crate) struct FrameAssembler {
    /// Frame in progress; `None` right after a marker.
    timestamp: Option<u32>,
    next_sequence: Option<u16>,
    buffer: BytesMut,
    spoiled: bool,
}

impl FrameAssembler {
    /// Returns `(timestamp, payload)` when `packet` completes a frame.
    pub(crate) fn push(&mut self, packet: &Packet) -> Option<(u32, Bytes)> {
        let header = &packet.header;
        let in_sequence = self.next_sequence.map_or(true, |next| next == header.sequence_number);
        if self.timestamp != Some(header.timestamp) {
            if let Some(previous) = self.timestamp {
                debug!("Incomplete frame at {} dropped", previous);
            }
            // Leading losses only show after a frame that ended cleanly.
            self.spoiled = self.timestamp.is_none() && !in_sequence;
            self.timestamp = Some(header.timestamp);
            self.buffer.clear();
        } else if !in_sequence {
            self.spoiled = true;
        }
        self.next_sequence = Some(header.sequence_number.wrapping_add(1));

        if !self.spoiled {
            if self.buffer.len() + packet.payload.len() > MAX_FRAME_BYTES {
                debug!("Frame at {} exceeds {} bytes", header.timestamp, MAX_FRAME_BYTES);
                self.spoiled = true;
                self.buffer.clear();
            } else {
                self.buffer.extend_from_slice(&packet.payload);
            }
        }
        if !header.marker {
            return None;
        }

        self.timestamp = None;
        let payload = self.buffer.split().freeze();
        if std::mem::take(&mut self.spoiled) {
            debug!("Frame at {} lost packets", header.timestamp);
            return None;
        }
        Some((header.timestamp, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balltrack_core::Resolution;

    fn striped(width: u32, height: u32) -> Frame {
        let data: Vec<u8> = (0..width * height * 3).map(|i| (i % 251) as u8).collect();
        Frame::new(Bytes::from(data), width, height, PixelFormat::Bgr24, 6_000, TimeBase::VIDEO_CLOCK).unwrap()
    }

    #[test]
    fn png_keeps_every_pixel() {
        let frame = striped(37, 11);
        let decoded = decode_frame(&encode_frame(&frame).unwrap(), frame.pts).unwrap();
        assert_eq!(decoded.format, PixelFormat::Rgb24);
        assert_eq!(decoded.resolution(), Resolution::new(37, 11));
        assert_eq!(decoded.pts, 6_000);
        for (x, y) in [(0, 0), (36, 10), (12, 5)] {
            assert_eq!(decoded.bgr(x, y), frame.bgr(x, y));
        }
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(decode_frame(b"not a png", 0), Err(FrameError::Codec { .. })));
    }

    #[test]
    fn large_frames_span_packets_with_one_marker() {
        let payload = Bytes::from(vec![7u8; MAX_PAYLOAD * 2 + 5]);
        let mut packetizer = Packetizer { sequence: u16::MAX };
        let packets = packetizer.packetize(&payload, 3_000);

        assert_eq!(packets.len(), 3);
        assert_eq!(packets.iter().map(|p| p.header.sequence_number).collect::<Vec<_>>(), vec![u16::MAX, 0, 1]);
        assert_eq!(packets.iter().filter(|p| p.header.marker).count(), 1);
        assert!(packets[2].header.marker);
        assert_eq!(packets[2].payload.len(), 5);

        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(&packets[0]).is_none());
        assert!(assembler.push(&packets[1]).is_none());
        assert_eq!(assembler.push(&packets[2]), Some((3_000, payload)));
    }

    #[test]
    fn a_gap_spoils_only_its_own_frame() {
        let mut packetizer = Packetizer::default();
        let mut assembler = FrameAssembler::default();
        let ok = |bytes: &'static [u8]| Bytes::from_static(bytes);

        let first = packetizer.packetize(&ok(b"one"), 3_000);
        assert_eq!(assembler.push(&first[0]), Some((3_000, ok(b"one"))));

        // Leading packet lost.
        let second = packetizer.packetize(&Bytes::from(vec![1u8; MAX_PAYLOAD + 1]), 6_000);
        assert!(assembler.push(&second[1]).is_none());
        let third = packetizer.packetize(&ok(b"three"), 9_000);
        assert_eq!(assembler.push(&third[0]), Some((9_000, ok(b"three"))));

        // Middle packet lost.
        let fourth = packetizer.packetize(&Bytes::from(vec![2u8; MAX_PAYLOAD * 3]), 12_000);
        assert!(assembler.push(&fourth[0]).is_none());
        assert!(assembler.push(&fourth[2]).is_none());
        let fifth = packetizer.packetize(&ok(b"five"), 15_000);
        assert_eq!(assembler.push(&fifth[0]), Some((15_000, ok(b"five"))));
    }

    #[test]
    fn a_lost_marker_drops_the_frame_but_not_the_next() {
        let mut packetizer = Packetizer::default();
        let mut assembler = FrameAssembler::default();
        let cut = packetizer.packetize(&Bytes::from(vec![3u8; MAX_PAYLOAD + 1]), 3_000);
        assert!(assembler.push(&cut[0]).is_none());
        let next = packetizer.packetize(&Bytes::from_static(b"whole"), 6_000);
        assert_eq!(assembler.push(&next[0]), Some((6_000, Bytes::from_static(b"whole"))));
    }
}
