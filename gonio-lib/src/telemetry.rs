//! Inbound telemetry: fixed 8-byte frames carrying the current `(x, y)` position.
//!
//! The stream has no delimiters, opcodes or checksums. Frames are recovered
//! purely by counting bytes, so a single lost or injected byte shifts every
//! following frame. In [`DecodeMode::Permissive`] such garbage is delivered
//! as-is, which is what deployed devices expect. [`DecodeMode::Strict`]
//! flags frames whose coordinates exceed a plausibility ceiling.

use crate::error::GonioError;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const TELEMETRY_FRAME_LEN: usize = 8;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TelemetryFrameRaw {
    pub x: U32,
    pub y: U32,
}

/// One decoded position sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub x: u32,
    pub y: u32,
}

impl From<TelemetryFrameRaw> for TelemetrySample {
    fn from(raw: TelemetryFrameRaw) -> Self {
        Self {
            x: raw.x.get(),
            y: raw.y.get(),
        }
    }
}

impl From<TelemetrySample> for TelemetryFrameRaw {
    fn from(sample: TelemetrySample) -> Self {
        Self {
            x: U32::new(sample.x),
            y: U32::new(sample.y),
        }
    }
}

impl TelemetrySample {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Decode a single frame. Any eight bytes form a valid frame.
    pub fn from_frame(frame: &[u8; TELEMETRY_FRAME_LEN]) -> Self {
        let raw: TelemetryFrameRaw = zerocopy::transmute!(*frame);
        Self::from(raw)
    }

    /// Encode as the device sends it.
    pub fn to_bytes(&self) -> [u8; TELEMETRY_FRAME_LEN] {
        let mut out = [0u8; TELEMETRY_FRAME_LEN];
        out.copy_from_slice(TelemetryFrameRaw::from(*self).as_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DecodeMode {
    /// Every frame is accepted. Wire-compatible with existing devices.
    #[default]
    Permissive,
    /// Frames with a coordinate above `max_coordinate` are reported as anomalies.
    Strict { max_coordinate: u32 },
}

/// Reassembles telemetry frames from arbitrarily chunked socket reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    mode: DecodeMode,
    frames_decoded: u64,
}

impl FrameDecoder {
    pub fn new(mode: DecodeMode) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            mode,
            frames_decoded: 0,
        }
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Frames consumed since construction or the last [`reset`](Self::reset),
    /// including anomalous ones.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Drop any partial frame. Call on every new connection.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.frames_decoded = 0;
    }

    /// Append raw bytes without decoding.
    pub fn extend(&mut self, chunk: &[u8]) {
        trace!(len = chunk.len(), data = %hex::encode(chunk), "telemetry bytes");
        self.buffer.extend_from_slice(chunk);
    }

    /// Consume the oldest complete frame, if any.
    ///
    /// The frame's bytes are consumed even when strict mode rejects it.
    pub fn next_sample(&mut self) -> Result<Option<TelemetrySample>, GonioError> {
        if self.buffer.len() < TELEMETRY_FRAME_LEN {
            return Ok(None);
        }
        let frame = self.buffer.split_to(TELEMETRY_FRAME_LEN);
        let index = self.frames_decoded;
        self.frames_decoded += 1;

        let raw = TelemetryFrameRaw::read_from_bytes(frame.as_ref()).map_err(|_| {
            GonioError::FrameDecodeAnomaly {
                frame: index,
                message: format!("expected {TELEMETRY_FRAME_LEN} bytes, got {}", frame.len()),
            }
        })?;
        let sample = TelemetrySample::from(raw);

        if let DecodeMode::Strict { max_coordinate } = self.mode {
            if sample.x > max_coordinate || sample.y > max_coordinate {
                warn!(frame = index, bytes = %hex::encode(&frame), "implausible telemetry frame");
                return Err(GonioError::FrameDecodeAnomaly {
                    frame: index,
                    message: format!(
                        "coordinates ({}, {}) exceed {max_coordinate}, stream is probably misaligned",
                        sample.x, sample.y
                    ),
                });
            }
        }
        Ok(Some(sample))
    }

    /// Append `chunk` and decode every complete frame now buffered, oldest first.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<TelemetrySample>, GonioError> {
        self.extend(chunk);
        let mut samples = Vec::with_capacity(self.buffer.len() / TELEMETRY_FRAME_LEN);
        while let Some(sample) = self.next_sample()? {
            samples.push(sample);
        }
        Ok(samples)
    }

    /// Remaining partial frame, for diagnostics.
    pub fn pending(&self) -> &[u8] {
        &self.buffer[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(samples: &[(u32, u32)]) -> Vec<u8> {
        samples
            .iter()
            .flat_map(|&(x, y)| TelemetrySample::new(x, y).to_bytes())
            .collect()
    }

    #[test]
    fn single_frame_little_endian() {
        let sample = TelemetrySample::from_frame(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(sample, TelemetrySample::new(1, 256));
    }

    #[test]
    fn partial_frame_is_buffered() {
        let mut decoder = FrameDecoder::default();
        let bytes = frames(&[(7, 9)]);
        assert!(decoder.feed(&bytes[..3]).unwrap().is_empty());
        assert_eq!(decoder.buffered_len(), 3);
        assert_eq!(decoder.feed(&bytes[3..]).unwrap(), vec![TelemetrySample::new(7, 9)]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn seventeen_bytes_give_two_samples() {
        let mut decoder = FrameDecoder::default();
        let mut bytes = frames(&[(1, 2), (3, 4)]);
        bytes.push(0xAB);
        let samples = decoder.feed(&bytes).unwrap();
        assert_eq!(samples, vec![TelemetrySample::new(1, 2), TelemetrySample::new(3, 4)]);
        assert_eq!(decoder.buffered_len(), 1);
        assert_eq!(decoder.pending(), &[0xAB]);
        assert_eq!(decoder.frames_decoded(), 2);
    }

    #[test]
    fn reset_drops_partial_frame() {
        let mut decoder = FrameDecoder::default();
        decoder.feed(&[1, 2, 3, 4, 5]).unwrap();
        decoder.reset();
        assert_eq!(decoder.buffered_len(), 0);
        let samples = decoder.feed(&frames(&[(10, 20)])).unwrap();
        assert_eq!(samples, vec![TelemetrySample::new(10, 20)]);
    }

    #[test]
    fn permissive_accepts_anything() {
        let mut decoder = FrameDecoder::new(DecodeMode::Permissive);
        let samples = decoder.feed(&[0xFF; 16]).unwrap();
        assert_eq!(samples, vec![TelemetrySample::new(u32::MAX, u32::MAX); 2]);
    }

    #[test]
    fn strict_flags_and_consumes_implausible_frame() {
        let mut decoder = FrameDecoder::new(DecodeMode::Strict { max_coordinate: 1000 });
        let mut bytes = frames(&[(5, 5)]);
        bytes.extend_from_slice(&frames(&[(5, 5000), (6, 6)]));
        decoder.extend(&bytes);

        assert_eq!(decoder.next_sample().unwrap(), Some(TelemetrySample::new(5, 5)));
        assert!(matches!(
            decoder.next_sample(),
            Err(GonioError::FrameDecodeAnomaly { frame: 1, .. })
        ));
        assert_eq!(decoder.next_sample().unwrap(), Some(TelemetrySample::new(6, 6)));
        assert_eq!(decoder.next_sample().unwrap(), None);
    }

    #[test]
    fn decode_mode_json() {
        let strict: DecodeMode = serde_json::from_str(r#"{"mode":"strict","max_coordinate":360}"#).unwrap();
        assert_eq!(strict, DecodeMode::Strict { max_coordinate: 360 });
        let permissive: DecodeMode = serde_json::from_str(r#"{"mode":"permissive"}"#).unwrap();
        assert_eq!(permissive, DecodeMode::Permissive);
    }
}
