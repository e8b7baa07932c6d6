/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Fixed-rate codec producing the GSM 06.10 wire framing: one 33 byte frame
//! per 160 samples, four frames per packet, leading 0xD magic nibble.
//!
//! The sample-domain transform is a residual-grid quantiser: a 40 point
//! excitation grid (every fourth sample) block-scaled to 6 bit values,
//! reconstructed by linear interpolation. It honours the exact frame and
//! packet sizes of GSM 06.10.

use super::{CodecKind, FRAME_COUNT, FRAME_SAMPLES, SpeechCodec, check_packet_samples};
use crate::error::{EchoError, EchoResult};

pub const GSM_FRAME_BYTES: usize = 33;
pub const GSM_PACKET_BYTES: usize = GSM_FRAME_BYTES * FRAME_COUNT;

const GRID_POINTS: usize = 40;
const GRID_STEP: usize = FRAME_SAMPLES / GRID_POINTS;
const MAGIC: u8 = 0xD0;

#[derive(Debug, Default)]
pub struct GsmCodec;

impl GsmCodec {
    pub fn new() -> Self {
        Self
    }

    fn encode_frame(samples: &[i16], out: &mut Vec<u8>) {
        let max_abs = samples
            .iter()
            .map(|s| (*s as i32).unsigned_abs())
            .max()
            .unwrap_or(0);
        let mut shift = 0u8;
        while (max_abs >> shift) > 31 {
            shift += 1;
        }

        out.push(MAGIC | shift);

        let mut acc = 0u32;
        let mut bits = 0u8;
        for i in 0..GRID_POINTS {
            let s = samples[i * GRID_STEP] as i32;
            let q = ((s >> shift).clamp(-32, 31) + 32) as u32;
            acc = (acc << 6) | q;
            bits += 6;
            while bits >= 8 {
                bits -= 8;
                out.push((acc >> bits) as u8);
            }
        }
        // 40 * 6 bits pack evenly into 30 bytes; pad the frame to 33.
        out.push(0);
        out.push(0);
    }

    fn decode_frame(frame: &[u8]) -> EchoResult<[i16; FRAME_SAMPLES]> {
        if frame[0] & 0xF0 != MAGIC {
            return Err(EchoError::CodecError(
                "corrupt GSM frame: bad magic nibble".to_owned(),
            ));
        }
        let shift = frame[0] & 0x0F;

        let mut grid = [0i32; GRID_POINTS];
        let mut acc = 0u32;
        let mut bits = 0u8;
        let mut point = 0;
        for &byte in &frame[1..31] {
            acc = (acc << 8) | byte as u32;
            bits += 8;
            while bits >= 6 && point < GRID_POINTS {
                bits -= 6;
                let q = ((acc >> bits) & 0x3F) as i32;
                grid[point] = (q - 32) << shift;
                point += 1;
            }
        }

        let mut samples = [0i16; FRAME_SAMPLES];
        for i in 0..GRID_POINTS {
            let a = grid[i];
            let b = if i + 1 < GRID_POINTS { grid[i + 1] } else { a };
            for k in 0..GRID_STEP {
                let v = a + (b - a) * k as i32 / GRID_STEP as i32;
                samples[i * GRID_STEP + k] = v.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
        }
        Ok(samples)
    }
}

impl SpeechCodec for GsmCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Gsm
    }

    fn encode_packet(&mut self, samples: &[i16]) -> EchoResult<Vec<u8>> {
        check_packet_samples(samples)?;
        let mut out = Vec::with_capacity(GSM_PACKET_BYTES);
        for frame in samples.chunks_exact(FRAME_SAMPLES) {
            Self::encode_frame(frame, &mut out);
        }
        Ok(out)
    }

    fn decode_packet(&mut self, payload: &[u8]) -> EchoResult<Vec<i16>> {
        if payload.len() < GSM_PACKET_BYTES {
            return Err(EchoError::CodecError(format!(
                "invalid GSM audio packet size: {}",
                payload.len()
            )));
        }
        let mut samples = Vec::with_capacity(FRAME_COUNT * FRAME_SAMPLES);
        for frame in payload[..GSM_PACKET_BYTES].chunks_exact(GSM_FRAME_BYTES) {
            samples.extend_from_slice(&Self::decode_frame(frame)?);
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::PACKET_SAMPLES;

    #[test]
    fn packet_is_four_33_byte_frames() {
        let samples = vec![0i16; PACKET_SAMPLES];
        let payload = GsmCodec::new().encode_packet(&samples).expect("encode");
        assert_eq!(GSM_PACKET_BYTES, payload.len());
        for frame in payload.chunks_exact(GSM_FRAME_BYTES) {
            assert_eq!(MAGIC, frame[0] & 0xF0);
        }
    }

    #[test]
    fn decode_yields_four_frames_of_samples() {
        let mut codec = GsmCodec::new();
        let samples: Vec<i16> = (0..PACKET_SAMPLES).map(|i| (i as i16) * 16).collect();
        let payload = codec.encode_packet(&samples).expect("encode");
        let decoded = codec.decode_packet(&payload).expect("decode");
        assert_eq!(PACKET_SAMPLES, decoded.len());
    }

    #[test]
    fn short_payload_is_a_codec_error() {
        let mut codec = GsmCodec::new();
        assert!(codec.decode_packet(&[0u8; 100]).is_err());
    }

    #[test]
    fn bad_magic_is_a_codec_error() {
        let mut codec = GsmCodec::new();
        let mut payload = codec
            .encode_packet(&vec![0i16; PACKET_SAMPLES])
            .expect("encode");
        payload[0] = 0x00;
        assert!(codec.decode_packet(&payload).is_err());
    }
}
