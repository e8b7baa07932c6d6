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

//! Variable-rate codec producing the Speex narrowband wire framing: four
//! 20 ms frames per packet, a payload whose size depends on the signal, and
//! an explicit stream terminator.
//!
//! Each frame is a scale byte followed by a token stream over the same 40
//! point excitation grid the GSM codec uses: literal 6 bit values and
//! zero-run tokens. Quiet audio therefore packs considerably smaller than a
//! GSM packet while loud audio packs slightly larger per frame.

use super::{CodecKind, FRAME_COUNT, FRAME_SAMPLES, SpeechCodec, check_packet_samples};
use crate::error::{EchoError, EchoResult};

const GRID_POINTS: usize = 40;
const GRID_STEP: usize = FRAME_SAMPLES / GRID_POINTS;

/// Marks the end of the token stream of a packet.
const TERMINATOR: u8 = 0xFF;
/// High bit flags a zero-run token; the low bits carry the run length.
const RUN_FLAG: u8 = 0x80;
const MAX_RUN: usize = 0x7E;
const ZERO: u32 = 32;

#[derive(Debug, Default)]
pub struct SpeexCodec;

impl SpeexCodec {
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
        out.push(shift);

        let mut run = 0usize;
        for i in 0..GRID_POINTS {
            let s = samples[i * GRID_STEP] as i32;
            let q = ((s >> shift).clamp(-32, 31) + 32) as u32;
            if q == ZERO {
                run += 1;
                if run == MAX_RUN {
                    out.push(RUN_FLAG | run as u8);
                    run = 0;
                }
            } else {
                if run > 0 {
                    Self::flush_run(out, run);
                    run = 0;
                }
                out.push(q as u8);
            }
        }
        if run > 0 {
            Self::flush_run(out, run);
        }
    }

    fn flush_run(out: &mut Vec<u8>, run: usize) {
        if run == 1 {
            out.push(ZERO as u8);
        } else {
            out.push(RUN_FLAG | run as u8);
        }
    }

    fn decode_frame(payload: &[u8], pos: &mut usize) -> EchoResult<[i16; FRAME_SAMPLES]> {
        let corrupt = || EchoError::CodecError("corrupt Speex stream".to_owned());
        let short = || EchoError::CodecError("short frame count in Speex packet".to_owned());

        let shift = *payload.get(*pos).ok_or_else(short)?;
        if shift == TERMINATOR || shift > 15 {
            return Err(corrupt());
        }
        *pos += 1;

        let mut grid = [0i32; GRID_POINTS];
        let mut point = 0;
        while point < GRID_POINTS {
            let token = *payload.get(*pos).ok_or_else(short)?;
            *pos += 1;
            if token == TERMINATOR {
                return Err(short());
            } else if token & RUN_FLAG != 0 {
                let run = (token & 0x7F) as usize;
                if run == 0 || point + run > GRID_POINTS {
                    return Err(corrupt());
                }
                point += run;
            } else if token <= 0x3F {
                grid[point] = ((token as i32) - 32) << shift;
                point += 1;
            } else {
                return Err(corrupt());
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

impl SpeechCodec for SpeexCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Speex
    }

    fn encode_packet(&mut self, samples: &[i16]) -> EchoResult<Vec<u8>> {
        check_packet_samples(samples)?;
        let mut out = Vec::with_capacity(64);
        for frame in samples.chunks_exact(FRAME_SAMPLES) {
            Self::encode_frame(frame, &mut out);
        }
        out.push(TERMINATOR);
        Ok(out)
    }

    fn decode_packet(&mut self, payload: &[u8]) -> EchoResult<Vec<i16>> {
        let mut samples = Vec::with_capacity(FRAME_COUNT * FRAME_SAMPLES);
        let mut pos = 0;
        for _ in 0..FRAME_COUNT {
            samples.extend_from_slice(&Self::decode_frame(payload, &mut pos)?);
        }
        match payload.get(pos) {
            Some(&TERMINATOR) => Ok(samples),
            _ => Err(EchoError::CodecError(
                "missing Speex stream terminator".to_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::PACKET_SAMPLES;
    use crate::codec::gsm::GSM_PACKET_BYTES;

    #[test]
    fn payload_size_varies_with_signal() {
        let mut codec = SpeexCodec::new();
        let silence = vec![0i16; PACKET_SAMPLES];
        let loud: Vec<i16> = (0..PACKET_SAMPLES)
            .map(|i| if i % 2 == 0 { 20_000 } else { -20_000 })
            .collect();
        let small = codec.encode_packet(&silence).expect("encode silence");
        let big = codec.encode_packet(&loud).expect("encode loud");
        assert!(small.len() < big.len());
        assert!(small.len() < GSM_PACKET_BYTES);
    }

    #[test]
    fn decode_yields_exactly_four_frames() {
        let mut codec = SpeexCodec::new();
        let samples: Vec<i16> = (0..PACKET_SAMPLES).map(|i| (i as i16) * 8).collect();
        let payload = codec.encode_packet(&samples).expect("encode");
        let decoded = codec.decode_packet(&payload).expect("decode");
        assert_eq!(PACKET_SAMPLES, decoded.len());
    }

    #[test]
    fn truncated_stream_is_a_codec_error() {
        let mut codec = SpeexCodec::new();
        let payload = codec
            .encode_packet(&vec![1000i16; PACKET_SAMPLES])
            .expect("encode");
        assert!(codec.decode_packet(&payload[..payload.len() / 2]).is_err());
    }

    #[test]
    fn garbage_token_is_a_codec_error() {
        let mut codec = SpeexCodec::new();
        let mut payload = codec
            .encode_packet(&vec![1000i16; PACKET_SAMPLES])
            .expect("encode");
        payload[1] = 0x7E; // neither literal nor run token
        assert!(codec.decode_packet(&payload).is_err());
    }
}
