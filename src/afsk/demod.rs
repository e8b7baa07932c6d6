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

//! Non-coherent FSK demodulator.
//!
//! Incoming audio is doubled by linear interpolation between consecutive
//! samples; the demodulator consumes the doubled stream with stride 2 at
//! 1200 baud and stride 1 at 2400 baud. A quadrature correlator pair of
//! length `2 * Fs / baud` under a Hamming window decides mark vs space; a
//! 16 bit phase accumulator tracks symbol boundaries, nudged by an eighth
//! of the increment on every detected transition. Decided symbols are NRZI
//! decoded and handed to the HDLC layer.

use super::{
    ax25::{self, AfskFrame},
    hdlc::HdlcDeframer,
};
use crate::audio::SAMPLE_RATE;
use std::f32::consts::PI;
use tracing::info;

pub const BAUD_1200: u32 = 1200;
pub const BAUD_2400: u32 = 2400;

#[derive(Debug)]
pub struct AfskDemodulator {
    subsamp: usize,
    corrlen: usize,
    sphaseinc: u32,

    corr_mark_i: Vec<f32>,
    corr_mark_q: Vec<f32>,
    corr_space_i: Vec<f32>,
    corr_space_q: Vec<f32>,

    fbuf: Vec<f32>,
    start_offset: usize,

    dcd_shreg: u32,
    sphase: u32,
    lasts: u32,

    hdlc: HdlcDeframer,
}

impl AfskDemodulator {
    pub fn from_config(config: &crate::config::AfskConfig) -> Self {
        Self::new(config.baudrate)
    }

    pub fn new(baudrate: u32) -> Self {
        let (freq_mark, freq_space, subsamp) = if baudrate == BAUD_2400 {
            (3970.0, 2165.0, 1usize)
        } else {
            (1200.0, 2200.0, 2usize)
        };

        let corrlen = (2 * SAMPLE_RATE as u32 / baudrate) as usize;
        let sphaseinc =
            (0x10000u64 * baudrate as u64 * subsamp as u64 / (2 * SAMPLE_RATE as u64)) as u32;

        let mut corr_mark_i = Vec::with_capacity(corrlen);
        let mut corr_mark_q = Vec::with_capacity(corrlen);
        let mut corr_space_i = Vec::with_capacity(corrlen);
        let mut corr_space_q = Vec::with_capacity(corrlen);

        let mut f = 0.0f32;
        for _ in 0..corrlen {
            corr_mark_i.push(f.cos());
            corr_mark_q.push(f.sin());
            f += PI * freq_mark / SAMPLE_RATE as f32;
        }
        f = 0.0;
        for _ in 0..corrlen {
            corr_space_i.push(f.cos());
            corr_space_q.push(f.sin());
            f += PI * freq_space / SAMPLE_RATE as f32;
        }
        for i in 0..corrlen {
            let w = 0.54 - 0.46 * (PI * i as f32 / (corrlen - 1) as f32).cos();
            corr_mark_i[i] *= w;
            corr_mark_q[i] *= w;
            corr_space_i[i] *= w;
            corr_space_q[i] *= w;
        }

        info!("Starting {baudrate}Bd AFSK demodulator");

        Self {
            subsamp,
            corrlen,
            sphaseinc,
            corr_mark_i,
            corr_mark_q,
            corr_space_i,
            corr_space_q,
            fbuf: Vec::new(),
            start_offset: 0,
            dcd_shreg: 0,
            sphase: 0,
            lasts: 0,
            hdlc: HdlcDeframer::new(),
        }
    }

    /// Feed PCM samples, returning any APRS frames completed by them.
    pub fn write_samples(&mut self, samples: &[f32]) -> Vec<AfskFrame> {
        for &sample in samples {
            if let Some(&last) = self.fbuf.last() {
                self.fbuf.push((last + sample) / 2.0);
            }
            self.fbuf.push(sample);
        }

        let mut frames = Vec::new();
        if self.fbuf.len() > self.corrlen {
            let length = self.fbuf.len() - self.corrlen;
            self.demod(length, &mut frames);
            self.fbuf.drain(..length);
        }
        frames
    }

    fn demod(&mut self, length: usize, frames: &mut Vec<AfskFrame>) {
        let mut pos = self.start_offset;
        while pos < length {
            let buf = &self.fbuf[pos..pos + self.corrlen];
            let f = sq(mac(buf, &self.corr_mark_i)) + sq(mac(buf, &self.corr_mark_q))
                - sq(mac(buf, &self.corr_space_i))
                - sq(mac(buf, &self.corr_space_q));

            self.dcd_shreg <<= 1;
            self.dcd_shreg |= (f > 0.0) as u32;

            // Nudge the symbol phase towards the detected transition.
            if (self.dcd_shreg ^ (self.dcd_shreg >> 1)) & 1 != 0 {
                if self.sphase < 0x8000 - self.sphaseinc / 2 {
                    self.sphase += self.sphaseinc / 8;
                } else {
                    self.sphase -= self.sphaseinc / 8;
                }
            }

            self.sphase += self.sphaseinc;
            if self.sphase >= 0x10000 {
                self.sphase &= 0xFFFF;
                self.lasts <<= 1;
                self.lasts |= self.dcd_shreg & 1;
                let curbit = (self.lasts ^ (self.lasts >> 1) ^ 1) & 1;
                if let Some(raw) = self.hdlc.rx_bit(curbit != 0) {
                    if let Some(frame) = ax25::parse_frame(&raw) {
                        info!("APRS message received: {}", frame.aprs_record());
                        frames.push(frame);
                    }
                }
            }

            pos += self.subsamp;
        }
        self.start_offset = pos - length;
    }
}

fn mac(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn sq(f: f32) -> f32 {
    f * f
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::afsk::{ax25::testutil::build_frame, hdlc::frame_bits};

    /// NRZI modulate HDLC bits as Bell 202 audio: a `1` keeps the tone, a
    /// `0` switches between mark and space.
    fn modulate(bits: &[bool]) -> Vec<f32> {
        let fs = SAMPLE_RATE as f32;
        let samples_per_bit = fs / 1200.0;
        let mut out = Vec::new();
        let mut phase = 0.0f32;
        let mut tone = 1200.0f32;
        let mut carry = 0.0f32;
        for &bit in bits {
            if !bit {
                tone = if tone == 1200.0 { 2200.0 } else { 1200.0 };
            }
            carry += samples_per_bit;
            while carry >= 1.0 {
                phase += 2.0 * PI * tone / fs;
                out.push(phase.sin());
                carry -= 1.0;
            }
        }
        out
    }

    fn flag_train(n: usize) -> Vec<bool> {
        let flag = [false, true, true, true, true, true, true, false];
        let mut bits = Vec::new();
        for _ in 0..n {
            bits.extend_from_slice(&flag);
        }
        bits
    }

    #[test]
    fn demodulates_a_known_good_frame() {
        let frame = build_frame(
            ("SRC", 0),
            ("DST", 0),
            &[("WIDE1", 1), ("WIDE2", 2)],
            b"test payload",
        );

        let mut bits = flag_train(24);
        bits.extend(frame_bits(&frame));
        bits.extend(flag_train(8));

        let audio = modulate(&bits);

        let mut demod = AfskDemodulator::new(BAUD_1200);
        let mut frames = Vec::new();
        for chunk in audio.chunks(256) {
            frames.extend(demod.write_samples(chunk));
        }

        assert_eq!(1, frames.len());
        assert_eq!("SRC>DST,WIDE1-1,WIDE2-2,qAR", frames[0].aprs_record());
        assert_eq!("test payload", frames[0].payload);
    }

    #[test]
    fn noise_yields_no_frames() {
        let mut demod = AfskDemodulator::new(BAUD_1200);
        // Deterministic pseudo-noise.
        let noise: Vec<f32> = (0..16_000)
            .map(|i| ((i * 2654435761u64 as usize) as f32).sin() * 0.5)
            .collect();
        assert!(demod.write_samples(&noise).is_empty());
    }
}
