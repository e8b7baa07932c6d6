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

//! Per-receiver plumbing inside the voter: an audio FIFO (overwrite on
//! full) ahead of a valve, plus buffers for DTMF digits and selcall
//! sequences that arrive while the receiver is not the chosen one. On
//! promotion the FIFO drains and the buffered events replay in arrival
//! order, exactly once.

use crate::audio::{AudioFifo, AudioValve, ms_to_samples, valve::Passed};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct SatRx {
    pub id: u8,
    pub name: String,
    fifo: Option<AudioFifo>,
    valve: AudioValve,
    dtmf_buf: VecDeque<(char, u16)>,
    selcall_buf: VecDeque<String>,
    sql_open: bool,
    siglev: f32,
    muted: bool,
}

/// Replayed state handed out when a receiver becomes the chosen one.
#[derive(Debug, Default)]
pub struct Promoted {
    pub audio: Vec<f32>,
    pub dtmf: Vec<(char, u16)>,
    pub selcall: Vec<String>,
}

impl SatRx {
    pub fn new(id: u8, name: &str, buffer_length_ms: u64) -> Self {
        let mut valve = AudioValve::new();
        let fifo = if buffer_length_ms > 0 {
            let mut fifo = AudioFifo::new(ms_to_samples(buffer_length_ms));
            fifo.set_overwrite(true);
            valve.set_block_when_closed(true);
            Some(fifo)
        } else {
            valve.set_block_when_closed(false);
            None
        };
        valve.set_open(false);

        Self {
            id,
            name: name.to_owned(),
            fifo,
            valve,
            dtmf_buf: VecDeque::new(),
            selcall_buf: VecDeque::new(),
            sql_open: false,
            siglev: 0.0,
            muted: false,
        }
    }

    pub fn squelch_is_open(&self) -> bool {
        self.sql_open
    }

    pub fn signal_strength(&self) -> f32 {
        self.siglev
    }

    pub fn is_output_open(&self) -> bool {
        self.valve.is_open()
    }

    /// Track a squelch report. Returns `Some(open)` on an edge.
    pub fn set_squelch(&mut self, open: bool, siglev: f32) -> Option<bool> {
        self.siglev = siglev;
        if self.muted {
            return None;
        }
        if open != self.sql_open {
            self.sql_open = open;
            Some(open)
        } else {
            None
        }
    }

    /// Route audio through FIFO and valve. Returns samples to forward when
    /// this receiver is the chosen one.
    pub fn audio(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        if self.muted {
            return None;
        }
        match self.valve.pass(samples.len()) {
            Passed::Through(_) => {
                let mut out = match &mut self.fifo {
                    Some(fifo) if !fifo.is_empty() => fifo.drain(),
                    _ => Vec::new(),
                };
                out.extend_from_slice(samples);
                Some(out)
            }
            // A blocking valve keeps the samples in the FIFO upstream.
            Passed::Blocked => {
                if let Some(fifo) = &mut self.fifo {
                    fifo.write(samples);
                }
                None
            }
            Passed::Discarded(_) => None,
        }
    }

    /// Returns the digit for immediate forwarding, or buffers it while the
    /// valve is closed.
    pub fn dtmf(&mut self, digit: char, duration_ms: u16) -> Option<(char, u16)> {
        if self.muted {
            return None;
        }
        if self.valve.is_open() {
            Some((digit, duration_ms))
        } else {
            self.dtmf_buf.push_back((digit, duration_ms));
            None
        }
    }

    pub fn selcall(&mut self, sequence: String) -> Option<String> {
        if self.muted {
            return None;
        }
        if self.valve.is_open() {
            Some(sequence)
        } else {
            self.selcall_buf.push_back(sequence);
            None
        }
    }

    /// Open the valve: buffered audio and events drain exactly once.
    pub fn promote(&mut self) -> Promoted {
        self.valve.set_open(true);
        Promoted {
            audio: match &mut self.fifo {
                Some(fifo) => fifo.drain(),
                None => Vec::new(),
            },
            dtmf: self.dtmf_buf.drain(..).collect(),
            selcall: self.selcall_buf.drain(..).collect(),
        }
    }

    /// Close the valve; audio and events buffer again.
    pub fn demote(&mut self) {
        self.valve.set_open(false);
    }

    pub fn mute(&mut self, mute: bool) {
        self.muted = mute;
        if mute {
            if let Some(fifo) = &mut self.fifo {
                fifo.clear();
            }
            self.sql_open = false;
            self.dtmf_buf.clear();
            self.selcall_buf.clear();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn audio_buffers_while_demoted_and_drains_on_promotion() {
        let mut sat = SatRx::new(1, "rx1", 100);
        assert!(sat.audio(&[0.1, 0.2]).is_none());
        let promoted = sat.promote();
        assert_eq!(vec![0.1, 0.2], promoted.audio);
        // Live audio now passes straight through.
        assert_eq!(Some(vec![0.3]), sat.audio(&[0.3]));
    }

    #[test]
    fn dtmf_replays_in_order_exactly_once() {
        let mut sat = SatRx::new(1, "rx1", 100);
        assert!(sat.dtmf('1', 80).is_none());
        assert!(sat.dtmf('2', 80).is_none());
        let promoted = sat.promote();
        assert_eq!(vec![('1', 80), ('2', 80)], promoted.dtmf);
        // A second promotion replays nothing.
        sat.demote();
        assert!(sat.promote().dtmf.is_empty());
    }

    #[test]
    fn mute_clears_buffers_and_squelch() {
        let mut sat = SatRx::new(1, "rx1", 100);
        sat.set_squelch(true, 1.0);
        sat.dtmf('5', 80);
        sat.audio(&[0.5]);
        sat.mute(true);
        assert!(!sat.squelch_is_open());
        let promoted = sat.promote();
        assert!(promoted.audio.is_empty());
        assert!(promoted.dtmf.is_empty());
    }

    #[test]
    fn fifo_overwrites_keeping_the_freshest_audio() {
        let mut sat = SatRx::new(1, "rx1", 1); // 16 samples at 16 kHz
        let long: Vec<f32> = (0..32).map(|i| i as f32).collect();
        sat.audio(&long);
        let promoted = sat.promote();
        assert_eq!(16, promoted.audio.len());
        assert_eq!(16.0, promoted.audio[0]);
    }
}
