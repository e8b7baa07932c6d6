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

use std::collections::VecDeque;

/// A bounded sample FIFO. When `overwrite` is set a full FIFO drops its
/// oldest samples to make room, so it always holds the most recent
/// `capacity` samples.
#[derive(Debug)]
pub struct AudioFifo {
    buf: VecDeque<f32>,
    capacity: usize,
    overwrite: bool,
}

impl AudioFifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            overwrite: false,
        }
    }

    pub fn set_overwrite(&mut self, overwrite: bool) {
        self.overwrite = overwrite;
    }

    /// Returns the number of samples accepted. With `overwrite` set this is
    /// always `samples.len()`.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let mut written = 0;
        for &sample in samples {
            if self.buf.len() >= self.capacity {
                if self.overwrite {
                    self.buf.pop_front();
                } else {
                    break;
                }
            }
            self.buf.push_back(sample);
            written += 1;
        }
        written
    }

    /// Remove and return all buffered samples in arrival order.
    pub fn drain(&mut self) -> Vec<f32> {
        self.buf.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overwrite_keeps_most_recent_samples() {
        let mut fifo = AudioFifo::new(4);
        fifo.set_overwrite(true);
        assert_eq!(6, fifo.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        assert_eq!(vec![3.0, 4.0, 5.0, 6.0], fifo.drain());
        assert!(fifo.is_empty());
    }

    #[test]
    fn without_overwrite_excess_samples_are_rejected() {
        let mut fifo = AudioFifo::new(3);
        assert_eq!(3, fifo.write(&[1.0, 2.0, 3.0, 4.0]));
        assert_eq!(vec![1.0, 2.0, 3.0], fifo.drain());
    }
}
